//! reqscope 教程示例
//!
//! ```bash
//! cargo run -p tutorial-demo
//! curl "http://127.0.0.1:8000/items/?q=p&limit=1"
//! curl -H "X-Token: fake-super-secret-token" -H "X-Key: fake-super-secret-key" \
//!      http://127.0.0.1:8000/admin/users/
//! ```

mod providers;
mod routes;

use std::path::Path;

use reqscope_web::prelude::*;

use crate::routes::{build_app, DemoProperties};

const CONFIG_FILE: &str = "application.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(CONFIG_FILE);
    let env = Environment::load(config_path.exists().then_some(config_path.as_path()))?;

    LoggingConfig::from_env().merge_environment(&env).init()?;

    let resolver = ResolverProperties::from_environment(&env)?;
    let server = ServerProperties::from_environment(&env)?;
    let props = DemoProperties::from_environment(&env);

    tracing::info!(
        mode = ?resolver.mode,
        log_file = %props.log_file.display(),
        "Starting tutorial demo"
    );

    let (app, _db) = build_app(&props, &resolver)?;
    for operation in app.operations() {
        tracing::debug!("Registered operation: {}", operation);
    }

    WebServer::new(app, server).run().await
}
