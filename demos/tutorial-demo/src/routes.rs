//! 路由

use std::path::PathBuf;
use std::sync::Arc;

use reqscope_web::prelude::*;
use serde_json::Value as JsonValue;

use crate::providers::{
    append_log, CommonQueryParams, DbSession, DemoProviders, FakeDb, OwnerError,
};

#[derive(Debug, thiserror::Error)]
#[error("Dangerous item: {0}")]
pub struct DangerousItemError(pub String);

/// 示例应用配置
#[derive(Debug, Clone)]
pub struct DemoProperties {
    pub log_file: PathBuf,
    pub token: String,
    pub key: String,
}

impl Default for DemoProperties {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("log.txt"),
            token: "fake-super-secret-token".to_string(),
            key: "fake-super-secret-key".to_string(),
        }
    }
}

impl DemoProperties {
    pub fn from_environment(env: &Environment) -> Self {
        let defaults = Self::default();
        Self {
            log_file: env
                .get_string("app.log-file")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_file),
            token: env.get_string("app.x-token").unwrap_or(defaults.token),
            key: env.get_string("app.x-key").unwrap_or(defaults.key),
        }
    }
}

fn seed_store() -> MemoryStore {
    MemoryStore::new()
        .with_entry(
            "plumbus",
            json!({ "description": "Freshly pickled plumbus", "owner": "Morty" }),
        )
        .with_entry(
            "portal-gun",
            json!({ "description": "Gun to create portals", "owner": "Rick" }),
        )
}

/// 组装示例应用
pub fn build_app(
    props: &DemoProperties,
    resolver: &ResolverProperties,
) -> Result<(CompiledApplication, Arc<FakeDb>)> {
    let DemoProviders { db, definitions } = DemoProviders::new(
        props.token.clone(),
        props.key.clone(),
        props.log_file.clone(),
    );

    let mut app = Application::new()
        .resolver_properties(resolver)
        .storage(Arc::new(seed_store()))
        .exception_handler(DomainErrorHandler::<DangerousItemError>::new(418));
    for definition in definitions {
        app = app.provide(definition);
    }

    let log_file = props.log_file.clone();
    let app = app
        .route(
            Operation::get("/items/", list_items)
                .dependency(Dependency::bound("commons", "common_parameters"))
                .dependency(Dependency::bound("db", "get_db")),
        )
        .route(
            Operation::get("/items/{item_id}", read_item)
                .dependency(Dependency::bound("username", "get_username")),
        )
        .route(
            Operation::get("/danger/{name}", dangerous_item)
                .dependency(Dependency::bound("db", "get_db")),
        )
        .route(
            Operation::get("/search", |ctx| async move {
                let query = ctx.get::<Option<String>>("query_or_default")?;
                Ok::<_, anyhow::Error>(json!({ "q_or_cookie": query.as_ref() }))
            })
            .dependency(Dependency::bound("query_or_default", "query_or_cookie_extractor")),
        )
        .route(
            Operation::post("/process/{username}", move |ctx| {
                let log_file = log_file.clone();
                async move {
                    let username = path_param(&ctx, "username");
                    ctx.deferred().add_async_task(
                        "save_log_to_file",
                        append_log(log_file, format!("User {} was processed.", username)),
                    );
                    Ok(json!({ "status": "processing started", "user": username }))
                }
            })
            .dependency(Dependency::bound("q", "log_query")),
        )
        .group(
            RouterGroup::new("/admin")
                .dependency(Dependency::guard("verify_token"))
                .route(
                    Operation::get("/users/", |_ctx| async move {
                        Ok(json!([{ "username": "Rick" }, { "username": "Morty" }]))
                    })
                    .dependency(Dependency::guard("verify_key")),
                )
                .route(Operation::put("/items/{item_id}", update_item)),
        )
        .build()?;

    Ok((app, db))
}

fn path_param(ctx: &HandlerContext, name: &str) -> String {
    ctx.inputs()
        .lookup(reqscope_core::InputKind::Path, name)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

async fn list_items(ctx: HandlerContext) -> Result<JsonValue> {
    let commons = ctx.get::<CommonQueryParams>("commons")?;
    let db = ctx.get::<DbSession>("db")?;

    let mut names = ctx.storage()?.keys().await?;
    if let Some(q) = &commons.q {
        names.retain(|name| name.contains(q.as_str()));
    }
    let items: Vec<String> = names
        .into_iter()
        .skip(commons.skip)
        .take(commons.limit)
        .collect();

    Ok(json!({ "session": db.id, "items": items }))
}

async fn read_item(ctx: HandlerContext) -> Result<JsonValue> {
    let username = ctx.get::<String>("username")?;
    let item_id = path_param(&ctx, "item_id");

    let Some(item) = ctx.storage()?.get(&item_id).await? else {
        return Err(ClientError::not_found("Item not found").into());
    };
    if item["owner"] != json!(username.as_str()) {
        return Err(OwnerError(username.to_string()).into());
    }
    Ok(item)
}

async fn dangerous_item(ctx: HandlerContext) -> Result<JsonValue> {
    let db = ctx.get::<DbSession>("db")?;
    let name = path_param(&ctx, "name");
    if name == "bomb" {
        return Err(DangerousItemError(name).into());
    }
    Ok(json!({ "item": name, "session": db.id, "open": db.is_open() }))
}

async fn update_item(ctx: HandlerContext) -> Result<HttpResponse> {
    let item_id = path_param(&ctx, "item_id");
    let Some(description) = ctx
        .inputs()
        .lookup(reqscope_core::InputKind::Body, "description")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
    else {
        return Err(ClientError::bad_request("description is required").into());
    };

    let store = ctx.storage()?;
    let previous = store.get(&item_id).await?;
    let owner = previous
        .as_ref()
        .and_then(|item| item.get("owner").cloned())
        .unwrap_or_else(|| json!("Rick"));
    let item = json!({ "description": description, "owner": owner });
    store.put(&item_id, item.clone()).await?;

    let status = if previous.is_some() { 200 } else { 201 };
    Ok(HttpResponse::new(status, item))
}
