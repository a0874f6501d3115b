//! 示例 Provider

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use reqscope_web::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// 业务错误：操作了不属于当前用户的物品
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct OwnerError(pub String);

/// 常用的分页参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonQueryParams {
    pub q: Option<String>,
    pub skip: usize,
    pub limit: usize,
}

/// 模拟的数据库会话
#[derive(Debug)]
pub struct DbSession {
    pub id: u64,
    open: AtomicBool,
}

impl DbSession {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// 每个请求打开一个会话，请求结束后关闭
#[derive(Debug, Default)]
pub struct FakeDb {
    next_id: AtomicU64,
    closed: AtomicU64,
}

impl FakeDb {
    pub fn closed_sessions(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FakeDb {
    async fn setup(&self, args: ProviderArgs) -> std::result::Result<Value, ResolutionError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(session = id, owner = args.owner(), "Database session opened");
        Ok(value(DbSession {
            id,
            open: AtomicBool::new(true),
        }))
    }

    async fn teardown(
        &self,
        session: Value,
        outcome: &Outcome<'_>,
    ) -> std::result::Result<(), TeardownError> {
        let session = session
            .downcast::<DbSession>()
            .map_err(|_| anyhow!("get_db produced something other than a DbSession"))?;
        session.open.store(false, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            session = session.id,
            success = outcome.is_success(),
            "Database session closed"
        );
        Ok(())
    }

    fn is_yielding(&self) -> bool {
        true
    }
}

/// 把一行日志追加到文件
pub async fn append_log(path: PathBuf, message: String) -> anyhow::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(format!("{}\n", message).as_bytes()).await?;
    Ok(())
}

fn query_extractor() -> ProviderDefinition {
    ProviderDefinition::new(
        "query_extractor",
        provider_fn(|args| async move { Ok(args.str("q")) }),
    )
    .with_param(Param::query("q").optional())
}

/// `q` 缺失或为空时退回到上一次查询的 cookie
fn query_or_cookie_extractor() -> ProviderDefinition {
    ProviderDefinition::new(
        "query_or_cookie_extractor",
        provider_fn(|args| async move {
            let q = args.get::<Option<String>>("q")?;
            Ok::<_, ResolutionError>(
                q.as_ref()
                    .clone()
                    .filter(|q| !q.is_empty())
                    .or_else(|| args.str("last_query")),
            )
        }),
    )
    .with_params(vec![
        Param::depends("q", "query_extractor"),
        Param::cookie("last_query").optional(),
    ])
}

fn common_parameters() -> ProviderDefinition {
    ProviderDefinition::new(
        "common_parameters",
        provider_fn(|args| async move {
            Ok::<_, ResolutionError>(CommonQueryParams {
                q: args.str("q"),
                skip: args.deserialize("skip")?,
                limit: args.deserialize("limit")?,
            })
        }),
    )
    .with_params(vec![
        Param::query("q").optional(),
        Param::query("skip").with_default(0),
        Param::query("limit").with_default(100),
    ])
}

fn get_username() -> ProviderDefinition {
    ProviderDefinition::new(
        "get_username",
        yielding(
            |_args| async move { Ok(String::from("Rick")) },
            |_username: Arc<String>, outcome: &Outcome<'_>| match outcome.domain_error::<OwnerError>() {
                Some(e) => Err(TeardownError::Translate(ClientError::bad_request(format!(
                    "Owner error: {}",
                    e
                )))),
                None => Ok(()),
            },
        ),
    )
}

fn verify_token(expected: String) -> ProviderDefinition {
    ProviderDefinition::new(
        "verify_token",
        provider_fn(move |args| {
            let expected = expected.clone();
            async move {
                match args.str("x_token") {
                    Some(token) if token == expected => Ok(()),
                    _ => Err(ResolutionError::from(ClientError::bad_request(
                        "X-Token header invalid",
                    ))),
                }
            }
        }),
    )
    .with_param(Param::header("x_token"))
}

fn verify_key(expected: String) -> ProviderDefinition {
    ProviderDefinition::new(
        "verify_key",
        provider_fn(move |args| {
            let expected = expected.clone();
            async move {
                match args.str("x_key") {
                    Some(key) if key == expected => Ok(key),
                    _ => Err(ResolutionError::from(ClientError::bad_request(
                        "X-Key header invalid",
                    ))),
                }
            }
        }),
    )
    .with_param(Param::header("x_key"))
}

/// 带查询参数时在后台记录日志
fn log_query(log_file: PathBuf) -> ProviderDefinition {
    ProviderDefinition::new(
        "log_query",
        provider_fn(move |args| {
            let log_file = log_file.clone();
            async move {
                let q = args.str("q");
                if let Some(q) = &q {
                    args.deferred().add_async_task(
                        "log_query",
                        append_log(log_file, format!("Query param detected: {}", q)),
                    );
                }
                Ok(q)
            }
        }),
    )
    .with_param(Param::query("q").optional())
}

/// 示例应用用到的所有 Provider
pub struct DemoProviders {
    pub db: Arc<FakeDb>,
    pub definitions: Vec<ProviderDefinition>,
}

impl DemoProviders {
    pub fn new(token: String, key: String, log_file: PathBuf) -> Self {
        let db = Arc::new(FakeDb::default());
        let definitions = vec![
            query_extractor(),
            query_or_cookie_extractor(),
            common_parameters(),
            ProviderDefinition::from_arc("get_db", db.clone()),
            get_username(),
            verify_token(token),
            verify_key(key),
            log_query(log_file),
        ];
        Self { db, definitions }
    }
}
