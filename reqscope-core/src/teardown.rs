//! Teardown Coordinator
//!
//! handler 产生结果（或解析失败）之后，按 setup 完成顺序的逆序执行所有
//! yielding Provider 的清理逻辑：
//!
//! - 每个 teardown 都会执行，前一个失败不影响后一个
//! - Provider 主动翻译的客户端错误优先于原始错误，外层的 teardown 看到的是翻译后的失败
//! - 未处理的清理失败记录为内部故障，不会覆盖已经产生的成功响应

use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use crate::error::{ClientError, RequestError, TeardownError};
use crate::scope::RequestScope;
use crate::tasks::panic_message;

/// 传给 teardown 的请求结果
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    Succeeded,
    Failed(&'a RequestError),
    Cancelled,
}

impl<'a> Outcome<'a> {
    pub fn from_result<R>(result: &'a Result<R, RequestError>) -> Self {
        match result {
            Ok(_) => Outcome::Succeeded,
            Err(RequestError::Cancelled) => Outcome::Cancelled,
            Err(e) => Outcome::Failed(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    pub fn error(&self) -> Option<&'a RequestError> {
        match self {
            Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// 失败是否由指定类型的业务错误引起
    pub fn domain_error<E>(&self) -> Option<&'a E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        self.error().and_then(|e| e.domain_error::<E>())
    }
}

/// 未处理的清理故障
#[derive(Debug)]
pub struct TeardownFault {
    pub provider: String,
    pub error: anyhow::Error,
}

/// 一次 teardown 阶段的执行记录
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// 按执行顺序排列的 Provider 标识
    pub executed: Vec<String>,

    pub faults: Vec<TeardownFault>,

    /// 在成功或取消的请求上产生、因此没有生效的翻译
    pub ignored_translations: Vec<(String, ClientError)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty()
    }
}

/// Teardown 协调器
pub struct TeardownCoordinator;

impl TeardownCoordinator {
    /// 对作用域中所有完成 setup 的 yielding Provider 执行清理
    pub async fn run<R>(
        scope: &mut RequestScope,
        mut result: Result<R, RequestError>,
    ) -> (Result<R, RequestError>, TeardownReport) {
        let pending = scope.take_teardowns();
        let mut report = TeardownReport::default();

        if !pending.is_empty() {
            tracing::debug!("Running {} teardown(s)", pending.len());
        }

        for (provider_id, value, provider) in pending {
            let teardown_result = {
                let outcome = Outcome::from_result(&result);
                AssertUnwindSafe(provider.teardown(value, &outcome))
                    .catch_unwind()
                    .await
            };
            report.executed.push(provider_id.clone());

            match teardown_result {
                Ok(Ok(())) => {
                    tracing::trace!("Teardown of '{}' completed", provider_id);
                }
                Ok(Err(TeardownError::Translate(client_error))) => {
                    if matches!(&result, Err(e) if !matches!(e, RequestError::Cancelled)) {
                        tracing::debug!(
                            "Provider '{}' translated the failure into {}",
                            provider_id,
                            client_error
                        );
                        result = Err(RequestError::Translated {
                            provider: provider_id,
                            error: client_error,
                        });
                    } else {
                        tracing::warn!(
                            "Provider '{}' raised {} during teardown but the request did not fail, keeping the original result",
                            provider_id,
                            client_error
                        );
                        report.ignored_translations.push((provider_id, client_error));
                    }
                }
                Ok(Err(TeardownError::Fault(error))) => {
                    tracing::error!("Teardown of '{}' failed: {:#}", provider_id, error);
                    report.faults.push(TeardownFault {
                        provider: provider_id,
                        error,
                    });
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!("Teardown of '{}' panicked: {}", provider_id, message);
                    report.faults.push(TeardownFault {
                        provider: provider_id,
                        error: anyhow::anyhow!("teardown panicked: {}", message),
                    });
                }
            }
        }

        (result, report)
    }
}
