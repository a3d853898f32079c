//! dataplane-otel：为传输引擎安装 `tracing` 日志与 OpenTelemetry 追踪。
//!
//! 引擎内部只通过 `tracing` 宏打点（电路就绪、握手请求、模板生成等），
//! 宿主进程在启动时调用一次 [`install`] 即可把这些事件同时输出到终端与 OpenTelemetry。

use std::{borrow::Cow, sync::OnceLock};

use dataplane_core::LoggingConfig;
use opentelemetry::{global, trace::TracerProvider as _};
use opentelemetry_sdk::{
    Resource,
    trace::{self, TracerProvider},
};
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 安装状态的全局缓存，确保只安装一次。
static INSTALL_STATE: OnceLock<InstallState> = OnceLock::new();

/// 安装过程可能出现的错误。
///
/// # 教案式说明
/// - **意图（Why）**：启动流程需要区分“重复安装”与“外部已抢先设置 Subscriber”两类情况；
/// - **契约（What）**：实现 [`std::error::Error`]，可直接交给 `anyhow` 等上层框架处理。
#[derive(Debug)]
pub enum Error {
    /// `install` 被重复调用。
    AlreadyInstalled,
    /// 外部提前设置了全局 `tracing` Subscriber。
    SubscriberAlreadySet,
    /// 过滤表达式无法解析。
    InvalidFilter(String),
    /// 设置全局 Subscriber 失败的底层错误。
    SetGlobalSubscriber(tracing::dispatcher::SetGlobalDefaultError),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::AlreadyInstalled => f.write_str("dataplane-otel 已完成安装，禁止重复调用 install"),
            Error::SubscriberAlreadySet => {
                f.write_str("全局 tracing Subscriber 已存在，dataplane-otel 无法覆盖")
            }
            Error::InvalidFilter(reason) => write!(f, "日志过滤表达式无效: {reason}"),
            Error::SetGlobalSubscriber(err) => {
                write!(f, "设置 tracing 全局 Subscriber 失败: {err}")
            }
        }
    }
}

impl std::error::Error for Error {}

struct InstallState {
    // Provider 需在进程生命周期内保持有效。
    #[allow(dead_code)]
    provider: TracerProvider,
}

/// 零配置安装：过滤表达式取自 `RUST_LOG`，缺省为 `info`。
///
/// # 教案式说明
/// - **逻辑（How）**：
///   1. 检查重复安装与外部 Subscriber；
///   2. 构建 `TracerProvider` 并注册到 `opentelemetry::global`；
///   3. 组装 `EnvFilter + fmt + OpenTelemetry` 三层并设为全局 Subscriber。
/// - **契约（What）**：第二次调用返回 [`Error::AlreadyInstalled`]。
pub fn install() -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install_filter(filter)
}

/// 以显式过滤表达式安装，例如 `"dataplane_core=debug"`。
pub fn install_with_filter(directives: &str) -> Result<(), Error> {
    let filter = EnvFilter::try_new(directives).map_err(|err| Error::InvalidFilter(err.to_string()))?;
    install_filter(filter)
}

/// 按传输配置中的 `[logging]` 段安装。
pub fn install_from_config(config: &LoggingConfig) -> Result<(), Error> {
    install_with_filter(&config.filter)
}

/// 是否已经安装。
pub fn is_installed() -> bool {
    INSTALL_STATE.get().is_some()
}

fn install_filter(filter: EnvFilter) -> Result<(), Error> {
    if INSTALL_STATE.get().is_some() {
        return Err(Error::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(Error::SubscriberAlreadySet);
    }

    let provider = build_tracer_provider();
    global::set_tracer_provider(provider.clone());
    let tracer = provider.versioned_tracer(
        "dataplane.transport",
        Some(env!("CARGO_PKG_VERSION")),
        Some(Cow::Borrowed(env!("CARGO_PKG_NAME"))),
        None,
    );

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer));
    tracing::subscriber::set_global_default(subscriber).map_err(Error::SetGlobalSubscriber)?;

    INSTALL_STATE
        .set(InstallState { provider })
        .map_err(|_| Error::AlreadyInstalled)
}

fn build_tracer_provider() -> TracerProvider {
    TracerProvider::builder()
        .with_config(
            trace::config()
                .with_sampler(trace::Sampler::AlwaysOn)
                .with_resource(Resource::default()),
        )
        .build()
}
