use std::{borrow::Cow, fmt};

/// 引擎统一的结果别名，默认错误类型为 [`DataplaneError`]。
pub type Result<T, E = DataplaneError> = std::result::Result<T, E>;

type ErrorCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 数据面传输引擎的结构化错误。
///
/// # 模块角色（Why）
/// - 电路建立、模板生成与握手过程中出现的失败都需要携带稳定错误码与定位上下文，
///   以便调用方区分“配置/资源错误（致命）”与“运行期背压（非错误）”。
///
/// # 核心机制（How）
/// - `code` 取自 [`codes`] 模块，遵循 `dataplane.<领域>.<语义>` 命名；
/// - `kind` 决定处理策略（见 [`ErrorKind::is_fatal`]）；
/// - `context` 记录出错的端点、电路与端口，`Display` 时按需追加。
///
/// # 契约说明（What）
/// - 所有 builder 方法按值返回 `Self`，错误对象可跨线程传递；
/// - `source()` 返回通过 [`with_cause`](Self::with_cause) 附加的底层原因。
#[derive(Debug, thiserror::Error)]
#[error("[{code}] {message}{context}")]
pub struct DataplaneError {
    code: &'static str,
    message: Cow<'static, str>,
    kind: ErrorKind,
    context: ErrorContext,
    #[source]
    cause: Option<ErrorCause>,
}

impl DataplaneError {
    /// 以错误码、分类与描述构造错误。
    pub fn new(code: &'static str, kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            kind,
            context: ErrorContext::default(),
            cause: None,
        }
    }

    /// 端点偏移资源耗尽，`endpoint` 为耗尽的共享内存块名称。
    pub fn no_more_buffer(endpoint: &str, requested: u64) -> Self {
        Self::new(
            codes::NO_MORE_BUFFER,
            ErrorKind::ResourceExhausted,
            format!("endpoint cannot satisfy allocation of {requested} bytes"),
        )
        .with_endpoint(endpoint)
    }

    pub fn unsupported_pattern(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::UNSUPPORTED_PATTERN, ErrorKind::UnsupportedPattern, message)
    }

    pub fn protocol_violation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::PROTOCOL_VIOLATION, ErrorKind::ProtocolViolation, message)
    }

    /// 传输请求构建失败，需同时给出源与目标端点。
    pub fn transport_build(source: &str, target: &str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::TRANSPORT_BUILD, ErrorKind::TransportBuildFailure, message)
            .with_endpoint(source)
            .with_peer(target)
    }

    pub fn invalid_argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::INVALID_ARGUMENT, ErrorKind::InvalidArgument, message)
    }

    pub fn not_ready(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::NOT_READY, ErrorKind::NotReady, message)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.context.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.context.peer = Some(peer.into());
        self
    }

    pub fn with_circuit(mut self, circuit: u32) -> Self {
        self.context.circuit = Some(circuit);
        self
    }

    pub fn with_port(mut self, port: u32) -> Self {
        self.context.port = Some(port);
        self
    }

    /// 附加底层原因，保留错误链。
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }
}

/// 错误分类，对应调用方的处置策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// 端点偏移分配失败；对建立流程致命。
    ResourceExhausted,
    /// 分布/分区/角色组合没有对应的传输模式。
    UnsupportedPattern,
    /// 对端或调用方违反协议（影子端口请求描述符、未知电路等）。
    ProtocolViolation,
    /// 传输服务无法构建拷贝请求。
    TransportBuildFailure,
    /// 非法的引用、编号或配置值。
    InvalidArgument,
    /// 电路尚未就绪。
    NotReady,
}

impl ErrorKind {
    /// 是否应终止当前电路的建立流程。
    pub fn is_fatal(self) -> bool {
        !matches!(self, ErrorKind::NotReady)
    }

    /// 是否允许调用方在下一轮轮询时重试。
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::NotReady)
    }
}

/// 错误发生位置的上下文。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub endpoint: Option<String>,
    pub peer: Option<String>,
    pub circuit: Option<u32>,
    pub port: Option<u32>,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(endpoint) = &self.endpoint {
            write!(f, " endpoint={endpoint}")?;
        }
        if let Some(peer) = &self.peer {
            write!(f, " peer={peer}")?;
        }
        if let Some(circuit) = self.circuit {
            write!(f, " circuit={circuit}")?;
        }
        if let Some(port) = self.port {
            write!(f, " port={port}")?;
        }
        Ok(())
    }
}

/// 稳定错误码集合，遵循 `dataplane.<领域>.<语义>` 约定。
pub mod codes {
    /// 端点共享内存耗尽（对应传统的 NO_MORE_BUFFER_AVAILABLE）。
    pub const NO_MORE_BUFFER: &str = "dataplane.resource.no_more_buffer";
    /// 选不出传输模式。
    pub const UNSUPPORTED_PATTERN: &str = "dataplane.pattern.unsupported";
    pub const PROTOCOL_VIOLATION: &str = "dataplane.protocol.violation";
    /// 握手请求指向本地不存在的电路。
    pub const UNKNOWN_CIRCUIT: &str = "dataplane.protocol.unknown_circuit";
    pub const TRANSPORT_BUILD: &str = "dataplane.transport.build_failure";
    pub const INVALID_ARGUMENT: &str = "dataplane.argument.invalid";
    pub const NOT_READY: &str = "dataplane.circuit.not_ready";
    /// 内存访问越界。
    pub const OUT_OF_BOUNDS: &str = "dataplane.memory.out_of_bounds";
    pub const INVALID_CONFIG: &str = "dataplane.config.invalid";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_appends_context() {
        let err = DataplaneError::no_more_buffer("ocpi-smb-pio:a;4096.1.16", 128)
            .with_circuit(7)
            .with_port(2);
        let rendered = err.to_string();
        assert!(rendered.starts_with("[dataplane.resource.no_more_buffer]"));
        assert!(rendered.contains("endpoint=ocpi-smb-pio:a;4096.1.16"));
        assert!(rendered.contains("circuit=7"));
        assert!(rendered.contains("port=2"));
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(err.kind().is_fatal());
    }

    #[test]
    fn cause_is_exposed_as_source() {
        let io = std::io::Error::other("segment unmapped");
        let err = DataplaneError::transport_build("a", "b", "copy rejected").with_cause(io);
        let source = std::error::Error::source(&err).expect("应保留底层原因");
        assert_eq!(source.to_string(), "segment unmapped");
        assert_eq!(err.context().peer.as_deref(), Some("b"));
    }
}
