use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error;

/// 传输层统一错误类型。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - RPC 核心的重试/故障转移策略需要区分“安全拒绝”“网络丢失”“超时”与“配置错误”，
///   因此所有传输实现（TLS 只是其中一种）都以同一枚举对外报告故障；
/// - 每个变体都能映射到稳定错误码与 [`ErrorCategory`]，调用方无需解析文案即可决策。
///
/// ## 契约（What）
/// - `Security`：对端未通过信任评估，`reason` 为人类可读原因，不可盲目重试；
/// - `Config` / `EndpointParse`：静态配置错误，在解析或初始化阶段立即暴露，永不重试；
/// - `ConnectionLost` / `Timeout` / `ConnectFailed` / `Io`：可交由核心的标准重连策略处理；
/// - 追踪日志只记录上下文，绝不吞掉或改写错误。
///
/// ## 风险与权衡（Trade-offs）
/// - `Io` 携带 [`OperationKind`]，保持与底层操作一一对应，代价是变体数目略多；
/// - `Security` 只保留字符串原因：具体是证书链、信任规则还是自定义校验器拒绝，仅在追踪日志中区分。
#[derive(Debug, Error)]
pub enum TransportError {
    /// 对端证书或信任规则校验失败。
    #[error("security fault: {reason}")]
    Security { reason: String },

    /// 配置属性非法，`property` 指向出错的属性名。
    #[error("configuration error in `{property}`: {reason}")]
    Config { property: String, reason: String },

    /// 端点文本无法解析。
    #[error("invalid endpoint `{endpoint}`: {reason}")]
    EndpointParse { endpoint: String, reason: String },

    /// 对端关闭或重置了连接。
    #[error("connection lost")]
    ConnectionLost {
        #[source]
        source: Option<io::Error>,
    },

    /// 操作超出允许的时长。
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    /// 主动建连失败。
    #[error("connect to {address} failed: {source}")]
    ConnectFailed {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 监听地址无法绑定。
    #[error("bind to {address} failed: {source}")]
    SocketBind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 主机名解析失败。
    #[error("cannot resolve `{host}`: {source}")]
    Dns {
        host: String,
        #[source]
        source: io::Error,
    },

    /// 网络代理（SOCKS/HTTP）协议错误。
    #[error("{proxy} proxy failure: {reason}")]
    Proxy { proxy: &'static str, reason: String },

    /// 线上编码无法解码。
    #[error("marshal error: {0}")]
    Marshal(String),

    /// 底层 I/O 错误。
    #[error("{}: {source}", .kind.message)]
    Io {
        kind: OperationKind,
        #[source]
        source: io::Error,
    },

    /// 具体传输协议（如 TLS）报告的错误，分类由协议实现预先给出。
    #[error("{}: {source}", .kind.message)]
    Protocol {
        kind: OperationKind,
        category: ErrorCategory,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl TransportError {
    /// 构造安全错误。
    pub fn security(reason: impl Into<String>) -> Self {
        Self::Security {
            reason: reason.into(),
        }
    }

    /// 构造配置错误。
    pub fn config(property: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            property: property.into(),
            reason: reason.into(),
        }
    }

    /// 构造端点解析错误。
    pub fn endpoint_parse(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EndpointParse {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// 构造不带底层原因的连接丢失错误。
    pub fn connection_lost() -> Self {
        Self::ConnectionLost { source: None }
    }

    /// 构造带预置分类的协议错误。
    pub fn protocol(
        kind: OperationKind,
        category: ErrorCategory,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Protocol {
            kind,
            category,
            source: source.into(),
        }
    }

    /// 将一次底层 I/O 失败映射为传输错误。
    ///
    /// 连接重置、中止与意外 EOF 统一视作 `ConnectionLost`，超时视作 `Timeout`，
    /// 其余保留为带操作码的 `Io`。
    pub fn from_io(kind: OperationKind, error: io::Error) -> Self {
        use io::ErrorKind;
        match error.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Self::ConnectionLost {
                source: Some(error),
            },
            ErrorKind::TimedOut => Self::Timeout {
                operation: kind.message,
            },
            _ => Self::Io {
                kind,
                source: error,
            },
        }
    }

    /// 稳定错误码，供日志、指标与 TCK 断言使用。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Security { .. } => "spark.rpc.security_rejected",
            Self::Config { .. } => "spark.rpc.config_invalid",
            Self::EndpointParse { .. } => "spark.rpc.endpoint_invalid",
            Self::ConnectionLost { .. } => "spark.rpc.connection_lost",
            Self::Timeout { .. } => "spark.rpc.timeout",
            Self::ConnectFailed { .. } => "spark.rpc.connect_failed",
            Self::SocketBind { .. } => "spark.rpc.bind_failed",
            Self::Dns { .. } => "spark.rpc.dns_failed",
            Self::Proxy { .. } => "spark.rpc.proxy_failed",
            Self::Marshal(_) => "spark.rpc.marshal_failed",
            Self::Io { kind, .. } | Self::Protocol { kind, .. } => kind.code,
        }
    }

    /// 错误分类，驱动上层的重试与告警策略。
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Security { .. } => ErrorCategory::Security(SecurityClass::Authentication),
            Self::Config { .. } | Self::EndpointParse { .. } => ErrorCategory::NonRetryable,
            Self::ConnectionLost { .. } => retry_after(60),
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::ConnectFailed { .. } | Self::Dns { .. } => retry_after(50),
            Self::SocketBind { .. } => ErrorCategory::NonRetryable,
            Self::Proxy { .. } | Self::Marshal(_) => ErrorCategory::ProtocolViolation,
            Self::Io { source, .. } => classify_io(source),
            Self::Protocol { category, .. } => *category,
        }
    }

    /// 是否属于安全拒绝。
    pub fn is_security(&self) -> bool {
        matches!(self, Self::Security { .. })
    }
}

/// 传输错误的结构化分类。
///
/// 与框架错误分类保持同构：重试类携带退避建议，安全类携带细分原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Retryable(RetryAdvice),
    NonRetryable,
    Security(SecurityClass),
    ProtocolViolation,
    Timeout,
}

/// 重试建议：至少等待 `wait` 之后再尝试。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryAdvice {
    wait: Duration,
}

impl RetryAdvice {
    /// 以固定等待时长构造建议。
    pub const fn after(wait: Duration) -> Self {
        Self { wait }
    }

    /// 建议的最小等待时长。
    pub const fn wait(&self) -> Duration {
        self.wait
    }
}

/// 安全类错误的细分。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityClass {
    Authentication,
    Authorization,
    Integrity,
    Unknown,
}

/// 套接字层操作的标识：稳定的错误码加上拼进错误文案的动作名。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const CONNECT: OperationKind = OperationKind {
    code: "spark.rpc.socket.connect_failed",
    message: "tcp connect",
};

pub const ACCEPT: OperationKind = OperationKind {
    code: "spark.rpc.socket.accept_failed",
    message: "tcp accept",
};

pub const READ: OperationKind = OperationKind {
    code: "spark.rpc.socket.read_failed",
    message: "tcp read",
};

pub const WRITE: OperationKind = OperationKind {
    code: "spark.rpc.socket.write_failed",
    message: "tcp write",
};

pub const CONFIGURE: OperationKind = OperationKind {
    code: "spark.rpc.socket.configure_failed",
    message: "tcp configure",
};

pub const POLL_READY: OperationKind = OperationKind {
    code: "spark.rpc.socket.poll_ready_failed",
    message: "tcp poll_ready",
};

fn classify_io(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind::*;
    match error.kind() {
        TimedOut => ErrorCategory::Timeout,
        InvalidData => ErrorCategory::ProtocolViolation,
        WouldBlock | Interrupted => retry_after(5),
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | BrokenPipe
        | AddrInUse | AddrNotAvailable => retry_after(50),
        _ => ErrorCategory::NonRetryable,
    }
}

fn retry_after(millis: u64) -> ErrorCategory {
    ErrorCategory::Retryable(RetryAdvice::after(Duration::from_millis(millis)))
}

/// 传输层结果别名。
pub type Result<T, E = TransportError> = std::result::Result<T, E>;
