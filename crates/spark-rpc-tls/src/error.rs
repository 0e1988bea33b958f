use std::{io, time::Duration};

use rustls::{AlertDescription, Error as RustlsError};
use spark_rpc_transport::{
    ErrorCategory, OperationKind, RetryAdvice, SecurityClass, TransportError,
};

/// `ssl` 会话的错误归类。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 上层只认识 [`TransportError`]，这里把 `rustls` 与套接字错误翻译过去，并给出
///   [`ErrorCategory`] 供调用方决定是否重试；
/// - 证书被拒（无论是我方校验失败还是对端发来证书类 Alert）统一报告为
///   [`TransportError::Security`]，与握手后信任评估的拒绝走同一出口。
///
/// ## 逻辑（How）
/// - 每个 `OperationKind` 常量对应会话生命周期中的一个阶段；
/// - [`map_tls_error`] 先经 `classify` 得出类别，认证或授权类直接转为安全错误；
/// - Alert 由 `classify_alert` 单独细分。
///
/// ## 风险与权衡（Trade-offs）
/// - 无法判定来源的 `General`/`Other` 按可重试处理，宁可多一次重连也不误报安全事件；
/// - 表中未列出的 Alert 同样落入可重试分支。
pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.rpc.ssl.handshake_failed",
    message: "tls handshake",
};

pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.rpc.ssl.read_failed",
    message: "tls read",
};

pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.rpc.ssl.write_failed",
    message: "tls write",
};

pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.rpc.ssl.shutdown_failed",
    message: "tls shutdown",
};

pub(crate) const SETUP: OperationKind = OperationKind {
    code: "spark.rpc.ssl.setup_failed",
    message: "tls session setup",
};

/// 将 `rustls` 错误映射为传输错误。
pub(crate) fn map_tls_error(kind: OperationKind, error: RustlsError) -> TransportError {
    match classify(&error) {
        ErrorCategory::Security(SecurityClass::Authentication | SecurityClass::Authorization) => {
            TransportError::security(describe_rejection(&error))
        }
        category => TransportError::protocol(kind, category, error),
    }
}

/// 将 TLS 读写过程中的 `io::Error` 映射为传输错误，识别其中嵌套的 `rustls::Error`。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> TransportError {
    let nested = error
        .get_ref()
        .and_then(|source| source.downcast_ref::<RustlsError>())
        .cloned();
    match nested {
        Some(rustls_error) => map_tls_error(kind, rustls_error),
        None => TransportError::from_io(kind, error),
    }
}

fn describe_rejection(error: &RustlsError) -> String {
    match error {
        RustlsError::InvalidCertificate(rustls::CertificateError::Other(other)) => {
            other.to_string()
        }
        RustlsError::InvalidCertificate(inner) => format!("invalid peer certificate: {inner:?}"),
        RustlsError::NoCertificatesPresented => "peer presented no certificate".to_owned(),
        RustlsError::AlertReceived(alert) => format!("peer rejected the handshake: {alert:?}"),
        other => other.to_string(),
    }
}

fn classify(error: &RustlsError) -> ErrorCategory {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidEncryptedClientHello(_)
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord => ErrorCategory::Security(SecurityClass::Integrity),
        NoCertificatesPresented
        | InvalidCertificate(_)
        | InvalidCertRevocationList(_)
        | UnsupportedNameType => ErrorCategory::Security(SecurityClass::Authentication),
        General(_) | Other(_) | PeerIncompatible(_) | HandshakeNotComplete => backoff(100),
        FailedToGetCurrentTime | FailedToGetRandomBytes | BadMaxFragmentSize | InconsistentKeys(_) => {
            ErrorCategory::NonRetryable
        }
        AlertReceived(description) => classify_alert(description),
        NoApplicationProtocol => ErrorCategory::Security(SecurityClass::Unknown),
        _ => backoff(50),
    }
}

fn classify_alert(description: &AlertDescription) -> ErrorCategory {
    use AlertDescription::*;
    match description {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | NoCertificate
        | CertificateUnobtainable
        | CertificateRequired => ErrorCategory::Security(SecurityClass::Authentication),
        AccessDenied => ErrorCategory::Security(SecurityClass::Authorization),
        CloseNotify | UserCanceled | NoRenegotiation => backoff(25),
        DecodeError
        | DecryptError
        | DecryptionFailed
        | HandshakeFailure
        | IllegalParameter
        | RecordOverflow
        | BadRecordMac
        | UnexpectedMessage
        | InsufficientSecurity
        | InternalError
        | InappropriateFallback
        | MissingExtension
        | UnsupportedExtension
        | BadCertificateStatusResponse
        | BadCertificateHashValue
        | UnknownPSKIdentity
        | UnrecognisedName
        | NoApplicationProtocol
        | EncryptedClientHelloRequired
        | ExportRestriction
        | ProtocolVersion => ErrorCategory::Security(SecurityClass::Integrity),
        DecompressionFailure => ErrorCategory::ProtocolViolation,
        _ => backoff(50),
    }
}

fn backoff(millis: u64) -> ErrorCategory {
    ErrorCategory::Retryable(RetryAdvice::after(Duration::from_millis(millis)))
}
