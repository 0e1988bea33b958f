use rustls_pki_types::CertificateDer;
use spark_rpc_transport::ConnectionInfo;

use crate::certificate::{self, CertificateParseError};

/// TLS 连接信息快照。
///
/// 握手完成时由状态机复制生成，之后与连接本身不再共享任何可变状态；
/// 信任评估与外部校验器都只读取这份快照。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TlsConnectionInfo {
    pub base: ConnectionInfo,
    /// 对端证书链，叶子在前；对端未出示证书时为空。
    pub certs: Vec<CertificateDer<'static>>,
    /// 协商的密码套件，例如 `TLS13_AES_256_GCM_SHA384`。
    pub cipher: Option<String>,
    /// 协商的协议版本，例如 `TLSv1_3`。
    pub protocol_version: Option<String>,
    /// 内联链校验是否接受了对端证书。
    pub verified: bool,
    /// 出站连接的目标主机名，用于主机名校验。
    pub host: String,
}

impl TlsConnectionInfo {
    pub fn incoming(&self) -> bool {
        self.base.incoming
    }

    pub fn adapter_name(&self) -> &str {
        &self.base.adapter_name
    }

    pub fn peer_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.certs.first()
    }

    /// 叶子证书主题的 RFC 2253 文本。
    pub fn peer_subject(&self) -> Option<Result<String, CertificateParseError>> {
        self.peer_certificate().map(certificate::subject_of)
    }
}
