#![doc = r#"
# spark-rpc-tls

## 设计动机（Why）
- **可插拔的安全传输**：以 `ssl` 协议名、判别值 `2` 注册进
  [`spark_rpc_transport::EndpointFactoryRegistry`]，对 RPC 核心呈现与明文 TCP 完全相同的
  端点/连接器/接收器/收发器契约；
- **证书驱动的准入**：链校验、吊销策略、主机名与基于可分辨名称的信任规则串成一条管线，
  任何一环失败都以安全错误拒绝连接，不会降级为明文或匿名会话；
- **显式上下文**：[`TlsInstance`] 在初始化时读取全部配置、证书与信任规则，之后只读共享。

## 核心契约（What）
- [`TlsInstance`]：配置、本地身份、信任锚与 `rustls` 配置的持有者，由 [`TlsInstance::builder`] 构建；
- [`TlsConnectionState`]：可重入的建连/代理/握手/校验状态机；
- [`TlsEndpoint`]、[`TlsConnector`]、[`TlsAcceptor`]、[`TlsTransceiver`]：传输契约的 TLS 实现；
- [`TrustManager`]：`Spark.Tls.TrustOnly*` 规则的解析与匹配；
- [`CertificateStore`]：基于目录的证书存储，支持查询与导入。

## 风险与考量（Trade-offs）
- 加密实现固定为 `rustls` + `ring`，不依赖系统 OpenSSL；
- 证书链在握手完成后按值复制进 [`TlsConnectionInfo`]，调用方拿到的是快照而非活动会话的引用。
"#]
#![deny(unsafe_code)]

pub mod acceptor;
pub mod certificate;
pub mod config;
pub mod connection_info;
pub mod connector;
pub mod dn;
pub mod endpoint;
mod error;
pub mod factory;
pub mod instance;
pub mod policy;
pub mod state;
pub mod store;
pub mod transceiver;
pub mod trust;
pub mod verifier;

pub use acceptor::TlsAcceptor;
pub use certificate::{Certificate, CertificateParseError, LocalIdentity};
pub use config::{ProtocolSet, StoreDirective, StoreLocation, TlsConfig};
pub use connection_info::TlsConnectionInfo;
pub use connector::TlsConnector;
pub use dn::{DistinguishedName, DnPattern};
pub use endpoint::TlsEndpoint;
pub use factory::{TlsEndpointFactory, register};
pub use instance::{TlsInstance, TlsInstanceBuilder};
pub use policy::{ChainStatus, PolicyErrors};
pub use state::{ConnectState, TlsConnectionState};
pub use store::{CertificateStore, PasswordCallback, StoreError};
pub use transceiver::TlsTransceiver;
pub use trust::TrustManager;
pub use verifier::CertificateVerifier;
