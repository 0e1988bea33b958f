#![doc = r#"
# spark-rpc-transport

## 设计动机（Why）
- **统一传输契约**：RPC 核心的连接管理器只面向 [`Endpoint`]、[`Connector`]、[`Acceptor`] 与
  [`Transceiver`] 四个能力接口，TLS 只是其中一种实现，按判别值在 [`EndpointFactoryRegistry`] 中注册；
- **协作式挂起**：所有建连、握手与读写都以“执行一步、返回 [`SocketOperation`]、就绪后重入”的方式推进，
  既能嵌入外部事件循环，也能由 [`driver`] 中的 Tokio 驱动器直接运行；
- **显式上下文**：配置（[`Properties`]）、网络设置（[`NetworkSettings`]）与追踪级别（[`TraceLevels`]）
  在初始化时读取一次，以值或 `Arc` 形式传入各组件，不存在全局可变状态。

## 核心契约（What）
- [`TransportError`]：统一错误枚举，区分安全拒绝、配置错误、连接丢失、超时与 I/O 故障，
  并给出稳定错误码与 [`ErrorCategory`]；
- [`StreamSocket`]：基于 Tokio 的非阻塞流套接字，建连以 Future 形式挂起；
- [`NetworkProxy`]：SOCKS4 与 HTTP CONNECT 代理握手编解码；
- [`OutputStream`] / [`InputStream`]：端点线上编码使用的最小编组流。

## 风险与考量（Trade-offs）
- 收发器方法接收 `&mut self`，同一连接的读写由持有者串行化；
- 套接字相关操作要求调用方处于 Tokio 运行时上下文。
"#]
#![deny(unsafe_code)]

use std::{future::Future, pin::Pin};

pub mod acceptor;
pub mod buffer;
pub mod connector;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod factory;
pub mod hash;
pub mod network;
pub mod operation;
pub mod options;
pub mod properties;
pub mod proxy;
pub mod socket;
pub mod stream;
pub mod trace;
pub mod transceiver;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use connector::Connector;
pub use endpoint::{ConnectorsCallback, Endpoint, EndpointSelectionType, compare_endpoints};
pub use error::{ErrorCategory, OperationKind, Result, RetryAdvice, SecurityClass, TransportError};
pub use factory::{EndpointFactory, EndpointFactoryRegistry, OpaqueEndpoint};
pub use network::{NetworkInterfaces, NetworkSettings, ProtocolSupport, SystemInterfaces};
pub use operation::SocketOperation;
pub use options::IpEndpointBase;
pub use properties::Properties;
pub use proxy::{HttpProxy, NetworkProxy, ProxyConfig, Socks4Proxy};
pub use socket::StreamSocket;
pub use stream::{EncodingVersion, InputStream, OutputStream};
pub use trace::TraceLevels;
pub use transceiver::{ConnectionInfo, Transceiver};

/// 传输层使用的装箱 Future。
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
