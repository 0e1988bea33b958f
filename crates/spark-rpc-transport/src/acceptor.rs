use std::{fmt, sync::Arc};

use crate::{BoxFuture, endpoint::Endpoint, error::Result, transceiver::Transceiver};

/// 监听端的能力契约。
///
/// 生命周期：`Endpoint::acceptor` 创建 → `listen` 绑定并返回有效端点（端口为 0 时带上系统分配的端口）
/// → 反复 `accept` → `close`。`accept` 产出的收发器从 `NeedAuthenticate` 开始，
/// 握手由就绪循环继续推进。
pub trait Acceptor: fmt::Debug + fmt::Display + Send {
    /// 绑定监听套接字，返回有效端点；需要在 Tokio 运行时上下文中调用。
    fn listen(&mut self) -> Result<Arc<dyn Endpoint>>;

    /// 等待下一个入站连接。
    fn accept(&mut self) -> BoxFuture<'_, Result<Box<dyn Transceiver>>>;

    /// 停止监听；幂等。
    fn close(&mut self);

    /// 当前端点：`listen` 之前为配置端点，之后为有效端点。
    fn endpoint(&self) -> Arc<dyn Endpoint>;

    fn protocol(&self) -> &str;

    fn to_detailed_string(&self) -> String {
        self.to_string()
    }
}
