use std::fmt;

/// 就绪需求令牌：告诉外层就绪循环“在重新进入状态机之前，需要等待哪一种 I/O 事件”。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 握手与读写都以非阻塞方式推进；每次调用只做一步同步工作，然后把控制权交还给外层循环；
/// - 外层循环只需根据令牌等待对应事件，再次调用同一方法即可，不需要理解具体协议。
///
/// ## 契约（What）
/// - `None`：当前操作已完成，无需等待；
/// - `Connect`：等待异步建连完成，也被复用为“取得进展后请立即重入”的通用信号；
/// - `Read` / `Write`：等待套接字可读 / 可写。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketOperation {
    None,
    Connect,
    Read,
    Write,
}

impl SocketOperation {
    /// 是否需要等待。
    pub fn is_pending(self) -> bool {
        self != SocketOperation::None
    }
}

impl fmt::Display for SocketOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketOperation::None => "none",
            SocketOperation::Connect => "connect",
            SocketOperation::Read => "read",
            SocketOperation::Write => "write",
        };
        f.write_str(name)
    }
}
