use std::{
    fmt,
    net::SocketAddr,
    task::{Context, Poll},
};

use crate::{buffer::Buffer, error::Result, operation::SocketOperation};

/// 连接信息快照。
///
/// 由收发器按值复制给调用方，不持有对活动连接的任何引用。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// 是否为入站连接。
    pub incoming: bool,
    /// 入站连接所属的适配器名。
    pub adapter_name: String,
    pub connection_id: String,
    pub local_address: Option<SocketAddr>,
    pub remote_address: Option<SocketAddr>,
    pub rcv_size: Option<usize>,
    pub snd_size: Option<usize>,
}

/// 单条连接的非阻塞读写面。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 就绪循环对所有传输种类一视同仁：调用一次方法，拿到一个 [`SocketOperation`]，
///   等待对应事件后再调用同一方法；
/// - 建连、代理握手、TLS 握手与读写全部复用这一“返回令牌、就绪后重入”的协作式挂起模型。
///
/// ## 逻辑（How）
/// - `poll_ready` 把令牌翻译为具体等待：`Connect` 推进挂起的建连 Future，
///   `Read`/`Write` 等待套接字就绪；它承担“完成回调”的角色，可以在任意工作线程上被轮询；
/// - `read`/`write` 尽力推进 `Buffer` 的游标，缓冲区未处理完时返回 `Read`/`Write`。
///
/// ## 契约（What）
/// - 方法接收 `&mut self`：同一连接的调用必须串行，由持有者保证；
/// - `initialize` 在状态未推进时可重复调用，返回相同令牌且不重复发起底层操作；
/// - `close` 之后 `initialize` 返回 `None`，`poll_ready` 立即就绪，不再报错；
/// - `info` 返回快照，而非对内部状态的引用。
pub trait Transceiver: fmt::Debug + fmt::Display + Send {
    /// 协议名。
    fn protocol(&self) -> &str;

    /// 推进建连与握手。
    fn initialize(&mut self) -> Result<SocketOperation>;

    /// 等待 `operation` 所描述的事件。
    fn poll_ready(&mut self, cx: &mut Context<'_>, operation: SocketOperation)
        -> Poll<Result<()>>;

    /// 开始优雅关闭；`initiator` 表示本端主动发起。
    fn closing(&mut self, initiator: bool) -> Result<SocketOperation>;

    /// 立即释放底层资源；幂等。
    fn close(&mut self);

    /// 写出 `buffer` 中的剩余字节。
    fn write(&mut self, buffer: &mut Buffer) -> Result<SocketOperation>;

    /// 读入直至填满 `buffer` 的剩余空间。
    fn read(&mut self, buffer: &mut Buffer) -> Result<SocketOperation>;

    /// 是否还有已解密但尚未交付的数据。
    fn has_buffered_data(&self) -> bool {
        false
    }

    /// 连接信息快照。
    fn info(&self) -> ConnectionInfo;

    fn to_detailed_string(&self) -> String {
        self.to_string()
    }
}
