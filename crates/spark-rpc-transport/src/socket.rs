use std::{
    fmt, io,
    net::{IpAddr, SocketAddr},
    task::{Context, Poll},
};

use tokio::net::{TcpSocket, TcpStream};

use crate::{
    BoxFuture,
    buffer::Buffer,
    error::{CONNECT, POLL_READY, READ, Result, TransportError, WRITE},
    network::{self, NetworkSettings},
    operation::SocketOperation,
};

enum SocketState {
    /// 尚未发起建连。
    Idle,
    /// 建连进行中，Future 由 `poll_connect` 推进。
    Connecting(BoxFuture<'static, io::Result<TcpStream>>),
    /// 建连失败，错误在下一次 `finish_connect` 时交付。
    Failed(TransportError),
    Connected(TcpStream),
    Closed,
}

/// 非阻塞流套接字。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 为收发器状态机提供“发起一次异步建连、之后只检查结果”的原语，
///   从而让 `initialize` 在建连未完成时可以被安全地重复调用；
/// - 读写使用 `try_read`/`try_write`，遇到 `WouldBlock` 时返回就绪令牌而非阻塞。
///
/// ## 逻辑（How）
/// - `start_connect` 只在 `Idle` 状态下创建 `TcpSocket::connect` Future 并存入状态；
/// - `poll_connect`（由 `poll_ready(Connect)` 调用）推进 Future，结果写回状态；
/// - `finish_connect` 读取结果：成功返回 `true`，仍在进行返回 `false`，失败交付错误。
///
/// ## 契约（What）
/// - 关闭后所有就绪等待立即完成，读写返回 `ConnectionLost`；
/// - 实现 [`io::Read`]/[`io::Write`]，便于 TLS 库直接搬运密文。
pub struct StreamSocket {
    state: SocketState,
    target: Option<SocketAddr>,
    source: Option<IpAddr>,
    settings: NetworkSettings,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl StreamSocket {
    /// 出站套接字：尚未建连，目标为 `target`（存在代理时为代理地址）。
    pub fn outgoing(target: SocketAddr, source: Option<IpAddr>, settings: NetworkSettings) -> Self {
        Self {
            state: SocketState::Idle,
            target: Some(target),
            source,
            settings,
            local: None,
            remote: None,
        }
    }

    /// 入站套接字：包装已接受的流。
    pub fn accepted(stream: TcpStream, settings: NetworkSettings) -> Result<Self> {
        network::configure_stream(&stream, &settings)?;
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        Ok(Self {
            state: SocketState::Connected(stream),
            target: None,
            source: None,
            settings,
            local,
            remote,
        })
    }

    /// 发起异步建连；已发起或已完成时不做任何事。
    pub fn start_connect(&mut self) -> Result<SocketOperation> {
        match &self.state {
            SocketState::Idle => {}
            SocketState::Connected(_) => return Ok(SocketOperation::None),
            SocketState::Closed => return Err(TransportError::connection_lost()),
            SocketState::Connecting(_) | SocketState::Failed(_) => {
                return Ok(SocketOperation::Connect);
            }
        }
        let target = self
            .target
            .ok_or_else(|| TransportError::from_io(CONNECT, io::ErrorKind::NotConnected.into()))?;
        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|source| TransportError::ConnectFailed {
            address: target,
            source,
        })?;
        let configure = |result: io::Result<()>| {
            result.map_err(|source| TransportError::ConnectFailed {
                address: target,
                source,
            })
        };
        if let Some(size) = self.settings.rcv_size {
            configure(socket.set_recv_buffer_size(size as u32))?;
        }
        if let Some(size) = self.settings.snd_size {
            configure(socket.set_send_buffer_size(size as u32))?;
        }
        if let Some(source) = self.source {
            configure(socket.bind(SocketAddr::new(source, 0)))?;
        }
        self.state = SocketState::Connecting(Box::pin(socket.connect(target)));
        Ok(SocketOperation::Connect)
    }

    /// 推进挂起的建连；其余状态立即就绪。
    pub fn poll_connect(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let SocketState::Connecting(future) = &mut self.state else {
            return Poll::Ready(());
        };
        let result = match future.as_mut().poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        self.state = match result {
            Ok(stream) => {
                self.local = stream.local_addr().ok();
                self.remote = stream.peer_addr().ok();
                SocketState::Connected(stream)
            }
            Err(source) => SocketState::Failed(match self.target {
                Some(address) => TransportError::ConnectFailed { address, source },
                None => TransportError::from_io(CONNECT, source),
            }),
        };
        Poll::Ready(())
    }

    /// 检查建连结果。
    pub fn finish_connect(&mut self) -> Result<bool> {
        match std::mem::replace(&mut self.state, SocketState::Closed) {
            SocketState::Connected(stream) => {
                network::configure_stream(&stream, &self.settings)?;
                self.state = SocketState::Connected(stream);
                Ok(true)
            }
            SocketState::Failed(err) => Err(err),
            SocketState::Closed => Err(TransportError::connection_lost()),
            other => {
                self.state = other;
                Ok(false)
            }
        }
    }

    /// 是否已关闭。
    pub fn is_closed(&self) -> bool {
        matches!(self.state, SocketState::Closed)
    }

    fn stream(&self) -> io::Result<&TcpStream> {
        match &self.state {
            SocketState::Connected(stream) => Ok(stream),
            SocketState::Closed => Err(io::ErrorKind::BrokenPipe.into()),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// 等待可读；关闭后立即就绪。
    pub fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        match &self.state {
            SocketState::Connected(stream) => stream
                .poll_read_ready(cx)
                .map_err(|err| TransportError::from_io(POLL_READY, err)),
            _ => Poll::Ready(Ok(())),
        }
    }

    /// 等待可写；关闭后立即就绪。
    pub fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        match &self.state {
            SocketState::Connected(stream) => stream
                .poll_write_ready(cx)
                .map_err(|err| TransportError::from_io(POLL_READY, err)),
            _ => Poll::Ready(Ok(())),
        }
    }

    /// 把 `buffer` 的剩余字节尽量写出。
    pub fn write_buffer(&mut self, buffer: &mut Buffer) -> Result<SocketOperation> {
        while buffer.has_remaining() {
            let stream = self.stream().map_err(|err| TransportError::from_io(WRITE, err))?;
            match stream.try_write(buffer.unread()) {
                Ok(0) => return Err(TransportError::connection_lost()),
                Ok(count) => buffer.advance(count),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SocketOperation::Write);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::from_io(WRITE, err)),
            }
        }
        Ok(SocketOperation::None)
    }

    /// 读入直至填满 `buffer` 的剩余空间。
    pub fn read_buffer(&mut self, buffer: &mut Buffer) -> Result<SocketOperation> {
        while buffer.has_remaining() {
            let stream = self.stream().map_err(|err| TransportError::from_io(READ, err))?;
            match stream.try_read(buffer.unfilled_mut()) {
                Ok(0) => return Err(TransportError::connection_lost()),
                Ok(count) => buffer.advance(count),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SocketOperation::Read);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::from_io(READ, err)),
            }
        }
        Ok(SocketOperation::None)
    }

    /// 关闭套接字；幂等。挂起的建连 Future 随之丢弃。
    pub fn close(&mut self) {
        self.state = SocketState::Closed;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// 当前生效的收发缓冲区大小。
    pub fn buffer_sizes(&self) -> (Option<usize>, Option<usize>) {
        match &self.state {
            SocketState::Connected(stream) => network::buffer_sizes(stream),
            _ => (None, None),
        }
    }
}

impl io::Read for StreamSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.try_read(buf)
    }
}

impl io::Write for StreamSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Display for StreamSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |address: Option<SocketAddr>| {
            address.map_or_else(|| "<not connected>".to_owned(), |address| address.to_string())
        };
        if self.is_closed() {
            return f.write_str("<closed>");
        }
        write!(
            f,
            "local address = {}\nremote address = {}",
            show(self.local),
            show(self.remote.or(self.target))
        )
    }
}

impl fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            SocketState::Idle => "idle",
            SocketState::Connecting(_) => "connecting",
            SocketState::Failed(_) => "failed",
            SocketState::Connected(_) => "connected",
            SocketState::Closed => "closed",
        };
        f.debug_struct("StreamSocket")
            .field("state", &state)
            .field("target", &self.target)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;

    use tokio::{io::AsyncWriteExt, net::TcpListener};

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_is_issued_once_and_completes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let mut socket = StreamSocket::outgoing(address, None, NetworkSettings::default());

        assert_eq!(socket.start_connect().unwrap(), SocketOperation::Connect);
        assert_eq!(socket.start_connect().unwrap(), SocketOperation::Connect);
        assert!(!socket.finish_connect().unwrap());

        let (accepted, _) = listener.accept().await.unwrap();
        poll_fn(|cx| socket.poll_connect(cx)).await;
        assert!(socket.finish_connect().unwrap());
        assert_eq!(socket.remote_addr(), Some(address));

        let mut peer = accepted;
        peer.write_all(b"ping").await.unwrap();
        let mut buf = Buffer::with_len(4);
        loop {
            match socket.read_buffer(&mut buf).unwrap() {
                SocketOperation::None => break,
                _ => poll_fn(|cx| socket.poll_read_ready(cx)).await.unwrap(),
            }
        }
        assert_eq!(buf.as_slice(), b"ping");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refused_connect_surfaces_on_finish() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let mut socket = StreamSocket::outgoing(address, None, NetworkSettings::default());
        socket.start_connect().unwrap();
        poll_fn(|cx| socket.poll_connect(cx)).await;
        let err = socket.finish_connect().unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_socket_is_ready_and_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut socket = StreamSocket::outgoing(
            listener.local_addr().unwrap(),
            None,
            NetworkSettings::default(),
        );
        socket.start_connect().unwrap();
        socket.close();
        poll_fn(|cx| socket.poll_connect(cx)).await;
        poll_fn(|cx| socket.poll_read_ready(cx)).await.unwrap();
        assert!(matches!(
            socket.start_connect(),
            Err(TransportError::ConnectionLost { .. })
        ));
    }
}
