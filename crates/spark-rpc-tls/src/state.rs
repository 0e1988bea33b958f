use std::{
    fmt,
    future::Future,
    io::{self, Read, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use rustls::{ClientConnection, Connection, ServerConnection};
use rustls_pki_types::ServerName;
use spark_rpc_transport::{
    Buffer, ConnectionInfo, NetworkProxy, Result, SocketOperation, StreamSocket, TransportError,
    trace::{NETWORK_TARGET, SECURITY_TARGET},
};
use tokio::{
    net::TcpStream,
    time::{Instant, Sleep},
};
use tracing::{debug, info};

use crate::{
    certificate::Certificate,
    connection_info::TlsConnectionInfo,
    error::{self as tls_error, map_io_error, map_tls_error},
    instance::TlsInstance,
};

/// 连接建立的阶段，只会单调前进。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectState {
    NeedConnect,
    ConnectPending,
    ProxyConnectRequest,
    ProxyConnectRequestPending,
    NeedAuthenticate,
    AuthenticatePending,
    Connected,
}

/// 单条 TLS 连接的状态机。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“TCP 建连 → 可选代理握手 → TLS 握手 → 对端校验”拆成可重入的步骤：
///   每次 [`initialize`](Self::initialize) 尽可能向前推进，遇到需要等待的 I/O
///   就返回对应的 [`SocketOperation`]，由就绪循环在事件到达后再次调用；
/// - 握手完成后只保留一份拥有所有权的对端证书链快照，之后的信任判断与外部查询都基于它。
///
/// ## 逻辑（How）
/// - `NeedConnect` 发起异步建连并进入 `ConnectPending`；建连 Future 存放在套接字内，
///   由 [`poll_ready`](Self::poll_ready) 推进，因此重复调用 `initialize` 不会重复建连；
/// - 配置了代理时依次写出请求、读取并校验响应；
/// - `NeedAuthenticate` 创建 `rustls` 会话并布置握手时限；`AuthenticatePending`
///   搬运密文直至握手结束，随后执行深度限制、信任规则、主机名与外部校验器四道检查。
///
/// ## 契约（What）
/// - 状态严格单调，校验失败时停留在 `AuthenticatePending`，永远不会到达 `Connected`；
/// - 握手期间对端 EOF/重置报告为 `ConnectionLost`，超过时限报告为 `Timeout`；
/// - 错误在返回前按追踪级别记录，之后原样抛出，状态机内部不做任何重试；
/// - `close` 之后 `initialize` 返回 `None`。
///
/// ## 风险与权衡（Trade-offs）
/// - 读写共用一个 `rustls` 会话，方法均要求 `&mut self`，由持有者串行化调用；
/// - 内联链校验在握手中途执行，对端证书链在握手完成后才被复制，中途失败不会留下快照。
pub struct TlsConnectionState {
    instance: Arc<TlsInstance>,
    state: ConnectState,
    socket: StreamSocket,
    session: Option<Connection>,
    proxy: Option<Arc<dyn NetworkProxy>>,
    proxy_buffer: Buffer,
    /// 出站连接的真实目标（经代理时不同于套接字建连地址）。
    target: Option<SocketAddr>,
    host: String,
    incoming: bool,
    adapter_name: String,
    connection_id: String,
    handshake_timeout: Option<Duration>,
    deadline_at: Option<Instant>,
    deadline: Option<Pin<Box<Sleep>>>,
    info: Option<TlsConnectionInfo>,
    plaintext_pending: usize,
    close_notify_sent: bool,
    closed: bool,
}

impl TlsConnectionState {
    /// 出站连接，初始状态 `NeedConnect`。
    #[allow(clippy::too_many_arguments)]
    pub fn outgoing(
        instance: Arc<TlsInstance>,
        target: SocketAddr,
        host: impl Into<String>,
        proxy: Option<Arc<dyn NetworkProxy>>,
        source: Option<IpAddr>,
        connection_id: impl Into<String>,
        timeout: i32,
    ) -> Self {
        let connect_to = proxy.as_ref().map_or(target, |proxy| proxy.address());
        let socket = StreamSocket::outgoing(connect_to, source, instance.settings().clone());
        Self::new(
            instance.clone(),
            ConnectState::NeedConnect,
            socket,
            proxy,
            Some(target),
            host.into(),
            false,
            String::new(),
            connection_id.into(),
            instance.handshake_timeout(timeout),
        )
    }

    /// 入站连接，初始状态 `NeedAuthenticate`。
    pub fn incoming(
        instance: Arc<TlsInstance>,
        stream: TcpStream,
        adapter_name: impl Into<String>,
        timeout: i32,
    ) -> Result<Self> {
        let socket = StreamSocket::accepted(stream, instance.settings().clone())?;
        Ok(Self::new(
            instance.clone(),
            ConnectState::NeedAuthenticate,
            socket,
            None,
            None,
            String::new(),
            true,
            adapter_name.into(),
            String::new(),
            instance.handshake_timeout(timeout),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        instance: Arc<TlsInstance>,
        state: ConnectState,
        socket: StreamSocket,
        proxy: Option<Arc<dyn NetworkProxy>>,
        target: Option<SocketAddr>,
        host: String,
        incoming: bool,
        adapter_name: String,
        connection_id: String,
        handshake_timeout: Option<Duration>,
    ) -> Self {
        Self {
            instance,
            state,
            socket,
            session: None,
            proxy,
            proxy_buffer: Buffer::new(),
            target,
            host,
            incoming,
            adapter_name,
            connection_id,
            handshake_timeout,
            deadline_at: None,
            deadline: None,
            info: None,
            plaintext_pending: 0,
            close_notify_sent: false,
            closed: false,
        }
    }

    pub fn state(&self) -> ConnectState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn incoming_connection(&self) -> bool {
        self.incoming
    }

    /// 推进建连与握手。
    pub fn initialize(&mut self) -> Result<SocketOperation> {
        if self.closed {
            return Ok(SocketOperation::None);
        }
        self.advance().inspect_err(|err| self.trace_failure(err))
    }

    fn advance(&mut self) -> Result<SocketOperation> {
        loop {
            match self.state {
                ConnectState::NeedConnect => {
                    self.socket.start_connect()?;
                    self.state = ConnectState::ConnectPending;
                    return Ok(SocketOperation::Connect);
                }
                ConnectState::ConnectPending => {
                    if !self.socket.finish_connect()? {
                        return Ok(SocketOperation::Connect);
                    }
                    if let (Some(proxy), Some(target)) = (&self.proxy, self.target) {
                        proxy.begin_write(target, &mut self.proxy_buffer)?;
                        self.state = ConnectState::ProxyConnectRequest;
                        return Ok(SocketOperation::Write);
                    }
                    self.state = ConnectState::NeedAuthenticate;
                    return Ok(SocketOperation::Connect);
                }
                ConnectState::ProxyConnectRequest => {
                    let proxy = self.active_proxy()?;
                    if self.socket.write_buffer(&mut self.proxy_buffer)?.is_pending() {
                        return Ok(SocketOperation::Write);
                    }
                    if proxy.end_write(&self.proxy_buffer) == SocketOperation::Write {
                        return Ok(SocketOperation::Write);
                    }
                    proxy.begin_read(&mut self.proxy_buffer);
                    self.state = ConnectState::ProxyConnectRequestPending;
                    return Ok(SocketOperation::Read);
                }
                ConnectState::ProxyConnectRequestPending => {
                    let proxy = self.active_proxy()?;
                    loop {
                        if self.socket.read_buffer(&mut self.proxy_buffer)?.is_pending() {
                            return Ok(SocketOperation::Read);
                        }
                        if proxy.end_read(&mut self.proxy_buffer)? != SocketOperation::Read {
                            break;
                        }
                    }
                    proxy.finish(&self.proxy_buffer)?;
                    self.proxy_buffer.clear();
                    self.state = ConnectState::NeedAuthenticate;
                }
                ConnectState::NeedAuthenticate => {
                    self.session = Some(self.new_session()?);
                    self.deadline_at = self.handshake_timeout.map(|limit| Instant::now() + limit);
                    self.state = ConnectState::AuthenticatePending;
                }
                ConnectState::AuthenticatePending => {
                    if self.deadline_at.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Err(TransportError::Timeout {
                            operation: tls_error::HANDSHAKE.message,
                        });
                    }
                    let operation = self.handshake()?;
                    if operation.is_pending() {
                        return Ok(operation);
                    }
                    self.deadline_at = None;
                    self.deadline = None;
                    let info = self.capture_info();
                    self.verify_peer(&info)?;
                    if self.instance.trace().network_enabled(1) {
                        info!(
                            target: NETWORK_TARGET,
                            incoming = self.incoming,
                            protocol = info.protocol_version.as_deref().unwrap_or("unknown"),
                            cipher = info.cipher.as_deref().unwrap_or("unknown"),
                            "tls connection established\n{}",
                            self.socket
                        );
                    }
                    self.info = Some(info);
                    self.state = ConnectState::Connected;
                    return Ok(SocketOperation::None);
                }
                ConnectState::Connected => return Ok(SocketOperation::None),
            }
        }
    }

    fn active_proxy(&self) -> Result<Arc<dyn NetworkProxy>> {
        self.proxy
            .clone()
            .ok_or_else(TransportError::connection_lost)
    }

    fn new_session(&self) -> Result<Connection> {
        if self.incoming {
            let config = self.instance.server_config()?;
            return ServerConnection::new(config)
                .map(Connection::from)
                .map_err(|err| map_tls_error(tls_error::SETUP, err));
        }
        ClientConnection::new(self.instance.client_config(), self.server_name())
            .map(Connection::from)
            .map_err(|err| map_tls_error(tls_error::SETUP, err))
    }

    /// SNI 与证书名称校验使用的服务端名称：优先主机名，否则退化为目标 IP。
    fn server_name(&self) -> ServerName<'static> {
        if !self.host.is_empty()
            && let Ok(name) = ServerName::try_from(self.host.as_str())
        {
            return name.to_owned();
        }
        let ip = self
            .target
            .or_else(|| self.socket.remote_addr())
            .map_or(IpAddr::V4(Ipv4Addr::LOCALHOST), |address| address.ip());
        ServerName::IpAddress(ip.into())
    }

    fn handshake(&mut self) -> Result<SocketOperation> {
        let Some(session) = self.session.as_mut() else {
            return Err(TransportError::connection_lost());
        };
        loop {
            if !flush(session, &mut self.socket)
                .map_err(|err| map_io_error(tls_error::HANDSHAKE, err))?
            {
                return Ok(SocketOperation::Write);
            }
            if !session.is_handshaking() {
                return Ok(SocketOperation::None);
            }
            match session.read_tls(&mut self.socket) {
                Ok(0) => return Err(TransportError::connection_lost()),
                Ok(_) => {
                    if let Err(err) = session.process_new_packets() {
                        // 尽力把告警送达对端，失败无需处理。
                        let _ = flush(session, &mut self.socket);
                        return Err(map_tls_error(tls_error::HANDSHAKE, err));
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SocketOperation::Read);
                }
                Err(err) => return Err(map_io_error(tls_error::HANDSHAKE, err)),
            }
        }
    }

    fn base_info(&self) -> ConnectionInfo {
        let (rcv_size, snd_size) = self.socket.buffer_sizes();
        ConnectionInfo {
            incoming: self.incoming,
            adapter_name: self.adapter_name.clone(),
            connection_id: self.connection_id.clone(),
            local_address: self.socket.local_addr(),
            remote_address: self.socket.remote_addr(),
            rcv_size,
            snd_size,
        }
    }

    fn capture_info(&self) -> TlsConnectionInfo {
        let session = self.session.as_ref();
        let certs: Vec<_> = session
            .and_then(|session| session.peer_certificates())
            .map(|chain| chain.iter().map(|cert| cert.clone().into_owned()).collect())
            .unwrap_or_default();
        TlsConnectionInfo {
            base: self.base_info(),
            cipher: session
                .and_then(|session| session.negotiated_cipher_suite())
                .map(|suite| format!("{:?}", suite.suite())),
            protocol_version: session
                .and_then(|session| session.protocol_version())
                .map(|version| format!("{version:?}")),
            verified: !certs.is_empty(),
            host: self.host.clone(),
            certs,
        }
    }

    /// 握手后的对端校验：深度限制 → 信任规则 → 主机名 → 外部校验器，遇到失败立即返回。
    fn verify_peer(&self, info: &TlsConnectionInfo) -> Result<()> {
        let config = self.instance.config();
        if config.verify_depth_max > 0 && info.certs.len() > config.verify_depth_max {
            return Err(TransportError::security(format!(
                "length of peer's certificate chain ({}) exceeds maximum of {}",
                info.certs.len(),
                config.verify_depth_max
            )));
        }
        if !self.instance.trust().verify(info) {
            return Err(TransportError::security(format!(
                "{} connection rejected by trust manager",
                if self.incoming { "incoming" } else { "outgoing" }
            )));
        }
        if !self.incoming && config.check_cert_name && !self.host.is_empty() {
            let matches = info
                .peer_certificate()
                .and_then(|der| Certificate::from_der(der.clone()).ok())
                .is_some_and(|cert| cert.matches_host(&self.host));
            if !matches {
                return Err(TransportError::security(format!(
                    "certificate does not match host name `{}`",
                    self.host
                )));
            }
        }
        if let Some(verifier) = self.instance.certificate_verifier()
            && !verifier.verify(info)
        {
            return Err(TransportError::security("connection rejected by certificate verifier"));
        }
        Ok(())
    }

    /// 记录建连失败：安全拒绝走安全目标，其余走网络目标，两者携带相同的连接上下文。
    fn trace_failure(&self, err: &TransportError) {
        let trace = self.instance.trace();
        let proxy = self.proxy.as_ref().map(|proxy| proxy.address());
        if err.is_security() {
            if trace.security_enabled(1) {
                debug!(
                    target: SECURITY_TARGET,
                    error = %err,
                    incoming = self.incoming,
                    state = ?self.state,
                    proxy = ?proxy,
                    target_address = ?self.target,
                    "tls connection rejected\n{}",
                    self.socket
                );
            }
            return;
        }
        if trace.network_enabled(2) {
            debug!(
                target: NETWORK_TARGET,
                error = %err,
                state = ?self.state,
                proxy = ?proxy,
                target_address = ?self.target,
                "failed to establish tls connection\n{}",
                self.socket
            );
        }
    }

    /// 等待 `operation` 对应的事件；握手时限到达时同样唤醒，以便 `initialize` 报告超时。
    pub fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
        operation: SocketOperation,
    ) -> Poll<Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        if let Some(deadline) = self.deadline_at {
            let sleep = self
                .deadline
                .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
            if sleep.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Ok(()));
            }
        }
        match operation {
            SocketOperation::Connect => self.socket.poll_connect(cx).map(Ok),
            SocketOperation::Read => self.socket.poll_read_ready(cx),
            SocketOperation::Write => self.socket.poll_write_ready(cx),
            SocketOperation::None => Poll::Ready(Ok(())),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.closed || self.state != ConnectState::Connected {
            return Err(TransportError::connection_lost());
        }
        Ok(())
    }

    /// 加密并写出 `buffer` 的剩余明文。
    pub fn write(&mut self, buffer: &mut Buffer) -> Result<SocketOperation> {
        self.ensure_connected()?;
        let Some(session) = self.session.as_mut() else {
            return Err(TransportError::connection_lost());
        };
        loop {
            if !flush(session, &mut self.socket).map_err(|err| map_io_error(tls_error::WRITE, err))? {
                return Ok(SocketOperation::Write);
            }
            if !buffer.has_remaining() {
                return Ok(SocketOperation::None);
            }
            let accepted = session
                .writer()
                .write(buffer.unread())
                .map_err(|err| map_io_error(tls_error::WRITE, err))?;
            buffer.advance(accepted);
            if accepted == 0 && !session.wants_write() {
                return Ok(SocketOperation::Write);
            }
        }
    }

    /// 解密并读入明文直至填满 `buffer`。
    pub fn read(&mut self, buffer: &mut Buffer) -> Result<SocketOperation> {
        self.ensure_connected()?;
        let Some(session) = self.session.as_mut() else {
            return Err(TransportError::connection_lost());
        };
        while buffer.has_remaining() {
            match session.reader().read(buffer.unfilled_mut()) {
                // 收到 close_notify。
                Ok(0) => return Err(TransportError::connection_lost()),
                Ok(count) => {
                    buffer.advance(count);
                    self.plaintext_pending = self.plaintext_pending.saturating_sub(count);
                    continue;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(map_io_error(tls_error::READ, err)),
            }
            match session.read_tls(&mut self.socket) {
                Ok(0) => return Err(TransportError::connection_lost()),
                Ok(_) => {
                    let io_state = session
                        .process_new_packets()
                        .map_err(|err| map_tls_error(tls_error::READ, err))?;
                    self.plaintext_pending = io_state.plaintext_bytes_to_read();
                    // 会话层可能产生待发送的记录（例如密钥更新），能写多少写多少。
                    flush(session, &mut self.socket)
                        .map_err(|err| map_io_error(tls_error::READ, err))?;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SocketOperation::Read);
                }
                Err(err) => return Err(map_io_error(tls_error::READ, err)),
            }
        }
        Ok(SocketOperation::None)
    }

    /// 是否有已解密但尚未交付的明文。
    pub fn has_buffered_data(&self) -> bool {
        self.plaintext_pending > 0
    }

    /// 发送 close_notify 并尽量写出。
    pub fn closing(&mut self) -> Result<SocketOperation> {
        if self.closed || self.state != ConnectState::Connected {
            return Ok(SocketOperation::None);
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(SocketOperation::None);
        };
        if !self.close_notify_sent {
            session.send_close_notify();
            self.close_notify_sent = true;
        }
        match flush(session, &mut self.socket) {
            Ok(true) => Ok(SocketOperation::None),
            Ok(false) => Ok(SocketOperation::Write),
            Err(err) => Err(map_io_error(tls_error::SHUTDOWN, err)),
        }
    }

    /// 释放会话与套接字；幂等。
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.instance.trace().network_enabled(1) {
            debug!(target: NETWORK_TARGET, incoming = self.incoming, "closing tls connection\n{}", self.socket);
        }
        self.closed = true;
        self.session = None;
        self.deadline_at = None;
        self.deadline = None;
        self.socket.close();
    }

    /// 连接信息快照；握手完成前只包含地址信息。
    pub fn info(&self) -> TlsConnectionInfo {
        self.info.clone().unwrap_or_else(|| TlsConnectionInfo {
            base: self.base_info(),
            host: self.host.clone(),
            ..TlsConnectionInfo::default()
        })
    }
}

/// 写出会话中所有待发送的记录；套接字暂不可写时返回 `false`。
fn flush(session: &mut Connection, socket: &mut StreamSocket) -> io::Result<bool> {
    while session.wants_write() {
        match session.write_tls(socket) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

impl fmt::Display for TlsConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.socket, f)
    }
}

impl fmt::Debug for TlsConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnectionState")
            .field("state", &self.state)
            .field("incoming", &self.incoming)
            .field("socket", &self.socket)
            .field("proxy", &self.proxy)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use spark_rpc_transport::{Properties, driver::establish};
    use tokio::net::TcpListener;

    use super::*;
    use crate::transceiver::TlsTransceiver;

    fn instance() -> Arc<TlsInstance> {
        TlsInstance::builder(Properties::new()).build().unwrap()
    }

    #[test]
    fn states_are_ordered() {
        assert!(ConnectState::NeedConnect < ConnectState::ConnectPending);
        assert!(ConnectState::ProxyConnectRequestPending < ConnectState::NeedAuthenticate);
        assert!(ConnectState::AuthenticatePending < ConnectState::Connected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_is_idempotent_until_completion() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let mut state = TlsConnectionState::outgoing(instance(), address, "", None, None, "", -1);

        assert_eq!(state.initialize().unwrap(), SocketOperation::Connect);
        assert_eq!(state.state(), ConnectState::ConnectPending);
        assert_eq!(state.initialize().unwrap(), SocketOperation::Connect);
        assert_eq!(state.state(), ConnectState::ConnectPending);

        std::future::poll_fn(|cx| state.poll_ready(cx, SocketOperation::Connect))
            .await
            .unwrap();
        assert_eq!(state.initialize().unwrap(), SocketOperation::Connect);
        assert_eq!(state.state(), ConnectState::NeedAuthenticate);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn eof_during_handshake_is_connection_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });
        let state = TlsConnectionState::outgoing(instance(), address, "", None, None, "", -1);
        let mut transceiver = TlsTransceiver::new(state);
        let result = establish(&mut transceiver, None).await;
        server.await.unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionLost { .. })));
        assert!(transceiver.connection_state().state() < ConnectState::Connected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn silent_peer_hits_handshake_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });
        let state = TlsConnectionState::outgoing(instance(), address, "", None, None, "", 100);
        let mut transceiver = TlsTransceiver::new(state);
        let result = establish(&mut transceiver, None).await;
        assert!(matches!(result, Err(TransportError::Timeout { .. })));
        assert_eq!(
            transceiver.connection_state().state(),
            ConnectState::AuthenticatePending
        );
        server.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn initialize_after_close_is_a_no_op() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let mut state = TlsConnectionState::outgoing(instance(), address, "", None, None, "", -1);
        state.initialize().unwrap();
        state.close();
        state.close();
        assert_eq!(state.initialize().unwrap(), SocketOperation::None);
        assert!(state.is_closed());
    }
}
