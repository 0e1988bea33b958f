use std::{
    fmt,
    task::{Context, Poll},
};

use spark_rpc_transport::{Buffer, ConnectionInfo, Result, SocketOperation, Transceiver};

use crate::{connection_info::TlsConnectionInfo, state::TlsConnectionState};

/// TLS 收发器：把 [`Transceiver`] 契约委托给独占的 [`TlsConnectionState`]。
pub struct TlsTransceiver {
    state: TlsConnectionState,
}

impl TlsTransceiver {
    pub fn new(state: TlsConnectionState) -> Self {
        Self { state }
    }

    pub fn connection_state(&self) -> &TlsConnectionState {
        &self.state
    }

    /// 带证书链与协商参数的连接信息快照。
    pub fn tls_info(&self) -> TlsConnectionInfo {
        self.state.info()
    }
}

impl Transceiver for TlsTransceiver {
    fn protocol(&self) -> &str {
        crate::endpoint::PROTOCOL
    }

    fn initialize(&mut self) -> Result<SocketOperation> {
        self.state.initialize()
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>, operation: SocketOperation) -> Poll<Result<()>> {
        self.state.poll_ready(cx, operation)
    }

    /// TLS 双方都以 close_notify 结束会话，与谁先发起无关。
    fn closing(&mut self, _initiator: bool) -> Result<SocketOperation> {
        self.state.closing()
    }

    fn close(&mut self) {
        self.state.close();
    }

    fn write(&mut self, buffer: &mut Buffer) -> Result<SocketOperation> {
        self.state.write(buffer)
    }

    fn read(&mut self, buffer: &mut Buffer) -> Result<SocketOperation> {
        self.state.read(buffer)
    }

    fn has_buffered_data(&self) -> bool {
        self.state.has_buffered_data()
    }

    fn info(&self) -> ConnectionInfo {
        self.state.info().base
    }

    fn to_detailed_string(&self) -> String {
        let info = self.state.info();
        let mut text = self.state.to_string();
        if let Some(protocol) = &info.protocol_version {
            text.push_str(&format!("\nprotocol = {protocol}"));
        }
        if let Some(cipher) = &info.cipher {
            text.push_str(&format!("\ncipher = {cipher}"));
        }
        text.push_str(&format!("\npeer certificates = {}", info.certs.len()));
        text
    }
}

impl fmt::Display for TlsTransceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.state, f)
    }
}

impl fmt::Debug for TlsTransceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsTransceiver")
            .field("state", &self.state)
            .finish()
    }
}
