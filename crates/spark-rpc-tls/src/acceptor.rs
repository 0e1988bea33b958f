use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use spark_rpc_transport::{
    Acceptor, BoxFuture, Endpoint, EndpointSelectionType, Result, Transceiver, TransportError,
    error::ACCEPT, network, trace::NETWORK_TARGET,
};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::{endpoint::TlsEndpoint, state::TlsConnectionState, transceiver::TlsTransceiver};

/// TLS 监听端。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - `listen` 之前 [`endpoint`](Acceptor::endpoint) 返回配置端点，之后返回带实际端口的有效端点；
/// - `accept` 产出的收发器停在 `NeedAuthenticate`，握手由就绪循环推进；
/// - 握手时限取端点超时，未配置时退回 `Spark.Tls.HandshakeTimeout`。
///
/// ## 风险与权衡（Trade-offs）
/// - 主机名形式的监听地址只取解析结果中的第一个；需要多地址监听时应先 `expand`。
pub struct TlsAcceptor {
    endpoint: TlsEndpoint,
    adapter_name: String,
    listener: Option<TcpListener>,
    address: Option<SocketAddr>,
}

impl TlsAcceptor {
    pub fn new(endpoint: TlsEndpoint, adapter_name: impl Into<String>) -> Self {
        Self {
            endpoint,
            adapter_name: adapter_name.into(),
            listener: None,
            address: None,
        }
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// 已绑定的监听地址。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.address
    }

    fn bind_address(&self) -> Result<SocketAddr> {
        let settings = self.endpoint.instance().settings();
        let host = self.endpoint.host();
        let port = self.endpoint.port();
        if host.is_empty() {
            return Ok(SocketAddr::new(settings.wildcard(), port));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        network::resolve_blocking(host, port, settings, EndpointSelectionType::Ordered)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::config(host, "listen host has no usable address"))
    }
}

impl Acceptor for TlsAcceptor {
    fn listen(&mut self) -> Result<Arc<dyn Endpoint>> {
        let address = self.bind_address()?;
        let listener = network::bind_listener(address, self.endpoint.instance().settings())?;
        let bound = listener
            .local_addr()
            .map_err(|err| TransportError::SocketBind {
                address,
                source: err,
            })?;
        self.endpoint = self.endpoint.with_port(bound.port());
        self.address = Some(bound);
        self.listener = Some(listener);
        if self.endpoint.instance().trace().network_enabled(1) {
            info!(
                target: NETWORK_TARGET,
                adapter = %self.adapter_name,
                local_address = %bound,
                "listening for ssl connections"
            );
        }
        Ok(Arc::new(self.endpoint.clone()))
    }

    fn accept(&mut self) -> BoxFuture<'_, Result<Box<dyn Transceiver>>> {
        Box::pin(async move {
            let Some(listener) = self.listener.as_ref() else {
                return Err(TransportError::connection_lost());
            };
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|err| TransportError::from_io(ACCEPT, err))?;
            let instance = self.endpoint.instance().clone();
            if instance.trace().network_enabled(2) {
                debug!(
                    target: NETWORK_TARGET,
                    adapter = %self.adapter_name,
                    remote_address = %peer,
                    "accepted ssl connection"
                );
            }
            let state = TlsConnectionState::incoming(
                instance,
                stream,
                self.adapter_name.clone(),
                self.endpoint.timeout(),
            )?;
            Ok(Box::new(TlsTransceiver::new(state)) as Box<dyn Transceiver>)
        })
    }

    fn close(&mut self) {
        if self.listener.take().is_some() && self.endpoint.instance().trace().network_enabled(1) {
            info!(
                target: NETWORK_TARGET,
                adapter = %self.adapter_name,
                local_address = ?self.address,
                "stopping to accept ssl connections"
            );
        }
    }

    fn endpoint(&self) -> Arc<dyn Endpoint> {
        Arc::new(self.endpoint.clone())
    }

    fn protocol(&self) -> &str {
        crate::endpoint::PROTOCOL
    }

    fn to_detailed_string(&self) -> String {
        let mut text = format!("local address = {self}");
        let addresses = if self.endpoint.host().is_empty() {
            network::expand_wildcard(
                self.endpoint.instance().interfaces(),
                self.endpoint.instance().settings().protocol,
            )
            .unwrap_or_default()
        } else {
            Vec::new()
        };
        if !addresses.is_empty() {
            let listed: Vec<String> = addresses.iter().map(ToString::to_string).collect();
            text.push_str(&format!("\nlocal interfaces = {}", listed.join(", ")));
        }
        text
    }
}

impl fmt::Display for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(address) => write!(f, "{address}"),
            None => write!(f, "{}", self.endpoint),
        }
    }
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor")
            .field("endpoint", &self.endpoint)
            .field("adapter_name", &self.adapter_name)
            .field("address", &self.address)
            .finish()
    }
}
