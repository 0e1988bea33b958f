use std::{
    any::Any,
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use spark_rpc_transport::{
    Connector, NetworkProxy, Result, Transceiver,
    hash::{HASH_SEED, hash_add_i32, hash_add_socket_addr, hash_add_str},
};

use crate::{
    endpoint::KIND, instance::TlsInstance, state::TlsConnectionState,
    transceiver::TlsTransceiver,
};

/// 指向一个已解析地址的 TLS 连接器。
///
/// 主机名只用于 SNI 与主机名校验，不参与相等性。
pub struct TlsConnector {
    instance: Arc<TlsInstance>,
    address: SocketAddr,
    host: String,
    proxy: Option<Arc<dyn NetworkProxy>>,
    source: Option<IpAddr>,
    timeout: i32,
    connection_id: String,
    hash: i32,
}

impl TlsConnector {
    pub fn new(
        instance: Arc<TlsInstance>,
        address: SocketAddr,
        host: String,
        proxy: Option<Arc<dyn NetworkProxy>>,
        source: Option<IpAddr>,
        timeout: i32,
        connection_id: String,
    ) -> Self {
        let mut hash = hash_add_socket_addr(HASH_SEED, &address);
        hash = hash_add_i32(hash, timeout);
        hash = hash_add_str(hash, &connection_id);
        Self {
            instance,
            address,
            host,
            proxy,
            source,
            timeout,
            connection_id,
            hash,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Connector for TlsConnector {
    fn kind(&self) -> i16 {
        KIND
    }

    fn connect(&self) -> Result<Box<dyn Transceiver>> {
        let state = TlsConnectionState::outgoing(
            self.instance.clone(),
            self.address,
            self.host.clone(),
            self.proxy.clone(),
            self.source,
            self.connection_id.clone(),
            self.timeout,
        );
        Ok(Box::new(TlsTransceiver::new(state)))
    }

    fn hash_code(&self) -> i32 {
        self.hash
    }

    fn equals(&self, other: &dyn Connector) -> bool {
        other
            .as_any()
            .downcast_ref::<TlsConnector>()
            .is_some_and(|other| {
                self.timeout == other.timeout
                    && self.connection_id == other.connection_id
                    && self.address == other.address
            })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Display for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {} proxy {}", proxy.name(), proxy.address())?;
        }
        Ok(())
    }
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector")
            .field("address", &self.address)
            .field("host", &self.host)
            .field("proxy", &self.proxy)
            .field("source", &self.source)
            .field("timeout", &self.timeout)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use spark_rpc_transport::Properties;

    use super::*;
    use crate::state::ConnectState;

    fn connector(instance: &Arc<TlsInstance>, host: &str, timeout: i32, id: &str) -> TlsConnector {
        TlsConnector::new(
            instance.clone(),
            "127.0.0.1:4062".parse().unwrap(),
            host.to_owned(),
            None,
            None,
            timeout,
            id.to_owned(),
        )
    }

    #[test]
    fn host_does_not_affect_identity() {
        let instance = TlsInstance::builder(Properties::new()).build().unwrap();
        let a = connector(&instance, "alpha", 10, "");
        let b = connector(&instance, "beta", 10, "");
        assert!(a.equals(&b));
        assert_eq!(a.hash_code(), b.hash_code());

        assert!(!a.equals(&connector(&instance, "alpha", 11, "")));
        assert!(!a.equals(&connector(&instance, "alpha", 10, "pool-2")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_performs_no_io() {
        let instance = TlsInstance::builder(Properties::new()).build().unwrap();
        let transceiver = connector(&instance, "localhost", -1, "").connect().unwrap();
        assert_eq!(transceiver.protocol(), "ssl");
        let info = transceiver.info();
        assert!(!info.incoming);
        assert!(info.local_address.is_none());

        let concrete = TlsTransceiver::new(TlsConnectionState::outgoing(
            instance,
            "127.0.0.1:1".parse().unwrap(),
            "localhost",
            None,
            None,
            "",
            -1,
        ));
        assert_eq!(concrete.connection_state().state(), ConnectState::NeedConnect);
    }
}
