//! 端到端握手：两端各自持有独立的 `TlsInstance`，通过回环地址完成建连、校验与收发。

use std::{fs, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
};
use spark_rpc_transport::{
    Acceptor, Buffer, Connector, Endpoint, EndpointSelectionType, HttpProxy, IpEndpointBase,
    NetworkProxy, Properties, ProtocolSupport, SocketOperation, Socks4Proxy, Transceiver,
    TransportError,
    driver::{establish, read_exact, shutdown, write_all},
};
use spark_rpc_tls::{
    ConnectState, TlsConnectionInfo, TlsConnectionState, TlsEndpoint, TlsInstance, TlsTransceiver,
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing_test::traced_test;

const DEADLINE: Option<Duration> = Some(Duration::from_secs(10));

struct Pki {
    dir: TempDir,
}

impl Pki {
    /// 生成 CA、服务端证书与两张客户端证书（`ClientX`、`Intruder`）。
    fn generate() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name = named("Spark Test CA");
        let ca = ca_params.self_signed(&ca_key).unwrap();
        fs::write(dir.path().join("ca.pem"), ca.pem()).unwrap();

        for (file, cn, sans) in [
            ("server", "Server", vec!["localhost".to_owned(), "127.0.0.1".to_owned()]),
            ("client", "ClientX", Vec::new()),
            ("intruder", "Intruder", Vec::new()),
        ] {
            let key = KeyPair::generate().unwrap();
            let mut params = CertificateParams::new(sans).unwrap();
            params.distinguished_name = named(cn);
            let cert = params.signed_by(&key, &ca, &ca_key).unwrap();
            // 证书文件携带完整链：叶子在前，CA 在后。
            fs::write(
                dir.path().join(format!("{file}.pem")),
                format!("{}{}", cert.pem(), ca.pem()),
            )
            .unwrap();
            fs::write(dir.path().join(format!("{file}_key.pem")), key.serialize_pem()).unwrap();
        }
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn properties(&self, identity: &str) -> Properties {
        Properties::new()
            .with("Spark.Tls.DefaultDir", self.path().display().to_string())
            .with("Spark.Tls.CAs", "ca.pem")
            .with("Spark.Tls.CertFile", format!("{identity}.pem"))
            .with("Spark.Tls.KeyFile", format!("{identity}_key.pem"))
    }
}

fn named(cn: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::OrganizationName, "Spark");
    name.push(DnType::CommonName, cn);
    name
}

fn listen(instance: Arc<TlsInstance>) -> (Box<dyn Acceptor>, Arc<dyn Endpoint>) {
    let endpoint = TlsEndpoint::new(instance, IpEndpointBase::new("127.0.0.1", 0, None, ""), -1, false);
    let mut acceptor = endpoint.acceptor("Adapter").unwrap();
    let effective = acceptor.listen().unwrap();
    (acceptor, effective)
}

fn client_endpoint(instance: Arc<TlsInstance>, server: &Arc<dyn Endpoint>) -> TlsEndpoint {
    let port = server
        .as_any()
        .downcast_ref::<TlsEndpoint>()
        .unwrap()
        .port();
    TlsEndpoint::new(instance, IpEndpointBase::new("127.0.0.1", port, None, ""), -1, false)
}

/// 同时驱动两端握手，返回各自的结果。
async fn handshake(
    server: Properties,
    client: Properties,
) -> (
    Result<Box<dyn Transceiver>, TransportError>,
    Result<Box<dyn Transceiver>, TransportError>,
) {
    let server_instance = TlsInstance::builder(server).build().unwrap();
    let client_instance = TlsInstance::builder(client).build().unwrap();
    let (mut acceptor, effective) = listen(server_instance);

    let server_side = tokio::spawn(async move {
        let mut transceiver = acceptor.accept().await?;
        establish(transceiver.as_mut(), DEADLINE).await?;
        Ok::<_, TransportError>(transceiver)
    });

    let connectors = client_endpoint(client_instance, &effective)
        .connectors(EndpointSelectionType::Ordered)
        .await
        .unwrap();
    let mut client = connectors[0].connect().unwrap();
    let outcome = establish(client.as_mut(), DEADLINE).await;
    let client_result = outcome.map(|()| client);
    let server_result = server_side.await.unwrap();
    (server_result, client_result)
}

#[tokio::test(flavor = "multi_thread")]
async fn mutual_authentication_and_echo() {
    let pki = Pki::generate();
    let (server, client) = handshake(pki.properties("server"), pki.properties("client")).await;
    let mut server = server.unwrap();
    let mut client = client.unwrap();

    assert!(server.info().incoming);
    assert_eq!(server.info().adapter_name, "Adapter");
    assert!(!client.info().incoming);
    assert!(client.to_detailed_string().contains("peer certificates = 2"));

    let message = b"hello over tls";
    let mut outgoing = Buffer::from_slice(message);
    write_all(client.as_mut(), &mut outgoing).await.unwrap();

    let mut incoming = Buffer::with_len(message.len());
    read_exact(server.as_mut(), &mut incoming).await.unwrap();
    assert_eq!(incoming.as_slice(), message);

    let mut reply = Buffer::from_slice(incoming.as_slice());
    write_all(server.as_mut(), &mut reply).await.unwrap();
    let mut echoed = Buffer::with_len(message.len());
    read_exact(client.as_mut(), &mut echoed).await.unwrap();
    assert_eq!(echoed.as_slice(), message);

    shutdown(client.as_mut(), DEADLINE).await.unwrap();
    let mut after = Buffer::with_len(1);
    let err = read_exact(server.as_mut(), &mut after).await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectionLost { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn server_trust_rules_admit_matching_client() {
    let pki = Pki::generate();
    let server = pki
        .properties("server")
        .with("Spark.Tls.TrustOnly.Server", "CN=ClientX");
    let (server, client) = handshake(server, pki.properties("client")).await;
    assert!(server.is_ok());
    assert!(client.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn server_trust_rules_reject_other_clients() {
    let pki = Pki::generate();
    let server = pki
        .properties("server")
        .with("Spark.Tls.TrustOnly.Server", "CN=ClientX");
    let (server, _client) = handshake(server, pki.properties("intruder")).await;
    let err = server.unwrap_err();
    assert!(err.is_security(), "unexpected error: {err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn reject_pattern_overrides_accept() {
    let pki = Pki::generate();
    let server = pki
        .properties("server")
        .with("Spark.Tls.TrustOnly.Server.Adapter", "!O=Spark");
    let (server, _client) = handshake(server, pki.properties("client")).await;
    assert!(server.unwrap_err().is_security());
}

#[tokio::test(flavor = "multi_thread")]
async fn chain_longer_than_depth_limit_is_rejected() {
    let pki = Pki::generate();
    let client = pki
        .properties("client")
        .with("Spark.Tls.VerifyDepthMax", "1");
    let (_server, client) = handshake(pki.properties("server"), client).await;
    let err = client.unwrap_err();
    assert!(err.is_security());
    assert!(err.to_string().contains("exceeds maximum of 1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn client_without_trust_anchors_fails_closed() {
    let pki = Pki::generate();
    let client = Properties::new();
    let (_server, client) = handshake(pki.properties("server"), client).await;
    assert!(client.unwrap_err().is_security());
}

#[tokio::test(flavor = "multi_thread")]
async fn hostname_check_uses_connector_host() {
    let pki = Pki::generate();
    let client = pki
        .properties("client")
        .with("Spark.Tls.CheckCertName", "1");
    let (server, client) = handshake(pki.properties("server"), client).await;
    assert!(server.is_ok());
    assert!(client.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn external_verifier_sees_peer_chain() {
    let pki = Pki::generate();
    let server_instance = TlsInstance::builder(pki.properties("server")).build().unwrap();
    let client_instance = TlsInstance::builder(pki.properties("client"))
        .certificate_verifier(Arc::new(|info: &TlsConnectionInfo| {
            info.verified
                && info
                    .peer_subject()
                    .and_then(Result::ok)
                    .is_some_and(|subject| subject == "CN=Server,O=Spark")
        }))
        .build()
        .unwrap();
    let (mut acceptor, effective) = listen(server_instance);
    let server_side = tokio::spawn(async move {
        let mut transceiver = acceptor.accept().await?;
        establish(transceiver.as_mut(), DEADLINE).await
    });

    let connectors = client_endpoint(client_instance, &effective)
        .connectors_blocking(EndpointSelectionType::Ordered)
        .unwrap();
    let mut client = connectors[0].connect().unwrap();
    establish(client.as_mut(), DEADLINE).await.unwrap();
    server_side.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_info_snapshot_after_handshake() {
    let pki = Pki::generate();
    let server_instance = TlsInstance::builder(pki.properties("server")).build().unwrap();
    let client_instance = TlsInstance::builder(pki.properties("client")).build().unwrap();
    let (mut acceptor, effective) = listen(server_instance);
    let server_side = tokio::spawn(async move {
        let mut transceiver = acceptor.accept().await?;
        let outcome = establish(transceiver.as_mut(), DEADLINE).await;
        outcome.map(|()| transceiver)
    });

    let endpoint = client_endpoint(client_instance.clone(), &effective);
    let address = endpoint
        .connectors_blocking(EndpointSelectionType::Ordered)
        .unwrap()[0]
        .to_string()
        .parse()
        .unwrap();
    let mut client = TlsTransceiver::new(spark_rpc_tls::TlsConnectionState::outgoing(
        client_instance,
        address,
        "127.0.0.1",
        None,
        None,
        "",
        -1,
    ));
    establish(&mut client, DEADLINE).await.unwrap();
    let _server = server_side.await.unwrap().unwrap();

    let info = client.tls_info();
    assert!(info.verified);
    assert_eq!(info.certs.len(), 2);
    assert_eq!(info.host, "127.0.0.1");
    assert!(info.cipher.is_some());
    assert_eq!(info.protocol_version.as_deref(), Some("TLSv1_3"));
    assert_eq!(info.peer_subject().unwrap().unwrap(), "CN=Server,O=Spark");
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn inline_rejection_is_traced_with_connection_context() {
    let pki = Pki::generate();
    let client = Properties::new().with("Spark.Trace.Security", "1");
    let (_server, client) = handshake(pki.properties("server"), client).await;
    assert!(client.unwrap_err().is_security());
    assert!(logs_contain("tls connection rejected"));
    assert!(logs_contain("target_address"));
}

/// 逐步推进状态机，记录每次变化后的阶段。
async fn drive(
    state: &mut TlsConnectionState,
    seen: &mut Vec<ConnectState>,
) -> Result<(), TransportError> {
    seen.push(state.state());
    loop {
        let operation = state.initialize()?;
        if seen.last() != Some(&state.state()) {
            seen.push(state.state());
        }
        if operation == SocketOperation::None {
            return Ok(());
        }
        std::future::poll_fn(|cx| state.poll_ready(cx, operation)).await?;
    }
}

fn server_port(effective: &Arc<dyn Endpoint>) -> u16 {
    effective
        .as_any()
        .downcast_ref::<TlsEndpoint>()
        .unwrap()
        .port()
}

/// 最小的 SOCKS4 代理：校验请求后放行，并在两端之间转发字节。
async fn socks4_relay(listener: TcpListener, expected_target: SocketAddr) {
    let (mut inbound, _) = listener.accept().await.unwrap();
    let mut request = [0u8; 9];
    inbound.read_exact(&mut request).await.unwrap();
    assert_eq!(&request[..2], &[0x04, 0x01]);
    assert_eq!(u16::from_be_bytes([request[2], request[3]]), expected_target.port());
    assert_eq!(&request[4..8], &[127, 0, 0, 1]);
    assert_eq!(request[8], 0);

    let mut outbound = TcpStream::connect(expected_target).await.unwrap();
    inbound.write_all(&[0, 0x5a, 0, 0, 0, 0, 0, 0]).await.unwrap();
    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn socks_proxy_walks_every_connect_state() {
    let pki = Pki::generate();
    let server_instance = TlsInstance::builder(pki.properties("server")).build().unwrap();
    let client_instance = TlsInstance::builder(pki.properties("client")).build().unwrap();
    let (mut acceptor, effective) = listen(server_instance);
    let target = SocketAddr::from(([127, 0, 0, 1], server_port(&effective)));
    let server_side = tokio::spawn(async move {
        let mut transceiver = acceptor.accept().await?;
        let outcome = establish(transceiver.as_mut(), DEADLINE).await;
        outcome.map(|()| transceiver)
    });

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy: Arc<dyn NetworkProxy> = Arc::new(Socks4Proxy::new(proxy_listener.local_addr().unwrap()));
    let relay = tokio::spawn(socks4_relay(proxy_listener, target));

    let mut state = TlsConnectionState::outgoing(
        client_instance,
        target,
        "127.0.0.1",
        Some(proxy),
        None,
        "",
        -1,
    );
    let mut seen = Vec::new();
    drive(&mut state, &mut seen).await.unwrap();
    assert_eq!(
        seen,
        [
            ConnectState::NeedConnect,
            ConnectState::ConnectPending,
            ConnectState::ProxyConnectRequest,
            ConnectState::ProxyConnectRequestPending,
            ConnectState::AuthenticatePending,
            ConnectState::Connected,
        ]
    );
    assert!(state.info().verified);

    let _server = server_side.await.unwrap().unwrap();
    state.close();
    relay.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn http_proxy_refusal_is_proxy_error() {
    let pki = Pki::generate();
    let client_instance = TlsInstance::builder(pki.properties("client")).build().unwrap();

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_address = proxy_listener.local_addr().unwrap();
    let fake_proxy = tokio::spawn(async move {
        let (mut stream, _) = proxy_listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            request.push(byte[0]);
        }
        assert!(request.starts_with(b"CONNECT 127.0.0.1:9 HTTP/1.1\r\n"));
        stream
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();
        // 保持连接直到客户端关闭。
        let _ = stream.read(&mut byte).await;
    });

    let proxy: Arc<dyn NetworkProxy> = Arc::new(HttpProxy::new(proxy_address, ProtocolSupport::Both));
    let mut state = TlsConnectionState::outgoing(
        client_instance,
        SocketAddr::from(([127, 0, 0, 1], 9)),
        "",
        Some(proxy),
        None,
        "",
        -1,
    );
    let mut seen = Vec::new();
    let err = drive(&mut state, &mut seen).await.unwrap_err();
    assert!(matches!(err, TransportError::Proxy { proxy: "HTTP", .. }), "unexpected error: {err}");
    assert_eq!(seen.last(), Some(&ConnectState::ProxyConnectRequestPending));

    state.close();
    assert!(state.is_closed());
    assert_eq!(state.initialize().unwrap(), SocketOperation::None);
    fake_proxy.await.unwrap();
}
