//! 出站网络代理（SOCKS4 与 HTTP CONNECT）。
//!
//! 代理握手发生在 TCP 建连之后、TLS 握手之前，由收发器状态机驱动：
//! `begin_write` 生成请求 → 写完后 `end_write` 返回 `Read` → `begin_read` 预置读取长度
//! → 每次读后 `end_read` 判断响应是否完整 → `finish` 校验响应。

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use crate::{
    buffer::Buffer,
    endpoint::EndpointSelectionType,
    error::{Result, TransportError},
    network::{self, NetworkSettings, ProtocolSupport},
    operation::SocketOperation,
    properties::Properties,
};

/// 网络代理的协议编解码契约。
pub trait NetworkProxy: fmt::Debug + Send + Sync {
    /// 代理名称，用于日志与错误。
    fn name(&self) -> &'static str;

    /// 代理服务器地址，TCP 建连的实际目标。
    fn address(&self) -> SocketAddr;

    /// 代理能够转发的目标协议族。
    fn protocol_support(&self) -> ProtocolSupport;

    /// 把连接请求写入 `buffer`。
    fn begin_write(&self, target: SocketAddr, buffer: &mut Buffer) -> Result<()>;

    /// 请求写出后的下一步。
    fn end_write(&self, buffer: &Buffer) -> SocketOperation {
        if buffer.has_remaining() {
            SocketOperation::Write
        } else {
            SocketOperation::Read
        }
    }

    /// 为读取响应准备缓冲区。
    fn begin_read(&self, buffer: &mut Buffer);

    /// 一次读取之后判断响应是否完整；不完整时返回 `Read`。
    fn end_read(&self, buffer: &mut Buffer) -> Result<SocketOperation>;

    /// 校验完整响应。
    fn finish(&self, response: &Buffer) -> Result<()>;
}

/// SOCKS4 代理。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Socks4Proxy {
    address: SocketAddr,
}

const SOCKS_RESPONSE_LEN: usize = 8;
const SOCKS_GRANTED: u8 = 0x5a;

impl Socks4Proxy {
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }
}

impl NetworkProxy for Socks4Proxy {
    fn name(&self) -> &'static str {
        "SOCKS"
    }

    fn address(&self) -> SocketAddr {
        self.address
    }

    fn protocol_support(&self) -> ProtocolSupport {
        ProtocolSupport::Ipv4
    }

    fn begin_write(&self, target: SocketAddr, buffer: &mut Buffer) -> Result<()> {
        let IpAddr::V4(ip) = target.ip() else {
            return Err(TransportError::Proxy {
                proxy: self.name(),
                reason: format!("SOCKS4 does not support IPv6 target {target}"),
            });
        };
        buffer.clear();
        buffer.extend_from_slice(&[0x04, 0x01]);
        buffer.extend_from_slice(&target.port().to_be_bytes());
        buffer.extend_from_slice(&ip.octets());
        buffer.extend_from_slice(&[0x00]);
        Ok(())
    }

    fn begin_read(&self, buffer: &mut Buffer) {
        buffer.resize(SOCKS_RESPONSE_LEN);
    }

    fn end_read(&self, buffer: &mut Buffer) -> Result<SocketOperation> {
        Ok(if buffer.has_remaining() {
            SocketOperation::Read
        } else {
            SocketOperation::None
        })
    }

    fn finish(&self, response: &Buffer) -> Result<()> {
        let bytes = response.as_slice();
        if bytes.len() != SOCKS_RESPONSE_LEN || bytes[0] != 0x00 || bytes[1] != SOCKS_GRANTED {
            return Err(TransportError::Proxy {
                proxy: self.name(),
                reason: "SOCKS request rejected".into(),
            });
        }
        Ok(())
    }
}

/// HTTP CONNECT 代理。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpProxy {
    address: SocketAddr,
    protocol: ProtocolSupport,
}

const HTTP_MIN_RESPONSE_LEN: usize = 7;
const HTTP_MAX_RESPONSE_LEN: usize = 8 * 1024;

impl HttpProxy {
    pub fn new(address: SocketAddr, protocol: ProtocolSupport) -> Self {
        Self { address, protocol }
    }
}

impl NetworkProxy for HttpProxy {
    fn name(&self) -> &'static str {
        "HTTP"
    }

    fn address(&self) -> SocketAddr {
        self.address
    }

    fn protocol_support(&self) -> ProtocolSupport {
        self.protocol
    }

    fn begin_write(&self, target: SocketAddr, buffer: &mut Buffer) -> Result<()> {
        let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
        buffer.clear();
        buffer.extend_from_slice(request.as_bytes());
        Ok(())
    }

    fn begin_read(&self, buffer: &mut Buffer) {
        buffer.resize(HTTP_MIN_RESPONSE_LEN);
    }

    fn end_read(&self, buffer: &mut Buffer) -> Result<SocketOperation> {
        if buffer.has_remaining() {
            return Ok(SocketOperation::Read);
        }
        if buffer.as_slice().ends_with(b"\r\n\r\n") {
            return Ok(SocketOperation::None);
        }
        if buffer.len() >= HTTP_MAX_RESPONSE_LEN {
            return Err(TransportError::Proxy {
                proxy: self.name(),
                reason: "response header too large".into(),
            });
        }
        // 逐字节扩展，避免读过响应头吞掉隧道内的首批数据。
        let filled = buffer.len();
        buffer.resize(filled + 1);
        buffer.set_position(filled);
        Ok(SocketOperation::Read)
    }

    fn finish(&self, response: &Buffer) -> Result<()> {
        let text = String::from_utf8_lossy(response.as_slice());
        let status = text
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse::<u16>().ok());
        match status {
            Some(code) if (200..300).contains(&code) => Ok(()),
            Some(code) => Err(TransportError::Proxy {
                proxy: self.name(),
                reason: format!("unexpected status {code}"),
            }),
            None => Err(TransportError::Proxy {
                proxy: self.name(),
                reason: "malformed response".into(),
            }),
        }
    }
}

/// 代理配置：保留主机名，在生成连接器时再解析。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyConfig {
    Socks { host: String, port: u16 },
    Http { host: String, port: u16 },
}

impl ProxyConfig {
    /// 读取 `Spark.SOCKSProxyHost/Port` 或 `Spark.HTTPProxyHost/Port`；SOCKS 优先。
    pub fn from_properties(properties: &Properties) -> Result<Option<Self>> {
        if let Some(host) = properties.get_property("Spark.SOCKSProxyHost") {
            let port = proxy_port(properties, "Spark.SOCKSProxyPort")?;
            return Ok(Some(Self::Socks {
                host: host.to_owned(),
                port,
            }));
        }
        if let Some(host) = properties.get_property("Spark.HTTPProxyHost") {
            let port = proxy_port(properties, "Spark.HTTPProxyPort")?;
            return Ok(Some(Self::Http {
                host: host.to_owned(),
                port,
            }));
        }
        Ok(None)
    }

    fn host_port(&self) -> (&str, u16) {
        match self {
            Self::Socks { host, port } | Self::Http { host, port } => (host, *port),
        }
    }

    fn build(&self, address: SocketAddr, settings: &NetworkSettings) -> Arc<dyn NetworkProxy> {
        match self {
            Self::Socks { .. } => Arc::new(Socks4Proxy::new(address)),
            Self::Http { .. } => Arc::new(HttpProxy::new(address, settings.protocol)),
        }
    }

    /// 同步解析代理地址。
    pub fn resolve_blocking(&self, settings: &NetworkSettings) -> Result<Arc<dyn NetworkProxy>> {
        let (host, port) = self.host_port();
        let addresses =
            network::resolve_blocking(host, port, settings, EndpointSelectionType::Ordered)?;
        self.pick(addresses, settings)
    }

    /// 异步解析代理地址。
    pub async fn resolve(&self, settings: &NetworkSettings) -> Result<Arc<dyn NetworkProxy>> {
        let (host, port) = self.host_port();
        let addresses =
            network::resolve(host, port, settings, EndpointSelectionType::Ordered).await?;
        self.pick(addresses, settings)
    }

    fn pick(
        &self,
        addresses: Vec<SocketAddr>,
        settings: &NetworkSettings,
    ) -> Result<Arc<dyn NetworkProxy>> {
        let (host, _) = self.host_port();
        addresses
            .into_iter()
            .next()
            .map(|address| self.build(address, settings))
            .ok_or_else(|| TransportError::config(host, "proxy host has no usable address"))
    }
}

fn proxy_port(properties: &Properties, key: &str) -> Result<u16> {
    let port = properties.get_property_as_int_with_default(key, 1080)?;
    u16::try_from(port).map_err(|_| TransportError::config(key, format!("invalid port {port}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks4_request_layout() {
        let proxy = Socks4Proxy::new("127.0.0.1:1080".parse().unwrap());
        let mut buf = Buffer::new();
        proxy
            .begin_write("10.1.2.3:4062".parse().unwrap(), &mut buf)
            .unwrap();
        assert_eq!(buf.as_slice(), &[4, 1, 0x0f, 0xde, 10, 1, 2, 3, 0]);
    }

    #[test]
    fn socks4_rejects_ipv6_target() {
        let proxy = Socks4Proxy::new("127.0.0.1:1080".parse().unwrap());
        let mut buf = Buffer::new();
        let err = proxy
            .begin_write("[::1]:4062".parse().unwrap(), &mut buf)
            .unwrap_err();
        assert!(matches!(err, TransportError::Proxy { proxy: "SOCKS", .. }));
    }

    #[test]
    fn socks4_response_validation() {
        let proxy = Socks4Proxy::new("127.0.0.1:1080".parse().unwrap());
        let granted = Buffer::from(vec![0, 0x5a, 0, 0, 0, 0, 0, 0]);
        assert!(proxy.finish(&granted).is_ok());
        let rejected = Buffer::from(vec![0, 0x5b, 0, 0, 0, 0, 0, 0]);
        assert!(proxy.finish(&rejected).is_err());
    }

    #[test]
    fn http_response_grows_until_blank_line() {
        let proxy = HttpProxy::new("127.0.0.1:3128".parse().unwrap(), ProtocolSupport::Both);
        let response = b"HTTP/1.1 200 OK\r\n\r\n";
        let mut buf = Buffer::new();
        proxy.begin_read(&mut buf);

        let mut source: &[u8] = response;
        loop {
            buf.fill_from(&mut source);
            match proxy.end_read(&mut buf).unwrap() {
                SocketOperation::Read => continue,
                SocketOperation::None => break,
                other => panic!("unexpected {other}"),
            }
        }
        assert_eq!(buf.as_slice(), response);
        assert!(proxy.finish(&buf).is_ok());
    }

    #[test]
    fn http_non_success_status_fails() {
        let proxy = HttpProxy::new("127.0.0.1:3128".parse().unwrap(), ProtocolSupport::Both);
        let response = Buffer::from(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n".to_vec());
        let err = proxy.finish(&response).unwrap_err();
        assert!(err.to_string().contains("407"));
    }

    #[test]
    fn socks_takes_precedence() {
        let props = Properties::new()
            .with("Spark.HTTPProxyHost", "http.example")
            .with("Spark.SOCKSProxyHost", "socks.example")
            .with("Spark.SOCKSProxyPort", "9050");
        assert_eq!(
            ProxyConfig::from_properties(&props).unwrap(),
            Some(ProxyConfig::Socks {
                host: "socks.example".into(),
                port: 9050
            })
        );
    }
}
