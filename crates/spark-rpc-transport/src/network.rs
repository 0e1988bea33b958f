//! 地址解析、本地接口枚举与监听绑定。

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
};

use rand::seq::SliceRandom;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::{
    endpoint::EndpointSelectionType,
    error::{CONFIGURE, Result, TransportError},
    properties::Properties,
};

/// 协议族支持。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProtocolSupport {
    Ipv4,
    Ipv6,
    #[default]
    Both,
}

impl ProtocolSupport {
    /// 地址是否属于受支持的协议族。
    pub fn accepts(self, address: &IpAddr) -> bool {
        match self {
            ProtocolSupport::Ipv4 => address.is_ipv4(),
            ProtocolSupport::Ipv6 => address.is_ipv6(),
            ProtocolSupport::Both => true,
        }
    }
}

/// 网络层设置，初始化时从属性中读取一次。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkSettings {
    pub protocol: ProtocolSupport,
    pub prefer_ipv6: bool,
    pub backlog: i32,
    pub rcv_size: Option<usize>,
    pub snd_size: Option<usize>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            protocol: ProtocolSupport::Both,
            prefer_ipv6: false,
            backlog: 511,
            rcv_size: None,
            snd_size: None,
        }
    }
}

impl NetworkSettings {
    /// 读取 `Spark.IPv4`、`Spark.IPv6`、`Spark.PreferIPv6Address` 与 `Spark.TCP.*`。
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let ipv4 = properties.get_property_as_int_with_default("Spark.IPv4", 1)? > 0;
        let ipv6 = properties.get_property_as_int_with_default("Spark.IPv6", 1)? > 0;
        let protocol = match (ipv4, ipv6) {
            (true, true) => ProtocolSupport::Both,
            (true, false) => ProtocolSupport::Ipv4,
            (false, true) => ProtocolSupport::Ipv6,
            (false, false) => {
                return Err(TransportError::config(
                    "Spark.IPv4",
                    "both IPv4 and IPv6 support are disabled",
                ));
            }
        };
        Ok(Self {
            protocol,
            prefer_ipv6: properties.get_property_as_int("Spark.PreferIPv6Address")? > 0,
            backlog: properties.get_property_as_int_with_default("Spark.TCP.Backlog", 511)?,
            rcv_size: buffer_size(properties, "Spark.TCP.RcvSize")?,
            snd_size: buffer_size(properties, "Spark.TCP.SndSize")?,
        })
    }

    /// 回环地址（空主机时使用）。
    pub fn loopback(&self) -> IpAddr {
        match self.protocol {
            ProtocolSupport::Ipv6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
            _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    /// 通配地址（监听空主机时使用）；同时支持两族时选择 IPv6 双栈。
    pub fn wildcard(&self) -> IpAddr {
        match self.protocol {
            ProtocolSupport::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            _ => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// 过滤并排序解析结果。
    pub fn order_addresses(
        &self,
        addresses: impl IntoIterator<Item = SocketAddr>,
        selection: EndpointSelectionType,
    ) -> Vec<SocketAddr> {
        let mut result: Vec<SocketAddr> = Vec::new();
        for address in addresses {
            if self.protocol.accepts(&address.ip()) && !result.contains(&address) {
                result.push(address);
            }
        }
        if selection == EndpointSelectionType::Random {
            result.shuffle(&mut rand::thread_rng());
        }
        if self.prefer_ipv6 {
            result.sort_by_key(|address| !address.is_ipv6());
        } else {
            result.sort_by_key(|address| address.is_ipv6());
        }
        result
    }
}

fn buffer_size(properties: &Properties, key: &str) -> Result<Option<usize>> {
    let value = properties.get_property_as_int(key)?;
    Ok(usize::try_from(value).ok().filter(|size| *size > 0))
}

/// 同步解析主机；空主机解析为回环地址。
pub fn resolve_blocking(
    host: &str,
    port: u16,
    settings: &NetworkSettings,
    selection: EndpointSelectionType,
) -> Result<Vec<SocketAddr>> {
    let addresses: Vec<SocketAddr> = if host.is_empty() {
        vec![SocketAddr::new(settings.loopback(), port)]
    } else {
        (host, port)
            .to_socket_addrs()
            .map_err(|source| TransportError::Dns {
                host: host.to_owned(),
                source,
            })?
            .collect()
    };
    finish_resolution(host, addresses, settings, selection)
}

/// 异步解析主机；语义与 [`resolve_blocking`] 一致。
pub async fn resolve(
    host: &str,
    port: u16,
    settings: &NetworkSettings,
    selection: EndpointSelectionType,
) -> Result<Vec<SocketAddr>> {
    let addresses: Vec<SocketAddr> = if host.is_empty() {
        vec![SocketAddr::new(settings.loopback(), port)]
    } else {
        tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| TransportError::Dns {
                host: host.to_owned(),
                source,
            })?
            .collect()
    };
    finish_resolution(host, addresses, settings, selection)
}

fn finish_resolution(
    host: &str,
    addresses: Vec<SocketAddr>,
    settings: &NetworkSettings,
    selection: EndpointSelectionType,
) -> Result<Vec<SocketAddr>> {
    let ordered = settings.order_addresses(addresses, selection);
    if ordered.is_empty() {
        return Err(TransportError::Dns {
            host: host.to_owned(),
            source: io::Error::new(
                io::ErrorKind::NotFound,
                "no address of a supported protocol family",
            ),
        });
    }
    Ok(ordered)
}

/// 本地接口枚举。
///
/// 默认实现 [`SystemInterfaces`] 基于 `if-addrs`；测试或受限环境可注入自定义实现。
pub trait NetworkInterfaces: Send + Sync {
    /// 返回受支持协议族的本地地址；`include_loopback` 为假时排除回环地址。
    fn local_addresses(
        &self,
        protocol: ProtocolSupport,
        include_loopback: bool,
    ) -> Result<Vec<IpAddr>>;
}

/// 通过操作系统枚举网络接口。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemInterfaces;

impl NetworkInterfaces for SystemInterfaces {
    fn local_addresses(
        &self,
        protocol: ProtocolSupport,
        include_loopback: bool,
    ) -> Result<Vec<IpAddr>> {
        let interfaces = if_addrs::get_if_addrs()
            .map_err(|err| TransportError::from_io(CONFIGURE, err))?;
        let mut addresses = Vec::new();
        for interface in interfaces {
            let ip = interface.ip();
            if !protocol.accepts(&ip) || (!include_loopback && interface.is_loopback()) {
                continue;
            }
            if !addresses.contains(&ip) {
                addresses.push(ip);
            }
        }
        Ok(addresses)
    }
}

/// 通配主机展开：优先非回环地址，没有时回退到回环地址。
pub fn expand_wildcard(
    interfaces: &dyn NetworkInterfaces,
    protocol: ProtocolSupport,
) -> Result<Vec<IpAddr>> {
    let addresses = interfaces.local_addresses(protocol, false)?;
    if !addresses.is_empty() {
        return Ok(addresses);
    }
    interfaces.local_addresses(protocol, true)
}

/// 创建监听套接字。
///
/// # 教案级注释
///
/// ## 逻辑（How）
/// - `socket2` 负责 `SO_REUSEADDR`、IPv6 双栈与 backlog 等 Tokio 不直接暴露的选项；
/// - 绑定完成后切换为非阻塞，再交给 [`TcpListener::from_std`] 注册到当前运行时。
///
/// ## 契约（What）
/// - 任何一步失败都映射为 [`TransportError::SocketBind`]，携带目标地址；
/// - 必须在 Tokio 运行时上下文中调用。
pub fn bind_listener(address: SocketAddr, settings: &NetworkSettings) -> Result<TcpListener> {
    let bind_error = |source: io::Error| TransportError::SocketBind { address, source };
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_error)?;
    #[cfg(not(windows))]
    socket.set_reuse_address(true).map_err(bind_error)?;
    if address.is_ipv6() && address.ip().is_unspecified() {
        socket.set_only_v6(false).map_err(bind_error)?;
    }
    if let Some(size) = settings.rcv_size {
        socket.set_recv_buffer_size(size).map_err(bind_error)?;
    }
    socket.bind(&address.into()).map_err(bind_error)?;
    socket.listen(settings.backlog).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    TcpListener::from_std(socket.into()).map_err(bind_error)
}

/// 对已建立的流应用缓冲区大小与 `TCP_NODELAY`。
pub fn configure_stream(stream: &TcpStream, settings: &NetworkSettings) -> Result<()> {
    stream
        .set_nodelay(true)
        .map_err(|err| TransportError::from_io(CONFIGURE, err))?;
    let socket = SockRef::from(stream);
    if let Some(size) = settings.rcv_size {
        socket
            .set_recv_buffer_size(size)
            .map_err(|err| TransportError::from_io(CONFIGURE, err))?;
    }
    if let Some(size) = settings.snd_size {
        socket
            .set_send_buffer_size(size)
            .map_err(|err| TransportError::from_io(CONFIGURE, err))?;
    }
    Ok(())
}

/// 读取实际生效的收发缓冲区大小。
pub fn buffer_sizes(stream: &TcpStream) -> (Option<usize>, Option<usize>) {
    let socket = SockRef::from(stream);
    (
        socket.recv_buffer_size().ok(),
        socket.send_buffer_size().ok(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedInterfaces {
        addresses: Vec<(IpAddr, bool)>,
    }

    impl NetworkInterfaces for FixedInterfaces {
        fn local_addresses(
            &self,
            protocol: ProtocolSupport,
            include_loopback: bool,
        ) -> Result<Vec<IpAddr>> {
            Ok(self
                .addresses
                .iter()
                .filter(|(ip, loopback)| protocol.accepts(ip) && (include_loopback || !loopback))
                .map(|(ip, _)| *ip)
                .collect())
        }
    }

    #[test]
    fn settings_reject_disabling_both_families() {
        let props = Properties::new()
            .with("Spark.IPv4", "0")
            .with("Spark.IPv6", "0");
        assert!(NetworkSettings::from_properties(&props).is_err());
    }

    #[test]
    fn ordered_selection_puts_preferred_family_first() {
        let settings = NetworkSettings {
            prefer_ipv6: true,
            ..NetworkSettings::default()
        };
        let v4: SocketAddr = "127.0.0.1:10".parse().unwrap();
        let v6: SocketAddr = "[::1]:10".parse().unwrap();
        let ordered = settings.order_addresses([v4, v6, v4], EndpointSelectionType::Ordered);
        assert_eq!(ordered, vec![v6, v4]);
    }

    #[test]
    fn protocol_filter_drops_unsupported_family() {
        let settings = NetworkSettings {
            protocol: ProtocolSupport::Ipv4,
            ..NetworkSettings::default()
        };
        let v6: SocketAddr = "[::1]:10".parse().unwrap();
        assert!(settings
            .order_addresses([v6], EndpointSelectionType::Random)
            .is_empty());
    }

    #[test]
    fn empty_host_resolves_to_loopback() {
        let settings = NetworkSettings::default();
        let addresses =
            resolve_blocking("", 4062, &settings, EndpointSelectionType::Ordered).unwrap();
        assert_eq!(addresses, vec!["127.0.0.1:4062".parse().unwrap()]);
    }

    #[test]
    fn wildcard_expansion_falls_back_to_loopback() {
        let only_loopback = FixedInterfaces {
            addresses: vec![(IpAddr::V4(Ipv4Addr::LOCALHOST), true)],
        };
        assert_eq!(
            expand_wildcard(&only_loopback, ProtocolSupport::Both).unwrap(),
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
        );

        let mixed = FixedInterfaces {
            addresses: vec![
                (IpAddr::V4(Ipv4Addr::LOCALHOST), true),
                (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), false),
            ],
        };
        assert_eq!(
            expand_wildcard(&mixed, ProtocolSupport::Both).unwrap(),
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bind_port_zero_yields_assigned_port() {
        let settings = NetworkSettings::default();
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), &settings).unwrap();
        let local = listener.local_addr().unwrap();
        assert_ne!(local.port(), 0);

        let err = bind_listener(local, &settings).unwrap_err();
        assert!(matches!(err, TransportError::SocketBind { address, .. } if address == local));
    }
}
