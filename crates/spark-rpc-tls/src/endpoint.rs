use std::{any::Any, cmp::Ordering, fmt, sync::Arc};

use spark_rpc_transport::{
    Acceptor, BoxFuture, Connector, Endpoint, EndpointSelectionType, EncodingVersion, InputStream,
    IpEndpointBase, NetworkProxy, OutputStream, Result, TransportError,
    hash::{HASH_SEED, hash_add_bool, hash_add_i32},
    network,
    options::{for_each_option, require_argument},
};

use crate::{acceptor::TlsAcceptor, connector::TlsConnector, instance::TlsInstance};

/// TLS 传输的种类判别值。
pub const KIND: i16 = 2;

/// TLS 传输的协议名。
pub const PROTOCOL: &str = "ssl";

/// TLS 端点：不可变值对象。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 端点在连接池、代理对象之间以 `Arc<dyn Endpoint>` 共享，任何修改都返回新值；
/// - 解析、序列化、排序与哈希四者必须互相一致，否则连接复用与去重会出错。
///
/// ## 逻辑（How）
/// - 公共的 `-h`、`-p`、`--sourceAddress` 交给 [`IpEndpointBase`]，这里只处理 `-t` 与 `-z`；
/// - 哈希在构造时计算一次并缓存，覆盖全部字段。
///
/// ## 契约（What）
/// - 文本：`ssl [-h <host>] -p <port> [-t <timeout>] [-z] [--sourceAddress <ip>]`，
///   `-t` 为 `-1` 时省略；
/// - 线上：封装 1.1，负载为 `{host, port, timeout, compress}`；
/// - 排序：源地址、端口、超时、连接 ID、压缩、主机。
#[derive(Clone)]
pub struct TlsEndpoint {
    instance: Arc<TlsInstance>,
    base: IpEndpointBase,
    timeout: i32,
    compress: bool,
    hash: i32,
}

impl TlsEndpoint {
    pub fn new(
        instance: Arc<TlsInstance>,
        base: IpEndpointBase,
        timeout: i32,
        compress: bool,
    ) -> Self {
        let hash = hash_add_bool(hash_add_i32(base.hash_into(HASH_SEED), timeout), compress);
        Self {
            instance,
            base,
            timeout,
            compress,
            hash,
        }
    }

    /// 解析协议名之后的选项；`text` 为原始端点串，仅用于错误信息。
    pub fn parse(
        instance: Arc<TlsInstance>,
        args: &[String],
        adapter_endpoint: bool,
        text: &str,
    ) -> Result<Self> {
        let mut base = IpEndpointBase::default();
        let mut timeout = -1;
        let mut compress = false;
        for_each_option(args, text, |option, argument| match option {
            "-t" => {
                let value = require_argument(option, argument, text)?;
                timeout = parse_timeout(value).ok_or_else(|| {
                    TransportError::endpoint_parse(text, format!("invalid timeout value `{value}`"))
                })?;
                Ok(true)
            }
            "-z" => {
                if let Some(value) = argument {
                    return Err(TransportError::endpoint_parse(
                        text,
                        format!("unexpected argument `{value}` provided for `-z` option"),
                    ));
                }
                compress = true;
                Ok(true)
            }
            _ => base.check_option(option, argument, text, adapter_endpoint),
        })?;
        if !base.host_was_set() {
            base.host = instance.default_host().to_owned();
        }
        Ok(Self::new(instance, base, timeout, compress))
    }

    /// 读取封装负载；判别值已由调用方读取。
    pub fn read(instance: Arc<TlsInstance>, input: &mut InputStream) -> Result<Self> {
        input.start_encapsulation()?;
        let host = input.read_string()?;
        let port = input.read_int()?;
        let port = u16::try_from(port)
            .map_err(|_| TransportError::Marshal(format!("invalid port {port}")))?;
        let timeout = input.read_int()?;
        let compress = input.read_bool()?;
        input.end_encapsulation()?;
        Ok(Self::new(
            instance,
            IpEndpointBase::new(host, port, None, ""),
            timeout,
            compress,
        ))
    }

    pub fn host(&self) -> &str {
        &self.base.host
    }

    pub fn port(&self) -> u16 {
        self.base.port
    }

    pub fn base(&self) -> &IpEndpointBase {
        &self.base
    }

    pub fn instance(&self) -> &Arc<TlsInstance> {
        &self.instance
    }

    fn with_base(&self, base: IpEndpointBase) -> Self {
        Self::new(self.instance.clone(), base, self.timeout, self.compress)
    }

    /// 绑定完成后用系统分配的端口生成有效端点。
    pub(crate) fn with_port(&self, port: u16) -> Self {
        let mut base = self.base.clone();
        base.port = port;
        self.with_base(base)
    }

    fn make_connectors(
        &self,
        addresses: Vec<std::net::SocketAddr>,
        proxy: Option<Arc<dyn NetworkProxy>>,
    ) -> Vec<Arc<dyn Connector>> {
        addresses
            .into_iter()
            .map(|address| {
                Arc::new(TlsConnector::new(
                    self.instance.clone(),
                    address,
                    self.base.host.clone(),
                    proxy.clone(),
                    self.base.source_address,
                    self.timeout,
                    self.base.connection_id.clone(),
                )) as Arc<dyn Connector>
            })
            .collect()
    }
}

fn parse_timeout(value: &str) -> Option<i32> {
    if value == "infinite" {
        return Some(-1);
    }
    value.parse().ok()
}

impl fmt::Display for TlsEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(PROTOCOL)?;
        let options = self.base.options_string();
        // `--sourceAddress` 固定放在最后，与解析顺序无关。
        let (common, source) = match options.find(" --sourceAddress ") {
            Some(index) => options.split_at(index),
            None => (options.as_str(), ""),
        };
        f.write_str(common)?;
        if self.timeout != -1 {
            write!(f, " -t {}", self.timeout)?;
        }
        if self.compress {
            f.write_str(" -z")?;
        }
        f.write_str(source)
    }
}

impl fmt::Debug for TlsEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsEndpoint")
            .field("base", &self.base)
            .field("timeout", &self.timeout)
            .field("compress", &self.compress)
            .finish()
    }
}

impl PartialEq for TlsEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_fields(other) == Ordering::Equal
    }
}

impl Eq for TlsEndpoint {}

impl TlsEndpoint {
    fn cmp_fields(&self, other: &Self) -> Ordering {
        self.base
            .compare_base(&other.base)
            .then_with(|| self.base.port.cmp(&other.base.port))
            .then_with(|| self.timeout.cmp(&other.timeout))
            .then_with(|| self.base.connection_id.cmp(&other.base.connection_id))
            .then_with(|| self.compress.cmp(&other.compress))
            .then_with(|| self.base.host.cmp(&other.base.host))
    }
}

impl Endpoint for TlsEndpoint {
    fn kind(&self) -> i16 {
        KIND
    }

    fn protocol(&self) -> &str {
        PROTOCOL
    }

    fn timeout(&self) -> i32 {
        self.timeout
    }

    fn with_timeout(&self, timeout: i32) -> Arc<dyn Endpoint> {
        Arc::new(Self::new(
            self.instance.clone(),
            self.base.clone(),
            timeout,
            self.compress,
        ))
    }

    fn connection_id(&self) -> &str {
        &self.base.connection_id
    }

    fn with_connection_id(&self, connection_id: &str) -> Arc<dyn Endpoint> {
        let mut base = self.base.clone();
        base.connection_id = connection_id.to_owned();
        Arc::new(self.with_base(base))
    }

    fn compress(&self) -> bool {
        self.compress
    }

    fn with_compress(&self, compress: bool) -> Arc<dyn Endpoint> {
        Arc::new(Self::new(
            self.instance.clone(),
            self.base.clone(),
            self.timeout,
            compress,
        ))
    }

    fn datagram(&self) -> bool {
        false
    }

    fn secure(&self) -> bool {
        true
    }

    fn encode(&self, out: &mut OutputStream) -> Result<()> {
        out.write_short(KIND);
        out.start_encapsulation(EncodingVersion::V1_1);
        out.write_string(&self.base.host);
        out.write_int(i32::from(self.base.port));
        out.write_int(self.timeout);
        out.write_bool(self.compress);
        out.end_encapsulation()
    }

    fn hash_code(&self) -> i32 {
        self.hash
    }

    fn equivalent(&self, other: &dyn Endpoint) -> bool {
        other
            .as_any()
            .downcast_ref::<TlsEndpoint>()
            .is_some_and(|other| self.base.host == other.base.host && self.base.port == other.base.port)
    }

    fn compare(&self, other: &dyn Endpoint) -> Ordering {
        match other.as_any().downcast_ref::<TlsEndpoint>() {
            Some(other) => self.cmp_fields(other),
            None => KIND.cmp(&other.kind()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn expand(&self) -> Result<Vec<Arc<dyn Endpoint>>> {
        if !self.base.host.is_empty() {
            return Ok(vec![Arc::new(self.clone())]);
        }
        let addresses =
            network::expand_wildcard(self.instance.interfaces(), self.instance.settings().protocol)?;
        Ok(addresses
            .into_iter()
            .map(|address| {
                let mut base = self.base.clone();
                base.host = address.to_string();
                Arc::new(self.with_base(base)) as Arc<dyn Endpoint>
            })
            .collect())
    }

    fn connectors(
        &self,
        selection: EndpointSelectionType,
    ) -> BoxFuture<'static, Result<Vec<Arc<dyn Connector>>>> {
        let endpoint = self.clone();
        Box::pin(async move {
            let settings = endpoint.instance.settings();
            let addresses =
                network::resolve(&endpoint.base.host, endpoint.base.port, settings, selection)
                    .await?;
            let proxy = match endpoint.instance.proxy() {
                Some(proxy) => Some(proxy.resolve(settings).await?),
                None => None,
            };
            Ok(endpoint.make_connectors(addresses, proxy))
        })
    }

    fn connectors_blocking(
        &self,
        selection: EndpointSelectionType,
    ) -> Result<Vec<Arc<dyn Connector>>> {
        let settings = self.instance.settings();
        let addresses =
            network::resolve_blocking(&self.base.host, self.base.port, settings, selection)?;
        let proxy = self
            .instance
            .proxy()
            .map(|proxy| proxy.resolve_blocking(settings))
            .transpose()?;
        Ok(self.make_connectors(addresses, proxy))
    }

    fn acceptor(&self, adapter_name: &str) -> Result<Box<dyn Acceptor>> {
        Ok(Box::new(TlsAcceptor::new(self.clone(), adapter_name)))
    }
}
