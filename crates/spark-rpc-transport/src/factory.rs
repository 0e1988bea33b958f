use std::{any::Any, cmp::Ordering, fmt, sync::Arc};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;

use crate::{
    BoxFuture,
    acceptor::Acceptor,
    connector::Connector,
    endpoint::{Endpoint, EndpointSelectionType},
    error::{Result, TransportError},
    hash::{HASH_SEED, hash_add_i32},
    options::{for_each_option, require_argument, split_options},
    properties::Properties,
    stream::{ENCAPS_HEADER_LEN, EncodingVersion, InputStream, OutputStream},
};

/// 某一传输种类的端点工厂。
pub trait EndpointFactory: Send + Sync {
    /// 传输种类判别值。
    fn kind(&self) -> i16;

    /// 协议名（文本形式的首个记号）。
    fn protocol(&self) -> &str;

    /// 由已拆分的选项创建端点；`text` 为原始字符串，仅用于诊断。
    fn create(
        &self,
        args: &[String],
        adapter_endpoint: bool,
        text: &str,
    ) -> Result<Arc<dyn Endpoint>>;

    /// 从线上编码读取端点；`input` 位于封装起始处（判别值已被读取）。
    fn read(&self, input: &mut InputStream) -> Result<Arc<dyn Endpoint>>;
}

/// 按判别值与协议名索引的工厂注册表。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 以显式注册表替代全局单例：RPC 运行时初始化时构造一次，把它传递给需要解析端点的组件；
/// - 未知判别值的端点以 [`OpaqueEndpoint`] 原样保留，转发给其他节点时不丢信息。
///
/// ## 契约（What）
/// - `create`：首个记号为 `default` 时使用 `Spark.Default.Protocol`（缺省 `ssl`）；
///   `opaque` 端点若判别值已注册，则解码为具体端点；
/// - `read`：读取 `i16` 判别值，已注册时交给工厂，否则保留为不透明端点。
#[derive(Clone, Default)]
pub struct EndpointFactoryRegistry {
    factories: Vec<Arc<dyn EndpointFactory>>,
    default_protocol: String,
}

impl fmt::Debug for EndpointFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointFactoryRegistry")
            .field(
                "protocols",
                &self.factories.iter().map(|f| f.protocol().to_owned()).collect::<Vec<_>>(),
            )
            .field("default_protocol", &self.default_protocol)
            .finish()
    }
}

impl EndpointFactoryRegistry {
    /// 读取 `Spark.Default.Protocol` 构造空注册表。
    pub fn new(properties: &Properties) -> Self {
        Self {
            factories: Vec::new(),
            default_protocol: properties
                .get_property_with_default("Spark.Default.Protocol", "ssl")
                .to_owned(),
        }
    }

    /// 注册工厂；同一判别值后注册者被忽略。
    pub fn add(&mut self, factory: Arc<dyn EndpointFactory>) {
        if self.get(factory.kind()).is_none() {
            self.factories.push(factory);
        }
    }

    /// 按判别值查找。
    pub fn get(&self, kind: i16) -> Option<&Arc<dyn EndpointFactory>> {
        self.factories.iter().find(|factory| factory.kind() == kind)
    }

    fn by_protocol(&self, protocol: &str) -> Option<&Arc<dyn EndpointFactory>> {
        self.factories
            .iter()
            .find(|factory| factory.protocol() == protocol)
    }

    /// 解析端点文本。
    pub fn create(&self, text: &str, adapter_endpoint: bool) -> Result<Arc<dyn Endpoint>> {
        let args = split_options(text.trim())?;
        let Some((first, rest)) = args.split_first() else {
            return Err(TransportError::endpoint_parse(text, "value has no non-whitespace characters"));
        };
        let protocol = if first == "default" {
            self.default_protocol.as_str()
        } else {
            first.as_str()
        };
        if let Some(factory) = self.by_protocol(protocol) {
            return factory.create(rest, adapter_endpoint, text);
        }
        if protocol == "opaque" {
            let opaque = OpaqueEndpoint::parse(rest, text)?;
            return match self.get(opaque.kind) {
                Some(factory) => {
                    let mut out = OutputStream::new();
                    opaque.encode(&mut out)?;
                    let mut input = InputStream::new(out.finished());
                    input.read_short()?;
                    factory.read(&mut input)
                }
                None => Ok(Arc::new(opaque)),
            };
        }
        Err(TransportError::endpoint_parse(
            text,
            format!("unknown transport protocol `{protocol}`"),
        ))
    }

    /// 从线上编码读取端点。
    pub fn read(&self, input: &mut InputStream) -> Result<Arc<dyn Endpoint>> {
        let kind = input.read_short()?;
        match self.get(kind) {
            Some(factory) => factory.read(input),
            None => Ok(Arc::new(OpaqueEndpoint::read(kind, input)?)),
        }
    }
}

/// 未知传输种类的端点：保留原始封装，可再次编码。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpaqueEndpoint {
    kind: i16,
    encoding: EncodingVersion,
    payload: Bytes,
    hash: i32,
}

impl OpaqueEndpoint {
    pub fn new(kind: i16, encoding: EncodingVersion, payload: Bytes) -> Self {
        let mut hash = hash_add_i32(HASH_SEED, i32::from(kind));
        hash = hash_add_i32(hash, i32::from(encoding.major));
        hash = hash_add_i32(hash, i32::from(encoding.minor));
        for byte in payload.iter() {
            hash = hash_add_i32(hash, i32::from(*byte));
        }
        Self {
            kind,
            encoding,
            payload,
            hash,
        }
    }

    /// 原始负载。
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn encoding(&self) -> EncodingVersion {
        self.encoding
    }

    fn read(kind: i16, input: &mut InputStream) -> Result<Self> {
        let (encoding, payload) = input.read_encapsulation()?;
        Ok(Self::new(kind, encoding, payload))
    }

    /// 解析 `-t <type> -e <major.minor> -v <base64>`。
    fn parse(args: &[String], text: &str) -> Result<Self> {
        let mut kind = None;
        let mut encoding = EncodingVersion::V1_1;
        let mut payload = None;
        for_each_option(args, text, |option, argument| {
            match option {
                "-t" => {
                    let value = require_argument(option, argument, text)?;
                    let parsed = value.parse::<i16>().ok().filter(|kind| *kind >= 0);
                    kind = Some(parsed.ok_or_else(|| {
                        TransportError::endpoint_parse(text, format!("invalid type value `{value}`"))
                    })?);
                }
                "-e" => {
                    let value = require_argument(option, argument, text)?;
                    encoding = parse_encoding(value).ok_or_else(|| {
                        TransportError::endpoint_parse(text, format!("invalid encoding `{value}`"))
                    })?;
                }
                "-v" => {
                    let value = require_argument(option, argument, text)?;
                    payload = Some(STANDARD.decode(value).map_err(|err| {
                        TransportError::endpoint_parse(text, format!("invalid base64 value: {err}"))
                    })?);
                }
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        let kind = kind.ok_or_else(|| TransportError::endpoint_parse(text, "no `-t` option"))?;
        let payload = payload.ok_or_else(|| TransportError::endpoint_parse(text, "no `-v` option"))?;
        Ok(Self::new(kind, encoding, Bytes::from(payload)))
    }
}

fn parse_encoding(value: &str) -> Option<EncodingVersion> {
    let (major, minor) = value.split_once('.')?;
    Some(EncodingVersion {
        major: major.parse().ok()?,
        minor: minor.parse().ok()?,
    })
}

impl fmt::Display for OpaqueEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "opaque -t {} -e {} -v {}",
            self.kind,
            self.encoding,
            STANDARD.encode(&self.payload)
        )
    }
}

impl Endpoint for OpaqueEndpoint {
    fn kind(&self) -> i16 {
        self.kind
    }

    fn protocol(&self) -> &str {
        "opaque"
    }

    fn timeout(&self) -> i32 {
        -1
    }

    fn with_timeout(&self, _timeout: i32) -> Arc<dyn Endpoint> {
        Arc::new(self.clone())
    }

    fn connection_id(&self) -> &str {
        ""
    }

    fn with_connection_id(&self, _connection_id: &str) -> Arc<dyn Endpoint> {
        Arc::new(self.clone())
    }

    fn compress(&self) -> bool {
        false
    }

    fn with_compress(&self, _compress: bool) -> Arc<dyn Endpoint> {
        Arc::new(self.clone())
    }

    fn datagram(&self) -> bool {
        false
    }

    fn secure(&self) -> bool {
        false
    }

    fn encode(&self, out: &mut OutputStream) -> Result<()> {
        out.write_short(self.kind);
        out.write_int((self.payload.len() + ENCAPS_HEADER_LEN) as i32);
        out.write_byte(self.encoding.major);
        out.write_byte(self.encoding.minor);
        out.write_blob(&self.payload);
        Ok(())
    }

    fn hash_code(&self) -> i32 {
        self.hash
    }

    fn equivalent(&self, _other: &dyn Endpoint) -> bool {
        false
    }

    fn compare(&self, other: &dyn Endpoint) -> Ordering {
        let Some(other) = other.as_any().downcast_ref::<OpaqueEndpoint>() else {
            return self.kind.cmp(&other.kind());
        };
        self.kind
            .cmp(&other.kind)
            .then_with(|| self.encoding.cmp(&other.encoding))
            .then_with(|| self.payload.cmp(&other.payload))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn expand(&self) -> Result<Vec<Arc<dyn Endpoint>>> {
        Ok(vec![Arc::new(self.clone())])
    }

    fn connectors(
        &self,
        _selection: EndpointSelectionType,
    ) -> BoxFuture<'static, Result<Vec<Arc<dyn Connector>>>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn connectors_blocking(
        &self,
        _selection: EndpointSelectionType,
    ) -> Result<Vec<Arc<dyn Connector>>> {
        Ok(Vec::new())
    }

    fn acceptor(&self, _adapter_name: &str) -> Result<Box<dyn Acceptor>> {
        Err(TransportError::endpoint_parse(
            self.to_string(),
            "opaque endpoints cannot accept connections",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_is_preserved_verbatim() {
        let registry = EndpointFactoryRegistry::new(&Properties::new());
        let mut out = OutputStream::new();
        out.write_short(99);
        out.start_encapsulation(EncodingVersion::V1_1);
        out.write_string("payload");
        out.end_encapsulation().unwrap();
        let wire = out.finished();

        let mut input = InputStream::new(wire.clone());
        let endpoint = registry.read(&mut input).unwrap();
        assert_eq!(endpoint.kind(), 99);

        let mut again = OutputStream::new();
        endpoint.encode(&mut again).unwrap();
        assert_eq!(again.as_slice(), &wire[..]);
    }

    #[test]
    fn opaque_text_round_trips() {
        let registry = EndpointFactoryRegistry::new(&Properties::new());
        let endpoint = registry.create("opaque -t 99 -e 1.0 -v AAEC", false).unwrap();
        assert_eq!(endpoint.to_string(), "opaque -t 99 -e 1.0 -v AAEC");
        let again = registry.create(&endpoint.to_string(), false).unwrap();
        assert!(*endpoint == *again);
    }

    #[test]
    fn opaque_requires_type_and_value() {
        let registry = EndpointFactoryRegistry::new(&Properties::new());
        assert!(registry.create("opaque -v AAEC", false).is_err());
        assert!(registry.create("opaque -t 99", false).is_err());
        assert!(registry.create("opaque -t 99 -v !!", false).is_err());
    }

    #[test]
    fn unknown_protocol_fails() {
        let registry = EndpointFactoryRegistry::new(&Properties::new());
        let err = registry.create("udp -p 10", false).unwrap_err();
        assert!(err.to_string().contains("unknown transport protocol"));
    }
}
