use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use rustls::SupportedProtocolVersion;
use spark_rpc_transport::{Properties, Result, TransportError};

/// 证书存储位置。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreLocation {
    CurrentUser,
    LocalMachine,
}

impl StoreLocation {
    /// 解析位置名（大小写不敏感）。
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("CurrentUser") {
            Some(Self::CurrentUser)
        } else if value.eq_ignore_ascii_case("LocalMachine") {
            Some(Self::LocalMachine)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CurrentUser => "CurrentUser",
            Self::LocalMachine => "LocalMachine",
        }
    }
}

/// 一条 `FindCert` 或 `ImportCert` 配置。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreDirective {
    /// 原始属性名，用于错误诊断。
    pub property: String,
    pub location: StoreLocation,
    pub store: String,
    /// 查询表达式或导入参数。
    pub value: String,
}

/// 允许协商的 TLS 协议版本。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolSet {
    pub tls12: bool,
    pub tls13: bool,
}

impl Default for ProtocolSet {
    fn default() -> Self {
        Self {
            tls12: true,
            tls13: true,
        }
    }
}

impl ProtocolSet {
    fn parse(property: &str, items: &[String]) -> Result<Self> {
        if items.is_empty() {
            return Ok(Self::default());
        }
        let mut set = Self {
            tls12: false,
            tls13: false,
        };
        for item in items {
            let normalized = item.to_ascii_lowercase().replace(['.', '-'], "_");
            match normalized.as_str() {
                "tls1_2" | "tlsv1_2" => set.tls12 = true,
                "tls1_3" | "tlsv1_3" => set.tls13 = true,
                "ssl3" | "sslv3" | "tls1" | "tls1_0" | "tlsv1" | "tlsv1_0" | "tls1_1" | "tlsv1_1" => {
                    return Err(TransportError::config(
                        property,
                        format!("protocol `{item}` is no longer supported"),
                    ));
                }
                _ => {
                    return Err(TransportError::config(
                        property,
                        format!("unrecognized protocol `{item}`"),
                    ));
                }
            }
        }
        Ok(set)
    }

    /// 转换为 `rustls` 版本列表。
    pub fn versions(&self) -> Vec<&'static SupportedProtocolVersion> {
        let mut versions = Vec::with_capacity(2);
        if self.tls13 {
            versions.push(&rustls::version::TLS13);
        }
        if self.tls12 {
            versions.push(&rustls::version::TLS12);
        }
        versions
    }
}

/// TLS 插件配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 插件初始化时一次性读取所有 `Spark.Tls.*` 属性并校验，配置错误在此立即暴露，
///   后续连接只读取已解析的值。
///
/// ## 契约（What）
/// - 整数属性非法、协议名未知、存储位置未知均返回携带属性名的 [`TransportError::Config`]；
/// - `verify_peer` 与 `check_crl` 只接受 0/1/2；
/// - 文件路径保持原样，解析时再通过 [`TlsConfig::resolve_path`] 结合 `DefaultDir` 查找。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsConfig {
    pub default_dir: Option<PathBuf>,
    pub protocols: ProtocolSet,
    pub check_cert_name: bool,
    pub verify_depth_max: usize,
    pub verify_peer: u8,
    pub check_crl: u8,
    pub revocation_lists: Vec<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub password: Option<String>,
    pub find_cert: Vec<StoreDirective>,
    pub import_cert: Vec<StoreDirective>,
    pub cert_store_root: PathBuf,
    pub cas: Option<String>,
    pub use_platform_cas: bool,
    pub handshake_timeout: Option<Duration>,
}

impl TlsConfig {
    /// 读取并校验全部 `Spark.Tls.*` 属性。
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let default_dir = properties
            .get_property("Spark.Tls.DefaultDir")
            .map(PathBuf::from);
        let protocols = ProtocolSet::parse(
            "Spark.Tls.Protocols",
            &properties.get_property_as_list("Spark.Tls.Protocols"),
        )?;
        let verify_depth_max =
            properties.get_property_as_int_with_default("Spark.Tls.VerifyDepthMax", 3)?;
        let verify_depth_max = usize::try_from(verify_depth_max).map_err(|_| {
            TransportError::config("Spark.Tls.VerifyDepthMax", "value must not be negative")
        })?;
        let verify_peer = level(properties, "Spark.Tls.VerifyPeer", 2)?;
        let check_crl = level(properties, "Spark.Tls.CheckCRL", 0)?;
        let handshake_timeout =
            properties.get_property_as_int_with_default("Spark.Tls.HandshakeTimeout", 10_000)?;
        let handshake_timeout = u64::try_from(handshake_timeout)
            .ok()
            .filter(|millis| *millis > 0)
            .map(Duration::from_millis);
        let cert_store_root = properties
            .get_property("Spark.Tls.CertStoreRoot")
            .map(PathBuf::from)
            .or_else(|| default_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            protocols,
            check_cert_name: properties.get_property_as_int("Spark.Tls.CheckCertName")? > 0,
            verify_depth_max,
            verify_peer,
            check_crl,
            revocation_lists: properties
                .get_property_as_list("Spark.Tls.CertificateRevocationLists"),
            cert_file: owned(properties, "Spark.Tls.CertFile"),
            key_file: owned(properties, "Spark.Tls.KeyFile"),
            password: owned(properties, "Spark.Tls.Password"),
            find_cert: directives(properties, "Spark.Tls.FindCert.")?,
            import_cert: directives(properties, "Spark.Tls.ImportCert.")?,
            cert_store_root,
            cas: owned(properties, "Spark.Tls.CAs"),
            use_platform_cas: properties.get_property_as_int("Spark.Tls.UsePlatformCAs")? > 0,
            handshake_timeout,
            default_dir,
        })
    }

    /// 解析文件路径：原样存在则直接使用，否则尝试 `DefaultDir/<path>`。
    pub fn resolve_path(&self, path: &str) -> Option<PathBuf> {
        let direct = Path::new(path);
        if direct.exists() {
            return Some(direct.to_path_buf());
        }
        let joined = self.default_dir.as_ref()?.join(path);
        joined.exists().then_some(joined)
    }
}

fn owned(properties: &Properties, key: &str) -> Option<String> {
    properties.get_property(key).map(str::to_owned)
}

fn level(properties: &Properties, key: &str, default: i32) -> Result<u8> {
    let value = properties.get_property_as_int_with_default(key, default)?;
    match value {
        0..=2 => Ok(value as u8),
        other => Err(TransportError::config(
            key,
            format!("level {other} is not one of 0, 1 or 2"),
        )),
    }
}

/// 解析 `<prefix><Location>.<Name> = value` 形式的属性。
fn directives(properties: &Properties, prefix: &str) -> Result<Vec<StoreDirective>> {
    let mut result = Vec::new();
    for (key, value) in properties.get_properties_for_prefix(prefix) {
        let suffix = &key[prefix.len()..];
        let Some((location, store)) = suffix.split_once('.') else {
            return Err(TransportError::config(
                key,
                "expected `<Location>.<Name>` after the property prefix",
            ));
        };
        let location = StoreLocation::parse(location).ok_or_else(|| {
            TransportError::config(key, format!("unknown store location `{location}`"))
        })?;
        if store.is_empty() {
            return Err(TransportError::config(key, "empty store name"));
        }
        result.push(StoreDirective {
            property: key.to_owned(),
            location,
            store: store.to_owned(),
            value: value.to_owned(),
        });
    }
    Ok(result)
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            default_dir: None,
            protocols: ProtocolSet::default(),
            check_cert_name: false,
            verify_depth_max: 3,
            verify_peer: 2,
            check_crl: 0,
            revocation_lists: Vec::new(),
            cert_file: None,
            key_file: None,
            password: None,
            find_cert: Vec::new(),
            import_cert: Vec::new(),
            cert_store_root: PathBuf::from("."),
            cas: None,
            use_platform_cas: false,
            handshake_timeout: Some(Duration::from_millis(10_000)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TlsConfig::from_properties(&Properties::new()).unwrap();
        assert_eq!(config, TlsConfig::default());
    }

    #[test]
    fn protocols_accept_common_spellings() {
        let props = Properties::new().with("Spark.Tls.Protocols", "TLSv1.3");
        let config = TlsConfig::from_properties(&props).unwrap();
        assert!(config.protocols.tls13);
        assert!(!config.protocols.tls12);
        assert_eq!(config.protocols.versions().len(), 1);
    }

    #[test]
    fn legacy_protocols_are_config_errors() {
        let props = Properties::new().with("Spark.Tls.Protocols", "tls1_2, tls1_0");
        let err = TlsConfig::from_properties(&props).unwrap_err();
        assert!(matches!(err, TransportError::Config { ref property, .. } if property == "Spark.Tls.Protocols"));
    }

    #[test]
    fn out_of_range_levels_are_rejected() {
        let props = Properties::new().with("Spark.Tls.CheckCRL", "3");
        assert!(TlsConfig::from_properties(&props).is_err());
    }

    #[test]
    fn store_directives_are_parsed() {
        let props = Properties::new()
            .with("Spark.Tls.FindCert.CurrentUser.My", "subject:Client")
            .with("Spark.Tls.ImportCert.LocalMachine.Root", "ca.pem");
        let config = TlsConfig::from_properties(&props).unwrap();
        assert_eq!(config.find_cert.len(), 1);
        assert_eq!(config.find_cert[0].location, StoreLocation::CurrentUser);
        assert_eq!(config.find_cert[0].store, "My");
        assert_eq!(config.import_cert[0].location, StoreLocation::LocalMachine);

        let bad = Properties::new().with("Spark.Tls.FindCert.Elsewhere.My", "*");
        assert!(TlsConfig::from_properties(&bad).is_err());
    }

    #[test]
    fn handshake_timeout_negative_disables_deadline() {
        let props = Properties::new().with("Spark.Tls.HandshakeTimeout", "-1");
        let config = TlsConfig::from_properties(&props).unwrap();
        assert_eq!(config.handshake_timeout, None);
    }
}
