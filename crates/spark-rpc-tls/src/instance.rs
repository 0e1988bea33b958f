use std::{fmt, fs, path::Path, sync::Arc, time::Duration};

use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::CertificateRevocationListDer;
use spark_rpc_transport::{
    NetworkInterfaces, NetworkSettings, Properties, ProxyConfig, Result, SystemInterfaces,
    TraceLevels, TransportError, trace::SECURITY_TARGET,
};
use tracing::{debug, warn};

use crate::{
    certificate::{self, LocalIdentity},
    config::TlsConfig,
    store::{self, PasswordCallback},
    trust::TrustManager,
    verifier::{CertificateVerifier, ClientVerifier, ServerVerifier, VerifierMaterial},
};

/// TLS 插件的共享上下文。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 所有端点、连接器、接收器与收发器共享同一份只读状态：解析后的配置、信任规则、
///   本地身份与预构建的 `rustls` 配置；以 `Arc<TlsInstance>` 显式传递，不存在全局单例；
/// - 初始化阶段集中完成所有“可能失败”的工作（读文件、导入证书、构建校验器），
///   之后的连接路径上只剩网络错误与安全拒绝。
///
/// ## 逻辑（How）
/// 1. 读取追踪级别、网络设置、代理与 `Spark.Tls.*` 配置；
/// 2. 执行 `ImportCert`，再从 `CertFile` 与 `FindCert` 装载本地身份；
/// 3. 汇总信任锚（`CAs`、平台证书）与吊销列表，构建客户端与服务端配置。
///
/// ## 契约（What）
/// - 任一步骤失败都返回携带属性名的 [`TransportError::Config`]；
/// - 没有本地身份时仍可作为客户端使用，创建接收器会失败。
pub struct TlsInstance {
    config: TlsConfig,
    settings: NetworkSettings,
    proxy: Option<ProxyConfig>,
    default_host: String,
    trace: TraceLevels,
    trust: TrustManager,
    identities: Vec<LocalIdentity>,
    client_config: Arc<ClientConfig>,
    server_config: Option<Arc<ServerConfig>>,
    verifier: Option<Arc<dyn CertificateVerifier>>,
    interfaces: Arc<dyn NetworkInterfaces>,
}

impl fmt::Debug for TlsInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsInstance")
            .field("config", &self.config)
            .field("proxy", &self.proxy)
            .field("default_host", &self.default_host)
            .field("identities", &self.identities.len())
            .finish_non_exhaustive()
    }
}

/// [`TlsInstance`] 构建器，用于注入可插拔组件。
#[must_use]
pub struct TlsInstanceBuilder {
    properties: Properties,
    verifier: Option<Arc<dyn CertificateVerifier>>,
    password_callback: Option<Arc<dyn PasswordCallback>>,
    interfaces: Arc<dyn NetworkInterfaces>,
}

impl TlsInstanceBuilder {
    /// 握手后的附加校验。
    pub fn certificate_verifier(mut self, verifier: Arc<dyn CertificateVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// 证书文件密码回调。
    pub fn password_callback(mut self, callback: Arc<dyn PasswordCallback>) -> Self {
        self.password_callback = Some(callback);
        self
    }

    /// 替换本地接口枚举实现。
    pub fn network_interfaces(mut self, interfaces: Arc<dyn NetworkInterfaces>) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub fn build(self) -> Result<Arc<TlsInstance>> {
        let properties = &self.properties;
        let trace = TraceLevels::from_properties(properties)?;
        let config = TlsConfig::from_properties(properties)?;
        let settings = NetworkSettings::from_properties(properties)?;
        let proxy = ProxyConfig::from_properties(properties)?;
        let trust = TrustManager::from_properties(properties, trace)?;
        let callback = self.password_callback.as_deref();

        for directive in &config.import_cert {
            let written = store::import_directive(&config, directive, callback)?;
            if trace.security_enabled(1) {
                debug!(target: SECURITY_TARGET, property = %directive.property, path = %written.display(), "imported certificate");
            }
        }

        let mut identities = Vec::new();
        if let Some(file) = &config.cert_file {
            identities.push(load_identity(&config, file, callback)?);
        }
        for directive in &config.find_cert {
            identities.extend(store::find_directive(&config, directive)?);
        }

        let roots = Arc::new(load_roots(&config)?);
        let crls = load_revocation_lists(&config)?;
        if config.check_crl > 0 && crls.is_empty() {
            warn!(
                target: SECURITY_TARGET,
                "Spark.Tls.CheckCRL is enabled but no revocation lists are configured; revocation checking is disabled"
            );
        }
        let revocation_level = if crls.is_empty() { 0 } else { config.check_crl };
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let material = VerifierMaterial {
            roots,
            crls,
            provider,
            verify_peer: config.verify_peer,
            revocation_level,
            trace,
        };
        let client_config = Arc::new(client_config(&config, &material, &identities)?);
        let server_config = match identities.first() {
            Some(identity) => Some(Arc::new(server_config(&config, &material, identity)?)),
            None => None,
        };

        if trace.security_enabled(1) {
            debug!(
                target: SECURITY_TARGET,
                identities = identities.len(),
                trust_anchors = material.roots.len(),
                revocation_level,
                verify_peer = config.verify_peer,
                "tls transport initialized"
            );
        }

        Ok(Arc::new(TlsInstance {
            default_host: properties
                .get_property_with_default("Spark.Default.Host", "")
                .to_owned(),
            config,
            settings,
            proxy,
            trace,
            trust,
            identities,
            client_config,
            server_config,
            verifier: self.verifier,
            interfaces: self.interfaces,
        }))
    }
}

fn provider_error(property: &str, err: rustls::Error) -> TransportError {
    TransportError::config(property, err.to_string())
}

fn client_config(
    config: &TlsConfig,
    material: &VerifierMaterial,
    identities: &[LocalIdentity],
) -> Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(material.provider.clone())
        .with_protocol_versions(&config.protocols.versions())
        .map_err(|err| provider_error("Spark.Tls.Protocols", err))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(
            ServerVerifier::new(material).map_err(|err| provider_error("Spark.Tls.CAs", err))?,
        ));
    match identities.first() {
        Some(identity) => builder
            .with_client_auth_cert(identity.chain.clone(), identity.key.clone_key())
            .map_err(|err| provider_error("Spark.Tls.CertFile", err)),
        None => Ok(builder.with_no_client_auth()),
    }
}

fn server_config(
    config: &TlsConfig,
    material: &VerifierMaterial,
    identity: &LocalIdentity,
) -> Result<ServerConfig> {
    ServerConfig::builder_with_provider(material.provider.clone())
        .with_protocol_versions(&config.protocols.versions())
        .map_err(|err| provider_error("Spark.Tls.Protocols", err))?
        .with_client_cert_verifier(Arc::new(
            ClientVerifier::new(material).map_err(|err| provider_error("Spark.Tls.CAs", err))?,
        ))
        .with_single_cert(identity.chain.clone(), identity.key.clone_key())
        .map_err(|err| provider_error("Spark.Tls.CertFile", err))
}

/// 装载 `CertFile`：PKCS#12 使用 `Password` 或回调提供的密码，PEM/DER 结合 `KeyFile`。
fn load_identity(
    config: &TlsConfig,
    file: &str,
    callback: Option<&dyn PasswordCallback>,
) -> Result<LocalIdentity> {
    const CERT_FILE: &str = "Spark.Tls.CertFile";
    let config_error = |property: &str, reason: String| TransportError::config(property, reason);
    let path = config
        .resolve_path(file)
        .ok_or_else(|| config_error(CERT_FILE, format!("certificate file `{file}` not found")))?;
    let bytes = certificate::read(&path).map_err(|err| config_error(CERT_FILE, err.to_string()))?;

    if certificate::is_pkcs12(&path) {
        let password = config
            .password
            .clone()
            .or_else(|| callback.and_then(|callback| callback.password(&path)))
            .unwrap_or_default();
        return certificate::parse_pkcs12(&bytes, &password)
            .map_err(|err| config_error(CERT_FILE, err.to_string()));
    }

    let chain = certificate::parse_certificates(&bytes)
        .map_err(|err| config_error(CERT_FILE, err.to_string()))?;
    let key = match &config.key_file {
        Some(key_file) => {
            const KEY_FILE: &str = "Spark.Tls.KeyFile";
            let key_path = config.resolve_path(key_file).ok_or_else(|| {
                config_error(KEY_FILE, format!("key file `{key_file}` not found"))
            })?;
            let key_bytes =
                certificate::read(&key_path).map_err(|err| config_error(KEY_FILE, err.to_string()))?;
            certificate::parse_private_key(&key_bytes)
                .map_err(|err| config_error(KEY_FILE, err.to_string()))?
        }
        None => certificate::pem_private_key(&bytes).ok_or_else(|| {
            config_error(
                CERT_FILE,
                "no private key found; set Spark.Tls.KeyFile".to_owned(),
            )
        })?,
    };
    Ok(LocalIdentity { chain, key })
}

/// 汇总信任锚：`CAs` 指向文件或目录，`UsePlatformCAs` 追加平台证书。
fn load_roots(config: &TlsConfig) -> Result<RootCertStore> {
    const CAS: &str = "Spark.Tls.CAs";
    let mut roots = RootCertStore::empty();
    if let Some(cas) = &config.cas {
        let path = config
            .resolve_path(cas)
            .ok_or_else(|| TransportError::config(CAS, format!("`{cas}` not found")))?;
        for file in ca_files(&path)? {
            let bytes = certificate::read(&file)
                .map_err(|err| TransportError::config(CAS, err.to_string()))?;
            let certs = certificate::parse_certificates(&bytes)
                .map_err(|err| TransportError::config(CAS, err.to_string()))?;
            for cert in certs {
                roots
                    .add(cert)
                    .map_err(|err| TransportError::config(CAS, err.to_string()))?;
            }
        }
    }
    if config.use_platform_cas {
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            warn!(target: SECURITY_TARGET, error = %err, "cannot load platform certificate");
        }
        roots.add_parsable_certificates(native.certs);
    }
    Ok(roots)
}

fn ca_files(path: &Path) -> Result<Vec<std::path::PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let io_error = |err: std::io::Error| TransportError::config("Spark.Tls.CAs", err.to_string());
    let mut files = Vec::new();
    for entry in fs::read_dir(path).map_err(io_error)? {
        let file = entry.map_err(io_error)?.path();
        let is_cert = file
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ["pem", "crt", "cer"].iter().any(|known| ext.eq_ignore_ascii_case(known)));
        if file.is_file() && is_cert {
            files.push(file);
        }
    }
    files.sort();
    Ok(files)
}

fn load_revocation_lists(config: &TlsConfig) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    const CRLS: &str = "Spark.Tls.CertificateRevocationLists";
    if config.check_crl == 0 {
        return Ok(Vec::new());
    }
    let mut crls = Vec::new();
    for file in &config.revocation_lists {
        let path = config
            .resolve_path(file)
            .ok_or_else(|| TransportError::config(CRLS, format!("`{file}` not found")))?;
        crls.extend(
            certificate::load_crls(&path).map_err(|err| TransportError::config(CRLS, err.to_string()))?,
        );
    }
    Ok(crls)
}

impl TlsInstance {
    /// 以属性创建构建器。
    pub fn builder(properties: Properties) -> TlsInstanceBuilder {
        TlsInstanceBuilder {
            properties,
            verifier: None,
            password_callback: None,
            interfaces: Arc::new(SystemInterfaces),
        }
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    /// `Spark.Default.Host`。
    pub fn default_host(&self) -> &str {
        &self.default_host
    }

    pub fn trace(&self) -> TraceLevels {
        self.trace
    }

    pub fn trust(&self) -> &TrustManager {
        &self.trust
    }

    pub fn identities(&self) -> &[LocalIdentity] {
        &self.identities
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    /// 服务端配置；没有本地身份时返回配置错误。
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        self.server_config.clone().ok_or_else(|| {
            TransportError::config(
                "Spark.Tls.CertFile",
                "no server certificate configured for incoming connections",
            )
        })
    }

    pub fn certificate_verifier(&self) -> Option<&Arc<dyn CertificateVerifier>> {
        self.verifier.as_ref()
    }

    pub fn interfaces(&self) -> &dyn NetworkInterfaces {
        self.interfaces.as_ref()
    }

    /// 握手时限：端点超时为正时优先，否则使用 `Spark.Tls.HandshakeTimeout`。
    pub fn handshake_timeout(&self, endpoint_timeout: i32) -> Option<Duration> {
        match u64::try_from(endpoint_timeout) {
            Ok(millis) if millis > 0 => Some(Duration::from_millis(millis)),
            _ => self.config.handshake_timeout,
        }
    }
}
