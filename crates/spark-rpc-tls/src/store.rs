//! 基于目录的证书存储。
//!
//! 存储位于 `<CertStoreRoot>/<Location>/<Name>`，每个文件保存一张证书（PEM 或 DER），
//! PEM 文件可以附带证书链与私钥。查询语法见 [`parse_query`]。

use std::{
    fs,
    path::{Path, PathBuf},
};

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use spark_rpc_transport::{Result, TransportError, trace::SECURITY_TARGET};
use thiserror::Error;
use tracing::warn;

use crate::{
    certificate::{self, Certificate, CertificateParseError, LocalIdentity},
    config::{StoreDirective, StoreLocation, TlsConfig},
    dn::DistinguishedName,
};

/// 证书存储操作失败的原因。
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("certificate store `{0}` does not exist")]
    Missing(PathBuf),
    #[error("cannot access certificate store `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid certificate query `{query}`: {reason}")]
    Query { query: String, reason: String },
    #[error(transparent)]
    Decode(#[from] CertificateParseError),
    #[error("no certificate matches `{0}`")]
    NoMatch(String),
}

/// 查询子句的键。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKey {
    Subject,
    SubjectDn,
    Issuer,
    IssuerDn,
    Thumbprint,
    SubjectKeyId,
    Serial,
}

impl QueryKey {
    fn parse(key: &str) -> Option<Self> {
        Some(match key.to_ascii_lowercase().as_str() {
            "subject" => Self::Subject,
            "subjectdn" => Self::SubjectDn,
            "issuer" => Self::Issuer,
            "issuerdn" => Self::IssuerDn,
            "thumbprint" => Self::Thumbprint,
            "subjectkeyid" => Self::SubjectKeyId,
            "serial" => Self::Serial,
            _ => return None,
        })
    }
}

/// 一条查询子句。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryClause {
    pub key: QueryKey,
    pub value: String,
}

fn query_error(query: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Query {
        query: query.to_owned(),
        reason: reason.into(),
    }
}

/// 解析查询表达式。
///
/// `*` 表示全部证书（返回空子句列表）；否则为空白分隔的 `key:value` 序列，
/// 值可用单引号或双引号包裹，引号内以 `\` 转义同类引号。
pub fn parse_query(query: &str) -> std::result::Result<Vec<QueryClause>, StoreError> {
    let trimmed = query.trim();
    if trimmed == "*" {
        return Ok(Vec::new());
    }
    if trimmed.is_empty() {
        return Err(query_error(query, "empty query"));
    }
    let chars: Vec<char> = trimmed.chars().collect();
    let mut clauses = Vec::new();
    let mut pos = 0;
    while pos < chars.len() {
        while pos < chars.len() && chars[pos].is_whitespace() {
            pos += 1;
        }
        if pos == chars.len() {
            break;
        }
        let start = pos;
        while pos < chars.len() && chars[pos] != ':' {
            pos += 1;
        }
        if pos == chars.len() {
            return Err(query_error(query, "expected `key:value`"));
        }
        let key: String = chars[start..pos].iter().collect();
        let key = key.trim();
        let parsed_key = QueryKey::parse(key)
            .ok_or_else(|| query_error(query, format!("unknown key `{key}`")))?;
        pos += 1;
        while pos < chars.len() && chars[pos].is_whitespace() {
            pos += 1;
        }
        let mut value = String::new();
        match chars.get(pos) {
            None => return Err(query_error(query, format!("missing value for `{key}`"))),
            Some(&quote) if quote == '"' || quote == '\'' => {
                pos += 1;
                loop {
                    match chars.get(pos) {
                        None => return Err(query_error(query, "unmatched quote")),
                        Some('\\') if chars.get(pos + 1) == Some(&quote) => {
                            value.push(quote);
                            pos += 2;
                        }
                        Some(&c) if c == quote => {
                            pos += 1;
                            break;
                        }
                        Some(&c) => {
                            value.push(c);
                            pos += 1;
                        }
                    }
                }
            }
            Some(_) => {
                while pos < chars.len() && !chars[pos].is_whitespace() {
                    value.push(chars[pos]);
                    pos += 1;
                }
            }
        }
        if value.is_empty() {
            return Err(query_error(query, format!("missing value for `{key}`")));
        }
        clauses.push(QueryClause {
            key: parsed_key,
            value,
        });
    }
    Ok(clauses)
}

/// 存储中的一项：证书本体、同文件携带的链与可选私钥。
#[derive(Debug, Clone)]
pub struct StoredCertificate {
    pub path: PathBuf,
    pub certificate: Certificate,
    pub chain: Vec<CertificateDer<'static>>,
    pub key: Option<LocalIdentity>,
}

impl StoredCertificate {
    fn load(path: PathBuf) -> std::result::Result<Self, StoreError> {
        let bytes = certificate::read(&path)?;
        let chain = certificate::parse_certificates(&bytes)?;
        let leaf = chain
            .first()
            .cloned()
            .ok_or_else(|| CertificateParseError(format!("`{}` holds no certificate", path.display())))?;
        let key = certificate::pem_private_key(&bytes).map(|key| LocalIdentity {
            chain: chain.clone(),
            key,
        });
        Ok(Self {
            certificate: Certificate::from_der(leaf)?,
            chain,
            key,
            path,
        })
    }

    fn matches(&self, clause: &QueryClause) -> bool {
        let cert = &self.certificate;
        match clause.key {
            QueryKey::Subject => contains_ignore_case(cert.subject(), &clause.value),
            QueryKey::Issuer => contains_ignore_case(cert.issuer(), &clause.value),
            QueryKey::SubjectDn => dn_equals(cert.subject(), &clause.value),
            QueryKey::IssuerDn => dn_equals(cert.issuer(), &clause.value),
            QueryKey::Thumbprint => normalize_hex(cert.thumbprint()) == normalize_hex(&clause.value),
            QueryKey::SubjectKeyId => cert
                .subject_key_id()
                .is_some_and(|id| normalize_hex(id) == normalize_hex(&clause.value)),
            QueryKey::Serial => {
                let ours = normalize_hex(cert.serial());
                let theirs = normalize_hex(&clause.value);
                ours.trim_start_matches('0') == theirs.trim_start_matches('0')
            }
        }
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn dn_equals(name: &str, query: &str) -> bool {
    match (DistinguishedName::parse(name), DistinguishedName::parse(query)) {
        (Ok(left), Ok(right)) => left.same_attributes(&right),
        _ => false,
    }
}

fn normalize_hex(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, ':' | ' '))
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn is_certificate_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            ["pem", "crt", "cer", "der"]
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// 目录形式的证书存储句柄。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateStore {
    path: PathBuf,
}

impl CertificateStore {
    /// 存储目录路径。
    pub fn location_path(root: &Path, location: StoreLocation, name: &str) -> PathBuf {
        root.join(location.as_str()).join(name)
    }

    /// 只读打开；目录不存在时失败。
    pub fn open(root: &Path, location: StoreLocation, name: &str) -> std::result::Result<Self, StoreError> {
        let path = Self::location_path(root, location, name);
        if !path.is_dir() {
            return Err(StoreError::Missing(path));
        }
        Ok(Self { path })
    }

    /// 读写打开；目录不存在时创建。
    pub fn open_or_create(
        root: &Path,
        location: StoreLocation,
        name: &str,
    ) -> std::result::Result<Self, StoreError> {
        let path = Self::location_path(root, location, name);
        fs::create_dir_all(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 枚举存储中的全部证书，按文件名排序。
    ///
    /// 无法解码的文件记一条告警后跳过，不影响其余证书。
    pub fn certificates(&self) -> std::result::Result<Vec<StoredCertificate>, StoreError> {
        let io_error = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.path).map_err(io_error)? {
            let path = entry.map_err(io_error)?.path();
            if path.is_file() && is_certificate_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths
            .into_iter()
            .filter_map(|path| {
                let shown = path.display().to_string();
                match StoredCertificate::load(path) {
                    Ok(stored) => Some(stored),
                    Err(err) => {
                        warn!(target: SECURITY_TARGET, file = %shown, error = %err, "skipping unreadable certificate in store");
                        None
                    }
                }
            })
            .collect())
    }

    /// 按查询表达式筛选证书；子句依次收窄结果集。
    ///
    /// 给出了筛选子句却一无所获时报告 [`StoreError::NoMatch`]；`*` 在空存储上返回空列表。
    pub fn find(&self, query: &str) -> std::result::Result<Vec<StoredCertificate>, StoreError> {
        let clauses = parse_query(query)?;
        let mut found = self.certificates()?;
        for clause in &clauses {
            found.retain(|stored| stored.matches(clause));
        }
        if found.is_empty() && !clauses.is_empty() {
            return Err(StoreError::NoMatch(query.to_owned()));
        }
        Ok(found)
    }

    /// 写入证书（及可选私钥），文件名取叶子证书指纹；返回写入路径。
    pub fn add(
        &self,
        chain: &[CertificateDer<'static>],
        key: Option<&PrivateKeyDer<'static>>,
    ) -> std::result::Result<PathBuf, StoreError> {
        let leaf = chain
            .first()
            .cloned()
            .ok_or_else(|| CertificateParseError("nothing to import".to_owned()))?;
        let certificate = Certificate::from_der(leaf)?;
        let path = self.path.join(format!("{}.pem", certificate.thumbprint()));
        fs::write(&path, certificate::to_pem(chain, key)).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

/// 证书文件密码回调，配置中未给出密码时调用。
pub trait PasswordCallback: Send + Sync {
    fn password(&self, file: &Path) -> Option<String>;
}

impl<F> PasswordCallback for F
where
    F: Fn(&Path) -> Option<String> + Send + Sync,
{
    fn password(&self, file: &Path) -> Option<String> {
        self(file)
    }
}

/// 执行一条 `ImportCert` 配置：`<file>[;<password>]`。
///
/// 文件缺失、解码失败与存储不可写均报告为携带属性名的配置错误。
pub fn import_directive(
    config: &TlsConfig,
    directive: &StoreDirective,
    callback: Option<&dyn PasswordCallback>,
) -> Result<PathBuf> {
    let config_error = |reason: String| TransportError::config(directive.property.as_str(), reason);
    let (file, password) = match directive.value.split_once(';') {
        Some((file, password)) => (file.trim(), Some(password.to_owned())),
        None => (directive.value.trim(), None),
    };
    let path = config
        .resolve_path(file)
        .ok_or_else(|| config_error(format!("certificate file `{file}` not found")))?;
    let bytes = certificate::read(&path).map_err(|err| config_error(err.to_string()))?;

    let (chain, key) = if certificate::is_pkcs12(&path) {
        let password = password
            .or_else(|| callback.and_then(|callback| callback.password(&path)))
            .unwrap_or_default();
        let identity = certificate::parse_pkcs12(&bytes, &password)
            .map_err(|err| config_error(err.to_string()))?;
        (identity.chain, Some(identity.key))
    } else {
        let chain = certificate::parse_certificates(&bytes)
            .map_err(|err| config_error(err.to_string()))?;
        (chain, certificate::pem_private_key(&bytes))
    };

    let store = CertificateStore::open_or_create(
        &config.cert_store_root,
        directive.location,
        &directive.store,
    )
    .map_err(|err| config_error(err.to_string()))?;
    store
        .add(&chain, key.as_ref())
        .map_err(|err| config_error(err.to_string()))
}

/// 执行一条 `FindCert` 配置，返回带私钥的身份凭据。
pub fn find_directive(config: &TlsConfig, directive: &StoreDirective) -> Result<Vec<LocalIdentity>> {
    let config_error = |reason: String| TransportError::config(directive.property.as_str(), reason);
    let store = CertificateStore::open(&config.cert_store_root, directive.location, &directive.store)
        .map_err(|err| config_error(err.to_string()))?;
    let found = store
        .find(&directive.value)
        .map_err(|err| config_error(err.to_string()))?;
    let identities: Vec<LocalIdentity> = found.into_iter().filter_map(|stored| stored.key).collect();
    if identities.is_empty() {
        return Err(config_error(format!(
            "no certificate with a private key matches `{}`",
            directive.value
        )));
    }
    Ok(identities)
}

#[cfg(test)]
mod tests {
    use rcgen::{CertificateParams, DistinguishedName as RcgenName, DnType, KeyPair};
    use tracing_test::traced_test;

    use super::*;

    fn identity(cn: &str) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = RcgenName::new();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.distinguished_name.push(DnType::OrganizationName, "Acme");
        let cert = params.self_signed(&key).unwrap();
        let key = PrivateKeyDer::try_from(key.serialize_der()).unwrap();
        (vec![cert.der().clone()], key)
    }

    #[test]
    fn query_parsing_handles_quotes() {
        let clauses = parse_query(r#"subject:"CN=Client, O=Acme" Serial:'0a\'b'"#).unwrap();
        assert_eq!(clauses.len(), 2);
        assert_eq!(clauses[0].key, QueryKey::Subject);
        assert_eq!(clauses[0].value, "CN=Client, O=Acme");
        assert_eq!(clauses[1].value, "0a'b");
        assert!(parse_query("*").unwrap().is_empty());
    }

    #[test]
    fn query_errors_are_reported() {
        assert!(matches!(parse_query("owner:x"), Err(StoreError::Query { .. })));
        assert!(matches!(parse_query("subject:\"open"), Err(StoreError::Query { .. })));
        assert!(matches!(parse_query("subject:"), Err(StoreError::Query { .. })));
        assert!(matches!(parse_query("subject"), Err(StoreError::Query { .. })));
    }

    #[test]
    fn missing_store_cannot_be_opened() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            CertificateStore::open(root.path(), StoreLocation::CurrentUser, "My"),
            Err(StoreError::Missing(_))
        ));
    }

    #[test]
    fn added_certificates_can_be_found() {
        let root = tempfile::tempdir().unwrap();
        let store =
            CertificateStore::open_or_create(root.path(), StoreLocation::CurrentUser, "My").unwrap();
        let (alice, alice_key) = identity("Alice");
        let (bob, _) = identity("Bob");
        store.add(&alice, Some(&alice_key)).unwrap();
        store.add(&bob, None).unwrap();

        assert_eq!(store.find("*").unwrap().len(), 2);
        let found = store.find("subject:alice").unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].key.is_some());

        let thumbprint = found[0].certificate.thumbprint().to_lowercase();
        assert_eq!(store.find(&format!("thumbprint:{thumbprint}")).unwrap().len(), 1);
        assert_eq!(store.find("subjectdn:\"O=Acme,CN=Bob\"").unwrap().len(), 1);
        assert!(matches!(store.find("subject:carol"), Err(StoreError::NoMatch(_))));
        assert!(matches!(
            store.find("issuer:Acme subject:Alice issuer:Other"),
            Err(StoreError::NoMatch(_))
        ));
    }

    #[test]
    fn wildcard_on_empty_store_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let store =
            CertificateStore::open_or_create(root.path(), StoreLocation::CurrentUser, "My").unwrap();
        assert!(store.find("*").unwrap().is_empty());
        assert!(matches!(store.find("subject:anyone"), Err(StoreError::NoMatch(_))));
    }

    #[test]
    #[traced_test]
    fn corrupt_file_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let store =
            CertificateStore::open_or_create(root.path(), StoreLocation::CurrentUser, "My").unwrap();
        let (alice, _) = identity("Alice");
        store.add(&alice, None).unwrap();
        fs::write(store.path().join("broken.der"), b"\x30\x03garbage").unwrap();

        let found = store.find("*").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(store.find("subject:alice").unwrap().len(), 1);
        assert!(logs_contain("skipping unreadable certificate in store"));
    }

    #[test]
    fn import_directive_writes_into_store() {
        let root = tempfile::tempdir().unwrap();
        let (chain, key) = identity("Imported");
        let file = root.path().join("imported.pem");
        fs::write(&file, certificate::to_pem(&chain, Some(&key))).unwrap();

        let config = TlsConfig {
            default_dir: Some(root.path().to_path_buf()),
            cert_store_root: root.path().join("stores"),
            ..TlsConfig::default()
        };
        let directive = StoreDirective {
            property: "Spark.Tls.ImportCert.LocalMachine.My".to_owned(),
            location: StoreLocation::LocalMachine,
            store: "My".to_owned(),
            value: "imported.pem".to_owned(),
        };
        let written = import_directive(&config, &directive, None).unwrap();
        assert!(written.starts_with(root.path().join("stores").join("LocalMachine").join("My")));

        let find = StoreDirective {
            property: "Spark.Tls.FindCert.LocalMachine.My".to_owned(),
            value: "subject:Imported".to_owned(),
            ..directive.clone()
        };
        let identities = find_directive(&config, &find).unwrap();
        assert_eq!(identities[0].chain, chain);

        let missing = StoreDirective {
            value: "absent.pem".to_owned(),
            ..directive
        };
        let err = import_directive(&config, &missing, None).unwrap_err();
        assert!(matches!(err, TransportError::Config { ref property, .. } if property.starts_with("Spark.Tls.ImportCert")));
    }
}
