//! X.509 证书的解析、加载与身份凭据。

use std::{fmt, fs, net::IpAddr, path::Path};

use p12_keystore::{KeyStore, KeyStoreEntry};
use rustls_pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer,
    pem::PemObject,
};
use sha1::{Digest, Sha1};
use thiserror::Error;
use x509_parser::{
    certificate::X509Certificate,
    extensions::{GeneralName, ParsedExtension},
    x509::X509Name,
};

use crate::dn::escape_value;

/// 证书或密钥无法解码。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CertificateParseError(pub String);

fn parse_error(message: impl fmt::Display) -> CertificateParseError {
    CertificateParseError(message.to_string())
}

/// 已解析的证书及其常用属性。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 存储查询、信任评估与主机名校验都需要主题、颁发者、指纹等字段；
///   构造时一次性解析并缓存，避免反复解码 DER；
/// - 持有 `'static` 的 DER 副本，TLS 库回调结束后仍可安全使用。
///
/// ## 契约（What）
/// - `subject`/`issuer`：RFC 2253 文本（最具体的 RDN 在前），值已按 RFC 2253 转义；
/// - `thumbprint`：DER 的 SHA-1 摘要，大写十六进制；
/// - `serial`/`subject_key_id`：大写十六进制。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    der: CertificateDer<'static>,
    subject: String,
    issuer: String,
    serial: String,
    thumbprint: String,
    subject_key_id: Option<String>,
    dns_names: Vec<String>,
    ip_addresses: Vec<IpAddr>,
    common_names: Vec<String>,
}

impl Certificate {
    /// 解析 DER 编码的证书。
    pub fn from_der(der: CertificateDer<'static>) -> Result<Self, CertificateParseError> {
        let (_, parsed) = x509_parser::parse_x509_certificate(der.as_ref())
            .map_err(|err| parse_error(format!("invalid X.509 certificate: {err}")))?;
        let subject = render_name(parsed.subject())?;
        let issuer = render_name(parsed.issuer())?;
        let serial = hex::encode_upper(parsed.raw_serial());
        let thumbprint = hex::encode_upper(Sha1::digest(der.as_ref()));
        let subject_key_id = parsed.extensions().iter().find_map(|ext| {
            match ext.parsed_extension() {
                ParsedExtension::SubjectKeyIdentifier(id) => Some(hex::encode_upper(id.0)),
                _ => None,
            }
        });
        let (dns_names, ip_addresses) = alternative_names(&parsed);
        let common_names = parsed
            .subject()
            .iter_common_name()
            .filter_map(|attr| attr.as_str().ok().map(str::to_owned))
            .collect();
        Ok(Self {
            der,
            subject,
            issuer,
            serial,
            thumbprint,
            subject_key_id,
            dns_names,
            ip_addresses,
            common_names,
        })
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    pub fn subject_key_id(&self) -> Option<&str> {
        self.subject_key_id.as_deref()
    }

    /// 主机名校验：优先匹配 SAN（DNS 名支持最左标签通配，IP 按字节比较），
    /// 证书没有 DNS 类型 SAN 时回退到主题 CN。
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.ip_addresses.contains(&ip);
        }
        let candidates = if self.dns_names.is_empty() {
            &self.common_names
        } else {
            &self.dns_names
        };
        candidates
            .iter()
            .any(|pattern| dns_name_matches(pattern, host))
    }
}

fn alternative_names(parsed: &X509Certificate<'_>) -> (Vec<String>, Vec<IpAddr>) {
    let mut dns = Vec::new();
    let mut ips = Vec::new();
    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(value) => dns.push((*value).to_owned()),
                GeneralName::IPAddress(bytes) => {
                    if let Ok(octets) = <[u8; 4]>::try_from(*bytes) {
                        ips.push(IpAddr::from(octets));
                    } else if let Ok(octets) = <[u8; 16]>::try_from(*bytes) {
                        ips.push(IpAddr::from(octets));
                    }
                }
                _ => {}
            }
        }
    }
    (dns, ips)
}

fn dns_name_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    let host = host.trim_end_matches('.');
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
            None => false,
        };
    }
    pattern.eq_ignore_ascii_case(host)
}

/// 属性 OID 到 RFC 2253 短名的映射。
fn short_name(oid: &str) -> Option<&'static str> {
    Some(match oid {
        "2.5.4.3" => "CN",
        "2.5.4.4" => "SN",
        "2.5.4.5" => "SERIALNUMBER",
        "2.5.4.6" => "C",
        "2.5.4.7" => "L",
        "2.5.4.8" => "ST",
        "2.5.4.9" => "STREET",
        "2.5.4.10" => "O",
        "2.5.4.11" => "OU",
        "2.5.4.12" => "T",
        "2.5.4.42" => "G",
        "2.5.4.43" => "I",
        "2.5.4.46" => "DNQUALIFIER",
        "0.9.2342.19200300.100.1.1" => "UID",
        "0.9.2342.19200300.100.1.25" => "DC",
        "1.2.840.113549.1.9.1" => "E",
        _ => return None,
    })
}

/// 以 RFC 2253 形式渲染名称；非字符串属性值视为解析失败。
fn render_name(name: &X509Name<'_>) -> Result<String, CertificateParseError> {
    let mut rdns = Vec::new();
    for rdn in name.iter() {
        let mut attributes = Vec::new();
        for attribute in rdn.iter() {
            let oid = attribute.attr_type().to_id_string();
            let key = short_name(&oid).map_or(oid.clone(), str::to_owned);
            let value = attribute.as_str().map_err(|err| {
                parse_error(format!("attribute {oid} is not a string: {err}"))
            })?;
            attributes.push(format!("{key}={}", escape_value(value)));
        }
        rdns.push(attributes.join("+"));
    }
    rdns.reverse();
    Ok(rdns.join(","))
}

/// 渲染 DER 证书的主题名。
pub fn subject_of(der: &CertificateDer<'_>) -> Result<String, CertificateParseError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|err| parse_error(format!("invalid X.509 certificate: {err}")))?;
    render_name(parsed.subject())
}

/// 本地身份：证书链（叶子在前）与私钥。
#[derive(Debug)]
pub struct LocalIdentity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for LocalIdentity {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

fn looks_like_pem(bytes: &[u8]) -> bool {
    bytes.windows(11).any(|window| window == b"-----BEGIN ")
}

/// 是否按 PKCS#12 处理（依据扩展名）。
pub fn is_pkcs12(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("p12") || ext.eq_ignore_ascii_case("pfx"))
}

/// 从 PEM（可含多张）或单个 DER 读取证书。
pub fn parse_certificates(bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>, CertificateParseError> {
    if looks_like_pem(bytes) {
        let certs = CertificateDer::pem_slice_iter(bytes)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| parse_error(format!("invalid PEM certificate: {err:?}")))?;
        if certs.is_empty() {
            return Err(parse_error("no certificate found in PEM data"));
        }
        return Ok(certs);
    }
    let der = CertificateDer::from(bytes.to_vec());
    x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|err| parse_error(format!("invalid DER certificate: {err}")))?;
    Ok(vec![der])
}

/// 从 PEM 或 DER 读取私钥。
pub fn parse_private_key(bytes: &[u8]) -> Result<PrivateKeyDer<'static>, CertificateParseError> {
    if looks_like_pem(bytes) {
        return PrivateKeyDer::from_pem_slice(bytes)
            .map_err(|err| parse_error(format!("invalid PEM private key: {err:?}")));
    }
    PrivateKeyDer::try_from(bytes.to_vec())
        .map_err(|err| parse_error(format!("invalid DER private key: {err}")))
}

/// PEM 数据中是否携带私钥。
pub fn pem_private_key(bytes: &[u8]) -> Option<PrivateKeyDer<'static>> {
    if !looks_like_pem(bytes) {
        return None;
    }
    PrivateKeyDer::from_pem_slice(bytes).ok()
}

/// 解析 PKCS#12 容器，返回第一条“私钥 + 证书链”。
pub fn parse_pkcs12(bytes: &[u8], password: &str) -> Result<LocalIdentity, CertificateParseError> {
    let store = KeyStore::from_pkcs12(bytes, password)
        .map_err(|err| parse_error(format!("cannot decode PKCS#12 data: {err}")))?;
    for (_, entry) in store.entries() {
        if let KeyStoreEntry::PrivateKeyChain(chain) = entry {
            let certs: Vec<CertificateDer<'static>> = chain
                .chain()
                .iter()
                .map(|cert| CertificateDer::from(cert.as_der().to_vec()))
                .collect();
            if certs.is_empty() {
                continue;
            }
            let key = PrivateKeyDer::try_from(chain.key().to_vec())
                .map_err(|err| parse_error(format!("invalid PKCS#12 private key: {err}")))?;
            return Ok(LocalIdentity { chain: certs, key });
        }
    }
    Err(parse_error("PKCS#12 data contains no private key entry"))
}

/// 读取 CRL 文件（PEM 或 DER）。
pub fn load_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>, CertificateParseError> {
    let bytes = read(path)?;
    if looks_like_pem(&bytes) {
        return CertificateRevocationListDer::pem_slice_iter(&bytes)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| parse_error(format!("invalid PEM CRL: {err:?}")));
    }
    Ok(vec![CertificateRevocationListDer::from(bytes)])
}

/// 读取文件全部内容。
pub fn read(path: &Path) -> Result<Vec<u8>, CertificateParseError> {
    fs::read(path).map_err(|err| parse_error(format!("cannot read `{}`: {err}", path.display())))
}

/// 将证书与可选私钥编码为 PEM 文本。
pub fn to_pem(certs: &[CertificateDer<'_>], key: Option<&PrivateKeyDer<'_>>) -> String {
    let mut out = String::new();
    for cert in certs {
        out.push_str(&pem_block("CERTIFICATE", cert.as_ref()));
    }
    if let Some(key) = key {
        let label = match key {
            PrivateKeyDer::Pkcs1(_) => "RSA PRIVATE KEY",
            PrivateKeyDer::Sec1(_) => "EC PRIVATE KEY",
            _ => "PRIVATE KEY",
        };
        out.push_str(&pem_block(label, key.secret_der()));
    }
    out
}

fn pem_block(label: &str, der: &[u8]) -> String {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    let encoded = STANDARD.encode(der);
    let mut block = format!("-----BEGIN {label}-----\n");
    for line in encoded.as_bytes().chunks(64) {
        block.push_str(&String::from_utf8_lossy(line));
        block.push('\n');
    }
    block.push_str(&format!("-----END {label}-----\n"));
    block
}

#[cfg(test)]
mod tests {
    use rcgen::{CertificateParams, DistinguishedName as RcgenName, DnType, KeyPair};

    use super::*;

    fn generate(cn: &str, org: Option<&str>, sans: Vec<String>) -> (rcgen::Certificate, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(sans).unwrap();
        params.distinguished_name = RcgenName::new();
        params.distinguished_name.push(DnType::CommonName, cn);
        if let Some(org) = org {
            params.distinguished_name.push(DnType::OrganizationName, org);
        }
        let cert = params.self_signed(&key).unwrap();
        (cert, key)
    }

    #[test]
    fn subject_is_rendered_most_specific_first() {
        let (cert, _) = generate("Client, X", Some("Acme"), vec![]);
        let parsed = Certificate::from_der(cert.der().clone()).unwrap();
        // rcgen 按插入顺序编码：CN 在前，O 在后；渲染时顺序反转。
        assert_eq!(parsed.subject(), r"O=Acme,CN=Client\, X");
        assert_eq!(parsed.issuer(), parsed.subject());
        assert_eq!(subject_of(cert.der()).unwrap(), parsed.subject());
    }

    #[test]
    fn thumbprint_is_sha1_of_der() {
        let (cert, _) = generate("thumb", None, vec![]);
        let parsed = Certificate::from_der(cert.der().clone()).unwrap();
        assert_eq!(parsed.thumbprint().len(), 40);
        assert_eq!(
            parsed.thumbprint(),
            hex::encode_upper(Sha1::digest(cert.der().as_ref()))
        );
    }

    #[test]
    fn host_matching_uses_san_then_cn() {
        let (cert, _) = generate(
            "ignored.example",
            None,
            vec!["*.example.com".into(), "127.0.0.1".into()],
        );
        let parsed = Certificate::from_der(cert.der().clone()).unwrap();
        assert!(parsed.matches_host("api.example.com"));
        assert!(!parsed.matches_host("a.b.example.com"));
        assert!(!parsed.matches_host("ignored.example"));
        assert!(parsed.matches_host("127.0.0.1"));

        let (cn_only, _) = generate("server.local", None, vec![]);
        let parsed = Certificate::from_der(cn_only.der().clone()).unwrap();
        assert!(parsed.matches_host("SERVER.local"));
    }

    #[test]
    fn pem_round_trip_keeps_key() {
        let (cert, key) = generate("pem", None, vec![]);
        let key_der = PrivateKeyDer::try_from(key.serialize_der()).unwrap();
        let pem = to_pem(&[cert.der().clone()], Some(&key_der));
        let certs = parse_certificates(pem.as_bytes()).unwrap();
        assert_eq!(certs, vec![cert.der().clone()]);
        assert!(pem_private_key(pem.as_bytes()).is_some());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_certificates(b"not a certificate").is_err());
        assert!(parse_certificates(b"-----BEGIN CERTIFICATE-----\n!!\n-----END CERTIFICATE-----\n").is_err());
    }
}
