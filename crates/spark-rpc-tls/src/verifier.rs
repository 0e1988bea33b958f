//! `rustls` 校验器适配层。
//!
//! 链构建与签名校验交给 `rustls-webpki`，其结论再折算成 [`PolicyErrors`] 与
//! [`ChainStatus`]，由 [`policy::evaluate`] 依据 `VerifyPeer`、吊销级别做最终决定。

use std::sync::Arc;

use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, Error as RustlsError, OtherError,
    RootCertStore, SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::{CryptoProvider, WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature},
    server::{
        WebPkiClientVerifier,
        danger::{ClientCertVerified, ClientCertVerifier},
    },
};
use rustls_pki_types::{CertificateDer, CertificateRevocationListDer, ServerName, UnixTime};
use spark_rpc_transport::{TraceLevels, trace::SECURITY_TARGET};
use tracing::debug;

use crate::{
    connection_info::TlsConnectionInfo,
    policy::{self, ChainStatus, PolicyContext, PolicyErrors, PolicyRejection},
};

/// 握手完成后的可插拔校验钩子。
///
/// 在深度限制、信任规则与主机名校验之后调用；返回 `false` 即以安全错误拒绝连接。
pub trait CertificateVerifier: Send + Sync {
    fn verify(&self, info: &TlsConnectionInfo) -> bool;
}

impl<F> CertificateVerifier for F
where
    F: Fn(&TlsConnectionInfo) -> bool + Send + Sync,
{
    fn verify(&self, info: &TlsConnectionInfo) -> bool {
        self(info)
    }
}

/// 构建校验器所需的共享材料。
#[derive(Clone, Debug)]
pub struct VerifierMaterial {
    pub roots: Arc<RootCertStore>,
    pub crls: Vec<CertificateRevocationListDer<'static>>,
    pub provider: Arc<CryptoProvider>,
    pub verify_peer: u8,
    /// 生效的吊销检查级别。
    pub revocation_level: u8,
    pub trace: TraceLevels,
}

/// 将 webpki 的证书错误折算为策略输入。
fn classify(error: &CertificateError) -> (PolicyErrors, Option<ChainStatus>) {
    use CertificateError::*;
    let status = match error {
        NotValidForName | NotValidForNameContext { .. } => {
            return (PolicyErrors::NAME_MISMATCH, None);
        }
        Expired | ExpiredContext { .. } => ChainStatus::Expired,
        NotValidYet | NotValidYetContext { .. } => ChainStatus::NotYetValid,
        Revoked => ChainStatus::Revoked,
        UnknownRevocationStatus | ExpiredRevocationList | ExpiredRevocationListContext { .. } => {
            ChainStatus::RevocationStatusUnknown
        }
        UnknownIssuer => ChainStatus::UntrustedRoot,
        BadSignature => ChainStatus::InvalidSignature,
        InvalidPurpose | InvalidPurposeContext { .. } => ChainStatus::InvalidUsage,
        _ => ChainStatus::Other,
    };
    (PolicyErrors::CHAIN_ERRORS, Some(status))
}

fn rejection_error(rejection: PolicyRejection) -> RustlsError {
    RustlsError::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(rejection))))
}

/// 把 webpki 结论交给策略评估，返回最终的接受/拒绝。
fn apply_policy(
    outcome: Result<(), RustlsError>,
    context: &PolicyContext,
    trace: TraceLevels,
) -> Result<(), RustlsError> {
    let (errors, status) = match outcome {
        Ok(()) => return Ok(()),
        Err(RustlsError::InvalidCertificate(error)) => classify(&error),
        Err(other) => return Err(other),
    };
    let statuses: Vec<ChainStatus> = status.into_iter().collect();
    policy::evaluate(errors, &statuses, context).map_err(|rejection| {
        if trace.security_enabled(1) {
            debug!(
                target: SECURITY_TARGET,
                incoming = context.incoming,
                reason = %rejection,
                "certificate rejected by validation policy"
            );
        }
        rejection_error(rejection)
    })
}

/// 客户端使用的服务端证书校验器。
#[derive(Debug)]
pub struct ServerVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    algorithms: WebPkiSupportedAlgorithms,
    context: PolicyContext,
    trace: TraceLevels,
}

impl ServerVerifier {
    /// 没有任何信任锚时，任何服务端链都以“不受信根”处理。
    pub fn new(material: &VerifierMaterial) -> Result<Self, RustlsError> {
        let inner = if material.roots.is_empty() {
            None
        } else {
            let mut builder = WebPkiServerVerifier::builder_with_provider(
                material.roots.clone(),
                material.provider.clone(),
            );
            if material.revocation_level > 0 {
                builder = builder.with_crls(material.crls.iter().cloned());
                if material.revocation_level == 1 {
                    builder = builder.allow_unknown_revocation_status();
                }
            }
            Some(
                builder
                    .build()
                    .map_err(|err| RustlsError::General(err.to_string()))?,
            )
        };
        Ok(Self {
            inner,
            algorithms: material.provider.signature_verification_algorithms,
            context: PolicyContext {
                incoming: false,
                verify_peer: material.verify_peer,
                revocation_level: material.revocation_level,
            },
            trace: material.trace,
        })
    }
}

impl ServerCertVerifier for ServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        let outcome = match &self.inner {
            Some(inner) => inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .map(|_| ()),
            None => Err(RustlsError::InvalidCertificate(CertificateError::UnknownIssuer)),
        };
        apply_policy(outcome, &self.context, self.trace)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// 服务端使用的客户端证书校验器。
///
/// `verify_peer` 为 0 时不请求证书，为 1 时请求但允许缺省，为 2 时强制要求。
#[derive(Debug)]
pub struct ClientVerifier {
    inner: Option<Arc<dyn ClientCertVerifier>>,
    algorithms: WebPkiSupportedAlgorithms,
    context: PolicyContext,
    trace: TraceLevels,
}

impl ClientVerifier {
    pub fn new(material: &VerifierMaterial) -> Result<Self, RustlsError> {
        let inner = if material.roots.is_empty() {
            None
        } else {
            let mut builder = WebPkiClientVerifier::builder_with_provider(
                material.roots.clone(),
                material.provider.clone(),
            )
            .allow_unauthenticated();
            if material.revocation_level > 0 {
                builder = builder.with_crls(material.crls.iter().cloned());
                if material.revocation_level == 1 {
                    builder = builder.allow_unknown_revocation_status();
                }
            }
            Some(
                builder
                    .build()
                    .map_err(|err| RustlsError::General(err.to_string()))?,
            )
        };
        Ok(Self {
            inner,
            algorithms: material.provider.signature_verification_algorithms,
            context: PolicyContext {
                incoming: true,
                verify_peer: material.verify_peer,
                revocation_level: material.revocation_level,
            },
            trace: material.trace,
        })
    }
}

impl ClientCertVerifier for ClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.context.verify_peer > 0
    }

    fn client_auth_mandatory(&self) -> bool {
        self.context.verify_peer > 1
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        match &self.inner {
            Some(inner) => inner.root_hint_subjects(),
            None => &[],
        }
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, RustlsError> {
        let outcome = match &self.inner {
            Some(inner) => inner
                .verify_client_cert(end_entity, intermediates, now)
                .map(|_| ()),
            None => Err(RustlsError::InvalidCertificate(CertificateError::UnknownIssuer)),
        };
        apply_policy(outcome, &self.context, self.trace)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
