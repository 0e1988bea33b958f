//! 内联证书策略评估。
//!
//! TLS 库完成链构建后，把结果折算为 [`PolicyErrors`] 与若干 [`ChainStatus`]，
//! 再由 [`evaluate`] 依据 `VerifyPeer` 与吊销检查级别决定是否放行。

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// 链校验得出的策略错误位。
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PolicyErrors: u8 {
        /// 对端没有出示证书。
        const CERTIFICATE_NOT_AVAILABLE = 0b001;
        /// 证书名称与目标主机不符。
        const NAME_MISMATCH = 0b010;
        /// 证书链存在问题，细节见 [`ChainStatus`]。
        const CHAIN_ERRORS = 0b100;
    }
}

/// 证书链中单个问题的分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainStatus {
    Revoked,
    RevocationStatusUnknown,
    UntrustedRoot,
    Expired,
    NotYetValid,
    InvalidSignature,
    InvalidUsage,
    NameConstraintViolation,
    Other,
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Revoked => "certificate revoked",
            Self::RevocationStatusUnknown => "revocation status unknown",
            Self::UntrustedRoot => "untrusted root",
            Self::Expired => "certificate expired",
            Self::NotYetValid => "certificate not yet valid",
            Self::InvalidSignature => "invalid signature",
            Self::InvalidUsage => "invalid key usage",
            Self::NameConstraintViolation => "name constraint violation",
            Self::Other => "chain error",
        };
        f.write_str(text)
    }
}

/// 评估所需的连接上下文。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PolicyContext {
    /// 本端是否为服务端（入站连接）。
    pub incoming: bool,
    /// `Spark.Tls.VerifyPeer`：0/1/2。
    pub verify_peer: u8,
    /// 生效的吊销检查级别；未配置吊销列表时为 0。
    pub revocation_level: u8,
}

/// 评估未通过时剩余的问题。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyRejection {
    pub errors: PolicyErrors,
    pub statuses: Vec<ChainStatus>,
}

impl fmt::Display for PolicyRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.contains(PolicyErrors::CERTIFICATE_NOT_AVAILABLE) {
            return f.write_str("peer certificate not available");
        }
        f.write_str("certificate chain validation failed")?;
        for (index, status) in self.statuses.iter().enumerate() {
            f.write_str(if index == 0 { ": " } else { ", " })?;
            write!(f, "{status}")?;
        }
        Ok(())
    }
}

impl std::error::Error for PolicyRejection {}

/// 依据配置折算策略错误。
///
/// # 教案级注释
///
/// ## 逻辑（How）
/// 1. 未出示证书：仅当本端为服务端且 `verify_peer <= 1` 时忽略；
/// 2. 名称不符：一律清除，主机名校验在握手后单独进行；
/// 3. 链错误逐项判断：`Revoked` 在吊销检查关闭时忽略，`RevocationStatusUnknown`
///    仅在级别 2 时视为错误，其余状态始终是错误；全部被忽略时清除链错误位；
/// 4. 仍有剩余位则拒绝。
///
/// ## 契约（What）
/// - 纯函数，不记录日志；调用方负责追踪拒绝原因；
/// - 返回的 [`PolicyRejection::statuses`] 只包含未被忽略的状态。
pub fn evaluate(
    errors: PolicyErrors,
    statuses: &[ChainStatus],
    context: &PolicyContext,
) -> Result<(), PolicyRejection> {
    let mut remaining = errors;
    if context.incoming && context.verify_peer <= 1 {
        remaining.remove(PolicyErrors::CERTIFICATE_NOT_AVAILABLE);
    }
    remaining.remove(PolicyErrors::NAME_MISMATCH);

    let mut unresolved = Vec::new();
    if remaining.contains(PolicyErrors::CHAIN_ERRORS) {
        unresolved = statuses
            .iter()
            .copied()
            .filter(|status| match status {
                ChainStatus::Revoked => context.revocation_level > 0,
                ChainStatus::RevocationStatusUnknown => context.revocation_level > 1,
                _ => true,
            })
            .collect();
        if unresolved.is_empty() {
            remaining.remove(PolicyErrors::CHAIN_ERRORS);
        }
    }

    if remaining.is_empty() {
        Ok(())
    } else {
        Err(PolicyRejection {
            errors: remaining,
            statuses: unresolved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(incoming: bool, verify_peer: u8, revocation_level: u8) -> PolicyContext {
        PolicyContext {
            incoming,
            verify_peer,
            revocation_level,
        }
    }

    #[test]
    fn missing_certificate_tolerated_only_for_lenient_servers() {
        let missing = PolicyErrors::CERTIFICATE_NOT_AVAILABLE;
        assert!(evaluate(missing, &[], &context(true, 1, 0)).is_ok());
        assert!(evaluate(missing, &[], &context(true, 0, 0)).is_ok());
        assert!(evaluate(missing, &[], &context(true, 2, 0)).is_err());
        assert!(evaluate(missing, &[], &context(false, 0, 0)).is_err());
    }

    #[test]
    fn name_mismatch_is_always_cleared() {
        assert!(evaluate(PolicyErrors::NAME_MISMATCH, &[], &context(false, 2, 2)).is_ok());
    }

    #[test]
    fn revocation_statuses_follow_level() {
        let chain = PolicyErrors::CHAIN_ERRORS;
        let unknown = [ChainStatus::RevocationStatusUnknown];
        assert!(evaluate(chain, &unknown, &context(false, 2, 1)).is_ok());
        assert!(evaluate(chain, &unknown, &context(false, 2, 2)).is_err());

        let revoked = [ChainStatus::Revoked];
        assert!(evaluate(chain, &revoked, &context(false, 2, 0)).is_ok());
        assert!(evaluate(chain, &revoked, &context(false, 2, 1)).is_err());
    }

    #[test]
    fn other_chain_errors_always_reject() {
        let rejection = evaluate(
            PolicyErrors::CHAIN_ERRORS,
            &[ChainStatus::Revoked, ChainStatus::UntrustedRoot],
            &context(true, 0, 0),
        )
        .unwrap_err();
        assert_eq!(rejection.statuses, vec![ChainStatus::UntrustedRoot]);
        assert_eq!(
            rejection.to_string(),
            "certificate chain validation failed: untrusted root"
        );
    }
}
