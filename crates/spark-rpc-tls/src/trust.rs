use std::collections::BTreeMap;

use spark_rpc_transport::{Properties, Result, TraceLevels, TransportError, trace::SECURITY_TARGET};
use tracing::{debug, warn};

use crate::{
    connection_info::TlsConnectionInfo,
    dn::{DistinguishedName, parse_pattern_list},
};

const TRUST_ONLY: &str = "Spark.Tls.TrustOnly";
const TRUST_ONLY_CLIENT: &str = "Spark.Tls.TrustOnly.Client";
const TRUST_ONLY_SERVER: &str = "Spark.Tls.TrustOnly.Server";
const TRUST_ONLY_SERVER_ADAPTER: &str = "Spark.Tls.TrustOnly.Server.";

/// 一组信任规则：接受模式与拒绝模式。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct RuleGroup {
    accept: Vec<DistinguishedName>,
    reject: Vec<DistinguishedName>,
}

impl RuleGroup {
    fn parse(property: &str, text: &str) -> Result<Self> {
        let patterns = parse_pattern_list(text)
            .map_err(|err| TransportError::config(property, err.to_string()))?;
        let mut group = Self::default();
        for pattern in patterns {
            if pattern.reject {
                group.reject.push(pattern.name);
            } else {
                group.accept.push(pattern.name);
            }
        }
        Ok(group)
    }

    fn is_empty(&self) -> bool {
        self.accept.is_empty() && self.reject.is_empty()
    }
}

/// 基于主题 DN 的信任管理器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 链校验只回答“证书是否由受信 CA 签发”，而部署往往还需要回答“是不是我期望的那一方”；
///   `Spark.Tls.TrustOnly*` 以 DN 模式列表表达这层授权。
///
/// ## 逻辑（How）
/// - 规则分为 all / client / server / server.<adapter> 四组，出站连接适用 all + client，
///   入站连接适用 all + server + 当前适配器；
/// - 证书主题渲染为 RFC 2253 文本后严格解析，再对每个模式做集合包含匹配；
/// - 任一拒绝模式命中即拒绝；否则任一接受模式命中即接受；
///   适用的组里一个接受模式都没有时，未被拒绝即接受。
///
/// ## 契约（What）
/// - 没有任何适用规则：接受（即使对端没有证书）；
/// - 有规则但对端没有证书：拒绝；
/// - 主题无法渲染或解析：记录告警并拒绝。
#[derive(Clone, Debug, Default)]
pub struct TrustManager {
    all: RuleGroup,
    client: RuleGroup,
    server: RuleGroup,
    adapters: BTreeMap<String, RuleGroup>,
    trace: TraceLevels,
}

impl TrustManager {
    /// 读取全部 `Spark.Tls.TrustOnly*` 属性；语法错误返回携带属性名的配置错误。
    pub fn from_properties(properties: &Properties, trace: TraceLevels) -> Result<Self> {
        let group = |key: &str| -> Result<RuleGroup> {
            properties
                .get_property(key)
                .map_or_else(|| Ok(RuleGroup::default()), |text| RuleGroup::parse(key, text))
        };
        let mut adapters = BTreeMap::new();
        for (key, text) in properties.get_properties_for_prefix(TRUST_ONLY_SERVER_ADAPTER) {
            let adapter = &key[TRUST_ONLY_SERVER_ADAPTER.len()..];
            if adapter.is_empty() {
                continue;
            }
            adapters.insert(adapter.to_owned(), RuleGroup::parse(key, text)?);
        }
        Ok(Self {
            all: group(TRUST_ONLY)?,
            client: group(TRUST_ONLY_CLIENT)?,
            server: group(TRUST_ONLY_SERVER)?,
            adapters,
            trace,
        })
    }

    fn applicable<'a>(&'a self, info: &TlsConnectionInfo) -> Vec<&'a RuleGroup> {
        let mut groups = vec![&self.all];
        if info.incoming() {
            groups.push(&self.server);
            if let Some(adapter) = self.adapters.get(info.adapter_name()) {
                groups.push(adapter);
            }
        } else {
            groups.push(&self.client);
        }
        groups.retain(|group| !group.is_empty());
        groups
    }

    /// 判断连接的对端是否受信。
    pub fn verify(&self, info: &TlsConnectionInfo) -> bool {
        let groups = self.applicable(info);
        if groups.is_empty() {
            return true;
        }
        let Some(subject) = info.peer_subject() else {
            if self.trace.security_enabled(1) {
                debug!(target: SECURITY_TARGET, "trust manager rejected connection: peer presented no certificate");
            }
            return false;
        };
        let subject = match subject {
            Ok(text) => text,
            Err(err) => {
                warn!(target: SECURITY_TARGET, error = %err, "cannot render peer certificate subject");
                return false;
            }
        };
        let name = match DistinguishedName::parse(&subject) {
            Ok(name) => name,
            Err(err) => {
                warn!(target: SECURITY_TARGET, %subject, error = %err, "cannot parse peer certificate subject");
                return false;
            }
        };

        if let Some(pattern) = groups
            .iter()
            .flat_map(|group| group.reject.iter())
            .find(|pattern| name.contains(pattern))
        {
            if self.trace.security_enabled(1) {
                debug!(target: SECURITY_TARGET, %subject, %pattern, "trust manager rejected peer: matched reject rule");
            }
            return false;
        }

        let mut accept = groups.iter().flat_map(|group| group.accept.iter()).peekable();
        if accept.peek().is_none() {
            return true;
        }
        let trusted = accept.any(|pattern| name.contains(pattern));
        if !trusted && self.trace.security_enabled(1) {
            debug!(target: SECURITY_TARGET, %subject, "trust manager rejected peer: no accept rule matched");
        }
        trusted
    }
}
