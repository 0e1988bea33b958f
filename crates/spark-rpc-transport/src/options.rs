use std::{
    cmp::Ordering,
    net::IpAddr,
};

use crate::{
    error::{Result, TransportError},
    hash::{hash_add_i32, hash_add_ip, hash_add_str},
};

/// 把端点描述拆分为参数列表。
///
/// 以空白分隔，支持 `"…"` 与 `'…'` 引号（引号本身被剥离），双引号内允许 `\"` 与 `\\` 转义。
/// 引号未闭合时失败，错误中携带原始字符串以便诊断。
pub fn split_options(text: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                in_token = true;
                let quote = c;
                let mut closed = false;
                while let Some(inner) = chars.next() {
                    if inner == quote {
                        closed = true;
                        break;
                    }
                    if inner == '\\' && quote == '"' {
                        match chars.peek() {
                            Some(&next) if next == '"' || next == '\\' => {
                                current.push(next);
                                chars.next();
                            }
                            _ => current.push(inner),
                        }
                    } else {
                        current.push(inner);
                    }
                }
                if !closed {
                    return Err(TransportError::endpoint_parse(text, "mismatched quote"));
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }
    if in_token {
        args.push(current);
    }
    Ok(args)
}

/// 判断 `next` 是否可以作为上一个选项的参数。
///
/// 以 `-` 开头的记号通常是下一个选项，但负整数（例如 `-t -1`）仍视作参数。
pub fn is_option_argument(next: &str) -> bool {
    !next.starts_with('-') || next.parse::<i64>().is_ok()
}

/// 按“选项 + 可选参数”的形式遍历参数表，把每一对交给 `handler`。
///
/// `handler` 返回 `Ok(false)` 表示未识别该选项，此时以“unrecognized option”失败。
pub fn for_each_option<F>(args: &[String], endpoint: &str, mut handler: F) -> Result<()>
where
    F: FnMut(&str, Option<&str>) -> Result<bool>,
{
    let mut index = 0;
    while index < args.len() {
        let option = args[index].as_str();
        if !option.starts_with('-') || option.len() < 2 {
            return Err(TransportError::endpoint_parse(
                endpoint,
                format!("expected an option but found `{option}`"),
            ));
        }
        let argument = args
            .get(index + 1)
            .map(String::as_str)
            .filter(|next| is_option_argument(next));
        if argument.is_some() {
            index += 1;
        }
        if !handler(option, argument)? {
            return Err(TransportError::endpoint_parse(
                endpoint,
                format!("unrecognized option `{option}`"),
            ));
        }
        index += 1;
    }
    Ok(())
}

/// 要求选项必须带参数。
pub fn require_argument<'a>(
    option: &str,
    argument: Option<&'a str>,
    endpoint: &str,
) -> Result<&'a str> {
    argument.ok_or_else(|| {
        TransportError::endpoint_parse(
            endpoint,
            format!("no argument provided for `{option}` option"),
        )
    })
}

/// 当文本包含 `:` 时加上双引号，避免与 IPv6 冒号混淆。
pub fn quote_if_needed(value: &str) -> String {
    if value.contains(':') {
        format!("\"{value}\"")
    } else {
        value.to_owned()
    }
}

/// IP 类端点的公共字段与公共选项解析。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - TCP、TLS 等基于 IP 的传输共享 `-h`、`-p`、`--sourceAddress` 三个选项；
///   把它们收敛到一个结构体中，具体传输只需处理自身特有的选项（如 `-t`、`-z`），
///   未识别的选项再委托给这里；
/// - 连接 ID 不出现在文本形式中，但参与相等性比较，同样放在公共部分。
///
/// ## 契约（What）
/// - `check_option`：识别公共选项返回 `Ok(true)`，未识别返回 `Ok(false)`；
/// - `host` 为空字符串表示通配地址（仅监听端点合法）或“未配置”（由调用方补默认主机）；
/// - `compare_base`：与传输种类无关的基础比较，只比较源地址，其余字段由具体端点按约定顺序比较。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct IpEndpointBase {
    pub host: String,
    pub port: u16,
    pub source_address: Option<IpAddr>,
    pub connection_id: String,
    host_set: bool,
}

impl IpEndpointBase {
    /// 以完整字段构造。
    pub fn new(
        host: impl Into<String>,
        port: u16,
        source_address: Option<IpAddr>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            source_address,
            connection_id: connection_id.into(),
            host_set: true,
        }
    }

    /// 解析阶段：是否显式给出了 `-h`。
    pub fn host_was_set(&self) -> bool {
        self.host_set
    }

    /// 识别公共选项。
    pub fn check_option(
        &mut self,
        option: &str,
        argument: Option<&str>,
        endpoint: &str,
        adapter_endpoint: bool,
    ) -> Result<bool> {
        match option {
            "-h" => {
                let host = require_argument(option, argument, endpoint)?;
                if host == "*" {
                    if !adapter_endpoint {
                        return Err(TransportError::endpoint_parse(
                            endpoint,
                            "`-h *` not valid for proxy endpoint",
                        ));
                    }
                    self.host.clear();
                } else {
                    self.host = host.to_owned();
                }
                self.host_set = true;
                Ok(true)
            }
            "-p" => {
                let value = require_argument(option, argument, endpoint)?;
                let port = value
                    .parse::<i64>()
                    .ok()
                    .filter(|port| (0..=65535).contains(port))
                    .ok_or_else(|| {
                        TransportError::endpoint_parse(
                            endpoint,
                            format!("invalid port value `{value}`"),
                        )
                    })?;
                self.port = port as u16;
                Ok(true)
            }
            "--sourceAddress" => {
                if adapter_endpoint {
                    return Err(TransportError::endpoint_parse(
                        endpoint,
                        "`--sourceAddress` not valid for object adapter endpoint",
                    ));
                }
                let value = require_argument(option, argument, endpoint)?;
                let address = value.parse::<IpAddr>().map_err(|_| {
                    TransportError::endpoint_parse(
                        endpoint,
                        format!("invalid IP address provided for `--sourceAddress`: `{value}`"),
                    )
                })?;
                self.source_address = Some(address);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// 公共选项的文本形式。
    pub fn options_string(&self) -> String {
        let mut s = String::new();
        if !self.host.is_empty() {
            s.push_str(" -h ");
            s.push_str(&quote_if_needed(&self.host));
        }
        s.push_str(&format!(" -p {}", self.port));
        if let Some(source) = &self.source_address {
            s.push_str(" --sourceAddress ");
            s.push_str(&quote_if_needed(&source.to_string()));
        }
        s
    }

    /// 累加公共字段的哈希。
    pub fn hash_into(&self, hash: i32) -> i32 {
        let mut h = hash_add_str(hash, &self.host);
        h = hash_add_i32(h, i32::from(self.port));
        if let Some(source) = &self.source_address {
            h = hash_add_ip(h, source);
        }
        hash_add_str(h, &self.connection_id)
    }

    /// 与传输种类无关的基础比较。
    pub fn compare_base(&self, other: &Self) -> Ordering {
        self.source_address.cmp(&other.source_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_strips_quotes() {
        let args = split_options(r#"-h "fe80::1" -p 10 -x 'a b'"#).expect("引号闭合");
        assert_eq!(args, vec!["-h", "fe80::1", "-p", "10", "-x", "a b"]);
    }

    #[test]
    fn split_rejects_unterminated_quote() {
        let err = split_options(r#"-h "oops -p 1"#).unwrap_err();
        assert!(matches!(err, TransportError::EndpointParse { .. }));
    }

    #[test]
    fn negative_integers_are_arguments() {
        assert!(is_option_argument("-1"));
        assert!(!is_option_argument("-z"));
        assert!(is_option_argument("30000"));
    }

    #[test]
    fn base_rejects_out_of_range_port() {
        let mut base = IpEndpointBase::default();
        let err = base
            .check_option("-p", Some("65536"), "ssl -p 65536", false)
            .unwrap_err();
        assert!(err.to_string().contains("invalid port value"));
    }

    #[test]
    fn wildcard_host_only_for_adapters() {
        let mut base = IpEndpointBase::default();
        assert!(base.check_option("-h", Some("*"), "ssl -h *", true).unwrap());
        assert!(base.host.is_empty());
        assert!(base.host_was_set());

        let mut client = IpEndpointBase::default();
        assert!(client.check_option("-h", Some("*"), "ssl -h *", false).is_err());
    }

    #[test]
    fn options_string_quotes_ipv6() {
        let base = IpEndpointBase::new("fe80::1", 10000, None, "");
        assert_eq!(base.options_string(), " -h \"fe80::1\" -p 10000");
        let base = IpEndpointBase::new("example.com", 10000, None, "");
        assert_eq!(base.options_string(), " -h example.com -p 10000");
    }
}
