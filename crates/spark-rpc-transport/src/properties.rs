use std::{collections::BTreeMap, fs, path::Path};

use tracing::debug;

use crate::error::{Result, TransportError};

/// 扁平化的属性配置源。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 传输插件只关心“键 → 字符串值”的查询，不关心配置来自文件、命令行还是宿主注入；
/// - 保持与属性文件格式一致：`Spark.Tls.CertFile = server.pem`。
///
/// ## 契约（What）
/// - `load_str`：逐行解析 `key = value`，`#` 开头为注释，空值表示删除该键；
/// - `from_toml_str`：把嵌套表展开为点分键，例如 `[Spark.Tls] CertFile = "a"`
///   等价于 `Spark.Tls.CertFile = a`；
/// - 数值读取失败时返回带属性名的 [`TransportError::Config`]。
///
/// ## 风险与权衡（Trade-offs）
/// - 使用 `BTreeMap` 保证前缀遍历有序，便于按适配器名枚举信任规则；
/// - 不支持热更新：插件实例在初始化时读取一次配置，此后不可变。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    /// 创建空配置。
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析 `key = value` 文本。
    pub fn load_str(&mut self, text: &str) -> Result<()> {
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(TransportError::config(
                    format!("line {}", index + 1),
                    format!("missing `=` in `{line}`"),
                ));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(TransportError::config(
                    format!("line {}", index + 1),
                    "empty property key",
                ));
            }
            let value = value.trim();
            if let Some(previous) = self.get_property(key)
                && previous != value
            {
                debug!(key, previous, value, line = index + 1, "overriding property");
            }
            self.set_property(key, value);
        }
        Ok(())
    }

    /// 读取属性文件。
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            TransportError::config(path.display().to_string(), err.to_string())
        })?;
        self.load_str(&text)?;
        debug!(path = %path.display(), entries = self.entries.len(), "loaded properties file");
        Ok(())
    }

    /// 从 TOML 文本构造配置。
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let table: toml::Table = text
            .parse()
            .map_err(|err: toml::de::Error| TransportError::config("toml", err.to_string()))?;
        let mut properties = Self::new();
        flatten_table(&mut properties, "", &table);
        Ok(properties)
    }

    /// 设置属性；空值表示删除。
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if value.is_empty() {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }

    /// 链式设置，便于测试与嵌入式构造。
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_property(key, value);
        self
    }

    /// 读取字符串属性。
    pub fn get_property(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// 读取字符串属性，缺省时返回默认值。
    pub fn get_property_with_default<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get_property(key).unwrap_or(default)
    }

    /// 读取整数属性，缺省时返回默认值。
    pub fn get_property_as_int_with_default(&self, key: &str, default: i32) -> Result<i32> {
        match self.get_property(key) {
            None => Ok(default),
            Some(value) => value.trim().parse::<i32>().map_err(|_| {
                TransportError::config(key, format!("`{value}` is not a valid integer"))
            }),
        }
    }

    /// 读取整数属性，缺省为 0。
    pub fn get_property_as_int(&self, key: &str) -> Result<i32> {
        self.get_property_as_int_with_default(key, 0)
    }

    /// 读取以逗号或空白分隔的列表。
    pub fn get_property_as_list(&self, key: &str) -> Vec<String> {
        self.get_property(key)
            .map(|value| {
                value
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|item| !item.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 枚举所有以 `prefix` 开头的属性，按键排序。
    pub fn get_properties_for_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.entries
            .range(prefix.to_owned()..)
            .take_while(move |(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

fn flatten_table(properties: &mut Properties, prefix: &str, table: &toml::Table) {
    for (key, value) in table {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(nested) => flatten_table(properties, &full, nested),
            toml::Value::String(text) => properties.set_property(full, text.as_str()),
            toml::Value::Array(items) => {
                let joined = items
                    .iter()
                    .map(scalar_to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                properties.set_property(full, joined);
            }
            other => properties.set_property(full, scalar_to_string(other)),
        }
    }
}

fn scalar_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(text) => text.clone(),
        toml::Value::Boolean(flag) => if *flag { "1" } else { "0" }.to_owned(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    #[test]
    #[traced_test]
    fn later_lines_override_earlier_ones() {
        let mut props = Properties::new();
        props
            .load_str("Spark.Tls.VerifyPeer = 2\nSpark.Tls.VerifyPeer = 0\n")
            .unwrap();
        assert_eq!(props.get_property_as_int("Spark.Tls.VerifyPeer").unwrap(), 0);
        assert!(logs_contain("overriding property"));
    }

    #[test]
    fn load_str_skips_comments_and_trims() {
        let mut props = Properties::new();
        props
            .load_str("# comment\n Spark.Tls.VerifyPeer = 1 \n\nSpark.Default.Host=localhost\n")
            .expect("合法属性文本");
        assert_eq!(props.get_property("Spark.Default.Host"), Some("localhost"));
        assert_eq!(props.get_property_as_int("Spark.Tls.VerifyPeer").unwrap(), 1);
    }

    #[test]
    fn invalid_integer_names_property() {
        let props = Properties::new().with("Spark.TCP.Backlog", "many");
        let err = props
            .get_property_as_int_with_default("Spark.TCP.Backlog", 511)
            .unwrap_err();
        assert!(matches!(err, TransportError::Config { ref property, .. } if property == "Spark.TCP.Backlog"));
    }

    #[test]
    fn toml_tables_flatten_to_dotted_keys() {
        let props = Properties::from_toml_str(
            r#"
            [Spark.Tls]
            CertFile = "server.pem"
            VerifyPeer = 2
            UsePlatformCAs = true
            Protocols = ["tls1_2", "tls1_3"]
            "#,
        )
        .expect("合法 TOML");
        assert_eq!(props.get_property("Spark.Tls.CertFile"), Some("server.pem"));
        assert_eq!(props.get_property("Spark.Tls.VerifyPeer"), Some("2"));
        assert_eq!(props.get_property("Spark.Tls.UsePlatformCAs"), Some("1"));
        assert_eq!(
            props.get_property_as_list("Spark.Tls.Protocols"),
            vec!["tls1_2".to_owned(), "tls1_3".to_owned()]
        );
    }

    #[test]
    fn prefix_iteration_is_bounded() {
        let props = Properties::new()
            .with("Spark.Tls.TrustOnly.Server.A", "CN=a")
            .with("Spark.Tls.TrustOnly.Server.B", "CN=b")
            .with("Spark.Tls.VerifyPeer", "2");
        let keys: Vec<_> = props
            .get_properties_for_prefix("Spark.Tls.TrustOnly.Server.")
            .map(|(key, _)| key)
            .collect();
        assert_eq!(
            keys,
            vec!["Spark.Tls.TrustOnly.Server.A", "Spark.Tls.TrustOnly.Server.B"]
        );
    }
}
