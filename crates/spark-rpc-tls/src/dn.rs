//! RFC 2253 可分辨名（DN）的解析、转义与集合匹配。
//!
//! 信任规则与证书存储查询都以 DN 文本为输入，二者共享这里的语法：
//! - RDN 之间以 `,` 分隔，多值 RDN 内部以 `+` 分隔（匹配时展开为独立的属性对）；
//! - 值可以是普通字符串（`\` 转义特殊字符或十六进制字节对）、双引号字符串或 `#` 开头的十六进制串；
//! - 属性名统一转为大写，并归一化同义词 `EMAILADDRESS → E`、`ST → S`。

use std::fmt;

use thiserror::Error;

/// DN 文本解析失败的原因。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnError {
    #[error("unexpected end of input in `{0}`")]
    UnexpectedEnd(String),
    #[error("expected `=` after attribute type in `{0}`")]
    MissingEquals(String),
    #[error("invalid attribute type `{key}` in `{text}`")]
    InvalidKey { key: String, text: String },
    #[error("invalid escape sequence in `{0}`")]
    InvalidEscape(String),
    #[error("unterminated quoted value in `{0}`")]
    UnterminatedQuote(String),
    #[error("unexpected character `{found}` in `{text}`")]
    UnexpectedChar { found: char, text: String },
    #[error("escaped bytes are not valid UTF-8 in `{0}`")]
    InvalidUtf8(String),
}

/// 一个属性对。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RdnPair {
    pub key: String,
    pub value: String,
}

/// 展开后的可分辨名：按出现顺序排列的属性对。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DistinguishedName {
    pairs: Vec<RdnPair>,
}

impl DistinguishedName {
    /// 严格解析一个 DN。
    pub fn parse(text: &str) -> Result<Self, DnError> {
        let mut parser = Parser::new(text);
        let pairs = parser.dn(false)?;
        Ok(Self { pairs })
    }

    pub fn pairs(&self) -> &[RdnPair] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// 集合包含匹配：`pattern` 中每个属性对都必须以相同的键与值出现在 `self` 中。
    pub fn contains(&self, pattern: &DistinguishedName) -> bool {
        pattern.pairs.iter().all(|required| {
            self.pairs
                .iter()
                .any(|pair| pair.key == required.key && pair.value == required.value)
        })
    }

    /// 与另一个 DN 的属性集合完全相同（顺序无关）。
    pub fn same_attributes(&self, other: &DistinguishedName) -> bool {
        self.pairs.len() == other.pairs.len() && self.contains(other) && other.contains(self)
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, pair) in self.pairs.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", pair.key, escape_value(&pair.value))?;
        }
        Ok(())
    }
}

/// 信任列表中的一项：匹配模式及其是否为拒绝模式（`!` 前缀）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnPattern {
    pub reject: bool,
    pub name: DistinguishedName,
}

/// 解析以 `;` 分隔的 DN 列表，每项可带 `!` 前缀。
pub fn parse_pattern_list(text: &str) -> Result<Vec<DnPattern>, DnError> {
    let mut parser = Parser::new(text);
    let mut patterns = Vec::new();
    loop {
        parser.skip_spaces();
        if parser.at_end() {
            break;
        }
        let reject = parser.eat('!');
        let pairs = parser.dn(true)?;
        patterns.push(DnPattern {
            reject,
            name: DistinguishedName { pairs },
        });
        parser.skip_spaces();
        if !parser.eat(';') && !parser.at_end() {
            return Err(parser.unexpected());
        }
    }
    Ok(patterns)
}

/// 归一化属性名。
pub fn normalize_key(key: &str) -> String {
    let upper = key.trim().to_ascii_uppercase();
    let stripped = upper.strip_prefix("OID.").unwrap_or(&upper);
    match stripped {
        "EMAILADDRESS" => "E".to_owned(),
        "ST" => "S".to_owned(),
        other => other.to_owned(),
    }
}

/// 按 RFC 2253 转义属性值。
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (index, c) in value.chars().enumerate() {
        let needs_escape = matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=')
            || (index == 0 && (c == '#' || c == ' '))
            || (index == last && c == ' ');
        if needs_escape {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

struct Parser<'a> {
    text: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            chars: text.chars().collect(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(' ') {
            self.pos += 1;
        }
    }

    fn unexpected(&self) -> DnError {
        match self.peek() {
            Some(found) => DnError::UnexpectedChar {
                found,
                text: self.text.to_owned(),
            },
            None => DnError::UnexpectedEnd(self.text.to_owned()),
        }
    }

    /// 解析一个 DN；`in_list` 为真时遇到 `;` 停止。
    fn dn(&mut self, in_list: bool) -> Result<Vec<RdnPair>, DnError> {
        let mut pairs = Vec::new();
        loop {
            self.skip_spaces();
            if self.at_end() || (in_list && self.peek() == Some(';')) {
                if pairs.is_empty() {
                    return Err(DnError::UnexpectedEnd(self.text.to_owned()));
                }
                return Ok(pairs);
            }
            pairs.push(self.attribute()?);
            self.skip_spaces();
            match self.peek() {
                None => return Ok(pairs),
                Some(',') | Some('+') => {
                    self.pos += 1;
                    self.skip_spaces();
                    if self.at_end() {
                        return Err(DnError::UnexpectedEnd(self.text.to_owned()));
                    }
                }
                Some(';') if in_list => return Ok(pairs),
                Some(_) => return Err(self.unexpected()),
            }
        }
    }

    fn attribute(&mut self) -> Result<RdnPair, DnError> {
        let key = self.key()?;
        self.skip_spaces();
        if !self.eat('=') {
            return Err(DnError::MissingEquals(self.text.to_owned()));
        }
        self.skip_spaces();
        let value = self.value()?;
        Ok(RdnPair {
            key: normalize_key(&key),
            value,
        })
    }

    fn key(&mut self) -> Result<String, DnError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let key: String = self.chars[start..self.pos].iter().collect();
        let valid = key
            .chars()
            .next()
            .is_some_and(|first| first.is_ascii_alphabetic() || first.is_ascii_digit());
        if !valid {
            if self.at_end() {
                return Err(DnError::UnexpectedEnd(self.text.to_owned()));
            }
            return Err(DnError::InvalidKey {
                key,
                text: self.text.to_owned(),
            });
        }
        Ok(key)
    }

    fn value(&mut self) -> Result<String, DnError> {
        match self.peek() {
            Some('"') => self.quoted_value(),
            Some('#') => Ok(self.hex_value()),
            _ => self.plain_value(),
        }
    }

    fn hex_value(&mut self) -> String {
        let start = self.pos;
        self.pos += 1;
        while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn quoted_value(&mut self) -> Result<String, DnError> {
        self.pos += 1;
        let mut bytes = Vec::new();
        loop {
            match self.peek() {
                None => return Err(DnError::UnterminatedQuote(self.text.to_owned())),
                Some('"') => {
                    self.pos += 1;
                    break;
                }
                Some('\\') => self.escape(&mut bytes)?,
                Some(c) => {
                    push_char(&mut bytes, c);
                    self.pos += 1;
                }
            }
        }
        String::from_utf8(bytes).map_err(|_| DnError::InvalidUtf8(self.text.to_owned()))
    }

    fn plain_value(&mut self) -> Result<String, DnError> {
        let mut bytes = Vec::new();
        let mut significant = 0;
        while let Some(c) = self.peek() {
            match c {
                ',' | '+' | ';' => break,
                '\\' => {
                    self.escape(&mut bytes)?;
                    significant = bytes.len();
                }
                '"' | '<' | '>' | '=' => return Err(self.unexpected()),
                c => {
                    push_char(&mut bytes, c);
                    self.pos += 1;
                    if c != ' ' {
                        significant = bytes.len();
                    }
                }
            }
        }
        bytes.truncate(significant);
        String::from_utf8(bytes).map_err(|_| DnError::InvalidUtf8(self.text.to_owned()))
    }

    /// 处理 `\` 转义：特殊字符原样保留，十六进制字节对解码为原始字节。
    fn escape(&mut self, bytes: &mut Vec<u8>) -> Result<(), DnError> {
        self.pos += 1;
        let Some(first) = self.peek() else {
            return Err(DnError::InvalidEscape(self.text.to_owned()));
        };
        if first.is_ascii_hexdigit()
            && let Some(second) = self.chars.get(self.pos + 1).copied()
            && second.is_ascii_hexdigit()
        {
            let pair: String = [first, second].iter().collect();
            let byte = u8::from_str_radix(&pair, 16)
                .map_err(|_| DnError::InvalidEscape(self.text.to_owned()))?;
            bytes.push(byte);
            self.pos += 2;
            return Ok(());
        }
        if matches!(
            first,
            ',' | '=' | '+' | '<' | '>' | '#' | ';' | '\\' | '"' | ' '
        ) {
            push_char(bytes, first);
            self.pos += 1;
            return Ok(());
        }
        Err(DnError::InvalidEscape(self.text.to_owned()))
    }
}

fn push_char(bytes: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dn(text: &str) -> DistinguishedName {
        DistinguishedName::parse(text).expect("合法 DN")
    }

    #[test]
    fn superset_subject_matches_pattern() {
        let pattern = dn("CN=Test,O=Org");
        assert!(dn("CN=Test,O=Org,C=US").contains(&pattern));
        assert!(!dn("CN=Test,C=US").contains(&pattern));
        assert!(!dn("CN=Other,O=Org").contains(&pattern));
    }

    #[test]
    fn keys_are_normalized() {
        let parsed = dn("emailAddress=a@b.c, st=Bavaria, oid.2.5.4.3=x");
        let keys: Vec<_> = parsed.pairs().iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["E", "S", "2.5.4.3"]);
    }

    #[test]
    fn escapes_and_quotes_are_unescaped() {
        let parsed = dn(r#"CN=Acme\, Inc.,O="Quoted, Name",OU=caf\C3\A9,L=trail\ "#);
        let values: Vec<_> = parsed.pairs().iter().map(|p| p.value.as_str()).collect();
        assert_eq!(values, vec!["Acme, Inc.", "Quoted, Name", "café", "trail "]);
    }

    #[test]
    fn multi_valued_rdns_are_flattened() {
        let parsed = dn("CN=a+UID=7,O=b");
        assert_eq!(parsed.pairs().len(), 3);
        assert!(parsed.contains(&dn("UID=7")));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(DistinguishedName::parse("CN").is_err());
        assert!(DistinguishedName::parse("CN=a,").is_err());
        assert!(DistinguishedName::parse(r#"CN="open"#).is_err());
        assert!(DistinguishedName::parse(r"CN=bad\q").is_err());
        assert!(DistinguishedName::parse("=value").is_err());
    }

    #[test]
    fn pattern_list_splits_on_semicolons() {
        let patterns = parse_pattern_list("CN=a,O=x; !CN=b ;CN=c").unwrap();
        assert_eq!(patterns.len(), 3);
        assert!(!patterns[0].reject);
        assert!(patterns[1].reject);
        assert_eq!(patterns[1].name, dn("CN=b"));
    }

    #[test]
    fn escape_round_trips_through_parser() {
        let original = " #lead, and \"quotes\"+more ";
        let text = format!("CN={}", escape_value(original));
        assert_eq!(dn(&text).pairs()[0].value, original);
    }
}
