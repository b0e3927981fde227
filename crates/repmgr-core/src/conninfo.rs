//! Connection parameter lists.
//!
//! A conninfo string is a sequence of `keyword=value` pairs. Parameter
//! lists preserve insertion order so that a parsed-then-reserialised
//! string is deterministic, which registration relies on when comparing
//! stored conninfo values.

use repmgr_proto::{RepmgrError, RepmgrResult};

/// Ordered keyword/value connection parameter list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConninfoParams {
    params: Vec<(String, String)>,
}

impl ConninfoParams {
    pub fn new() -> Self {
        Self { params: Vec::new() }
    }

    /// Parse a conninfo string into a parameter list.
    ///
    /// Accepts unquoted values and single-quoted values with `\'` and `\\`
    /// escapes, the same forms the driver accepts.
    pub fn parse(conninfo: &str) -> RepmgrResult<Self> {
        let mut list = Self::new();
        let mut chars = conninfo.chars().peekable();

        loop {
            // skip leading whitespace
            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }
            if chars.peek().is_none() {
                break;
            }

            // keyword up to '='
            let mut key = String::new();
            for c in chars.by_ref() {
                if c == '=' {
                    break;
                }
                if c.is_whitespace() {
                    // allow "keyword = value"
                    continue;
                }
                key.push(c);
            }
            if key.is_empty() {
                return Err(RepmgrError::Config(format!(
                    "missing keyword in conninfo string \"{}\"",
                    conninfo
                )));
            }

            // optional whitespace before the value
            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }

            let mut value = String::new();
            match chars.peek() {
                Some('\'') => {
                    chars.next();
                    let mut closed = false;
                    while let Some(c) = chars.next() {
                        match c {
                            '\\' => {
                                if let Some(esc) = chars.next() {
                                    value.push(esc);
                                }
                            }
                            '\'' => {
                                closed = true;
                                break;
                            }
                            _ => value.push(c),
                        }
                    }
                    if !closed {
                        return Err(RepmgrError::Config(format!(
                            "unterminated quoted value in conninfo string \"{}\"",
                            conninfo
                        )));
                    }
                }
                _ => {
                    while let Some(&c) = chars.peek() {
                        if c.is_whitespace() {
                            break;
                        }
                        value.push(c);
                        chars.next();
                    }
                }
            }

            list.set(&key, &value);
        }

        Ok(list)
    }

    /// Look up a parameter value.
    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == keyword)
            .map(|(_, v)| v.as_str())
    }

    /// Set a parameter, replacing any existing value in place.
    pub fn set(&mut self, keyword: &str, value: &str) {
        if let Some(entry) = self.params.iter_mut().find(|(k, _)| k == keyword) {
            entry.1 = value.to_string();
        } else {
            self.params.push((keyword.to_string(), value.to_string()));
        }
    }

    /// Set a parameter only if it is not already present.
    pub fn set_if_not_exists(&mut self, keyword: &str, value: &str) {
        if self.get(keyword).is_none() {
            self.set(keyword, value);
        }
    }

    /// Remove a parameter, returning its previous value.
    pub fn remove(&mut self, keyword: &str) -> Option<String> {
        let idx = self.params.iter().position(|(k, _)| k == keyword)?;
        Some(self.params.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Serialise back to a conninfo string in insertion order.
    ///
    /// Values that are empty or contain whitespace, quotes or backslashes
    /// are single-quoted with escaping.
    pub fn to_conninfo_string(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.params {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(k);
            out.push('=');
            if v.is_empty() || v.chars().any(|c| c.is_whitespace() || c == '\'' || c == '\\') {
                out.push('\'');
                for c in v.chars() {
                    if c == '\'' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('\'');
            } else {
                out.push_str(v);
            }
        }
        out
    }
}

impl std::fmt::Display for ConninfoParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_conninfo_string())
    }
}

/// Extract a single keyword's value from a conninfo string.
pub fn get_conninfo_value(conninfo: &str, keyword: &str) -> Option<String> {
    ConninfoParams::parse(conninfo)
        .ok()
        .and_then(|p| p.get(keyword).map(|v| v.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let p = ConninfoParams::parse("host=node1 port=5432 dbname=repmgr user=repmgr").unwrap();
        assert_eq!(p.get("host"), Some("node1"));
        assert_eq!(p.get("port"), Some("5432"));
        assert_eq!(p.get("dbname"), Some("repmgr"));
        assert_eq!(p.get("missing"), None);
    }

    #[test]
    fn test_parse_quoted_values() {
        let p = ConninfoParams::parse(r"host=n1 password='it\'s \\here'").unwrap();
        assert_eq!(p.get("password"), Some(r"it's \here"));
    }

    #[test]
    fn test_parse_spaces_around_equals() {
        let p = ConninfoParams::parse("host = node1 port =5432").unwrap();
        assert_eq!(p.get("host"), Some("node1"));
        assert_eq!(p.get("port"), Some("5432"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(ConninfoParams::parse("host=n1 password='oops").is_err());
        assert!(ConninfoParams::parse("=value").is_err());
    }

    #[test]
    fn test_roundtrip_preserves_order() {
        let s = "host=node1 port=5432 dbname=repmgr user=repmgr connect_timeout=2";
        let p = ConninfoParams::parse(s).unwrap();
        assert_eq!(p.to_conninfo_string(), s);
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut p = ConninfoParams::parse("host=node1 port=5432").unwrap();
        p.set("host", "node2");
        assert_eq!(p.to_conninfo_string(), "host=node2 port=5432");

        p.set_if_not_exists("host", "node3");
        assert_eq!(p.get("host"), Some("node2"));

        p.set_if_not_exists("user", "repmgr");
        assert_eq!(p.to_conninfo_string(), "host=node2 port=5432 user=repmgr");
    }

    #[test]
    fn test_quoting_on_output() {
        let mut p = ConninfoParams::new();
        p.set("password", "two words");
        p.set("options", "");
        assert_eq!(p.to_conninfo_string(), "password='two words' options=''");
        // and it parses back
        let q = ConninfoParams::parse(&p.to_conninfo_string()).unwrap();
        assert_eq!(q.get("password"), Some("two words"));
        assert_eq!(q.get("options"), Some(""));
    }
}
