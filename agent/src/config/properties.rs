//! Flat `key=value` parser for `agent.properties` (§6).
//!
//! No TOML here — the keys and nesting style the spec describes
//! (`agent.http.metric.listen.ip`, `agent.enable.local.channel`, …) are
//! exactly a Java-`Properties`-style flat map, so a hand-rolled parser is
//! both the simplest and the most faithful choice; `toml` has no use left
//! once `agent.toml`/`tasks.toml` are gone (dropped from the workspace,
//! noted in DESIGN.md).

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, Default)]
pub struct AgentProperties {
    values: HashMap<String, String>,
}

impl AgentProperties {
    pub fn parse(content: &str) -> Result<Self> {
        let mut values = HashMap::new();
        for (lineno, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!("agent.properties:{}: missing '=' in line {:?}", lineno + 1, raw_line);
            };
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.values
            .get(key)
            .and_then(|v| v.parse::<T>().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key).map(|s| s.as_str()) {
            Some("true") | Some("1") | Some("yes") => true,
            Some("false") | Some("0") | Some("no") => false,
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_values_and_skips_comments() {
        let content = "\
# a comment
agent.poll.timeout=10000
agent.http.metric.listen.port = 15777

agent.enable.local.channel=true
";
        let props = AgentProperties::parse(content).unwrap();
        assert_eq!(props.get("agent.poll.timeout"), Some("10000"));
        assert_eq!(props.get_or::<u16>("agent.http.metric.listen.port", 0), 15777);
        assert!(props.get_bool("agent.enable.local.channel", false));
    }

    #[test]
    fn rejects_lines_without_equals() {
        assert!(AgentProperties::parse("not-a-kv-line").is_err());
    }

    #[test]
    fn missing_key_falls_back_to_default() {
        let props = AgentProperties::parse("").unwrap();
        assert_eq!(props.get_or("agent.max.proc.num", 10u32), 10);
    }
}
