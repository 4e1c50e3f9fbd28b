//! Flat key/value configuration.
//!
//! Keys are case-insensitive and follow a `[role.]component.sub.option`
//! convention. Sources in increasing priority: defaults supplied at the
//! accessor call, the literal string handed to the constructor, then files
//! pulled in by `config.additional_files` (and
//! `config.additional_files.env_name.if_defined`). Reference expansion runs
//! once, during bootstrap init.
//!
//! Every typed accessor records `(key, type, default)` in a process-wide
//! registry (`configlog`) so the `/config` hook can show which settings an
//! application ever asked for.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{CommonError, CommonResult};

/// File syntax: whitespace-separated `key value` lines, `key.[] value` for
/// multi-value appends, `#` comments.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    entries: BTreeMap<String, String>,
}

impl Configuration {
    pub fn new() -> Self {
        Configuration { entries: BTreeMap::new() }
    }

    /// Build from a literal block of config lines.
    pub fn from_str_literal(s: &str) -> Self {
        let mut c = Configuration::new();
        c.append_from_string(s);
        c
    }

    /// Parse config lines and fold them in (later lines win).
    pub fn append_from_string(&mut self, s: &str) {
        for raw_line in s.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k, v.trim()),
                None => (line, ""),
            };
            self.append_entry(key, value);
        }
    }

    /// Single entry; a `.[]` key suffix appends (newline-joined) instead of
    /// replacing.
    pub fn append_entry(&mut self, key: &str, value: &str) {
        if let Some(base) = key.strip_suffix(".[]") {
            let k = base.to_lowercase();
            match self.entries.get_mut(&k) {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => {
                    self.entries.insert(k, value.to_string());
                }
            }
        } else {
            self.entries.insert(key.to_lowercase(), value.to_string());
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_lowercase(), value.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_lowercase())
    }

    fn get_raw(&self, key: &str) -> Option<&str> {
        self.entries.get(&key.to_lowercase()).map(|s| s.as_str())
    }

    pub fn append_from_file(&mut self, path: &str) -> CommonResult<()> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| CommonError::ConfigFile(path.to_string()))?;
        self.append_from_string(&text);
        Ok(())
    }

    /// Expand `config.additional_files` (a whitespace/newline separated list
    /// of paths) and `config.additional_files.env_name.if_defined` (env vars
    /// naming files, silently skipped when unset). Bootstrap calls this
    /// exactly once per Init.
    pub fn append_from_references(&mut self) -> CommonResult<()> {
        if let Some(files) = self.get_raw("config.additional_files").map(|s| s.to_string()) {
            for path in files.split_whitespace() {
                self.append_from_file(path)?;
            }
        }
        if let Some(vars) = self
            .get_raw("config.additional_files.env_name.if_defined")
            .map(|s| s.to_string())
        {
            for var in vars.split_whitespace() {
                if let Ok(path) = std::env::var(var) {
                    self.append_from_file(&path)?;
                }
            }
        }
        Ok(())
    }

    // -- typed accessors ----------------------------------------------------

    pub fn get_string(&self, key: &str, default: &str) -> String {
        configlog_record(key, "string", default);
        self.get_raw(key).unwrap_or(default).to_string()
    }

    pub fn get_lowercase_string(&self, key: &str, default: &str) -> String {
        self.get_string(key, default).to_lowercase()
    }

    pub fn get_bool(&self, key: &str, default: &str) -> CommonResult<bool> {
        configlog_record(key, "bool", default);
        let v = self.get_raw(key).unwrap_or(default);
        match v.to_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" | "" => Ok(false),
            _ => Err(CommonError::BadConfigValue { key: key.to_string(), value: v.to_string() }),
        }
    }

    pub fn get_int(&self, key: &str, default: &str) -> CommonResult<i64> {
        configlog_record(key, "int", default);
        let v = self.get_raw(key).unwrap_or(default);
        v.parse::<i64>()
            .map_err(|_| CommonError::BadConfigValue { key: key.to_string(), value: v.to_string() })
    }

    pub fn get_uint(&self, key: &str, default: &str) -> CommonResult<u64> {
        configlog_record(key, "uint", default);
        let v = self.get_raw(key).unwrap_or(default);
        v.parse::<u64>()
            .map_err(|_| CommonError::BadConfigValue { key: key.to_string(), value: v.to_string() })
    }

    /// Duration in microseconds; the value may carry an `ns`/`us`/`ms`/`s`/
    /// `m`/`h` suffix. A bare number is microseconds.
    pub fn get_time_us(&self, key: &str, default: &str) -> CommonResult<u64> {
        configlog_record(key, "time", default);
        let v = self.get_raw(key).unwrap_or(default);
        parse_time_us(v)
            .ok_or_else(|| CommonError::BadConfigValue { key: key.to_string(), value: v.to_string() })
    }

    /// Size in bytes; the value may carry a `k`/`m`/`g` suffix (powers of
    /// two).
    pub fn get_size(&self, key: &str, default: &str) -> CommonResult<u64> {
        configlog_record(key, "size", default);
        let v = self.get_raw(key).unwrap_or(default);
        parse_size(v)
            .ok_or_else(|| CommonError::BadConfigValue { key: key.to_string(), value: v.to_string() })
    }

    // -- role-aware lookup --------------------------------------------------

    pub fn node_role(&self) -> String {
        self.get_raw("node_role").unwrap_or("default").to_string()
    }

    /// Look up `name` under a component prefix: `<role>.<component>.<name>`
    /// first, then `<component>.<name>`, then bare `<name>`.
    pub fn get_component_setting(&self, component: &str, name: &str, default: &str) -> String {
        configlog_record(&format!("{}.{}", component, name), "string", default);
        let role = self.node_role();
        let candidates = [
            format!("{}.{}.{}", role, component, name),
            format!("{}.{}", component, name),
            name.to_string(),
        ];
        for key in &candidates {
            if let Some(v) = self.get_raw(key) {
                return v.to_string();
            }
        }
        default.to_string()
    }

    pub fn get_all_settings(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Multi-line dump in file syntax.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.entries {
            out.push_str(k);
            out.push_str("  ");
            out.push_str(v);
            out.push('\n');
        }
        out
    }
}

fn parse_time_us(v: &str) -> Option<u64> {
    let v = v.trim().to_lowercase();
    let (num, scale_num, scale_den) = if let Some(n) = v.strip_suffix("ns") {
        (n.to_string(), 1u64, 1000u64)
    } else if let Some(n) = v.strip_suffix("us") {
        (n.to_string(), 1, 1)
    } else if let Some(n) = v.strip_suffix("ms") {
        (n.to_string(), 1000, 1)
    } else if let Some(n) = v.strip_suffix('h') {
        (n.to_string(), 3_600_000_000, 1)
    } else if let Some(n) = v.strip_suffix('m') {
        (n.to_string(), 60_000_000, 1)
    } else if let Some(n) = v.strip_suffix('s') {
        (n.to_string(), 1_000_000, 1)
    } else {
        (v.clone(), 1, 1)
    };
    let n: u64 = num.trim().parse().ok()?;
    Some(n.saturating_mul(scale_num) / scale_den)
}

fn parse_size(v: &str) -> Option<u64> {
    let v = v.trim().to_lowercase();
    let (num, mult) = if let Some(n) = v.strip_suffix('k') {
        (n.to_string(), 1024u64)
    } else if let Some(n) = v.strip_suffix('m') {
        (n.to_string(), 1024 * 1024)
    } else if let Some(n) = v.strip_suffix('g') {
        (n.to_string(), 1024 * 1024 * 1024)
    } else {
        (v.clone(), 1)
    };
    let n: u64 = num.trim().parse().ok()?;
    Some(n.saturating_mul(mult))
}

// -- configlog --------------------------------------------------------------

static CONFIGLOG: Mutex<BTreeMap<String, (String, String)>> = Mutex::new(BTreeMap::new());

fn configlog_record(key: &str, field_type: &str, default: &str) {
    let mut log = CONFIGLOG.lock().unwrap();
    log.entry(key.to_lowercase())
        .or_insert_with(|| (field_type.to_string(), default.to_string()));
}

/// Every `(key, type, default)` any accessor has ever asked for.
pub fn configlog_snapshot() -> Vec<(String, String, String)> {
    let log = CONFIGLOG.lock().unwrap();
    log.iter()
        .map(|(k, (t, d))| (k.clone(), t.clone(), d.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_and_defaults() {
        let c = Configuration::from_str_literal(
            "whookie.port 2112\n\
             # a comment\n\
             server.mutex_type  rwlock\n",
        );
        assert_eq!(c.get_uint("whookie.port", "1990").unwrap(), 2112);
        assert_eq!(c.get_string("whookie.address", "0.0.0.0"), "0.0.0.0");
        assert_eq!(c.get_string("SERVER.MUTEX_TYPE", "x"), "rwlock");
    }

    #[test]
    fn test_bool_and_errors() {
        let c = Configuration::from_str_literal("a true\nb false\nc banana\n");
        assert!(c.get_bool("a", "false").unwrap());
        assert!(!c.get_bool("b", "true").unwrap());
        assert!(c.get_bool("c", "false").is_err());
        assert!(!c.get_bool("missing", "false").unwrap());
    }

    #[test]
    fn test_multi_value_append() {
        let mut c = Configuration::new();
        c.append_from_string("paths.[] /a\npaths.[] /b\n");
        let v = c.get_string("paths", "");
        let items: Vec<&str> = v.split('\n').collect();
        assert_eq!(items, vec!["/a", "/b"]);
    }

    #[test]
    fn test_time_and_size() {
        let c = Configuration::from_str_literal(
            "t1 100us\nt2 2ms\nt3 1s\nt4 500\ns1 4k\ns2 2m\ns3 100\n",
        );
        assert_eq!(c.get_time_us("t1", "0").unwrap(), 100);
        assert_eq!(c.get_time_us("t2", "0").unwrap(), 2000);
        assert_eq!(c.get_time_us("t3", "0").unwrap(), 1_000_000);
        assert_eq!(c.get_time_us("t4", "0").unwrap(), 500);
        assert_eq!(c.get_size("s1", "0").unwrap(), 4096);
        assert_eq!(c.get_size("s2", "0").unwrap(), 2 * 1024 * 1024);
        assert_eq!(c.get_size("s3", "0").unwrap(), 100);
    }

    #[test]
    fn test_role_override() {
        let c = Configuration::from_str_literal(
            "node_role server\n\
             dirman.debug false\n\
             server.dirman.debug true\n",
        );
        assert_eq!(c.get_component_setting("dirman", "debug", "false"), "true");

        let c2 = Configuration::from_str_literal("dirman.debug true\n");
        assert_eq!(c2.get_component_setting("dirman", "debug", "false"), "true");

        let c3 = Configuration::new();
        assert_eq!(c3.get_component_setting("dirman", "debug", "false"), "false");
    }

    #[test]
    fn test_reference_expansion() {
        let dir = std::env::temp_dir();
        let path = dir.join("nexus_config_test_ref.conf");
        std::fs::write(&path, "extra.key  42\n").unwrap();

        let mut c = Configuration::from_str_literal(&format!(
            "config.additional_files {}\n",
            path.display()
        ));
        c.append_from_references().unwrap();
        assert_eq!(c.get_uint("extra.key", "0").unwrap(), 42);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_reference_file_errors() {
        let mut c =
            Configuration::from_str_literal("config.additional_files /no/such/file.conf\n");
        assert!(c.append_from_references().is_err());
    }

    #[test]
    fn test_configlog_records() {
        let c = Configuration::new();
        let _ = c.get_string("configlog.test.unique_key", "abc");
        let snap = configlog_snapshot();
        assert!(snap
            .iter()
            .any(|(k, t, d)| k == "configlog.test.unique_key" && t == "string" && d == "abc"));
    }
}
