//! Line-based configuration.
//!
//! `#` introduces comments. Global keys come first; `[entry]` headers open
//! VDF rule sections with `match=`, `ext=`, `cmd=` keys and optional
//! `env.NAME=` variables. Dotted keys in the global section
//! (`plugin_name.field=value`) are namespaced plugin settings.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use vdf_engine::rules::RuleEntry;

pub const CONFIG_FILE: &str = "repeatfs.conf";

const DEFAULT_STORE_SIZE: u64 = 1 << 30;
const DEFAULT_MAX_CHAIN: u32 = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration line {line}: {reason}")]
    Invalid { line: usize, reason: String },
    #[error("configuration not found at {0}, run `generate` to create one")]
    Missing(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone)]
pub struct Config {
    /// Ordered plugin names from the `plugins=` key.
    pub plugins: Vec<String>,
    /// VDF cache high-water mark in bytes.
    pub store_size: u64,
    /// Maximum VDF chain depth.
    pub max_chain_depth: u32,
    /// Optional wall-clock bound on derivations.
    pub derivation_timeout: Option<Duration>,
    /// Show `X+` directories in real directory listings.
    pub list_virtual: bool,
    /// VDF rule entries in file order.
    pub entries: Vec<RuleEntry>,
    /// `plugin_name.field` settings keyed by plugin name.
    pub plugin_settings: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
            store_size: DEFAULT_STORE_SIZE,
            max_chain_depth: DEFAULT_MAX_CHAIN,
            derivation_timeout: None,
            list_virtual: false,
            entries: Vec::new(),
            plugin_settings: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::Missing(path.to_path_buf())
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut config = Config::default();
        let mut entry: Option<PartialEntry> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            if line == "[entry]" {
                if let Some(partial) = entry.take() {
                    config.entries.push(partial.finish(line_no)?);
                }
                entry = Some(PartialEntry::default());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Invalid {
                    line: line_no,
                    reason: format!("expected key=value, got '{line}'"),
                });
            };
            let key = key.trim();
            let value = value.trim();

            if let Some(partial) = entry.as_mut() {
                partial.set(key, value, line_no)?;
            } else {
                config.set_global(key, value, line_no)?;
            }
        }

        if let Some(partial) = entry.take() {
            let line = text.lines().count();
            config.entries.push(partial.finish(line)?);
        }
        Ok(config)
    }

    fn set_global(&mut self, key: &str, value: &str, line: usize) -> Result<()> {
        match key {
            "plugins" => {
                self.plugins = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "store_size" => {
                self.store_size = parse_num(value, line, "store_size")?;
            }
            "max_chain_depth" => {
                self.max_chain_depth = parse_num(value, line, "max_chain_depth")?;
            }
            "derivation_timeout" => {
                let secs: u64 = parse_num(value, line, "derivation_timeout")?;
                self.derivation_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            "list_virtual" => {
                self.list_virtual = value.eq_ignore_ascii_case("true");
            }
            _ => {
                // Dotted keys are plugin-namespaced settings.
                if let Some((plugin, field)) = key.split_once('.') {
                    self.plugin_settings
                        .entry(plugin.to_string())
                        .or_default()
                        .insert(field.to_string(), value.to_string());
                } else {
                    return Err(ConfigError::Invalid {
                        line,
                        reason: format!("unknown global key '{key}'"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Write the commented default configuration. Refuses to overwrite.
    pub fn write_template(dir: &Path) -> Result<PathBuf> {
        let path = dir.join(CONFIG_FILE);
        if path.is_file() {
            return Err(ConfigError::Invalid {
                line: 0,
                reason: format!("configuration already exists at {}", path.display()),
            });
        }
        std::fs::create_dir_all(dir)?;
        let mut handle = std::fs::File::create(&path)?;
        handle.write_all(TEMPLATE.as_bytes())?;
        Ok(path)
    }
}

#[derive(Debug, Default)]
struct PartialEntry {
    pattern: Option<String>,
    ext: Option<String>,
    cmd: Option<String>,
    env: BTreeMap<String, String>,
}

impl PartialEntry {
    fn set(&mut self, key: &str, value: &str, line: usize) -> Result<()> {
        match key {
            "match" => self.pattern = Some(value.to_string()),
            "ext" => self.ext = Some(value.to_string()),
            "cmd" => self.cmd = Some(value.to_string()),
            _ => {
                if let Some(name) = key.strip_prefix("env.") {
                    self.env.insert(name.to_string(), value.to_string());
                } else {
                    return Err(ConfigError::Invalid {
                        line,
                        reason: format!("unknown entry key '{key}'"),
                    });
                }
            }
        }
        Ok(())
    }

    fn finish(self, line: usize) -> Result<RuleEntry> {
        let missing = |field: &str| ConfigError::Invalid {
            line,
            reason: format!("entry is missing required field '{field}'"),
        };
        Ok(RuleEntry {
            pattern: self.pattern.ok_or_else(|| missing("match"))?,
            ext: self.ext.ok_or_else(|| missing("ext"))?,
            cmd: self.cmd.ok_or_else(|| missing("cmd"))?,
            env: self.env,
        })
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn parse_num<T: std::str::FromStr>(value: &str, line: usize, key: &str) -> Result<T> {
    value.parse().map_err(|_| ConfigError::Invalid {
        line,
        reason: format!("{key} expects a number, got '{value}'"),
    })
}

const TEMPLATE: &str = r#"# RepeatFS configuration

## comma-separated plugin names
#plugins=

## VDF cache high-water mark (bytes)
#store_size=1073741824

## maximum VDF chain depth
#max_chain_depth=8

## derivation wall-clock bound in seconds, 0 disables
#derivation_timeout=0

## show + directories in listings
#list_virtual=false

# FASTQ -> FASTA
[entry]
match=\.fastq$
ext=.fasta
cmd=seqtk seq -A {input}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_globals_entries_and_plugin_keys() {
        let text = r#"
# comment
plugins=oplog, kafka
store_size=4096
list_virtual=true
oplog.level=debug

[entry]
match=\.fastq$
ext=.fasta
cmd=seqtk seq -A {input}
env.THREADS=4

[entry]  # trailing comment
match=\.fasta$
ext=.count
cmd=wc -l {input}
"#;
        let config = Config::parse(text).expect("parse");
        assert_eq!(config.plugins, vec!["oplog", "kafka"]);
        assert_eq!(config.store_size, 4096);
        assert!(config.list_virtual);
        assert_eq!(config.plugin_settings["oplog"]["level"], "debug");
        assert_eq!(config.entries.len(), 2);
        assert_eq!(config.entries[0].ext, ".fasta");
        assert_eq!(config.entries[0].env["THREADS"], "4");
        assert_eq!(config.entries[1].cmd, "wc -l {input}");
    }

    #[test]
    fn rejects_unknown_global_key() {
        let err = Config::parse("bogus=1\n").expect_err("unknown key");
        assert!(matches!(err, ConfigError::Invalid { line: 1, .. }));
    }

    #[test]
    fn rejects_incomplete_entry() {
        let err = Config::parse("[entry]\nmatch=x\n").expect_err("missing fields");
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn rejects_entry_key_in_global_section() {
        let err = Config::parse("match=x\n").expect_err("entry key outside entry");
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn template_round_trips_and_refuses_overwrite() {
        let tmp = TempDir::new().expect("tempdir");
        let path = Config::write_template(tmp.path()).expect("write");
        let config = Config::load(&path).expect("load template");
        assert_eq!(config.entries.len(), 1);
        assert_eq!(config.entries[0].ext, ".fasta");

        let err = Config::write_template(tmp.path()).expect_err("no overwrite");
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn missing_file_is_reported() {
        let tmp = TempDir::new().expect("tempdir");
        let err = Config::load(&tmp.path().join(CONFIG_FILE)).expect_err("missing");
        assert!(matches!(err, ConfigError::Missing(_)));
    }
}
