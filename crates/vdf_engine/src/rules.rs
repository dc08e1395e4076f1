//! VDF rule table.
//!
//! Rules come from configuration and are never persisted: each carries a
//! regular expression over the candidate input filename, the extension the
//! derived leaf appends, and a command template with `{input}` / `{output}`
//! placeholders.

use crate::{Result, VdfError};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;

/// Extensions of the system-provided provenance leaves present in every
/// synthetic directory.
pub const PROVENANCE_JSON_EXT: &str = ".provenance.json";
pub const PROVENANCE_HTML_EXT: &str = ".provenance.html";

/// Raw rule as read from configuration.
#[derive(Debug, Clone)]
pub struct RuleEntry {
    pub pattern: String,
    pub ext: String,
    pub cmd: String,
    pub env: BTreeMap<String, String>,
}

/// Compiled rule.
#[derive(Debug, Clone)]
pub struct VdfRule {
    pub pattern: String,
    regex: Regex,
    pub ext: String,
    pub cmd: String,
    pub env: BTreeMap<String, String>,
}

impl VdfRule {
    pub fn compile(entry: RuleEntry) -> Result<Self> {
        let regex = Regex::new(&entry.pattern).map_err(|source| VdfError::Pattern {
            pattern: entry.pattern.clone(),
            source,
        })?;
        Ok(Self {
            pattern: entry.pattern,
            regex,
            ext: entry.ext,
            cmd: entry.cmd,
            env: entry.env,
        })
    }

    /// Rule identity, half of the executor's cache key.
    pub fn id(&self) -> String {
        format!("{}|{}", self.pattern, self.ext)
    }

    pub fn matches(&self, filename: &str) -> bool {
        self.regex.is_match(filename)
    }

    /// Substitute template placeholders and split into an argv.
    pub fn build_argv(&self, input: &Path, output: Option<&Path>) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
        self.cmd
            .split_whitespace()
            .map(|tok| tok.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }
}

/// The rule table loaded at mount time.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<VdfRule>,
}

impl RuleSet {
    pub fn from_entries(entries: Vec<RuleEntry>) -> Result<Self> {
        let rules = entries
            .into_iter()
            .map(VdfRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Rules whose pattern matches the effective filename.
    pub fn matching(&self, filename: &str) -> Vec<&VdfRule> {
        self.rules.iter().filter(|r| r.matches(filename)).collect()
    }

    /// The rule that derives `leaf_name` from `source_name`, if any.
    pub fn find_leaf(&self, source_name: &str, leaf_name: &str) -> Option<&VdfRule> {
        self.rules.iter().find(|r| {
            r.matches(source_name) && leaf_name == format!("{source_name}{}", r.ext)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fastq_rule() -> VdfRule {
        VdfRule::compile(RuleEntry {
            pattern: r"\.fastq$".into(),
            ext: ".fasta".into(),
            cmd: "seqtk seq -A {input}".into(),
            env: BTreeMap::new(),
        })
        .expect("valid rule")
    }

    #[test]
    fn matching_is_by_filename_regex() {
        let rules = RuleSet {
            rules: vec![fastq_rule()],
        };
        assert_eq!(rules.matching("x.fastq").len(), 1);
        assert!(rules.matching("x.fasta").is_empty());
        assert!(rules.matching("x.fastq.gz").is_empty());
    }

    #[test]
    fn find_leaf_requires_exact_extension() {
        let rules = RuleSet {
            rules: vec![fastq_rule()],
        };
        assert!(rules.find_leaf("x.fastq", "x.fastq.fasta").is_some());
        assert!(rules.find_leaf("x.fastq", "x.fastq.count").is_none());
        assert!(rules.find_leaf("x.txt", "x.txt.fasta").is_none());
    }

    #[test]
    fn argv_substitutes_placeholders() {
        let rule = fastq_rule();
        let argv = rule.build_argv(Path::new("/data/x.fastq"), None);
        assert_eq!(argv, vec!["seqtk", "seq", "-A", "/data/x.fastq"]);
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let err = VdfRule::compile(RuleEntry {
            pattern: "(".into(),
            ext: ".x".into(),
            cmd: "true".into(),
            env: BTreeMap::new(),
        })
        .expect_err("unbalanced paren");
        assert!(matches!(err, VdfError::Pattern { .. }));
    }
}
