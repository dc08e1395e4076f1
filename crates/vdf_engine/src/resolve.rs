//! Virtual path translation and VDF resolution.
//!
//! The `+` character is reserved in virtual space: a path whose component is
//! `X+` names the synthetic directory of VDFs derived from `X`. Internal
//! `X+` components resolve iteratively, so
//! `a.fastq+/a.fastq.fasta+/a.fasta.count`-style chains walk rule by rule.
//! Real files whose names end in `+` are shadowed and unreachable.

use crate::rules::{RuleSet, VdfRule, PROVENANCE_HTML_EXT, PROVENANCE_JSON_EXT};
use crate::{Result, VdfError};
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_CHAIN: u32 = 8;

/// Classification of a mount-relative virtual path.
#[derive(Debug, Clone)]
pub enum Resolved {
    /// Passthrough: the real backing path.
    Real(PathBuf),
    /// A synthetic `X+` directory.
    VdfDir(VdfDir),
    /// A derivation leaf inside a synthetic directory.
    VdfLeaf(VdfLeaf),
    /// A system provenance leaf inside a synthetic directory.
    Provenance(ProvLeaf),
}

/// A synthetic `X+` directory descriptor.
#[derive(Debug, Clone)]
pub struct VdfDir {
    /// Canonical mount-relative path of the directory itself (`…/X+`).
    pub virt_path: String,
    /// Mount-relative path of the source `X`.
    pub source_virt: String,
    /// Real backing file at the root of the chain.
    pub base_real: PathBuf,
    /// Effective filename the rules are evaluated against.
    pub source_name: String,
    /// Rules that produced the source; empty when the source is a real file.
    pub chain: Vec<VdfRule>,
}

/// A VDF leaf descriptor.
#[derive(Debug, Clone)]
pub struct VdfLeaf {
    /// Canonical mount-relative virtual path of the leaf.
    pub virt_path: String,
    /// Real backing file at the root of the chain.
    pub base_real: PathBuf,
    /// Mount-relative path of the chain root.
    pub base_virt: String,
    /// Rules applied from the base, the last one being this leaf's.
    pub chain: Vec<VdfRule>,
}

impl VdfLeaf {
    /// Filename of the leaf (base name plus every chained extension).
    pub fn name(&self) -> String {
        let base = file_name(&self.base_virt);
        self.chain
            .iter()
            .fold(base.to_string(), |name, rule| format!("{name}{}", rule.ext))
    }

    /// The rule that derives this leaf from its immediate source.
    pub fn rule(&self) -> &VdfRule {
        self.chain.last().expect("a leaf has at least one rule")
    }

    /// Executor cache key: canonical virtual path plus rule identity.
    pub fn cache_key(&self) -> String {
        format!("{}|{}", self.virt_path, self.rule().id())
    }

    /// The upstream leaf this one derives from. Panics if the chain has a
    /// single rule (the source is then the real base file).
    pub fn parent_leaf(&self) -> VdfLeaf {
        assert!(self.chain.len() >= 2, "chain root has no parent leaf");
        let chain = self.chain[..self.chain.len() - 1].to_vec();
        VdfLeaf {
            virt_path: leaf_virt_path(&self.base_virt, &chain),
            base_real: self.base_real.clone(),
            base_virt: self.base_virt.clone(),
            chain,
        }
    }
}

/// System provenance leaf (`X.provenance.json` / `.html`).
#[derive(Debug, Clone)]
pub struct ProvLeaf {
    pub virt_path: String,
    /// Mount-relative path of the file the provenance is about.
    pub source_virt: String,
    /// Real backing file at the root of the chain.
    pub base_real: PathBuf,
    pub format: ProvFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvFormat {
    Json,
    Html,
}

/// Canonical virtual path of the leaf reached by applying `chain` to `base`.
fn leaf_virt_path(base_virt: &str, chain: &[VdfRule]) -> String {
    let mut path = base_virt.to_string();
    let mut name = file_name(base_virt).to_string();
    for rule in chain {
        let leaf = format!("{name}{}", rule.ext);
        path = format!("{path}+/{leaf}");
        name = leaf;
    }
    path
}

fn file_name(virt: &str) -> &str {
    virt.rsplit('/').next().unwrap_or(virt)
}

pub struct Resolver {
    root: PathBuf,
    rules: RuleSet,
    max_chain: u32,
}

impl Resolver {
    pub fn new(root: &Path, rules: RuleSet) -> Self {
        Self {
            root: root.to_path_buf(),
            rules,
            max_chain: DEFAULT_MAX_CHAIN,
        }
    }

    pub fn with_max_chain(mut self, max_chain: u32) -> Self {
        self.max_chain = max_chain;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a mount-relative virtual path to its real backing path, synthetic
    /// directory, or VDF leaf. Runs no derivations.
    pub fn resolve(&self, virt: &str) -> Result<Resolved> {
        enum State {
            Real { real: PathBuf, virt: String },
            Synth { dir: VdfDir },
        }

        let mut state = State::Real {
            real: self.root.clone(),
            virt: String::new(),
        };

        let components: Vec<&str> = virt.split('/').filter(|c| !c.is_empty()).collect();
        for (idx, comp) in components.iter().enumerate() {
            let last = idx + 1 == components.len();
            state = match state {
                State::Real { real, virt: vpath } => {
                    if let Some(stripped) = comp.strip_suffix('+') {
                        let base_real = real.join(stripped);
                        if !base_real.is_file() {
                            return Err(VdfError::NotFound(virt.to_string()));
                        }
                        let source_virt = join_virt(&vpath, stripped);
                        State::Synth {
                            dir: VdfDir {
                                virt_path: join_virt(&vpath, comp),
                                source_virt: source_virt.clone(),
                                base_real,
                                source_name: stripped.to_string(),
                                chain: Vec::new(),
                            },
                        }
                    } else {
                        State::Real {
                            real: real.join(comp),
                            virt: join_virt(&vpath, comp),
                        }
                    }
                }
                State::Synth { dir } => {
                    let (target, chained) = match comp.strip_suffix('+') {
                        Some(stripped) => (stripped, true),
                        None => (*comp, false),
                    };

                    // System provenance leaves are terminal: not chainable.
                    let json_name = format!("{}{}", dir.source_name, PROVENANCE_JSON_EXT);
                    let html_name = format!("{}{}", dir.source_name, PROVENANCE_HTML_EXT);
                    if target == json_name || target == html_name {
                        if chained || !last {
                            return Err(VdfError::NotFound(virt.to_string()));
                        }
                        return Ok(Resolved::Provenance(ProvLeaf {
                            virt_path: join_virt(&dir.virt_path, target),
                            source_virt: dir.source_virt,
                            base_real: dir.base_real,
                            format: if target == json_name {
                                ProvFormat::Json
                            } else {
                                ProvFormat::Html
                            },
                        }));
                    }

                    let Some(rule) = self.rules.find_leaf(&dir.source_name, target) else {
                        return Err(VdfError::NotFound(virt.to_string()));
                    };

                    let mut chain = dir.chain.clone();
                    chain.push(rule.clone());
                    if chain.len() as u32 > self.max_chain {
                        return Err(VdfError::ChainTooDeep {
                            path: virt.to_string(),
                            max: self.max_chain,
                        });
                    }

                    let base_virt = chain_base_virt(&dir);
                    let leaf = VdfLeaf {
                        virt_path: join_virt(&dir.virt_path, target),
                        base_real: dir.base_real.clone(),
                        base_virt,
                        chain,
                    };

                    if chained {
                        State::Synth {
                            dir: VdfDir {
                                virt_path: join_virt(&dir.virt_path, comp),
                                source_virt: leaf.virt_path.clone(),
                                base_real: dir.base_real,
                                source_name: target.to_string(),
                                chain: leaf.chain,
                            },
                        }
                    } else if last {
                        return Ok(Resolved::VdfLeaf(leaf));
                    } else {
                        return Err(VdfError::NotFound(virt.to_string()));
                    }
                }
            };
        }

        Ok(match state {
            State::Real { real, .. } => Resolved::Real(real),
            State::Synth { dir } => Resolved::VdfDir(dir),
        })
    }

    /// Entries of a synthetic directory: the provenance leaves plus one leaf
    /// per rule matching the effective filename.
    pub fn dir_entries(&self, dir: &VdfDir) -> Vec<String> {
        let mut entries = vec![
            format!("{}{}", dir.source_name, PROVENANCE_JSON_EXT),
            format!("{}{}", dir.source_name, PROVENANCE_HTML_EXT),
        ];
        for rule in self.rules.matching(&dir.source_name) {
            entries.push(format!("{}{}", dir.source_name, rule.ext));
        }
        entries
    }

    /// Whether a real file would grow a synthetic sibling directory, used to
    /// augment real directory listings.
    pub fn has_rules_for(&self, filename: &str) -> bool {
        !self.rules.matching(filename).is_empty()
    }
}

fn join_virt(base: &str, comp: &str) -> String {
    if base.is_empty() {
        comp.to_string()
    } else {
        format!("{base}/{comp}")
    }
}

/// Mount-relative path of the chain's real root for a synthetic dir.
fn chain_base_virt(dir: &VdfDir) -> String {
    if dir.chain.is_empty() {
        return dir.source_virt.clone();
    }
    // Walk back out of the chained suffix components.
    let mut virt = dir.source_virt.as_str();
    for _ in 0..dir.chain.len() {
        let Some((parent_dir, _leaf)) = virt.rsplit_once('/') else {
            break;
        };
        virt = parent_dir.strip_suffix('+').unwrap_or(parent_dir);
    }
    virt.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleEntry;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn rules() -> RuleSet {
        RuleSet::from_entries(vec![
            RuleEntry {
                pattern: r"\.fastq$".into(),
                ext: ".fasta".into(),
                cmd: "seqtk seq -A {input}".into(),
                env: BTreeMap::new(),
            },
            RuleEntry {
                pattern: r"\.fasta$".into(),
                ext: ".count".into(),
                cmd: "wc -l {input}".into(),
                env: BTreeMap::new(),
            },
        ])
        .expect("valid rules")
    }

    fn resolver(tmp: &TempDir) -> Resolver {
        let root = tmp.path().join("root");
        std::fs::create_dir_all(root.join("sub")).expect("mkdir");
        std::fs::write(root.join("x.fastq"), b"@r\nACGT\n").expect("seed");
        std::fs::write(root.join("sub/y.fastq"), b"@r\nTTTT\n").expect("seed");
        std::fs::write(root.join("plain.txt"), b"text").expect("seed");
        Resolver::new(&root, rules())
    }

    #[test]
    fn plain_paths_pass_through() {
        let tmp = TempDir::new().expect("tempdir");
        let r = resolver(&tmp);
        match r.resolve("sub/y.fastq").expect("resolve") {
            Resolved::Real(real) => assert!(real.ends_with("sub/y.fastq")),
            other => panic!("expected real, got {other:?}"),
        }
    }

    #[test]
    fn plus_names_the_synthetic_directory() {
        let tmp = TempDir::new().expect("tempdir");
        let r = resolver(&tmp);
        match r.resolve("x.fastq+").expect("resolve") {
            Resolved::VdfDir(dir) => {
                assert_eq!(dir.source_name, "x.fastq");
                assert!(dir.chain.is_empty());
                let entries = r.dir_entries(&dir);
                assert!(entries.contains(&"x.fastq.provenance.json".to_string()));
                assert!(entries.contains(&"x.fastq.provenance.html".to_string()));
                assert!(entries.contains(&"x.fastq.fasta".to_string()));
            }
            other => panic!("expected dir, got {other:?}"),
        }
    }

    #[test]
    fn leaf_resolves_with_single_rule_chain() {
        let tmp = TempDir::new().expect("tempdir");
        let r = resolver(&tmp);
        match r.resolve("x.fastq+/x.fastq.fasta").expect("resolve") {
            Resolved::VdfLeaf(leaf) => {
                assert_eq!(leaf.chain.len(), 1);
                assert_eq!(leaf.name(), "x.fastq.fasta");
                assert!(leaf.base_real.ends_with("x.fastq"));
                assert_eq!(leaf.cache_key(), r"x.fastq+/x.fastq.fasta|\.fastq$|.fasta");
            }
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn chained_leaf_resolves_through_intermediate_dir() {
        let tmp = TempDir::new().expect("tempdir");
        let r = resolver(&tmp);
        match r
            .resolve("x.fastq+/x.fastq.fasta+/x.fastq.fasta.count")
            .expect("resolve")
        {
            Resolved::VdfLeaf(leaf) => {
                assert_eq!(leaf.chain.len(), 2);
                assert_eq!(leaf.name(), "x.fastq.fasta.count");
                assert_eq!(leaf.rule().ext, ".count");
                let parent = leaf.parent_leaf();
                assert_eq!(parent.name(), "x.fastq.fasta");
            }
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn provenance_leaves_are_present_and_terminal() {
        let tmp = TempDir::new().expect("tempdir");
        let r = resolver(&tmp);
        match r
            .resolve("plain.txt+/plain.txt.provenance.json")
            .expect("resolve")
        {
            Resolved::Provenance(leaf) => {
                assert_eq!(leaf.format, ProvFormat::Json);
                assert_eq!(leaf.source_virt, "plain.txt");
            }
            other => panic!("expected provenance leaf, got {other:?}"),
        }

        let err = r
            .resolve("plain.txt+/plain.txt.provenance.json+/x")
            .expect_err("provenance leaves do not chain");
        assert!(matches!(err, VdfError::NotFound(_)));
    }

    #[test]
    fn missing_prefix_file_is_not_found() {
        let tmp = TempDir::new().expect("tempdir");
        let r = resolver(&tmp);
        let err = r.resolve("nope.fastq+").expect_err("no such source");
        assert!(matches!(err, VdfError::NotFound(_)));

        let err = r
            .resolve("x.fastq+/unrelated.name")
            .expect_err("no rule yields that leaf");
        assert!(matches!(err, VdfError::NotFound(_)));
    }

    #[test]
    fn chain_depth_is_bounded() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).expect("mkdir");
        std::fs::write(root.join("a.x"), b"seed").expect("seed");

        // A rule that matches its own output chains forever.
        let rules = RuleSet::from_entries(vec![RuleEntry {
            pattern: r"\.x$".into(),
            ext: ".x".into(),
            cmd: "cat {input}".into(),
            env: BTreeMap::new(),
        }])
        .expect("rules");
        let r = Resolver::new(&root, rules).with_max_chain(3);

        let mut virt = "a.x+".to_string();
        let mut name = "a.x".to_string();
        for _ in 0..3 {
            name = format!("{name}.x");
            virt = format!("{virt}/{name}+");
        }
        // Three chained dirs resolve; the fourth rule application is too deep.
        name = format!("{name}.x");
        let too_deep = format!("{virt}/{name}");
        let err = r.resolve(&too_deep).expect_err("depth 4 > max 3");
        assert!(matches!(err, VdfError::ChainTooDeep { max: 3, .. }), "got {err:?}");
    }
}
