//! The rule database: a loss-free rule file plus its interpreted rules.
//!
//! Sections that fail to parse are skipped with a `MalformedRule` warning and
//! written back verbatim. Sections the learner never touched are written back
//! byte-for-byte, so a shared rule file only ever changes where a rule did.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use serde::Serialize;

use crate::error::RuleFileError;

use super::codec::{is_owned_key, parse_rule, rule_entries};
use super::ini::IniDocument;
use super::{FxRule, MainRule, Rule, RuleId, clamp_quorum};

/// A section that was not loaded, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSection {
    pub section: String,
    pub message: String,
}

/// Summary of one load, for listings and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub main: usize,
    pub fx: usize,
    pub skipped: Vec<SkippedSection>,
}

#[derive(Debug, Clone)]
struct Slot {
    rule: Option<Rule>,
    dirty: bool,
}

/// In-memory rule file.
#[derive(Debug, Clone)]
pub struct RuleDatabase {
    doc: IniDocument,
    /// Parallel to `doc.sections`.
    slots: Vec<Slot>,
    skipped: Vec<SkippedSection>,
    default_quorum: f64,
}

impl RuleDatabase {
    /// An empty database.
    pub fn new(default_quorum: f64) -> Self {
        Self {
            doc: IniDocument::default(),
            slots: Vec::new(),
            skipped: Vec::new(),
            default_quorum: clamp_quorum(default_quorum),
        }
    }

    /// Interpret rule-file text. Never fails: bad sections are skipped.
    pub fn parse(text: &str, default_quorum: f64) -> Self {
        let mut db = Self::new(default_quorum);
        db.doc = IniDocument::parse(text);

        for section in &db.doc.sections {
            let duplicate = db
                .slots
                .iter()
                .any(|slot| slot.rule.as_ref().is_some_and(|r| r.id().0 == section.name));
            let parsed = if duplicate {
                Err("duplicate section name".to_string())
            } else {
                parse_rule(section, db.default_quorum)
            };
            match parsed {
                Ok(rule) => db.slots.push(Slot {
                    rule: Some(rule),
                    dirty: false,
                }),
                Err(message) => {
                    let diagnostic = RuleFileError::MalformedRule {
                        section: section.name.clone(),
                        message: message.clone(),
                    };
                    tracing::warn!(section = %section.name, "{diagnostic}");
                    db.skipped.push(SkippedSection {
                        section: section.name.clone(),
                        message,
                    });
                    db.slots.push(Slot {
                        rule: None,
                        dirty: false,
                    });
                }
            }
        }
        db
    }

    /// Load a rule file. A missing file is an empty database.
    pub fn load(path: &Path, default_quorum: f64) -> Result<Self, RuleFileError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                if matches!(text, Cow::Owned(_)) {
                    tracing::warn!(
                        path = %path.display(),
                        "rule file is not valid UTF-8; undecodable bytes replaced"
                    );
                }
                let db = Self::parse(&text, default_quorum);
                tracing::debug!(
                    path = %path.display(),
                    main = db.main_rules().count(),
                    fx = db.fx_rules().count(),
                    skipped = db.skipped.len(),
                    "loaded rule file"
                );
                Ok(db)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(default_quorum)),
            Err(source) => Err(RuleFileError::Read {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// All loaded rules in file order.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.slots.iter().filter_map(|s| s.rule.as_ref())
    }

    pub fn main_rules(&self) -> impl Iterator<Item = &MainRule> {
        self.rules().filter_map(|r| match r {
            Rule::Main(m) => Some(m),
            Rule::Fx(_) => None,
        })
    }

    pub fn fx_rules(&self) -> impl Iterator<Item = &FxRule> {
        self.rules().filter_map(|r| match r {
            Rule::Fx(f) => Some(f),
            Rule::Main(_) => None,
        })
    }

    pub fn get(&self, id: &RuleId) -> Option<&Rule> {
        self.rules().find(|r| r.id() == id)
    }

    /// Mutable access to one rule; the rule's section is re-rendered on save.
    pub fn rule_mut(&mut self, id: &RuleId) -> Option<&mut Rule> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.rule.as_ref().is_some_and(|r| r.id() == id))?;
        slot.dirty = true;
        slot.rule.as_mut()
    }

    /// Append a new rule as a new section at the end of the file.
    pub fn push_rule(&mut self, rule: Rule) {
        self.doc.push_section(&rule.id().0, &rule_entries(&rule));
        self.slots.push(Slot {
            rule: Some(rule),
            dirty: false,
        });
    }

    /// A section name derived from `base` that no existing section uses.
    pub fn unique_id(&self, base: &str) -> RuleId {
        let mut stem = String::new();
        for c in base.trim().chars() {
            if c.is_ascii_alphanumeric() {
                stem.push(c.to_ascii_lowercase());
            } else if !stem.ends_with('_') {
                stem.push('_');
            }
        }
        let stem = stem.trim_matches('_');
        let stem = if stem.is_empty() { "rule" } else { stem };

        let taken = |name: &str| self.doc.sections.iter().any(|s| s.name.eq_ignore_ascii_case(name));
        if !taken(stem) {
            return RuleId(stem.to_string());
        }
        let n = (2..).find(|n| !taken(&format!("{stem}_{n}"))).unwrap_or(2);
        RuleId(format!("{stem}_{n}"))
    }

    pub fn report(&self) -> LoadReport {
        LoadReport {
            main: self.main_rules().count(),
            fx: self.fx_rules().count(),
            skipped: self.skipped.clone(),
        }
    }

    pub fn default_quorum(&self) -> f64 {
        self.default_quorum
    }

    fn rewritten(&self) -> IniDocument {
        let mut doc = self.doc.clone();
        for (section, slot) in doc.sections.iter_mut().zip(&self.slots) {
            if let (true, Some(rule)) = (slot.dirty, slot.rule.as_ref()) {
                section.rewrite(&rule_entries(rule), is_owned_key);
            }
        }
        doc
    }

    /// Current file text, with modified rules re-rendered.
    pub fn render(&self) -> String {
        self.rewritten().render()
    }

    /// Atomically replace the rule file: write a sibling temp file, then
    /// rename it over the target.
    pub fn save(&mut self, path: &Path) -> Result<(), RuleFileError> {
        let doc = self.rewritten();
        let text = doc.render();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| RuleFileError::Write {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let tmp = temp_sibling(path);
        std::fs::write(&tmp, &text).map_err(|source| RuleFileError::Write {
            path: tmp.display().to_string(),
            source,
        })?;
        if let Err(source) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(RuleFileError::Write {
                path: path.display().to_string(),
                source,
            });
        }

        self.doc = doc;
        for slot in &mut self.slots {
            slot.dirty = false;
        }
        tracing::debug!(path = %path.display(), bytes = text.len(), "saved rule file");
        Ok(())
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "rules".to_string());
    path.with_file_name(format!(".{name}.{}.tmp", std::process::id()))
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Cached {
    mtime: Option<SystemTime>,
    db: Arc<RuleDatabase>,
}

/// Lazily loaded rule database, reloaded when the file's mtime changes or the
/// file appears. Readers share one immutable snapshot.
#[derive(Debug)]
pub struct RuleCache {
    path: PathBuf,
    default_quorum: f64,
    state: RwLock<Option<Cached>>,
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl RuleCache {
    pub fn new(path: impl Into<PathBuf>, default_quorum: f64) -> Self {
        Self {
            path: path.into(),
            default_quorum,
            state: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current snapshot, loading or reloading from disk as needed.
    pub fn snapshot(&self) -> Result<Arc<RuleDatabase>, RuleFileError> {
        let current = mtime(&self.path);
        {
            let guard = self.state.read().unwrap_or_else(|p| p.into_inner());
            if let Some(cached) = guard.as_ref().filter(|c| c.mtime == current) {
                return Ok(Arc::clone(&cached.db));
            }
        }

        let db = Arc::new(RuleDatabase::load(&self.path, self.default_quorum)?);
        let mut guard = self.state.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(Cached {
            mtime: current,
            db: Arc::clone(&db),
        });
        Ok(db)
    }

    /// Save a modified copy and make it the cached snapshot.
    pub fn store(&self, mut db: RuleDatabase) -> Result<Arc<RuleDatabase>, RuleFileError> {
        db.save(&self.path)?;
        let db = Arc::new(db);
        let mut guard = self.state.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(Cached {
            mtime: mtime(&self.path),
            db: Arc::clone(&db),
        });
        Ok(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointKey;

    const FILE: &str = "; shared vendor rules\n\n[realtek]\nvalue_name = {a},3\ndword_enable = 0\ndword_disable = 1\ndevices = {e}\n\n[broken]\nvalue_name = {b},1\n\n[fx_echo]\ntype = fx\nfx_name = Echo\nvalue_name = {c},2\ndword_enable = 1\ndword_disable = 0\n";

    #[test]
    fn malformed_sections_are_skipped_but_kept() {
        let db = RuleDatabase::parse(FILE, 0.6);
        let report = db.report();
        assert_eq!(report.main, 1);
        assert_eq!(report.fx, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].section, "broken");
        assert_eq!(db.render(), FILE);
    }

    #[test]
    fn only_touched_sections_change() {
        let mut db = RuleDatabase::parse(FILE, 0.6);
        let f = EndpointKey::normalized("{f}").unwrap();
        let Some(Rule::Main(rule)) = db.rule_mut(&RuleId("realtek".into())) else {
            panic!("realtek rule missing")
        };
        rule.membership.adopt(&f);

        let text = db.render();
        assert!(text.contains("devices = {e},{f}\n"));
        assert!(text.contains("[broken]\nvalue_name = {b},1\n\n[fx_echo]"));
        assert!(text.starts_with("; shared vendor rules\n\n[realtek]\n"));
    }

    #[test]
    fn unique_ids_never_collide() {
        let db = RuleDatabase::parse(FILE, 0.6);
        assert_eq!(db.unique_id("fx Echo").0, "fx_echo_2");
        assert_eq!(db.unique_id("Bass Boost!").0, "bass_boost");
        assert_eq!(db.unique_id("broken").0, "broken_2");
    }

    #[test]
    fn duplicate_section_names_are_skipped() {
        let text = "[a]\nvalue_name = x\ndword_enable = 0\ndword_disable = 1\n[a]\nvalue_name = y\ndword_enable = 0\ndword_disable = 1\n";
        let db = RuleDatabase::parse(text, 0.6);
        assert_eq!(db.main_rules().count(), 1);
        assert_eq!(db.report().skipped[0].message, "duplicate section name");
    }

    #[test]
    fn save_is_atomic_and_byte_identical() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vendor_toggles.ini");
        std::fs::write(&path, FILE).unwrap();

        let mut db = RuleDatabase::load(&path, 0.6).unwrap();
        db.save(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), FILE);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn cache_reloads_when_file_appears() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rules.ini");
        let cache = RuleCache::new(&path, 0.6);
        assert_eq!(cache.snapshot().unwrap().rules().count(), 0);

        std::fs::write(&path, FILE).unwrap();
        assert_eq!(cache.snapshot().unwrap().rules().count(), 2);
    }

    #[test]
    fn stray_latin1_bytes_do_not_fail_the_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vendor_toggles.ini");
        let mut bytes = FILE.replace("devices = {e}\n", "devices = {e}\nnotes = caf").into_bytes();
        let at = bytes.windows(8).position(|w| w == b"notes = ").unwrap() + 11;
        bytes.insert(at, 0xe9);
        std::fs::write(&path, &bytes).unwrap();

        let db = RuleDatabase::load(&path, 0.6).unwrap();
        assert_eq!(db.report().main, 1);
        assert_eq!(db.report().fx, 1);
        let Some(Rule::Main(rule)) = db.get(&RuleId("realtek".into())) else {
            panic!("realtek rule missing")
        };
        assert_eq!(rule.notes, "caf\u{fffd}");
    }
}
