//! Loading ordered migration sets from disk.
//!
//! A migration directory holds one file per step, named `<version>_<name>.sql`
//! (for example `20240611093000_create_users.sql`). Versions are integers and
//! must be unique; steps are ordered by version. Anything that is not a `.sql`
//! file, such as an `atlas.sum` integrity file, is ignored.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Migration version number.
pub type MigrationVersion = i64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationStep {
    version: MigrationVersion,
    name: String,
    sql: String,
    checksum: String,
}

impl MigrationStep {
    pub fn new(version: MigrationVersion, name: impl Into<String>, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let checksum = checksum(&sql);
        Self {
            version,
            name: name.into(),
            sql,
            checksum,
        }
    }

    pub fn version(&self) -> MigrationVersion {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Hex SHA-256 of the step's SQL, recorded alongside the version.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Individual statements, since Postgres will not prepare several at once.
    pub fn statements(&self) -> Vec<String> {
        split_statements(&self.sql)
    }
}

fn checksum(sql: &str) -> String {
    let digest = Sha256::digest(sql.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Immutable, strictly ascending sequence of migration steps.
#[derive(Clone, Debug, Default)]
pub struct MigrationSet {
    label: String,
    steps: Vec<MigrationStep>,
}

impl MigrationSet {
    /// Build a set from steps in any order. Duplicate versions are rejected.
    pub fn new(label: impl Into<String>, mut steps: Vec<MigrationStep>) -> Result<Self> {
        let label = label.into();
        steps.sort_by_key(|s| s.version);
        if let Some(pair) = steps.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(Error::MigrationSource {
                path: label,
                reason: format!(
                    "version {} is used by both `{}` and `{}`",
                    pair[0].version, pair[0].name, pair[1].name
                ),
            });
        }
        Ok(Self { label, steps })
    }

    /// Load every `<version>_<name>.sql` file in `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let label = dir.display().to_string();
        let entries = fs::read_dir(dir).map_err(|e| Error::MigrationSource {
            path: label.clone(),
            reason: e.to_string(),
        })?;

        let mut steps = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }
            let (version, name) = parse_file_stem(stem).ok_or_else(|| Error::MigrationSource {
                path: path.display().to_string(),
                reason: "file name must look like <version>_<name>.sql".into(),
            })?;
            let sql = fs::read_to_string(&path)?;
            steps.push(MigrationStep::new(version, name, sql));
        }

        let set = Self::new(label, steps)?;
        tracing::debug!(source = %set.label, steps = set.len(), "loaded migration set");
        Ok(set)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn latest_version(&self) -> Option<MigrationVersion> {
        self.steps.last().map(|s| s.version)
    }

    pub fn get(&self, version: MigrationVersion) -> Option<&MigrationStep> {
        self.steps
            .binary_search_by_key(&version, |s| s.version)
            .ok()
            .map(|i| &self.steps[i])
    }
}

fn parse_file_stem(stem: &str) -> Option<(MigrationVersion, String)> {
    let (version, name) = match stem.split_once('_') {
        Some((version, name)) => (version, name),
        None => (stem, ""),
    };
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((version.parse().ok()?, name.to_string()))
}

/// Split a SQL script on `;`, ignoring semicolons inside quoted strings,
/// dollar-quoted bodies (`$$ ... $$`, `$fn$ ... $fn$`) and comments.
/// Comments are dropped from the output.
pub fn split_statements(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut stmts = Vec::new();
    let mut buf = String::new();
    let mut dollar_tag: Option<String> = None;
    let mut in_quote = false;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();

        if let Some(tag) = &dollar_tag {
            if starts_with_at(&chars, i, tag) {
                buf.push_str(tag);
                i += tag.chars().count();
                dollar_tag = None;
            } else {
                buf.push(ch);
                i += 1;
            }
            continue;
        }

        if in_quote {
            buf.push(ch);
            if ch == '\'' {
                if next == Some('\'') {
                    buf.push('\'');
                    i += 2;
                    continue;
                }
                in_quote = false;
            }
            i += 1;
            continue;
        }

        match ch {
            '\'' => {
                in_quote = true;
                buf.push(ch);
                i += 1;
            }
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            '$' => match dollar_tag_at(&chars, i) {
                Some(tag) => {
                    i += tag.chars().count();
                    buf.push_str(&tag);
                    dollar_tag = Some(tag);
                }
                None => {
                    buf.push(ch);
                    i += 1;
                }
            },
            ';' => {
                let stmt = buf.trim();
                if !stmt.is_empty() {
                    stmts.push(stmt.to_string());
                }
                buf.clear();
                i += 1;
            }
            _ => {
                buf.push(ch);
                i += 1;
            }
        }
    }

    let tail = buf.trim();
    if !tail.is_empty() {
        stmts.push(tail.to_string());
    }
    stmts
}

fn starts_with_at(chars: &[char], at: usize, needle: &str) -> bool {
    let mut idx = at;
    for c in needle.chars() {
        if chars.get(idx) != Some(&c) {
            return false;
        }
        idx += 1;
    }
    true
}

/// `$$` or `$tag$` starting at `at`; positional parameters like `$1` are not tags.
fn dollar_tag_at(chars: &[char], at: usize) -> Option<String> {
    let mut end = at + 1;
    while let Some(&c) = chars.get(end) {
        if c == '$' {
            let tag: String = chars[at..=end].iter().collect();
            return Some(tag);
        }
        if !(c.is_alphanumeric() || c == '_') || (end == at + 1 && c.is_ascii_digit()) {
            return None;
        }
        end += 1;
    }
    None
}
