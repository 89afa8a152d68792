// Validated Domain Types
// Strongly-typed wrappers for the identifiers and closed enums of the data
// model. These types cannot be constructed with invalid data, so the rest of
// the system never re-validates ids, paths, or enum strings.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Stable identifier for a watched workspace root.
///
/// Derived once from the canonicalized absolute path plus the
/// follow-symlinks flag; never silently re-hashed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RootId {
    inner: String,
}

impl RootId {
    const LEN: usize = 16;

    /// Derive a root id from a canonical absolute path.
    pub fn derive(canonical_path: &Path, follow_symlinks: bool) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical_path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update([follow_symlinks as u8]);
        let digest = hasher.finalize();
        Self {
            inner: hex::encode(&digest[..Self::LEN / 2]),
        }
    }

    /// Parse an existing root id string.
    ///
    /// # Invariants
    /// - Exactly 16 lowercase hex characters
    pub fn parse(s: &str) -> Result<Self> {
        ensure!(s.len() == Self::LEN, "root_id must be {} chars", Self::LEN);
        ensure!(
            s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()),
            "root_id must be lowercase hex"
        );
        Ok(Self { inner: s.to_string() })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// Primary key for all per-file data: `<root_id>/<rel_path>`.
///
/// Forward slashes only; the rel_path never starts with `./`. The root id
/// prefix stays even for files directly under the workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId {
    inner: String,
}

impl DocId {
    /// Build a doc id from its parts.
    pub fn new(root_id: &RootId, rel_path: &str) -> Result<Self> {
        crate::validation::validate_rel_path(rel_path)?;
        Ok(Self {
            inner: format!("{}/{}", root_id.as_str(), rel_path),
        })
    }

    /// Parse a serialized doc id.
    pub fn parse(s: &str) -> Result<Self> {
        let (root, rel) = s
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("doc_id missing '/': {s}"))?;
        let root_id = RootId::parse(root)?;
        Self::new(&root_id, rel)
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn root_id(&self) -> RootId {
        // Constructor guarantees the prefix parses.
        RootId {
            inner: self.inner[..16].to_string(),
        }
    }

    pub fn rel_path(&self) -> &str {
        &self.inner[17..]
    }

    /// Coarse repository bucket: first rel_path segment, or `__root__` for
    /// files directly under the workspace root.
    pub fn repo(&self) -> &str {
        match self.rel_path().split_once('/') {
            Some((first, _)) => first,
            None => "__root__",
        }
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// Stable symbol identifier derived from qualname + path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolId {
    inner: String,
}

impl SymbolId {
    pub fn derive(doc_id: &DocId, qualname: &str) -> Self {
        let h = xxhash_rust::xxh3::xxh3_64(format!("{}::{}", doc_id, qualname).as_bytes());
        Self {
            inner: format!("sym-{h:016x}"),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// Generation-unique identifier for one daemon process.
///
/// Disambiguates PID reuse in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BootId {
    inner: String,
}

impl BootId {
    pub fn generate() -> Self {
        Self {
            inner: format!("b-{}", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        ensure!(s.starts_with("b-") && s.len() == 34, "malformed boot id: {s}");
        Ok(Self { inner: s.to_string() })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for BootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A snippet tag with enforced constraints.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnippetTag {
    inner: String,
}

impl SnippetTag {
    /// # Invariants
    /// - Non-empty, max 128 characters
    /// - Only alphanumeric, dash, underscore, dot
    pub fn new(tag: impl Into<String>) -> Result<Self> {
        let tag = tag.into();
        crate::validation::validate_tag(&tag)?;
        Ok(Self { inner: tag })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for SnippetTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A result limit clamped into the protocol range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedLimit {
    inner: usize,
}

impl ValidatedLimit {
    pub const MIN: usize = 1;
    pub const MAX: usize = 200;

    /// Clamp a requested limit into `[1, 200]`. Requests outside the range
    /// are coerced, not rejected.
    pub fn clamp(requested: usize) -> Self {
        Self {
            inner: requested.clamp(Self::MIN, Self::MAX),
        }
    }

    pub fn get(&self) -> usize {
        self.inner
    }
}

impl Default for ValidatedLimit {
    fn default() -> Self {
        Self::clamp(10)
    }
}

/// Outcome of parsing a file body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseStatus {
    Ok,
    Skipped,
    Failed,
}

impl ParseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseStatus::Ok => "ok",
            ParseStatus::Skipped => "skipped",
            ParseStatus::Failed => "failed",
        }
    }
}

/// Why a file was skipped or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseReason {
    None,
    Binary,
    Minified,
    TooLarge,
    Excluded,
    NoParse,
    Error,
}

impl ParseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseReason::None => "none",
            ParseReason::Binary => "binary",
            ParseReason::Minified => "minified",
            ParseReason::TooLarge => "too_large",
            ParseReason::Excluded => "excluded",
            ParseReason::NoParse => "no_parse",
            ParseReason::Error => "error",
        }
    }
}

/// Kind of code symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Class,
    Method,
    Interface,
    Struct,
    Enum,
    Module,
    Variable,
    Other,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Function => "function",
            SymbolKind::Class => "class",
            SymbolKind::Method => "method",
            SymbolKind::Interface => "interface",
            SymbolKind::Struct => "struct",
            SymbolKind::Enum => "enum",
            SymbolKind::Module => "module",
            SymbolKind::Variable => "variable",
            SymbolKind::Other => "other",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "function" => Some(SymbolKind::Function),
            "class" => Some(SymbolKind::Class),
            "method" => Some(SymbolKind::Method),
            "interface" => Some(SymbolKind::Interface),
            "struct" => Some(SymbolKind::Struct),
            "enum" => Some(SymbolKind::Enum),
            "module" => Some(SymbolKind::Module),
            "variable" => Some(SymbolKind::Variable),
            "other" => Some(SymbolKind::Other),
            _ => None,
        }
    }
}

/// Directed relationship between two symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationType {
    Calls,
    Implements,
    Inherits,
    Imports,
    References,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Calls => "calls",
            RelationType::Implements => "implements",
            RelationType::Inherits => "inherits",
            RelationType::Imports => "imports",
            RelationType::References => "references",
        }
    }
}

/// Lifecycle state of a workspace root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootState {
    Active,
    Paused,
    Deleted,
}
