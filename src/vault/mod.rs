//! Source-store interface.
//!
//! The engine never owns notes. It reads documents, patches front-matter and
//! asks the store to resolve links through [`Vault`]. [`FsVault`] is the
//! filesystem implementation used by the CLI and the integration tests.
//!
//! # Paths
//!
//! Notes are identified by vault-relative paths with `/` separators
//! (`posts/My Post.md`). Paths coming from other sources (filesystem
//! watchers, user input) may use a different unicode normalization; see
//! [`paths_match`].

pub mod fs;
pub mod markup;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

pub use fs::FsVault;

/// Keys a note needs before it counts as a Hexo post.
pub const HEXO_KEYS: [&str; 4] = ["title", "date", "tags", "published"];

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Note not found: {0}")]
    NotFound(String),

    #[error("Note already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid front-matter in {path}: {source}")]
    Frontmatter {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Vault I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A note's YAML header as an ordered key/value map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frontmatter(Mapping);

impl From<Mapping> for Frontmatter {
    fn from(mapping: Mapping) -> Self {
        Self(mapping)
    }
}

impl Frontmatter {
    pub fn as_mapping(&self) -> &Mapping {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(Value::from(key), value.into());
    }

    /// Scalar value rendered as a string. Sequences and maps yield `None`.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// True when the key is absent, null, or a blank string.
    pub fn is_blank(&self, key: &str) -> bool {
        match self.0.get(key) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        }
    }

    /// Boolean flag; `true` or the string `"true"`.
    pub fn flag(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// Whether the note is marked `published: true`.
    pub fn is_published(&self) -> bool {
        self.flag("published")
    }

    /// Whether all of [`HEXO_KEYS`] are present.
    pub fn is_hexo_format(&self) -> bool {
        HEXO_KEYS.iter().all(|key| self.contains(key))
    }
}

/// The host document store.
#[async_trait]
pub trait Vault: Send + Sync {
    /// Full document text, front-matter included.
    async fn read(&self, path: &str) -> Result<String, VaultError>;

    /// Raw bytes of any vault file.
    async fn read_binary(&self, path: &str) -> Result<Vec<u8>, VaultError>;

    /// Apply `patch` to the note's front-matter and write it back.
    async fn patch_frontmatter(
        &self,
        path: &str,
        patch: &mut (dyn for<'f> FnMut(&'f mut Frontmatter) + Send),
    ) -> Result<(), VaultError>;

    /// Create a new note. Fails if it already exists.
    async fn create(&self, path: &str, content: &str) -> Result<(), VaultError>;

    /// Move a note. The engine is told separately via `sync_rename`.
    async fn rename(&self, from: &str, to: &str) -> Result<(), VaultError>;

    /// Parsed front-matter, `None` when the note is missing or the header is
    /// malformed.
    fn frontmatter(&self, path: &str) -> Option<Frontmatter>;

    /// Embed link texts in the note body, in order of appearance.
    fn embeds(&self, path: &str) -> Vec<String>;

    /// Resolve a link token written in `from` to a vault path.
    fn resolve_link(&self, token: &str, from: &str) -> Option<String>;

    /// Every markdown note in the vault.
    fn list_notes(&self) -> Vec<String>;

    fn exists(&self, path: &str) -> bool;

    /// Creation time, falling back to modification time.
    fn created(&self, path: &str) -> Option<DateTime<Local>>;
}

/// File name component of a vault path.
pub fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// File name without its last extension.
pub fn file_stem(path: &str) -> &str {
    let name = file_name(path);
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

/// Lower-cased extension of a vault path, if any.
pub fn extension(path: &str) -> Option<String> {
    let name = file_name(path);
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => Some(name[idx + 1..].to_lowercase()),
        _ => None,
    }
}

/// Compare two paths that may differ only in unicode normalization or
/// separator style.
pub fn paths_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let a = a.replace('\\', "/");
    let b = b.replace('\\', "/");
    if a == b {
        return true;
    }
    a.nfc().eq(b.nfc()) || a.nfd().eq(b.nfd())
}
