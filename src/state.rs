//! Persisted engine state: settings plus the path-mapping and post-hash tables.
//!
//! The tables are the only mutable state shared between the publisher and the
//! reconciler. Both hold a clone of the same [`StateStore`]; the lock is never
//! held across an `.await`, so every mutation is a short synchronous section.
//!
//! The on-disk format is a single JSON object with camelCase keys:
//!
//! ```json
//! {
//!   "hexoRoot": "/home/me/blog",
//!   "slugStyle": "hash",
//!   "postHashes": { "notes/My Post.md": "9f86d0…" },
//!   "pathMapping": { "notes/My Post.md": "my-post.md" }
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default state file name, placed at the vault root.
pub const STATE_FILE_NAME: &str = ".hexo-sync.json";

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to read or write state file: {0}")]
    Io(#[from] std::io::Error),

    #[error("State file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unknown setting: {0}")]
    UnknownSetting(String),
}

/// How a missing permalink is generated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlugStyle {
    /// Baidu Translate, then slugified.
    Translate,
    /// Pinyin initials.
    Pinyin,
    /// First 8 hex chars of the title's SHA-256.
    #[default]
    Hash,
    /// Never generate; publishing aborts when the permalink is missing.
    Manual,
    /// Slugified title.
    Title,
}

impl std::fmt::Display for SlugStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Translate => write!(f, "translate"),
            Self::Pinyin => write!(f, "pinyin"),
            Self::Hash => write!(f, "hash"),
            Self::Manual => write!(f, "manual"),
            Self::Title => write!(f, "title"),
        }
    }
}

/// How embedded images are written into the published post.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSyntax {
    /// `{% asset_img name alt %}`
    #[default]
    Hexo,
    /// `![alt](name)`
    Markdown,
}

/// User-facing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Absolute path of the Hexo blog root.
    pub hexo_root: String,
    pub slug_style: SlugStyle,
    pub baidu_app_id: String,
    pub baidu_api_key: String,
    pub remove_stop_words: bool,
    /// Zero disables truncation.
    pub max_slug_words: usize,
    pub image_syntax: ImageSyntax,
    pub cover_field_name: String,
    pub auto_excerpt: bool,
    pub server_port: u16,
    pub compress_images: bool,
    /// WebP quality, 0-100.
    pub webp_quality: u8,
    /// Generator invocation, split shell-style (e.g. `npx hexo`).
    pub hexo_command: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hexo_root: String::new(),
            slug_style: SlugStyle::Hash,
            baidu_app_id: String::new(),
            baidu_api_key: String::new(),
            remove_stop_words: true,
            max_slug_words: 5,
            image_syntax: ImageSyntax::Hexo,
            cover_field_name: "cover".to_string(),
            auto_excerpt: false,
            server_port: 4000,
            compress_images: false,
            webp_quality: 75,
            hexo_command: "hexo".to_string(),
        }
    }
}

impl Settings {
    /// Hexo root, if configured.
    pub fn hexo_root(&self) -> Option<&Path> {
        let root = self.hexo_root.trim();
        (!root.is_empty()).then(|| Path::new(root))
    }

    /// `<hexoRoot>/source/_posts`, if the root is configured.
    pub fn posts_dir(&self) -> Option<PathBuf> {
        self.hexo_root()
            .map(|root| root.join("source").join("_posts"))
    }

    /// Cover field name, falling back to `cover` when blank.
    pub fn cover_field(&self) -> &str {
        let field = self.cover_field_name.trim();
        if field.is_empty() { "cover" } else { field }
    }
}

/// Everything that gets persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineState {
    #[serde(flatten)]
    pub settings: Settings,
    /// Note path -> SHA-256 of the document at its last successful publish.
    pub post_hashes: HashMap<String, String>,
    /// Note path -> published file name inside `source/_posts`.
    pub path_mapping: HashMap<String, String>,
}

impl EngineState {
    /// Load state from disk, returning defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            if content.trim().is_empty() {
                return Ok(Self::default());
            }
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save state to disk.
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn record_publish(&mut self, note_path: &str, filename: &str, hash: &str) {
        self.path_mapping
            .insert(note_path.to_string(), filename.to_string());
        self.post_hashes
            .insert(note_path.to_string(), hash.to_string());
    }

    /// Erase both table entries for a note. Returns whether anything was removed.
    pub fn forget(&mut self, note_path: &str) -> bool {
        let hash = self.post_hashes.remove(note_path).is_some();
        let mapping = self.path_mapping.remove(note_path).is_some();
        hash || mapping
    }

    /// Move both table entries from `old_path` to `new_path`, pointing the
    /// mapping at `filename`.
    pub fn migrate(&mut self, old_path: &str, new_path: &str, filename: &str) {
        if let Some(hash) = self.post_hashes.remove(old_path) {
            self.post_hashes.insert(new_path.to_string(), hash);
        }
        self.path_mapping.remove(old_path);
        self.path_mapping
            .insert(new_path.to_string(), filename.to_string());
    }

    /// Set one camelCase settings key from a raw string.
    ///
    /// The value is parsed as JSON first (`true`, `4000`, `"x"`) and taken
    /// as a plain string otherwise. The result must still deserialize into
    /// [`Settings`], so type mismatches are rejected.
    pub fn set_setting(&mut self, key: &str, raw: &str) -> Result<(), StateError> {
        let mut value = serde_json::to_value(&self.settings)?;
        let map = value
            .as_object_mut()
            .ok_or_else(|| StateError::UnknownSetting(key.to_string()))?;
        if !map.contains_key(key) {
            return Err(StateError::UnknownSetting(key.to_string()));
        }
        let parsed = serde_json::from_str::<serde_json::Value>(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        map.insert(key.to_string(), parsed);
        self.settings = serde_json::from_value(value)?;
        Ok(())
    }
}

/// Shared handle to the engine state with an optional backing file.
#[derive(Debug, Clone)]
pub struct StateStore {
    inner: Arc<Mutex<EngineState>>,
    path: Option<PathBuf>,
}

impl StateStore {
    /// A store that is never written to disk.
    pub fn in_memory(state: EngineState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
            path: None,
        }
    }

    /// Open the store backed by `path`, loading it if it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let state = EngineState::load(&path)?;
        tracing::debug!(
            path = %path.display(),
            hashes = state.post_hashes.len(),
            mappings = state.path_mapping.len(),
            "loaded engine state"
        );
        Ok(Self {
            inner: Arc::new(Mutex::new(state)),
            path: Some(path),
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Clone of the whole state.
    pub fn snapshot(&self) -> EngineState {
        self.inner.lock().clone()
    }

    /// Clone of the current settings.
    pub fn settings(&self) -> Settings {
        self.inner.lock().settings.clone()
    }

    /// Run `f` against a read-only view of the state.
    pub fn read<R>(&self, f: impl FnOnce(&EngineState) -> R) -> R {
        f(&self.inner.lock())
    }

    /// Run `f` with exclusive access to the state.
    pub fn update<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Replace the in-memory state with the backing file's contents.
    ///
    /// Other `hexo-sync` processes write the same file, so a long-running
    /// store goes stale. Unpersisted changes are discarded.
    pub fn reload(&self) -> Result<(), StateError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let fresh = EngineState::load(path)?;
        *self.inner.lock() = fresh;
        tracing::debug!(path = %path.display(), "reloaded engine state");
        Ok(())
    }

    /// Reload, apply `f` and persist under one lock, so entries written by
    /// other processes since the last load survive.
    pub fn commit<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> Result<R, StateError> {
        let Some(path) = &self.path else {
            return Ok(self.update(f));
        };
        let mut state = self.inner.lock();
        *state = EngineState::load(path)?;
        let out = f(&mut state);
        state.save(path)?;
        tracing::debug!(path = %path.display(), "committed engine state");
        Ok(out)
    }

    /// Write the state to its backing file. No-op for in-memory stores.
    pub fn persist(&self) -> Result<(), StateError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        snapshot.save(path)?;
        tracing::debug!(path = %path.display(), "persisted engine state");
        Ok(())
    }

    pub fn post_hash(&self, note_path: &str) -> Option<String> {
        self.read(|s| s.post_hashes.get(note_path).cloned())
    }

    pub fn mapped_filename(&self, note_path: &str) -> Option<String> {
        self.read(|s| s.path_mapping.get(note_path).cloned())
    }

    /// Record a successful publish in memory only.
    pub fn record_publish(&self, note_path: &str, filename: &str, hash: &str) {
        self.update(|s| s.record_publish(note_path, filename, hash));
    }

    /// Erase both table entries for a note in memory only.
    pub fn forget(&self, note_path: &str) -> bool {
        self.update(|s| s.forget(note_path))
    }

    /// Note paths whose mapped file name equals `filename`.
    pub fn notes_mapped_to(&self, filename: &str) -> Vec<String> {
        self.read(|s| {
            let mut paths: Vec<String> = s
                .path_mapping
                .iter()
                .filter(|(_, mapped)| mapped.as_str() == filename)
                .map(|(path, _)| path.clone())
                .collect();
            paths.sort();
            paths
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.slug_style, SlugStyle::Hash);
        assert_eq!(settings.image_syntax, ImageSyntax::Hexo);
        assert_eq!(settings.server_port, 4000);
        assert_eq!(settings.webp_quality, 75);
        assert_eq!(settings.max_slug_words, 5);
        assert!(settings.remove_stop_words);
        assert!(settings.posts_dir().is_none());
    }

    #[test]
    fn test_posts_dir() {
        let settings = Settings {
            hexo_root: "/blog".into(),
            ..Default::default()
        };
        assert_eq!(
            settings.posts_dir(),
            Some(PathBuf::from("/blog/source/_posts"))
        );
    }

    #[test]
    fn test_cover_field_fallback() {
        let settings = Settings {
            cover_field_name: "  ".into(),
            ..Default::default()
        };
        assert_eq!(settings.cover_field(), "cover");
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let json = r#"{"hexoRoot": "/blog", "slugStyle": "pinyin", "postHashes": {"a.md": "abc"}}"#;
        let state: EngineState = serde_json::from_str(json).unwrap();
        assert_eq!(state.settings.hexo_root, "/blog");
        assert_eq!(state.settings.slug_style, SlugStyle::Pinyin);
        assert_eq!(state.settings.server_port, 4000);
        assert_eq!(state.post_hashes.get("a.md").map(String::as_str), Some("abc"));
        assert!(state.path_mapping.is_empty());
    }

    #[test]
    fn test_serialized_keys_are_camel_case() {
        let value = serde_json::to_value(EngineState::default()).unwrap();
        let map = value.as_object().unwrap();
        for key in ["hexoRoot", "postHashes", "pathMapping", "slugStyle", "webpQuality"] {
            assert!(map.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let tmp = TempDir::new().unwrap();
        let state = EngineState::load(&tmp.path().join("nope.json")).unwrap();
        assert_eq!(state, EngineState::default());
    }

    #[test]
    fn test_store_persist_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("state.json");

        let store = StateStore::open(&path).unwrap();
        store.record_publish("notes/a.md", "a.md", "h1");
        store.persist().unwrap();

        let reopened = StateStore::open(&path).unwrap();
        assert_eq!(reopened.post_hash("notes/a.md").as_deref(), Some("h1"));
        assert_eq!(reopened.mapped_filename("notes/a.md").as_deref(), Some("a.md"));
    }

    #[test]
    fn test_commit_keeps_entries_written_by_another_store() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");

        let watcher = StateStore::open(&path).unwrap();
        watcher
            .commit(|s| s.record_publish("A.md", "a.md", "ha"))
            .unwrap();

        // A second process publishes while the first still holds its old view.
        let other = StateStore::open(&path).unwrap();
        other
            .commit(|s| s.record_publish("B.md", "b.md", "hb"))
            .unwrap();
        assert!(watcher.mapped_filename("B.md").is_none());

        assert!(watcher.commit(|s| s.forget("A.md")).unwrap());

        let on_disk = EngineState::load(&path).unwrap();
        assert!(!on_disk.path_mapping.contains_key("A.md"));
        assert_eq!(on_disk.path_mapping.get("B.md").map(String::as_str), Some("b.md"));
        assert_eq!(on_disk.post_hashes.get("B.md").map(String::as_str), Some("hb"));
        assert_eq!(watcher.mapped_filename("B.md").as_deref(), Some("b.md"));
    }

    #[test]
    fn test_reload_picks_up_other_writers() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        let first = StateStore::open(&path).unwrap();
        let second = StateStore::open(&path).unwrap();
        second
            .commit(|s| s.record_publish("n.md", "n.md", "h"))
            .unwrap();

        assert!(first.post_hash("n.md").is_none());
        first.reload().unwrap();
        assert_eq!(first.post_hash("n.md").as_deref(), Some("h"));
    }

    #[test]
    fn test_migrate_moves_entries() {
        let mut state = EngineState::default();
        state.record_publish("old.md", "old.md", "h");
        state.migrate("old.md", "new.md", "new.md");
        assert!(!state.post_hashes.contains_key("old.md"));
        assert!(!state.path_mapping.contains_key("old.md"));
        assert_eq!(state.post_hashes.get("new.md").map(String::as_str), Some("h"));
        assert_eq!(state.path_mapping.get("new.md").map(String::as_str), Some("new.md"));
    }

    #[test]
    fn test_forget_removes_both_entries() {
        let store = StateStore::in_memory(EngineState::default());
        store.record_publish("a.md", "a.md", "h");
        assert!(store.forget("a.md"));
        assert!(store.post_hash("a.md").is_none());
        assert!(store.mapped_filename("a.md").is_none());
        assert!(!store.forget("a.md"));
    }

    #[test]
    fn test_notes_mapped_to() {
        let store = StateStore::in_memory(EngineState::default());
        store.record_publish("x/Post.md", "post.md", "h1");
        store.record_publish("y/Other.md", "other.md", "h2");
        assert_eq!(store.notes_mapped_to("post.md"), vec!["x/Post.md".to_string()]);
        assert!(store.notes_mapped_to("missing.md").is_empty());
    }

    #[test]
    fn test_set_setting_parses_types() {
        let mut state = EngineState::default();
        state.set_setting("serverPort", "4321").unwrap();
        state.set_setting("hexoRoot", "/srv/blog").unwrap();
        state.set_setting("compressImages", "true").unwrap();
        state.set_setting("slugStyle", "title").unwrap();
        assert_eq!(state.settings.server_port, 4321);
        assert_eq!(state.settings.hexo_root, "/srv/blog");
        assert!(state.settings.compress_images);
        assert_eq!(state.settings.slug_style, SlugStyle::Title);
    }

    #[test]
    fn test_set_setting_rejects_unknown_and_mistyped() {
        let mut state = EngineState::default();
        assert!(matches!(
            state.set_setting("nope", "1"),
            Err(StateError::UnknownSetting(_))
        ));
        assert!(state.set_setting("serverPort", "not-a-port").is_err());
        assert_eq!(state.settings.server_port, 4000);
    }
}
