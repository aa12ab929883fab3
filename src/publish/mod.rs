//! Note-to-post publishing.
//!
//! [`Publisher`] turns a vault note into a file under `<hexoRoot>/source/_posts`:
//!
//! 1. fill in missing front-matter (`title`, `date`, `tags`, `published`,
//!    `permalink`) and mark the note `published: true`;
//! 2. pick the published file name, reusing the recorded mapping;
//! 3. copy images into the post's asset folder and rewrite embeds, rewrite
//!    internal links, optionally add an excerpt marker;
//! 4. write the post, then record the mapping and the hash of the untouched
//!    note text.
//!
//! Nothing is recorded unless the post was written.

pub mod assets;
pub mod links;
pub mod permalink;
pub mod sanitize;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use serde_yaml::Value;
use thiserror::Error;

use crate::state::{Settings, SlugStyle, StateError, StateStore};
use crate::sync::status::posts_by_status;
use crate::vault::markup::parse_frontmatter;
use crate::vault::{Frontmatter, Vault, VaultError, file_name, file_stem};

use assets::{AssetError, AssetExtractor, AssetOptions, asset_dir_for};
use permalink::{PermalinkDeriver, Translator, content_hash};
use sanitize::{sanitize, unique_name};

/// Front-matter date format.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Hexo's read-more marker.
pub const EXCERPT_MARKER: &str = "<!--more-->";

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Hexo root directory not configured")]
    HexoRootNotConfigured,

    #[error("Posts directory {} does not exist", .0.display())]
    PostsDirMissing(PathBuf),

    #[error("Note not found: {0}")]
    NoteNotFound(String),

    #[error("Permalink required for {0} (slug style is manual)")]
    PermalinkRequired(String),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Publish I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub note_path: String,
    /// File name inside the posts directory.
    pub file_name: String,
    /// Absolute path of the written post.
    pub target: PathBuf,
    pub permalink: String,
    /// Asset-folder names written during this publish, sorted.
    pub assets: Vec<String>,
    /// Hash of the note text that was published.
    pub hash: String,
}

/// Result of moving a published note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameOutcome {
    pub from_file: String,
    pub to_file: String,
    /// Whether a post file existed and was moved.
    pub moved: bool,
}

/// An image in some post's asset folder that nothing references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnusedAsset {
    pub note_path: String,
    pub note_title: String,
    pub file_name: String,
    pub file_path: PathBuf,
}

/// Outcome of publishing every pending note.
#[derive(Debug, Default)]
pub struct BulkReport {
    pub published: Vec<PublishOutcome>,
    pub failed: Vec<(String, PublishError)>,
}

impl BulkReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Front-matter values to add when missing.
#[derive(Debug, Clone)]
struct HeaderDefaults {
    title: String,
    date: String,
    permalink: String,
}

impl HeaderDefaults {
    fn apply(&self, fm: &mut Frontmatter) {
        if fm.is_blank("title") {
            fm.set("title", self.title.as_str());
        }
        if fm.is_blank("date") {
            fm.set("date", self.date.as_str());
        }
        if !fm.contains("tags") || fm.get("tags") == Some(&Value::Null) {
            fm.set("tags", Value::Sequence(Vec::new()));
        }
        if !fm.contains("published") {
            fm.set("published", false);
        }
        if fm.is_blank("permalink") {
            fm.set("permalink", self.permalink.as_str());
        }
    }
}

/// Replace the first `field: ...` entry of a front-matter block, including
/// any indented or `- ` continuation lines of a block-style value.
fn replace_header_line(header: &str, field: &str, value: &str) -> String {
    let prefix = format!("{field}:");
    let mut out = String::with_capacity(header.len());
    let mut replaced = false;
    let mut in_value = false;
    for line in header.split_inclusive('\n') {
        if in_value {
            if line.starts_with([' ', '\t']) || line.starts_with("- ") {
                continue;
            }
            in_value = false;
        }
        if !replaced && line.starts_with(&prefix) {
            let ending = &line[line.trim_end_matches(['\n', '\r']).len()..];
            out.push_str(&format!("{field}: {value}{ending}"));
            replaced = true;
            in_value = true;
        } else {
            out.push_str(line);
        }
    }
    out
}

/// Scalar cover value. Unquoted `[[x.png]]` parses as a nested sequence.
fn cover_value(fm: &Frontmatter, field: &str) -> Option<String> {
    fn first_string(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Sequence(items) => items.first().and_then(first_string),
            _ => None,
        }
    }
    fm.get(field)
        .and_then(first_string)
        .filter(|s| !s.trim().is_empty())
}

/// Insert [`EXCERPT_MARKER`] after the first paragraph unless a marker is
/// already present.
pub fn insert_excerpt(body: &str) -> String {
    if body.contains(EXCERPT_MARKER) || body.contains("<!-- more -->") {
        return body.to_string();
    }

    let lead = body.len() - body.trim_start_matches(['\n', '\r']).len();
    let rest = &body[lead..];
    if rest.trim().is_empty() {
        return body.to_string();
    }

    let paragraph_end = rest.find("\n\n").or_else(|| rest.find("\r\n\r\n"));
    match paragraph_end {
        Some(end) => format!(
            "{}{}\n\n{EXCERPT_MARKER}{}",
            &body[..lead],
            &rest[..end],
            &rest[end..]
        ),
        None => format!("{}\n\n{EXCERPT_MARKER}\n", body.trim_end()),
    }
}

/// Current local time in [`DATE_FORMAT`].
pub fn now_formatted() -> String {
    Local::now().format(DATE_FORMAT).to_string()
}

/// Publishes notes from one vault into one Hexo blog.
#[derive(Clone)]
pub struct Publisher {
    vault: Arc<dyn Vault>,
    state: StateStore,
    translator: Option<Arc<dyn Translator>>,
}

impl Publisher {
    pub fn new(vault: Arc<dyn Vault>, state: StateStore) -> Self {
        Self {
            vault,
            state,
            translator: None,
        }
    }

    /// Use `translator` instead of Baidu for the translate slug style.
    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn vault(&self) -> &Arc<dyn Vault> {
        &self.vault
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    fn deriver(&self, settings: &Settings) -> PermalinkDeriver {
        let deriver = PermalinkDeriver::new(settings);
        match &self.translator {
            Some(translator) => deriver.with_translator(translator.clone()),
            None => deriver,
        }
    }

    /// `<hexoRoot>/source/_posts`, which must exist.
    pub fn posts_dir(&self) -> Result<PathBuf, PublishError> {
        let dir = self
            .state
            .settings()
            .posts_dir()
            .ok_or(PublishError::HexoRootNotConfigured)?;
        if !dir.is_dir() {
            return Err(PublishError::PostsDirMissing(dir));
        }
        Ok(dir)
    }

    async fn read_frontmatter(&self, note: &str) -> Result<Frontmatter, PublishError> {
        let text = self.vault.read(note).await?;
        let (frontmatter, _) =
            parse_frontmatter(&text).map_err(|source| VaultError::Frontmatter {
                path: note.to_string(),
                source,
            })?;
        Ok(frontmatter)
    }

    /// Values for missing keys. With `strict`, an empty permalink under the
    /// manual style is an error; otherwise it is left empty for the user.
    async fn header_defaults(
        &self,
        note: &str,
        fm: &Frontmatter,
        strict: bool,
    ) -> Result<HeaderDefaults, PublishError> {
        let settings = self.state.settings();

        let title = fm
            .get_str("title")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| file_stem(note).to_string());

        let date = self
            .vault
            .created(note)
            .map(|t| t.format(DATE_FORMAT).to_string())
            .unwrap_or_else(now_formatted);

        let mut permalink = String::new();
        if fm.is_blank("permalink") {
            let deriver = self.deriver(&settings);
            permalink = deriver.derive(&title).await;
            if permalink.is_empty() {
                if deriver.style() == SlugStyle::Manual {
                    if strict {
                        return Err(PublishError::PermalinkRequired(note.to_string()));
                    }
                } else {
                    tracing::info!(note, "falling back to hash permalink");
                    permalink = deriver.with_style(SlugStyle::Hash).derive(&title).await;
                }
            }
        }

        Ok(HeaderDefaults {
            title,
            date,
            permalink,
        })
    }

    /// Add missing publish keys to a note without publishing it.
    pub async fn convert(&self, note: &str) -> Result<(), PublishError> {
        if !self.vault.exists(note) {
            return Err(PublishError::NoteNotFound(note.to_string()));
        }
        let fm = self.read_frontmatter(note).await?;
        let defaults = self.header_defaults(note, &fm, false).await?;
        self.vault
            .patch_frontmatter(note, &mut |fm: &mut Frontmatter| defaults.apply(fm))
            .await?;
        tracing::info!(note, "converted note to hexo format");
        Ok(())
    }

    /// Publish one note. `on_complete` runs after the post and the state
    /// entries have been written.
    pub async fn publish<F>(&self, note: &str, on_complete: F) -> Result<PublishOutcome, PublishError>
    where
        F: FnOnce(&PublishOutcome) + Send,
    {
        let posts_dir = self.posts_dir()?;
        if !self.vault.exists(note) {
            return Err(PublishError::NoteNotFound(note.to_string()));
        }
        self.state.reload()?;
        let settings = self.state.settings();

        let fm = self.read_frontmatter(note).await?;
        let defaults = self.header_defaults(note, &fm, true).await?;
        self.vault
            .patch_frontmatter(note, &mut |fm: &mut Frontmatter| {
                defaults.apply(fm);
                fm.set("published", true);
            })
            .await?;

        let file_name = match self.state.mapped_filename(note) {
            Some(mapped) => mapped,
            None => unique_name(&posts_dir, &sanitize(file_name(note))),
        };

        let original = self.vault.read(note).await?;
        let hash = content_hash(&original);
        let (frontmatter, body) =
            parse_frontmatter(&original).map_err(|source| VaultError::Frontmatter {
                path: note.to_string(),
                source,
            })?;
        let mut header = original[..original.len() - body.len()].to_string();

        let asset_dir = asset_dir_for(&posts_dir, &file_name);
        let extractor = AssetExtractor::new(self.vault.as_ref(), AssetOptions::from_settings(&settings));
        let mut processed = HashSet::new();

        let field = settings.cover_field();
        if let Some(cover) = cover_value(&frontmatter, field)
            && let Some(final_name) = extractor
                .process_cover(note, &cover, &asset_dir, &mut processed)
                .await?
        {
            header = replace_header_line(&header, field, &final_name);
        }

        let body = extractor
            .process_embeds(note, body, &asset_dir, &mut processed)
            .await?;
        let mapping = self.state.read(|s| s.path_mapping.clone());
        let mut body = links::rewrite_links(&body, note, self.vault.as_ref(), &mapping);
        if settings.auto_excerpt {
            body = insert_excerpt(&body);
        }

        let target = posts_dir.join(&file_name);
        tokio::fs::write(&target, format!("{header}{body}")).await?;

        self.state
            .commit(|s| s.record_publish(note, &file_name, &hash))?;

        let mut assets: Vec<String> = processed.into_iter().collect();
        assets.sort();
        let outcome = PublishOutcome {
            note_path: note.to_string(),
            file_name,
            target,
            permalink: frontmatter.get_str("permalink").unwrap_or_default(),
            assets,
            hash,
        };
        tracing::info!(
            note,
            target = %outcome.target.display(),
            assets = outcome.assets.len(),
            "published note"
        );
        on_complete(&outcome);
        Ok(outcome)
    }

    /// Publish every hexo-format note that is a draft or out of sync.
    /// Failures are collected and do not stop the batch.
    pub async fn publish_pending<F>(&self, on_complete: F) -> Result<BulkReport, PublishError>
    where
        F: Fn(&PublishOutcome) + Send + Sync,
    {
        self.posts_dir()?;
        let board = posts_by_status(self.vault.as_ref(), &self.state).await;
        let mut report = BulkReport::default();
        for note in board.pending() {
            match self.publish(note, &on_complete).await {
                Ok(outcome) => report.published.push(outcome),
                Err(e) => {
                    tracing::warn!(note, error = %e, "bulk publish failed for note");
                    report.failed.push((note.clone(), e));
                }
            }
        }
        tracing::info!(
            published = report.published.len(),
            failed = report.failed.len(),
            "bulk publish finished"
        );
        Ok(report)
    }

    /// Whether `note` has a hash or mapping entry, i.e. a post to follow.
    pub fn is_tracked(&self, note: &str) -> bool {
        self.state.read(|s| {
            s.post_hashes.contains_key(note) || s.path_mapping.contains_key(note)
        })
    }

    /// Follow a note rename: move the post (and its asset folder) to a name
    /// derived from the new note name and migrate the state entries.
    ///
    /// Returns `None` when the note was never published. Once the post has
    /// moved the entries are migrated even if the asset folder cannot follow.
    pub async fn sync_rename(
        &self,
        old_path: &str,
        new_path: &str,
    ) -> Result<Option<RenameOutcome>, PublishError> {
        self.state.reload()?;
        if !self.is_tracked(old_path) {
            return Ok(None);
        }

        let posts_dir = self.posts_dir()?;
        let from_file = self
            .state
            .mapped_filename(old_path)
            .unwrap_or_else(|| sanitize(file_name(old_path)));
        let wanted = sanitize(file_name(new_path));
        let to_file = if wanted == from_file {
            from_file.clone()
        } else {
            unique_name(&posts_dir, &wanted)
        };

        let old_post = posts_dir.join(&from_file);
        let moved = to_file != from_file && old_post.is_file();
        if moved {
            tokio::fs::rename(&old_post, posts_dir.join(&to_file)).await?;
        }
        self.state
            .commit(|s| s.migrate(old_path, new_path, &to_file))?;

        if moved {
            let old_assets = asset_dir_for(&posts_dir, &from_file);
            let new_assets = asset_dir_for(&posts_dir, &to_file);
            if old_assets.is_dir()
                && !new_assets.exists()
                && let Err(e) = tokio::fs::rename(&old_assets, &new_assets).await
            {
                tracing::warn!(
                    from = %old_assets.display(),
                    to = %new_assets.display(),
                    error = %e,
                    "failed to move asset folder"
                );
            }
        }

        tracing::info!(old_path, new_path, from = %from_file, to = %to_file, moved, "synced rename");
        Ok(Some(RenameOutcome {
            from_file,
            to_file,
            moved,
        }))
    }

    /// Images in the note's asset folder that neither the body nor the cover
    /// references.
    pub async fn find_unused(&self, note: &str) -> Result<Vec<String>, PublishError> {
        let posts_dir = self.posts_dir()?;
        let Some(published) = self.state.mapped_filename(note) else {
            return Ok(Vec::new());
        };
        self.unused_in(&posts_dir, note, &published).await
    }

    async fn unused_in(
        &self,
        posts_dir: &Path,
        note: &str,
        published: &str,
    ) -> Result<Vec<String>, PublishError> {
        let settings = self.state.settings();
        let fm = self.read_frontmatter(note).await?;
        let cover = cover_value(&fm, settings.cover_field());
        let extractor = AssetExtractor::new(self.vault.as_ref(), AssetOptions::from_settings(&settings));
        let referenced = extractor.referenced_names(note, cover.as_deref());
        Ok(assets::find_unused(&asset_dir_for(posts_dir, published), &referenced)?)
    }

    /// Unused images across every published note still in the vault.
    pub async fn find_all_unused(&self) -> Result<Vec<UnusedAsset>, PublishError> {
        let posts_dir = self.posts_dir()?;
        let mut mapping: Vec<(String, String)> = self
            .state
            .read(|s| s.path_mapping.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        mapping.sort();

        let mut unused = Vec::new();
        for (note, published) in mapping {
            if !self.vault.exists(&note) {
                continue;
            }
            let note_title = self
                .vault
                .frontmatter(&note)
                .and_then(|fm| fm.get_str("title"))
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| file_stem(&note).to_string());
            let asset_dir = asset_dir_for(&posts_dir, &published);
            for name in self.unused_in(&posts_dir, &note, &published).await? {
                unused.push(UnusedAsset {
                    note_path: note.clone(),
                    note_title: note_title.clone(),
                    file_path: asset_dir.join(&name),
                    file_name: name,
                });
            }
        }
        Ok(unused)
    }

    /// Delete previously found unused assets. Returns how many were removed.
    pub async fn delete_unused(&self, unused: &[UnusedAsset]) -> Result<usize, PublishError> {
        let mut removed = 0;
        for asset in unused {
            let Some(dir) = asset.file_path.parent() else {
                continue;
            };
            removed += assets::delete_assets(dir, std::slice::from_ref(&asset.file_name)).await?;
        }
        Ok(removed)
    }

    /// Create an empty post template in vault directory `dir`. Returns its path.
    pub async fn create_post(&self, dir: &str) -> Result<String, PublishError> {
        let now = Local::now();
        let name = format!("{}-new-post.md", now.format("%Y-%m-%d-%H%M%S"));
        let dir = dir.trim_matches('/');
        let path = if dir.is_empty() {
            name
        } else {
            format!("{dir}/{name}")
        };
        let template = format!(
            "---\ntitle: \npermalink: \ndate: {}\ntags: []\npublished: false\n---\n\n# \n",
            now.format(DATE_FORMAT)
        );
        self.vault.create(&path, &template).await?;
        tracing::info!(path, "created post");
        Ok(path)
    }
}
