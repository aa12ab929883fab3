//! Filesystem-backed vault: a directory of markdown notes.
//!
//! Hidden entries (`.obsidian`, `.git`, the state file) are ignored. Link
//! resolution follows the usual vault rules: relative to the linking note,
//! then from the vault root, then by file name anywhere in the vault
//! (shallowest match wins).

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use walkdir::WalkDir;

use super::markup::{self, clean_link_target};
use super::{Frontmatter, Vault, VaultError, extension, file_name};

#[derive(Debug, Clone)]
pub struct FsVault {
    root: PathBuf,
}

impl FsVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a vault-relative note path.
    pub fn abs_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Vault-relative `/`-separated path for an absolute path under the root.
    pub fn relative_path(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        (!parts.is_empty()).then(|| parts.join("/"))
    }

    /// Every non-hidden file, as vault-relative paths.
    fn all_files(&self) -> Vec<String> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()))
            .flatten()
            .filter(|e| e.file_type().is_file())
        {
            if let Some(rel) = self.relative_path(entry.path()) {
                out.push(rel);
            }
        }
        out.sort();
        out
    }

    fn is_file(&self, path: &str) -> bool {
        !path.is_empty() && self.abs_path(path).is_file()
    }

    fn read_sync(&self, path: &str) -> Option<String> {
        std::fs::read_to_string(self.abs_path(path)).ok()
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| n.starts_with('.'))
}

/// Join `rel` onto the directory `base`, resolving `.` and `..` lexically.
fn join_lexical(base: &str, rel: &str) -> Option<String> {
    let mut parts: Vec<&str> = base.split('/').filter(|p| !p.is_empty()).collect();
    for part in rel.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

#[async_trait]
impl Vault for FsVault {
    async fn read(&self, path: &str) -> Result<String, VaultError> {
        let abs = self.abs_path(path);
        match tokio::fs::read_to_string(&abs).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VaultError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_binary(&self, path: &str) -> Result<Vec<u8>, VaultError> {
        let abs = self.abs_path(path);
        match tokio::fs::read(&abs).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VaultError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_frontmatter(
        &self,
        path: &str,
        patch: &mut (dyn for<'f> FnMut(&'f mut Frontmatter) + Send),
    ) -> Result<(), VaultError> {
        let text = self.read(path).await?;
        let (mut frontmatter, body) =
            markup::parse_frontmatter(&text).map_err(|source| VaultError::Frontmatter {
                path: path.to_string(),
                source,
            })?;
        let before = frontmatter.clone();
        patch(&mut frontmatter);
        if frontmatter == before && markup::split_document(&text).0.is_some() {
            return Ok(());
        }
        let rendered =
            markup::render_document(&frontmatter, body).map_err(|source| {
                VaultError::Frontmatter {
                    path: path.to_string(),
                    source,
                }
            })?;
        tokio::fs::write(self.abs_path(path), rendered).await?;
        tracing::debug!(path, "patched front-matter");
        Ok(())
    }

    async fn create(&self, path: &str, content: &str) -> Result<(), VaultError> {
        let abs = self.abs_path(path);
        if abs.exists() {
            return Err(VaultError::AlreadyExists(path.to_string()));
        }
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&abs, content).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), VaultError> {
        let src = self.abs_path(from);
        if !src.exists() {
            return Err(VaultError::NotFound(from.to_string()));
        }
        let dst = self.abs_path(to);
        if dst.exists() {
            return Err(VaultError::AlreadyExists(to.to_string()));
        }
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src, &dst).await?;
        Ok(())
    }

    fn frontmatter(&self, path: &str) -> Option<Frontmatter> {
        let text = self.read_sync(path)?;
        match markup::parse_frontmatter(&text) {
            Ok((frontmatter, _)) => Some(frontmatter),
            Err(e) => {
                tracing::warn!(path, error = %e, "ignoring malformed front-matter");
                None
            }
        }
    }

    fn embeds(&self, path: &str) -> Vec<String> {
        let Some(text) = self.read_sync(path) else {
            return Vec::new();
        };
        let (_, body) = markup::split_document(&text);
        markup::scan_embeds(body)
    }

    fn resolve_link(&self, token: &str, from: &str) -> Option<String> {
        let target = clean_link_target(token);
        if target.is_empty() {
            return None;
        }

        let mut candidates = vec![target.clone()];
        if extension(&target).is_none() {
            candidates.push(format!("{target}.md"));
        }

        for candidate in &candidates {
            if let Some(rel) = join_lexical(parent_dir(from), candidate)
                && self.is_file(&rel)
            {
                return Some(rel);
            }
            if let Some(rooted) = join_lexical("", candidate)
                && self.is_file(&rooted)
            {
                return Some(rooted);
            }
        }

        let wanted: Vec<&str> = candidates.iter().map(|c| file_name(c)).collect();
        self.all_files()
            .into_iter()
            .filter(|path| wanted.contains(&file_name(path)))
            .min_by_key(|path| (path.matches('/').count(), path.clone()))
    }

    fn list_notes(&self) -> Vec<String> {
        self.all_files()
            .into_iter()
            .filter(|path| extension(path).as_deref() == Some("md"))
            .collect()
    }

    fn exists(&self, path: &str) -> bool {
        self.is_file(path)
    }

    fn created(&self, path: &str) -> Option<DateTime<Local>> {
        let meta = std::fs::metadata(self.abs_path(path)).ok()?;
        let time = meta.created().or_else(|_| meta.modified()).ok()?;
        Some(DateTime::<Local>::from(time))
    }
}
