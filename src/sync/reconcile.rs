//! Keep the state tables honest when posts disappear outside the engine.
//!
//! A post removed (or renamed away) in the blog's `source/_posts` directory
//! demotes its note back to draft: the note is patched to `published: false`
//! and both its hash and mapping entries are erased. This happens either
//! from a one-off [`Reconciler::full_scan`] at startup or continuously from
//! [`Reconciler::watch`].

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::notice::Notifier;
use crate::state::{StateError, StateStore};
use crate::vault::{Frontmatter, Vault, file_name, paths_match};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Hexo root directory not configured")]
    HexoRootNotConfigured,

    #[error("Posts directory {} does not exist", .0.display())]
    PostsDirMissing(PathBuf),

    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    State(#[from] StateError),
}

/// What one reconciliation batch changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Notes patched back to `published: false`.
    pub demoted: Vec<String>,
    /// Note paths whose state entries were erased.
    pub forgotten: Vec<String>,
    /// Note paths that could not be found in the vault.
    pub missing_notes: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.forgotten.is_empty()
    }

    fn merge(&mut self, other: ReconcileReport) {
        self.demoted.extend(other.demoted);
        self.forgotten.extend(other.forgotten);
        self.missing_notes.extend(other.missing_notes);
    }
}

/// File names of posts that an event says are gone.
///
/// Removals count directly; a rename counts when its source path no longer
/// exists.
pub fn deleted_names(event: &Event) -> Vec<String> {
    let gone = |path: &PathBuf| match event.kind {
        EventKind::Remove(_) => true,
        EventKind::Modify(ModifyKind::Name(_)) => !path.exists(),
        _ => false,
    };
    event
        .paths
        .iter()
        .filter(|path| gone(path))
        .filter_map(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

pub struct Reconciler {
    vault: Arc<dyn Vault>,
    state: StateStore,
    notifier: Arc<dyn Notifier>,
}

impl Reconciler {
    pub fn new(vault: Arc<dyn Vault>, state: StateStore, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            vault,
            state,
            notifier,
        }
    }

    fn posts_dir(&self) -> Result<PathBuf, ReconcileError> {
        let dir = self
            .state
            .settings()
            .posts_dir()
            .ok_or(ReconcileError::HexoRootNotConfigured)?;
        if !dir.is_dir() {
            return Err(ReconcileError::PostsDirMissing(dir));
        }
        Ok(dir)
    }

    /// Demote every published note whose post file is missing.
    pub async fn full_scan(&self) -> Result<ReconcileReport, ReconcileError> {
        let posts_dir = self.posts_dir()?;
        self.state.reload()?;
        let mut expected: Vec<(String, String)> = self.state.read(|s| {
            s.post_hashes
                .keys()
                .map(|note| {
                    let post = s
                        .path_mapping
                        .get(note)
                        .cloned()
                        .unwrap_or_else(|| file_name(note).to_string());
                    (note.clone(), post)
                })
                .collect()
        });
        expected.sort();

        let missing: Vec<String> = expected
            .into_iter()
            .filter(|(_, post)| !posts_dir.join(post).exists())
            .map(|(note, _)| note)
            .collect();
        tracing::debug!(missing = missing.len(), "full scan finished");
        self.process_deletion(&missing).await
    }

    /// Note paths whose published post is named `post_name`.
    fn notes_for_post(&self, post_name: &str) -> Vec<String> {
        let mut notes = self.state.notes_mapped_to(post_name);
        let unmapped: Vec<String> = self.state.read(|s| {
            s.post_hashes
                .keys()
                .filter(|note| !s.path_mapping.contains_key(*note) && file_name(note) == post_name)
                .cloned()
                .collect()
        });
        notes.extend(unmapped);
        notes
    }

    /// Handle post files that were removed from the posts directory.
    pub async fn handle_removed_posts(
        &self,
        post_names: &[String],
    ) -> Result<ReconcileReport, ReconcileError> {
        // Other processes may have published since the last batch.
        self.state.reload()?;
        let affected: BTreeSet<String> = post_names
            .iter()
            .flat_map(|name| self.notes_for_post(name))
            .collect();
        let affected: Vec<String> = affected.into_iter().collect();
        self.process_deletion(&affected).await
    }

    /// Find a note in the vault, tolerating unicode-normalization drift.
    fn locate_note(&self, note: &str) -> Option<String> {
        if self.vault.exists(note) {
            return Some(note.to_string());
        }
        let notes = self.vault.list_notes();
        if let Some(found) = notes.iter().find(|p| p.as_str() == note) {
            return Some(found.clone());
        }
        notes.into_iter().find(|p| paths_match(p, note))
    }

    /// Demote `notes` to draft and erase their state entries. Entries are
    /// erased even when the note itself is gone.
    pub async fn process_deletion(&self, notes: &[String]) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();
        if notes.is_empty() {
            return Ok(report);
        }

        for note in notes {
            match self.locate_note(note) {
                Some(found) => {
                    let patched = self
                        .vault
                        .patch_frontmatter(&found, &mut |fm: &mut Frontmatter| {
                            fm.set("published", false)
                        })
                        .await;
                    match patched {
                        Ok(()) => report.demoted.push(found),
                        Err(e) => tracing::warn!(note, error = %e, "failed to demote note"),
                    }
                }
                None => {
                    tracing::debug!(note, "note no longer in vault");
                    report.missing_notes.push(note.clone());
                }
            }
        }

        report.forgotten = self.state.commit(|s| {
            notes
                .iter()
                .filter(|note| s.forget(note))
                .cloned()
                .collect::<Vec<String>>()
        })?;

        if !report.forgotten.is_empty() {
            tracing::info!(
                demoted = report.demoted.len(),
                forgotten = report.forgotten.len(),
                "reconciled removed posts"
            );
            self.notifier.warning(&format!(
                "{} published post(s) removed from Hexo; note(s) returned to draft: {}",
                report.forgotten.len(),
                report.forgotten.join(", ")
            ));
        }
        Ok(report)
    }

    /// Watch the posts directory until `shutdown` resolves. Each batch of
    /// removals is reconciled as it arrives.
    pub async fn watch<F>(&self, shutdown: F) -> Result<ReconcileReport, ReconcileError>
    where
        F: Future<Output = ()>,
    {
        let posts_dir = self.posts_dir()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |result| {
                if tx.send(result).is_err() {
                    tracing::debug!("watch channel closed, dropping event");
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(&posts_dir, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %posts_dir.display(), "watching posts directory");

        let mut total = ReconcileReport::default();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                received = rx.recv() => {
                    let Some(first) = received else { break };
                    let mut names = Vec::new();
                    collect_deleted(first, &mut names);
                    while let Ok(next) = rx.try_recv() {
                        collect_deleted(next, &mut names);
                    }
                    if names.is_empty() {
                        continue;
                    }
                    match self.handle_removed_posts(&names).await {
                        Ok(report) => total.merge(report),
                        Err(e) => tracing::error!(error = %e, "failed to reconcile removed posts"),
                    }
                }
            }
        }

        unwatch(&mut watcher, &posts_dir);
        Ok(total)
    }
}

fn collect_deleted(result: notify::Result<Event>, names: &mut Vec<String>) {
    match result {
        Ok(event) => {
            for name in deleted_names(&event) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "watcher error"),
    }
}

fn unwatch(watcher: &mut RecommendedWatcher, path: &Path) {
    if let Err(e) = watcher.unwatch(path) {
        tracing::debug!(error = %e, "unwatch failed");
    }
}
