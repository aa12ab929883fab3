//! Drift detection between notes and their published copies.

use serde::Serialize;

use crate::publish::permalink::content_hash;
use crate::state::StateStore;
use crate::vault::markup::parse_frontmatter;
use crate::vault::{Vault, VaultError};

/// Where a note stands relative to the blog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Not marked `published: true`.
    Draft,
    /// Published and unchanged since.
    Published,
    /// Marked published but edited since, or never actually written out.
    Unsynced,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Published => write!(f, "published"),
            Self::Unsynced => write!(f, "unsynced"),
        }
    }
}

/// Status of one note. Never mutates anything.
pub async fn status(
    vault: &dyn Vault,
    state: &StateStore,
    note: &str,
) -> Result<SyncStatus, VaultError> {
    let text = vault.read(note).await?;
    Ok(classify(state, note, &text).1)
}

/// `(is_hexo_format, status)` for a note's current text.
fn classify(state: &StateStore, note: &str, text: &str) -> (bool, SyncStatus) {
    let frontmatter = match parse_frontmatter(text) {
        Ok((frontmatter, _)) => frontmatter,
        Err(e) => {
            tracing::warn!(note, error = %e, "unreadable front-matter, treating as draft");
            return (false, SyncStatus::Draft);
        }
    };

    if !frontmatter.is_published() {
        return (frontmatter.is_hexo_format(), SyncStatus::Draft);
    }

    let status = match state.post_hash(note) {
        Some(saved) if saved == content_hash(text) => SyncStatus::Published,
        _ => SyncStatus::Unsynced,
    };
    (frontmatter.is_hexo_format(), status)
}

/// Hexo-format notes grouped by status, each list sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusBoard {
    pub unsynced: Vec<String>,
    pub drafts: Vec<String>,
    pub published: Vec<String>,
}

impl StatusBoard {
    pub fn is_empty(&self) -> bool {
        self.unsynced.is_empty() && self.drafts.is_empty() && self.published.is_empty()
    }

    pub fn total(&self) -> usize {
        self.unsynced.len() + self.drafts.len() + self.published.len()
    }

    /// Notes that a bulk publish should pick up: unsynced first, then drafts.
    pub fn pending(&self) -> impl Iterator<Item = &String> {
        self.unsynced.iter().chain(self.drafts.iter())
    }
}

/// Group every note in hexo format by its status.
///
/// Notes that disappear or fail to read mid-scan are skipped.
pub async fn posts_by_status(vault: &dyn Vault, state: &StateStore) -> StatusBoard {
    let mut board = StatusBoard::default();
    for note in vault.list_notes() {
        let text = match vault.read(&note).await {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!(note, error = %e, "skipping unreadable note");
                continue;
            }
        };
        let (hexo_format, status) = classify(state, &note, &text);
        if !hexo_format {
            continue;
        }
        match status {
            SyncStatus::Unsynced => board.unsynced.push(note),
            SyncStatus::Draft => board.drafts.push(note),
            SyncStatus::Published => board.published.push(note),
        }
    }
    board
}
