//! Terminal rendering and confirmation prompts.

use colored::Colorize;
use dialoguer::{Confirm, theme::ColorfulTheme};
use thiserror::Error;

use crate::publish::UnusedAsset;
use crate::sync::{StatusBoard, SyncStatus};

#[derive(Error, Debug)]
pub enum InteractiveError {
    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(String),
}

/// Colored one-word badge for a status.
pub fn badge(status: SyncStatus) -> String {
    match status {
        SyncStatus::Published => "published".green().to_string(),
        SyncStatus::Unsynced => "unsynced".yellow().to_string(),
        SyncStatus::Draft => "draft".dimmed().to_string(),
    }
}

/// Dashboard view: one section per status, unsynced first.
pub fn render_board(board: &StatusBoard) -> String {
    if board.is_empty() {
        return "No notes in hexo format.".dimmed().to_string();
    }

    let sections = [
        (SyncStatus::Unsynced, &board.unsynced),
        (SyncStatus::Draft, &board.drafts),
        (SyncStatus::Published, &board.published),
    ];
    let mut lines = Vec::new();
    for (status, notes) in sections {
        if notes.is_empty() {
            continue;
        }
        lines.push(format!("{} ({})", badge(status).bold(), notes.len()));
        for note in notes {
            lines.push(format!("  {note}"));
        }
    }
    lines.push(String::new());
    lines.push(
        format!(
            "{} notes: {} unsynced, {} drafts, {} published",
            board.total(),
            board.unsynced.len(),
            board.drafts.len(),
            board.published.len()
        )
        .dimmed()
        .to_string(),
    );
    lines.join("\n")
}

/// Unused assets grouped under the title of the note that owns them.
pub fn render_unused(unused: &[UnusedAsset]) -> String {
    let mut lines = Vec::new();
    let mut current: Option<&str> = None;
    for asset in unused {
        if current != Some(asset.note_path.as_str()) {
            current = Some(asset.note_path.as_str());
            lines.push(format!(
                "{} {}",
                asset.note_title.bold(),
                format!("({})", asset.note_path).dimmed()
            ));
        }
        lines.push(format!("  {} {}", "✗".red(), asset.file_name));
    }
    lines.join("\n")
}

/// Ask for confirmation before a destructive operation.
pub fn confirm_action(message: &str, default: bool) -> Result<bool, InteractiveError> {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(message)
        .default(default)
        .interact_opt()
        .map_err(|e| InteractiveError::IoError(e.to_string()))?
        .ok_or(InteractiveError::Cancelled)
}
