//! User-facing notices.
//!
//! The engine reports noteworthy events (published, demoted to draft, server
//! ready) through [`Notifier`]. How they are shown is up to the host; the CLI
//! prints them with [`TerminalNotifier`].

use colored::Colorize;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Sink for short human-readable messages.
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NoticeLevel, message: &str);

    fn info(&self, message: &str) {
        self.notify(NoticeLevel::Info, message);
    }

    fn success(&self, message: &str) {
        self.notify(NoticeLevel::Success, message);
    }

    fn warning(&self, message: &str) {
        self.notify(NoticeLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.notify(NoticeLevel::Error, message);
    }
}

/// Prints notices to stderr with a colored marker.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalNotifier;

impl TerminalNotifier {
    fn render(level: NoticeLevel, message: &str) -> String {
        let marker = match level {
            NoticeLevel::Info => "•".cyan(),
            NoticeLevel::Success => "✓".green(),
            NoticeLevel::Warning => "⚠".yellow(),
            NoticeLevel::Error => "✗".red(),
        };
        format!("{marker} {message}")
    }
}

impl Notifier for TerminalNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        eprintln!("{}", Self::render(level, message));
    }
}

/// Keeps every notice in memory. Useful when embedding the engine.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    notices: Mutex<Vec<(NoticeLevel, String)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far, oldest first.
    pub fn notices(&self) -> Vec<(NoticeLevel, String)> {
        self.notices.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.notices.lock().iter().map(|(_, m)| m.clone()).collect()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        self.notices.lock().push((level, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_notifier_records_in_order() {
        let notifier = MemoryNotifier::new();
        notifier.info("one");
        notifier.error("two");
        assert_eq!(
            notifier.notices(),
            vec![
                (NoticeLevel::Info, "one".to_string()),
                (NoticeLevel::Error, "two".to_string())
            ]
        );
    }

    #[test]
    fn test_terminal_render_keeps_message() {
        colored::control::set_override(false);
        assert_eq!(
            TerminalNotifier::render(NoticeLevel::Success, "done"),
            "✓ done"
        );
    }
}
