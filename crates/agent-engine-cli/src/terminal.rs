//! Incremental reply rendering on stdout.

use std::io::Write;

use agent_engine_core::Turn;

/// Prints reply text as it streams in.
///
/// Each update carries the whole accumulated text; only the part not yet on
/// screen is printed.
#[derive(Debug, Default)]
pub struct ReplyPrinter {
    printed: usize,
}

impl ReplyPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn show(&mut self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(unseen(text, self.printed).as_bytes());
        let _ = stdout.flush();
        self.printed = text.len();
    }

    /// End the current reply line, if anything was printed.
    pub fn finish(&mut self) {
        if self.printed > 0 {
            println!();
        }
        self.printed = 0;
    }
}

/// Suffix of `text` beyond the first `printed` bytes.
fn unseen(text: &str, printed: usize) -> &str {
    text.get(printed..).unwrap_or_default()
}

/// One `role: text` line per turn.
pub fn history_lines(turns: &[Turn]) -> Vec<String> {
    turns
        .iter()
        .map(|turn| format!("{}: {}", turn.role, turn.text))
        .collect()
}
