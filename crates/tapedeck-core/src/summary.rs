//! Exit-time tape accounting output.

use std::io::Write;

use crate::store::StoreSummary;

/// Render the session summary: new tapes first, then loaded-but-unused ones,
/// both sorted by the store.
#[must_use]
pub fn render_summary(summary: &StoreSummary) -> String {
    let mut out = String::new();
    out.push_str("===== tapedeck summary =====\n");
    if summary.new.is_empty() && summary.unused.is_empty() {
        out.push_str("No tape activity in this session\n");
    }
    if !summary.new.is_empty() {
        out.push_str("New tapes:\n");
        for path in &summary.new {
            out.push_str(&format!("- {}\n", path.display()));
        }
    }
    if !summary.unused.is_empty() {
        out.push_str("Unused tapes:\n");
        for path in &summary.unused {
            out.push_str(&format!("- {}\n", path.display()));
        }
    }
    out.push_str("============================\n");
    out
}

/// Print the summary to standard error.
pub fn print_summary(summary: &StoreSummary) {
    let text = render_summary(summary);
    let mut stderr = std::io::stderr().lock();
    let _ = stderr.write_all(text.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn renders_both_sections() {
        let summary = StoreSummary {
            new: vec![PathBuf::from("tapes/git/new.json5")],
            unused: vec![PathBuf::from("tapes/git/old.json5")],
        };
        let text = render_summary(&summary);
        assert!(text.contains("New tapes:\n- tapes/git/new.json5"));
        assert!(text.contains("Unused tapes:\n- tapes/git/old.json5"));
    }

    #[test]
    fn renders_quiet_session() {
        let text = render_summary(&StoreSummary::default());
        assert!(text.contains("No tape activity"));
    }
}
