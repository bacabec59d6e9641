//! Deciding whether a page needs OCR.

/// Pages whose embedded text totals more than this many characters are
/// treated as already searchable and skipped for recognition. The threshold
/// tolerates incidental text (stamps, watermarks, stray artifacts) without
/// mistaking a genuinely scanned page for a text page.
pub const EMBEDDED_TEXT_THRESHOLD: usize = 20;

/// What we know about a page after looking at its embedded text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAnalysis {
    /// Total length of the page's embedded text, summed over trimmed runs.
    pub embedded_text_len: usize,
    /// Does this page need to go through the recognition service?
    pub needs_recognition: bool,
}

/// Analyze one page's embedded text.
///
/// The length is the sum of the trimmed lengths of each text run, so a page
/// full of whitespace-only runs still counts as empty.
pub fn analyze_page(embedded_text: &str) -> PageAnalysis {
    let embedded_text_len = embedded_text
        .lines()
        .map(|run| run.trim().chars().count())
        .sum();
    PageAnalysis {
        embedded_text_len,
        needs_recognition: embedded_text_len <= EMBEDDED_TEXT_THRESHOLD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_page_needs_recognition() {
        let analysis = analyze_page("");
        assert_eq!(analysis.embedded_text_len, 0);
        assert!(analysis.needs_recognition);
    }

    #[test]
    fn whitespace_only_runs_count_as_empty() {
        let analysis = analyze_page("   \n\t\n   \n");
        assert_eq!(analysis.embedded_text_len, 0);
        assert!(analysis.needs_recognition);
    }

    #[test]
    fn threshold_is_inclusive() {
        // Exactly 20 characters still needs recognition.
        let analysis = analyze_page("12345678901234567890");
        assert_eq!(analysis.embedded_text_len, 20);
        assert!(analysis.needs_recognition);

        // 21 characters does not.
        let analysis = analyze_page("123456789012345678901");
        assert_eq!(analysis.embedded_text_len, 21);
        assert!(!analysis.needs_recognition);
    }

    #[test]
    fn runs_are_trimmed_before_summing() {
        // Three runs of 10 trimmed characters each.
        let analysis = analyze_page("  helloabcde  \nhelloabcde\n  helloabcde");
        assert_eq!(analysis.embedded_text_len, 30);
        assert!(!analysis.needs_recognition);
    }

    #[test]
    fn text_heavy_page_is_skipped() {
        let analysis =
            analyze_page("This page was produced by a word processor and has real text.");
        assert!(!analysis.needs_recognition);
    }
}
