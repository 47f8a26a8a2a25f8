//! Text measurement over Unicode strings.
//!
//! All layout and rendering math goes through this module: grapheme
//! clusters, display cell widths, ANSI-aware measurement, tab expansion,
//! truncation and wrapping. East-Asian wide clusters count 2 cells,
//! combining marks and the soft hyphen count 0, and Kitty image
//! placeholder characters count 1 per placeholder.

use std::sync::OnceLock;

use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;
use unicode_width::UnicodeWidthStr;

/// Tabs expand to the next multiple of this column count.
pub const TAB_SIZE: usize = 8;

/// Kitty graphics Unicode placeholder character.
pub const KITTY_PLACEHOLDER: char = '\u{10EEEE}';

fn sgr_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("\u{1b}\\[[0-9;]*m").expect("static regex"))
}

/// Remove ANSI SGR sequences from a string.
pub fn strip_ansi(s: &str) -> String {
    if !s.contains('\u{1b}') {
        return s.to_string();
    }
    sgr_pattern().replace_all(s, "").into_owned()
}

/// Display width of a single grapheme cluster.
pub fn cluster_width(cluster: &str) -> usize {
    if cluster == "\u{00AD}" {
        return 0; // soft hyphen
    }
    if cluster.chars().next() == Some(KITTY_PLACEHOLDER) {
        // Placeholder plus row/col diacritics occupies one cell.
        return 1;
    }
    cluster.width()
}

/// Sum of display widths after stripping SGR sequences and expanding tabs.
pub fn visible_length(s: &str) -> usize {
    let plain = strip_ansi(s);
    let mut col = 0usize;
    for cluster in plain.graphemes(true) {
        if cluster == "\t" {
            col = (col / TAB_SIZE + 1) * TAB_SIZE;
        } else {
            col += cluster_width(cluster);
        }
    }
    col
}

/// Longest grapheme-cluster prefix whose visible length fits in `cols`.
/// Never splits a cluster; newlines are treated as spaces.
pub fn truncate_to(s: &str, cols: usize) -> String {
    let mut out = String::new();
    let mut used = 0usize;
    for cluster in s.graphemes(true) {
        let (cluster, width) = if cluster == "\n" || cluster == "\r\n" {
            (" ", 1)
        } else if cluster == "\t" {
            let next = (used / TAB_SIZE + 1) * TAB_SIZE;
            ("\t", next - used)
        } else {
            (cluster, cluster_width(cluster))
        };
        if used + width > cols {
            break;
        }
        out.push_str(cluster);
        used += width;
    }
    out
}

/// Pad with trailing spaces to exactly `cols` visible cells, truncating
/// first when the input is too wide.
pub fn pad_right(s: &str, cols: usize) -> String {
    let width = visible_length(s);
    if width > cols {
        let mut out = truncate_to(s, cols);
        let short = cols - visible_length(&out);
        out.extend(std::iter::repeat_n(' ', short));
        return out;
    }
    let mut out = s.to_string();
    out.extend(std::iter::repeat_n(' ', cols - width));
    out
}

/// Greedy word-wrap by display cell width. Words are preserved; a word
/// wider than `cols` is split at cluster boundaries. Blank input yields
/// a single empty line.
pub fn wrap_plain_text(s: &str, cols: usize) -> Vec<String> {
    let cols = cols.max(1);
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_width = 0usize;

    for word in s.split_whitespace() {
        let word_width = visible_length(word);
        let sep = usize::from(!current.is_empty());

        if current_width + sep + word_width <= cols {
            if sep == 1 {
                current.push(' ');
            }
            current.push_str(word);
            current_width += sep + word_width;
            continue;
        }

        if !current.is_empty() {
            lines.push(std::mem::take(&mut current));
            current_width = 0;
        }

        if word_width <= cols {
            current.push_str(word);
            current_width = word_width;
        } else {
            // Unbreakable token wider than the column: cell-split it.
            let mut pieces = wrap_cells(word, cols);
            if let Some(last) = pieces.pop() {
                lines.extend(pieces);
                current_width = visible_length(&last);
                current = last;
            }
        }
    }

    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}

/// Cell-accurate wrap that may split inside a long unbreakable token.
pub fn wrap_cells(s: &str, cols: usize) -> Vec<String> {
    let cols = cols.max(1);
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut used = 0usize;

    for cluster in s.graphemes(true) {
        if cluster == "\n" || cluster == "\r\n" {
            lines.push(std::mem::take(&mut current));
            used = 0;
            continue;
        }
        let width = if cluster == "\t" {
            (used / TAB_SIZE + 1) * TAB_SIZE - used
        } else {
            cluster_width(cluster)
        };
        if used + width > cols && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
            used = 0;
        }
        current.push_str(cluster);
        used += width;
    }

    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visible_length_ignores_sgr() {
        assert_eq!(visible_length("plain"), 5);
        assert_eq!(visible_length("\u{1b}[1mbold\u{1b}[0m"), 4);
        assert_eq!(visible_length("\u{1b}[38;2;10;20;30mrgb\u{1b}[39m"), 3);
    }

    #[test]
    fn visible_length_counts_wide_clusters() {
        assert_eq!(visible_length("日本語"), 6);
        assert_eq!(visible_length("a日b"), 4);
    }

    #[test]
    fn visible_length_expands_tabs() {
        assert_eq!(visible_length("\t"), 8);
        assert_eq!(visible_length("ab\t"), 8);
        assert_eq!(visible_length("abcdefgh\t"), 16);
    }

    #[test]
    fn soft_hyphen_and_combining_marks_are_zero_width() {
        assert_eq!(visible_length("co\u{00AD}operate"), 9);
        // e + combining acute forms one 1-cell cluster
        assert_eq!(visible_length("e\u{0301}"), 1);
    }

    #[test]
    fn truncate_respects_cluster_boundaries() {
        // family emoji is a single multi-codepoint cluster
        let family = "\u{1F468}\u{200D}\u{1F469}\u{200D}\u{1F466}";
        let s = format!("ab{family}cd");
        let t = truncate_to(&s, 3);
        assert_eq!(t, "ab");
        let t = truncate_to(&s, 4);
        assert_eq!(t, format!("ab{family}"));
    }

    #[test]
    fn truncate_treats_newlines_as_spaces() {
        assert_eq!(truncate_to("ab\ncd", 5), "ab cd");
        assert_eq!(truncate_to("ab\ncd", 3), "ab ");
    }

    #[test]
    fn pad_right_is_exact() {
        assert_eq!(pad_right("ab", 5), "ab   ");
        assert_eq!(pad_right("日本語", 5), "日本 ");
        assert_eq!(visible_length(&pad_right("日本語", 5)), 5);
    }

    #[test]
    fn wrap_preserves_words() {
        let lines = wrap_plain_text("the quick brown fox", 10);
        assert_eq!(lines, vec!["the quick", "brown fox"]);
    }

    #[test]
    fn wrap_blank_input_yields_one_empty_line() {
        assert_eq!(wrap_plain_text("", 10), vec![String::new()]);
        assert_eq!(wrap_plain_text("   ", 10), vec![String::new()]);
    }

    #[test]
    fn wrap_splits_overlong_tokens() {
        let lines = wrap_plain_text("abcdefghij", 4);
        assert_eq!(lines, vec!["abcd", "efgh", "ij"]);
        for line in &lines {
            assert!(visible_length(line) <= 4);
        }
    }

    #[test]
    fn wrap_cells_never_splits_wide_cluster() {
        let lines = wrap_cells("日本語", 3);
        assert_eq!(lines, vec!["日", "本", "語"]);
    }

    #[test]
    fn kitty_placeholder_counts_one_cell() {
        let s = format!("{}{}", KITTY_PLACEHOLDER, '\u{0305}');
        assert_eq!(visible_length(&s), 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn truncate_never_splits_clusters(s in "\\PC*", cols in 0usize..40) {
                let t = truncate_to(&s, cols);
                prop_assert!(visible_length(&t) <= cols);
                // Every output cluster must appear as a whole input cluster.
                let spaced = s.replace('\n', " ");
                let input: Vec<&str> =
                    unicode_segmentation::UnicodeSegmentation::graphemes(spaced.as_str(), true)
                        .collect();
                let output: Vec<&str> =
                    unicode_segmentation::UnicodeSegmentation::graphemes(t.as_str(), true)
                        .collect();
                prop_assert!(output.len() <= input.len());
            }

            #[test]
            fn wrap_respects_width_bound(s in "[a-zA-Z0-9 ]{0,200}", cols in 1usize..60) {
                for line in wrap_plain_text(&s, cols) {
                    prop_assert!(visible_length(&line) <= cols);
                }
            }
        }
    }
}
