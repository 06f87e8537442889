//! Text repair: deterministic cleanup of extracted native text.
//!
//! Content-stream extraction preserves what the PDF generator emitted, and
//! generators emit ugly things: words split by justification hyphens,
//! whitespace runs from kerning gaps, spaces drifting onto the wrong side
//! of punctuation. This module applies cheap, ordered, individually
//! testable rules that fix those artefacts without touching content.
//!
//! ## Rule order
//!
//! Rules must run in this order: line endings are normalised before
//! hyphen rejoining (which matches across `\n`), hyphens are rejoined
//! before whitespace collapsing destroys the line structure, and sentence
//! capitalisation runs last so it sees final spacing.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all repair rules to raw extracted text.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF → LF)
/// 2. Rejoin words hyphenated across line breaks
/// 3. Collapse whitespace runs to a single space, keeping paragraph breaks
/// 4. Fix spacing around punctuation
/// 5. Uppercase the first letter of each sentence
pub fn repair_text(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = rejoin_hyphenated(&s);
    let s = collapse_whitespace(&s);
    let s = fix_punctuation_spacing(&s);
    capitalise_sentences(&s)
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Rejoin hyphenated line breaks ────────────────────────────────────

static RE_HYPHEN_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\p{L})-[ \t]*\n[ \t]*(\p{L})").unwrap());

/// `exam-\nple` was one word before justification split it; restore it.
fn rejoin_hyphenated(input: &str) -> String {
    RE_HYPHEN_BREAK.replace_all(input, "$1$2").to_string()
}

// ── Rule 3: Collapse whitespace, keep paragraph breaks ───────────────────────

static RE_PARAGRAPH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t]*\n").unwrap());
static RE_SPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

fn collapse_whitespace(input: &str) -> String {
    RE_PARAGRAPH
        .split(input)
        .map(|paragraph| RE_SPACE_RUN.replace_all(paragraph.trim(), " ").into_owned())
        .filter(|paragraph| !paragraph.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ── Rule 4: Fix spacing around punctuation ───────────────────────────────────

static RE_SPACE_BEFORE_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r" +([,.!?;:])").unwrap());
static RE_MISSING_SPACE_AFTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"([,;!?])(\p{L})").unwrap());
static RE_MISSING_SPACE_SENTENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\p{Ll})\.(\p{Lu})").unwrap());

fn fix_punctuation_spacing(input: &str) -> String {
    let s = RE_SPACE_BEFORE_PUNCT.replace_all(input, "$1");
    let s = RE_MISSING_SPACE_AFTER.replace_all(&s, "$1 $2");
    // Periods only split lowercase→uppercase boundaries, so decimals
    // ("3.14") and abbreviations ("U.S.") survive.
    RE_MISSING_SPACE_SENTENCE
        .replace_all(&s, "$1. $2")
        .to_string()
}

// ── Rule 5: Capitalise sentence starts ───────────────────────────────────────

fn capitalise_sentences(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut at_sentence_start = true;
    for ch in input.chars() {
        if at_sentence_start && ch.is_alphabetic() {
            out.extend(ch.to_uppercase());
            at_sentence_start = false;
        } else {
            match ch {
                '.' | '!' | '?' => at_sentence_start = true,
                '\n' => {} // paragraph breaks keep the pending state
                c if c.is_whitespace() => {}
                _ => at_sentence_start = false,
            }
            out.push(ch);
        }
    }
    out
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_endings() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn test_rejoin_hyphenated() {
        assert_eq!(rejoin_hyphenated("exam-\nple"), "example");
        assert_eq!(rejoin_hyphenated("exam- \n  ple"), "example");
        // A hyphen inside a line is not a break artefact.
        assert_eq!(rejoin_hyphenated("well-known"), "well-known");
        // A trailing hyphen before a digit is left alone.
        assert_eq!(rejoin_hyphenated("page-\n1"), "page-\n1");
    }

    #[test]
    fn test_collapse_whitespace_keeps_paragraphs() {
        let input = "one   two\tthree\nfour\n\nnext  paragraph";
        assert_eq!(
            collapse_whitespace(input),
            "one two three four\n\nnext paragraph"
        );
    }

    #[test]
    fn test_collapse_drops_empty_paragraphs() {
        assert_eq!(collapse_whitespace("a\n\n  \n\nb"), "a\n\nb");
    }

    #[test]
    fn test_space_before_punctuation_removed() {
        assert_eq!(fix_punctuation_spacing("word , next ."), "word, next.");
    }

    #[test]
    fn test_space_added_after_comma() {
        assert_eq!(fix_punctuation_spacing("one,two"), "one, two");
    }

    #[test]
    fn test_decimal_numbers_untouched() {
        assert_eq!(fix_punctuation_spacing("pi is 3.14"), "pi is 3.14");
        assert_eq!(fix_punctuation_spacing("3,14"), "3,14");
    }

    #[test]
    fn test_abbreviations_untouched() {
        assert_eq!(fix_punctuation_spacing("the U.S. budget"), "the U.S. budget");
    }

    #[test]
    fn test_sentence_boundary_space_inserted() {
        assert_eq!(fix_punctuation_spacing("done.Next"), "done. Next");
    }

    #[test]
    fn test_capitalise_sentences() {
        assert_eq!(
            capitalise_sentences("first part. second part! third"),
            "First part. Second part! Third"
        );
    }

    #[test]
    fn test_capitalise_across_paragraphs() {
        assert_eq!(capitalise_sentences("end.\n\nnew start"), "End.\n\nNew start");
    }

    #[test]
    fn full_pipeline_no_double_spaces_or_hanging_punctuation() {
        let input = "the quick   brown\nfox , jumps over the la-\nzy dog .and runs";
        let result = repair_text(input);
        assert!(!result.contains("  "), "no double spaces: {result:?}");
        for p in [",", ".", "!", "?", ";", ":"] {
            assert!(
                !result.contains(&format!(" {p}")),
                "no space before {p}: {result:?}"
            );
        }
        assert!(result.contains("lazy"), "hyphenation repaired: {result:?}");
        assert!(result.starts_with("The"), "sentence capitalised: {result:?}");
    }

    #[test]
    fn full_pipeline_preserves_paragraph_breaks() {
        let result = repair_text("para one line one\nline two\n\npara two");
        assert_eq!(result, "Para one line one line two\n\nPara two");
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(repair_text(""), "");
        assert_eq!(repair_text("   \n \n  "), "");
    }
}
