//! Model instruction templates.
//!
//! Centralising every prompt here keeps behaviour changes in one place and
//! lets unit tests inspect prompts without a live model. The template ids
//! participate in cache fingerprints, so editing a template's *content*
//! must come with an id bump or cached results would be served for the old
//! wording.

/// Identifier of the OCR instruction template; part of the OCR fingerprint.
pub const OCR_PROMPT_TEMPLATE_ID: &str = "ocr-v2";

/// System instruction for page recognition.
pub const OCR_SYSTEM_PROMPT: &str = r#"You are a precise OCR engine. Transcribe the text in the page image exactly.

Rules:
1. Output every piece of text visible on the page, in natural reading order.
2. Preserve paragraph breaks; merge lines that belong to the same paragraph.
3. Keep numbers, punctuation, and capitalisation exactly as printed.
4. For tables, output one row per line with cells separated by " | ".
5. Do NOT describe images, layout, or decorations.
6. Do NOT add commentary, headers, or page markers.
7. Output plain text only."#;

/// Extra instruction block appended when embedded text is available as a
/// recognition hint.
pub fn ocr_native_text_hint(native_text: &str) -> String {
    format!(
        "The document's embedded text layer for this page is provided below. \
It may be incomplete or out of order; trust the image where they differ.\n\
\"\"\"\n{native_text}\n\"\"\""
    )
}

/// System instruction for user-directed text transformation.
pub const TRANSFORM_SYSTEM_PROMPT: &str = r#"You are a careful text-processing assistant working on one page of a larger document.

Rules:
1. Apply the user's instruction to the source text faithfully.
2. Never invent content that is not supported by the source.
3. Preserve the source's paragraph structure unless the instruction says otherwise.
4. Output only the processed text, with no commentary."#;

/// Build the context block carrying adjacent pages' text, in reading order.
pub fn adjacent_context_block(previous: Option<&str>, next: Option<&str>) -> String {
    let mut block = String::from(
        "Adjacent pages are provided for context only; do not include them in the output.\n",
    );
    if let Some(prev) = previous {
        block.push_str(&format!("\n[previous page]\n\"\"\"\n{prev}\n\"\"\"\n"));
    }
    if let Some(next) = next {
        block.push_str(&format!("\n[next page]\n\"\"\"\n{next}\n\"\"\"\n"));
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ocr_prompt_forbids_commentary() {
        assert!(OCR_SYSTEM_PROMPT.contains("Do NOT add commentary"));
    }

    #[test]
    fn context_block_orders_previous_before_next() {
        let block = adjacent_context_block(Some("one"), Some("two"));
        let prev = block.find("[previous page]").unwrap();
        let next = block.find("[next page]").unwrap();
        assert!(prev < next);
        assert!(block.contains("one"));
        assert!(block.contains("two"));
    }

    #[test]
    fn context_block_handles_missing_neighbors() {
        let block = adjacent_context_block(None, Some("two"));
        assert!(!block.contains("[previous page]"));
        assert!(block.contains("[next page]"));
    }
}
