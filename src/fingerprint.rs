//! Cache fingerprints.
//!
//! A fingerprint deterministically identifies a cache entry by every input
//! that could change its payload. Fields are length-prefixed before hashing
//! so adjacent fields can never alias (`"ab" + "c"` hashes differently from
//! `"a" + "bc"`).

use sha2::{Digest, Sha256};

/// Bumped whenever rendering output would change for identical inputs
/// (resolution bounds, encoder, placeholder style). Participates in the OCR
/// fingerprint so stale renders never serve a newer pipeline.
pub const RENDERER_VERSION: u32 = 3;

fn feed(hasher: &mut Sha256, field: &[u8]) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field);
}

/// Content id for a source document: SHA-256 of the raw file bytes.
pub fn content_id(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Fingerprint of an OCR result.
pub fn ocr_fingerprint(
    document_content_id: &str,
    page_number: u32,
    model_id: &str,
    prompt_template_id: &str,
) -> String {
    let mut hasher = Sha256::new();
    feed(&mut hasher, b"ocr");
    feed(&mut hasher, document_content_id.as_bytes());
    feed(&mut hasher, &page_number.to_le_bytes());
    feed(&mut hasher, model_id.as_bytes());
    feed(&mut hasher, &RENDERER_VERSION.to_le_bytes());
    feed(&mut hasher, prompt_template_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint of an AI transformation result.
///
/// `context_mode` changes the key even when the prompt is identical, and
/// the adjacent texts only participate when context mode is on.
pub fn ai_fingerprint(
    source_text: &str,
    model_id: &str,
    user_prompt: &str,
    context_mode: bool,
    adjacent_texts: &[&str],
) -> String {
    let mut hasher = Sha256::new();
    feed(&mut hasher, b"ai");
    feed(&mut hasher, source_text.as_bytes());
    feed(&mut hasher, model_id.as_bytes());
    feed(&mut hasher, user_prompt.as_bytes());
    feed(&mut hasher, &[context_mode as u8]);
    if context_mode {
        feed(&mut hasher, &(adjacent_texts.len() as u64).to_le_bytes());
        for text in adjacent_texts {
            feed(&mut hasher, text.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ocr_fingerprint_is_deterministic() {
        let a = ocr_fingerprint("doc", 1, "model", "tpl");
        let b = ocr_fingerprint("doc", 1, "model", "tpl");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn ocr_fingerprint_distinguishes_every_input() {
        let base = ocr_fingerprint("doc", 1, "model", "tpl");
        assert_ne!(base, ocr_fingerprint("doc2", 1, "model", "tpl"));
        assert_ne!(base, ocr_fingerprint("doc", 2, "model", "tpl"));
        assert_ne!(base, ocr_fingerprint("doc", 1, "model2", "tpl"));
        assert_ne!(base, ocr_fingerprint("doc", 1, "model", "tpl2"));
    }

    #[test]
    fn field_boundaries_do_not_alias() {
        // Without length prefixes these two would collide.
        assert_ne!(
            ocr_fingerprint("ab", 1, "c", "tpl"),
            ocr_fingerprint("a", 1, "bc", "tpl"),
        );
    }

    #[test]
    fn context_mode_changes_ai_key() {
        let plain = ai_fingerprint("text", "m", "translate", false, &[]);
        let ctx = ai_fingerprint("text", "m", "translate", true, &[]);
        assert_ne!(plain, ctx);
    }

    #[test]
    fn adjacent_texts_only_count_in_context_mode() {
        let a = ai_fingerprint("text", "m", "p", false, &["prev"]);
        let b = ai_fingerprint("text", "m", "p", false, &[]);
        assert_eq!(a, b);

        let c = ai_fingerprint("text", "m", "p", true, &["prev"]);
        let d = ai_fingerprint("text", "m", "p", true, &["prev", "next"]);
        assert_ne!(c, d);
    }

    #[test]
    fn content_id_matches_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            content_id(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
