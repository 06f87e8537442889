//! Native-text extraction from PDF content streams.
//!
//! Walks a page's decoded content stream and collects the operands of the
//! text-showing operators: `Tj` (show string), `'` and `"` (next-line show
//! variants), and `TJ` (array show with kerning). Hexadecimal string
//! operands are handled the same as literal ones. Unknown operators are
//! skipped — a content stream full of drawing operators must never make
//! extraction fail.
//!
//! Inside a `TJ` array, numeric elements adjust horizontal position in
//! thousandths of a text-space unit. Large negative adjustments are how
//! most generators encode inter-word gaps, so any element below
//! `-KERN_SPACE_THRESHOLD` becomes a space.
//!
//! The raw result is structural, not readable — callers run it through
//! [`super::repair::repair_text`] before storing it.

use lopdf::content::Content;
use lopdf::{Document, Object};
use tracing::{debug, warn};

/// A `TJ` kerning adjustment below this (thousandths of text space) reads
/// as an implicit word gap.
const KERN_SPACE_THRESHOLD: f64 = 100.0;

/// Extract the raw text of one page (1-indexed). Returns an empty string
/// for pages without text operators or with undecodable streams.
pub fn extract_page_text(document: &Document, page_number: u32) -> String {
    let pages = document.get_pages();
    let Some(&page_id) = pages.get(&page_number) else {
        warn!(page = page_number, "page not present in page tree");
        return String::new();
    };

    let content_data = match document.get_page_content(page_id) {
        Ok(data) => data,
        Err(e) => {
            warn!(page = page_number, error = %e, "content stream unreadable");
            return String::new();
        }
    };

    let content = match Content::decode(&content_data) {
        Ok(content) => content,
        Err(e) => {
            warn!(page = page_number, error = %e, "content stream undecodable");
            return String::new();
        }
    };

    let mut out = String::new();
    for operation in &content.operations {
        match operation.operator.as_str() {
            "Tj" | "'" | "\"" => {
                for operand in &operation.operands {
                    if let Object::String(bytes, _) = operand {
                        out.push_str(&decode_text_bytes(bytes));
                    }
                }
                out.push(' ');
            }
            "TJ" => {
                for operand in &operation.operands {
                    if let Object::Array(elements) = operand {
                        for element in elements {
                            match element {
                                Object::String(bytes, _) => {
                                    out.push_str(&decode_text_bytes(bytes));
                                }
                                other => {
                                    if let Some(adjust) = as_number(other) {
                                        if adjust < -KERN_SPACE_THRESHOLD {
                                            out.push(' ');
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
                out.push(' ');
            }
            // Text-position operators start a new line of output so the
            // repair pass can tell line breaks from word gaps.
            "Td" | "TD" | "T*" => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            "ET" => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }

    debug!(page = page_number, chars = out.len(), "extracted native text");
    out
}

fn as_number(object: &Object) -> Option<f64> {
    match object {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

/// Decode a PDF string operand to UTF-8.
///
/// Strings with a UTF-16BE byte-order mark are decoded as UTF-16; anything
/// else is treated as a byte string (PDFDocEncoding is close enough to
/// Latin-1 for the text-show operands this extractor collects).
fn decode_text_bytes(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes.iter().map(|&b| b as char).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::Operation;
    use lopdf::StringFormat;

    fn text_op(operator: &str, text: &str) -> Operation {
        Operation::new(
            operator,
            vec![Object::String(
                text.as_bytes().to_vec(),
                StringFormat::Literal,
            )],
        )
    }

    /// Build a one-page document whose content stream is the given operations.
    fn document_with(operations: Vec<Operation>) -> Document {
        use lopdf::{dictionary, Stream};
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().unwrap(),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc
    }

    #[test]
    fn collects_tj_and_quote_operands() {
        let doc = document_with(vec![
            text_op("Tj", "Hello"),
            text_op("'", "world"),
        ]);
        let text = extract_page_text(&doc, 1);
        assert!(text.contains("Hello"));
        assert!(text.contains("world"));
    }

    #[test]
    fn array_show_kerning_becomes_space() {
        let doc = document_with(vec![Operation::new(
            "TJ",
            vec![Object::Array(vec![
                Object::String(b"Hel".to_vec(), StringFormat::Literal),
                Object::Integer(-20), // small kern: intra-word, no space
                Object::String(b"lo".to_vec(), StringFormat::Literal),
                Object::Integer(-250), // large kern: word gap
                Object::String(b"world".to_vec(), StringFormat::Literal),
            ])],
        )]);
        let text = extract_page_text(&doc, 1);
        assert!(text.contains("Hello world"), "got: {text:?}");
    }

    #[test]
    fn hex_strings_are_collected() {
        let doc = document_with(vec![Operation::new(
            "Tj",
            vec![Object::String(b"Data".to_vec(), StringFormat::Hexadecimal)],
        )]);
        assert!(extract_page_text(&doc, 1).contains("Data"));
    }

    #[test]
    fn unknown_operators_are_skipped() {
        let doc = document_with(vec![
            Operation::new("q", vec![]),
            Operation::new("BDC", vec![]),
            text_op("Tj", "kept"),
            Operation::new("Do", vec![Object::Name(b"Im1".to_vec())]),
        ]);
        let text = extract_page_text(&doc, 1);
        assert!(text.contains("kept"));
    }

    #[test]
    fn line_moves_insert_newlines() {
        let doc = document_with(vec![
            text_op("Tj", "first"),
            Operation::new("Td", vec![Object::Integer(0), Object::Integer(-14)]),
            text_op("Tj", "second"),
        ]);
        let text = extract_page_text(&doc, 1);
        let first = text.find("first").unwrap();
        let newline = text[first..].find('\n').unwrap();
        let second = text.find("second").unwrap();
        assert!(first + newline < second);
    }

    #[test]
    fn utf16be_strings_decode() {
        let mut bytes = vec![0xFE, 0xFF];
        for unit in "Résumé".encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        let doc = document_with(vec![Operation::new(
            "Tj",
            vec![Object::String(bytes, StringFormat::Literal)],
        )]);
        assert!(extract_page_text(&doc, 1).contains("Résumé"));
    }

    #[test]
    fn missing_page_yields_empty() {
        let doc = document_with(vec![text_op("Tj", "x")]);
        assert_eq!(extract_page_text(&doc, 9), "");
    }
}
