//! The in-memory document model and its session guard.
//!
//! One [`Document`] is loaded at a time and owned by the process-wide
//! [`DocumentSession`]. Readers (UI refresh, snapshot queries) and the
//! engine's workers share it through a read-write lock; writers hold the
//! write lock only for the duration of a single field update, never across
//! a suspension point. Workers re-resolve pages by number on every access
//! so a document swap mid-batch cannot leave them holding stale state.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Source container format of a loaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    /// Multi-page PDF; pages render through pdfium.
    Pdf,
    /// Single-page raster image (png/jpeg/…).
    Raster,
}

/// Which user-visible text slot an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextKind {
    Ocr,
    Ai,
}

/// One page of the loaded document.
///
/// `width`/`height` stay zero until the first render decodes the page.
/// `processed` flips to true the first time `ocr_text` is written.
/// Invariant maintained by [`Page::set_native_text`]:
/// `has_native_text ⇔ !native_text.trim().is_empty()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub number: u32,
    pub width: u32,
    pub height: u32,
    pub native_text: String,
    pub has_native_text: bool,
    pub ocr_text: String,
    pub ai_text: String,
    pub image_path: Option<PathBuf>,
    pub processed: bool,
}

impl Page {
    fn new(number: u32) -> Self {
        Self {
            number,
            width: 0,
            height: 0,
            native_text: String::new(),
            has_native_text: false,
            ocr_text: String::new(),
            ai_text: String::new(),
            image_path: None,
            processed: false,
        }
    }

    /// Store native text, keeping the `has_native_text` invariant.
    pub fn set_native_text(&mut self, text: String) {
        self.has_native_text = !text.trim().is_empty();
        self.native_text = text;
    }

    /// The text an AI transformation should start from: OCR output when
    /// present, otherwise the embedded native text.
    pub fn source_text(&self) -> &str {
        if !self.ocr_text.trim().is_empty() {
            &self.ocr_text
        } else {
            &self.native_text
        }
    }
}

/// The loaded document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub path: PathBuf,
    pub title: String,
    pub kind: DocumentKind,
    /// SHA-256 of the file bytes; participates in OCR cache fingerprints.
    pub content_id: String,
    pub page_count: u32,
    pub pages: Vec<Page>,
}

impl Document {
    pub fn new(
        path: PathBuf,
        kind: DocumentKind,
        content_id: String,
        page_count: u32,
    ) -> Self {
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let pages = (1..=page_count).map(Page::new).collect();
        Self {
            path,
            title,
            kind,
            content_id,
            page_count,
            pages,
        }
    }

    pub fn page(&self, number: u32) -> Option<&Page> {
        if number == 0 {
            return None;
        }
        self.pages.get(number as usize - 1)
    }

    fn page_mut(&mut self, number: u32) -> Option<&mut Page> {
        if number == 0 {
            return None;
        }
        self.pages.get_mut(number as usize - 1)
    }
}

/// Serializable snapshot handed across the facade boundary.
pub type DocumentSnapshot = Document;

/// Thread-safe holder of the single loaded document.
pub struct DocumentSession {
    document: RwLock<Option<Document>>,
}

impl DocumentSession {
    pub fn new() -> Self {
        Self {
            document: RwLock::new(None),
        }
    }

    /// Replace the loaded document. The previous document (and every page
    /// reference into it) is dropped.
    pub async fn replace(&self, document: Document) {
        *self.document.write().await = Some(document);
    }

    pub async fn is_loaded(&self) -> bool {
        self.document.read().await.is_some()
    }

    /// Full snapshot for the shell. Clones the document; cheap relative to
    /// the model calls this system exists to make.
    pub async fn snapshot(&self) -> Result<DocumentSnapshot, EngineError> {
        self.document
            .read()
            .await
            .clone()
            .ok_or(EngineError::DocumentNotLoaded)
    }

    /// Read a single page by number.
    pub async fn page(&self, number: u32) -> Result<Page, EngineError> {
        let guard = self.document.read().await;
        let doc = guard.as_ref().ok_or(EngineError::DocumentNotLoaded)?;
        doc.page(number)
            .cloned()
            .ok_or(EngineError::PageOutOfRange {
                page: number,
                total: doc.page_count,
            })
    }

    /// Document identity needed to build fingerprints and render requests,
    /// without cloning pages.
    pub async fn descriptor(&self) -> Result<DocumentDescriptor, EngineError> {
        let guard = self.document.read().await;
        let doc = guard.as_ref().ok_or(EngineError::DocumentNotLoaded)?;
        Ok(DocumentDescriptor {
            path: doc.path.clone(),
            kind: doc.kind,
            content_id: doc.content_id.clone(),
            page_count: doc.page_count,
        })
    }

    /// Validate that every page number exists in the loaded document.
    pub async fn validate_pages(&self, pages: &[u32]) -> Result<(), EngineError> {
        let guard = self.document.read().await;
        let doc = guard.as_ref().ok_or(EngineError::DocumentNotLoaded)?;
        for &page in pages {
            if page == 0 || page > doc.page_count {
                return Err(EngineError::PageOutOfRange {
                    page,
                    total: doc.page_count,
                });
            }
        }
        Ok(())
    }

    /// Apply a mutation to one page under the write lock.
    pub async fn update_page<F>(&self, number: u32, apply: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut Page),
    {
        let mut guard = self.document.write().await;
        let doc = guard.as_mut().ok_or(EngineError::DocumentNotLoaded)?;
        let total = doc.page_count;
        let page = doc
            .page_mut(number)
            .ok_or(EngineError::PageOutOfRange { page: number, total })?;
        apply(page);
        Ok(())
    }

    /// Record the dimensions and cached image path produced by a render.
    pub async fn record_render(
        &self,
        number: u32,
        width: u32,
        height: u32,
        image_path: &Path,
    ) -> Result<(), EngineError> {
        self.update_page(number, |page| {
            page.width = width;
            page.height = height;
            page.image_path = Some(image_path.to_path_buf());
        })
        .await
    }

    /// Store OCR output and mark the page processed.
    pub async fn record_ocr_text(&self, number: u32, text: &str) -> Result<(), EngineError> {
        self.update_page(number, |page| {
            page.ocr_text = text.to_string();
            page.processed = true;
        })
        .await
    }

    /// Store AI transformation output.
    pub async fn record_ai_text(&self, number: u32, text: &str) -> Result<(), EngineError> {
        self.update_page(number, |page| {
            page.ai_text = text.to_string();
        })
        .await
    }

    /// Store native text extracted from the source container.
    pub async fn record_native_text(&self, number: u32, text: String) -> Result<(), EngineError> {
        self.update_page(number, |page| page.set_native_text(text)).await
    }
}

impl Default for DocumentSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of the loaded document, detached from its pages.
#[derive(Debug, Clone)]
pub struct DocumentDescriptor {
    pub path: PathBuf,
    pub kind: DocumentKind,
    pub content_id: String,
    pub page_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(pages: u32) -> Document {
        Document::new(PathBuf::from("/tmp/report.pdf"), DocumentKind::Pdf, "cid".into(), pages)
    }

    #[test]
    fn title_comes_from_file_stem() {
        assert_eq!(doc(2).title, "report");
    }

    #[test]
    fn native_text_invariant() {
        let mut page = Page::new(1);
        page.set_native_text("  \n\t ".into());
        assert!(!page.has_native_text);
        page.set_native_text("hello".into());
        assert!(page.has_native_text);
    }

    #[test]
    fn source_text_prefers_ocr() {
        let mut page = Page::new(1);
        page.set_native_text("native".into());
        assert_eq!(page.source_text(), "native");
        page.ocr_text = "recognized".into();
        assert_eq!(page.source_text(), "recognized");
    }

    #[tokio::test]
    async fn snapshot_requires_loaded_document() {
        let session = DocumentSession::new();
        assert!(matches!(
            session.snapshot().await,
            Err(EngineError::DocumentNotLoaded)
        ));
        session.replace(doc(1)).await;
        assert_eq!(session.snapshot().await.unwrap().page_count, 1);
    }

    #[tokio::test]
    async fn page_numbers_are_one_indexed() {
        let session = DocumentSession::new();
        session.replace(doc(3)).await;
        assert!(session.page(0).await.is_err());
        assert_eq!(session.page(3).await.unwrap().number, 3);
        assert!(matches!(
            session.page(4).await,
            Err(EngineError::PageOutOfRange { page: 4, total: 3 })
        ));
    }

    #[tokio::test]
    async fn record_ocr_marks_processed() {
        let session = DocumentSession::new();
        session.replace(doc(2)).await;
        session.record_ocr_text(2, "text").await.unwrap();
        let page = session.page(2).await.unwrap();
        assert!(page.processed);
        assert_eq!(page.ocr_text, "text");
        assert!(!session.page(1).await.unwrap().processed);
    }

    #[tokio::test]
    async fn validate_pages_rejects_out_of_range() {
        let session = DocumentSession::new();
        session.replace(doc(2)).await;
        assert!(session.validate_pages(&[1, 2]).await.is_ok());
        assert!(session.validate_pages(&[1, 3]).await.is_err());
        assert!(session.validate_pages(&[0]).await.is_err());
    }
}
