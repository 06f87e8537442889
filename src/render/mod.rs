//! Page rendering and native-text extraction.
//!
//! Each submodule implements exactly one concern:
//!
//! 1. [`raster`]      — decode a page to pixels: pdfium for PDFs (CPU-bound,
//!    runs under `spawn_blocking`), the `image` crate for raster inputs
//! 2. [`placeholder`] — synthesize a stand-in image when every decode path
//!    fails, so the UI always has something to show and the pipeline never
//!    stalls on a broken page
//! 3. [`native_text`] — walk a PDF page's content stream and collect the
//!    text-showing operators
//! 4. [`repair`]      — deterministic cleanup rules for extracted text
//!
//! ## Render strategy
//!
//! `render` tries three backends in order and records which one produced
//! the image:
//!
//! ```text
//! primary    pdfium on the full document, bounded 1600×2400
//! extracted  single page pulled into a temp mini-PDF, pdfium at 800×1000
//! placeholder  synthetic grid + page-number glyph (cannot fail)
//! ```
//!
//! The mini-PDF fallback exists because pdfium occasionally refuses a
//! damaged object graph that becomes loadable once unrelated pages are
//! dropped. The rendered JPEG is cached in the process temp directory keyed
//! by page number and backend; re-rendering an already-cached page is a
//! file read.

pub mod native_text;
pub mod placeholder;
pub mod raster;
pub mod repair;

use crate::document::{Document, DocumentDescriptor, DocumentKind};
use crate::error::EngineError;
use crate::fingerprint;
use image::DynamicImage;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Primary render bounds (width, height), aspect preserved.
const PRIMARY_BOUNDS: (u32, u32) = (1600, 2400);
/// Fallback render bounds for the extracted mini-document.
const FALLBACK_BOUNDS: (u32, u32) = (800, 1000);
/// JPEG quality for cached page images.
const JPEG_QUALITY: u8 = 85;

/// File extensions `load` accepts.
pub const SUPPORTED_FORMATS: &[&str] =
    &["pdf", "png", "jpg", "jpeg", "bmp", "gif", "tiff", "webp"];

/// Which backend produced a rendered page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderBackend {
    /// Direct decode of the source document.
    Primary,
    /// Single-page extraction re-decoded through pdfium.
    Extracted,
    /// Synthesized stand-in image.
    Placeholder,
    /// Previously rendered file served from the temp directory.
    Cached,
}

impl RenderBackend {
    fn tag(self) -> &'static str {
        match self {
            RenderBackend::Primary => "primary",
            RenderBackend::Extracted => "extracted",
            RenderBackend::Placeholder => "placeholder",
            RenderBackend::Cached => "cached",
        }
    }
}

/// A rendered page image plus the dimensions the engine records.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub image_path: PathBuf,
    pub backend: RenderBackend,
}

/// Renders pages and extracts native text. Stateless apart from the
/// process-wide temp directory holding cached page JPEGs.
pub struct Renderer {
    temp_dir: TempDir,
}

impl Renderer {
    pub fn new() -> Result<Self, EngineError> {
        let temp_dir = TempDir::with_prefix("pagesmith-render-").map_err(|e| EngineError::Io {
            path: std::env::temp_dir(),
            source: e,
        })?;
        Ok(Self { temp_dir })
    }

    /// Directory holding cached page images for this process.
    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Load a document: establish identity and page count without rendering
    /// any page.
    pub async fn load(&self, path: &Path) -> Result<Document, EngineError> {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase());
        let kind = match extension.as_deref() {
            Some("pdf") => DocumentKind::Pdf,
            Some(ext) if SUPPORTED_FORMATS.contains(&ext) => DocumentKind::Raster,
            _ => {
                return Err(EngineError::UnsupportedFormat {
                    path: path.to_path_buf(),
                    extension,
                })
            }
        };

        if !path.exists() {
            return Err(EngineError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let path_buf = path.to_path_buf();
        tokio::task::spawn_blocking(move || load_blocking(path_buf, kind))
            .await
            .map_err(|e| EngineError::Internal(format!("load task panicked: {e}")))?
    }

    /// Render one page as a JPEG, trying each backend in order.
    ///
    /// Idempotent: when `existing` names a file that is still on disk, its
    /// bytes are returned unchanged.
    pub async fn render(
        &self,
        doc: &DocumentDescriptor,
        page_number: u32,
        existing: Option<&Path>,
    ) -> Result<RenderedPage, EngineError> {
        if let Some(path) = existing {
            if path.exists() {
                if let Some(cached) = read_cached(path) {
                    debug!(page = page_number, "serving cached page image");
                    return Ok(cached);
                }
            }
        }

        let path = doc.path.clone();
        let kind = doc.kind;
        let image = tokio::task::spawn_blocking(move || {
            decode_with_fallbacks(&path, kind, page_number)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("render task panicked: {e}")))?;

        let (image, backend) = image;
        let width = image.width();
        let height = image.height();
        let bytes = encode_jpeg(&image)?;
        let image_path = self
            .temp_dir
            .path()
            .join(format!("page_{page_number}_{}.jpg", backend.tag()));
        std::fs::write(&image_path, &bytes).map_err(|e| EngineError::Io {
            path: image_path.clone(),
            source: e,
        })?;

        debug!(
            page = page_number,
            backend = backend.tag(),
            width,
            height,
            "rendered page"
        );

        Ok(RenderedPage {
            bytes,
            width,
            height,
            image_path,
            backend,
        })
    }

    /// Extract the embedded text of one page.
    ///
    /// Side-effect-free on the document model: the caller decides whether
    /// to persist the result. Rasters have no text layer and return
    /// `("", false)`.
    pub async fn extract_native_text(
        &self,
        doc: &DocumentDescriptor,
        page_number: u32,
    ) -> Result<(String, bool), EngineError> {
        if doc.kind != DocumentKind::Pdf {
            return Ok((String::new(), false));
        }

        let path = doc.path.clone();
        let text = tokio::task::spawn_blocking(move || -> Result<String, EngineError> {
            let document = lopdf::Document::load(&path).map_err(|e| EngineError::DecodeError {
                path: path.clone(),
                detail: e.to_string(),
            })?;
            Ok(native_text::extract_page_text(&document, page_number))
        })
        .await
        .map_err(|e| EngineError::Internal(format!("extract task panicked: {e}")))??;

        let repaired = repair::repair_text(&text);
        let has_text = !repaired.trim().is_empty();
        Ok((repaired, has_text))
    }
}

/// Blocking half of `load`.
fn load_blocking(path: PathBuf, kind: DocumentKind) -> Result<Document, EngineError> {
    let bytes = std::fs::read(&path).map_err(|e| EngineError::Io {
        path: path.clone(),
        source: e,
    })?;
    let content_id = fingerprint::content_id(&bytes);

    let page_count = match kind {
        DocumentKind::Pdf => {
            let document =
                lopdf::Document::load_mem(&bytes).map_err(|e| EngineError::DecodeError {
                    path: path.clone(),
                    detail: e.to_string(),
                })?;
            let count = document.get_pages().len() as u32;
            if count == 0 {
                return Err(EngineError::DecodeError {
                    path,
                    detail: "PDF contains no pages".into(),
                });
            }
            count
        }
        DocumentKind::Raster => {
            // Confirm the pixels actually decode before claiming the page.
            image::load_from_memory(&bytes).map_err(|e| EngineError::DecodeError {
                path: path.clone(),
                detail: e.to_string(),
            })?;
            1
        }
    };

    Ok(Document::new(path, kind, content_id, page_count))
}

/// Run the three-stage decode chain for one page.
fn decode_with_fallbacks(
    path: &Path,
    kind: DocumentKind,
    page_number: u32,
) -> (DynamicImage, RenderBackend) {
    let (max_w, max_h) = PRIMARY_BOUNDS;
    let primary = match kind {
        DocumentKind::Pdf => raster::render_pdf_page(path, page_number, max_w, max_h),
        DocumentKind::Raster => raster::decode_raster(path, max_w, max_h),
    };
    match primary {
        Ok(image) => return (image, RenderBackend::Primary),
        Err(detail) => {
            warn!(page = page_number, %detail, "primary render failed");
        }
    }

    if kind == DocumentKind::Pdf {
        let (fb_w, fb_h) = FALLBACK_BOUNDS;
        match raster::render_extracted_page(path, page_number, fb_w, fb_h) {
            Ok(image) => return (image, RenderBackend::Extracted),
            Err(detail) => {
                warn!(page = page_number, %detail, "extracted-page render failed");
            }
        }
    }

    (placeholder::synthesize(page_number), RenderBackend::Placeholder)
}

/// Serve a previously rendered JPEG from disk, if it still reads back.
fn read_cached(path: &Path) -> Option<RenderedPage> {
    let bytes = std::fs::read(path).ok()?;
    let (width, height) = image::load_from_memory(&bytes)
        .map(|img| (img.width(), img.height()))
        .ok()?;
    Some(RenderedPage {
        bytes,
        width,
        height,
        image_path: path.to_path_buf(),
        backend: RenderBackend::Cached,
    })
}

/// Encode an image as JPEG at the cache quality.
fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>, EngineError> {
    let mut buf = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(Cursor::new(&mut buf), JPEG_QUALITY);
    encoder
        .encode_image(&image.to_rgb8())
        .map_err(|e| EngineError::Internal(format!("jpeg encode: {e}")))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
        let path = dir.join(name);
        let img = image::RgbImage::from_pixel(w, h, image::Rgb([200, 200, 200]));
        img.save(&path).unwrap();
        path
    }

    #[tokio::test]
    async fn load_rejects_unknown_extension() {
        let renderer = Renderer::new().unwrap();
        let err = renderer.load(Path::new("/tmp/data.xyz")).await.unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedFormat { .. }));
    }

    #[tokio::test]
    async fn load_raster_is_single_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "scan.png", 32, 48);
        let renderer = Renderer::new().unwrap();
        let doc = renderer.load(&path).await.unwrap();
        assert_eq!(doc.page_count, 1);
        assert_eq!(doc.kind, DocumentKind::Raster);
        assert_eq!(doc.title, "scan");
        assert_eq!(doc.content_id.len(), 64);
    }

    #[tokio::test]
    async fn load_rejects_malformed_raster() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.png");
        std::fs::write(&path, b"not a png at all").unwrap();
        let renderer = Renderer::new().unwrap();
        assert!(matches!(
            renderer.load(&path).await.unwrap_err(),
            EngineError::DecodeError { .. }
        ));
    }

    #[tokio::test]
    async fn render_raster_records_dimensions_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "page.png", 64, 80);
        let renderer = Renderer::new().unwrap();
        let doc = renderer.load(&path).await.unwrap();
        let desc = DocumentDescriptor {
            path: doc.path.clone(),
            kind: doc.kind,
            content_id: doc.content_id.clone(),
            page_count: doc.page_count,
        };

        let rendered = renderer.render(&desc, 1, None).await.unwrap();
        assert_eq!(rendered.backend, RenderBackend::Primary);
        assert_eq!((rendered.width, rendered.height), (64, 80));
        assert!(rendered.image_path.exists());

        // Second call with the recorded path is served from disk.
        let again = renderer
            .render(&desc, 1, Some(&rendered.image_path))
            .await
            .unwrap();
        assert_eq!(again.backend, RenderBackend::Cached);
        assert_eq!(again.bytes, rendered.bytes);
    }

    #[tokio::test]
    async fn oversized_raster_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "big.png", 3200, 1000);
        let renderer = Renderer::new().unwrap();
        let doc = renderer.load(&path).await.unwrap();
        let desc = DocumentDescriptor {
            path: doc.path,
            kind: doc.kind,
            content_id: doc.content_id,
            page_count: 1,
        };
        let rendered = renderer.render(&desc, 1, None).await.unwrap();
        assert!(rendered.width <= PRIMARY_BOUNDS.0);
        assert!(rendered.height <= PRIMARY_BOUNDS.1);
        // Aspect preserved: 3200×1000 → 1600×500.
        assert_eq!((rendered.width, rendered.height), (1600, 500));
    }

    #[tokio::test]
    async fn native_text_for_raster_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "scan.png", 16, 16);
        let renderer = Renderer::new().unwrap();
        let doc = renderer.load(&path).await.unwrap();
        let desc = DocumentDescriptor {
            path: doc.path,
            kind: doc.kind,
            content_id: doc.content_id,
            page_count: 1,
        };
        let (text, has_text) = renderer.extract_native_text(&desc, 1).await.unwrap();
        assert_eq!(text, "");
        assert!(!has_text);
    }
}
