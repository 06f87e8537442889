//! Blocking page decoders: pdfium for PDF pages, the `image` crate for
//! raster inputs, and the single-page-extraction fallback.
//!
//! Everything here is synchronous and CPU-bound; callers run it under
//! `tokio::task::spawn_blocking`. pdfium wraps thread-local C++ state and
//! must never run on a Tokio worker thread. Errors are plain strings: the
//! caller treats any failure as "try the next backend", so structured
//! variants would buy nothing.

use image::DynamicImage;
use lopdf::Document as LoDocument;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::debug;

/// Bind to a pdfium library: next to the executable first, then the system
/// search path.
pub(crate) fn bind_pdfium() -> Result<Pdfium, String> {
    Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map(Pdfium::new)
        .map_err(|e| format!("pdfium binding failed: {e:?}"))
}

/// Render one PDF page bounded to `max_w`×`max_h`, aspect preserved.
pub fn render_pdf_page(
    path: &Path,
    page_number: u32,
    max_w: u32,
    max_h: u32,
) -> Result<DynamicImage, String> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| format!("load failed: {e:?}"))?;

    let pages = document.pages();
    let total = pages.len() as u32;
    if page_number == 0 || page_number > total {
        return Err(format!("page {page_number} out of range (total {total})"));
    }

    let page = pages
        .get((page_number - 1) as u16)
        .map_err(|e| format!("page access failed: {e:?}"))?;

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_w as i32)
        .set_maximum_height(max_h as i32);

    let bitmap = page
        .render_with_config(&render_config)
        .map_err(|e| format!("rasterisation failed: {e:?}"))?;

    let image = bitmap.as_image();
    debug!(
        page = page_number,
        width = image.width(),
        height = image.height(),
        "pdfium rendered page"
    );
    Ok(image)
}

/// Decode a raster file, downscaling to fit within `max_w`×`max_h`.
pub fn decode_raster(path: &Path, max_w: u32, max_h: u32) -> Result<DynamicImage, String> {
    let image = image::open(path).map_err(|e| format!("decode failed: {e}"))?;
    Ok(bound_image(image, max_w, max_h))
}

/// Pull `page_number` into a temporary one-page PDF and render that.
///
/// pdfium sometimes rejects a damaged object graph that loads fine once the
/// other pages (and their broken references) are gone.
pub fn render_extracted_page(
    path: &Path,
    page_number: u32,
    max_w: u32,
    max_h: u32,
) -> Result<DynamicImage, String> {
    let mut document = LoDocument::load(path).map_err(|e| format!("lopdf load failed: {e}"))?;
    let total = document.get_pages().len() as u32;
    if page_number == 0 || page_number > total {
        return Err(format!("page {page_number} out of range (total {total})"));
    }

    let others: Vec<u32> = (1..=total).filter(|&p| p != page_number).collect();
    if !others.is_empty() {
        document.delete_pages(&others);
    }
    document.prune_objects();

    let dir = tempfile::tempdir().map_err(|e| format!("tempdir: {e}"))?;
    let mini_path = dir.path().join("extracted.pdf");
    document
        .save(&mini_path)
        .map_err(|e| format!("mini-document save failed: {e}"))?;

    debug!(page = page_number, "re-rendering via extracted mini-document");
    render_pdf_page(&mini_path, 1, max_w, max_h)
}

/// Downscale to fit the bounds; images already inside the bounds pass
/// through untouched.
pub(crate) fn bound_image(image: DynamicImage, max_w: u32, max_h: u32) -> DynamicImage {
    if image.width() <= max_w && image.height() <= max_h {
        return image;
    }
    image.resize(max_w, max_h, image::imageops::FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn bound_image_preserves_aspect() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(3200, 1000));
        let bounded = bound_image(img, 1600, 2400);
        assert_eq!((bounded.width(), bounded.height()), (1600, 500));
    }

    #[test]
    fn bound_image_is_noop_within_bounds() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(100, 200));
        let bounded = bound_image(img, 1600, 2400);
        assert_eq!((bounded.width(), bounded.height()), (100, 200));
    }

    #[test]
    fn bound_image_caps_height_too() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(1000, 4800));
        let bounded = bound_image(img, 1600, 2400);
        assert_eq!((bounded.width(), bounded.height()), (500, 2400));
    }

    #[test]
    fn decode_raster_reports_missing_file() {
        let err = decode_raster(Path::new("/nonexistent/x.png"), 100, 100).unwrap_err();
        assert!(err.contains("decode failed"));
    }
}
