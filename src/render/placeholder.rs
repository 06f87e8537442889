//! Placeholder page synthesis — the render path that cannot fail.
//!
//! When both real decoders give up on a page, the pipeline still needs an
//! image: the UI shows *something* and the batch keeps moving instead of
//! stalling on one broken page. The stand-in is a white page with a subtle
//! grid and the page number drawn large in block digits.

use image::{DynamicImage, Rgb, RgbImage};

/// Placeholder page size, roughly A4 at 150 DPI.
const PAGE_W: u32 = 1240;
const PAGE_H: u32 = 1754;
/// Grid pitch in pixels.
const GRID_STEP: u32 = 80;

const BACKGROUND: Rgb<u8> = Rgb([252, 252, 252]);
const GRID: Rgb<u8> = Rgb([232, 234, 238]);
const INK: Rgb<u8> = Rgb([148, 155, 164]);

/// 3×5 block glyphs for the digits 0–9, row-major, one bit per cell.
const DIGITS: [[u8; 15]; 10] = [
    [1, 1, 1, 1, 0, 1, 1, 0, 1, 1, 0, 1, 1, 1, 1], // 0
    [0, 1, 0, 1, 1, 0, 0, 1, 0, 0, 1, 0, 1, 1, 1], // 1
    [1, 1, 1, 0, 0, 1, 1, 1, 1, 1, 0, 0, 1, 1, 1], // 2
    [1, 1, 1, 0, 0, 1, 0, 1, 1, 0, 0, 1, 1, 1, 1], // 3
    [1, 0, 1, 1, 0, 1, 1, 1, 1, 0, 0, 1, 0, 0, 1], // 4
    [1, 1, 1, 1, 0, 0, 1, 1, 1, 0, 0, 1, 1, 1, 1], // 5
    [1, 1, 1, 1, 0, 0, 1, 1, 1, 1, 0, 1, 1, 1, 1], // 6
    [1, 1, 1, 0, 0, 1, 0, 1, 0, 0, 1, 0, 0, 1, 0], // 7
    [1, 1, 1, 1, 0, 1, 1, 1, 1, 1, 0, 1, 1, 1, 1], // 8
    [1, 1, 1, 1, 0, 1, 1, 1, 1, 0, 0, 1, 1, 1, 1], // 9
];

/// Cell size of one glyph bit when drawn.
const CELL: u32 = 28;
/// Horizontal gap between digits, in cells.
const DIGIT_GAP: u32 = 1;

/// Synthesize the placeholder image for a page.
pub fn synthesize(page_number: u32) -> DynamicImage {
    let mut img = RgbImage::from_pixel(PAGE_W, PAGE_H, BACKGROUND);

    for y in 0..PAGE_H {
        for x in 0..PAGE_W {
            if x % GRID_STEP == 0 || y % GRID_STEP == 0 {
                img.put_pixel(x, y, GRID);
            }
        }
    }

    draw_number(&mut img, page_number);
    DynamicImage::ImageRgb8(img)
}

/// Draw the page number centered on the page.
fn draw_number(img: &mut RgbImage, page_number: u32) {
    let digits: Vec<usize> = page_number
        .to_string()
        .bytes()
        .map(|b| (b - b'0') as usize)
        .collect();

    let glyph_w = 3 * CELL;
    let glyph_h = 5 * CELL;
    let total_w = digits.len() as u32 * glyph_w + (digits.len() as u32 - 1) * DIGIT_GAP * CELL;
    let origin_x = PAGE_W.saturating_sub(total_w) / 2;
    let origin_y = PAGE_H.saturating_sub(glyph_h) / 2;

    for (i, &digit) in digits.iter().enumerate() {
        let x0 = origin_x + i as u32 * (glyph_w + DIGIT_GAP * CELL);
        for row in 0..5u32 {
            for col in 0..3u32 {
                if DIGITS[digit][(row * 3 + col) as usize] == 1 {
                    fill_cell(img, x0 + col * CELL, origin_y + row * CELL);
                }
            }
        }
    }
}

fn fill_cell(img: &mut RgbImage, x0: u32, y0: u32) {
    for y in y0..(y0 + CELL).min(PAGE_H) {
        for x in x0..(x0 + CELL).min(PAGE_W) {
            img.put_pixel(x, y, INK);
        }
    }
}
