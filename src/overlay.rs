//! Overlay drawing for the AI feed.
//!
//! Captions use DejaVu Sans compiled into the binary unless a font file is
//! configured. See `assets/fonts/LICENSE-DejaVu.txt` for the font license.

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::detect::Detection;

const BUNDLED_FONT: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");

const PALETTE: [[u8; 3]; 20] = [
    [0xFF, 0x38, 0x38],
    [0xFF, 0x9D, 0x97],
    [0xFF, 0x70, 0x1F],
    [0xFF, 0xB2, 0x1D],
    [0xCF, 0xD2, 0x31],
    [0x48, 0xF9, 0x0A],
    [0x92, 0xCC, 0x17],
    [0x3D, 0xDB, 0x86],
    [0x1A, 0x93, 0x34],
    [0x00, 0xD4, 0xBB],
    [0x2C, 0x99, 0xA8],
    [0x00, 0xC2, 0xFF],
    [0x34, 0x45, 0x93],
    [0x64, 0x73, 0xFF],
    [0x00, 0x18, 0xEC],
    [0x84, 0x38, 0xFF],
    [0x52, 0x00, 0x85],
    [0xCB, 0x38, 0xFF],
    [0xFF, 0x95, 0xC8],
    [0xFF, 0x37, 0xC7],
];

pub const ERROR_TEXT: &str = "INFERENCE ERROR";

const BOX_THICKNESS: u32 = 2;
const BANNER_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
const BANNER_TEXT: Rgb<u8> = Rgb([0, 255, 0]);
const ERROR_BACKGROUND: Rgb<u8> = Rgb([200, 0, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

/// Colour for a class id. Stable across runs.
pub fn class_color(class_id: u32) -> Rgb<u8> {
    Rgb(PALETTE[class_id as usize % PALETTE.len()])
}

pub struct OverlayPainter {
    font: FontArc,
    label_scale: PxScale,
    banner_scale: PxScale,
}

impl OverlayPainter {
    /// Load the configured font, falling back to the bundled one when the
    /// path is unset or unreadable.
    pub fn load(font_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = font_path {
            match read_font(path) {
                Ok(font) => {
                    log::debug!("overlay font loaded from {}", path.display());
                    return Ok(Self::with_font(font));
                }
                Err(err) => log::warn!("{:#}; using bundled font", err),
            }
        }
        Self::bundled()
    }

    pub fn bundled() -> Result<Self> {
        let font = FontArc::try_from_slice(BUNDLED_FONT).context("parse bundled overlay font")?;
        Ok(Self::with_font(font))
    }

    fn with_font(font: FontArc) -> Self {
        Self {
            font,
            label_scale: PxScale::from(16.0),
            banner_scale: PxScale::from(22.0),
        }
    }

    pub fn draw_detections(&self, image: &mut RgbImage, detections: &[Detection]) {
        for detection in detections {
            self.draw_detection(image, detection);
        }
    }

    fn draw_detection(&self, image: &mut RgbImage, detection: &Detection) {
        let (x1, y1, x2, y2) = detection.bbox.clamped(image.width(), image.height());
        if x2 <= x1 || y2 <= y1 {
            return;
        }
        let color = class_color(detection.class_id);
        for inset in 0..BOX_THICKNESS {
            let w = (x2 - x1).saturating_sub(2 * inset);
            let h = (y2 - y1).saturating_sub(2 * inset);
            if w == 0 || h == 0 {
                break;
            }
            let rect = Rect::at((x1 + inset) as i32, (y1 + inset) as i32).of_size(w, h);
            draw_hollow_rect_mut(image, rect, color);
        }

        let font = &self.font;
        let caption = detection.caption();
        let (text_w, text_h) = text_size(self.label_scale, font, &caption);
        let pad = 3;
        let label_h = text_h + 2 * pad;
        let label_y = if y1 >= label_h { y1 - label_h } else { y1 };
        let rect = Rect::at(x1 as i32, label_y as i32).of_size(text_w + 2 * pad, label_h);
        draw_filled_rect_mut(image, rect, color);
        draw_text_mut(
            image,
            BLACK,
            (x1 + pad) as i32,
            (label_y + pad) as i32,
            self.label_scale,
            font,
            &caption,
        );
    }

    /// Stream name and FPS in the top-left corner.
    pub fn draw_banner(&self, image: &mut RgbImage, stream_name: &str, fps: f32) {
        let text = format!("{} | FPS: {:.1}", stream_name, fps);
        let (w, h) = self.text_box(&text);
        let rect = Rect::at(0, 0).of_size(
            w.min(image.width()).max(1),
            h.min(image.height()).max(1),
        );
        draw_filled_rect_mut(image, rect, BANNER_BACKGROUND);
        draw_text_mut(image, BANNER_TEXT, 6, 4, self.banner_scale, &self.font, &text);
    }

    /// Red error strip along the bottom edge.
    pub fn draw_error(&self, image: &mut RgbImage) {
        let (_, h) = self.text_box(ERROR_TEXT);
        let h = h.min(image.height()).max(1);
        let y = image.height() - h;
        let rect = Rect::at(0, y as i32).of_size(image.width().max(1), h);
        draw_filled_rect_mut(image, rect, ERROR_BACKGROUND);
        draw_text_mut(
            image,
            WHITE,
            6,
            y as i32 + 4,
            self.banner_scale,
            &self.font,
            ERROR_TEXT,
        );
    }

    fn text_box(&self, text: &str) -> (u32, u32) {
        let (w, h) = text_size(self.banner_scale, &self.font, text);
        (w + 12, h + 10)
    }
}

fn read_font(path: &Path) -> Result<FontArc> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read font {}", path.display()))?;
    FontArc::try_from_vec(bytes).with_context(|| format!("invalid font {}", path.display()))
}
