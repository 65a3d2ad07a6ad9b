//! Frame annotation
//!
//! Bounding boxes and labels for each detection plus the running count
//! banner. Text uses a built-in 5x7 bitmap font so no font asset is needed.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::counts::CountSnapshot;
use crate::detector::{BBox, Detection};

const BOX_THICKNESS: u32 = 2;
const TEXT_SCALE: u32 = 2;
const LABEL_PAD: u32 = 3;
const BANNER_PAD: u32 = 6;

const LABEL_TEXT: Rgb<u8> = Rgb([16, 16, 16]);
const BANNER_BG: Rgb<u8> = Rgb([24, 24, 24]);
const BANNER_TEXT: Rgb<u8> = Rgb([235, 235, 235]);

const PALETTE: [Rgb<u8>; 8] = [
    Rgb([230, 57, 70]),
    Rgb([46, 196, 182]),
    Rgb([255, 183, 3]),
    Rgb([106, 76, 222]),
    Rgb([247, 127, 0]),
    Rgb([67, 170, 139]),
    Rgb([244, 97, 151]),
    Rgb([86, 163, 230]),
];

/// Stable per-class color so boxes keep their color across frames and restarts
pub fn class_color(class: &str) -> Rgb<u8> {
    let hash = class
        .bytes()
        .fold(0usize, |acc, b| acc.wrapping_mul(131).wrapping_add(b as usize));
    PALETTE[hash % PALETTE.len()]
}

/// Draw a box and label for every detection
pub fn draw_detections(image: &mut RgbImage, detections: &[Detection]) {
    for det in detections {
        let Some((x1, y1, x2, y2)) = clamp_box(&det.bbox, image.width(), image.height()) else {
            continue;
        };
        let color = class_color(&det.class);

        // inclusive corners, so +1 on both spans
        let (w, h) = (x2 - x1 + 1, y2 - y1 + 1);
        for inset in 0..BOX_THICKNESS {
            if w > 2 * inset && h > 2 * inset {
                draw_hollow_rect_mut(
                    image,
                    Rect::at((x1 + inset) as i32, (y1 + inset) as i32)
                        .of_size(w - 2 * inset, h - 2 * inset),
                    color,
                );
            }
        }

        let label = match det.track_id {
            Some(id) => format!("{} {:.0}% #{}", det.class, det.confidence * 100.0, id),
            None => format!("{} {:.0}%", det.class, det.confidence * 100.0),
        };
        draw_label(image, &label, x1, y1, y2, color);
    }
}

/// Label on a filled background above the box, below it when the box
/// touches the top edge
fn draw_label(image: &mut RgbImage, label: &str, x1: u32, y1: u32, y2: u32, bg: Rgb<u8>) {
    let label_h = glyph_height(TEXT_SCALE) + 2 * LABEL_PAD;
    let label_w = (text_width(label, TEXT_SCALE) + 2 * LABEL_PAD).min(image.width() - x1);
    if label_w == 0 || label_h >= image.height() {
        return;
    }
    let label_y = if y1 >= label_h {
        y1 - label_h
    } else {
        (y2 + 2).min(image.height() - label_h)
    };

    draw_filled_rect_mut(
        image,
        Rect::at(x1 as i32, label_y as i32).of_size(label_w, label_h),
        bg,
    );
    draw_text(
        image,
        label,
        x1 + LABEL_PAD,
        label_y + LABEL_PAD,
        TEXT_SCALE,
        LABEL_TEXT,
    );
}

/// Count banner in the top-left corner, one line per class
pub fn draw_count_banner(image: &mut RgbImage, snapshot: &CountSnapshot) {
    if snapshot.classes.is_empty() {
        return;
    }

    let lines: Vec<String> = snapshot
        .classes
        .iter()
        .map(|(name, counts)| format!("{}: {} ({} unique)", name, counts.live, counts.unique))
        .collect();

    let line_h = glyph_height(TEXT_SCALE) + 4;
    let banner_w = lines
        .iter()
        .map(|line| text_width(line, TEXT_SCALE))
        .max()
        .unwrap_or(0)
        + 2 * BANNER_PAD;
    let banner_h = lines.len() as u32 * line_h + 2 * BANNER_PAD;

    let banner_w = banner_w.min(image.width());
    let banner_h = banner_h.min(image.height());
    if banner_w == 0 || banner_h == 0 {
        return;
    }
    draw_filled_rect_mut(image, Rect::at(0, 0).of_size(banner_w, banner_h), BANNER_BG);

    for (idx, line) in lines.iter().enumerate() {
        draw_text(
            image,
            line,
            BANNER_PAD,
            BANNER_PAD + idx as u32 * line_h,
            TEXT_SCALE,
            BANNER_TEXT,
        );
    }
}

/// Clamp a model box to the image, dropping anything degenerate
fn clamp_box(bbox: &BBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    if width == 0 || height == 0 {
        return None;
    }
    let x1 = bbox.x1.clamp(0, width as i32 - 1) as u32;
    let y1 = bbox.y1.clamp(0, height as i32 - 1) as u32;
    let x2 = bbox.x2.clamp(0, width as i32 - 1) as u32;
    let y2 = bbox.y2.clamp(0, height as i32 - 1) as u32;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some((x1, y1, x2, y2))
}

fn glyph_height(scale: u32) -> u32 {
    7 * scale
}

fn text_width(text: &str, scale: u32) -> u32 {
    let chars = text.chars().flat_map(|c| c.to_lowercase()).count() as u32;
    chars * 6 * scale
}

/// Draw monospace bitmap text; pixels outside the image are dropped
fn draw_text(image: &mut RgbImage, text: &str, x: u32, y: u32, scale: u32, color: Rgb<u8>) {
    let mut cursor_x = x;
    for ch in text.chars().flat_map(|c| c.to_lowercase()) {
        if let Some(rows) = glyph(ch) {
            for (row_idx, row) in rows.iter().enumerate() {
                for col in 0..5u32 {
                    if row & (0b10000 >> col) == 0 {
                        continue;
                    }
                    for sy in 0..scale {
                        for sx in 0..scale {
                            let px = cursor_x + col * scale + sx;
                            let py = y + row_idx as u32 * scale + sy;
                            if px < image.width() && py < image.height() {
                                image.put_pixel(px, py, color);
                            }
                        }
                    }
                }
            }
        }
        cursor_x += 6 * scale;
    }
}

/// 5x7 glyphs, one 5-bit row mask per line, MSB = leftmost column
fn glyph(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b01110, 0b10001, 0b00001, 0b00110, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b01110, 0b10000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00001, 0b01110],
        'a' => [0b00000, 0b00000, 0b01110, 0b00001, 0b01111, 0b10001, 0b01111],
        'b' => [0b10000, 0b10000, 0b11110, 0b10001, 0b10001, 0b10001, 0b11110],
        'c' => [0b00000, 0b00000, 0b01110, 0b10000, 0b10000, 0b10000, 0b01110],
        'd' => [0b00001, 0b00001, 0b01111, 0b10001, 0b10001, 0b10001, 0b01111],
        'e' => [0b00000, 0b00000, 0b01110, 0b10001, 0b11111, 0b10000, 0b01110],
        'f' => [0b00110, 0b01000, 0b01000, 0b11100, 0b01000, 0b01000, 0b01000],
        'g' => [0b00000, 0b01111, 0b10001, 0b10001, 0b01111, 0b00001, 0b01110],
        'h' => [0b10000, 0b10000, 0b11110, 0b10001, 0b10001, 0b10001, 0b10001],
        'i' => [0b00100, 0b00000, 0b01100, 0b00100, 0b00100, 0b00100, 0b01110],
        'j' => [0b00010, 0b00000, 0b00110, 0b00010, 0b00010, 0b10010, 0b01100],
        'k' => [0b10000, 0b10000, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010],
        'l' => [0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'm' => [0b00000, 0b00000, 0b11010, 0b10101, 0b10101, 0b10101, 0b10101],
        'n' => [0b00000, 0b00000, 0b11110, 0b10001, 0b10001, 0b10001, 0b10001],
        'o' => [0b00000, 0b00000, 0b01110, 0b10001, 0b10001, 0b10001, 0b01110],
        'p' => [0b00000, 0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000],
        'q' => [0b00000, 0b01111, 0b10001, 0b10001, 0b01111, 0b00001, 0b00001],
        'r' => [0b00000, 0b00000, 0b10110, 0b11001, 0b10000, 0b10000, 0b10000],
        's' => [0b00000, 0b00000, 0b01111, 0b10000, 0b01110, 0b00001, 0b11110],
        't' => [0b00100, 0b00100, 0b01110, 0b00100, 0b00100, 0b00100, 0b00010],
        'u' => [0b00000, 0b00000, 0b10001, 0b10001, 0b10001, 0b10001, 0b01111],
        'v' => [0b00000, 0b00000, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'w' => [0b00000, 0b00000, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'x' => [0b00000, 0b00000, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001],
        'y' => [0b00000, 0b10001, 0b10001, 0b01010, 0b00100, 0b01000, 0b10000],
        'z' => [0b00000, 0b00000, 0b11111, 0b00010, 0b00100, 0b01000, 0b11111],
        ' ' => [0b00000; 7],
        '%' => [0b11001, 0b11001, 0b00010, 0b00100, 0b01000, 0b10011, 0b10011],
        '.' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b01100],
        ':' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000],
        '#' => [0b01010, 0b11111, 0b01010, 0b01010, 0b01010, 0b11111, 0b01010],
        '(' => [0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010],
        ')' => [0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000],
        '-' => [0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000],
        '_' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b11111],
        _ => return None,
    };
    Some(rows)
}
