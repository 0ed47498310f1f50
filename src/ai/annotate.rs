//! Frame annotation: bounding boxes and labels drawn directly into RGB
//! pixel data, plus JPEG evidence encoding.

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use super::classifier::ConfidenceBucket;
use super::Bbox;
use crate::error::Error;

const NORMAL_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const ABNORMAL_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BOX_THICKNESS: u32 = 3;

const GLYPH_W: u32 = 8;
const GLYPH_H: u32 = 12;

/// What to draw for one tracked person.
#[derive(Debug, Clone)]
pub struct PersonOverlay {
    pub person_id: u32,
    pub bbox: Bbox,
    pub abnormal: bool,
    /// Classifier score, when this person was scored this frame.
    pub score: Option<f32>,
    pub bucket: Option<ConfidenceBucket>,
}

impl PersonOverlay {
    fn label(&self) -> String {
        let mut label = format!("ID {}", self.person_id);
        if let Some(score) = self.score {
            label.push_str(&format!(" {:.2}", score));
        }
        if let Some(bucket) = self.bucket {
            label.push(' ');
            label.push_str(&bucket.as_str().to_uppercase());
        }
        label
    }
}

/// Copy the frame and draw every overlay onto it.
pub fn annotate_frame(frame: &RgbImage, overlays: &[PersonOverlay]) -> RgbImage {
    let mut out = frame.clone();
    for overlay in overlays {
        let color = if overlay.abnormal {
            ABNORMAL_COLOR
        } else {
            NORMAL_COLOR
        };
        draw_rect(&mut out, &overlay.bbox, color, BOX_THICKNESS);
        draw_label(&mut out, overlay, color);
    }
    out
}

/// Encode a frame as JPEG at the given quality.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, Error> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality)
        .encode_image(frame)
        .map_err(|e| Error::Storage(format!("jpeg encode: {}", e)))?;
    Ok(bytes)
}

fn put_pixel(image: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_rect(image: &mut RgbImage, bbox: &Bbox, color: Rgb<u8>, thickness: u32) {
    let x1 = bbox.x as i64;
    let y1 = bbox.y as i64;
    let x2 = (bbox.x + bbox.w) as i64;
    let y2 = (bbox.y + bbox.h) as i64;

    for t in 0..thickness as i64 {
        for x in x1..=x2 {
            put_pixel(image, x, y1 + t, color);
            put_pixel(image, x, y2 - t, color);
        }
        for y in y1..=y2 {
            put_pixel(image, x1 + t, y, color);
            put_pixel(image, x2 - t, y, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, overlay: &PersonOverlay, background: Rgb<u8>) {
    let label = overlay.label();
    let text_w = label.chars().count() as i64 * GLYPH_W as i64;
    let text_h = GLYPH_H as i64;

    let x = overlay.bbox.x as i64;
    // Above the box when it fits, below otherwise.
    let y = if overlay.bbox.y as i64 - text_h - 4 >= 0 {
        overlay.bbox.y as i64 - text_h - 4
    } else {
        (overlay.bbox.y + overlay.bbox.h) as i64 + 4
    };

    for ty in (y - 2)..(y + text_h + 2) {
        for tx in (x - 2)..(x + text_w + 2) {
            put_pixel(image, tx, ty, background);
        }
    }
    draw_text(image, &label, x, y, TEXT_COLOR);
}

fn draw_text(image: &mut RgbImage, text: &str, start_x: i64, start_y: i64, color: Rgb<u8>) {
    let mut x = start_x;
    for ch in text.chars() {
        let pattern = glyph(ch);
        for (row, bits) in pattern.iter().enumerate() {
            for col in 0..GLYPH_W as i64 {
                if (bits >> (GLYPH_W as i64 - 1 - col)) & 1 == 1 {
                    put_pixel(image, x + col, start_y + row as i64, color);
                }
            }
        }
        x += GLYPH_W as i64;
    }
}

/// 8x12 bitmap glyphs for the label alphabet. Unknown characters render
/// as blanks.
fn glyph(ch: char) -> [u8; 12] {
    match ch {
        '0' => [0x00, 0x3C, 0x42, 0x46, 0x4A, 0x52, 0x62, 0x42, 0x42, 0x3C, 0x00, 0x00],
        '1' => [0x00, 0x08, 0x18, 0x28, 0x08, 0x08, 0x08, 0x08, 0x08, 0x3E, 0x00, 0x00],
        '2' => [0x00, 0x3C, 0x42, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x7E, 0x00, 0x00],
        '3' => [0x00, 0x3C, 0x42, 0x02, 0x1C, 0x02, 0x02, 0x02, 0x42, 0x3C, 0x00, 0x00],
        '4' => [0x00, 0x04, 0x0C, 0x14, 0x24, 0x44, 0x7E, 0x04, 0x04, 0x04, 0x00, 0x00],
        '5' => [0x00, 0x7E, 0x40, 0x40, 0x7C, 0x02, 0x02, 0x02, 0x42, 0x3C, 0x00, 0x00],
        '6' => [0x00, 0x3C, 0x42, 0x40, 0x7C, 0x42, 0x42, 0x42, 0x42, 0x3C, 0x00, 0x00],
        '7' => [0x00, 0x7E, 0x02, 0x04, 0x08, 0x10, 0x10, 0x10, 0x10, 0x10, 0x00, 0x00],
        '8' => [0x00, 0x3C, 0x42, 0x42, 0x3C, 0x42, 0x42, 0x42, 0x42, 0x3C, 0x00, 0x00],
        '9' => [0x00, 0x3C, 0x42, 0x42, 0x42, 0x3E, 0x02, 0x02, 0x42, 0x3C, 0x00, 0x00],
        'A' => [0x00, 0x18, 0x24, 0x42, 0x42, 0x7E, 0x42, 0x42, 0x42, 0x42, 0x00, 0x00],
        'C' => [0x00, 0x3C, 0x42, 0x40, 0x40, 0x40, 0x40, 0x40, 0x42, 0x3C, 0x00, 0x00],
        'D' => [0x00, 0x78, 0x44, 0x42, 0x42, 0x42, 0x42, 0x42, 0x44, 0x78, 0x00, 0x00],
        'E' => [0x00, 0x7E, 0x40, 0x40, 0x40, 0x7C, 0x40, 0x40, 0x40, 0x7E, 0x00, 0x00],
        'G' => [0x00, 0x3C, 0x42, 0x40, 0x40, 0x4E, 0x42, 0x42, 0x46, 0x3A, 0x00, 0x00],
        'H' => [0x00, 0x42, 0x42, 0x42, 0x42, 0x7E, 0x42, 0x42, 0x42, 0x42, 0x00, 0x00],
        'I' => [0x00, 0x3E, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x3E, 0x00, 0x00],
        'L' => [0x00, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x40, 0x7E, 0x00, 0x00],
        'M' => [0x00, 0x42, 0x66, 0x5A, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x00, 0x00],
        'N' => [0x00, 0x42, 0x62, 0x52, 0x4A, 0x46, 0x42, 0x42, 0x42, 0x42, 0x00, 0x00],
        'O' => [0x00, 0x3C, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x3C, 0x00, 0x00],
        'R' => [0x00, 0x7C, 0x42, 0x42, 0x42, 0x7C, 0x48, 0x44, 0x42, 0x42, 0x00, 0x00],
        'S' => [0x00, 0x3C, 0x42, 0x40, 0x30, 0x0C, 0x02, 0x42, 0x42, 0x3C, 0x00, 0x00],
        'U' => [0x00, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x3C, 0x00, 0x00],
        'W' => [0x00, 0x41, 0x41, 0x41, 0x41, 0x49, 0x49, 0x55, 0x63, 0x41, 0x00, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x18, 0x18, 0x00, 0x00],
        '-' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x7E, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x00, 0x00, 0x18, 0x18, 0x00, 0x00, 0x18, 0x18, 0x00, 0x00, 0x00],
        _ => [0x00; 12],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay(abnormal: bool) -> PersonOverlay {
        PersonOverlay {
            person_id: 1,
            bbox: Bbox::new(100.0, 100.0, 60.0, 120.0),
            abnormal,
            score: Some(-3.21),
            bucket: Some(ConfidenceBucket::High),
        }
    }

    #[test]
    fn abnormal_boxes_are_red_normal_are_green() {
        let frame = RgbImage::new(320, 320);

        let red = annotate_frame(&frame, &[overlay(true)]);
        assert_eq!(*red.get_pixel(130, 100), ABNORMAL_COLOR);

        let green = annotate_frame(&frame, &[overlay(false)]);
        assert_eq!(*green.get_pixel(130, 100), NORMAL_COLOR);
    }

    #[test]
    fn original_frame_is_untouched() {
        let frame = RgbImage::new(320, 320);
        let _ = annotate_frame(&frame, &[overlay(true)]);
        assert_eq!(*frame.get_pixel(130, 100), Rgb([0, 0, 0]));
    }

    #[test]
    fn overlays_near_the_edge_do_not_panic() {
        let frame = RgbImage::new(64, 64);
        let edge = PersonOverlay {
            person_id: 42,
            bbox: Bbox::new(60.0, 2.0, 30.0, 30.0),
            abnormal: true,
            score: Some(-1.0),
            bucket: Some(ConfidenceBucket::Low),
        };
        let _ = annotate_frame(&frame, &[edge]);
    }

    #[test]
    fn label_contains_score_and_bucket() {
        assert_eq!(overlay(true).label(), "ID 1 -3.21 HIGH");
    }

    #[test]
    fn jpeg_encoding_produces_nonempty_payload() {
        let frame = RgbImage::new(64, 64);
        let bytes = encode_jpeg(&frame, 90).expect("encode");
        // JPEG SOI marker.
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
