//! 5x7 bitmap font for burning text into RGB24 frames
//!
//! Each glyph is seven rows, the low five bits of each row are pixels
//! (bit 4 is the leftmost column). Lower case renders as upper case and
//! anything unknown renders as `?`.

pub const GLYPH_WIDTH: usize = 5;
pub const GLYPH_HEIGHT: usize = 7;
/// Horizontal advance per character, glyph plus one column of spacing
pub const ADVANCE: usize = GLYPH_WIDTH + 1;

type Glyph = [u8; GLYPH_HEIGHT];

const UNKNOWN: Glyph = [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04];

fn glyph(c: char) -> &'static Glyph {
    match c.to_ascii_uppercase() {
        ' ' => &[0x00; 7],
        '!' => &[0x04, 0x04, 0x04, 0x04, 0x04, 0x00, 0x04],
        '"' => &[0x0A, 0x0A, 0x0A, 0x00, 0x00, 0x00, 0x00],
        '#' => &[0x0A, 0x0A, 0x1F, 0x0A, 0x1F, 0x0A, 0x0A],
        '%' => &[0x18, 0x19, 0x02, 0x04, 0x08, 0x13, 0x03],
        '\'' => &[0x04, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00],
        '(' => &[0x02, 0x04, 0x08, 0x08, 0x08, 0x04, 0x02],
        ')' => &[0x08, 0x04, 0x02, 0x02, 0x02, 0x04, 0x08],
        '*' => &[0x00, 0x04, 0x15, 0x0E, 0x15, 0x04, 0x00],
        '+' => &[0x00, 0x04, 0x04, 0x1F, 0x04, 0x04, 0x00],
        ',' => &[0x00, 0x00, 0x00, 0x00, 0x0C, 0x04, 0x08],
        '-' => &[0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '.' => &[0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '/' => &[0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        '0' => &[0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => &[0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => &[0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => &[0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => &[0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => &[0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => &[0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => &[0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => &[0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => &[0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        ':' => &[0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        ';' => &[0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x04, 0x08],
        '<' => &[0x02, 0x04, 0x08, 0x10, 0x08, 0x04, 0x02],
        '=' => &[0x00, 0x00, 0x1F, 0x00, 0x1F, 0x00, 0x00],
        '>' => &[0x08, 0x04, 0x02, 0x01, 0x02, 0x04, 0x08],
        '?' => &UNKNOWN,
        '@' => &[0x0E, 0x11, 0x01, 0x0D, 0x15, 0x15, 0x0E],
        'A' => &[0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => &[0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => &[0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => &[0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => &[0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => &[0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => &[0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => &[0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => &[0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => &[0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => &[0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => &[0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => &[0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => &[0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => &[0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => &[0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => &[0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => &[0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => &[0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => &[0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => &[0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => &[0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => &[0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => &[0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => &[0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => &[0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '[' => &[0x0E, 0x08, 0x08, 0x08, 0x08, 0x08, 0x0E],
        ']' => &[0x0E, 0x02, 0x02, 0x02, 0x02, 0x02, 0x0E],
        '_' => &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        '|' => &[0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        _ => &UNKNOWN,
    }
}

/// Draw `text` into an RGB24 buffer with its top-left corner at `(x, y)`.
///
/// Every font pixel becomes a `scale`×`scale` block; anything falling
/// outside the buffer is clipped.
#[allow(clippy::too_many_arguments)]
pub fn draw_text_line(
    buffer: &mut [u8],
    width: usize,
    height: usize,
    x: usize,
    y: usize,
    text: &str,
    color: (u8, u8, u8),
    scale: usize,
) {
    let scale = scale.max(1);
    for (i, c) in text.chars().enumerate() {
        let origin_x = x + i * ADVANCE * scale;
        if origin_x >= width {
            break;
        }
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (0x10 >> col) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    let py = y + row * scale + dy;
                    if py >= height {
                        break;
                    }
                    for dx in 0..scale {
                        let px = origin_x + col * scale + dx;
                        if px >= width {
                            break;
                        }
                        let idx = (py * width + px) * 3;
                        if idx + 2 < buffer.len() {
                            buffer[idx] = color.0;
                            buffer[idx + 1] = color.1;
                            buffer[idx + 2] = color.2;
                        }
                    }
                }
            }
        }
    }
}

/// Pixel width `text` occupies at `scale`
pub fn text_width(text: &str, scale: usize) -> usize {
    text.chars().count() * ADVANCE * scale.max(1)
}
