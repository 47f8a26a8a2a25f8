//! Kitty graphics protocol: Unicode placeholder emission.
//!
//! Virtual placements put image cells under terminal control: the image
//! is transmitted once with `U=1`, then each affected cell carries
//! `U+10EEEE` with combining diacritics encoding its row and column and
//! a foreground color encoding the placement id.

use std::io::Write as _;
use std::process::{Command, Stdio};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::text::KITTY_PLACEHOLDER;

/// Row/column index diacritics from the Kitty spec, in order. 64 rows
/// and columns cover every placement the formatter reserves.
const DIACRITICS: [char; 64] = [
    '\u{0305}', '\u{030D}', '\u{030E}', '\u{0310}', '\u{0312}', '\u{033D}', '\u{033E}',
    '\u{033F}', '\u{0346}', '\u{034A}', '\u{034B}', '\u{034C}', '\u{0350}', '\u{0351}',
    '\u{0352}', '\u{0357}', '\u{035B}', '\u{0363}', '\u{0364}', '\u{0365}', '\u{0366}',
    '\u{0367}', '\u{0368}', '\u{0369}', '\u{036A}', '\u{036B}', '\u{036C}', '\u{036D}',
    '\u{036E}', '\u{036F}', '\u{0483}', '\u{0484}', '\u{0485}', '\u{0486}', '\u{0487}',
    '\u{0592}', '\u{0593}', '\u{0594}', '\u{0595}', '\u{0597}', '\u{0598}', '\u{0599}',
    '\u{059C}', '\u{059D}', '\u{059E}', '\u{059F}', '\u{05A0}', '\u{05A1}', '\u{05A8}',
    '\u{05A9}', '\u{05AB}', '\u{05AC}', '\u{05AF}', '\u{05C4}', '\u{0610}', '\u{0611}',
    '\u{0612}', '\u{0613}', '\u{0614}', '\u{0615}', '\u{0616}', '\u{0617}', '\u{0657}',
    '\u{0658}',
];

/// Whether the environment looks like a Kitty-graphics terminal.
pub fn graphics_supported() -> bool {
    let term = std::env::var("TERM").unwrap_or_default().to_lowercase();
    let program = std::env::var("TERM_PROGRAM")
        .unwrap_or_default()
        .to_lowercase();
    term.contains("kitty")
        || term.contains("ghostty")
        || program.contains("kitty")
        || program.contains("ghostty")
        || program.contains("wezterm")
}

/// One styled placeholder row: foreground color carries the low 24 bits
/// of the image id, the optional third diacritic its high byte.
pub fn placeholder_row(image_id: u32, row: usize, cols: usize) -> String {
    let r = (image_id >> 16) & 0xFF;
    let g = (image_id >> 8) & 0xFF;
    let b = image_id & 0xFF;
    let msb = ((image_id >> 24) & 0xFF) as usize;

    let mut out = format!("\u{1b}[38;2;{r};{g};{b}m");
    for col in 0..cols.min(DIACRITICS.len()) {
        out.push(KITTY_PLACEHOLDER);
        if let Some(&d) = DIACRITICS.get(row) {
            out.push(d);
        }
        if let Some(&d) = DIACRITICS.get(col) {
            out.push(d);
        }
        if msb > 0 && let Some(&d) = DIACRITICS.get(msb) {
            out.push(d);
        }
    }
    out.push_str("\u{1b}[39m");
    out
}

/// Transmit PNG bytes as a virtual placement (`U=1`), chunked per the
/// APC escape limits.
pub fn transmit_virtual(image_id: u32, png: &[u8], cols: usize, rows: usize) -> Vec<u8> {
    const CHUNK: usize = 4096;
    let encoded = BASE64.encode(png);
    let mut out = Vec::new();
    let chunks: Vec<&[u8]> = encoded.as_bytes().chunks(CHUNK).collect();
    let last = chunks.len().saturating_sub(1);

    for (i, chunk) in chunks.iter().enumerate() {
        let more = if i == last { 0 } else { 1 };
        if i == 0 {
            let _ = write!(
                out,
                "\u{1b}_Gq=2,f=100,a=T,U=1,i={image_id},c={cols},r={rows},m={more};"
            );
        } else {
            let _ = write!(out, "\u{1b}_Gm={more};");
        }
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\x1b\\");
    }
    out
}

/// Remove a virtual placement.
pub fn delete_image(image_id: u32) -> Vec<u8> {
    format!("\u{1b}_Ga=d,d=I,i={image_id}\u{1b}\\").into_bytes()
}

/// Return PNG bytes for a raster resource, transcoding via ImageMagick
/// when the source is not already PNG. `None` means "render alt text".
pub fn ensure_png(data: &[u8], src: &str) -> Option<Vec<u8>> {
    let lower = src.to_ascii_lowercase();
    if lower.ends_with(".png") {
        return Some(data.to_vec());
    }
    if !lower.ends_with(".jpg") && !lower.ends_with(".jpeg") {
        return None;
    }
    for tool in ["magick", "convert"] {
        match transcode_with(tool, data) {
            Some(png) => return Some(png),
            None => continue,
        }
    }
    None
}

fn transcode_with(tool: &str, data: &[u8]) -> Option<Vec<u8>> {
    let mut child = Command::new(tool)
        .args(["-", "png:-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(data).ok()?;
    }
    let output = child.wait_with_output().ok()?;
    (output.status.success() && !output.stdout.is_empty()).then_some(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_row_encodes_id_in_foreground() {
        let row = placeholder_row(0x00_12_34_56, 0, 3);
        assert!(row.starts_with("\u{1b}[38;2;18;52;86m"));
        assert!(row.ends_with("\u{1b}[39m"));
        assert_eq!(row.matches(KITTY_PLACEHOLDER).count(), 3);
    }

    #[test]
    fn placeholder_rows_differ_by_row_diacritic() {
        let a = placeholder_row(1, 0, 2);
        let b = placeholder_row(1, 1, 2);
        assert_ne!(a, b);
    }

    #[test]
    fn placeholder_cells_measure_one_column_each() {
        let row = placeholder_row(9, 2, 4);
        assert_eq!(crate::text::visible_length(&row), 4);
    }

    #[test]
    fn transmission_is_chunked_and_terminated() {
        let png = vec![0u8; 9000];
        let bytes = transmit_virtual(42, &png, 10, 5);
        let s = String::from_utf8_lossy(&bytes);
        assert!(s.starts_with("\u{1b}_Gq=2,f=100,a=T,U=1,i=42,c=10,r=5,m=1;"));
        assert!(s.ends_with("\u{1b}\\"));
        assert!(s.contains("\u{1b}_Gm=0;"));
    }

    #[test]
    fn ensure_png_passes_png_through() {
        let data = b"\x89PNG fake".to_vec();
        assert_eq!(ensure_png(&data, "cover.PNG"), Some(data));
        assert_eq!(ensure_png(b"svg", "img.svg"), None);
    }
}
