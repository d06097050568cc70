//! Content sniffing from a leading byte range.

use std::io::Cursor;

/// Bytes read from the start of an object for sniffing. Large enough to reach
/// the size header of JPEGs with sizeable EXIF blocks.
pub const SNIFF_LEN: u64 = 64 * 1024;

const OCTET_STREAM: &str = "application/octet-stream";

/// Types that a browser may execute or render as a document on the serving origin.
const DANGEROUS_TYPES: &[&str] = &[
    "text/html",
    "application/xhtml+xml",
    "image/svg+xml",
    "text/xml",
    "application/xml",
    "text/javascript",
    "application/javascript",
    "application/x-javascript",
    "application/ecmascript",
    "text/ecmascript",
    "application/x-shockwave-flash",
    "text/x-sh",
    "application/x-sh",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sniffed {
    pub mime_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Lower-case a MIME type and drop any parameters.
pub fn normalize_mime(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Whether content of this type must always be served as an attachment.
pub fn is_dangerous_mime(mime_type: &str) -> bool {
    let mime = normalize_mime(mime_type);
    DANGEROUS_TYPES.contains(&mime.as_str()) || mime.ends_with("+xml")
}

/// Detect the MIME type of `head` and, for images, its pixel dimensions.
///
/// Magic bytes win over anything the client declared. When the content has no
/// recognisable signature the declared type is used, then a guess from the
/// filename, then `text/plain` for NUL-free UTF-8, then octet-stream.
pub fn sniff(head: &[u8], declared: Option<&str>, filename: Option<&str>) -> Sniffed {
    let mime_type = detect_mime(head, declared, filename);
    let (width, height) = if mime_type.starts_with("image/") {
        match image_dimensions(head) {
            Some((w, h)) => (Some(w), Some(h)),
            None => (None, None),
        }
    } else {
        (None, None)
    };

    Sniffed {
        mime_type,
        width,
        height,
    }
}

fn detect_mime(head: &[u8], declared: Option<&str>, filename: Option<&str>) -> String {
    if let Some(kind) = infer::get(head) {
        return kind.mime_type().to_string();
    }

    let declared = declared
        .map(normalize_mime)
        .filter(|m| !m.is_empty() && m != OCTET_STREAM);
    if let Some(mime) = declared {
        return mime;
    }

    if let Some(guess) = filename.and_then(|n| mime_guess::from_path(n).first()) {
        return guess.essence_str().to_string();
    }

    // Plain text has no signature; a truncated read may split a code point at the end.
    let valid_utf8 = match std::str::from_utf8(head) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    };
    if !head.is_empty() && valid_utf8 && !head.contains(&0) {
        return "text/plain".to_string();
    }

    OCTET_STREAM.to_string()
}

/// Read pixel dimensions from an image header without decoding pixel data.
pub fn image_dimensions(head: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(head))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_sniff_png_dimensions() {
        let data = png_bytes(40, 25);
        let sniffed = sniff(&data, Some("application/octet-stream"), None);
        assert_eq!(sniffed.mime_type, "image/png");
        assert_eq!(sniffed.width, Some(40));
        assert_eq!(sniffed.height, Some(25));
    }

    #[test]
    fn test_sniff_dimensions_from_truncated_head() {
        // Noise does not compress, so the encoded file is far larger than the sniff window.
        let mut seed: u32 = 7;
        let img = image::RgbImage::from_fn(600, 400, |_, _| {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let b = seed.to_be_bytes();
            image::Rgb([b[0], b[1], b[2]])
        });
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        let data = buf.into_inner();
        assert!(data.len() as u64 > SNIFF_LEN);

        let sniffed = sniff(&data[..SNIFF_LEN as usize], None, None);
        assert_eq!(sniffed.mime_type, "image/png");
        assert_eq!(sniffed.width, Some(600));
        assert_eq!(sniffed.height, Some(400));
    }

    #[test]
    fn test_magic_bytes_override_declared_type() {
        let data = png_bytes(2, 2);
        let sniffed = sniff(&data, Some("text/plain"), Some("notes.txt"));
        assert_eq!(sniffed.mime_type, "image/png");
    }

    #[test]
    fn test_declared_type_used_without_signature() {
        let sniffed = sniff(b"col1,col2\n1,2\n", Some("Text/CSV; charset=utf-8"), None);
        assert_eq!(sniffed.mime_type, "text/csv");
        assert_eq!(sniffed.width, None);
    }

    #[test]
    fn test_filename_guess_then_text_fallback() {
        let sniffed = sniff(b"a,b\n", None, Some("report.csv"));
        assert_eq!(sniffed.mime_type, "text/csv");

        let sniffed = sniff(b"just words", None, None);
        assert_eq!(sniffed.mime_type, "text/plain");

        let sniffed = sniff(&[0, 159, 146, 150], None, None);
        assert_eq!(sniffed.mime_type, "application/octet-stream");
    }

    #[test]
    fn test_dangerous_types() {
        assert!(is_dangerous_mime("text/html; charset=utf-8"));
        assert!(is_dangerous_mime("IMAGE/SVG+XML"));
        assert!(is_dangerous_mime("application/rss+xml"));
        assert!(!is_dangerous_mime("image/png"));
        assert!(!is_dangerous_mime("text/plain"));
    }
}
