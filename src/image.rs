//! Image extraction/classification from reply text and header-based pixel
//! size sniffing.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::target::MediaSource;

static MARKDOWN_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\(([^)]+)\)").unwrap());

static BARE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?P<prefix>[^(\['"]|^)(?P<url>https?://\S+?\.(?:png|jpe?g|gif|webp))"#).unwrap()
});

static BARE_LOCAL_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)(/\S+\.(?:png|jpe?g|gif|webp|bmp))").unwrap());

const APOLOGETIC_PATTERNS: &[&str] = &[
    r"(?i)^(抱歉|对不起|很遗憾|不好意思)[，,].*(图片|image).*(失败|无法|不能)",
    r"(?i)(unable|failed|can'?t) to (send|display|show) the image",
];

const STOP_WORDS: &[&str] = &[
    "的", "了", "是", "我", "在", "这", "那", "和", "就", "也", "都", "不", "a", "the", "is",
    "and", "to", "of", "i", "it",
];

/// Result of resolving images out of a reply's text.
#[derive(Debug, Clone)]
pub struct ResolvedImages {
    pub sources: Vec<MediaSource>,
    pub cleaned_text: String,
}

/// Extracts and classifies images referenced in reply text, and produces a
/// cleaned version of the text with image markup removed.
pub struct ImageResolver;

impl ImageResolver {
    /// `explicit_media` is `payload.mediaUrl(s)`, applied first per rule 1.
    pub fn resolve(text: &str, explicit_media: &[String]) -> ResolvedImages {
        let mut sources = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for raw in explicit_media {
            if let Some(source) = MediaSource::classify(raw) {
                if seen.insert(raw.clone()) {
                    sources.push(source);
                }
            }
        }

        let mut cleaned = text.to_string();

        // Rule 2: markdown images.
        let markdown_targets: Vec<(String, String)> = MARKDOWN_IMAGE
            .captures_iter(text)
            .map(|c| (c.get(0).unwrap().as_str().to_string(), c[1].to_string()))
            .collect();
        for (whole, target) in &markdown_targets {
            if let Some(source) = MediaSource::classify(target) {
                if seen.insert(target.clone()) {
                    sources.push(source);
                }
                cleaned = cleaned.replace(whole.as_str(), "");
            }
        }

        // Rule 3: bare http(s) URLs not already captured by markdown.
        let bare_urls: Vec<String> = BARE_URL
            .captures_iter(&cleaned)
            .map(|c| c.name("url").unwrap().as_str().to_string())
            .collect();
        for url in &bare_urls {
            if seen.insert(url.clone()) {
                sources.push(MediaSource::PublicUrl(url.clone()));
            }
            cleaned = cleaned.replace(url.as_str(), "");
        }

        // Rule 4: bare absolute local paths — logged but not auto-sent.
        for captures in BARE_LOCAL_PATH.captures_iter(&cleaned) {
            let path = captures[1].to_string();
            debug!(%path, "bare local image path seen but not auto-sent (requires markdown form)");
        }

        let has_images = !sources.is_empty();
        let cleaned = Self::clean_text(&cleaned, has_images);

        ResolvedImages { sources, cleaned_text: cleaned }
    }

    fn clean_text(text: &str, has_images: bool) -> String {
        let text = text.trim();

        if has_images {
            if Self::looks_apologetic(text) {
                return "图片如上 ☝️".to_string();
            }
            return text.to_string();
        }

        Self::rewrite_dotted_tokens(text)
    }

    fn looks_apologetic(text: &str) -> bool {
        for pattern in APOLOGETIC_PATTERNS {
            if Regex::new(pattern).unwrap().is_match(text) {
                return true;
            }
        }
        Self::mostly_stop_words(text)
    }

    /// Heuristic: short paragraphs composed mostly of stop words are treated
    /// as meta/apologetic filler rather than real content.
    fn mostly_stop_words(text: &str) -> bool {
        let words: Vec<&str> = text
            .split(|c: char| c.is_whitespace() || "，。！？,.!?".contains(c))
            .filter(|w| !w.is_empty())
            .collect();
        if words.is_empty() || words.len() > 12 {
            return false;
        }
        let stop_count = words
            .iter()
            .filter(|w| STOP_WORDS.contains(&w.to_lowercase().as_str()))
            .count();
        (stop_count as f64) / (words.len() as f64) >= 0.6
    }

    /// `X.Y` → `X_Y` when no images are being sent, to dodge the platform's
    /// dotted-token URL filter, plus an appended footnote.
    fn rewrite_dotted_tokens(text: &str) -> String {
        static DOTTED: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"\b([A-Za-z0-9]+)\.([A-Za-z0-9]+)\b").unwrap());

        let mut rewritten = false;
        let replaced = DOTTED.replace_all(text, |caps: &regex::Captures| {
            rewritten = true;
            format!("{}_{}", &caps[1], &caps[2])
        });

        if rewritten {
            format!("{replaced}\n(注：为避免被拦截，已将句中的点号替换为下划线)")
        } else {
            replaced.into_owned()
        }
    }

    /// Peek PNG/JPEG/GIF/WebP headers (a 64 KiB range in production) to
    /// decode true pixel size, falling back to 512x512 when unavailable.
    pub fn decode_image_size(bytes: &[u8]) -> Option<(u32, u32)> {
        decode_png(bytes)
            .or_else(|| decode_gif(bytes))
            .or_else(|| decode_jpeg(bytes))
            .or_else(|| decode_webp(bytes))
    }
}

fn decode_png(bytes: &[u8]) -> Option<(u32, u32)> {
    const SIG: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
    if bytes.len() < 24 || &bytes[0..8] != SIG {
        return None;
    }
    let w = u32::from_be_bytes(bytes[16..20].try_into().ok()?);
    let h = u32::from_be_bytes(bytes[20..24].try_into().ok()?);
    Some((w, h))
}

fn decode_gif(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 10 || &bytes[0..3] != b"GIF" {
        return None;
    }
    let w = u16::from_le_bytes(bytes[6..8].try_into().ok()?) as u32;
    let h = u16::from_le_bytes(bytes[8..10].try_into().ok()?) as u32;
    Some((w, h))
}

fn decode_jpeg(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return None;
    }
    let mut i = 2usize;
    while i + 9 < bytes.len() {
        if bytes[i] != 0xFF {
            i += 1;
            continue;
        }
        let marker = bytes[i + 1];
        // SOF0..SOF3, SOF5..SOF7, SOF9..SOF11, SOF13..SOF15 carry dimensions.
        let is_sof = matches!(marker, 0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF);
        if marker == 0xD8 || marker == 0x01 || (0xD0..=0xD7).contains(&marker) {
            i += 2;
            continue;
        }
        let segment_len = u16::from_be_bytes(bytes[i + 2..i + 4].try_into().ok()?) as usize;
        if is_sof {
            let h = u16::from_be_bytes(bytes[i + 5..i + 7].try_into().ok()?) as u32;
            let w = u16::from_be_bytes(bytes[i + 7..i + 9].try_into().ok()?) as u32;
            return Some((w, h));
        }
        if marker == 0xD9 {
            break;
        }
        i += 2 + segment_len;
    }
    None
}

fn decode_webp(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 30 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WEBP" {
        return None;
    }
    match &bytes[12..16] {
        b"VP8 " => {
            let w = u16::from_le_bytes(bytes[26..28].try_into().ok()?) as u32 & 0x3FFF;
            let h = u16::from_le_bytes(bytes[28..30].try_into().ok()?) as u32 & 0x3FFF;
            Some((w, h))
        }
        b"VP8L" => {
            let b0 = bytes[21] as u32;
            let b1 = bytes[22] as u32;
            let b2 = bytes[23] as u32;
            let b3 = bytes[24] as u32;
            let w = 1 + (((b1 & 0x3F) << 8) | b0);
            let h = 1 + (((b3 & 0xF) << 10) | (b2 << 2) | (b1 >> 6));
            Some((w, h))
        }
        b"VP8X" => {
            let w = 1 + (bytes[24] as u32 | (bytes[25] as u32) << 8 | (bytes[26] as u32) << 16);
            let h = 1 + (bytes[27] as u32 | (bytes[28] as u32) << 8 | (bytes[29] as u32) << 16);
            Some((w, h))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_png(w: u32, h: u32) -> Vec<u8> {
        let mut buf = vec![0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
        buf.extend_from_slice(&[0, 0, 0, 13]); // IHDR length, unused by decoder
        buf.extend_from_slice(b"IHDR");
        buf.extend_from_slice(&w.to_be_bytes());
        buf.extend_from_slice(&h.to_be_bytes());
        buf
    }

    fn encode_gif(w: u32, h: u32) -> Vec<u8> {
        let mut buf = b"GIF89a".to_vec();
        buf.extend_from_slice(&(w as u16).to_le_bytes());
        buf.extend_from_slice(&(h as u16).to_le_bytes());
        buf
    }

    fn encode_jpeg(w: u32, h: u32) -> Vec<u8> {
        let mut buf = vec![0xFF, 0xD8]; // SOI
        buf.extend_from_slice(&[0xFF, 0xC0]); // SOF0
        buf.extend_from_slice(&11u16.to_be_bytes()); // segment length
        buf.push(8); // precision
        buf.extend_from_slice(&(h as u16).to_be_bytes());
        buf.extend_from_slice(&(w as u16).to_be_bytes());
        buf.push(1); // num components
        buf.extend_from_slice(&[1, 0x11, 0]); // component id, sampling, quant table
        buf.extend_from_slice(&[0xFF, 0xD9]); // EOI
        buf
    }

    fn encode_webp(w: u32, h: u32) -> Vec<u8> {
        let mut buf = b"RIFF".to_vec();
        buf.extend_from_slice(&20u32.to_le_bytes()); // riff size, not validated by the decoder
        buf.extend_from_slice(b"WEBP");
        buf.extend_from_slice(b"VP8 ");
        buf.extend_from_slice(&10u32.to_le_bytes()); // chunk size
        buf.extend_from_slice(&[0x10, 0x00, 0x00]); // frame tag
        buf.extend_from_slice(&[0x9d, 0x01, 0x2a]); // start code
        buf.extend_from_slice(&((w as u16) & 0x3FFF).to_le_bytes());
        buf.extend_from_slice(&((h as u16) & 0x3FFF).to_le_bytes());
        buf
    }

    #[test]
    fn decode_png_size_round_trips() {
        for (w, h) in [(1u32, 1u32), (512, 512), (16383, 16383), (4000, 3000)] {
            let bytes = encode_png(w, h);
            assert_eq!(ImageResolver::decode_image_size(&bytes), Some((w, h)));
        }
    }

    #[test]
    fn decode_gif_size_round_trips() {
        for (w, h) in [(1u32, 1u32), (16383, 16383), (800, 600)] {
            let bytes = encode_gif(w, h);
            assert_eq!(ImageResolver::decode_image_size(&bytes), Some((w, h)));
        }
    }

    #[test]
    fn decode_jpeg_size_round_trips() {
        for (w, h) in [(1u32, 1u32), (65535, 65535), (1920, 1080)] {
            let bytes = encode_jpeg(w, h);
            assert_eq!(ImageResolver::decode_image_size(&bytes), Some((w, h)));
        }
    }

    #[test]
    fn decode_webp_size_round_trips() {
        for (w, h) in [(1u32, 1u32), (16383, 16383), (1024, 768)] {
            let bytes = encode_webp(w, h);
            assert_eq!(ImageResolver::decode_image_size(&bytes), Some((w, h)));
        }
    }

    #[test]
    fn markdown_image_extracted_and_stripped() {
        let resolved = ImageResolver::resolve("这是图\n![](/tmp/a.png)", &[]);
        assert_eq!(resolved.sources.len(), 1);
        assert_eq!(resolved.cleaned_text, "这是图");
    }

    #[test]
    fn explicit_media_url_takes_priority_and_dedupes() {
        let resolved = ImageResolver::resolve(
            "![](https://x.com/a.png)",
            &["https://x.com/a.png".to_string()],
        );
        assert_eq!(resolved.sources.len(), 1);
    }

    #[test]
    fn bare_local_path_is_not_auto_sent() {
        let resolved = ImageResolver::resolve("see /tmp/a.png for the result", &[]);
        assert!(resolved.sources.is_empty());
    }

    #[test]
    fn dotted_tokens_rewritten_when_no_images() {
        let resolved = ImageResolver::resolve("visit example.com now", &[]);
        assert!(resolved.sources.is_empty());
        assert!(resolved.cleaned_text.contains("example_com"));
        assert!(resolved.cleaned_text.contains("下划线"));
    }

    #[test]
    fn apologetic_text_collapsed_when_images_present() {
        let resolved = ImageResolver::resolve(
            "抱歉，图片发送失败\n![](/tmp/a.png)",
            &[],
        );
        assert_eq!(resolved.cleaned_text, "图片如上 ☝️");
    }
}
