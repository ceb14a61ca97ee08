//! Media type sniffing from a bounded content prefix.
//!
//! Sniffing follows the WHATWG MIME sniffing rules for the subset of formats
//! that a file store commonly sees: markup, documents, images, audio/video,
//! fonts and archives. Anything that is not recognised and contains binary
//! control bytes is `application/octet-stream`; everything else is plain text.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fallback type for unrecognised binary content.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Type reported for text content (including empty content).
pub const TEXT_PLAIN_UTF8: &str = "text/plain; charset=utf-8";

/// A media type such as `image/png` or `text/plain; charset=utf-8`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaType(String);

impl MediaType {
    /// Parse a caller-declared media type.
    ///
    /// The value must have a non-empty `type/subtype` part; parameters after
    /// `;` are kept verbatim.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let trimmed = s.trim();
        let essence = trimmed.split(';').next().unwrap_or_default().trim();
        match essence.split_once('/') {
            Some((ty, subtype))
                if !ty.is_empty()
                    && !subtype.is_empty()
                    && !subtype.contains('/')
                    && !essence.contains(char::is_whitespace) =>
            {
                Ok(Self(trimmed.to_string()))
            }
            _ => Err(crate::Error::InvalidMediaType(s.to_string())),
        }
    }

    /// Wrap a media type string produced internally or loaded from storage.
    pub fn from_stored(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The full media type string including parameters.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The lowercase `type/subtype` part without parameters.
    pub fn essence(&self) -> String {
        self.0
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }

    /// Whether two media types name the same `type/subtype`.
    ///
    /// Parameters such as `charset` are ignored.
    pub fn same_essence(&self, other: &MediaType) -> bool {
        self.essence() == other.essence()
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MediaType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Sniff the media type of a content prefix.
///
/// Only the first [`crate::DEFAULT_SNIFF_LEN`] bytes are inspected.
pub fn sniff(data: &[u8]) -> MediaType {
    let data = &data[..data.len().min(crate::DEFAULT_SNIFF_LEN)];
    let first_non_ws = data.iter().position(|b| !is_ws(*b)).unwrap_or(data.len());

    for sig in SIGNATURES {
        if let Some(ty) = sig.matches(data, first_non_ws) {
            return MediaType::from_stored(ty);
        }
    }
    MediaType::from_stored(OCTET_STREAM)
}

fn is_ws(b: u8) -> bool {
    matches!(b, b'\t' | b'\n' | 0x0c | b'\r' | b' ')
}

fn is_tag_terminator(b: u8) -> bool {
    b == b' ' || b == b'>'
}

enum Signature {
    /// Case-insensitive HTML tag after leading whitespace.
    Html(&'static [u8]),
    /// Pattern compared under a bit mask.
    Masked {
        mask: &'static [u8],
        pattern: &'static [u8],
        skip_ws: bool,
        ty: &'static str,
    },
    /// Exact prefix.
    Exact(&'static [u8], &'static str),
    /// ISO base media file with an `mp4` brand.
    Mp4,
    /// No binary control bytes after leading whitespace.
    Text,
}

impl Signature {
    fn matches(&self, data: &[u8], first_non_ws: usize) -> Option<&'static str> {
        match self {
            Signature::Html(tag) => {
                let data = &data[first_non_ws..];
                if data.len() < tag.len() + 1 {
                    return None;
                }
                for (i, expected) in tag.iter().enumerate() {
                    let mut actual = data[i];
                    if expected.is_ascii_uppercase() {
                        actual &= 0xDF;
                    }
                    if actual != *expected {
                        return None;
                    }
                }
                is_tag_terminator(data[tag.len()]).then_some("text/html; charset=utf-8")
            }
            Signature::Masked {
                mask,
                pattern,
                skip_ws,
                ty,
            } => {
                let data = if *skip_ws { &data[first_non_ws..] } else { data };
                if data.len() < pattern.len() {
                    return None;
                }
                pattern
                    .iter()
                    .zip(mask.iter())
                    .zip(data.iter())
                    .all(|((p, m), d)| d & m == *p)
                    .then_some(*ty)
            }
            Signature::Exact(prefix, ty) => data.starts_with(prefix).then_some(*ty),
            Signature::Mp4 => sniff_mp4(data).then_some("video/mp4"),
            Signature::Text => data[first_non_ws..]
                .iter()
                .all(|b| !is_binary_byte(*b))
                .then_some(TEXT_PLAIN_UTF8),
        }
    }
}

fn is_binary_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}

fn sniff_mp4(data: &[u8]) -> bool {
    if data.len() < 12 {
        return false;
    }
    let box_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if data.len() < box_size || box_size % 4 != 0 {
        return false;
    }
    if &data[4..8] != b"ftyp" {
        return false;
    }
    let mut start = 8;
    while start < box_size {
        // bytes 12..16 hold the minor version, not a brand
        if start != 12 && &data[start..start + 3] == b"mp4" {
            return true;
        }
        start += 4;
    }
    false
}

const SIGNATURES: &[Signature] = &[
    Signature::Html(b"<!DOCTYPE HTML"),
    Signature::Html(b"<HTML"),
    Signature::Html(b"<HEAD"),
    Signature::Html(b"<SCRIPT"),
    Signature::Html(b"<IFRAME"),
    Signature::Html(b"<H1"),
    Signature::Html(b"<DIV"),
    Signature::Html(b"<FONT"),
    Signature::Html(b"<TABLE"),
    Signature::Html(b"<A"),
    Signature::Html(b"<STYLE"),
    Signature::Html(b"<TITLE"),
    Signature::Html(b"<B"),
    Signature::Html(b"<BODY"),
    Signature::Html(b"<BR"),
    Signature::Html(b"<P"),
    Signature::Html(b"<!--"),
    Signature::Masked {
        mask: b"\xFF\xFF\xFF\xFF\xFF",
        pattern: b"<?xml",
        skip_ws: true,
        ty: "text/xml; charset=utf-8",
    },
    Signature::Exact(b"%PDF-", "application/pdf"),
    Signature::Exact(b"%!PS-Adobe-", "application/postscript"),
    // Byte order marks
    Signature::Masked {
        mask: b"\xFF\xFF\x00\x00",
        pattern: b"\xFE\xFF\x00\x00",
        skip_ws: false,
        ty: "text/plain; charset=utf-16be",
    },
    Signature::Masked {
        mask: b"\xFF\xFF\x00\x00",
        pattern: b"\xFF\xFE\x00\x00",
        skip_ws: false,
        ty: "text/plain; charset=utf-16le",
    },
    Signature::Masked {
        mask: b"\xFF\xFF\xFF\x00",
        pattern: b"\xEF\xBB\xBF\x00",
        skip_ws: false,
        ty: TEXT_PLAIN_UTF8,
    },
    // Images
    Signature::Exact(b"\x00\x00\x01\x00", "image/x-icon"),
    Signature::Exact(b"\x00\x00\x02\x00", "image/x-icon"),
    Signature::Exact(b"BM", "image/bmp"),
    Signature::Exact(b"GIF87a", "image/gif"),
    Signature::Exact(b"GIF89a", "image/gif"),
    Signature::Masked {
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF\xFF\xFF",
        pattern: b"RIFF\x00\x00\x00\x00WEBPVP",
        skip_ws: false,
        ty: "image/webp",
    },
    Signature::Exact(b"\x89PNG\x0D\x0A\x1A\x0A", "image/png"),
    Signature::Exact(b"\xFF\xD8\xFF", "image/jpeg"),
    // Audio and video
    Signature::Masked {
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        pattern: b"FORM\x00\x00\x00\x00AIFF",
        skip_ws: false,
        ty: "audio/aiff",
    },
    Signature::Exact(b"ID3", "audio/mpeg"),
    Signature::Exact(b"OggS\x00", "application/ogg"),
    Signature::Exact(b"MThd\x00\x00\x00\x06", "audio/midi"),
    Signature::Masked {
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        pattern: b"RIFF\x00\x00\x00\x00AVI ",
        skip_ws: false,
        ty: "video/avi",
    },
    Signature::Masked {
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        pattern: b"RIFF\x00\x00\x00\x00WAVE",
        skip_ws: false,
        ty: "audio/wave",
    },
    Signature::Mp4,
    Signature::Exact(b"\x1A\x45\xDF\xA3", "video/webm"),
    // Fonts
    Signature::Exact(b"\x00\x01\x00\x00", "font/ttf"),
    Signature::Exact(b"OTTO", "font/otf"),
    Signature::Exact(b"ttcf", "font/collection"),
    Signature::Exact(b"wOFF", "font/woff"),
    Signature::Exact(b"wOF2", "font/woff2"),
    // Archives
    Signature::Exact(b"\x1F\x8B\x08", "application/x-gzip"),
    Signature::Exact(b"PK\x03\x04", "application/zip"),
    Signature::Exact(b"Rar!\x1A\x07\x00", "application/x-rar-compressed"),
    Signature::Exact(b"Rar!\x1A\x07\x01\x00", "application/x-rar-compressed"),
    Signature::Exact(b"\x00\x61\x73\x6D", "application/wasm"),
    Signature::Text,
];
