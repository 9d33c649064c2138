//! Text encodings for narrow and wide native strings.
//!
//! Byte oriented encodings are looked up by their WHATWG label through
//! `encoding_rs`. Two cases stay outside it: strict 7-bit ASCII, which the
//! WHATWG tables alias to windows-1252, and native endian UTF-16, whose
//! `encoding_rs` encoder produces UTF-8.

use crate::{AlienError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// 7-bit ASCII. Bytes above 0x7f are not text.
    Ascii,
    /// Native endian UTF-16 in a narrow string slot.
    Utf16,
    Named(&'static encoding_rs::Encoding),
}

/// What to do with characters the target encoding cannot represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingPolicy {
    #[default]
    Strict,
    /// Substitute `?` for unrepresentable characters and U+FFFD for
    /// undecodable input.
    Lossy,
}

const REPLACEMENT: u8 = b'?';

impl Default for Encoding {
    fn default() -> Self {
        Self::UTF8
    }
}

impl Encoding {
    pub const UTF8: Self = Self::Named(encoding_rs::UTF_8);

    pub fn from_name(name: &str) -> Option<Self> {
        let label = name.trim();
        match label.to_ascii_lowercase().as_str() {
            "ascii" | "us-ascii" => return Some(Self::Ascii),
            "utf-16" | "utf16" | "unicode" => return Some(Self::Utf16),
            _ => {}
        }
        let enc = encoding_rs::Encoding::for_label(label.as_bytes())?;
        // Encodings without an encoder of their own (UTF-16LE/BE and the
        // replacement encoding) cannot back a narrow string.
        (enc.output_encoding() == enc).then_some(Self::Named(enc))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ascii => "ascii",
            Self::Utf16 => "utf-16",
            Self::Named(enc) => enc.name(),
        }
    }

    /// Size of one code unit, which is also the size of the terminator.
    pub fn unit_size(self) -> usize {
        match self {
            Self::Utf16 => 2,
            _ => 1,
        }
    }

    /// Encodes `text` without a terminator.
    pub fn encode(self, text: &str, policy: EncodingPolicy) -> Result<Vec<u8>> {
        match self {
            Self::Ascii => encode_ascii(text, policy),
            Self::Utf16 => Ok(encode_utf16(text)),
            Self::Named(enc) => encode_named(enc, text, policy),
        }
    }

    /// Decodes `bytes`, which must not contain the terminator.
    pub fn decode(self, bytes: &[u8], policy: EncodingPolicy) -> Result<String> {
        match self {
            Self::Ascii => bytes
                .iter()
                .map(|&b| {
                    if b < 0x80 {
                        Ok(b as char)
                    } else if policy == EncodingPolicy::Lossy {
                        Ok(char::REPLACEMENT_CHARACTER)
                    } else {
                        Err(AlienError::encoding(self.name()))
                    }
                })
                .collect(),
            Self::Utf16 => decode_utf16(bytes, policy),
            Self::Named(enc) => {
                let (text, had_errors) = enc.decode_without_bom_handling(bytes);
                if had_errors && policy == EncodingPolicy::Strict {
                    return Err(AlienError::encoding(enc.name()));
                }
                Ok(text.into_owned())
            }
        }
    }
}

fn encode_ascii(text: &str, policy: EncodingPolicy) -> Result<Vec<u8>> {
    text.chars()
        .map(|c| {
            if c.is_ascii() {
                Ok(c as u8)
            } else if policy == EncodingPolicy::Lossy {
                Ok(REPLACEMENT)
            } else {
                Err(AlienError::encoding(Encoding::Ascii.name()))
            }
        })
        .collect()
}

fn encode_named(
    enc: &'static encoding_rs::Encoding,
    text: &str,
    policy: EncodingPolicy,
) -> Result<Vec<u8>> {
    let (bytes, _, unmappable) = enc.encode(text);
    if !unmappable {
        return Ok(bytes.into_owned());
    }
    if policy == EncodingPolicy::Strict {
        return Err(AlienError::encoding(enc.name()));
    }
    // encoding_rs writes numeric character references for unmappable
    // characters; substitute them one at a time instead.
    let mut out = Vec::with_capacity(text.len());
    let mut buf = [0u8; 4];
    for c in text.chars() {
        let (bytes, _, unmappable) = enc.encode(c.encode_utf8(&mut buf));
        if unmappable {
            out.push(REPLACEMENT);
        } else {
            out.extend_from_slice(&bytes);
        }
    }
    Ok(out)
}

pub fn encode_utf16(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_ne_bytes).collect()
}

pub fn decode_utf16(bytes: &[u8], policy: EncodingPolicy) -> Result<String> {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_ne_bytes([c[0], c[1]]))
        .collect();
    match policy {
        EncodingPolicy::Lossy => Ok(String::from_utf16_lossy(&units)),
        EncodingPolicy::Strict => String::from_utf16(&units)
            .map_err(|_| AlienError::encoding(Encoding::Utf16.name())),
    }
}

pub fn encode_utf32(text: &str) -> Vec<u8> {
    text.chars().flat_map(|c| (c as u32).to_ne_bytes()).collect()
}

pub fn decode_utf32(bytes: &[u8], policy: EncodingPolicy) -> Result<String> {
    bytes
        .chunks_exact(4)
        .map(|c| {
            let cp = u32::from_ne_bytes([c[0], c[1], c[2], c[3]]);
            match char::from_u32(cp) {
                Some(ch) => Ok(ch),
                None if policy == EncodingPolicy::Lossy => {
                    Ok(char::REPLACEMENT_CHARACTER)
                }
                None => Err(AlienError::encoding("utf-32")),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    fn named(label: &str) -> Encoding {
        Encoding::from_name(label).unwrap()
    }

    #[test]
    fn strict_policy_rejects_unrepresentable_text() {
        let err = Encoding::Ascii
            .encode("caf\u{e9}", EncodingPolicy::Strict)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidValue);
        let latin1 = named("iso8859-1");
        assert_eq!(latin1.encode("caf\u{e9}", EncodingPolicy::Strict).unwrap(), b"caf\xe9");
        assert!(latin1.encode("\u{3b1}", EncodingPolicy::Strict).is_err());
        assert!(Encoding::UTF8.decode(&[0xff], EncodingPolicy::Strict).is_err());
    }

    #[test]
    fn lossy_policy_substitutes() {
        let bytes = Encoding::Ascii
            .encode("caf\u{e9}", EncodingPolicy::Lossy)
            .unwrap();
        assert_eq!(bytes, b"caf?");
        let bytes = named("cp1252")
            .encode("\u{3b1}=\u{20ac}", EncodingPolicy::Lossy)
            .unwrap();
        assert_eq!(bytes, b"?=\x80", "one ? per character, no character references");
        let text = Encoding::UTF8
            .decode(&[b'a', 0xff], EncodingPolicy::Lossy)
            .unwrap();
        assert_eq!(text, "a\u{fffd}");
    }

    #[test]
    fn multibyte_encodings() {
        let sjis = named("shift_jis");
        let bytes = sjis.encode("\u{65e5}\u{672c}", EncodingPolicy::Strict).unwrap();
        assert_eq!(bytes, [0x93, 0xfa, 0x96, 0x7b]);
        assert_eq!(sjis.decode(&bytes, EncodingPolicy::Strict).unwrap(), "\u{65e5}\u{672c}");
        assert_eq!(sjis.unit_size(), 1);
        let koi = named("koi8-r");
        let bytes = koi.encode("\u{434}\u{430}", EncodingPolicy::Strict).unwrap();
        assert_eq!(koi.decode(&bytes, EncodingPolicy::Strict).unwrap(), "\u{434}\u{430}");
    }

    #[test]
    fn wide_encodings() {
        let text = "h\u{e9}\u{1f600}";
        let utf16 = encode_utf16(text);
        assert_eq!(utf16.len(), 8);
        assert_eq!(decode_utf16(&utf16, EncodingPolicy::Strict).unwrap(), text);
        assert_eq!(named("UTF-16").encode(text, EncodingPolicy::Strict).unwrap(), utf16);
        let utf32 = encode_utf32(text);
        assert_eq!(utf32.len(), 12);
        assert_eq!(decode_utf32(&utf32, EncodingPolicy::Strict).unwrap(), text);
    }

    #[test]
    fn names() {
        assert_eq!(named("ISO8859-1").name(), "windows-1252");
        assert_eq!(named("utf8"), Encoding::UTF8);
        assert_eq!(named("US-ASCII"), Encoding::Ascii);
        assert_eq!(named("sjis").name(), "Shift_JIS");
        assert_eq!(Encoding::from_name("klingon"), None);
        assert_eq!(Encoding::from_name("utf-16be"), None);
    }
}
