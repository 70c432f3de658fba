//! Minimal EXIF reader for caption metadata.
//!
//! Pulls four tags out of a JPEG's APP1 segment (or a bare TIFF file):
//! - ImageDescription (0x010E) and XPTitle (0x9C9B) as `title`
//! - XPComment (0x9C9C) and UserComment (0x9286, Exif sub-IFD) as `comment`
//!
//! The XP* tags are written by Windows Explorer as UTF-16LE byte arrays
//! regardless of the file's byte order. Anything unparseable yields no
//! metadata rather than an error.

use crate::contract::Metadata;

const TAG_IMAGE_DESCRIPTION: u16 = 0x010E;
const TAG_EXIF_IFD: u16 = 0x8769;
const TAG_USER_COMMENT: u16 = 0x9286;
const TAG_XP_TITLE: u16 = 0x9C9B;
const TAG_XP_COMMENT: u16 = 0x9C9C;

const EXIF_HEADER: &[u8] = b"Exif\0\0";

/// Tag values found in an image, before they are merged into metadata.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExifFields {
    pub image_description: Option<String>,
    pub xp_title: Option<String>,
    pub xp_comment: Option<String>,
    pub user_comment: Option<String>,
}

impl ExifFields {
    pub fn title(&self) -> Option<&str> {
        self.image_description
            .as_deref()
            .or(self.xp_title.as_deref())
    }

    pub fn comment(&self) -> Option<&str> {
        self.xp_comment.as_deref().or(self.user_comment.as_deref())
    }

    /// `title` / `comment` entries for whatever was found.
    pub fn into_metadata(self) -> Metadata {
        let mut metadata = Metadata::new();
        if let Some(title) = self.title() {
            metadata.insert("title".to_string(), title.to_string());
        }
        if let Some(comment) = self.comment() {
            metadata.insert("comment".to_string(), comment.to_string());
        }
        metadata
    }
}

/// Read EXIF fields from JPEG or TIFF bytes.
pub fn read_exif(data: &[u8]) -> ExifFields {
    if data.starts_with(&[0xFF, 0xD8]) {
        return find_jpeg_app1_exif(data)
            .map(parse_tiff)
            .unwrap_or_default();
    }
    if data.starts_with(b"II*\0") || data.starts_with(b"MM\0*") {
        return parse_tiff(data);
    }
    ExifFields::default()
}

/// Locate the TIFF block inside a JPEG's `Exif\0\0` APP1 segment.
fn find_jpeg_app1_exif(data: &[u8]) -> Option<&[u8]> {
    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xFF {
            return None;
        }
        let marker = data[pos + 1];
        match marker {
            // fill byte
            0xFF => {
                pos += 1;
                continue;
            }
            // standalone markers carry no length
            0x01 | 0xD0..=0xD8 => {
                pos += 2;
                continue;
            }
            // start of scan / end of image: no metadata after this
            0xDA | 0xD9 => return None,
            _ => {}
        }

        let length = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        if length < 2 {
            return None;
        }
        let start = pos + 4;
        let end = pos + 2 + length;
        let segment = data.get(start..end)?;
        if marker == 0xE1 && segment.starts_with(EXIF_HEADER) {
            return Some(&segment[EXIF_HEADER.len()..]);
        }
        pos = end;
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

struct Tiff<'a> {
    data: &'a [u8],
    order: ByteOrder,
}

impl<'a> Tiff<'a> {
    fn u16_at(&self, pos: usize) -> Option<u16> {
        let b = self.data.get(pos..pos + 2)?;
        Some(match self.order {
            ByteOrder::Little => u16::from_le_bytes([b[0], b[1]]),
            ByteOrder::Big => u16::from_be_bytes([b[0], b[1]]),
        })
    }

    fn u32_at(&self, pos: usize) -> Option<u32> {
        let b = self.data.get(pos..pos + 4)?;
        Some(match self.order {
            ByteOrder::Little => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            ByteOrder::Big => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        })
    }

    /// Entries of the IFD at `offset` as (tag, raw value bytes).
    fn entries(&self, offset: usize) -> Vec<(u16, &'a [u8])> {
        let Some(count) = self.u16_at(offset) else {
            return Vec::new();
        };
        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let entry = offset + 2 + i * 12;
            let (Some(tag), Some(kind), Some(n)) = (
                self.u16_at(entry),
                self.u16_at(entry + 2),
                self.u32_at(entry + 4),
            ) else {
                break;
            };
            let Some(size) = type_size(kind).checked_mul(n as usize) else {
                continue;
            };
            let value_pos = if size <= 4 {
                entry + 8
            } else {
                match self.u32_at(entry + 8) {
                    Some(p) => p as usize,
                    None => continue,
                }
            };
            if let Some(value) = self.data.get(value_pos..value_pos.saturating_add(size)) {
                entries.push((tag, value));
            }
        }
        entries
    }
}

fn type_size(kind: u16) -> usize {
    match kind {
        1 | 2 | 6 | 7 => 1,
        3 | 8 => 2,
        4 | 9 | 11 => 4,
        5 | 10 | 12 => 8,
        _ => 0,
    }
}

fn parse_tiff(data: &[u8]) -> ExifFields {
    let order = match data.get(0..2) {
        Some(b"II") => ByteOrder::Little,
        Some(b"MM") => ByteOrder::Big,
        _ => return ExifFields::default(),
    };
    let tiff = Tiff { data, order };
    if tiff.u16_at(2) != Some(42) {
        return ExifFields::default();
    }
    let Some(ifd0) = tiff.u32_at(4) else {
        return ExifFields::default();
    };

    let mut fields = ExifFields::default();
    let mut exif_ifd = None;
    for (tag, value) in tiff.entries(ifd0 as usize) {
        match tag {
            TAG_IMAGE_DESCRIPTION => fields.image_description = decode_ascii(value),
            TAG_XP_TITLE => fields.xp_title = decode_utf16(value, ByteOrder::Little),
            TAG_XP_COMMENT => fields.xp_comment = decode_utf16(value, ByteOrder::Little),
            TAG_EXIF_IFD if value.len() == 4 => {
                exif_ifd = Tiff { data: value, order }.u32_at(0);
            }
            _ => {}
        }
    }

    if let Some(offset) = exif_ifd {
        for (tag, value) in tiff.entries(offset as usize) {
            if tag == TAG_USER_COMMENT {
                fields.user_comment = decode_user_comment(value, order);
            }
        }
    }
    fields
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn decode_ascii(value: &[u8]) -> Option<String> {
    let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
    non_empty(String::from_utf8_lossy(&value[..end]).into_owned())
}

fn decode_utf16(value: &[u8], order: ByteOrder) -> Option<String> {
    let units: Vec<u16> = value
        .chunks_exact(2)
        .map(|c| match order {
            ByteOrder::Little => u16::from_le_bytes([c[0], c[1]]),
            ByteOrder::Big => u16::from_be_bytes([c[0], c[1]]),
        })
        .take_while(|&u| u != 0)
        .collect();
    non_empty(String::from_utf16_lossy(&units))
}

/// UserComment starts with an 8-byte character code.
fn decode_user_comment(value: &[u8], order: ByteOrder) -> Option<String> {
    if value.len() < 8 {
        return None;
    }
    let (code, text) = value.split_at(8);
    match code {
        b"UNICODE\0" => decode_utf16(text, order),
        _ => decode_ascii(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serialise one little-endian IFD placed at `base`, with out-of-line
    /// values appended after it.
    fn ifd_le(entries: &[(u16, u16, Vec<u8>)], base: usize) -> Vec<u8> {
        let header_len = 2 + entries.len() * 12 + 4;
        let mut head = Vec::new();
        let mut tail = Vec::new();
        head.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        for (tag, kind, value) in entries {
            head.extend_from_slice(&tag.to_le_bytes());
            head.extend_from_slice(&kind.to_le_bytes());
            let count = (value.len() / type_size(*kind)) as u32;
            head.extend_from_slice(&count.to_le_bytes());
            if value.len() <= 4 {
                let mut inline = value.clone();
                inline.resize(4, 0);
                head.extend_from_slice(&inline);
            } else {
                let offset = (base + header_len + tail.len()) as u32;
                head.extend_from_slice(&offset.to_le_bytes());
                tail.extend_from_slice(value);
            }
        }
        head.extend_from_slice(&0u32.to_le_bytes());
        head.extend(tail);
        head
    }

    fn tiff_le(entries: &[(u16, u16, Vec<u8>)]) -> Vec<u8> {
        let mut out = b"II*\0".to_vec();
        out.extend_from_slice(&8u32.to_le_bytes());
        out.extend(ifd_le(entries, 8));
        out
    }

    fn wrap_jpeg(tiff: &[u8]) -> Vec<u8> {
        let mut out = vec![0xFF, 0xD8];
        // an unrelated APP0 segment first
        out.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x07]);
        out.extend_from_slice(b"JFIF\0");
        out.extend_from_slice(&[0xFF, 0xE1]);
        let len = (2 + EXIF_HEADER.len() + tiff.len()) as u16;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(EXIF_HEADER);
        out.extend_from_slice(tiff);
        out.extend_from_slice(&[0xFF, 0xD9]);
        out
    }

    fn utf16le(s: &str) -> Vec<u8> {
        let mut out: Vec<u8> = s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        out.extend_from_slice(&[0, 0]);
        out
    }

    #[test]
    fn reads_description_and_xp_comment_from_jpeg() {
        let tiff = tiff_le(&[
            (TAG_IMAGE_DESCRIPTION, 2, b"Sunset over the dunes\0".to_vec()),
            (TAG_XP_COMMENT, 1, utf16le("Golden hour, Texel")),
        ]);
        let fields = read_exif(&wrap_jpeg(&tiff));
        assert_eq!(fields.title(), Some("Sunset over the dunes"));
        assert_eq!(fields.comment(), Some("Golden hour, Texel"));

        let metadata = fields.into_metadata();
        assert_eq!(metadata.get("title").map(String::as_str), Some("Sunset over the dunes"));
    }

    #[test]
    fn xp_title_is_used_without_description() {
        let tiff = tiff_le(&[(TAG_XP_TITLE, 1, utf16le("Harbour"))]);
        assert_eq!(read_exif(&tiff).title(), Some("Harbour"));
    }

    #[test]
    fn user_comment_in_exif_sub_ifd() {
        // IFD0 holds one entry, so it is 18 bytes long and the sub-IFD starts at 26.
        let sub_ifd_offset = 8 + 18;
        let mut tiff = b"II*\0".to_vec();
        tiff.extend_from_slice(&8u32.to_le_bytes());
        tiff.extend(ifd_le(
            &[(TAG_EXIF_IFD, 4, (sub_ifd_offset as u32).to_le_bytes().to_vec())],
            8,
        ));
        assert_eq!(tiff.len(), sub_ifd_offset);
        tiff.extend(ifd_le(
            &[(TAG_USER_COMMENT, 7, b"ASCII\0\0\0from the camera".to_vec())],
            sub_ifd_offset,
        ));

        let fields = read_exif(&tiff);
        assert_eq!(fields.comment(), Some("from the camera"));
        assert_eq!(fields.title(), None);
    }

    #[test]
    fn garbage_yields_nothing() {
        assert_eq!(read_exif(b"not an image"), ExifFields::default());
        assert_eq!(read_exif(&[0xFF, 0xD8, 0xFF]), ExifFields::default());
        assert!(read_exif(&[0xFF, 0xD8, 0xFF, 0xD9]).into_metadata().is_empty());
    }

    #[test]
    fn blank_values_are_dropped() {
        let tiff = tiff_le(&[(TAG_IMAGE_DESCRIPTION, 2, b"    \0".to_vec())]);
        assert_eq!(read_exif(&tiff).title(), None);
    }
}
