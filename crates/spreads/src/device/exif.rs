//! Minimal EXIF handling: the orientation tag in a JPEG APP1 segment.

use super::TargetPage;
use crate::error::DeviceError;

const SOI: [u8; 2] = [0xFF, 0xD8];
const APP1: u8 = 0xE1;
const SOS: u8 = 0xDA;
const EXIF_HEADER: &[u8; 6] = b"Exif\0\0";
const TAG_ORIENTATION: u16 = 0x0112;
const TYPE_SHORT: u16 = 3;

/// Orientation tag value for a device role: 6 for odd, 8 for even,
/// swapped when the rig is mounted upside-down.
pub fn orientation_for(target: TargetPage, upside_down: bool) -> u16 {
    match (target, upside_down) {
        (TargetPage::Odd, false) | (TargetPage::Even, true) => 6,
        (TargetPage::Even, false) | (TargetPage::Odd, true) => 8,
    }
}

fn orientation_segment(orientation: u16) -> Vec<u8> {
    let mut tiff = Vec::with_capacity(26);
    tiff.extend_from_slice(b"MM");
    tiff.extend_from_slice(&42u16.to_be_bytes());
    tiff.extend_from_slice(&8u32.to_be_bytes());
    // IFD0 with a single entry
    tiff.extend_from_slice(&1u16.to_be_bytes());
    tiff.extend_from_slice(&TAG_ORIENTATION.to_be_bytes());
    tiff.extend_from_slice(&TYPE_SHORT.to_be_bytes());
    tiff.extend_from_slice(&1u32.to_be_bytes());
    tiff.extend_from_slice(&orientation.to_be_bytes());
    tiff.extend_from_slice(&[0, 0]);
    tiff.extend_from_slice(&0u32.to_be_bytes());

    let length = (2 + EXIF_HEADER.len() + tiff.len()) as u16;
    let mut segment = vec![0xFF, APP1];
    segment.extend_from_slice(&length.to_be_bytes());
    segment.extend_from_slice(EXIF_HEADER);
    segment.extend_from_slice(&tiff);
    segment
}

struct Segment<'a> {
    marker: u8,
    /// Whole segment including marker and length bytes.
    bytes: &'a [u8],
}

impl Segment<'_> {
    fn payload(&self) -> &[u8] {
        self.bytes.get(4..).unwrap_or_default()
    }

    fn is_exif(&self) -> bool {
        self.marker == APP1 && self.payload().starts_with(EXIF_HEADER)
    }
}

/// Splits the header segments of a JPEG. Returns the segments before the
/// start-of-scan and the remaining bytes (scan data onwards).
fn split_segments(jpeg: &[u8]) -> Result<(Vec<Segment<'_>>, &[u8]), DeviceError> {
    if !jpeg.starts_with(&SOI) {
        return Err(DeviceError::Failed("not a JPEG image".to_string()));
    }
    let truncated = || DeviceError::Failed("truncated JPEG header".to_string());

    let mut segments = Vec::new();
    let mut pos = 2;
    loop {
        let marker_bytes = jpeg.get(pos..pos + 2).ok_or_else(truncated)?;
        if marker_bytes[0] != 0xFF {
            return Err(DeviceError::Failed(format!(
                "invalid JPEG marker at offset {}",
                pos
            )));
        }
        let marker = marker_bytes[1];
        if marker == SOS {
            return Ok((segments, &jpeg[pos..]));
        }
        let len_bytes = jpeg.get(pos + 2..pos + 4).ok_or_else(truncated)?;
        let length = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        let end = pos + 2 + length;
        let bytes = jpeg.get(pos..end).ok_or_else(truncated)?;
        segments.push(Segment { marker, bytes });
        pos = end;
    }
}

/// Returns a copy of `jpeg` whose only EXIF segment carries `orientation`.
/// Any existing EXIF segment is replaced.
pub fn set_orientation(jpeg: &[u8], orientation: u16) -> Result<Vec<u8>, DeviceError> {
    let (segments, rest) = split_segments(jpeg)?;
    let mut out = Vec::with_capacity(jpeg.len() + 40);
    out.extend_from_slice(&SOI);
    out.extend_from_slice(&orientation_segment(orientation));
    for segment in segments.iter().filter(|s| !s.is_exif()) {
        out.extend_from_slice(segment.bytes);
    }
    out.extend_from_slice(rest);
    Ok(out)
}

/// Reads the orientation tag, if the image has one.
pub fn read_orientation(jpeg: &[u8]) -> Option<u16> {
    let (segments, _) = split_segments(jpeg).ok()?;
    let segment = segments.iter().find(|s| s.is_exif())?;
    let tiff = segment.payload().get(EXIF_HEADER.len()..)?;

    let big_endian = match tiff.get(0..2)? {
        b"MM" => true,
        b"II" => false,
        _ => return None,
    };
    let read_u16 = |offset: usize| -> Option<u16> {
        let b = tiff.get(offset..offset + 2)?;
        Some(if big_endian {
            u16::from_be_bytes([b[0], b[1]])
        } else {
            u16::from_le_bytes([b[0], b[1]])
        })
    };
    let read_u32 = |offset: usize| -> Option<u32> {
        let b = tiff.get(offset..offset + 4)?;
        let arr = [b[0], b[1], b[2], b[3]];
        Some(if big_endian {
            u32::from_be_bytes(arr)
        } else {
            u32::from_le_bytes(arr)
        })
    };

    let ifd = read_u32(4)? as usize;
    let count = read_u16(ifd)? as usize;
    (0..count)
        .map(|i| ifd + 2 + i * 12)
        .find(|entry| read_u16(*entry) == Some(TAG_ORIENTATION))
        .and_then(|entry| read_u16(entry + 8))
}
