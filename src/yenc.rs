//! yEnc prologue parsing and decoding
//!
//! A yEnc article body is a sequence of text lines: a `=ybegin` line (and a
//! `=ypart` line for multi-part posts), encoded data lines, and a `=yend`
//! trailer. The prologue alone yields `(part_offset, part_size, total_size)`,
//! which is what the first-segment probe and the range reader need before any
//! data byte is decoded.

use crate::error::{Error, Result};
use crate::types::YencHeader;

/// Parsed `=ybegin` line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ybegin {
    /// Declared decoded size of the whole file
    pub size: u64,
    /// Part number for multi-part posts
    pub part: Option<u32>,
    /// Poster-declared filename
    pub name: String,
}

/// Parsed `=ypart` line; offsets are 1-based inclusive per the yEnc spec
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ypart {
    /// First byte of this part within the file (1-based)
    pub begin: u64,
    /// Last byte of this part within the file (inclusive)
    pub end: u64,
}

/// Parsed `=yend` trailer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Yend {
    /// Decoded size of this part
    pub size: Option<u64>,
    /// CRC32 of this part's decoded bytes
    pub pcrc32: Option<u32>,
}

/// Parse a `=ybegin` line
pub fn parse_ybegin(line: &str) -> Result<Ybegin> {
    if !line.starts_with("=ybegin ") {
        return Err(Error::Protocol(format!("expected =ybegin, got: {line}")));
    }
    // name=... is always last and may contain spaces and '=' characters
    let (fields, name) = match line.find(" name=") {
        Some(pos) => (&line[..pos], line[pos + 6..].trim().to_string()),
        None => (line, String::new()),
    };
    let size = field_u64(fields, "size")
        .ok_or_else(|| Error::Protocol(format!("=ybegin missing size: {line}")))?;
    let part = field_u64(fields, "part").map(|p| p as u32);
    Ok(Ybegin { size, part, name })
}

/// Parse a `=ypart` line
pub fn parse_ypart(line: &str) -> Result<Ypart> {
    if !line.starts_with("=ypart ") {
        return Err(Error::Protocol(format!("expected =ypart, got: {line}")));
    }
    let begin = field_u64(line, "begin")
        .ok_or_else(|| Error::Protocol(format!("=ypart missing begin: {line}")))?;
    let end = field_u64(line, "end")
        .ok_or_else(|| Error::Protocol(format!("=ypart missing end: {line}")))?;
    if begin == 0 || end < begin {
        return Err(Error::Protocol(format!("=ypart range invalid: {line}")));
    }
    Ok(Ypart { begin, end })
}

/// Parse a `=yend` trailer line (lenient — a bad trailer never fails a read)
pub fn parse_yend(line: &str) -> Yend {
    Yend {
        size: field_u64(line, "size"),
        pcrc32: field_hex32(line, "pcrc32").or_else(|| field_hex32(line, "crc32")),
    }
}

/// Assemble a [`YencHeader`] from the prologue lines
///
/// Single-part posts carry no `=ypart`; their one part spans the whole file.
pub fn header_from_prologue(ybegin: &Ybegin, ypart: Option<&Ypart>) -> YencHeader {
    let (part_offset, part_size) = match ypart {
        Some(p) => (p.begin - 1, p.end - p.begin + 1),
        None => (0, ybegin.size),
    };
    YencHeader {
        file_name: ybegin.name.clone(),
        part_number: ybegin.part,
        part_offset,
        part_size,
        total_size: ybegin.size,
        crc32: None,
    }
}

/// Decode one yEnc data line into `out`
///
/// Handles `=` escapes and strips carriage returns; input must not include
/// the trailing newline.
pub fn decode_line(line: &[u8], out: &mut Vec<u8>) {
    let mut iter = line.iter().copied();
    while let Some(byte) = iter.next() {
        if byte == b'=' {
            if let Some(next) = iter.next() {
                out.push(next.wrapping_sub(64).wrapping_sub(42));
            }
        } else if byte != b'\r' {
            out.push(byte.wrapping_sub(42));
        }
    }
}

/// Decode a complete article body (prologue + data + trailer)
///
/// Convenience entry used by tests and the buffered stream path; the live
/// connection decodes incrementally as lines arrive.
pub fn decode_article(body: &[u8]) -> Result<(YencHeader, Vec<u8>)> {
    let mut lines = body.split(|&b| b == b'\n');

    let mut ybegin = None;
    let mut ypart = None;
    let mut decoded = Vec::with_capacity(body.len());
    let mut trailer = Yend::default();

    for line in lines.by_ref() {
        let line = strip_cr(line);
        if line.is_empty() && ybegin.is_none() {
            continue;
        }
        if line.starts_with(b"=ybegin ") {
            ybegin = Some(parse_ybegin(&String::from_utf8_lossy(line))?);
            continue;
        }
        if line.starts_with(b"=ypart ") {
            ypart = Some(parse_ypart(&String::from_utf8_lossy(line))?);
            continue;
        }
        if line.starts_with(b"=yend") {
            trailer = parse_yend(&String::from_utf8_lossy(line));
            break;
        }
        if ybegin.is_some() {
            decode_line(line, &mut decoded);
        }
    }

    let ybegin = ybegin.ok_or_else(|| Error::Protocol("article has no =ybegin line".into()))?;
    let mut header = header_from_prologue(&ybegin, ypart.as_ref());
    header.crc32 = trailer.pcrc32;

    if decoded.len() as u64 != header.part_size {
        return Err(Error::Protocol(format!(
            "decoded {} bytes, prologue declared {}",
            decoded.len(),
            header.part_size
        )));
    }
    Ok((header, decoded))
}

/// Encode bytes as a yEnc article body (prologue + data + trailer)
///
/// Test-support encoder used by the mock NNTP server and round-trip tests;
/// escapes the critical set (NUL, CR, LF, '=') and wraps at 128 columns.
pub fn encode_article(
    name: &str,
    total_size: u64,
    part: Option<(u32, u64, u64)>,
    data: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64 + 256);
    match part {
        Some((number, begin, end)) => {
            out.extend_from_slice(
                format!("=ybegin part={number} line=128 size={total_size} name={name}\r\n")
                    .as_bytes(),
            );
            out.extend_from_slice(format!("=ypart begin={begin} end={end}\r\n").as_bytes());
        }
        None => {
            out.extend_from_slice(
                format!("=ybegin line=128 size={total_size} name={name}\r\n").as_bytes(),
            );
        }
    }
    let mut col = 0;
    for &byte in data {
        let enc = byte.wrapping_add(42);
        if matches!(enc, 0x00 | 0x0a | 0x0d | b'=') {
            out.push(b'=');
            out.push(enc.wrapping_add(64));
            col += 2;
        } else {
            out.push(enc);
            col += 1;
        }
        if col >= 128 {
            out.extend_from_slice(b"\r\n");
            col = 0;
        }
    }
    if col > 0 {
        out.extend_from_slice(b"\r\n");
    }
    match part {
        Some((number, _, _)) => out.extend_from_slice(
            format!("=yend size={} part={number}\r\n", data.len()).as_bytes(),
        ),
        None => out.extend_from_slice(format!("=yend size={}\r\n", data.len()).as_bytes()),
    }
    out
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn field_u64(line: &str, key: &str) -> Option<u64> {
    let needle = format!("{key}=");
    for token in line.split_whitespace() {
        if let Some(value) = token.strip_prefix(&needle) {
            return value.parse().ok();
        }
    }
    None
}

fn field_hex32(line: &str, key: &str) -> Option<u32> {
    let needle = format!("{key}=");
    for token in line.split_whitespace() {
        if let Some(value) = token.strip_prefix(&needle) {
            return u32::from_str_radix(value, 16).ok();
        }
    }
    None
}
