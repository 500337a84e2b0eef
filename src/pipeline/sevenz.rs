//! 7z header scan
//!
//! Parses the signature header and the metadata block to recover entry
//! names, sizes, and packed-data offsets. Only Copy-codec (uncompressed)
//! archives are mappable onto segment byte ranges; compressed or encoded
//! headers fail the job with `Validation`.

use crate::error::{Error, Result};
use crate::types::ByteRange;

use super::volume::VolumeReader;

/// 7z signature magic
const SEVENZ_MAGIC: &[u8; 6] = b"7z\xbc\xaf\x27\x1c";

/// Signature header size (magic + version + crc + next-header locator)
const SIG_HEADER_SIZE: u64 = 32;

/// Metadata blocks larger than this are rejected rather than fetched
const MAX_HEADER_SIZE: u64 = 8 * 1024 * 1024;

// Property ids of the 7z metadata grammar
const K_END: u64 = 0x00;
const K_HEADER: u64 = 0x01;
const K_MAIN_STREAMS_INFO: u64 = 0x04;
const K_FILES_INFO: u64 = 0x05;
const K_PACK_INFO: u64 = 0x06;
const K_UNPACK_INFO: u64 = 0x07;
const K_SUBSTREAMS_INFO: u64 = 0x08;
const K_SIZE: u64 = 0x09;
const K_CRC: u64 = 0x0a;
const K_FOLDER: u64 = 0x0b;
const K_CODERS_UNPACK_SIZE: u64 = 0x0c;
const K_NUM_UNPACK_STREAM: u64 = 0x0d;
const K_EMPTY_STREAM: u64 = 0x0e;
const K_NAMES: u64 = 0x11;
const K_ENCODED_HEADER: u64 = 0x17;

/// One entry recovered from a 7z archive
#[derive(Clone, Debug)]
pub(crate) struct SevenZipEntry {
    /// Entry path inside the archive
    pub name: String,
    /// Unpacked size (equals packed size for Copy)
    pub size: u64,
    /// Data location within the (concatenated) archive bytes
    pub data_range: ByteRange,
}

/// Scan a 7z archive's headers and produce its entries
pub(crate) async fn scan_archive(reader: &mut VolumeReader<'_>) -> Result<Vec<SevenZipEntry>> {
    let sig = reader.read_at_most(0, SIG_HEADER_SIZE as usize).await?;
    if sig.len() < SIG_HEADER_SIZE as usize || sig[..6] != SEVENZ_MAGIC[..] {
        return Err(Error::Validation("not a 7z archive".into()));
    }

    let next_header_offset = u64::from_le_bytes(
        sig[12..20]
            .try_into()
            .unwrap_or_else(|_| unreachable!("length checked")),
    );
    let next_header_size = u64::from_le_bytes(
        sig[20..28]
            .try_into()
            .unwrap_or_else(|_| unreachable!("length checked")),
    );
    if next_header_size == 0 {
        return Ok(Vec::new());
    }
    if next_header_size > MAX_HEADER_SIZE {
        return Err(Error::Validation("7z metadata block too large".into()));
    }

    let header = reader
        .read_at(
            SIG_HEADER_SIZE + next_header_offset,
            next_header_size as usize,
        )
        .await?;
    parse_header(&header)
}

fn parse_header(data: &[u8]) -> Result<Vec<SevenZipEntry>> {
    let mut r = Cursor::new(data);
    match r.number()? {
        K_HEADER => {}
        K_ENCODED_HEADER => {
            return Err(Error::Validation(
                "7z archive has a compressed metadata block".into(),
            ));
        }
        other => {
            return Err(Error::Validation(format!(
                "unexpected 7z property id {other:#x}"
            )));
        }
    }

    let mut pack_pos = 0u64;
    let mut pack_sizes: Vec<u64> = Vec::new();
    let mut num_folders = 0usize;
    let mut all_copy = true;
    let mut names: Vec<String> = Vec::new();
    let mut empty_stream: Vec<bool> = Vec::new();

    loop {
        match r.number()? {
            K_END => break,
            K_MAIN_STREAMS_INFO => loop {
                match r.number()? {
                    K_END => break,
                    K_PACK_INFO => {
                        pack_pos = r.number()?;
                        let num_pack = r.number()? as usize;
                        if num_pack > 4096 {
                            return Err(Error::Validation("7z pack stream count".into()));
                        }
                        loop {
                            match r.number()? {
                                K_END => break,
                                K_SIZE => {
                                    pack_sizes = (0..num_pack)
                                        .map(|_| r.number())
                                        .collect::<Result<_>>()?;
                                }
                                K_CRC => r.skip_crc(num_pack)?,
                                other => {
                                    return Err(Error::Validation(format!(
                                        "unexpected id {other:#x} in pack info"
                                    )));
                                }
                            }
                        }
                    }
                    K_UNPACK_INFO => {
                        if r.number()? != K_FOLDER {
                            return Err(Error::Validation("7z unpack info malformed".into()));
                        }
                        num_folders = r.number()? as usize;
                        if num_folders > 4096 {
                            return Err(Error::Validation("7z folder count".into()));
                        }
                        let external = r.u8()?;
                        if external != 0 {
                            return Err(Error::Validation("external 7z folders".into()));
                        }
                        for _ in 0..num_folders {
                            all_copy &= parse_folder_is_copy(&mut r)?;
                        }
                        loop {
                            match r.number()? {
                                K_END => break,
                                K_CODERS_UNPACK_SIZE => {
                                    // One size per folder out-stream; Copy
                                    // folders have exactly one
                                    for _ in 0..num_folders {
                                        r.number()?;
                                    }
                                }
                                K_CRC => r.skip_crc(num_folders)?,
                                other => {
                                    return Err(Error::Validation(format!(
                                        "unexpected id {other:#x} in unpack info"
                                    )));
                                }
                            }
                        }
                    }
                    K_SUBSTREAMS_INFO => loop {
                        match r.number()? {
                            K_END => break,
                            K_NUM_UNPACK_STREAM => {
                                for _ in 0..num_folders {
                                    if r.number()? != 1 {
                                        return Err(Error::Validation(
                                            "solid 7z archives are not seekable".into(),
                                        ));
                                    }
                                }
                            }
                            K_SIZE | K_CRC => {
                                return Err(Error::Validation(
                                    "7z substream layout is not supported".into(),
                                ));
                            }
                            other => {
                                return Err(Error::Validation(format!(
                                    "unexpected id {other:#x} in substreams info"
                                )));
                            }
                        }
                    },
                    other => {
                        return Err(Error::Validation(format!(
                            "unexpected id {other:#x} in streams info"
                        )));
                    }
                }
            },
            K_FILES_INFO => {
                let num_files = r.number()? as usize;
                if num_files > 65536 {
                    return Err(Error::Validation("7z file count".into()));
                }
                empty_stream = vec![false; num_files];
                loop {
                    let prop = r.number()?;
                    if prop == K_END {
                        break;
                    }
                    let size = r.number()? as usize;
                    let body = r.bytes(size)?;
                    match prop {
                        K_EMPTY_STREAM => {
                            for (i, flag) in empty_stream.iter_mut().enumerate() {
                                let byte = body
                                    .get(i / 8)
                                    .copied()
                                    .ok_or_else(|| {
                                        Error::Validation("7z empty-stream bits truncated".into())
                                    })?;
                                *flag = byte & (0x80 >> (i % 8)) != 0;
                            }
                        }
                        K_NAMES => {
                            let external = body
                                .first()
                                .copied()
                                .ok_or_else(|| Error::Validation("7z names empty".into()))?;
                            if external != 0 {
                                return Err(Error::Validation("external 7z names".into()));
                            }
                            names = parse_utf16_names(&body[1..]);
                        }
                        _ => {} // mtime, attributes, ...: not needed
                    }
                }
            }
            other => {
                return Err(Error::Validation(format!(
                    "unexpected top-level 7z id {other:#x}"
                )));
            }
        }
    }

    if !all_copy {
        return Err(Error::Validation(
            "compressed 7z entries are not seekable".into(),
        ));
    }

    // Non-empty files map to folders (and pack streams) in order
    let mut entries = Vec::new();
    let mut cursor = SIG_HEADER_SIZE + pack_pos;
    let mut stream_idx = 0usize;
    for (i, name) in names.iter().enumerate() {
        if empty_stream.get(i).copied().unwrap_or(false) {
            continue;
        }
        let size = *pack_sizes.get(stream_idx).ok_or_else(|| {
            Error::Validation("7z pack streams do not cover all files".into())
        })?;
        entries.push(SevenZipEntry {
            name: name.clone(),
            size,
            data_range: ByteRange::new(cursor, cursor + size),
        });
        cursor += size;
        stream_idx += 1;
    }

    Ok(entries)
}

/// Parse one folder description; true when it is a single Copy coder
fn parse_folder_is_copy(r: &mut Cursor<'_>) -> Result<bool> {
    let num_coders = r.number()? as usize;
    if num_coders != 1 {
        return Ok(false);
    }
    let flags = r.u8()?;
    let id_size = (flags & 0x0f) as usize;
    let is_complex = flags & 0x10 != 0;
    let has_attrs = flags & 0x20 != 0;
    let coder_id = r.bytes(id_size)?;
    if is_complex {
        return Err(Error::Validation("complex 7z coders".into()));
    }
    if has_attrs {
        let props = r.number()? as usize;
        r.bytes(props)?;
    }
    // Copy codec id is the single byte 0x00
    Ok(coder_id == [0x00])
}

/// UTF-16LE names, NUL-terminated, back to back
fn parse_utf16_names(data: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut current: Vec<u16> = Vec::new();
    for pair in data.chunks_exact(2) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        if unit == 0 {
            names.push(String::from_utf16_lossy(&current));
            current.clear();
        } else {
            current.push(unit);
        }
    }
    names
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Error::Validation("truncated 7z header".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(Error::Validation("truncated 7z header".into()));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// 7z variable-width number: leading byte's high bits select width
    fn number(&mut self) -> Result<u64> {
        let first = self.u8()?;
        let mut mask = 0x80u8;
        let mut value = 0u64;
        for i in 0..8 {
            if first & mask == 0 {
                let high = (first & (mask.wrapping_sub(1))) as u64;
                return Ok(value | (high << (8 * i)));
            }
            value |= (self.u8()? as u64) << (8 * i);
            mask >>= 1;
        }
        Ok(value)
    }

    /// Skip an optional-CRC record for `count` items
    fn skip_crc(&mut self, count: usize) -> Result<()> {
        let all_defined = self.u8()?;
        let defined = if all_defined != 0 {
            count
        } else {
            let bits = self.bytes(count.div_ceil(8))?;
            bits.iter().map(|b| b.count_ones() as usize).sum()
        };
        self.bytes(defined * 4).map(|_| ())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn number_encode(v: u64) -> Vec<u8> {
        // Simple single-byte or two-byte forms are enough for test payloads
        if v < 0x80 {
            vec![v as u8]
        } else {
            assert!(v < 0x4000, "test encoder limited to 14 bits");
            vec![0x80 | (v >> 8) as u8, (v & 0xff) as u8]
        }
    }

    /// Build a minimal copy-codec 7z archive with the given named payloads
    pub(crate) fn build_sevenz(files: &[(&str, &[u8])]) -> Vec<u8> {
        // Metadata block
        let mut h = Vec::new();
        h.extend_from_slice(&number_encode(K_HEADER));

        h.extend_from_slice(&number_encode(K_MAIN_STREAMS_INFO));
        h.extend_from_slice(&number_encode(K_PACK_INFO));
        h.extend_from_slice(&number_encode(0)); // pack pos
        h.extend_from_slice(&number_encode(files.len() as u64));
        h.extend_from_slice(&number_encode(K_SIZE));
        for (_, data) in files {
            h.extend_from_slice(&number_encode(data.len() as u64));
        }
        h.extend_from_slice(&number_encode(K_END)); // end pack info
        h.extend_from_slice(&number_encode(K_UNPACK_INFO));
        h.extend_from_slice(&number_encode(K_FOLDER));
        h.extend_from_slice(&number_encode(files.len() as u64));
        h.push(0); // not external
        for _ in files {
            h.extend_from_slice(&number_encode(1)); // one coder
            h.push(0x01); // id size 1, simple, no attrs
            h.push(0x00); // Copy codec
        }
        h.extend_from_slice(&number_encode(K_CODERS_UNPACK_SIZE));
        for (_, data) in files {
            h.extend_from_slice(&number_encode(data.len() as u64));
        }
        h.extend_from_slice(&number_encode(K_END)); // end unpack info
        h.extend_from_slice(&number_encode(K_END)); // end streams info

        h.extend_from_slice(&number_encode(K_FILES_INFO));
        h.extend_from_slice(&number_encode(files.len() as u64));
        let mut names_body = vec![0u8]; // not external
        for (name, _) in files {
            for unit in name.encode_utf16() {
                names_body.extend_from_slice(&unit.to_le_bytes());
            }
            names_body.extend_from_slice(&0u16.to_le_bytes());
        }
        h.extend_from_slice(&number_encode(K_NAMES));
        h.extend_from_slice(&number_encode(names_body.len() as u64));
        h.extend_from_slice(&names_body);
        h.extend_from_slice(&number_encode(K_END)); // end files info
        h.extend_from_slice(&number_encode(K_END)); // end header

        // Assemble: signature header, packed data, metadata
        let packed: Vec<u8> = files.iter().flat_map(|(_, d)| d.iter().copied()).collect();
        let mut out = Vec::new();
        out.extend_from_slice(SEVENZ_MAGIC);
        out.extend_from_slice(&[0x00, 0x04]); // version
        out.extend_from_slice(&[0u8; 4]); // start header crc (unchecked)
        out.extend_from_slice(&(packed.len() as u64).to_le_bytes()); // next header offset
        out.extend_from_slice(&(h.len() as u64).to_le_bytes()); // next header size
        out.extend_from_slice(&[0u8; 4]); // next header crc (unchecked)
        out.extend_from_slice(&packed);
        out.extend_from_slice(&h);
        out
    }

    #[test]
    fn parse_minimal_copy_archive() {
        let a = b"first payload".as_slice();
        let b = b"second payload, longer".as_slice();
        let archive = build_sevenz(&[("a.mkv", a), ("b.nfo", b)]);

        // Cut the metadata block out the way scan_archive would
        let next_offset = u64::from_le_bytes(archive[12..20].try_into().unwrap());
        let next_size = u64::from_le_bytes(archive[20..28].try_into().unwrap());
        let start = (SIG_HEADER_SIZE + next_offset) as usize;
        let header = &archive[start..start + next_size as usize];

        let entries = parse_header(header).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.mkv");
        assert_eq!(entries[0].size, a.len() as u64);
        assert_eq!(entries[1].name, "b.nfo");

        // Ranges point at the payloads
        let r0 = &entries[0].data_range;
        assert_eq!(
            &archive[r0.start as usize..r0.end as usize],
            a,
            "first entry range"
        );
        let r1 = &entries[1].data_range;
        assert_eq!(&archive[r1.start as usize..r1.end as usize], b);
    }

    #[test]
    fn encoded_header_is_rejected() {
        let header = [0x17u8]; // kEncodedHeader
        assert!(matches!(
            parse_header(&header),
            Err(Error::Validation(msg)) if msg.contains("compressed metadata")
        ));
    }

    #[test]
    fn number_decoding_widths() {
        let mut c = Cursor::new(&[0x7f]);
        assert_eq!(c.number().unwrap(), 0x7f);

        // Two-byte form: 0x80 | high, low
        let mut c = Cursor::new(&[0x81, 0x00]);
        assert_eq!(c.number().unwrap(), 0x100);

        // Full 8-byte form
        let mut bytes = vec![0xff];
        bytes.extend_from_slice(&0x0123_4567_89ab_cdefu64.to_le_bytes());
        let mut c = Cursor::new(&bytes);
        assert_eq!(c.number().unwrap(), 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn utf16_names_split_on_nul() {
        let mut body = Vec::new();
        for name in ["x.bin", "y.bin"] {
            for u in name.encode_utf16() {
                body.extend_from_slice(&u.to_le_bytes());
            }
            body.extend_from_slice(&0u16.to_le_bytes());
        }
        assert_eq!(parse_utf16_names(&body), vec!["x.bin", "y.bin"]);
    }
}
