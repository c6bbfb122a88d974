//! The bulk stream framing: ustar 512-byte blocks with the GNU long-name
//! extension for paths over 100 bytes.
//!
//! Only the entry types the engine moves exist here: regular files,
//! directories, and the long-name pseudo-entry. The block codec is pure;
//! the async sessions in `client`/`server` own the socket I/O.

use crate::errors::{Error, Result};

pub const BLOCK_SIZE: usize = 512;

/// GNU tar's magic name for a long-name pseudo-entry.
const LONG_NAME_NAME: &str = "././@LongLink";
const NAME_FIELD_LEN: usize = 100;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryKind {
    Regular,
    Directory,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EntryHeader {
    /// Tree-relative, `/`-rooted - the engine's usual path shape.
    pub path: String,
    pub size: u64,
    pub kind: EntryKind,
    pub mtime_secs: i64,
}

/// Bytes of zero padding that follow a `size`-byte body.
pub fn padding_for(size: u64) -> usize {
    match (size % BLOCK_SIZE as u64) as usize {
        0 => 0,
        rem => BLOCK_SIZE - rem,
    }
}

/// Encode a header, prepending a GNU long-name entry when the path
/// doesn't fit the 100-byte name field.
pub fn encode_entry(header: &EntryHeader) -> Vec<u8> {
    // Tar names directories with a trailing slash and no leading one.
    let mut name = header.path.trim_start_matches('/').to_owned();
    if header.kind == EntryKind::Directory && !name.ends_with('/') {
        name.push('/');
    }

    let mut out = Vec::with_capacity(BLOCK_SIZE * 2);
    if name.len() > NAME_FIELD_LEN {
        // The long-name entry's body is the full path, NUL-terminated.
        let payload_len = name.len() + 1;
        out.extend_from_slice(&pack_block(
            LONG_NAME_NAME,
            payload_len as u64,
            b'L',
            header.mtime_secs,
        ));
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.resize(out.len() + padding_for(payload_len as u64), 0);
        // The legacy name field still gets a (possibly mangled) prefix;
        // decoders use the long-name payload instead.
        let mut cut = NAME_FIELD_LEN;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }

    let typeflag = match header.kind {
        EntryKind::Regular => b'0',
        EntryKind::Directory => b'5',
    };
    out.extend_from_slice(&pack_block(&name, header.size, typeflag, header.mtime_secs));
    out
}

/// Two zero blocks end the stream.
pub fn end_of_stream() -> [u8; BLOCK_SIZE * 2] {
    [0; BLOCK_SIZE * 2]
}

fn pack_block(name: &str, size: u64, typeflag: u8, mtime_secs: i64) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];

    put_str(&mut block[0..100], name);
    put_octal(&mut block[100..108], 0o644); // mode
    put_octal(&mut block[108..116], 0); // uid
    put_octal(&mut block[116..124], 0); // gid
    put_octal12(&mut block[124..136], size);
    put_octal12(&mut block[136..148], mtime_secs.max(0) as u64);
    block[148..156].fill(b' '); // checksum placeholder
    block[156] = typeflag;
    // linkname [157..257] stays zero.
    put_str(&mut block[257..263], "ustar\0");
    block[263] = b'0';
    block[264] = b'0';
    // uname/gname/dev/prefix stay zero.

    let sum: u32 = block.iter().map(|&b| b as u32).sum();
    let chksum = format!("{:06o}\0 ", sum % 0o1000000);
    block[148..156].copy_from_slice(chksum.as_bytes());
    block
}

fn put_str(field: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
}

fn put_octal(field: &mut [u8], value: u64) {
    let s = format!("{value:07o}");
    put_str(field, &s);
}

fn put_octal12(field: &mut [u8], value: u64) {
    let s = format!("{value:011o}");
    put_str(field, &s);
}

/// One parsed block.
#[derive(Debug)]
enum Parsed {
    Zero,
    LongName { size: u64 },
    Entry(EntryHeader),
}

fn parse_block(block: &[u8; BLOCK_SIZE]) -> Result<Parsed> {
    if block.iter().all(|&b| b == 0) {
        return Ok(Parsed::Zero);
    }

    if block[257..262] != *b"ustar" {
        return Err(Error::content("tar block without ustar magic"));
    }

    let stored_sum = read_octal(&block[148..156])?;
    let computed: u64 = block
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { b' ' } else { b } as u64)
        .sum();
    if stored_sum != computed % 262144 {
        return Err(Error::content(format!(
            "tar checksum mismatch: stored {stored_sum}, computed {computed}"
        )));
    }

    let size = read_octal(&block[124..136])?;
    let typeflag = block[156];
    if typeflag == b'L' {
        return Ok(Parsed::LongName { size });
    }

    let kind = match typeflag {
        b'0' | 0 => EntryKind::Regular,
        b'5' => EntryKind::Directory,
        other => {
            return Err(Error::content(format!(
                "unsupported tar entry type {:?}",
                other as char
            )));
        }
    };
    let name = read_str(&block[0..100]);
    let mtime_secs = read_octal(&block[136..148])? as i64;
    Ok(Parsed::Entry(EntryHeader {
        path: normalize_name(&name, kind),
        size,
        kind,
        mtime_secs,
    }))
}

fn normalize_name(name: &str, kind: EntryKind) -> String {
    let trimmed = if kind == EntryKind::Directory {
        name.trim_end_matches('/')
    } else {
        name
    };
    format!("/{}", trimmed.trim_start_matches('/'))
}

fn read_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn read_octal(field: &[u8]) -> Result<u64> {
    let s = read_str(field);
    let s = s.trim_matches(|c: char| c == ' ' || c == '\0');
    if s.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(s, 8).map_err(|e| Error::content(format!("bad octal field {s:?}: {e}")))
}

/// What the stream needs next, as told by [`HeaderDecoder::decode_block`].
#[derive(Debug)]
pub enum Decoded {
    /// First of the two trailing zero blocks; the stream is done.
    End,
    /// A real entry; `size` bytes of body (plus padding) follow.
    Entry(EntryHeader),
    /// A long-name payload of this many bytes (plus padding) follows;
    /// hand it to [`HeaderDecoder::feed_long_name`].
    NeedLongName(u64),
}

/// Decodes header blocks, stitching GNU long names onto the entry that
/// follows them.
#[derive(Debug, Default)]
pub struct HeaderDecoder {
    pending_long_name: Option<String>,
}

impl HeaderDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode_block(&mut self, block: &[u8; BLOCK_SIZE]) -> Result<Decoded> {
        match parse_block(block)? {
            Parsed::Zero => Ok(Decoded::End),
            Parsed::LongName { size } => {
                if size == 0 || size > 4096 {
                    return Err(Error::content(format!("absurd long-name length {size}")));
                }
                Ok(Decoded::NeedLongName(size))
            }
            Parsed::Entry(mut header) => {
                if let Some(long) = self.pending_long_name.take() {
                    header.path = normalize_name(&long, header.kind);
                }
                Ok(Decoded::Entry(header))
            }
        }
    }

    pub fn feed_long_name(&mut self, payload: &[u8]) {
        self.pending_long_name = Some(read_str(payload));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Run encoded bytes back through the decoder.
    fn decode_stream(mut bytes: &[u8]) -> Vec<(EntryHeader, Vec<u8>)> {
        let mut decoder = HeaderDecoder::new();
        let mut entries = Vec::new();
        loop {
            let block: &[u8; BLOCK_SIZE] = bytes[..BLOCK_SIZE].try_into().unwrap();
            bytes = &bytes[BLOCK_SIZE..];
            match decoder.decode_block(block).unwrap() {
                Decoded::End => break,
                Decoded::NeedLongName(size) => {
                    let padded = size as usize + padding_for(size);
                    decoder.feed_long_name(&bytes[..size as usize]);
                    bytes = &bytes[padded..];
                }
                Decoded::Entry(header) => {
                    let size = header.size as usize;
                    let padded = size + padding_for(header.size);
                    let body = bytes[..size].to_vec();
                    bytes = &bytes[padded..];
                    entries.push((header, body));
                }
            }
        }
        entries
    }

    fn stream_of(entries: &[(&EntryHeader, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (header, body) in entries {
            out.extend_from_slice(&encode_entry(header));
            out.extend_from_slice(body);
            out.resize(out.len() + padding_for(body.len() as u64), 0);
        }
        out.extend_from_slice(&end_of_stream());
        out
    }

    #[test]
    fn round_trip() {
        let file = EntryHeader {
            path: "/docs/hello.txt".into(),
            size: 11,
            kind: EntryKind::Regular,
            mtime_secs: 1_400_000_000,
        };
        let dir = EntryHeader {
            path: "/docs".into(),
            size: 0,
            kind: EntryKind::Directory,
            mtime_secs: 1_400_000_000,
        };
        let stream = stream_of(&[(&dir, b"".as_slice()), (&file, b"hello world")]);
        // Everything is block-aligned.
        assert_eq!(stream.len() % BLOCK_SIZE, 0);

        let decoded = decode_stream(&stream);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].0, dir);
        assert_eq!(decoded[1].0, file);
        assert_eq!(decoded[1].1, b"hello world");
    }

    #[test]
    fn long_paths_take_the_gnu_detour() {
        let long_component = "x".repeat(60);
        let path = format!("/{long_component}/{long_component}/file.bin");
        assert!(path.len() > 100);
        let header = EntryHeader {
            path: path.clone(),
            size: 3,
            kind: EntryKind::Regular,
            mtime_secs: 0,
        };
        let encoded = encode_entry(&header);
        // Long-name header + payload block(s) + real header.
        assert!(encoded.len() >= 3 * BLOCK_SIZE);

        let stream = stream_of(&[(&header, b"abc")]);
        let decoded = decode_stream(&stream);
        assert_eq!(decoded[0].0.path, path);
        assert_eq!(decoded[0].1, b"abc");
    }

    #[test]
    fn corrupted_checksum_is_detected() {
        let header = EntryHeader {
            path: "/a".into(),
            size: 0,
            kind: EntryKind::Regular,
            mtime_secs: 0,
        };
        let mut bytes = encode_entry(&header);
        bytes[0] ^= 0xff;
        let block: &[u8; BLOCK_SIZE] = bytes[..BLOCK_SIZE].try_into().unwrap();
        let err = HeaderDecoder::new().decode_block(block).unwrap_err();
        assert_eq!(err.category(), "content");
    }

    #[test]
    fn padding_math() {
        assert_eq!(padding_for(0), 0);
        assert_eq!(padding_for(1), 511);
        assert_eq!(padding_for(512), 0);
        assert_eq!(padding_for(513), 511);
    }
}
