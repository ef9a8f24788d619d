//! Raw tar header codec.
//!
//! A tar archive is a sequence of 512-byte blocks. Each member starts with a
//! header block, followed by its content padded up to the next block
//! boundary. Two all-zero blocks terminate the archive.
//!
//! ```rust
//! use tar_unarchive::tar::{TarHeader, BLOCK_SIZE};
//!
//! let data = std::fs::read("testdata/test.tar").unwrap();
//! let mut block = [0u8; BLOCK_SIZE];
//! block.copy_from_slice(&data[..BLOCK_SIZE]);
//!
//! let header = TarHeader::from_bytes(&block).unwrap();
//! assert_eq!(header.full_name(), "test.txt");
//! assert_eq!(header.size, 33);
//! assert!(header.verify_checksum(&block));
//! ```

use std::ops::Range;

use crate::error::{Error, Result};

/// Size of a header block and the unit all content is padded to.
pub const BLOCK_SIZE: usize = 512;

pub const TYPE_REGULAR: u8 = b'0';
pub const TYPE_REGULAR_OLD: u8 = 0;
pub const TYPE_HARDLINK: u8 = b'1';
pub const TYPE_SYMLINK: u8 = b'2';
pub const TYPE_DIRECTORY: u8 = b'5';
pub const TYPE_CONTIGUOUS: u8 = b'7';
pub const TYPE_GNU_LONGNAME: u8 = b'L';
pub const TYPE_GNU_LONGLINK: u8 = b'K';
pub const TYPE_PAX_EXTENDED: u8 = b'x';
pub const TYPE_PAX_GLOBAL: u8 = b'g';

// Tar header struct
#[derive(Debug, Clone)]
pub struct TarHeader {
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: u64,
    pub checksum: u32,
    pub typeflag: u8,
    pub linkname: String,
    pub magic: String,
    pub version: String,
    pub uname: String,
    pub gname: String,
    pub devmajor: u32,
    pub devminor: u32,
    pub prefix: String,
}

impl TarHeader {
    /// Parse a TarHeader from a 512-byte block
    pub fn from_bytes(data: &[u8; BLOCK_SIZE]) -> Result<Self> {
        parse_tar_header(data)
    }

    /// Verify the checksum of the header
    /// Returns true if the checksum is valid
    pub fn verify_checksum(&self, data: &[u8]) -> bool {
        let (unsigned, signed) = calc_checksums(data);
        unsigned == self.checksum || signed == self.checksum as i64
    }

    /// POSIX ustar header (`"ustar\0"` magic).
    pub fn is_ustar(&self) -> bool {
        self.magic == "ustar"
    }

    /// Old GNU header (`"ustar "` magic); the prefix area holds other data.
    pub fn is_gnu(&self) -> bool {
        self.magic == "ustar "
    }

    /// The member name, with the ustar `prefix` field joined in front.
    pub fn full_name(&self) -> String {
        if self.is_ustar() && !self.prefix.is_empty() {
            format!("{}/{}", self.prefix, self.name)
        } else {
            self.name.clone()
        }
    }

    /// Number of padding bytes that follow `size` bytes of content.
    pub fn padding(&self) -> u64 {
        padding_for(self.size)
    }
}

/// Bytes needed to round `size` up to the next block boundary.
pub fn padding_for(size: u64) -> u64 {
    let block = BLOCK_SIZE as u64;
    (block - size % block) % block
}

/// Check if a block is empty (all zeros)
pub fn is_empty_block(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

// Text fields end at the first NUL; the rest of the field is ignored.
fn read_tar_str(data: &[u8], range: Range<usize>) -> String {
    let field = &data[range];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn read_tar_num(data: &[u8], range: Range<usize>, field: &str) -> Result<u64> {
    let bytes = &data[range.clone()];

    // GNU base-256: high bit set, remaining bits big-endian
    if bytes[0] & 0x80 != 0 {
        if bytes[0] & 0x40 != 0 {
            return Err(Error::corrupt(format!("negative {field} field")));
        }
        let mut value = u64::from(bytes[0] & 0x3f);
        for &b in &bytes[1..] {
            value = value
                .checked_mul(256)
                .and_then(|v| v.checked_add(u64::from(b)))
                .ok_or_else(|| Error::corrupt(format!("{field} field overflows")))?;
        }
        return Ok(value);
    }

    let s = read_tar_str(data, range);
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(s, 8).map_err(|_| Error::corrupt(format!("invalid {field} field {s:?}")))
}

fn read_tar_u32(data: &[u8], range: Range<usize>, field: &str) -> Result<u32> {
    let value = read_tar_num(data, range, field)?;
    u32::try_from(value).map_err(|_| Error::corrupt(format!("{field} field out of range")))
}

// uid, gid, mtime and device numbers are not needed to lay files out on
// disk, so a garbled value degrades to zero rather than failing the archive.
fn read_tar_lenient(data: &[u8], range: Range<usize>) -> u64 {
    read_tar_num(data, range, "").unwrap_or(0)
}

fn read_tar_lenient_u32(data: &[u8], range: Range<usize>) -> u32 {
    u32::try_from(read_tar_lenient(data, range)).unwrap_or(0)
}

fn parse_tar_header(data: &[u8; BLOCK_SIZE]) -> Result<TarHeader> {
    let checksum = read_tar_u32(data, 148..156, "checksum")?;
    let header = TarHeader {
        name: read_tar_str(data, 0..100),
        mode: read_tar_u32(data, 100..108, "mode")?,
        uid: read_tar_lenient_u32(data, 108..116),
        gid: read_tar_lenient_u32(data, 116..124),
        size: read_tar_num(data, 124..136, "size")?,
        mtime: read_tar_lenient(data, 136..148),
        checksum,
        typeflag: data[156],
        linkname: read_tar_str(data, 157..257),
        magic: read_tar_str(data, 257..263),
        version: read_tar_str(data, 263..265),
        uname: read_tar_str(data, 265..297),
        gname: read_tar_str(data, 297..329),
        devmajor: read_tar_lenient_u32(data, 329..337),
        devminor: read_tar_lenient_u32(data, 337..345),
        prefix: read_tar_str(data, 345..500),
    };
    if !header.verify_checksum(data) {
        return Err(Error::corrupt(format!(
            "header checksum mismatch for '{}'",
            header.full_name()
        )));
    }
    Ok(header)
}

/// Calc checksum of the header bytes, with the checksum field read as spaces
pub fn calc_checksum(data: &[u8]) -> u32 {
    calc_checksums(data).0
}

// Some historic writers summed the header as signed chars.
fn calc_checksums(data: &[u8]) -> (u32, i64) {
    if data.len() < BLOCK_SIZE {
        return (0, 0);
    }
    let mut unsigned: u32 = 0;
    let mut signed: i64 = 0;
    for (i, &b) in data.iter().take(BLOCK_SIZE).enumerate() {
        let b = if (148..156).contains(&i) { b' ' } else { b };
        unsigned += u32::from(b);
        signed += i64::from(b as i8);
    }
    (unsigned, signed)
}
