//! The fixed-size header and footer framing of an hour file.
//!
//! External tooling reads these files, so the layout is byte-exact and
//! little-endian throughout.

use snafu::{Snafu, ensure};

use crate::block::Compression;

pub const FILE_EXTENSION: &str = "rpk";

pub const HEADER_LEN: usize = 77;
pub const FOOTER_LEN: usize = 324;

pub const HEADER_MAGIC: &[u8; 8] = b"RPKBLOCK";
pub const FOOTER_MAGIC: &[u8; 8] = b"RPKEND\0\0";

pub const FORMAT_VERSION: &str = "1";
pub const ENCODING: &str = "json";

const VERSION_FIELD_LEN: usize = 8;
const COMPRESSION_FIELD_LEN: usize = 16;
const ENCODING_FIELD_LEN: usize = 16;
const HEADER_RESERVED_LEN: usize = 16;
const CHECKSUM_FIELD_LEN: usize = 256;
const FOOTER_RESERVED_LEN: usize = 48;

#[derive(Debug, Snafu)]
pub enum FormatError {
    #[snafu(display("file too short for a {section}: {len} bytes"))]
    Truncated { section: &'static str, len: usize },

    #[snafu(display("bad {section} magic"))]
    BadMagic { section: &'static str },

    #[snafu(display("unsupported format version {version:?}"))]
    UnsupportedVersion { version: String },

    #[snafu(display("unsupported compression {name:?}"))]
    UnsupportedCompression { name: String },

    #[snafu(display("unsupported encoding {name:?}"))]
    UnsupportedEncoding { name: String },

    #[snafu(display("index checksum mismatch: stored {stored}, computed {computed}"))]
    ChecksumMismatch { stored: String, computed: String },
}

fn put_ascii(buf: &mut Vec<u8>, value: &str, field_len: usize) {
    let bytes = value.as_bytes();
    debug_assert!(bytes.len() <= field_len);
    buf.extend_from_slice(bytes);
    buf.extend(std::iter::repeat_n(0u8, field_len - bytes.len()));
}

fn read_ascii(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// The 77-byte file header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub created_ns: u64,
    pub compression: Compression,
    pub block_size_limit: i32,
    pub checksums: bool,
}

impl FileHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(HEADER_MAGIC);
        put_ascii(&mut buf, FORMAT_VERSION, VERSION_FIELD_LEN);
        buf.extend_from_slice(&self.created_ns.to_le_bytes());
        put_ascii(&mut buf, self.compression.as_str(), COMPRESSION_FIELD_LEN);
        buf.extend_from_slice(&self.block_size_limit.to_le_bytes());
        put_ascii(&mut buf, ENCODING, ENCODING_FIELD_LEN);
        buf.push(u8::from(self.checksums));
        buf.extend(std::iter::repeat_n(0u8, HEADER_RESERVED_LEN));
        debug_assert_eq!(buf.len(), HEADER_LEN);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        ensure!(
            buf.len() >= HEADER_LEN,
            TruncatedSnafu {
                section: "header",
                len: buf.len()
            }
        );
        ensure!(
            &buf[0..8] == HEADER_MAGIC,
            BadMagicSnafu { section: "header" }
        );

        let version = read_ascii(&buf[8..16]);
        ensure!(
            version == FORMAT_VERSION,
            UnsupportedVersionSnafu { version }
        );

        let created_ns = u64::from_le_bytes(buf[16..24].try_into().expect("sliced to 8 bytes"));

        let compression_name = read_ascii(&buf[24..40]);
        let compression = Compression::from_str(&compression_name).ok_or(
            FormatError::UnsupportedCompression {
                name: compression_name,
            },
        )?;

        let block_size_limit =
            i32::from_le_bytes(buf[40..44].try_into().expect("sliced to 4 bytes"));

        let encoding = read_ascii(&buf[44..60]);
        ensure!(
            encoding == ENCODING,
            UnsupportedEncodingSnafu { name: encoding }
        );

        let checksums = buf[60] != 0;

        Ok(FileHeader {
            created_ns,
            compression,
            block_size_limit,
            checksums,
        })
    }
}

/// The 324-byte file footer, written last so its presence marks a complete
/// file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileFooter {
    pub index_offset: i64,
    pub index_length: i32,
    /// Lowercase hex crc32 of the index bytes; empty when checksums are
    /// disabled.
    pub checksum: String,
}

impl FileFooter {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_LEN);
        buf.extend_from_slice(&self.index_offset.to_le_bytes());
        buf.extend_from_slice(&self.index_length.to_le_bytes());
        put_ascii(&mut buf, &self.checksum, CHECKSUM_FIELD_LEN);
        buf.extend(std::iter::repeat_n(0u8, FOOTER_RESERVED_LEN));
        buf.extend_from_slice(FOOTER_MAGIC);
        debug_assert_eq!(buf.len(), FOOTER_LEN);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        ensure!(
            buf.len() >= FOOTER_LEN,
            TruncatedSnafu {
                section: "footer",
                len: buf.len()
            }
        );
        ensure!(
            &buf[FOOTER_LEN - 8..FOOTER_LEN] == FOOTER_MAGIC,
            BadMagicSnafu { section: "footer" }
        );

        let index_offset = i64::from_le_bytes(buf[0..8].try_into().expect("sliced to 8 bytes"));
        let index_length = i32::from_le_bytes(buf[8..12].try_into().expect("sliced to 4 bytes"));
        let checksum = read_ascii(&buf[12..12 + CHECKSUM_FIELD_LEN]);

        Ok(FileFooter {
            index_offset,
            index_length,
            checksum,
        })
    }

    /// Verifies the stored checksum against the index bytes. A missing stored
    /// checksum (checksums disabled at write time) always verifies.
    pub fn verify_checksum(&self, index_bytes: &[u8]) -> Result<(), FormatError> {
        if self.checksum.is_empty() {
            return Ok(());
        }
        let computed = index_checksum(index_bytes);
        ensure!(
            computed == self.checksum,
            ChecksumMismatchSnafu {
                stored: self.checksum.clone(),
                computed,
            }
        );
        Ok(())
    }
}

pub fn index_checksum(index_bytes: &[u8]) -> String {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(index_bytes);
    format!("{:08x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_exactly_77_bytes_and_round_trips() {
        let header = FileHeader {
            created_ns: 1_700_000_000_000_000_000,
            compression: Compression::Zstd,
            block_size_limit: 256 * 1024,
            checksums: true,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(FileHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn footer_is_exactly_324_bytes_and_round_trips() {
        let footer = FileFooter {
            index_offset: 123_456,
            index_length: 789,
            checksum: "deadbeef".to_string(),
        };
        let bytes = footer.encode();
        assert_eq!(bytes.len(), FOOTER_LEN);
        assert_eq!(FileFooter::decode(&bytes).unwrap(), footer);
    }

    #[test]
    fn header_magic_is_checked() {
        let mut bytes = FileHeader {
            created_ns: 0,
            compression: Compression::Gzip,
            block_size_limit: 1,
            checksums: false,
        }
        .encode();
        bytes[0] = b'X';
        assert!(matches!(
            FileHeader::decode(&bytes),
            Err(FormatError::BadMagic { .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn any_header_round_trips(
            created_ns in proptest::prelude::any::<u64>(),
            block_size_limit in 1i32..=i32::MAX,
            checksums in proptest::prelude::any::<bool>(),
            zstd in proptest::prelude::any::<bool>(),
        ) {
            let header = FileHeader {
                created_ns,
                compression: if zstd { Compression::Zstd } else { Compression::Gzip },
                block_size_limit,
                checksums,
            };
            let bytes = header.encode();
            proptest::prop_assert_eq!(bytes.len(), HEADER_LEN);
            proptest::prop_assert_eq!(FileHeader::decode(&bytes).unwrap(), header);
        }
    }

    #[test]
    fn checksum_verifies_and_detects_corruption() {
        let index = br#"{"formatVersion":"1"}"#;
        let footer = FileFooter {
            index_offset: 77,
            index_length: index.len() as i32,
            checksum: index_checksum(index),
        };
        assert!(footer.verify_checksum(index).is_ok());
        assert!(footer.verify_checksum(b"corrupted").is_err());
    }
}
