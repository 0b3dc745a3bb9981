//! dbheader reads and writes the 100-byte header of a database file.
//!
//! Only the fields this engine maintains are interpreted; the rest of the
//! header is written as zeroes and ignored on read.  The layout keeps the
//! offsets of the SQLite file format so the header region is recognizable
//! by other tooling.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("The magic bytes for this file are wrong.")]
    WrongMagic,
    #[error("The pagesize {0} is not supported (must be a power of two, at least 1024).")]
    UnsupportedPagesize(u32),
    #[error("The schema format number is not supported.")]
    UnsupportedSchema,
    #[error("Error reading file.")]
    ReadFailed,
    #[error("Error writing file.")]
    WriteFailed,
}

/// The byte length of the database file header.
pub const DB_HEADER_BYTES: usize = 100;

const MAGIC_STRING: &[u8] = b"SQLite format 3\0";
const SCHEMA_FORMAT_NUMBER: u32 = 4;

/// The fields of the database file header that this engine maintains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub page_size: u32,
    /// Incremented every time any page of the file is rewritten.
    pub change_counter: u32,
    /// The database size in pages.
    pub num_pages: u32,
    /// Bumped when the schema table changes.
    pub schema_version: u32,
}

impl FileHeader {
    pub fn new(page_size: u32) -> FileHeader {
        FileHeader {
            page_size,
            change_counter: 0,
            num_pages: 1,
            schema_version: 0,
        }
    }
}

// Page offsets within a page are tracked as 16-bit values, so 65536-byte
// pages (encoded as 1 in the header) are not supported here.
fn check_page_size(page_size: u32) -> Result<u32, Error> {
    if page_size >= 1024 && page_size <= 32768 && page_size.is_power_of_two() {
        Ok(page_size)
    } else {
        Err(Error::UnsupportedPagesize(page_size))
    }
}

/// Parses the file header from the start of `f`.
pub fn read_header<R: Read + Seek>(f: &mut R) -> Result<FileHeader, Error> {
    f.seek(SeekFrom::Start(0)).map_err(|_| Error::ReadFailed)?;
    let mut buf = vec![0_u8; DB_HEADER_BYTES];
    f.read_exact(&mut buf).map_err(|_| Error::ReadFailed)?;
    let mut c = Cursor::new(buf);

    // Offset	Size	Description
    // 0	16	The header string: "SQLite format 3\000"
    let mut magic = [0_u8; 16];
    c.read_exact(&mut magic).map_err(|_| Error::ReadFailed)?;
    if magic != MAGIC_STRING {
        return Err(Error::WrongMagic);
    }

    // 16	2	The database page size in bytes; 1 means 65536, which is
    // beyond what this engine supports.
    let page_size = check_page_size(match c.read_u16::<BigEndian>().map_err(|_| Error::ReadFailed)? {
        1 => 65536,
        x => x as u32,
    })?;

    // 18	1	File format write version.
    // 19	1	File format read version.
    // 20	1	Reserved space per page.
    // 21	3	Payload fractions.
    c.seek(SeekFrom::Start(24)).map_err(|_| Error::ReadFailed)?;

    // 24	4	File change counter.
    // 28	4	Size of the database file in pages.
    let change_counter = c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    let num_pages = c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;

    // 32	4	First freelist trunk page (unused here).
    // 36	4	Number of freelist pages (unused here).
    // 40	4	The schema cookie.
    // 44	4	The schema format number.
    c.seek(SeekFrom::Start(40)).map_err(|_| Error::ReadFailed)?;
    let schema_version = c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)?;
    if c.read_u32::<BigEndian>().map_err(|_| Error::ReadFailed)? != SCHEMA_FORMAT_NUMBER {
        return Err(Error::UnsupportedSchema);
    }

    Ok(FileHeader {
        page_size,
        change_counter,
        num_pages,
        schema_version,
    })
}

/// Serializes `hdr` into its 100-byte on-disk form.
pub fn serialize_header(hdr: &FileHeader) -> Result<Vec<u8>, Error> {
    check_page_size(hdr.page_size)?;
    let mut buf = vec![0_u8; DB_HEADER_BYTES];
    let mut c = Cursor::new(&mut buf[..]);
    c.write_all(MAGIC_STRING).map_err(|_| Error::WriteFailed)?;
    c.write_u16::<BigEndian>(hdr.page_size as u16)
        .map_err(|_| Error::WriteFailed)?;
    c.seek(SeekFrom::Start(24)).map_err(|_| Error::WriteFailed)?;
    c.write_u32::<BigEndian>(hdr.change_counter)
        .map_err(|_| Error::WriteFailed)?;
    c.write_u32::<BigEndian>(hdr.num_pages)
        .map_err(|_| Error::WriteFailed)?;
    c.seek(SeekFrom::Start(40)).map_err(|_| Error::WriteFailed)?;
    c.write_u32::<BigEndian>(hdr.schema_version)
        .map_err(|_| Error::WriteFailed)?;
    c.write_u32::<BigEndian>(SCHEMA_FORMAT_NUMBER)
        .map_err(|_| Error::WriteFailed)?;
    Ok(buf)
}

#[test]
fn test_header_round_trip() {
    let cases = vec![
        FileHeader::new(4096),
        FileHeader {
            page_size: 1024,
            change_counter: 17,
            num_pages: 12,
            schema_version: 3,
        },
    ];
    for case in cases {
        println!("Case: {:?}", case);
        let bytes = serialize_header(&case).unwrap();
        assert_eq!(bytes.len(), DB_HEADER_BYTES);
        let mut c = Cursor::new(bytes);
        assert_eq!(read_header(&mut c).unwrap(), case);
    }
}

#[test]
fn test_header_rejects_bad_magic() {
    let mut bytes = serialize_header(&FileHeader::new(4096)).unwrap();
    bytes[0] = b'X';
    let mut c = Cursor::new(bytes);
    assert!(matches!(read_header(&mut c), Err(Error::WrongMagic)));
}

#[test]
fn test_header_rejects_bad_page_size() {
    for bad in [512_u32, 1000, 3000] {
        println!("Case: {}", bad);
        assert!(matches!(
            serialize_header(&FileHeader {
                page_size: bad,
                change_counter: 0,
                num_pages: 1,
                schema_version: 0,
            }),
            Err(Error::UnsupportedPagesize(_))
        ));
    }
}
