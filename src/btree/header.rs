//! header reads and writes the header of a btree page.
//! A btree page is divided into regions in the following order
//! 1. The 100-byte database file header (found on page 1 only)
//! 2. The 8 or 12 byte btree page header
//! 3. The cell pointer array, growing upward
//! 4. Unallocated space
//! 5. The cell content area, growing downward from the end of the page

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Seek, SeekFrom, Write};

use super::{Error, PageType};
use crate::pager::PageNum;

/// The decoded btree page header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub first_freeblock: u16,
    pub num_cells: u16,
    pub cell_content_start: u16,
    pub fragmented_bytes: u8,
    /// Interior pages only: the child holding keys above every cell's key.
    pub rightmost_pointer: Option<u32>,
}

impl PageHeader {
    pub fn new(page_type: PageType) -> PageHeader {
        PageHeader {
            page_type,
            first_freeblock: 0,
            num_cells: 0,
            // A content-start of zero is read as "end of page"; we store the
            // real offset when the first cell arrives.
            cell_content_start: 0,
            fragmented_bytes: 0,
            rightmost_pointer: match page_type {
                PageType::Internal | PageType::InternalIndex => Some(0),
                _ => None,
            },
        }
    }

    pub fn header_len(&self) -> usize {
        self.page_type.header_len()
    }
}

/// The file header claims the first 100 bytes of page 1; all other pages
/// start their btree header at offset zero.
pub fn btree_start_offset(pgnum: PageNum) -> usize {
    match pgnum {
        1 => 100,
        _ => 0,
    }
}

/// Decodes the header found at `offset` within `page`.
pub fn parse_header(page: &[u8], offset: usize) -> Result<PageHeader, Error> {
    // Pages are fixed-size buffers of at least 1024 bytes, so reads within
    // the 12-byte header cannot run off the end.
    let mut c = Cursor::new(page);
    c.seek(SeekFrom::Start(offset as u64))
        .expect("Should have seeked to btree header.");

    // Offset	Size	Description
    // 0	1	The one-byte page type flag.
    let type_byte = c.read_u8().expect("Should have read btree header");
    let page_type = PageType::from_byte(type_byte).ok_or(Error::InvalidPageType(type_byte))?;

    // 1	2	Start of the first freeblock, or zero if none.
    let first_freeblock = c
        .read_u16::<BigEndian>()
        .expect("Should have read btree header");
    // 3	2	Number of cells on the page.
    let num_cells = c
        .read_u16::<BigEndian>()
        .expect("Should have read btree header");
    // 5	2	Start of the cell content area.
    let cell_content_start = c
        .read_u16::<BigEndian>()
        .expect("Should have read btree header");
    // 7	1	Number of fragmented free bytes in the content area.
    let fragmented_bytes = c.read_u8().expect("Should have read btree header");
    // 8	4	Rightmost child page; interior pages only.
    let rightmost_pointer = match page_type {
        PageType::Internal | PageType::InternalIndex => Some(
            c.read_u32::<BigEndian>()
                .expect("Should have read rightmost pointer"),
        ),
        PageType::Leaf | PageType::LeafIndex => None,
    };

    Ok(PageHeader {
        page_type,
        first_freeblock,
        num_cells,
        cell_content_start,
        fragmented_bytes,
        rightmost_pointer,
    })
}

/// Encodes `hdr` into `page` at `offset`, the inverse of [`parse_header`].
pub fn write_header(page: &mut [u8], offset: usize, hdr: &PageHeader) {
    let mut c = Cursor::new(page);
    c.seek(SeekFrom::Start(offset as u64))
        .expect("Should have seeked to btree header.");
    c.write_all(&[hdr.page_type.to_byte()])
        .expect("Should have written btree header");
    c.write_u16::<BigEndian>(hdr.first_freeblock)
        .expect("Should have written btree header");
    c.write_u16::<BigEndian>(hdr.num_cells)
        .expect("Should have written btree header");
    c.write_u16::<BigEndian>(hdr.cell_content_start)
        .expect("Should have written btree header");
    c.write_all(&[hdr.fragmented_bytes])
        .expect("Should have written btree header");
    if let Some(rmp) = hdr.rightmost_pointer {
        c.write_u32::<BigEndian>(rmp)
            .expect("Should have written rightmost pointer");
    }
}

#[test]
fn test_header_round_trip() {
    let cases = vec![
        PageHeader {
            page_type: PageType::Leaf,
            first_freeblock: 0,
            num_cells: 3,
            cell_content_start: 4000,
            fragmented_bytes: 0,
            rightmost_pointer: None,
        },
        PageHeader {
            page_type: PageType::Internal,
            first_freeblock: 0,
            num_cells: 1,
            cell_content_start: 4080,
            fragmented_bytes: 2,
            rightmost_pointer: Some(7),
        },
    ];
    for (offset, case) in [(0_usize, &cases[0]), (100, &cases[0]), (0, &cases[1])] {
        println!("Case: offset {} {:?}", offset, case);
        let mut page = vec![0_u8; 4096];
        write_header(&mut page, offset, case);
        assert_eq!(&parse_header(&page, offset).unwrap(), case);
    }
}

#[test]
fn test_header_known_leaf_image() {
    // 0d: leaf, no freeblocks, 10 cells, content from 0x01ce.
    let page: Vec<u8> = {
        use hex::FromHex;
        let mut p = Vec::from_hex("0d0000000a01ce00").expect("Invalid hex string");
        p.resize(512, 0);
        p
    };
    let hdr = parse_header(&page, 0).unwrap();
    assert_eq!(hdr.page_type, PageType::Leaf);
    assert_eq!(hdr.num_cells, 10);
    assert_eq!(hdr.cell_content_start, 0x01ce);
    assert_eq!(hdr.rightmost_pointer, None);
}

#[test]
fn test_header_rejects_unknown_type() {
    let page = vec![0x42_u8; 512];
    assert!(matches!(
        parse_header(&page, 0),
        Err(Error::InvalidPageType(0x42))
    ));
}
