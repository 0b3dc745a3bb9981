//! page provides the in-memory form of one btree page: the parsed header,
//! the cell pointer array, and the cell content heap.
//!
//! Cell pointers are 2-byte offsets growing upward from just after the page
//! header; cell contents grow downward from the end of the page.  The free
//! middle is never negative: `header end <= pointer array end <= content
//! start <= page size`.  Rowids are issued monotonically, so cells are both
//! appended in slot order and laid down in strictly descending positions;
//! cell `i` therefore ends where cell `i-1` begins (or at the page end for
//! slot 0).

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::Cursor;

use super::header::{btree_start_offset, parse_header, write_header, PageHeader};
use super::{Error, PageType};
use crate::pager::PageNum;
use crate::record::{Record, RowId};
use crate::varint;

/// One cached page.  Created by `Pager::read` or `Pager::allocate`, mutated
/// through `add_cell`, persisted by `Pager::flush`.
#[derive(Debug, Clone)]
pub struct MemPage {
    pub number: PageNum,
    pub header: PageHeader,
    pub data: Vec<u8>,
    pub dirty: bool,
}

impl MemPage {
    /// Synthesizes an empty page of the given type, marked dirty.
    pub fn new_empty(number: PageNum, page_size: usize, page_type: PageType) -> MemPage {
        let mut page = MemPage {
            number,
            header: PageHeader::new(page_type),
            data: vec![0_u8; page_size],
            dirty: true,
        };
        page.header.cell_content_start = page_size as u16;
        page.sync_header();
        page
    }

    /// Parses `data` as the page numbered `number`.
    pub fn from_bytes(number: PageNum, data: Vec<u8>) -> Result<MemPage, Error> {
        let mut header = parse_header(&data, btree_start_offset(number))?;
        if header.cell_content_start == 0 {
            header.cell_content_start = data.len() as u16;
        }
        Ok(MemPage {
            number,
            header,
            data,
            dirty: false,
        })
    }

    pub fn page_type(&self) -> PageType {
        self.header.page_type
    }

    pub fn cell_count(&self) -> usize {
        self.header.num_cells as usize
    }

    fn btree_offset(&self) -> usize {
        btree_start_offset(self.number)
    }

    /// One past the last cell pointer slot.
    fn cell_pointer_end(&self) -> usize {
        self.btree_offset() + self.header.header_len() + 2 * self.cell_count()
    }

    /// Re-encodes the header into the page buffer.
    fn sync_header(&mut self) {
        let offset = self.btree_offset();
        write_header(&mut self.data, offset, &self.header);
    }

    /// Replaces the page's header, e.g. to convert a leaf root into an
    /// interior node during a split.  The caller owns cell cleanup.
    pub fn set_header(&mut self, header: PageHeader) {
        self.header = header;
        if self.header.cell_content_start == 0 {
            self.header.cell_content_start = self.data.len() as u16;
        }
        self.sync_header();
        self.dirty = true;
    }

    /// Whether a cell of `len` bytes (plus its pointer slot) still fits.
    pub fn fits(&self, len: usize) -> bool {
        let content_start = self.header.cell_content_start as usize;
        content_start >= len && content_start - len >= self.cell_pointer_end() + 2
    }

    /// Appends a cell, updating the pointer array and content start.
    pub fn add_cell(&mut self, cell: &[u8]) -> Result<(), Error> {
        if !self.fits(cell.len()) {
            return Err(Error::PageFull(cell.len()));
        }
        let new_start = self.header.cell_content_start as usize - cell.len();
        self.data[new_start..new_start + cell.len()].copy_from_slice(cell);
        let slot = self.cell_pointer_end();
        BigEndian::write_u16(&mut self.data[slot..slot + 2], new_start as u16);
        self.header.num_cells += 1;
        self.header.cell_content_start = new_start as u16;
        self.sync_header();
        self.dirty = true;
        Ok(())
    }

    /// The raw bytes of cell `i`.
    pub fn cell(&self, i: usize) -> Result<&[u8], Error> {
        if i >= self.cell_count() {
            return Err(Error::CellIndexOutOfRange(i, self.cell_count()));
        }
        let slot = self.btree_offset() + self.header.header_len() + 2 * i;
        let start = BigEndian::read_u16(&self.data[slot..slot + 2]) as usize;
        let end = if i == 0 {
            self.data.len()
        } else {
            BigEndian::read_u16(&self.data[slot - 2..slot]) as usize
        };
        Ok(&self.data[start..end])
    }

    /// Decodes the record in leaf cell `i`.
    pub fn read_record(&self, i: usize) -> Result<Record, Error> {
        if self.page_type() != PageType::Leaf {
            return Err(Error::WrongPageType {
                expected: PageType::Leaf,
                found: self.page_type(),
            });
        }
        Ok(Record::parse(self.cell(i)?)?)
    }

    /// Decodes interior cell `i` into `(left child page, key)`.
    /// Every rowid reachable under the child is at most `key`.
    pub fn read_interior(&self, i: usize) -> Result<(PageNum, RowId), Error> {
        if self.page_type() != PageType::Internal {
            return Err(Error::WrongPageType {
                expected: PageType::Internal,
                found: self.page_type(),
            });
        }
        let cell = self.cell(i)?;
        let mut c = Cursor::new(cell);
        let left_child = c
            .read_u32::<BigEndian>()
            .map_err(|_| Error::CellIndexOutOfRange(i, self.cell_count()))?;
        let (key, _) = varint::read_varint(&cell[4..]).map_err(crate::record::Error::from)?;
        Ok((left_child as PageNum, key as RowId))
    }

    /// Copies every cell of this page into `dst`, in slot order.
    pub fn copy_to(&self, dst: &mut MemPage) -> Result<(), Error> {
        for i in 0..self.cell_count() {
            dst.add_cell(self.cell(i)?)?;
        }
        Ok(())
    }

    /// Discards every cell and reinitializes the page as an empty page of
    /// `page_type`.  Page 1's file-header region is left untouched.
    pub fn reset_as(&mut self, page_type: PageType) {
        let offset = self.btree_offset();
        for b in &mut self.data[offset..] {
            *b = 0;
        }
        let mut header = PageHeader::new(page_type);
        header.cell_content_start = self.data.len() as u16;
        self.header = header;
        self.sync_header();
        self.dirty = true;
    }
}

/// Encodes an interior cell: 4-byte big-endian left child then the key.
pub fn make_interior_cell(left_child: PageNum, key: RowId) -> Vec<u8> {
    let mut cell = vec![0_u8; 4];
    BigEndian::write_u32(&mut cell, left_child as u32);
    varint::write_varint(&mut cell, key as u64);
    cell
}
