//! table implements insertion into one Table btree, including the split of
//! a full root leaf, plus whole-table scans.
//!
//! Rowids are issued monotonically, so every insert lands at the right edge
//! of the tree.  The split policy leans on that: when a root leaf fills, all
//! existing cells move to a new left leaf and the incoming record starts a
//! new right leaf; the root becomes an interior node with one `(left,
//! max-rowid(left))` entry and the right leaf as its rightmost pointer.
//! When a rightmost leaf below an interior node fills, a fresh rightmost
//! leaf is added and the old one becomes an interior entry.  Splitting a
//! full interior node is not implemented; the insert fails instead.

use streaming_iterator::StreamingIterator;

use super::cursor::Cursor;
use super::page::{make_interior_cell, MemPage};
use super::{Error, PageType};
use crate::pager::{PageNum, Pager};
use crate::record::{Record, RowId};

/// Inserts `rec` into the btree rooted at `root`, staging the touched pages
/// in the pager.
pub fn insert(pager: &mut Pager, root: PageNum, rec: &Record) -> Result<(), Error> {
    let cell = rec.serialize()?;
    let mut root_page = pager.read(root)?;

    match root_page.page_type() {
        PageType::Leaf => {
            if root_page.fits(cell.len()) {
                root_page.add_cell(&cell)?;
                pager.write(vec![root_page])?;
                return Ok(());
            }
            if root_page.cell_count() == 0 {
                // Splitting an empty leaf cannot help; the record simply
                // does not fit a page.
                return Err(Error::PageFull(cell.len()));
            }
            split_root_leaf(pager, root_page, &cell)
        }
        PageType::Internal => append_below(pager, &root_page, &cell),
        other => Err(Error::WrongPageType {
            expected: PageType::Leaf,
            found: other,
        }),
    }
}

/// The full-root-leaf case: existing cells go left, the new record goes
/// right, the root turns interior.
fn split_root_leaf(pager: &mut Pager, mut root_page: MemPage, cell: &[u8]) -> Result<(), Error> {
    let mut left = pager.allocate(PageType::Leaf)?;
    let mut right = pager.allocate(PageType::Leaf)?;
    root_page.copy_to(&mut left)?;
    right.add_cell(cell)?;

    let left_max = left
        .read_record(left.cell_count() - 1)?
        .rowid;

    root_page.reset_as(PageType::Internal);
    let mut header = root_page.header.clone();
    header.rightmost_pointer = Some(right.number as u32);
    root_page.set_header(header);
    root_page.add_cell(&make_interior_cell(left.number, left_max))?;

    tracing::debug!(
        root = root_page.number,
        left = left.number,
        right = right.number,
        "split root leaf"
    );
    pager.write(vec![left, right, root_page])?;
    Ok(())
}

/// Descends rightmost pointers from an interior root to the rightmost leaf
/// and appends there, growing a new rightmost leaf when it fills.
fn append_below(pager: &mut Pager, root_page: &MemPage, cell: &[u8]) -> Result<(), Error> {
    // The parent of the leaf we land on.  Only the immediate parent takes a
    // new entry when the leaf fills.
    let mut parent = root_page.clone();
    loop {
        let rightmost = parent
            .header
            .rightmost_pointer
            .expect("Interior pages always have a rightmost pointer")
            as PageNum;
        let child = pager.read(rightmost)?;
        match child.page_type() {
            PageType::Internal => parent = child,
            PageType::Leaf => {
                let mut leaf = child;
                if leaf.fits(cell.len()) {
                    leaf.add_cell(cell)?;
                    pager.write(vec![leaf])?;
                    return Ok(());
                }
                // Retire the full leaf into the parent's entry list and hang
                // a fresh rightmost leaf.
                let old_max = leaf.read_record(leaf.cell_count() - 1)?.rowid;
                let entry = make_interior_cell(leaf.number, old_max);
                if !parent.fits(entry.len()) {
                    return Err(Error::InteriorSplitUnimplemented);
                }
                parent.add_cell(&entry)?;
                let mut new_leaf = pager.allocate(PageType::Leaf)?;
                new_leaf.add_cell(cell)?;
                let mut header = parent.header.clone();
                header.rightmost_pointer = Some(new_leaf.number as u32);
                parent.set_header(header);
                tracing::debug!(
                    parent = parent.number,
                    retired = leaf.number,
                    new_leaf = new_leaf.number,
                    "grew new rightmost leaf"
                );
                pager.write(vec![parent.clone(), new_leaf])?;
                return Ok(());
            }
            other => {
                return Err(Error::WrongPageType {
                    expected: PageType::Leaf,
                    found: other,
                })
            }
        }
    }
}

/// The largest rowid stored in the tree, found down the rightmost spine.
/// `None` for an empty tree.
pub fn max_rowid(pager: &mut Pager, root: PageNum) -> Result<Option<RowId>, Error> {
    let mut pn = root;
    loop {
        let page = pager.read(pn)?;
        match page.page_type() {
            PageType::Internal => {
                pn = page
                    .header
                    .rightmost_pointer
                    .expect("Interior pages always have a rightmost pointer")
                    as PageNum;
            }
            PageType::Leaf => {
                if page.cell_count() == 0 {
                    return Ok(None);
                }
                return Ok(Some(page.read_record(page.cell_count() - 1)?.rowid));
            }
            other => {
                return Err(Error::WrongPageType {
                    expected: PageType::Leaf,
                    found: other,
                })
            }
        }
    }
}

/// A whole-table scan in rowid order.  Rows are decoded as the scan
/// advances; a storage error ends the scan and is readable afterwards from
/// `error()`.
pub struct TableScan<'p> {
    pager: &'p mut Pager,
    cursor: Cursor,
    item: Option<Record>,
    error: Option<Error>,
}

impl<'p> TableScan<'p> {
    pub fn new(pager: &'p mut Pager, root: PageNum) -> TableScan<'p> {
        TableScan {
            pager,
            cursor: Cursor::new_read(root),
            item: None,
            error: None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
}

impl<'p> StreamingIterator for TableScan<'p> {
    type Item = Record;

    fn advance(&mut self) {
        if self.error.is_some() {
            self.item = None;
            return;
        }
        let moved = if self.item.is_none() && !self.cursor.started() {
            self.cursor.rewind(self.pager)
        } else {
            self.cursor.next(self.pager)
        };
        self.item = match moved {
            Ok(true) => match self.cursor.current(self.pager) {
                Ok(rec) => Some(rec),
                Err(e) => {
                    self.error = Some(e);
                    None
                }
            },
            Ok(false) => None,
            Err(e) => {
                self.error = Some(e);
                None
            }
        };
    }

    fn get(&self) -> Option<&Self::Item> {
        self.item.as_ref()
    }
}
