//! cursor provides a stateful traversal position over one btree.
//!
//! `rewind` seats the cursor on the tree's first record; `next` advances in
//! rowid order; `current` decodes the record under the cursor.  Between
//! calls the cursor sits on a leaf whenever it is positioned.  The descent
//! path is kept as an explicit stack of `(interior page, next child index)`
//! frames whose depth is bounded by the tree height, so trees of any depth
//! traverse fully.  In a frame, indexes below the cell count name interior
//! cells, the cell count itself names the rightmost pointer, and anything
//! past that means the frame is spent.
//!
//! Cursors carry no locks; the caller's pool reservation must cover the
//! cursor's whole lifetime.

use super::{table, Error, PageType};
use crate::pager::{PageNum, Pager};
use crate::record::{Record, RowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMode {
    Read,
    Write,
}

#[derive(Debug)]
pub struct Cursor {
    root: PageNum,
    page: PageNum,
    cell: Option<usize>,
    stack: Vec<(PageNum, usize)>,
    mode: CursorMode,
    started: bool,
}

impl Cursor {
    pub fn new_read(root: PageNum) -> Cursor {
        Cursor::new(root, CursorMode::Read)
    }

    pub fn new_write(root: PageNum) -> Cursor {
        Cursor::new(root, CursorMode::Write)
    }

    fn new(root: PageNum, mode: CursorMode) -> Cursor {
        Cursor {
            root,
            page: root,
            cell: None,
            stack: vec![],
            mode,
            started: false,
        }
    }

    pub fn root(&self) -> PageNum {
        self.root
    }

    pub fn mode(&self) -> CursorMode {
        self.mode
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Seats the cursor on the first record.  Returns false for an empty
    /// tree.
    pub fn rewind(&mut self, pager: &mut Pager) -> Result<bool, Error> {
        self.stack.clear();
        self.cell = None;
        self.started = true;
        self.descend_leftmost(pager, self.root)
    }

    /// Advances to the following record.  Returns false once the tree is
    /// exhausted; further calls keep returning false.
    pub fn next(&mut self, pager: &mut Pager) -> Result<bool, Error> {
        if !self.started {
            return self.rewind(pager);
        }
        if let Some(c) = self.cell {
            let page = pager.read(self.page)?;
            if c + 1 < page.cell_count() {
                self.cell = Some(c + 1);
                return Ok(true);
            }
        }
        self.climb(pager)
    }

    /// The record under the cursor.
    pub fn current(&self, pager: &mut Pager) -> Result<Record, Error> {
        let cell = self.cell.ok_or(Error::NotPositioned)?;
        let page = pager.read(self.page)?;
        page.read_record(cell)
    }

    /// Appends a record through this cursor's tree.
    pub fn insert(&mut self, pager: &mut Pager, rec: &Record) -> Result<(), Error> {
        if self.mode != CursorMode::Write {
            return Err(Error::ReadOnlyCursor);
        }
        table::insert(pager, self.root, rec)
    }

    /// The next unused rowid for this cursor's tree.
    pub fn next_rowid(&self, pager: &mut Pager) -> Result<RowId, Error> {
        Ok(table::max_rowid(pager, self.root)?.unwrap_or(0) + 1)
    }

    /// Walks from `pn` down leftmost children to the first record at or
    /// below it, pushing descent frames along the way.
    fn descend_leftmost(&mut self, pager: &mut Pager, pn: PageNum) -> Result<bool, Error> {
        let mut pn = pn;
        loop {
            let page = pager.read(pn)?;
            match page.page_type() {
                PageType::Internal => {
                    let count = page.cell_count();
                    if count > 0 {
                        let (child, _) = page.read_interior(0)?;
                        self.stack.push((pn, 1));
                        pn = child;
                    } else {
                        let rightmost = page
                            .header
                            .rightmost_pointer
                            .expect("Interior pages always have a rightmost pointer")
                            as PageNum;
                        self.stack.push((pn, count + 1));
                        pn = rightmost;
                    }
                }
                PageType::Leaf => {
                    self.page = pn;
                    if page.cell_count() > 0 {
                        self.cell = Some(0);
                        return Ok(true);
                    }
                    // An empty leaf; resume from the parent.
                    self.cell = None;
                    return self.climb(pager);
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

    /// Pops descent frames until one still has a child to visit, then
    /// descends into it.  Terminal state: stack empty, nothing left.
    fn climb(&mut self, pager: &mut Pager) -> Result<bool, Error> {
        while let Some((pn, idx)) = self.stack.pop() {
            let page = pager.read(pn)?;
            let count = page.cell_count();
            if idx < count {
                let (child, _) = page.read_interior(idx)?;
                self.stack.push((pn, idx + 1));
                return self.descend_leftmost(pager, child);
            }
            if idx == count {
                let rightmost = page
                    .header
                    .rightmost_pointer
                    .expect("Interior pages always have a rightmost pointer")
                    as PageNum;
                self.stack.push((pn, idx + 1));
                return self.descend_leftmost(pager, rightmost);
            }
            // Frame spent; keep popping.
        }
        self.cell = None;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::{AccessMode, MemSource};
    use crate::sql_value::SqlValue;

    const PAGE_SIZE: usize = 1024;

    fn tree_with_rows(n: RowId) -> (Pager, PageNum) {
        let mut pager = Pager::new(Box::new(MemSource::new(PAGE_SIZE)));
        pager.set_mode(AccessMode::Write);
        let root = pager.allocate(PageType::Leaf).unwrap().number;
        for i in 1..=n {
            table::insert(
                &mut pager,
                root,
                &Record::new(i, vec![SqlValue::Text(format!("{}", i))]),
            )
            .unwrap();
        }
        (pager, root)
    }

    #[test]
    fn test_rewind_on_empty_tree() {
        let (mut pager, root) = tree_with_rows(0);
        let mut c = Cursor::new_read(root);
        assert!(!c.rewind(&mut pager).unwrap());
        assert!(!c.next(&mut pager).unwrap());
        assert!(matches!(
            c.current(&mut pager),
            Err(Error::NotPositioned)
        ));
    }

    #[test]
    fn test_traversal_is_ordered_and_complete() {
        // 300 rows forces a root split and several rightmost leaves.
        let (mut pager, root) = tree_with_rows(300);
        let mut c = Cursor::new_read(root);
        let mut seen = vec![];
        let mut more = c.rewind(&mut pager).unwrap();
        while more {
            seen.push(c.current(&mut pager).unwrap().rowid);
            more = c.next(&mut pager).unwrap();
        }
        assert_eq!(seen, (1..=300).collect::<Vec<RowId>>());
        // Exhausted cursors stay exhausted.
        assert!(!c.next(&mut pager).unwrap());
    }

    #[test]
    fn test_next_without_rewind_starts_traversal() {
        let (mut pager, root) = tree_with_rows(3);
        let mut c = Cursor::new_read(root);
        assert!(c.next(&mut pager).unwrap());
        assert_eq!(c.current(&mut pager).unwrap().rowid, 1);
    }

    #[test]
    fn test_cursor_insert_requires_write_mode() {
        let (mut pager, root) = tree_with_rows(1);
        let mut c = Cursor::new_read(root);
        let rec = Record::new(2, vec![SqlValue::Null]);
        assert!(matches!(
            c.insert(&mut pager, &rec),
            Err(Error::ReadOnlyCursor)
        ));
        let mut w = Cursor::new_write(root);
        w.insert(&mut pager, &rec).unwrap();
        assert_eq!(table::max_rowid(&mut pager, root).unwrap(), Some(2));
    }

    #[test]
    fn test_next_rowid_probes_the_tree() {
        let (mut pager, root) = tree_with_rows(0);
        let c = Cursor::new_write(root);
        assert_eq!(c.next_rowid(&mut pager).unwrap(), 1);
        let (mut pager, root) = tree_with_rows(7);
        let c = Cursor::new_write(root);
        assert_eq!(c.next_rowid(&mut pager).unwrap(), 8);
    }

    #[test]
    fn test_rewind_restarts_traversal() {
        let (mut pager, root) = tree_with_rows(5);
        let mut c = Cursor::new_read(root);
        c.rewind(&mut pager).unwrap();
        c.next(&mut pager).unwrap();
        c.next(&mut pager).unwrap();
        assert!(c.rewind(&mut pager).unwrap());
        assert_eq!(c.current(&mut pager).unwrap().rowid, 1);
    }
}
