//! pager manages the in-memory page cache for one open database.
//!
//! The pager sits between the btree layer and a [`PageSource`] (the WAL in
//! the on-disk configuration, a plain memory store for tests and the smoke
//! command).  Pages are loaded on demand and cached; writes stage dirty
//! copies in the cache until `flush` hands them to the source in one batch,
//! and `reset` discards them.  All pages have the same size.  Page numbers
//! are 1-based, to match how the file format numbers pages.
//!
//! A pager is either in Read or Write mode; the pool (`pool.rs`) flips the
//! mode as reservations are granted.  Mutating operations fail with
//! `ReadOnlyPager` in Read mode.

use std::collections::HashMap;

use crate::btree::page::MemPage;
use crate::btree::PageType;

pub type PageNum = usize;

// TODO: support databases with more on-disk pages, limiting memory usage by
// paging out clean pages.
const MAX_PAGE_NUM: PageNum = 100_000;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("The page number is higher than the file contains or the code supports.")]
    PageNumberBeyondLimits,
    #[error("The pager is in read-only mode.")]
    ReadOnlyPager,
    #[error("Page {page} was malformed: {reason}")]
    InvalidPage { page: PageNum, reason: String },
    #[error("Write-ahead log error: {0}")]
    Wal(#[from] crate::wal::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Where pages come from and where flushed pages go.  The write side takes
/// the whole dirty batch at once so the source can mark the transaction
/// boundary on the final page.
pub trait PageSource: Send {
    fn read_page(&mut self, pn: PageNum) -> Result<Vec<u8>, Error>;
    fn write_pages(&mut self, pages: &[(PageNum, &[u8])], total_pages: u32) -> Result<(), Error>;
    fn page_count(&self) -> u32;
    fn page_size(&self) -> usize;
    /// Moves everything the source has accepted into durable storage.
    fn checkpoint(&mut self) -> Result<(), Error>;
}

pub struct Pager {
    source: Box<dyn PageSource>,
    pages: HashMap<PageNum, MemPage>,
    page_count: u32,
    page_size: usize,
    mode: AccessMode,
}

impl Pager {
    pub fn new(source: Box<dyn PageSource>) -> Pager {
        let page_count = source.page_count();
        let page_size = source.page_size();
        Pager {
            source,
            pages: HashMap::new(),
            page_count,
            page_size,
            mode: AccessMode::Read,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Only the pool flips modes; everything else observes.
    pub(crate) fn set_mode(&mut self, mode: AccessMode) {
        self.mode = mode;
    }

    /// Returns the cached page, fetching and parsing it from the source on a
    /// miss.  The caller gets a copy; mutations come back via `write`.
    pub fn read(&mut self, pn: PageNum) -> Result<MemPage, Error> {
        if pn == 0 || pn > MAX_PAGE_NUM {
            return Err(Error::PageNumberBeyondLimits);
        }
        if let Some(page) = self.pages.get(&pn) {
            return Ok(page.clone());
        }
        if pn > self.page_count as usize {
            return Err(Error::PageNumberBeyondLimits);
        }
        let bytes = self.source.read_page(pn)?;
        let page = MemPage::from_bytes(pn, bytes).map_err(|e| Error::InvalidPage {
            page: pn,
            reason: e.to_string(),
        })?;
        self.pages.insert(pn, page.clone());
        Ok(page)
    }

    /// Stages dirty pages in the cache.  The pager must be in write mode.
    pub fn write(&mut self, pages: Vec<MemPage>) -> Result<(), Error> {
        if self.mode != AccessMode::Write {
            return Err(Error::ReadOnlyPager);
        }
        for mut page in pages {
            page.dirty = true;
            self.pages.insert(page.number, page);
        }
        Ok(())
    }

    /// Bumps the page count and synthesizes an empty dirty page of the given
    /// type.
    pub fn allocate(&mut self, page_type: PageType) -> Result<MemPage, Error> {
        if self.mode != AccessMode::Write {
            return Err(Error::ReadOnlyPager);
        }
        if self.page_count as usize >= MAX_PAGE_NUM {
            return Err(Error::PageNumberBeyondLimits);
        }
        self.page_count += 1;
        let pn = self.page_count as PageNum;
        let page = MemPage::new_empty(pn, self.page_size, page_type);
        self.pages.insert(pn, page.clone());
        tracing::debug!(page = pn, ?page_type, "allocated page");
        Ok(page)
    }

    /// Writes every dirty page to the source and clears the dirty bits.
    /// Returns the number of pages written; zero makes the call a no-op, so
    /// read-only statements can share the commit path.
    pub fn flush(&mut self) -> Result<usize, Error> {
        let mut dirty: Vec<PageNum> = self
            .pages
            .iter()
            .filter(|(_, p)| p.dirty)
            .map(|(n, _)| *n)
            .collect();
        if dirty.is_empty() {
            return Ok(0);
        }
        if self.mode != AccessMode::Write {
            return Err(Error::ReadOnlyPager);
        }
        dirty.sort_unstable();
        tracing::debug!(pages = dirty.len(), "flushing dirty pages");
        {
            let batch: Vec<(PageNum, &[u8])> = dirty
                .iter()
                .map(|n| (*n, self.pages[n].data.as_slice()))
                .collect();
            self.source.write_pages(&batch, self.page_count)?;
        }
        let count = dirty.len();
        for n in dirty {
            if let Some(p) = self.pages.get_mut(&n) {
                p.dirty = false;
            }
        }
        Ok(count)
    }

    /// Evicts every dirty entry, abandoning staged writes.  Clean entries
    /// survive.  The page count returns to the source's view.
    pub fn reset(&mut self) {
        let before = self.pages.len();
        self.pages.retain(|_, p| !p.dirty);
        self.page_count = self.source.page_count();
        tracing::debug!(evicted = before - self.pages.len(), "pager reset");
    }

    /// Forwards a checkpoint request to the source.
    pub fn checkpoint(&mut self) -> Result<(), Error> {
        self.source.checkpoint()
    }
}

/// A purely in-memory page source, used by unit tests and the `start`
/// smoke command.  Checkpointing is a no-op; the accepted pages are the
/// durable state.
pub struct MemSource {
    page_size: usize,
    pages: Vec<Vec<u8>>,
}

impl MemSource {
    /// An empty single-table-less database: page 1 is an empty schema leaf.
    pub fn new(page_size: usize) -> MemSource {
        let mut page_one = vec![0_u8; page_size];
        let mut hdr = crate::btree::header::PageHeader::new(PageType::Leaf);
        hdr.cell_content_start = page_size as u16;
        crate::btree::header::write_header(
            &mut page_one,
            crate::dbheader::DB_HEADER_BYTES,
            &hdr,
        );
        MemSource {
            page_size,
            pages: vec![page_one],
        }
    }
}

impl PageSource for MemSource {
    fn read_page(&mut self, pn: PageNum) -> Result<Vec<u8>, Error> {
        self.pages
            .get(pn - 1)
            .cloned()
            .ok_or(Error::PageNumberBeyondLimits)
    }

    fn write_pages(&mut self, pages: &[(PageNum, &[u8])], total_pages: u32) -> Result<(), Error> {
        self.pages.resize(total_pages as usize, vec![0_u8; self.page_size]);
        for (pn, data) in pages {
            if *pn == 0 || *pn > self.pages.len() {
                return Err(Error::PageNumberBeyondLimits);
            }
            self.pages[*pn - 1] = data.to_vec();
        }
        Ok(())
    }

    fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn checkpoint(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
