//! dbfile opens the main database file and moves fixed-size pages in and
//! out of it.
//!
//! The file is the 100-byte header followed by N pages of `page_size` bytes.
//! Page numbers are 1-based.  Page 1's buffer overlaps the file header: its
//! first 100 bytes belong to the header writer, so page-1 writes skip them.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::btree;
use crate::btree::header::PageHeader;
use crate::dbheader::{self, FileHeader, DB_HEADER_BYTES};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error opening database file: {0}")]
    OpenFailed(std::io::Error),
    #[error("Error accessing database file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database file header invalid: {0}")]
    Header(#[from] dbheader::Error),
    #[error("Page {0} is beyond the end of the file.")]
    PageBeyondEnd(usize),
    #[error("Page buffer length {0} does not match the page size {1}.")]
    WrongPageLength(usize, usize),
}

pub struct DbFile {
    f: std::fs::File,
    header: FileHeader,
}

impl DbFile {
    /// Creates a fresh database file: file header plus page 1 initialized as
    /// an empty schema-root leaf.
    pub fn create(path: &Path, page_size: usize) -> Result<DbFile, Error> {
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(Error::OpenFailed)?;
        let header = FileHeader::new(page_size as u32);
        let mut db = DbFile { f, header };

        let mut page_one = vec![0_u8; page_size];
        let mut leaf = PageHeader::new(btree::PageType::Leaf);
        leaf.cell_content_start = page_size as u16;
        btree::header::write_header(&mut page_one, DB_HEADER_BYTES, &leaf);
        db.write_page(1, &page_one)?;
        db.sync()?;
        Ok(db)
    }

    /// Opens an existing database file and validates its header.
    pub fn open(path: &Path) -> Result<DbFile, Error> {
        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(Error::OpenFailed)?;
        let mut header = dbheader::read_header(&mut f)?;

        // The file is the authority on its own length; trust size-on-disk
        // over the in-header page count if they disagree.
        let file_len = f.metadata()?.len();
        let from_size = (file_len / header.page_size as u64) as u32;
        if from_size != header.num_pages {
            tracing::warn!(
                in_header = header.num_pages,
                from_size,
                "page count in header disagrees with file size"
            );
            header.num_pages = from_size;
        }
        Ok(DbFile { f, header })
    }

    /// Opens `path` if it exists, otherwise creates it.
    pub fn open_or_create(path: &Path, page_size: usize) -> Result<DbFile, Error> {
        if path.exists() {
            DbFile::open(path)
        } else {
            tracing::info!(path = %path.display(), "creating new database file");
            DbFile::create(path, page_size)
        }
    }

    pub fn page_size(&self) -> usize {
        self.header.page_size as usize
    }

    pub fn num_pages(&self) -> u32 {
        self.header.num_pages
    }

    /// Reads page `pn` in full, including page 1's header region.
    pub fn read_page(&mut self, pn: usize) -> Result<Vec<u8>, Error> {
        if pn == 0 || pn > self.header.num_pages as usize {
            return Err(Error::PageBeyondEnd(pn));
        }
        let page_size = self.page_size();
        let mut v = vec![0_u8; page_size];
        self.f
            .seek(SeekFrom::Start((pn - 1) as u64 * page_size as u64))?;
        self.f.read_exact(&mut v[..])?;
        Ok(v)
    }

    /// Writes page `pn`, extending the file as needed.  Page 1's first 100
    /// bytes are skipped; the header is rewritten on `sync`.
    pub fn write_page(&mut self, pn: usize, data: &[u8]) -> Result<(), Error> {
        let page_size = self.page_size();
        if data.len() != page_size {
            return Err(Error::WrongPageLength(data.len(), page_size));
        }
        let base = (pn - 1) as u64 * page_size as u64;
        if pn == 1 {
            self.f.seek(SeekFrom::Start(DB_HEADER_BYTES as u64))?;
            self.f.write_all(&data[DB_HEADER_BYTES..])?;
        } else {
            self.f.seek(SeekFrom::Start(base))?;
            self.f.write_all(data)?;
        }
        if pn as u32 > self.header.num_pages {
            self.header.num_pages = pn as u32;
        }
        self.header.change_counter = self.header.change_counter.wrapping_add(1);
        Ok(())
    }

    pub fn set_num_pages(&mut self, n: u32) {
        if n > self.header.num_pages {
            self.header.num_pages = n;
        }
    }

    /// Rewrites the file header and fsyncs.
    pub fn sync(&mut self) -> Result<(), Error> {
        let bytes = dbheader::serialize_header(&self.header)?;
        self.f.seek(SeekFrom::Start(0))?;
        self.f.write_all(&bytes)?;
        self.f.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 1024;

    #[test]
    fn test_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.db");
        {
            let db = DbFile::create(&path, PAGE_SIZE).unwrap();
            assert_eq!(db.num_pages(), 1);
        }
        let mut db = DbFile::open(&path).unwrap();
        assert_eq!(db.page_size(), PAGE_SIZE);
        assert_eq!(db.num_pages(), 1);
        // Page 1 parses as an empty leaf past the file header.
        let page = db.read_page(1).unwrap();
        let hdr = crate::btree::header::parse_header(&page, DB_HEADER_BYTES).unwrap();
        assert_eq!(hdr.page_type, crate::btree::PageType::Leaf);
        assert_eq!(hdr.num_cells, 0);
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.db");
        let mut db = DbFile::create(&path, PAGE_SIZE).unwrap();

        let mut page = vec![0_u8; PAGE_SIZE];
        page[0] = 0x0d;
        page[PAGE_SIZE - 1] = 0xee;
        db.write_page(2, &page).unwrap();
        db.sync().unwrap();
        assert_eq!(db.num_pages(), 2);

        drop(db);
        let mut db = DbFile::open(&path).unwrap();
        assert_eq!(db.num_pages(), 2);
        assert_eq!(db.read_page(2).unwrap(), page);
    }

    #[test]
    fn test_page_one_write_preserves_file_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.db");
        let mut db = DbFile::create(&path, PAGE_SIZE).unwrap();

        // A buffer whose header region is garbage must not clobber the real
        // file header on disk.
        let mut page = vec![0xff_u8; PAGE_SIZE];
        crate::btree::header::write_header(
            &mut page,
            DB_HEADER_BYTES,
            &PageHeader::new(crate::btree::PageType::Leaf),
        );
        db.write_page(1, &page).unwrap();
        db.sync().unwrap();
        drop(db);

        let db = DbFile::open(&path).unwrap();
        assert_eq!(db.page_size(), PAGE_SIZE);
    }

    #[test]
    fn test_read_beyond_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.db");
        let mut db = DbFile::create(&path, PAGE_SIZE).unwrap();
        assert!(matches!(db.read_page(5), Err(Error::PageBeyondEnd(5))));
    }

    #[test]
    fn test_change_counter_bumps_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.db");
        let mut db = DbFile::create(&path, PAGE_SIZE).unwrap();
        let before = db.header.change_counter;
        db.write_page(2, &vec![0_u8; PAGE_SIZE]).unwrap();
        assert!(db.header.change_counter > before);
    }
}
