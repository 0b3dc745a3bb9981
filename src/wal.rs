//! wal is the write-ahead log: an append-only frame log in front of the
//! database file.
//!
//! The log begins with a 32-byte header `(magic, format, page-size,
//! checkpoint#, salt1, salt2, checksum)`.  Each frame is a 24-byte header
//! `(page-number, db-size-after-commit-or-0, salt1, salt2, cumulative
//! checksum)` followed by one page of payload.  The frame that carries a
//! non-zero db size marks a transaction boundary.
//!
//! The header is rewritten with fresh salts at the first page write of each
//! transaction, and `checkpoint` copies every log-resident page into the
//! database file and rewinds the write position, so the same file region is
//! reused transaction after transaction.  Stale frames beyond the rewind
//! point can never replay: their salts no longer match the header.
//!
//! On open, the log is scanned and every complete transaction is loaded into
//! the page cache, then checkpointed into the database file.  A torn tail or
//! checksum mismatch ends the scan.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::dbfile::DbFile;
use crate::pager::{self, PageNum, PageSource};

pub const WAL_MAGIC: u32 = 0x377f0682;
pub const WAL_FORMAT: u32 = 3007000;

const WAL_HEADER_BYTES: u64 = 32;
const FRAME_HEADER_BYTES: u64 = 24;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error opening WAL file: {0}")]
    OpenFailed(std::io::Error),
    #[error("Error accessing WAL file: {0}")]
    Io(#[from] std::io::Error),
    #[error("The WAL magic bytes are wrong.")]
    BadMagic,
    #[error("WAL format {0} is not supported.")]
    UnsupportedFormat(u32),
    #[error("WAL page size {wal} does not match the database page size {db}.")]
    PageSizeMismatch { wal: u32, db: u32 },
    #[error("Database file error behind the WAL: {0}")]
    Db(#[from] crate::dbfile::Error),
    #[error("Pager error during WAL checkpoint: {0}")]
    Checkpoint(#[from] Box<pager::Error>),
}

struct WalHeader {
    checkpoint_seq: u32,
    salt1: u32,
    salt2: u32,
}

pub struct Wal {
    f: std::fs::File,
    db: DbFile,
    page_size: usize,
    header: WalHeader,
    /// Running checksum over the frames written since the last header
    /// rewrite.  Each frame stores the value after chaining itself in.
    checksum: u64,
    write_pos: u64,
    /// Set once the current transaction has rewritten the header.
    header_written: bool,
    /// Pages accepted by the log but not yet checkpointed, keyed by page
    /// number.  Reads hit this before falling through to the database file.
    cache: HashMap<PageNum, Vec<u8>>,
    /// Committed database size in pages.
    page_count: u32,
}

/// Chains `payload` (and the frame's identifying fields) onto `prev`,
/// producing the cumulative checksum the frame stores: two CRC32s, the
/// second covering the first, packed into one 64-bit word.
fn chain_checksum(prev: u64, pgno: u32, db_size: u32, payload: &[u8]) -> u64 {
    let mut h1 = crc32fast::Hasher::new();
    h1.update(&prev.to_be_bytes());
    h1.update(&pgno.to_be_bytes());
    h1.update(&db_size.to_be_bytes());
    h1.update(payload);
    let s1 = h1.finalize();
    let mut h2 = crc32fast::Hasher::new();
    h2.update(&s1.to_be_bytes());
    h2.update(&prev.to_be_bytes());
    let s2 = h2.finalize();
    ((s1 as u64) << 32) | s2 as u64
}

impl Wal {
    /// Opens (or creates) the `.wal` sibling for `db`, recovering any
    /// complete transactions the log still holds.
    pub fn open(db: DbFile, wal_path: &Path) -> Result<Wal, Error> {
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(wal_path)
            .map_err(Error::OpenFailed)?;
        let page_count = db.num_pages();
        let page_size = db.page_size();
        let mut wal = Wal {
            f,
            db,
            page_size,
            header: WalHeader {
                checkpoint_seq: 0,
                salt1: 0,
                salt2: 0,
            },
            checksum: 0,
            write_pos: WAL_HEADER_BYTES,
            header_written: false,
            cache: HashMap::new(),
            page_count,
        };
        wal.recover()?;
        Ok(wal)
    }

    fn recover(&mut self) -> Result<(), Error> {
        let len = self.f.metadata()?.len();
        if len < WAL_HEADER_BYTES {
            return Ok(());
        }
        self.f.seek(SeekFrom::Start(0))?;
        let magic = self.f.read_u32::<BigEndian>()?;
        if magic != WAL_MAGIC {
            return Err(Error::BadMagic);
        }
        let format = self.f.read_u32::<BigEndian>()?;
        if format != WAL_FORMAT {
            return Err(Error::UnsupportedFormat(format));
        }
        let page_size = self.f.read_u32::<BigEndian>()?;
        if page_size as usize != self.page_size {
            return Err(Error::PageSizeMismatch {
                wal: page_size,
                db: self.page_size as u32,
            });
        }
        let checkpoint_seq = self.f.read_u32::<BigEndian>()?;
        let salt1 = self.f.read_u32::<BigEndian>()?;
        let salt2 = self.f.read_u32::<BigEndian>()?;
        let _header_checksum = self.f.read_u64::<BigEndian>()?;
        self.header = WalHeader {
            checkpoint_seq,
            salt1,
            salt2,
        };

        // Walk frames, buffering each transaction until its commit frame
        // proves it complete.
        let frame_len = FRAME_HEADER_BYTES + self.page_size as u64;
        let mut pos = WAL_HEADER_BYTES;
        let mut checksum: u64 = 0;
        let mut pending: HashMap<PageNum, Vec<u8>> = HashMap::new();
        let mut committed = 0_usize;
        while pos + frame_len <= len {
            self.f.seek(SeekFrom::Start(pos))?;
            let pgno = self.f.read_u32::<BigEndian>()?;
            let db_size = self.f.read_u32::<BigEndian>()?;
            let fsalt1 = self.f.read_u32::<BigEndian>()?;
            let fsalt2 = self.f.read_u32::<BigEndian>()?;
            let stored = self.f.read_u64::<BigEndian>()?;
            let mut payload = vec![0_u8; self.page_size];
            self.f.read_exact(&mut payload)?;

            if fsalt1 != salt1 || fsalt2 != salt2 {
                break;
            }
            checksum = chain_checksum(checksum, pgno, db_size, &payload);
            if checksum != stored {
                tracing::warn!(frame_at = pos, "WAL frame checksum mismatch; ending recovery");
                break;
            }
            pending.insert(pgno as PageNum, payload);
            pos += frame_len;
            if db_size != 0 {
                // Transaction boundary: everything buffered becomes visible.
                self.cache.extend(pending.drain());
                self.page_count = db_size;
                self.checksum = checksum;
                self.write_pos = pos;
                committed += 1;
            }
        }

        if !self.cache.is_empty() {
            tracing::info!(
                transactions = committed,
                pages = self.cache.len(),
                "recovered WAL frames; checkpointing"
            );
            self.checkpoint().map_err(Box::new)?;
        }
        Ok(())
    }

    /// Rewrites the log header with fresh salts at the start of a
    /// transaction's first write.
    fn rotate_header(&mut self) -> Result<(), Error> {
        let mut rng = rand::thread_rng();
        self.header.checkpoint_seq += 1;
        self.header.salt1 = rng.gen();
        self.header.salt2 = rng.gen();
        self.checksum = 0;

        let mut buf = Vec::with_capacity(WAL_HEADER_BYTES as usize);
        buf.write_u32::<BigEndian>(WAL_MAGIC)?;
        buf.write_u32::<BigEndian>(WAL_FORMAT)?;
        buf.write_u32::<BigEndian>(self.page_size as u32)?;
        buf.write_u32::<BigEndian>(self.header.checkpoint_seq)?;
        buf.write_u32::<BigEndian>(self.header.salt1)?;
        buf.write_u32::<BigEndian>(self.header.salt2)?;
        buf.write_u64::<BigEndian>(chain_checksum(
            0,
            self.header.checkpoint_seq,
            self.page_size as u32,
            &[],
        ))?;
        self.f.seek(SeekFrom::Start(0))?;
        self.f.write_all(&buf)?;
        self.write_pos = WAL_HEADER_BYTES;
        self.header_written = true;
        tracing::debug!(
            checkpoint_seq = self.header.checkpoint_seq,
            "rotated WAL header"
        );
        Ok(())
    }

    fn append_frame(&mut self, pgno: PageNum, db_size: u32, payload: &[u8]) -> Result<(), Error> {
        self.checksum = chain_checksum(self.checksum, pgno as u32, db_size, payload);
        let mut buf = Vec::with_capacity(FRAME_HEADER_BYTES as usize + payload.len());
        buf.write_u32::<BigEndian>(pgno as u32)?;
        buf.write_u32::<BigEndian>(db_size)?;
        buf.write_u32::<BigEndian>(self.header.salt1)?;
        buf.write_u32::<BigEndian>(self.header.salt2)?;
        buf.write_u64::<BigEndian>(self.checksum)?;
        buf.extend_from_slice(payload);
        self.f.seek(SeekFrom::Start(self.write_pos))?;
        self.f.write_all(&buf)?;
        self.write_pos += buf.len() as u64;
        self.cache.insert(pgno, payload.to_vec());
        Ok(())
    }
}

impl PageSource for Wal {
    fn read_page(&mut self, pn: PageNum) -> Result<Vec<u8>, pager::Error> {
        if let Some(p) = self.cache.get(&pn) {
            return Ok(p.clone());
        }
        Ok(self.db.read_page(pn).map_err(Error::Db)?)
    }

    fn write_pages(
        &mut self,
        pages: &[(PageNum, &[u8])],
        total_pages: u32,
    ) -> Result<(), pager::Error> {
        if pages.is_empty() {
            return Ok(());
        }
        if !self.header_written {
            self.rotate_header().map_err(pager::Error::Wal)?;
        }
        for (i, (pn, data)) in pages.iter().enumerate() {
            // The commit frame (the batch's last) carries the new db size.
            let db_size = if i == pages.len() - 1 { total_pages } else { 0 };
            self.append_frame(*pn, db_size, data)
                .map_err(pager::Error::Wal)?;
        }
        self.f.sync_all().map_err(Error::Io)?;
        self.page_count = total_pages;
        self.header_written = false;
        tracing::debug!(frames = pages.len(), total_pages, "committed WAL frames");
        Ok(())
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    /// Copies every log-resident page into the database file in one batch,
    /// then rewinds the log.
    fn checkpoint(&mut self) -> Result<(), pager::Error> {
        if self.cache.is_empty() {
            return Ok(());
        }
        let mut pages: Vec<PageNum> = self.cache.keys().copied().collect();
        pages.sort_unstable();
        for pn in &pages {
            self.db
                .write_page(*pn, &self.cache[pn])
                .map_err(Error::Db)?;
        }
        self.db.set_num_pages(self.page_count);
        self.db.sync().map_err(Error::Db)?;
        tracing::info!(pages = pages.len(), "checkpoint complete");
        self.cache.clear();
        self.write_pos = WAL_HEADER_BYTES;
        self.header_written = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 1024;

    fn make_db(dir: &Path) -> DbFile {
        DbFile::create(&dir.join("tiny.db"), PAGE_SIZE).unwrap()
    }

    fn page_of(byte: u8) -> Vec<u8> {
        let mut p = vec![byte; PAGE_SIZE];
        // Keep a parseable leaf header so readers of the page don't balk.
        let mut hdr = crate::btree::header::PageHeader::new(crate::btree::PageType::Leaf);
        hdr.cell_content_start = PAGE_SIZE as u16;
        crate::btree::header::write_header(&mut p, 0, &hdr);
        p
    }

    #[test]
    fn test_write_then_read_hits_cache() {
        let dir = tempfile::tempdir().unwrap();
        let db = make_db(dir.path());
        let mut wal = Wal::open(db, &dir.path().join("tiny.db-wal")).unwrap();

        let page2 = page_of(0x22);
        wal.write_pages(&[(2, &page2)], 2).unwrap();
        assert_eq!(wal.page_count(), 2);
        assert_eq!(wal.read_page(2).unwrap(), page2);
    }

    #[test]
    fn test_recovery_replays_committed_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("tiny.db-wal");
        let page2 = page_of(0x33);
        {
            let db = make_db(dir.path());
            let mut wal = Wal::open(db, &wal_path).unwrap();
            wal.write_pages(&[(2, &page2)], 2).unwrap();
            // Dropped without checkpoint: simulated crash after commit.
        }
        let db = DbFile::open(&dir.path().join("tiny.db")).unwrap();
        let mut wal = Wal::open(db, &wal_path).unwrap();
        assert_eq!(wal.page_count(), 2);
        assert_eq!(wal.read_page(2).unwrap(), page2);
    }

    #[test]
    fn test_recovery_ignores_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("tiny.db-wal");
        let page2 = page_of(0x44);
        {
            let db = make_db(dir.path());
            let mut wal = Wal::open(db, &wal_path).unwrap();
            wal.write_pages(&[(2, &page2)], 2).unwrap();
        }
        // Append a partial frame: a torn tail must not survive recovery.
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&wal_path)
                .unwrap();
            f.write_all(&vec![0xab_u8; 40]).unwrap();
        }
        let db = DbFile::open(&dir.path().join("tiny.db")).unwrap();
        let mut wal = Wal::open(db, &wal_path).unwrap();
        assert_eq!(wal.page_count(), 2);
        assert_eq!(wal.read_page(2).unwrap(), page2);
    }

    #[test]
    fn test_checkpoint_moves_pages_to_db_file() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("tiny.db-wal");
        let page2 = page_of(0x55);
        {
            let db = make_db(dir.path());
            let mut wal = Wal::open(db, &wal_path).unwrap();
            wal.write_pages(&[(2, &page2)], 2).unwrap();
            wal.checkpoint().unwrap();
        }
        // The page must now come from the database file alone.
        let mut db = DbFile::open(&dir.path().join("tiny.db")).unwrap();
        assert_eq!(db.num_pages(), 2);
        assert_eq!(db.read_page(2).unwrap(), page2);
    }

    #[test]
    fn test_salt_rotation_invalidates_stale_frames() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("tiny.db-wal");
        {
            let db = make_db(dir.path());
            let mut wal = Wal::open(db, &wal_path).unwrap();
            // Two transactions; the second writes fewer frames than the
            // first, leaving a stale first-transaction frame beyond it.
            wal.write_pages(&[(2, &page_of(0x66)), (3, &page_of(0x67))], 3)
                .unwrap();
            wal.checkpoint().unwrap();
            wal.write_pages(&[(2, &page_of(0x68))], 3).unwrap();
        }
        let db = DbFile::open(&dir.path().join("tiny.db")).unwrap();
        let mut wal = Wal::open(db, &wal_path).unwrap();
        // Only the second transaction's write is replayed over the
        // checkpointed state.
        assert_eq!(wal.read_page(2).unwrap(), page_of(0x68));
        assert_eq!(wal.read_page(3).unwrap(), page_of(0x67));
    }

    #[test]
    fn test_multi_page_transaction_commit_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("tiny.db-wal");
        let db = make_db(dir.path());
        let mut wal = Wal::open(db, &wal_path).unwrap();
        let pages: Vec<(PageNum, Vec<u8>)> =
            (2..=5).map(|n| (n as PageNum, page_of(n as u8))).collect();
        let batch: Vec<(PageNum, &[u8])> =
            pages.iter().map(|(n, d)| (*n, d.as_slice())).collect();
        wal.write_pages(&batch, 5).unwrap();
        assert_eq!(wal.page_count(), 5);
        for (n, d) in &pages {
            assert_eq!(&wal.read_page(*n).unwrap(), d);
        }
    }
}
