//! TinyDB is a small relational database engine: a subset of SQL over a
//! SQLite-compatible on-disk file format.
//!
//! The system layers, storage up:
//! - `varint`, `record` - the byte-level codecs for keys and rows.
//! - `btree` - pages, tables, and cursors over them.
//! - `dbheader`/`dbfile`, `wal`, `pager`, `pool` - the storage substrate:
//!   file I/O, write-ahead logging, the page cache, and the reader/writer
//!   reservation arbiter.
//! - `lexer`, `parser`, `grammar`, `ast` - SQL text to syntax tree.
//! - `codegen`, `vm` - syntax tree to bytecode, bytecode to rows.
//! - `backend` - prepare/execute orchestration and transaction control.
//! - `server`, `config` - the TCP surface and its configuration.

pub mod ast;
pub mod backend;
pub mod btree;
pub mod codegen;
pub mod config;
pub mod dbfile;
pub mod dbheader;
pub mod grammar;
pub mod lexer;
pub mod pager;
pub mod parser;
pub mod pool;
pub mod record;
pub mod schema;
pub mod server;
pub mod sql_type;
pub mod sql_value;
pub mod varint;
pub mod vm;
pub mod wal;

use std::path::Path;

use crate::backend::Backend;
use crate::pager::Pager;
use crate::pool::PagerPool;

/// Opens (creating as needed) the database under `data_directory` and
/// builds a backend over it: database file behind a WAL behind a pooled
/// pager.
pub fn open_backend(data_directory: &Path, page_size: usize) -> anyhow::Result<Backend> {
    std::fs::create_dir_all(data_directory)?;
    let db_path = data_directory.join(config::DB_FILE_NAME);
    let wal_path = data_directory.join(config::WAL_FILE_NAME);
    let db = dbfile::DbFile::open_or_create(&db_path, page_size)?;
    let wal = wal::Wal::open(db, &wal_path)?;
    let pager = Pager::new(Box::new(wal));
    Ok(Backend::new(PagerPool::new(pager)))
}

/// Builds a backend over a purely in-memory page source, for tests and the
/// `start` smoke command.
pub fn open_memory_backend(page_size: usize) -> Backend {
    let pager = Pager::new(Box::new(pager::MemSource::new(page_size)));
    Backend::new(PagerPool::new(pager))
}
