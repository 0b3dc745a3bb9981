//! config decodes the server's YAML configuration file.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// The database file name inside the data directory.  The WAL lives next
/// to it as `tiny.db-wal`.
pub const DB_FILE_NAME: &str = "tiny.db";
pub const WAL_FILE_NAME: &str = "tiny.db-wal";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not decode config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("page_size {0} is invalid: must be a power of two between 1024 and 32768.")]
    InvalidPageSize(usize),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub data_directory: PathBuf,
    pub page_size: usize,
    pub listen_address: String,
    pub max_receive_buffer: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            data_directory: PathBuf::from("data"),
            page_size: 4096,
            listen_address: String::from("127.0.0.1:5433"),
            max_receive_buffer: 1 << 20,
            log_level: String::from("info"),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.page_size < 1024 || self.page_size > 32768 || !self.page_size.is_power_of_two() {
            return Err(Error::InvalidPageSize(self.page_size));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_directory.join(DB_FILE_NAME)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_directory.join(WAL_FILE_NAME)
    }
}

/// Loads and validates a config file.
pub fn load(path: &Path) -> Result<Config, Error> {
    let text = std::fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&text)?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.page_size, 4096);
        assert_eq!(cfg.db_path(), PathBuf::from("data/tiny.db"));
        assert_eq!(cfg.wal_path(), PathBuf::from("data/tiny.db-wal"));
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let cfg: Config = serde_yaml::from_str("page_size: 2048\nlog_level: debug\n").unwrap();
        assert_eq!(cfg.page_size, 2048);
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.listen_address, Config::default().listen_address);
    }

    #[test]
    fn test_full_yaml() {
        let text = "data_directory: /tmp/dbdir\n\
                    page_size: 1024\n\
                    listen_address: 0.0.0.0:9999\n\
                    max_receive_buffer: 4096\n\
                    log_level: warn\n";
        let cfg: Config = serde_yaml::from_str(text).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.data_directory, PathBuf::from("/tmp/dbdir"));
        assert_eq!(cfg.max_receive_buffer, 4096);
    }

    #[test]
    fn test_invalid_page_sizes_rejected() {
        for bad in [512_usize, 1000, 3000, 65536, 131072] {
            println!("Case: {}", bad);
            let cfg = Config {
                page_size: bad,
                ..Config::default()
            };
            assert!(matches!(cfg.validate(), Err(Error::InvalidPageSize(_))));
        }
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let r: Result<Config, _> = serde_yaml::from_str("page_sze: 2048\n");
        assert!(r.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tinydb.yaml");
        std::fs::write(&path, "page_size: 8192\n").unwrap();
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.page_size, 8192);
        assert!(load(&dir.path().join("missing.yaml")).is_err());
    }
}
