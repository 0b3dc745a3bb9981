//! schema reads table definitions out of the schema root btree.
//!
//! Page 1 is always a btree page, and it is the root page of the schema
//! table.  The schema table holds one record per user table:
//! `(type, name, tbl_name, rootpage, sql)`.  The stored `sql` is the
//! original CREATE TABLE text; reparsing it is how column names and types
//! come back.

use std::str::FromStr;
use streaming_iterator::StreamingIterator;

use crate::btree::table::TableScan;
use crate::grammar;
use crate::pager::{PageNum, Pager};
use crate::record::Record;
use crate::sql_type::SqlType;
use crate::sql_value::SqlValue;

/// Page 1 is the root page of the schema table.
pub const SCHEMA_ROOT_PAGE: PageNum = 1;

pub const SCHEMA_TYPE_COLIDX: usize = 0;
pub const SCHEMA_TBL_NAME_COLIDX: usize = 2;
pub const SCHEMA_ROOTPAGE_COLIDX: usize = 3;
pub const SCHEMA_SQL_COLIDX: usize = 4;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Btree error while scanning the schema table: {0}")]
    Btree(#[from] crate::btree::Error),
    #[error("Schema record is malformed: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub ctype: SqlType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub root: PageNum,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

fn field_str(rec: &Record, idx: usize) -> Result<&str, Error> {
    match rec.fields.get(idx) {
        Some(SqlValue::Text(s)) => Ok(s),
        other => Err(Error::Corrupt(format!(
            "expected text in schema column {}, found {:?}",
            idx, other
        ))),
    }
}

fn field_int(rec: &Record, idx: usize) -> Result<i64, Error> {
    match rec.fields.get(idx) {
        Some(SqlValue::Int(i)) => Ok(*i),
        Some(SqlValue::Byte(b)) => Ok(*b as i64),
        other => Err(Error::Corrupt(format!(
            "expected integer in schema column {}, found {:?}",
            idx, other
        ))),
    }
}

/// Rebuilds a table definition from the stored CREATE TABLE text.
pub fn table_def_from_sql(sql: &str, root: PageNum) -> Result<TableDef, Error> {
    let stmt = grammar::parse_statement(sql)
        .map_err(|e| Error::Corrupt(format!("stored CREATE TABLE does not parse: {}", e)))?;
    let create = stmt
        .as_create()
        .ok_or_else(|| Error::Corrupt(String::from("stored schema SQL is not a CREATE TABLE")))?;
    let mut columns = vec![];
    for cd in &create.coldefs {
        let ctype = SqlType::from_str(&cd.coltype).map_err(|_| {
            Error::Corrupt(format!("column {} has unknown type {}", cd.colname, cd.coltype))
        })?;
        columns.push(ColumnDef {
            name: cd.colname.name.clone(),
            ctype,
        });
    }
    Ok(TableDef {
        name: create.tablename.clone(),
        root,
        columns,
    })
}

/// Finds `table_name` in the schema table.
pub fn lookup_table(pager: &mut Pager, table_name: &str) -> Result<Option<TableDef>, Error> {
    let mut scan = TableScan::new(pager, SCHEMA_ROOT_PAGE);
    let mut found: Option<(String, PageNum)> = None;
    while let Some(rec) = scan.next() {
        if field_str(rec, SCHEMA_TYPE_COLIDX)? != "table" {
            continue;
        }
        if !field_str(rec, SCHEMA_TBL_NAME_COLIDX)?.eq_ignore_ascii_case(table_name) {
            continue;
        }
        let root = field_int(rec, SCHEMA_ROOTPAGE_COLIDX)? as PageNum;
        let sql = field_str(rec, SCHEMA_SQL_COLIDX)?.to_string();
        found = Some((sql, root));
        break;
    }
    if let Some(e) = scan.error() {
        return Err(Error::Corrupt(format!("schema scan failed: {}", e)));
    }
    match found {
        Some((sql, root)) => Ok(Some(table_def_from_sql(&sql, root)?)),
        None => Ok(None),
    }
}

/// Builds the schema-table record for a newly created table.
pub fn schema_record(rowid: i64, name: &str, root: PageNum, sql: &str) -> Record {
    Record::new(
        rowid,
        vec![
            SqlValue::Text(String::from("table")),
            SqlValue::Text(String::from(name)),
            SqlValue::Text(String::from(name)),
            SqlValue::Int(root as i64),
            SqlValue::Text(String::from(sql)),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::table;
    use crate::pager::{AccessMode, MemSource};

    const PAGE_SIZE: usize = 1024;

    fn pager_with_schema_rows(rows: &[(&str, PageNum, &str)]) -> Pager {
        let mut pager = Pager::new(Box::new(MemSource::new(PAGE_SIZE)));
        pager.set_mode(AccessMode::Write);
        for (i, (name, root, sql)) in rows.iter().enumerate() {
            let rec = schema_record(i as i64 + 1, name, *root, sql);
            table::insert(&mut pager, SCHEMA_ROOT_PAGE, &rec).unwrap();
        }
        pager
    }

    #[test]
    fn test_lookup_table() {
        let mut pager = pager_with_schema_rows(&[
            ("t1", 2, "CREATE TABLE t1 (a int)"),
            ("t2", 3, "CREATE TABLE t2 (a int, b text)"),
        ]);
        let def = lookup_table(&mut pager, "t2").unwrap().unwrap();
        assert_eq!(def.name, "t2");
        assert_eq!(def.root, 3);
        assert_eq!(
            def.columns,
            vec![
                ColumnDef {
                    name: String::from("a"),
                    ctype: SqlType::Int
                },
                ColumnDef {
                    name: String::from("b"),
                    ctype: SqlType::Text
                },
            ]
        );
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut pager = pager_with_schema_rows(&[("Foo", 2, "CREATE TABLE Foo (a int)")]);
        assert!(lookup_table(&mut pager, "foo").unwrap().is_some());
        assert!(lookup_table(&mut pager, "FOO").unwrap().is_some());
    }

    #[test]
    fn test_lookup_missing_table() {
        let mut pager = pager_with_schema_rows(&[("t1", 2, "CREATE TABLE t1 (a int)")]);
        assert!(lookup_table(&mut pager, "nope").unwrap().is_none());
    }

    #[test]
    fn test_column_index() {
        let def = table_def_from_sql("CREATE TABLE t (a int, B text)", 2).unwrap();
        assert_eq!(def.column_index("a"), Some(0));
        assert_eq!(def.column_index("b"), Some(1));
        assert_eq!(def.column_index("c"), None);
    }

    #[test]
    fn test_corrupt_schema_sql_is_an_error() {
        assert!(table_def_from_sql("DROP TABLE t", 2).is_err());
        assert!(table_def_from_sql("CREATE TABLE t (a blobby)", 2).is_err());
    }
}
