//! Defines an enum of the SQL column types we support and routines for
//! conversion to and from string.
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// These are the SQL column types that can appear in a CREATE TABLE.
/// `INT`/`INTEGER` and `TEXT`/`STRING` are accepted as aliases.
/// A stored integer narrow enough to fit one octet is written as a byte on
/// disk, but `BYTE` is not a declarable column type.
pub enum SqlType {
    Int,
    Text,
}

impl std::fmt::Display for SqlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlType::Int => write!(f, "INT"),
            SqlType::Text => write!(f, "TEXT"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseSqlTypeError;

impl FromStr for SqlType {
    type Err = ParseSqlTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "INT" | "INTEGER" => Ok(SqlType::Int),
            "TEXT" | "STRING" => Ok(SqlType::Text),
            _ => Err(ParseSqlTypeError),
        }
    }
}

#[test]
fn test_sql_type_from_str() {
    let cases = vec![
        ("int", Ok(SqlType::Int)),
        ("INTEGER", Ok(SqlType::Int)),
        ("text", Ok(SqlType::Text)),
        ("String", Ok(SqlType::Text)),
        ("blob", Err(ParseSqlTypeError)),
        ("", Err(ParseSqlTypeError)),
    ];
    for case in cases {
        println!("Case: {}", case.0);
        assert_eq!(SqlType::from_str(case.0), case.1);
    }
}
