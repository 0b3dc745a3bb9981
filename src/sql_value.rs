//! Defines an enum of all the possible values a stored field can have.

use enum_as_inner::EnumAsInner;

#[derive(Debug, Clone, PartialEq, EnumAsInner)]
/// can hold any value that can be stored in a table field.
/// `Byte` is a storage-side narrowing of `Int`: integers that fit one octet
/// are written with the byte serial tag and widen back to `Int` when read
/// into the VM.
pub enum SqlValue {
    Null,
    Byte(u8),
    Int(i64),
    Text(String),
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Byte(x) => write!(f, "{}", x),
            SqlValue::Int(x) => write!(f, "{}", x),
            SqlValue::Text(x) => write!(f, "{}", x),
        }
    }
}

#[test]
fn test_sql_value_display() {
    let cases = vec![
        (SqlValue::Null, "NULL"),
        (SqlValue::Byte(7), "7"),
        (SqlValue::Int(-12), "-12"),
        (SqlValue::Text(String::from("hi")), "hi"),
    ];
    for case in cases {
        println!("Case: {:?}", case.0);
        assert_eq!(format!("{}", case.0), case.1);
    }
}
