//! record serializes and deserializes row payloads.
//!
//! Leaf cells hold records, which contain SQL rows.  A record is written as
//! `varint(payload-len) | varint(rowid) | header | values`, where the header
//! is `varint(header-len)` followed by one serial-type tag per field and
//! `header-len` counts the header including its own length bytes.  Each field
//! has a serial type which is not the same as the column SQL type, but varies
//! by the value stored:
//!
//! | Serial type | Content size | Meaning |
//! |-------------|--------------|---------|
//! | 0           | 0            | NULL |
//! | 1           | 1            | 8-bit unsigned integer |
//! | 4           | 4            | big-endian 32-bit twos-complement integer |
//! | N >= 13 odd | (N-13)/2     | UTF-8 text, no terminator |
//!
//! Other tags do not appear in well-formed files and fail the parse.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::sql_value::SqlValue;
use crate::varint;

pub type RowId = i64;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Record varint was invalid: {0}")]
    Varint(#[from] varint::Error),
    #[error("Serial type {0} is not supported.")]
    UnknownSerialType(u64),
    #[error("Record body ended before all header fields were read.")]
    Truncated,
    #[error("Record payload length did not match its contents.")]
    PayloadLengthMismatch,
    #[error("Integer value {0} does not fit the 4-byte storage format.")]
    IntegerOutOfRange(i64),
    #[error("Text bytes were not valid UTF-8.")]
    InvalidStringEncoding(#[from] std::string::FromUtf8Error),
    #[error("Error reading record bytes: {0}")]
    Io(#[from] std::io::Error),
}

/// A row: a rowid key plus its typed field values.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub rowid: RowId,
    pub fields: Vec<SqlValue>,
}

fn serial_type(v: &SqlValue) -> u64 {
    match v {
        SqlValue::Null => 0,
        SqlValue::Byte(_) => 1,
        SqlValue::Int(_) => 4,
        SqlValue::Text(s) => 2 * s.len() as u64 + 13,
    }
}

fn content_len(tag: u64) -> Result<usize, Error> {
    match tag {
        0 => Ok(0),
        1 => Ok(1),
        4 => Ok(4),
        t if t >= 13 && t % 2 == 1 => Ok(((t - 13) / 2) as usize),
        t => Err(Error::UnknownSerialType(t)),
    }
}

impl Record {
    pub fn new(rowid: RowId, fields: Vec<SqlValue>) -> Record {
        Record { rowid, fields }
    }

    /// Serializes the record into leaf-cell form.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        // Header: its own length varint plus one tag varint per field.
        let tags: Vec<u64> = self.fields.iter().map(serial_type).collect();
        let tags_len: usize = tags.iter().map(|t| varint::varint_len(*t)).sum();
        // The header length counts itself; one byte is enough until a row
        // has dozens of long text columns, and the varint grows with it.
        let mut hdr_len = tags_len + 1;
        if varint::varint_len(hdr_len as u64) > 1 {
            hdr_len = tags_len + varint::varint_len((tags_len + 2) as u64);
        }

        let mut body: Vec<u8> = vec![];
        for f in &self.fields {
            match f {
                SqlValue::Null => (),
                SqlValue::Byte(b) => body.push(*b),
                SqlValue::Int(i) => {
                    let narrowed =
                        i32::try_from(*i).map_err(|_| Error::IntegerOutOfRange(*i))?;
                    body.write_i32::<BigEndian>(narrowed)?;
                }
                SqlValue::Text(s) => body.extend_from_slice(s.as_bytes()),
            }
        }

        let payload_len = hdr_len + body.len();
        let mut out: Vec<u8> = vec![];
        varint::write_varint(&mut out, payload_len as u64);
        varint::write_varint(&mut out, self.rowid as u64);
        varint::write_varint(&mut out, hdr_len as u64);
        for t in tags {
            varint::write_varint(&mut out, t);
        }
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parses a record from the contents of a leaf cell.
    pub fn parse(cell: &[u8]) -> Result<Record, Error> {
        let (payload_len, n) = varint::read_varint(cell)?;
        let mut offset = n;
        let (rowid, n) = varint::read_varint(&cell[offset..])?;
        offset += n;
        if cell.len() - offset != payload_len as usize {
            return Err(Error::PayloadLengthMismatch);
        }

        let payload = &cell[offset..];
        let (hdr_len, hdr_len_len) = varint::read_varint(payload)?;
        let hdr_len = hdr_len as usize;
        if hdr_len > payload.len() {
            return Err(Error::Truncated);
        }

        // First pass: the tag list.  Second pass: the values, whose lengths
        // are all derived from the tags.
        let mut tags: Vec<u64> = vec![];
        let mut hdr_offset = hdr_len_len;
        while hdr_offset < hdr_len {
            let (tag, n) = varint::read_varint(&payload[hdr_offset..])?;
            hdr_offset += n;
            tags.push(tag);
        }

        let mut fields: Vec<SqlValue> = vec![];
        let mut value_offset = hdr_len;
        for tag in tags {
            let len = content_len(tag)?;
            if value_offset + len > payload.len() {
                return Err(Error::Truncated);
            }
            let data = &payload[value_offset..value_offset + len];
            value_offset += len;
            fields.push(match tag {
                0 => SqlValue::Null,
                1 => SqlValue::Byte(data[0]),
                4 => {
                    let mut c = std::io::Cursor::new(data);
                    SqlValue::Int(c.read_i32::<BigEndian>()? as i64)
                }
                _ => SqlValue::Text(String::from_utf8(data.to_vec())?),
            });
        }
        if value_offset != payload.len() {
            return Err(Error::PayloadLengthMismatch);
        }
        Ok(Record {
            rowid: rowid as RowId,
            fields,
        })
    }
}

#[test]
fn test_record_serialize_layout() {
    use SqlValue::*;
    // rowid 1, single one-byte int 7:
    // payload-len 3 | rowid 1 | header-len 2 | tag 1 | value 7
    let r = Record::new(1, vec![Byte(7)]);
    assert_eq!(r.serialize().unwrap(), vec![0x03, 0x01, 0x02, 0x01, 0x07]);
}

#[test]
fn test_record_serialize_text_layout() {
    use SqlValue::*;
    let r = Record::new(2, vec![Text(String::from("bar"))]);
    // tag = 2*3+13 = 19 (0x13), payload = 2 header + 3 text.
    assert_eq!(
        r.serialize().unwrap(),
        vec![0x05, 0x02, 0x02, 0x13, b'b', b'a', b'r']
    );
}

#[test]
fn test_record_round_trip() {
    use SqlValue::*;
    let cases: Vec<Record> = vec![
        Record::new(1, vec![]),
        Record::new(1, vec![Null]),
        Record::new(7, vec![Byte(0), Byte(255)]),
        Record::new(22, vec![Int(1 << 20), Int(-44)]),
        Record::new(1000, vec![Text(String::from(""))]),
        Record::new(
            123456789,
            vec![
                Text(String::from("table")),
                Text(String::from("foo")),
                Text(String::from("foo")),
                Byte(2),
                Text(String::from("CREATE TABLE foo (name text)")),
            ],
        ),
        Record::new(3, vec![Null, Byte(9), Int(70000), Text(String::from("x"))]),
    ];
    for case in cases {
        println!("Case: {:?}", case);
        let bytes = case.serialize().unwrap();
        let parsed = Record::parse(&bytes).unwrap();
        assert_eq!(parsed, case);
    }
}

#[test]
fn test_record_long_text_round_trip() {
    use SqlValue::*;
    // Text long enough that the serial tag needs a two-byte varint.
    let long = "z".repeat(300);
    let r = Record::new(5, vec![Text(long.clone()), Byte(1)]);
    let bytes = r.serialize().unwrap();
    let parsed = Record::parse(&bytes).unwrap();
    assert_eq!(parsed.fields, vec![Text(long), Byte(1)]);
}

#[test]
fn test_record_parse_rejects_unknown_tag() {
    // Tag 2 (16-bit int) is valid SQLite but not this subset.
    let cell = vec![0x04, 0x01, 0x02, 0x02, 0x00, 0x01];
    match Record::parse(&cell) {
        Err(Error::UnknownSerialType(2)) => (),
        other => panic!("Expected UnknownSerialType, got {:?}", other),
    }
}

#[test]
fn test_record_parse_rejects_length_mismatch() {
    let r = Record::new(1, vec![SqlValue::Byte(7)]);
    let mut bytes = r.serialize().unwrap();
    bytes.push(0x00);
    assert!(matches!(
        Record::parse(&bytes),
        Err(Error::PayloadLengthMismatch)
    ));
}
