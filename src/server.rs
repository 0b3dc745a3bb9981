//! server speaks the length-prefixed TCP protocol.
//!
//! A command is a 5-byte header — one control byte and a 4-byte big-endian
//! payload length — followed by the payload: UTF-8 SQL text holding one or
//! more semicolon-terminated statements.  Statements run strictly in
//! order.  For each statement the response is its rows, one per line with
//! `|` between values, closed by an exit line: `OK <row-count>` on
//! success, `ERR <message>` on a statement error.  Statement errors leave
//! the connection open; protocol errors (unknown control byte, payload
//! over `max_receive_buffer`) close it.
//!
//! Each connection is served by its own thread; statements from different
//! connections interleave only at statement granularity, serialized by the
//! backend's execution token.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};

use crate::backend::Backend;
use crate::vm::Row;

/// Control byte: execute the payload as SQL.
pub const CMD_QUERY: u8 = 0x01;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Connection I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Payload of {size} bytes exceeds the {max} byte receive buffer.")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Unknown control byte {0:#04x}.")]
    UnknownCommand(u8),
}

/// Accepts connections forever, one thread per connection.
pub fn serve(listener: TcpListener, backend: Backend, max_receive_buffer: usize) -> Result<(), Error> {
    tracing::info!(addr = %listener.local_addr()?, "listening");
    for stream in listener.incoming() {
        let stream = stream?;
        let backend = backend.clone();
        let peer = stream.peer_addr().ok();
        std::thread::spawn(move || {
            tracing::debug!(?peer, "connection open");
            match handle_connection(stream, backend, max_receive_buffer) {
                Ok(()) => tracing::debug!(?peer, "connection closed"),
                Err(e) => tracing::warn!(?peer, error = %e, "connection dropped"),
            }
        });
    }
    Ok(())
}

fn handle_connection(
    stream: TcpStream,
    backend: Backend,
    max_receive_buffer: usize,
) -> Result<(), Error> {
    let mut reader = stream.try_clone()?;
    let mut writer = BufWriter::new(stream);
    loop {
        let mut control = [0_u8; 1];
        match reader.read_exact(&mut control) {
            Ok(()) => (),
            // A clean close between commands.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        }
        let len = reader.read_u32::<BigEndian>()? as usize;
        if control[0] != CMD_QUERY {
            return Err(Error::UnknownCommand(control[0]));
        }
        if len > max_receive_buffer {
            return Err(Error::PayloadTooLarge {
                size: len,
                max: max_receive_buffer,
            });
        }
        let mut payload = vec![0_u8; len];
        reader.read_exact(&mut payload)?;
        let text = String::from_utf8_lossy(&payload).into_owned();

        for stmt_text in text.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            match run_statement(&backend, stmt_text, &mut writer) {
                Ok(count) => writeln!(writer, "OK {}", count)?,
                Err(msg) => writeln!(writer, "ERR {}", msg)?,
            }
            writer.flush()?;
        }
    }
}

/// Runs one statement, streaming its rows; returns the row count or the
/// error message for the exit line.
fn run_statement(
    backend: &Backend,
    sql: &str,
    writer: &mut impl Write,
) -> Result<usize, String> {
    let stmt = backend.prepare(sql).map_err(|e| e.to_string())?;
    let exec = backend.exec(&stmt).map_err(|e| e.to_string())?;
    let mut count = 0;
    for row in exec.rows.iter() {
        writeln!(writer, "{}", format_row(&row)).map_err(|e| e.to_string())?;
        count += 1;
    }
    exec.wait().map_err(|e| e.to_string())?;
    Ok(count)
}

fn format_row(row: &Row) -> String {
    use itertools::Itertools;
    row.iter().map(|v| v.to_string()).join("|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::{MemSource, Pager};
    use crate::pool::PagerPool;
    use byteorder::WriteBytesExt;
    use std::io::{BufRead, BufReader};

    fn start_server() -> std::net::SocketAddr {
        let backend = Backend::new(PagerPool::new(Pager::new(Box::new(MemSource::new(1024)))));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || serve(listener, backend, 4096));
        addr
    }

    fn send_query(stream: &mut TcpStream, sql: &str) {
        stream.write_u8(CMD_QUERY).unwrap();
        stream.write_u32::<BigEndian>(sql.len() as u32).unwrap();
        stream.write_all(sql.as_bytes()).unwrap();
        stream.flush().unwrap();
    }

    #[test]
    fn test_query_round_trip() {
        let addr = start_server();
        let mut stream = TcpStream::connect(addr).unwrap();
        send_query(
            &mut stream,
            "CREATE TABLE foo (name text); \
             INSERT INTO foo (name) VALUES ('bar'); \
             SELECT * FROM foo;",
        );
        let mut lines = BufReader::new(stream.try_clone().unwrap()).lines();
        assert_eq!(lines.next().unwrap().unwrap(), "OK 0");
        assert_eq!(lines.next().unwrap().unwrap(), "OK 0");
        assert_eq!(lines.next().unwrap().unwrap(), "bar");
        assert_eq!(lines.next().unwrap().unwrap(), "OK 1");
    }

    #[test]
    fn test_statement_error_keeps_connection_open() {
        let addr = start_server();
        let mut stream = TcpStream::connect(addr).unwrap();
        send_query(&mut stream, "SELECT * FROM missing;");
        let mut lines = BufReader::new(stream.try_clone().unwrap()).lines();
        let line = lines.next().unwrap().unwrap();
        assert!(line.starts_with("ERR "), "got: {}", line);

        // Same connection still serves further commands.
        send_query(&mut stream, "CREATE TABLE t (a text);");
        assert_eq!(lines.next().unwrap().unwrap(), "OK 0");
    }

    #[test]
    fn test_oversized_payload_closes_connection() {
        let addr = start_server();
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_u8(CMD_QUERY).unwrap();
        stream.write_u32::<BigEndian>(1 << 30).unwrap();
        stream.flush().unwrap();
        // The server drops the connection without a response.
        let mut buf = String::new();
        let n = BufReader::new(stream).read_line(&mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_unknown_control_byte_closes_connection() {
        let addr = start_server();
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_u8(0x7f).unwrap();
        stream.write_u32::<BigEndian>(0).unwrap();
        stream.flush().unwrap();
        let mut buf = String::new();
        let n = BufReader::new(stream).read_line(&mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_multiple_rows_stream_in_order() {
        let addr = start_server();
        let mut stream = TcpStream::connect(addr).unwrap();
        send_query(
            &mut stream,
            "CREATE TABLE t (a text, b int); \
             INSERT INTO t (a, b) VALUES ('x', 1); \
             INSERT INTO t (a, b) VALUES ('y', 2); \
             SELECT a, b FROM t;",
        );
        let mut lines = BufReader::new(stream.try_clone().unwrap()).lines();
        let mut collected = vec![];
        for _ in 0..6 {
            collected.push(lines.next().unwrap().unwrap());
        }
        assert_eq!(
            collected,
            vec!["OK 0", "OK 0", "OK 0", "x|1", "y|2", "OK 2"]
        );
    }
}
