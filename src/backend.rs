//! backend orchestrates statement execution: prepare, run, and the
//! commit-or-rollback decision.
//!
//! A backend owns a pager pool, a monotonically increasing program id, the
//! transaction state, and a one-slot execution token that linearizes
//! programs: `exec` takes the token before spawning the program thread and
//! the thread returns it on exit, so at most one program runs per backend
//! at a time.  The caller's sole synchronization with a running program is
//! the pair of channels on the returned [`Execution`]: rows arrive on one,
//! the terminal status on the other.
//!
//! Transactions hold their write reservation across statements: `BEGIN`
//! acquires it, every statement inside the transaction reuses it, and
//! `COMMIT`/`ROLLBACK` (or any error) releases it.  Outside a transaction
//! each statement reserves for just its own run and commits on the way
//! out.
//!
//! Once a storage-level failure marks the backend failed, every further
//! `exec` refuses with `BackendFailed` until the process restarts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, never, Receiver, Sender};
use parking_lot::Mutex;

use crate::btree;
use crate::codegen::{self, PreparedStatement, StatementTag};
use crate::pager;
use crate::pool::{Mode, PagerPool, Reservation};
use crate::vm::{self, Program, Row, Step};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Backend has failed; restart required.")]
    BackendFailed,
    #[error("{0}")]
    Compile(#[from] codegen::Error),
    #[error("{0}")]
    Contention(#[from] crate::pool::Error),
    #[error("{0}")]
    Run(#[from] vm::Error),
    #[error("Commit failed and was rolled back: {0}")]
    CommitFailed(pager::Error),
    #[error("Program thread ended without reporting a status.")]
    LostProgram,
}

impl Error {
    /// Whether this failure leaves the backend unusable (storage-level
    /// damage) rather than merely aborting the statement.
    fn is_storage(&self) -> bool {
        fn btree_is_storage(e: &btree::Error) -> bool {
            matches!(
                e,
                btree::Error::Pager(_) | btree::Error::Record(_) | btree::Error::InvalidPageType(_)
            )
        }
        match self {
            Error::CommitFailed(_) => true,
            Error::Run(vm::Error::Pager(_)) => true,
            Error::Run(vm::Error::Btree(e)) => btree_is_storage(e),
            _ => false,
        }
    }
}

struct State {
    in_tx: bool,
    failed: bool,
    /// The write reservation held for the lifetime of an open transaction.
    tx_res: Option<Reservation>,
}

struct Inner {
    pool: PagerPool,
    next_pid: AtomicU64,
    state: Mutex<State>,
    token_tx: Sender<()>,
    token_rx: Receiver<()>,
}

#[derive(Clone)]
pub struct Backend {
    inner: Arc<Inner>,
}

/// A running (or finished) program.  Read rows from `rows` until the
/// channel closes, then `wait` for the terminal status.
pub struct Execution {
    pid: u64,
    pub rows: Receiver<Row>,
    done: Receiver<Result<(), Error>>,
}

impl Execution {
    pub fn pid(&self) -> u64 {
        self.pid
    }

    /// Blocks until the program finishes and returns its terminal status.
    pub fn wait(&self) -> Result<(), Error> {
        self.done.recv().map_err(|_| Error::LostProgram)?
    }

    /// Convenience: drain all rows, then wait.
    pub fn collect_rows(self) -> Result<Vec<Row>, Error> {
        let rows: Vec<Row> = self.rows.iter().collect();
        self.wait()?;
        Ok(rows)
    }
}

impl Backend {
    pub fn new(pool: PagerPool) -> Backend {
        let (token_tx, token_rx) = bounded(1);
        token_tx.send(()).expect("fresh token slot cannot be full");
        Backend {
            inner: Arc::new(Inner {
                pool,
                next_pid: AtomicU64::new(1),
                state: Mutex::new(State {
                    in_tx: false,
                    failed: false,
                    tx_res: None,
                }),
                token_tx,
                token_rx,
            }),
        }
    }

    /// Parses and compiles one statement.  Uses the transaction's
    /// reservation when one is open, so prepared statements see staged
    /// schema changes.
    pub fn prepare(&self, sql: &str) -> Result<PreparedStatement, Error> {
        let state = self.inner.state.lock();
        if state.failed {
            return Err(Error::BackendFailed);
        }
        if state.in_tx {
            // Use the transaction's reservation if a program is not
            // holding it right now; otherwise fall through and contend
            // like any reader.
            if let Some(res) = state.tx_res.as_ref() {
                let mut pager = res.pager();
                return Ok(codegen::compile(&mut pager, sql)?);
            }
        }
        drop(state);
        let res = self.inner.pool.reserve(Mode::Read)?;
        let mut pager = res.pager();
        Ok(codegen::compile(&mut pager, sql)?)
    }

    /// Starts `stmt` on its own thread.  Serialized behind the execution
    /// token; returns once the program is launched.
    pub fn exec(&self, stmt: &PreparedStatement) -> Result<Execution, Error> {
        self.exec_with_cancel(stmt, never())
    }

    /// As `exec`, racing every row emission against `cancel`.  A message
    /// (or a closed channel) stops the program at its next suspension
    /// point; the transaction disposition still runs on whatever flags the
    /// program had observed.
    pub fn exec_with_cancel(
        &self,
        stmt: &PreparedStatement,
        cancel: Receiver<()>,
    ) -> Result<Execution, Error> {
        let inner = self.inner.clone();
        inner.token_rx.recv().map_err(|_| Error::LostProgram)?;
        if inner.state.lock().failed {
            let _ = inner.token_tx.send(());
            return Err(Error::BackendFailed);
        }
        let pid = inner.next_pid.fetch_add(1, Ordering::SeqCst);
        let (rows_tx, rows_rx) = bounded::<Row>(0);
        let (done_tx, done_rx) = bounded::<Result<(), Error>>(1);
        let stmt = stmt.clone();
        std::thread::Builder::new()
            .name(format!("tinydb-program-{}", pid))
            .spawn(move || {
                tracing::debug!(pid, tag = ?stmt.tag, "program starting");
                let result = run_statement(&inner, &stmt, rows_tx, cancel);
                if let Err(e) = &result {
                    tracing::warn!(pid, error = %e, "program failed");
                }
                let _ = done_tx.send(result);
                let _ = inner.token_tx.send(());
            })
            .expect("spawning a program thread");
        Ok(Execution {
            pid,
            rows: rows_rx,
            done: done_rx,
        })
    }
}

/// Runs the program and applies the transaction disposition its flags ask
/// for.  Owns the reservation for the duration; an open transaction's
/// reservation is taken out of the backend state and put back afterwards.
fn run_statement(
    inner: &Arc<Inner>,
    stmt: &PreparedStatement,
    rows_tx: Sender<Row>,
    cancel: Receiver<()>,
) -> Result<(), Error> {
    let in_tx = inner.state.lock().in_tx;
    let mut res = if in_tx {
        inner
            .state
            .lock()
            .tx_res
            .take()
            .expect("open tx holds a reservation")
    } else {
        let mode = if stmt.tag.is_write() || stmt.tag == StatementTag::Begin {
            Mode::Write
        } else {
            Mode::Read
        };
        inner.pool.reserve(mode)?
    };

    let mut program = Program::new(stmt.instructions.clone(), !in_tx);
    tracing::trace!("program listing:\n{}", program.explain());
    let run_result = drive(&mut program, &res, &rows_tx, &cancel);
    drop(rows_tx);

    match run_result {
        Err(e) => {
            let e = Error::Run(e);
            res.pager().reset();
            let mut state = inner.state.lock();
            state.in_tx = false;
            if e.is_storage() {
                tracing::error!(error = %e, "storage failure; backend marked failed");
                state.failed = true;
            }
            drop(state);
            res.release();
            Err(e)
        }
        Ok(flags) => {
            if flags.rollback {
                res.pager().reset();
                inner.state.lock().in_tx = false;
                res.release();
                tracing::debug!("transaction rolled back");
                return Ok(());
            }
            if !flags.auto_commit {
                // BEGIN (or a statement inside an open transaction): no
                // storage side effect, keep the reservation.
                let mut state = inner.state.lock();
                state.in_tx = true;
                state.tx_res = Some(res);
                return Ok(());
            }
            // Commit: flush staged pages to the WAL and fold the WAL into
            // the database file.  A commit failure demotes to rollback.
            let commit_result = {
                let mut pager = res.pager();
                match pager.flush() {
                    Ok(0) => Ok(()),
                    Ok(n) => {
                        tracing::debug!(pages = n, "committed");
                        pager.checkpoint().map(|_| ())
                    }
                    Err(e) => Err(e),
                }
            };
            match commit_result {
                Ok(()) => {
                    inner.state.lock().in_tx = false;
                    res.release();
                    Ok(())
                }
                Err(e) => {
                    let e = Error::CommitFailed(e);
                    res.pager().reset();
                    let mut state = inner.state.lock();
                    state.in_tx = false;
                    state.failed = true;
                    drop(state);
                    res.release();
                    Err(e)
                }
            }
        }
    }
}

/// The step loop.  The pager lock is taken per step, never held across a
/// row emission, so concurrent readers stay unblocked while a consumer is
/// slow.
fn drive(
    program: &mut Program,
    res: &Reservation,
    rows_tx: &Sender<Row>,
    cancel: &Receiver<()>,
) -> Result<vm::Flags, vm::Error> {
    loop {
        let step = {
            let mut pager = res.pager();
            program.step(&mut pager)?
        };
        match step {
            Step::Processed => (),
            Step::Halt => return Ok(program.flags()),
            Step::Row(row) => {
                crossbeam_channel::select! {
                    send(rows_tx, row) -> sent => {
                        if sent.is_err() {
                            tracing::debug!("row consumer dropped; stopping program");
                            return Ok(program.flags());
                        }
                    }
                    recv(cancel) -> _ => {
                        tracing::debug!("program cancelled");
                        return Ok(program.flags());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::{MemSource, Pager};
    use crate::sql_value::SqlValue;

    const PAGE_SIZE: usize = 1024;

    fn backend() -> Backend {
        Backend::new(PagerPool::new(Pager::new(Box::new(MemSource::new(
            PAGE_SIZE,
        )))))
    }

    fn run(b: &Backend, sql: &str) -> Vec<Row> {
        let stmt = b.prepare(sql).unwrap_or_else(|e| panic!("prepare {}: {}", sql, e));
        let exec = b.exec(&stmt).unwrap();
        exec.collect_rows()
            .unwrap_or_else(|e| panic!("exec {}: {}", sql, e))
    }

    fn text_row(vals: &[&str]) -> Row {
        vals.iter()
            .map(|v| SqlValue::Text(String::from(*v)))
            .collect()
    }

    #[test]
    fn test_create_insert_select() {
        let b = backend();
        run(&b, "CREATE TABLE foo (name text)");
        run(&b, "INSERT INTO foo (name) VALUES ('bar')");
        assert_eq!(run(&b, "SELECT * FROM foo"), vec![text_row(&["bar"])]);
    }

    #[test]
    fn test_autocommit_makes_writes_visible_to_later_readers() {
        let b = backend();
        run(&b, "CREATE TABLE foo (name text)");
        run(&b, "INSERT INTO foo (name) VALUES ('bar')");
        run(&b, "INSERT INTO foo (name) VALUES ('baz')");
        assert_eq!(
            run(&b, "SELECT * FROM foo WHERE name = 'bar'"),
            vec![text_row(&["bar"])]
        );
    }

    #[test]
    fn test_transaction_commit() {
        let b = backend();
        run(&b, "CREATE TABLE foo (name text)");
        run(&b, "BEGIN");
        for i in 0..50 {
            run(&b, &format!("INSERT INTO foo (name) VALUES ('{}')", i));
        }
        run(&b, "COMMIT");
        let rows = run(&b, "SELECT * FROM foo WHERE name='49'");
        assert_eq!(rows, vec![text_row(&["49"])]);
    }

    #[test]
    fn test_transaction_rollback_discards_writes() {
        let b = backend();
        run(&b, "CREATE TABLE foo (name text)");
        run(&b, "BEGIN");
        run(&b, "INSERT INTO foo (name) VALUES ('doomed')");
        run(&b, "ROLLBACK");
        assert_eq!(run(&b, "SELECT * FROM foo"), Vec::<Row>::new());

        // The backend keeps working normally afterwards.
        run(&b, "INSERT INTO foo (name) VALUES ('kept')");
        assert_eq!(run(&b, "SELECT * FROM foo"), vec![text_row(&["kept"])]);
    }

    #[test]
    fn test_select_inside_transaction_sees_staged_writes() {
        let b = backend();
        run(&b, "CREATE TABLE foo (name text)");
        run(&b, "BEGIN");
        run(&b, "INSERT INTO foo (name) VALUES ('staged')");
        assert_eq!(run(&b, "SELECT * FROM foo"), vec![text_row(&["staged"])]);
        run(&b, "ROLLBACK");
        assert_eq!(run(&b, "SELECT * FROM foo"), Vec::<Row>::new());
    }

    #[test]
    fn test_pids_increase() {
        let b = backend();
        let stmt = b.prepare("BEGIN").unwrap();
        let e1 = b.exec(&stmt).unwrap();
        e1.wait().unwrap();
        let stmt = b.prepare("ROLLBACK").unwrap();
        let e2 = b.exec(&stmt).unwrap();
        e2.wait().unwrap();
        assert!(e2.pid() > e1.pid());
    }

    #[test]
    fn test_parse_error_leaves_backend_usable() {
        let b = backend();
        run(&b, "CREATE TABLE foo (name text)");
        assert!(matches!(
            b.prepare("SELEC * FROM foo"),
            Err(Error::Compile(_))
        ));
        run(&b, "INSERT INTO foo (name) VALUES ('still-works')");
        assert_eq!(run(&b, "SELECT * FROM foo").len(), 1);
    }

    #[test]
    fn test_cancellation_mid_select() {
        let b = backend();
        run(&b, "CREATE TABLE foo (name text)");
        for i in 0..20 {
            run(&b, &format!("INSERT INTO foo (name) VALUES ('{}')", i));
        }
        let stmt = b.prepare("SELECT * FROM foo").unwrap();
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let exec = b.exec_with_cancel(&stmt, cancel_rx).unwrap();
        // Take two rows, then cancel; the program must wind down cleanly.
        let _ = exec.rows.recv().unwrap();
        let _ = exec.rows.recv().unwrap();
        cancel_tx.send(()).unwrap();
        exec.wait().unwrap();
        // And the backend is still serviceable.
        assert_eq!(run(&b, "SELECT * FROM foo").len(), 20);
    }

    #[test]
    fn test_rows_arrive_in_traversal_order() {
        let b = backend();
        run(&b, "CREATE TABLE n (v int)");
        for v in [3, 1, 2] {
            run(&b, &format!("INSERT INTO n (v) VALUES ({})", v));
        }
        // Rows come back in rowid (insertion) order.
        assert_eq!(
            run(&b, "SELECT v FROM n"),
            vec![
                vec![SqlValue::Int(3)],
                vec![SqlValue::Int(1)],
                vec![SqlValue::Int(2)]
            ]
        );
    }
}
