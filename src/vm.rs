//! vm executes compiled statement programs against the storage layer.
//!
//! The machine is a register-and-cursor design with an opcode set modeled
//! on SQLite's: registers hold typed values, cursors hold btree positions,
//! and control flow is explicit jump targets in `P2`.  Execution fetches
//! the instruction at `pc`, dispatches, and either falls through, jumps,
//! emits a row, or halts.  Running past the final instruction halts too.
//!
//! Rows are handed to the consumer through a rendezvous channel; the
//! program parks at every `ResultRow` until the consumer takes the row or
//! cancels.  All other opcodes are non-blocking apart from page reads that
//! miss the cache.

use std::collections::HashMap;

use crossbeam_channel::{Receiver, Sender};

use crate::btree;
use crate::btree::cursor::Cursor;
use crate::pager::{PageNum, Pager};
use crate::record::{Record, RowId};
use crate::sql_value::SqlValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Integer,
    String,
    Null,
    SCopy,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    OpenRead,
    OpenWrite,
    Close,
    Rewind,
    Next,
    Column,
    ResultRow,
    MakeRecord,
    RowId,
    Insert,
    CreateTable,
    AutoCommit,
    Halt,
}

/// One instruction.  The meaning of `p1..p3` depends on the opcode; `p4`
/// carries string payloads (values, table names).
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: OpCode,
    pub p1: i64,
    pub p2: i64,
    pub p3: i64,
    pub p4: Option<String>,
}

impl Instruction {
    pub fn new(op: OpCode, p1: i64, p2: i64, p3: i64, p4: Option<String>) -> Instruction {
        Instruction { op, p1, p2, p3, p4 }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {} {} {} {}",
            self.op,
            self.p1,
            self.p2,
            self.p3,
            self.p4.as_deref().unwrap_or("")
        )
    }
}

/// A register value.  `Unspec` is the state of a register nothing has
/// written; reading one is a program bug, not a NULL.
#[derive(Debug, Clone, PartialEq)]
pub enum Reg {
    Unspec,
    Null,
    Int(i64),
    Text(String),
    Record(Record),
}

/// The transaction disposition a finished program reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub auto_commit: bool,
    pub rollback: bool,
}

pub type Row = Vec<SqlValue>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Type mismatch in {op}: {found}")]
    TypeMismatch { op: &'static str, found: String },
    #[error("Register {0} was read before being written.")]
    UnsetRegister(usize),
    #[error("Cursor {0} is not open.")]
    UnknownCursor(usize),
    #[error("Malformed program: {0}")]
    InvalidProgram(String),
    #[error("Column {0} is beyond the record.")]
    ColumnOutOfRange(usize),
    #[error("Btree error: {0}")]
    Btree(#[from] btree::Error),
    #[error("Pager error: {0}")]
    Pager(#[from] crate::pager::Error),
}

/// What one step produced.
#[derive(Debug, PartialEq)]
pub enum Step {
    /// Instruction retired; keep stepping.
    Processed,
    /// A result row to hand to the consumer.
    Row(Row),
    /// The program halted.
    Halt,
}

pub struct Program {
    instructions: Vec<Instruction>,
    pc: usize,
    regs: Vec<Reg>,
    cursors: HashMap<usize, Cursor>,
    flags: Flags,
    halted: bool,
}

fn usize_operand(v: i64, what: &str) -> Result<usize, Error> {
    usize::try_from(v).map_err(|_| Error::InvalidProgram(format!("negative {} operand: {}", what, v)))
}

impl Program {
    /// Builds a program.  `auto_commit` seeds the flags with the backend's
    /// current transaction state; `AutoCommit` instructions overwrite it.
    pub fn new(instructions: Vec<Instruction>, auto_commit: bool) -> Program {
        Program {
            instructions,
            pc: 0,
            regs: vec![],
            cursors: HashMap::new(),
            flags: Flags {
                auto_commit,
                rollback: false,
            },
            halted: false,
        }
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// A human-readable listing of the program.
    pub fn explain(&self) -> String {
        use itertools::Itertools;
        self.instructions
            .iter()
            .enumerate()
            .map(|(addr, inst)| format!("{:4} | {}", addr, inst))
            .join("\n")
    }

    fn reg(&self, idx: i64) -> Result<&Reg, Error> {
        let idx = usize_operand(idx, "register")?;
        match self.regs.get(idx) {
            None | Some(Reg::Unspec) => Err(Error::UnsetRegister(idx)),
            Some(r) => Ok(r),
        }
    }

    fn set_reg(&mut self, idx: i64, v: Reg) -> Result<(), Error> {
        let idx = usize_operand(idx, "register")?;
        if idx >= self.regs.len() {
            self.regs.resize(idx + 1, Reg::Unspec);
        }
        self.regs[idx] = v;
        Ok(())
    }

    fn reg_int(&self, idx: i64, op: &'static str) -> Result<i64, Error> {
        match self.reg(idx)? {
            Reg::Int(v) => Ok(*v),
            other => Err(Error::TypeMismatch {
                op,
                found: format!("{:?}", other),
            }),
        }
    }

    fn cursor_mut(&mut self, idx: i64) -> Result<&mut Cursor, Error> {
        let idx = usize_operand(idx, "cursor")?;
        self.cursors.get_mut(&idx).ok_or(Error::UnknownCursor(idx))
    }

    fn jump(&self, target: i64) -> Result<usize, Error> {
        let target = usize_operand(target, "jump target")?;
        // Jumping to one past the end is a legal way to stop.
        if target > self.instructions.len() {
            return Err(Error::InvalidProgram(format!(
                "jump target {} outside program of {} instructions",
                target,
                self.instructions.len()
            )));
        }
        Ok(target)
    }

    /// Ordered comparison used by the six comparison opcodes.  Typed: ints
    /// numerically, strings lexicographically.  NULL never orders against
    /// anything, so every predicate on NULL is false.  Mixing ints and
    /// strings is a type error.
    fn compare(&self, a: i64, b: i64, op: &'static str) -> Result<Option<std::cmp::Ordering>, Error> {
        let va = self.reg(a)?;
        let vb = self.reg(b)?;
        match (va, vb) {
            (Reg::Null, _) | (_, Reg::Null) => Ok(None),
            (Reg::Int(x), Reg::Int(y)) => Ok(Some(x.cmp(y))),
            (Reg::Text(x), Reg::Text(y)) => Ok(Some(x.cmp(y))),
            (x, y) => Err(Error::TypeMismatch {
                op,
                found: format!("{:?} vs {:?}", x, y),
            }),
        }
    }

    fn reg_to_value(&self, idx: i64) -> Result<SqlValue, Error> {
        match self.reg(idx)? {
            Reg::Null => Ok(SqlValue::Null),
            Reg::Int(v) => Ok(SqlValue::Int(*v)),
            Reg::Text(s) => Ok(SqlValue::Text(s.clone())),
            other => Err(Error::TypeMismatch {
                op: "ResultRow",
                found: format!("{:?}", other),
            }),
        }
    }

    /// Executes the instruction at `pc`.
    pub fn step(&mut self, pager: &mut Pager) -> Result<Step, Error> {
        if self.halted || self.pc >= self.instructions.len() {
            self.halted = true;
            return Ok(Step::Halt);
        }
        let inst = self.instructions[self.pc].clone();
        let mut next_pc = self.pc + 1;

        match inst.op {
            OpCode::Integer => {
                self.set_reg(inst.p2, Reg::Int(inst.p1))?;
            }
            OpCode::String => {
                let s = inst.p4.clone().unwrap_or_default();
                self.set_reg(inst.p2, Reg::Text(s))?;
            }
            OpCode::Null => {
                self.set_reg(inst.p2, Reg::Null)?;
            }
            OpCode::SCopy => {
                let v = self.reg(inst.p1)?.clone();
                self.set_reg(inst.p2, v)?;
            }
            OpCode::Eq | OpCode::Ne | OpCode::Lt | OpCode::Le | OpCode::Gt | OpCode::Ge => {
                use std::cmp::Ordering::*;
                let name = match inst.op {
                    OpCode::Eq => "Eq",
                    OpCode::Ne => "Ne",
                    OpCode::Lt => "Lt",
                    OpCode::Le => "Le",
                    OpCode::Gt => "Gt",
                    _ => "Ge",
                };
                let holds = match self.compare(inst.p1, inst.p3, name)? {
                    None => false,
                    Some(ord) => match inst.op {
                        OpCode::Eq => ord == Equal,
                        OpCode::Ne => ord != Equal,
                        OpCode::Lt => ord == Less,
                        OpCode::Le => ord != Greater,
                        OpCode::Gt => ord == Greater,
                        _ => ord != Less,
                    },
                };
                if holds {
                    next_pc = self.jump(inst.p2)?;
                }
            }
            OpCode::OpenRead | OpCode::OpenWrite => {
                let cur = usize_operand(inst.p1, "cursor")?;
                let root = self.reg_int(inst.p2, "Open")?;
                let root = usize::try_from(root).map_err(|_| {
                    Error::InvalidProgram(format!("bad root page {} for cursor {}", root, cur))
                })? as PageNum;
                let cursor = if inst.op == OpCode::OpenRead {
                    Cursor::new_read(root)
                } else {
                    Cursor::new_write(root)
                };
                self.cursors.insert(cur, cursor);
            }
            OpCode::Close => {
                let cur = usize_operand(inst.p1, "cursor")?;
                self.cursors.remove(&cur);
            }
            OpCode::Rewind => {
                let jmp = inst.p2;
                let cursor = self.cursor_mut(inst.p1)?;
                let has_rows = cursor.rewind(pager)?;
                if !has_rows {
                    next_pc = self.jump(jmp)?;
                }
            }
            OpCode::Next => {
                let jmp = inst.p2;
                let cursor = self.cursor_mut(inst.p1)?;
                let more = cursor.next(pager)?;
                if more {
                    next_pc = self.jump(jmp)?;
                }
            }
            OpCode::Column => {
                let col = usize_operand(inst.p2, "column")?;
                let cursor = self.cursor_mut(inst.p1)?;
                let rec = cursor.current(pager)?;
                let value = rec
                    .fields
                    .get(col)
                    .ok_or(Error::ColumnOutOfRange(col))?
                    .clone();
                let reg = match value {
                    SqlValue::Null => Reg::Null,
                    SqlValue::Byte(b) => Reg::Int(b as i64),
                    SqlValue::Int(i) => Reg::Int(i),
                    SqlValue::Text(s) => Reg::Text(s),
                };
                self.set_reg(inst.p3, reg)?;
            }
            OpCode::ResultRow => {
                let start = inst.p1;
                let n = usize_operand(inst.p2, "column count")?;
                let mut row = Vec::with_capacity(n);
                for i in 0..n {
                    row.push(self.reg_to_value(start + i as i64)?);
                }
                self.pc = next_pc;
                return Ok(Step::Row(row));
            }
            OpCode::MakeRecord => {
                let start = inst.p1;
                let n = usize_operand(inst.p2, "field count")?;
                let mut fields = Vec::with_capacity(n);
                for i in 0..n {
                    let v = match self.reg_to_value(start + i as i64)? {
                        // Narrow ints that fit one octet to the byte form.
                        SqlValue::Int(x) if (0..=255).contains(&x) => SqlValue::Byte(x as u8),
                        v => v,
                    };
                    fields.push(v);
                }
                self.set_reg(inst.p3, Reg::Record(Record::new(0, fields)))?;
            }
            OpCode::RowId => {
                let cursor = self.cursor_mut(inst.p1)?;
                let rowid = cursor.next_rowid(pager)?;
                self.set_reg(inst.p2, Reg::Int(rowid))?;
            }
            OpCode::Insert => {
                let key = self.reg_int(inst.p3, "Insert")? as RowId;
                let mut rec = match self.reg(inst.p2)? {
                    Reg::Record(r) => r.clone(),
                    other => {
                        return Err(Error::TypeMismatch {
                            op: "Insert",
                            found: format!("{:?}", other),
                        })
                    }
                };
                rec.rowid = key;
                let cursor = self.cursor_mut(inst.p1)?;
                cursor.insert(pager, &rec)?;
            }
            OpCode::CreateTable => {
                let page = pager.allocate(btree::PageType::Leaf)?;
                self.set_reg(inst.p1, Reg::Int(page.number as i64))?;
            }
            OpCode::AutoCommit => {
                self.flags = Flags {
                    auto_commit: inst.p1 != 0,
                    rollback: inst.p2 != 0,
                };
                self.halted = true;
                return Ok(Step::Halt);
            }
            OpCode::Halt => {
                self.halted = true;
                return Ok(Step::Halt);
            }
        }

        self.pc = next_pc;
        Ok(Step::Processed)
    }

    /// Runs to completion, sending rows over `out`.  Each send parks until
    /// the consumer takes the row or `cancel` fires; cancellation stops the
    /// program where it stands and reports the flags observed so far.
    pub fn run(
        &mut self,
        pager: &mut Pager,
        out: &Sender<Row>,
        cancel: &Receiver<()>,
    ) -> Result<Flags, Error> {
        loop {
            match self.step(pager)? {
                Step::Processed => (),
                Step::Halt => return Ok(self.flags),
                Step::Row(row) => {
                    crossbeam_channel::select! {
                        send(out, row) -> res => {
                            if res.is_err() {
                                // Consumer went away; treat like cancellation.
                                tracing::debug!("row consumer dropped; stopping program");
                                return Ok(self.flags);
                            }
                        }
                        recv(cancel) -> _ => {
                            tracing::debug!("program cancelled at row emission");
                            return Ok(self.flags);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::{AccessMode, MemSource};
    use OpCode::*;

    const PAGE_SIZE: usize = 1024;

    fn pager() -> Pager {
        let mut p = Pager::new(Box::new(MemSource::new(PAGE_SIZE)));
        p.set_mode(AccessMode::Write);
        p
    }

    fn inst(op: OpCode, p1: i64, p2: i64, p3: i64) -> Instruction {
        Instruction::new(op, p1, p2, p3, None)
    }

    /// Steps until halt, collecting rows.
    fn run_collect(prog: &mut Program, pager: &mut Pager) -> Vec<Row> {
        let mut rows = vec![];
        loop {
            match prog.step(pager).unwrap() {
                Step::Processed => (),
                Step::Row(r) => rows.push(r),
                Step::Halt => return rows,
            }
        }
    }

    #[test]
    fn test_load_and_result_row() {
        let mut prog = Program::new(
            vec![
                inst(Integer, 7, 0, 0),
                Instruction::new(String, 0, 1, 0, Some("hi".to_string())),
                inst(Null, 0, 2, 0),
                inst(ResultRow, 0, 3, 0),
                inst(Halt, 0, 0, 0),
            ],
            true,
        );
        let rows = run_collect(&mut prog, &mut pager());
        assert_eq!(
            rows,
            vec![vec![
                SqlValue::Int(7),
                SqlValue::Text("hi".to_string()),
                SqlValue::Null
            ]]
        );
    }

    #[test]
    fn test_scopy() {
        let mut prog = Program::new(
            vec![
                inst(Integer, 9, 0, 0),
                inst(SCopy, 0, 1, 0),
                inst(ResultRow, 1, 1, 0),
                inst(Halt, 0, 0, 0),
            ],
            true,
        );
        let rows = run_collect(&mut prog, &mut pager());
        assert_eq!(rows, vec![vec![SqlValue::Int(9)]]);
    }

    #[test]
    fn test_comparison_jumps() {
        // (a, b, op, should_jump)
        let cases: Vec<(Reg, Reg, OpCode, bool)> = vec![
            (Reg::Int(1), Reg::Int(1), Eq, true),
            (Reg::Int(1), Reg::Int(2), Eq, false),
            (Reg::Int(1), Reg::Int(2), Ne, true),
            (Reg::Int(1), Reg::Int(2), Lt, true),
            (Reg::Int(2), Reg::Int(2), Le, true),
            (Reg::Int(3), Reg::Int(2), Gt, true),
            (Reg::Int(2), Reg::Int(2), Ge, true),
            (Reg::Int(1), Reg::Int(2), Ge, false),
            (
                Reg::Text("a".to_string()),
                Reg::Text("b".to_string()),
                Lt,
                true,
            ),
            (
                Reg::Text("b".to_string()),
                Reg::Text("b".to_string()),
                Eq,
                true,
            ),
            // NULL never compares true, not even to itself.
            (Reg::Null, Reg::Null, Eq, false),
            (Reg::Null, Reg::Int(1), Lt, false),
            (Reg::Int(1), Reg::Null, Ne, false),
        ];
        for (a, b, op, should_jump) in cases {
            println!("Case: {:?} {:?} {:?}", a, op, b);
            // Jump lands on an extra ResultRow; fallthrough halts first.
            let mut prog = Program::new(
                vec![
                    inst(op, 0, 3, 1),
                    inst(Integer, 0, 2, 0),
                    inst(Halt, 0, 0, 0),
                    inst(Integer, 1, 2, 0),
                    inst(ResultRow, 2, 1, 0),
                    inst(Halt, 0, 0, 0),
                ],
                true,
            );
            prog.regs = vec![a, b];
            let mut pgr = pager();
            let rows = run_collect(&mut prog, &mut pgr);
            assert_eq!(!rows.is_empty(), should_jump);
        }
    }

    #[test]
    fn test_comparing_int_to_text_is_type_error() {
        let mut prog = Program::new(vec![inst(Eq, 0, 2, 1), inst(Halt, 0, 0, 0)], true);
        prog.regs = vec![Reg::Int(1), Reg::Text("1".to_string())];
        let err = prog.step(&mut pager()).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_unset_register_is_an_error() {
        let mut prog = Program::new(vec![inst(SCopy, 5, 0, 0)], true);
        assert!(matches!(
            prog.step(&mut pager()),
            Err(Error::UnsetRegister(5))
        ));
    }

    #[test]
    fn test_create_insert_scan_cycle() {
        // Create a tree, insert two rows through the VM, scan them back.
        let mut pgr = pager();
        let mut prog = Program::new(
            vec![
                // Build the table and a write cursor on it.
                inst(CreateTable, 0, 0, 0), // reg0 = new root
                inst(OpenWrite, 0, 0, 1),
                // Row 1: ("alpha")
                Instruction::new(String, 0, 1, 0, Some("alpha".to_string())),
                inst(MakeRecord, 1, 1, 2),
                inst(RowId, 0, 3, 0),
                inst(Insert, 0, 2, 3),
                // Row 2: ("beta")
                Instruction::new(String, 0, 1, 0, Some("beta".to_string())),
                inst(MakeRecord, 1, 1, 2),
                inst(RowId, 0, 3, 0),
                inst(Insert, 0, 2, 3),
                inst(Close, 0, 0, 0),
                // Scan it back: cursor 1, jump-if-empty to the halt at 16.
                inst(OpenRead, 1, 0, 1),
                inst(Rewind, 1, 16, 0),
                inst(Column, 1, 0, 4), // addr 13: loop body
                inst(ResultRow, 4, 1, 0),
                inst(Next, 1, 13, 0),
                inst(Halt, 0, 0, 0), // addr 16
            ],
            true,
        );
        let rows = run_collect(&mut prog, &mut pgr);
        assert_eq!(
            rows,
            vec![
                vec![SqlValue::Text("alpha".to_string())],
                vec![SqlValue::Text("beta".to_string())],
            ]
        );
    }

    #[test]
    fn test_rewind_jumps_on_empty_table() {
        let mut pgr = pager();
        let root = pgr.allocate(crate::btree::PageType::Leaf).unwrap().number;
        let mut prog = Program::new(
            vec![
                inst(Integer, root as i64, 0, 0),
                inst(OpenRead, 0, 0, 1),
                inst(Rewind, 0, 5, 0),
                inst(Integer, 1, 1, 0), // skipped
                inst(ResultRow, 1, 1, 0),
                inst(Halt, 0, 0, 0),
            ],
            true,
        );
        let rows = run_collect(&mut prog, &mut pgr);
        assert!(rows.is_empty());
    }

    #[test]
    fn test_make_record_narrows_small_ints() {
        let mut prog = Program::new(
            vec![
                inst(Integer, 200, 0, 0),
                inst(Integer, 70000, 1, 0),
                inst(MakeRecord, 0, 2, 2),
                inst(Halt, 0, 0, 0),
            ],
            true,
        );
        let mut pgr = pager();
        while prog.step(&mut pgr).unwrap() != Step::Halt {}
        match &prog.regs[2] {
            Reg::Record(rec) => {
                assert_eq!(
                    rec.fields,
                    vec![SqlValue::Byte(200), SqlValue::Int(70000)]
                );
            }
            other => panic!("Expected a record register, found {:?}", other),
        }
    }

    #[test]
    fn test_autocommit_sets_flags_and_halts() {
        let cases = vec![
            (0, 0, Flags { auto_commit: false, rollback: false }), // BEGIN
            (1, 0, Flags { auto_commit: true, rollback: false }),  // COMMIT
            (1, 1, Flags { auto_commit: true, rollback: true }),   // ROLLBACK
        ];
        for (p1, p2, expected) in cases {
            println!("Case: AutoCommit {} {}", p1, p2);
            let mut prog = Program::new(
                vec![inst(AutoCommit, p1, p2, 0), inst(Integer, 1, 0, 0)],
                true,
            );
            let mut pgr = pager();
            assert_eq!(prog.step(&mut pgr).unwrap(), Step::Halt);
            assert_eq!(prog.flags(), expected);
        }
    }

    #[test]
    fn test_running_past_the_end_halts() {
        let mut prog = Program::new(vec![inst(Integer, 1, 0, 0)], true);
        let mut pgr = pager();
        assert_eq!(prog.step(&mut pgr).unwrap(), Step::Processed);
        assert_eq!(prog.step(&mut pgr).unwrap(), Step::Halt);
        assert_eq!(prog.step(&mut pgr).unwrap(), Step::Halt);
    }

    #[test]
    fn test_run_delivers_rows_over_channel() {
        let mut prog = Program::new(
            vec![
                inst(Integer, 41, 0, 0),
                inst(ResultRow, 0, 1, 0),
                inst(Integer, 42, 0, 0),
                inst(ResultRow, 0, 1, 0),
                inst(Halt, 0, 0, 0),
            ],
            true,
        );
        let (out_tx, out_rx) = crossbeam_channel::bounded::<Row>(0);
        let (_cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = std::thread::spawn(move || {
            let mut pgr = Pager::new(Box::new(MemSource::new(PAGE_SIZE)));
            prog.run(&mut pgr, &out_tx, &cancel_rx).unwrap()
        });
        let rows: Vec<Row> = out_rx.iter().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec![SqlValue::Int(42)]);
        let flags = handle.join().unwrap();
        assert!(flags.auto_commit);
    }

    #[test]
    fn test_run_cancellation_stops_emission() {
        // An endless-looking emitter: cancellation must stop it.
        let mut prog = Program::new(
            vec![
                inst(Integer, 1, 0, 0),
                inst(ResultRow, 0, 1, 0),
                inst(Eq, 0, 1, 0), // reg0 == reg0: always jumps back to emit
                inst(Halt, 0, 0, 0),
            ],
            true,
        );
        let (out_tx, out_rx) = crossbeam_channel::bounded::<Row>(0);
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = std::thread::spawn(move || {
            let mut pgr = Pager::new(Box::new(MemSource::new(PAGE_SIZE)));
            prog.run(&mut pgr, &out_tx, &cancel_rx)
        });
        // Take one row, then cancel.
        let first = out_rx.recv().unwrap();
        assert_eq!(first, vec![SqlValue::Int(1)]);
        cancel_tx.send(()).unwrap();
        let flags = handle.join().unwrap().unwrap();
        assert!(flags.auto_commit);
    }
}
