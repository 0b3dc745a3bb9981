//! codegen lowers statement ASTs into VM programs.
//!
//! The generator keeps an instruction buffer, a register allocator (a free
//! list plus a contiguous-block bump allocator), a cursor counter, and a
//! label table.  Forward branches name labels — negative sentinels stored
//! in `P2` — and `finalize` rewrites every sentinel to its resolved
//! address once all code is emitted.
//!
//! WHERE clauses compile to straight-line comparison-and-jump code with no
//! intermediate boolean registers.  AND/OR trees are first flattened into
//! n-ary nodes, then emitted against a pair of target labels (true-exit,
//! false-exit) of which exactly one is the fall-through point: conjunctive
//! positions emit the opposite-sense jump to the false exit, disjunctive
//! positions the same-sense jump to the true exit.

use crate::ast::{self, Constant, Expr, Op, Statement};
use crate::grammar;
use crate::pager::Pager;
use crate::parser::ParseError;
use crate::schema::{self, TableDef};
use crate::sql_type::SqlType;
use crate::vm::{Instruction, OpCode};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Parse(#[from] ParseError),
    #[error("No such table: {0}")]
    UnknownTable(String),
    #[error("No such column: {0}")]
    UnknownColumn(String),
    #[error("Table {0} already exists.")]
    TableExists(String),
    #[error("Column {column} expects {expected}, got {found}.")]
    ValueType {
        column: String,
        expected: SqlType,
        found: String,
    },
    #[error("{0} values supplied for {1} columns.")]
    ValueCountMismatch(usize, usize),
    #[error("Schema error: {0}")]
    Schema(#[from] schema::Error),
    #[error("Not supported: {0}")]
    Unsupported(String),
    #[error("Cannot evaluate expression: {0}")]
    ConstEval(String),
    #[error("Label {0} was never resolved.")]
    UnresolvedLabel(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementTag {
    Select,
    Insert,
    Create,
    Begin,
    Commit,
    Rollback,
}

impl StatementTag {
    pub fn is_write(self) -> bool {
        matches!(self, StatementTag::Insert | StatementTag::Create)
    }
}

/// The compiled form of one statement.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub tag: StatementTag,
    /// Result column names; empty for statements that return no rows.
    pub columns: Vec<String>,
    pub instructions: Vec<Instruction>,
}

/// A forward-referenced address: a negative sentinel usable as a `P2`
/// operand until `finalize` patches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Label(i64);

struct CodeGen {
    instructions: Vec<Instruction>,
    labels: Vec<Option<usize>>,
    next_reg: i64,
    free_regs: Vec<i64>,
    next_cursor: i64,
}

impl CodeGen {
    fn new() -> CodeGen {
        CodeGen {
            instructions: vec![],
            labels: vec![],
            next_reg: 0,
            free_regs: vec![],
            next_cursor: 0,
        }
    }

    fn op0(&mut self, op: OpCode) -> usize {
        self.emit(Instruction::new(op, 0, 0, 0, None))
    }

    fn op1(&mut self, op: OpCode, p1: i64) -> usize {
        self.emit(Instruction::new(op, p1, 0, 0, None))
    }

    fn op2(&mut self, op: OpCode, p1: i64, p2: i64) -> usize {
        self.emit(Instruction::new(op, p1, p2, 0, None))
    }

    fn op3(&mut self, op: OpCode, p1: i64, p2: i64, p3: i64) -> usize {
        self.emit(Instruction::new(op, p1, p2, p3, None))
    }

    fn op4(&mut self, op: OpCode, p1: i64, p2: i64, p3: i64, p4: String) -> usize {
        self.emit(Instruction::new(op, p1, p2, p3, Some(p4)))
    }

    fn emit(&mut self, inst: Instruction) -> usize {
        self.instructions.push(inst);
        self.instructions.len() - 1
    }

    fn addr(&self) -> usize {
        self.instructions.len()
    }

    fn alloc_reg(&mut self) -> i64 {
        if let Some(r) = self.free_regs.pop() {
            return r;
        }
        let r = self.next_reg;
        self.next_reg += 1;
        r
    }

    fn free_reg(&mut self, r: i64) {
        self.free_regs.push(r);
    }

    /// A run of `n` adjacent registers, as `MakeRecord`/`ResultRow` need.
    fn alloc_block(&mut self, n: usize) -> i64 {
        let start = self.next_reg;
        self.next_reg += n as i64;
        start
    }

    fn alloc_cursor(&mut self) -> i64 {
        let c = self.next_cursor;
        self.next_cursor += 1;
        c
    }

    fn alloc_label(&mut self) -> Label {
        self.labels.push(None);
        Label(-(self.labels.len() as i64))
    }

    /// Pins `label` to the next instruction's address.
    fn resolve_label(&mut self, label: Label) {
        let idx = (-label.0 - 1) as usize;
        self.labels[idx] = Some(self.addr());
    }

    /// Rewrites every negative `P2` to its label's resolved address.
    fn finalize(mut self, tag: StatementTag, columns: Vec<String>) -> Result<PreparedStatement, Error> {
        for inst in &mut self.instructions {
            if inst.p2 < 0 {
                let idx = (-inst.p2 - 1) as usize;
                match self.labels.get(idx).copied().flatten() {
                    Some(addr) => inst.p2 = addr as i64,
                    None => return Err(Error::UnresolvedLabel(idx)),
                }
            }
        }
        Ok(PreparedStatement {
            tag,
            columns,
            instructions: self.instructions,
        })
    }
}

/// Parses and compiles one statement.  The pager is needed to resolve table
/// definitions from the schema root.
pub fn compile(pager: &mut Pager, sql: &str) -> Result<PreparedStatement, Error> {
    let stmt = grammar::parse_statement(sql)?;
    match stmt {
        Statement::Select(s) => compile_select(pager, &s),
        Statement::Insert(i) => compile_insert(pager, &i),
        Statement::Create(c) => compile_create(pager, &c, sql),
        Statement::Begin => compile_transaction(StatementTag::Begin, 0, 0),
        Statement::Commit => compile_transaction(StatementTag::Commit, 1, 0),
        Statement::Rollback => compile_transaction(StatementTag::Rollback, 1, 1),
    }
}

fn compile_transaction(tag: StatementTag, p1: i64, p2: i64) -> Result<PreparedStatement, Error> {
    let mut g = CodeGen::new();
    g.op2(OpCode::AutoCommit, p1, p2);
    g.op0(OpCode::Halt);
    g.finalize(tag, vec![])
}

fn compile_create(
    pager: &mut Pager,
    c: &ast::CreateStatement,
    sql: &str,
) -> Result<PreparedStatement, Error> {
    use std::str::FromStr;
    for cd in &c.coldefs {
        SqlType::from_str(&cd.coltype)
            .map_err(|_| Error::Unsupported(format!("column type {}", cd.coltype)))?;
    }
    if schema::lookup_table(pager, &c.tablename)?.is_some() {
        if c.if_not_exists {
            // Nothing to do; compile to an empty program.
            let mut g = CodeGen::new();
            g.op0(OpCode::Halt);
            return g.finalize(StatementTag::Create, vec![]);
        }
        return Err(Error::TableExists(c.tablename.clone()));
    }

    let mut g = CodeGen::new();
    let r_root = g.alloc_reg();
    g.op1(OpCode::CreateTable, r_root);

    let r_schema_root = g.alloc_reg();
    g.op2(OpCode::Integer, schema::SCHEMA_ROOT_PAGE as i64, r_schema_root);
    let cur = g.alloc_cursor();
    g.op4(
        OpCode::OpenWrite,
        cur,
        r_schema_root,
        5,
        String::from("schema"),
    );

    // The 5-field schema record: (type, name, tbl_name, rootpage, sql).
    let block = g.alloc_block(5);
    emit_string(&mut g, block, "table");
    emit_string(&mut g, block + 1, &c.tablename);
    emit_string(&mut g, block + 2, &c.tablename);
    g.op2(OpCode::SCopy, r_root, block + 3);
    emit_string(&mut g, block + 4, sql.trim());

    let r_rec = g.alloc_reg();
    g.op3(OpCode::MakeRecord, block, 5, r_rec);
    let r_rowid = g.alloc_reg();
    g.op2(OpCode::RowId, cur, r_rowid);
    g.op3(OpCode::Insert, cur, r_rec, r_rowid);
    g.op1(OpCode::Close, cur);
    g.op0(OpCode::Halt);
    g.finalize(StatementTag::Create, vec![])
}

fn emit_string(g: &mut CodeGen, reg: i64, s: &str) {
    g.op4(OpCode::String, s.len() as i64, reg, 0, String::from(s));
}

fn emit_constant(g: &mut CodeGen, reg: i64, c: &Constant) {
    match c {
        Constant::Int(v) => {
            g.op2(OpCode::Integer, *v, reg);
        }
        Constant::String(s) => emit_string(g, reg, s),
        Constant::Bool(b) => {
            g.op2(OpCode::Integer, *b as i64, reg);
        }
        Constant::Null() => {
            g.op2(OpCode::Null, 0, reg);
        }
    }
}

/// Reduces an INSERT value expression to a constant.  Arithmetic over
/// integers folds; anything touching a column cannot be evaluated here.
fn const_eval(e: &Expr) -> Result<Constant, Error> {
    match e {
        Expr::Constant(c) => Ok(c.clone()),
        Expr::ColName(c) => Err(Error::ConstEval(format!(
            "column {} in a constant expression",
            c
        ))),
        Expr::BinOp { lhs, op, rhs } => {
            let l = const_eval(lhs)?;
            let r = const_eval(rhs)?;
            let (l, r) = match (l, r) {
                (Constant::Int(l), Constant::Int(r)) => (l, r),
                (l, r) => {
                    return Err(Error::ConstEval(format!(
                        "operator {} on {} and {}",
                        op, l, r
                    )))
                }
            };
            match op {
                Op::Add => Ok(Constant::Int(l + r)),
                Op::Subtract => Ok(Constant::Int(l - r)),
                Op::Multiply => Ok(Constant::Int(l * r)),
                Op::Divide => {
                    if r == 0 {
                        Err(Error::ConstEval(String::from("division by zero")))
                    } else {
                        Ok(Constant::Int(l / r))
                    }
                }
                other => Err(Error::ConstEval(format!(
                    "operator {} in a value list",
                    other
                ))),
            }
        }
    }
}

fn check_value_type(column: &str, expected: SqlType, c: &Constant) -> Result<(), Error> {
    let ok = match (expected, c) {
        (_, Constant::Null()) => true,
        // Integers are stored in at most 4 bytes; wider values cannot be
        // written, so reject them before execution.
        (SqlType::Int, Constant::Int(v)) => i32::try_from(*v).is_ok(),
        (SqlType::Int, Constant::Bool(_)) => true,
        (SqlType::Text, Constant::String(_)) => true,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(Error::ValueType {
            column: String::from(column),
            expected,
            found: format!("{}", c),
        })
    }
}

fn compile_insert(
    pager: &mut Pager,
    i: &ast::InsertStatement,
) -> Result<PreparedStatement, Error> {
    let def = schema::lookup_table(pager, &i.tablename)?
        .ok_or_else(|| Error::UnknownTable(i.tablename.clone()))?;
    if i.columns.len() != i.values.len() {
        return Err(Error::ValueCountMismatch(i.values.len(), i.columns.len()));
    }

    // Pair each declared column with its supplied value, defaulting the
    // rest to NULL.  Values are folded to constants at compile time.
    let mut supplied: Vec<Option<Constant>> = vec![None; def.columns.len()];
    for (col, value) in i.columns.iter().zip(&i.values) {
        let idx = def
            .column_index(&col.name)
            .ok_or_else(|| Error::UnknownColumn(col.name.clone()))?;
        let c = const_eval(value)?;
        check_value_type(&col.name, def.columns[idx].ctype, &c)?;
        supplied[idx] = Some(c);
    }
    for col in &i.returning {
        if def.column_index(&col.name).is_none() {
            return Err(Error::UnknownColumn(col.name.clone()));
        }
    }

    let mut g = CodeGen::new();
    let r_root = g.alloc_reg();
    g.op2(OpCode::Integer, def.root as i64, r_root);
    let cur = g.alloc_cursor();
    g.op4(
        OpCode::OpenWrite,
        cur,
        r_root,
        def.columns.len() as i64,
        def.name.clone(),
    );
    let r_rowid = g.alloc_reg();
    g.op2(OpCode::RowId, cur, r_rowid);

    let block = g.alloc_block(def.columns.len());
    for (idx, value) in supplied.iter().enumerate() {
        match value {
            Some(c) => emit_constant(&mut g, block + idx as i64, c),
            None => {
                g.op2(OpCode::Null, 0, block + idx as i64);
            }
        }
    }
    let r_rec = g.alloc_reg();
    g.op3(OpCode::MakeRecord, block, def.columns.len() as i64, r_rec);
    g.op3(OpCode::Insert, cur, r_rec, r_rowid);

    // RETURNING re-emits the freshly inserted values as one result row.
    let mut columns = vec![];
    if !i.returning.is_empty() {
        let out = g.alloc_block(i.returning.len());
        for (n, col) in i.returning.iter().enumerate() {
            let idx = def.column_index(&col.name).expect("checked above") as i64;
            g.op2(OpCode::SCopy, block + idx, out + n as i64);
            columns.push(col.name.clone());
        }
        g.op2(OpCode::ResultRow, out, i.returning.len() as i64);
    }

    g.op1(OpCode::Close, cur);
    g.op0(OpCode::Halt);
    g.finalize(StatementTag::Insert, columns)
}

fn compile_select(
    pager: &mut Pager,
    s: &ast::SelectStatement,
) -> Result<PreparedStatement, Error> {
    if s.from.len() != 1 {
        return Err(Error::Unsupported(String::from(
            "SELECT over more than one table",
        )));
    }
    let def = schema::lookup_table(pager, &s.from[0].tablename)?
        .ok_or_else(|| Error::UnknownTable(s.from[0].tablename.clone()))?;

    // Expand the select list to concrete column indexes, `*` to all.
    let mut out_cols: Vec<usize> = vec![];
    let mut columns: Vec<String> = vec![];
    for item in &s.items {
        match item {
            ast::SelItem::Star => {
                for (idx, c) in def.columns.iter().enumerate() {
                    out_cols.push(idx);
                    columns.push(c.name.clone());
                }
            }
            ast::SelItem::ColName(c) => {
                let idx = def
                    .column_index(&c.name)
                    .ok_or_else(|| Error::UnknownColumn(c.name.clone()))?;
                out_cols.push(idx);
                columns.push(c.name.clone());
            }
        }
    }

    let mut g = CodeGen::new();
    let r_root = g.alloc_reg();
    g.op2(OpCode::Integer, def.root as i64, r_root);
    let cur = g.alloc_cursor();
    g.op4(
        OpCode::OpenRead,
        cur,
        r_root,
        def.columns.len() as i64,
        def.name.clone(),
    );

    let halt = g.alloc_label();
    g.op2(OpCode::Rewind, cur, halt.0);

    // Loop body starts here; Next jumps back to the WHERE evaluation.
    let loop_start = g.addr();
    let next_label = g.alloc_label();
    if let Some(where_expr) = &s.where_clause {
        let cond = flatten(where_expr)?;
        emit_cond(&mut g, &def, cur, &cond, Ctx::Conjunctive { fe: next_label })?;
    }

    let block = g.alloc_block(out_cols.len());
    for (n, col_idx) in out_cols.iter().enumerate() {
        g.op3(OpCode::Column, cur, *col_idx as i64, block + n as i64);
    }
    g.op2(OpCode::ResultRow, block, out_cols.len() as i64);

    g.resolve_label(next_label);
    g.op2(OpCode::Next, cur, loop_start as i64);

    g.resolve_label(halt);
    g.op0(OpCode::Halt);
    g.finalize(StatementTag::Select, columns)
}

/// A WHERE tree with AND/OR chains flattened to n-ary nodes.
#[derive(Debug)]
enum Cond {
    Cmp { op: Op, lhs: Expr, rhs: Expr },
    Nary { op: Op, terms: Vec<Cond> },
}

fn flatten(e: &Expr) -> Result<Cond, Error> {
    match e {
        Expr::BinOp { op, .. } if op.is_logical() => {
            let op = *op;
            let mut terms = vec![];
            collect_terms(e, op, &mut terms)?;
            Ok(Cond::Nary { op, terms })
        }
        Expr::BinOp { lhs, op, rhs } if op.is_comparison() => Ok(Cond::Cmp {
            op: *op,
            lhs: (**lhs).clone(),
            rhs: (**rhs).clone(),
        }),
        other => Err(Error::Unsupported(format!(
            "WHERE clause must be a comparison, found {}",
            other
        ))),
    }
}

/// Gathers the leaves of a same-operator logical chain, left to right.
fn collect_terms(e: &Expr, outer: Op, terms: &mut Vec<Cond>) -> Result<(), Error> {
    match e {
        Expr::BinOp { lhs, op, rhs } if *op == outer => {
            collect_terms(lhs, outer, terms)?;
            collect_terms(rhs, outer, terms)?;
            Ok(())
        }
        other => {
            terms.push(flatten(other)?);
            Ok(())
        }
    }
}

/// The emission context: which exit is a real label and which is the
/// fall-through.  Conjunctive positions fall through on success;
/// disjunctive positions fall through on failure.
#[derive(Clone, Copy)]
enum Ctx {
    Conjunctive { fe: Label },
    Disjunctive { te: Label },
}

fn emit_cond(
    g: &mut CodeGen,
    def: &TableDef,
    cur: i64,
    cond: &Cond,
    ctx: Ctx,
) -> Result<(), Error> {
    match cond {
        Cond::Cmp { op, lhs, rhs } => emit_cmp(g, def, cur, *op, lhs, rhs, ctx),
        Cond::Nary { op: Op::And, terms } => match ctx {
            Ctx::Conjunctive { fe } => {
                for t in terms {
                    emit_cond(g, def, cur, t, Ctx::Conjunctive { fe })?;
                }
                Ok(())
            }
            Ctx::Disjunctive { te } => {
                // All-but-last fail out to just past this block, which is
                // the surrounding disjunction's fall-through.
                let fe = g.alloc_label();
                let (last, init) = terms.split_last().expect("n-ary nodes have terms");
                for t in init {
                    emit_cond(g, def, cur, t, Ctx::Conjunctive { fe })?;
                }
                emit_cond(g, def, cur, last, Ctx::Disjunctive { te })?;
                g.resolve_label(fe);
                Ok(())
            }
        },
        Cond::Nary { op: Op::Or, terms } => match ctx {
            Ctx::Disjunctive { te } => {
                for t in terms {
                    emit_cond(g, def, cur, t, Ctx::Disjunctive { te })?;
                }
                Ok(())
            }
            Ctx::Conjunctive { fe } => {
                // Successes short-circuit to just past this block, which is
                // the surrounding conjunction's fall-through.
                let te = g.alloc_label();
                let (last, init) = terms.split_last().expect("n-ary nodes have terms");
                for t in init {
                    emit_cond(g, def, cur, t, Ctx::Disjunctive { te })?;
                }
                emit_cond(g, def, cur, last, Ctx::Conjunctive { fe })?;
                g.resolve_label(te);
                Ok(())
            }
        },
        Cond::Nary { op, .. } => Err(Error::Unsupported(format!(
            "logical operator {}",
            op
        ))),
    }
}

/// Loads both operands and emits one conditional jump.  The jump sense
/// depends on the context: skip-on-failure in conjunctions, short-circuit
/// on success in disjunctions.
fn emit_cmp(
    g: &mut CodeGen,
    def: &TableDef,
    cur: i64,
    op: Op,
    lhs: &Expr,
    rhs: &Expr,
    ctx: Ctx,
) -> Result<(), Error> {
    let r_lhs = emit_operand(g, def, cur, lhs)?;
    let r_rhs = emit_operand(g, def, cur, rhs)?;
    let (jump_op, target) = match ctx {
        Ctx::Conjunctive { fe } => (comparison_opcode(negate(op)), fe),
        Ctx::Disjunctive { te } => (comparison_opcode(op), te),
    };
    g.op3(jump_op, r_lhs, target.0, r_rhs);
    g.free_reg(r_rhs);
    g.free_reg(r_lhs);
    Ok(())
}

fn emit_operand(g: &mut CodeGen, def: &TableDef, cur: i64, e: &Expr) -> Result<i64, Error> {
    let reg = g.alloc_reg();
    match e {
        Expr::ColName(c) => {
            let idx = def
                .column_index(&c.name)
                .ok_or_else(|| Error::UnknownColumn(c.name.clone()))?;
            g.op3(OpCode::Column, cur, idx as i64, reg);
        }
        Expr::Constant(c) => emit_constant(g, reg, c),
        Expr::BinOp { .. } => {
            let c = const_eval(e)?;
            emit_constant(g, reg, &c);
        }
    }
    Ok(reg)
}

fn negate(op: Op) -> Op {
    match op {
        Op::Eq => Op::Ne,
        Op::Ne => Op::Eq,
        Op::Lt => Op::Ge,
        Op::Le => Op::Gt,
        Op::Gt => Op::Le,
        Op::Ge => Op::Lt,
        other => other,
    }
}

fn comparison_opcode(op: Op) -> OpCode {
    match op {
        Op::Eq => OpCode::Eq,
        Op::Ne => OpCode::Ne,
        Op::Lt => OpCode::Lt,
        Op::Le => OpCode::Le,
        Op::Gt => OpCode::Gt,
        Op::Ge => OpCode::Ge,
        other => unreachable!("{} is not a comparison", other),
    }
}
