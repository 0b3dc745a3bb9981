//! This module defines abstract syntax tree (AST) types for SQL.

use enum_as_inner::EnumAsInner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColName {
    pub name: String,
}

impl std::fmt::Display for ColName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum SelItem {
    ColName(ColName),
    Star,
}

impl std::fmt::Display for SelItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelItem::ColName(x) => x.fmt(f),
            SelItem::Star => "*".fmt(f),
        }
    }
}

/// One entry of a FROM list: a table name with an optional alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub tablename: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub items: Vec<SelItem>,
    pub from: Vec<TableRef>,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColDef {
    pub colname: ColName,
    pub coltype: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateStatement {
    pub tablename: String,
    pub if_not_exists: bool,
    pub coldefs: Vec<ColDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub tablename: String,
    pub columns: Vec<ColName>,
    pub values: Vec<Expr>,
    pub returning: Vec<ColName>,
}

#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum Constant {
    Int(i64),
    String(String),
    Bool(bool),
    Null(),
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Int(x) => x.fmt(f),
            Constant::String(x) => x.fmt(f),
            Constant::Bool(x) => match x {
                true => "TRUE".fmt(f),
                false => "FALSE".fmt(f),
            },
            Constant::Null() => "NULL".fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum Expr {
    Constant(Constant),
    ColName(ColName),
    BinOp {
        lhs: Box<Expr>,
        op: Op,
        rhs: Box<Expr>,
    },
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Constant(x) => x.fmt(f),
            Expr::ColName(x) => x.fmt(f),
            Expr::BinOp { lhs, op, rhs } => write!(f, "({} {} {})", lhs, op, rhs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Multiply,
    Divide,
    Add,
    Subtract,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl Op {
    pub fn is_comparison(&self) -> bool {
        matches!(self, Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge)
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, Op::And | Op::Or)
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Op::*;
        match self {
            Multiply => "*".fmt(f),
            Divide => "/".fmt(f),
            Add => "+".fmt(f),
            Subtract => "-".fmt(f),
            Eq => "=".fmt(f),
            Ne => "!=".fmt(f),
            Lt => "<".fmt(f),
            Le => "<=".fmt(f),
            Gt => ">".fmt(f),
            Ge => ">=".fmt(f),
            And => "AND".fmt(f),
            Or => "OR".fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Create(CreateStatement),
    Begin,
    Commit,
    Rollback,
}

impl Statement {
    /// Whether executing this statement may mutate storage.
    pub fn is_write(&self) -> bool {
        matches!(self, Statement::Insert(_) | Statement::Create(_))
    }
}
