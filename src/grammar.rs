//! grammar defines the SQL productions, built from the parser combinators.
//!
//! Top level: `CREATE TABLE [IF NOT EXISTS] t (col type, ...)`,
//! `INSERT INTO t (cols) VALUES (exprs) [RETURNING cols]`,
//! `SELECT items FROM tables [WHERE expr]`, and
//! `BEGIN | COMMIT | ROLLBACK`.  Expressions form a precedence tower of
//! left-associative `chainl` layers: `* /` bind tightest, then `+ -`, then
//! comparisons, then `AND`/`OR`.

use crate::ast::{
    ColDef, ColName, Constant, CreateStatement, Expr, InsertStatement, Op, SelItem,
    SelectStatement, Statement, TableRef,
};
use crate::lexer::{Token, TokenKind};
use crate::parser::{
    chainl, committed, one_of, separated_by1, PResult, ParseError, Scanner,
};

/// Parses one complete SQL statement.
pub fn parse_statement(input: &str) -> Result<Statement, ParseError> {
    let mut s = Scanner::new(input);
    if let Some(tok) = s.lex_error() {
        return Err(ParseError {
            offset: tok.offset,
            landmark: None,
            expected: String::from("a valid token"),
        });
    }
    let stmt = one_of(
        &mut s,
        &[
            select_statement,
            insert_statement,
            create_statement,
            transaction_statement,
        ],
    )?;
    s.expect(TokenKind::Eof, "end of statement")?;
    Ok(stmt)
}

fn col_name(s: &mut Scanner) -> PResult<ColName> {
    let tok = s.expect(TokenKind::Ident, "column name")?;
    Ok(ColName { name: tok.text })
}

fn select_item(s: &mut Scanner) -> PResult<SelItem> {
    if s.accept(TokenKind::Asterisk).is_some() {
        return Ok(SelItem::Star);
    }
    Ok(SelItem::ColName(col_name(s)?))
}

fn table_ref(s: &mut Scanner) -> PResult<TableRef> {
    let name = s.expect(TokenKind::Ident, "table name")?;
    let alias = if s.accept(TokenKind::As).is_some() {
        Some(s.expect(TokenKind::Ident, "table alias")?.text)
    } else {
        s.accept(TokenKind::Ident).map(|t| t.text)
    };
    Ok(TableRef {
        tablename: name.text,
        alias,
    })
}

fn select_statement(s: &mut Scanner) -> PResult<Statement> {
    s.expect(TokenKind::Select, "SELECT")?;
    committed(s, "SELECT statement", |s| {
        let items = separated_by1(s, TokenKind::Comma, select_item)?;
        s.expect(TokenKind::From, "FROM")?;
        let from = separated_by1(s, TokenKind::Comma, table_ref)?;
        let where_clause = match s.accept(TokenKind::Where) {
            Some(_) => Some(expr(s)?),
            None => None,
        };
        Ok(Statement::Select(SelectStatement {
            items,
            from,
            where_clause,
        }))
    })
}

fn insert_statement(s: &mut Scanner) -> PResult<Statement> {
    s.expect(TokenKind::Insert, "INSERT")?;
    committed(s, "INSERT statement", |s| {
        s.expect(TokenKind::Into, "INTO")?;
        let table = s.expect(TokenKind::Ident, "table name")?;
        s.expect(TokenKind::OpenParen, "( before column list")?;
        let columns = separated_by1(s, TokenKind::Comma, col_name)?;
        s.expect(TokenKind::CloseParen, ") after column list")?;
        s.expect(TokenKind::Values, "VALUES")?;
        s.expect(TokenKind::OpenParen, "( before value list")?;
        let values = separated_by1(s, TokenKind::Comma, expr)?;
        s.expect(TokenKind::CloseParen, ") after value list")?;
        let returning = match s.accept(TokenKind::Returning) {
            Some(_) => separated_by1(s, TokenKind::Comma, col_name)?,
            None => vec![],
        };
        Ok(Statement::Insert(InsertStatement {
            tablename: table.text,
            columns,
            values,
            returning,
        }))
    })
}

fn col_def(s: &mut Scanner) -> PResult<ColDef> {
    let name = col_name(s)?;
    let coltype = s.expect(TokenKind::Ident, "column type")?;
    Ok(ColDef {
        colname: name,
        coltype: coltype.text,
    })
}

fn create_statement(s: &mut Scanner) -> PResult<Statement> {
    s.expect(TokenKind::Create, "CREATE")?;
    committed(s, "CREATE TABLE statement", |s| {
        s.expect(TokenKind::Table, "TABLE")?;
        let if_not_exists = if s.accept(TokenKind::If).is_some() {
            s.expect(TokenKind::Not, "NOT after IF")?;
            s.expect(TokenKind::Exists, "EXISTS after IF NOT")?;
            true
        } else {
            false
        };
        let table = s.expect(TokenKind::Ident, "table name")?;
        s.expect(TokenKind::OpenParen, "( before column definitions")?;
        let coldefs = separated_by1(s, TokenKind::Comma, col_def)?;
        s.expect(TokenKind::CloseParen, ") after column definitions")?;
        Ok(Statement::Create(CreateStatement {
            tablename: table.text,
            if_not_exists,
            coldefs,
        }))
    })
}

fn transaction_statement(s: &mut Scanner) -> PResult<Statement> {
    if s.accept_ident("BEGIN") {
        return Ok(Statement::Begin);
    }
    if s.accept_ident("COMMIT") {
        return Ok(Statement::Commit);
    }
    if s.accept_ident("ROLLBACK") {
        return Ok(Statement::Rollback);
    }
    Err(s.error("BEGIN, COMMIT or ROLLBACK"))
}

fn unquote(text: &str) -> String {
    // The lexer guarantees surrounding quotes; doubled quotes unescape.
    text[1..text.len() - 1].replace("''", "'")
}

fn primary(s: &mut Scanner) -> PResult<Expr> {
    match s.peek().kind {
        TokenKind::Number => {
            let tok = s.next();
            let n = tok
                .text
                .parse::<i64>()
                .map_err(|_| {
                    s.backup();
                    s.error("an integer that fits 64 bits")
                })?;
            Ok(Expr::Constant(Constant::Int(n)))
        }
        TokenKind::Str => {
            let tok = s.next();
            Ok(Expr::Constant(Constant::String(unquote(&tok.text))))
        }
        TokenKind::Boolean => {
            let tok = s.next();
            Ok(Expr::Constant(Constant::Bool(tok.text == "TRUE")))
        }
        TokenKind::Ident => {
            if s.accept_ident("NULL") {
                return Ok(Expr::Constant(Constant::Null()));
            }
            let tok = s.next();
            Ok(Expr::ColName(ColName { name: tok.text }))
        }
        TokenKind::OpenParen => {
            s.next();
            let inner = expr(s)?;
            s.expect(TokenKind::CloseParen, ") to close the expression")?;
            Ok(inner)
        }
        _ => Err(s.error("a value, column name, or parenthesized expression")),
    }
}

fn binop(lhs: Expr, op: Op, rhs: Expr) -> Expr {
    Expr::BinOp {
        lhs: Box::new(lhs),
        op,
        rhs: Box::new(rhs),
    }
}

fn mult(s: &mut Scanner) -> PResult<Expr> {
    chainl(
        s,
        primary,
        |t: &Token| match t.kind {
            TokenKind::Asterisk => Some(Op::Multiply),
            TokenKind::Divide => Some(Op::Divide),
            _ => None,
        },
        binop,
    )
}

fn sum(s: &mut Scanner) -> PResult<Expr> {
    chainl(
        s,
        mult,
        |t: &Token| match t.kind {
            TokenKind::Plus => Some(Op::Add),
            TokenKind::Minus => Some(Op::Subtract),
            _ => None,
        },
        binop,
    )
}

fn comparison(s: &mut Scanner) -> PResult<Expr> {
    chainl(
        s,
        sum,
        |t: &Token| match t.kind {
            TokenKind::Eq => Some(Op::Eq),
            TokenKind::Ne => Some(Op::Ne),
            TokenKind::Lt => Some(Op::Lt),
            TokenKind::Le => Some(Op::Le),
            TokenKind::Gt => Some(Op::Gt),
            TokenKind::Ge => Some(Op::Ge),
            _ => None,
        },
        binop,
    )
}

/// The full expression grammar: the top of the precedence tower.
pub fn expr(s: &mut Scanner) -> PResult<Expr> {
    chainl(
        s,
        comparison,
        |t: &Token| match t.kind {
            TokenKind::And => Some(Op::And),
            TokenKind::Or => Some(Op::Or),
            _ => None,
        },
        binop,
    )
}
