//! parser provides the scanner view over the token stream and the
//! combinators the SQL grammar is built from.
//!
//! Combinators rewind the scanner on failure, so alternatives can be tried
//! in sequence (`one_of`) and sequences can be abandoned cleanly
//! (`attempt`).  Naive backtracking like that is exponential in the worst
//! case; the `committed` combinator is the discipline that keeps it
//! polynomial in practice — once a recognizable prefix (such as a statement
//! keyword) has been consumed, a landmark is recorded, and errors raised
//! below it name the construct being parsed rather than unwinding into
//! sibling alternatives' noise.  The landmark is a first-class scanner
//! operation, not a side effect.
//!
//! `mark`/`reset` expose raw positions for the rare spots a production
//! needs manual control.

use crate::lexer::{self, Token, TokenKind};

/// A parse failure: where, within what construct, and what was expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// Byte offset into the statement text.
    pub offset: usize,
    /// The innermost committed landmark, if any.
    pub landmark: Option<String>,
    /// The construct that failed to parse.
    pub expected: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.landmark {
            Some(lm) => write!(
                f,
                "syntax error at offset {} in {}: expected {}",
                self.offset, lm, self.expected
            ),
            None => write!(
                f,
                "syntax error at offset {}: expected {}",
                self.offset, self.expected
            ),
        }
    }
}

impl std::error::Error for ParseError {}

pub type PResult<T> = Result<T, ParseError>;

pub struct Scanner {
    tokens: Vec<Token>,
    pos: usize,
    landmark: Option<String>,
}

/// A saved scanner position, undone with [`Scanner::reset`].
pub type Mark = usize;

impl Scanner {
    pub fn new(input: &str) -> Scanner {
        Scanner {
            tokens: lexer::tokenize(input),
            pos: 0,
            landmark: None,
        }
    }

    /// The token under the scanner.  Never runs past `Eof`.
    pub fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    /// Consumes and returns the current token.
    pub fn next(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    /// Un-consumes the latest token.
    pub fn backup(&mut self) {
        if self.pos > 0 {
            self.pos -= 1;
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn mark(&self) -> Mark {
        self.pos
    }

    pub fn reset(&mut self, mark: Mark) {
        self.pos = mark;
    }

    /// Records the construct being parsed, for error messages below this
    /// point.  Returns the previous landmark so callers can restore it.
    pub fn commit(&mut self, landmark: &str) -> Option<String> {
        self.landmark.replace(String::from(landmark))
    }

    pub fn set_landmark(&mut self, landmark: Option<String>) {
        self.landmark = landmark;
    }

    /// Builds a parse error at the current token.
    pub fn error(&self, expected: impl Into<String>) -> ParseError {
        ParseError {
            offset: self.peek().offset,
            landmark: self.landmark.clone(),
            expected: expected.into(),
        }
    }

    /// Consumes a token of `kind` or fails without consuming.
    pub fn expect(&mut self, kind: TokenKind, expected: &str) -> PResult<Token> {
        if self.peek().kind == kind {
            Ok(self.next())
        } else {
            Err(self.error(expected))
        }
    }

    /// Consumes a token of `kind` if present.
    pub fn accept(&mut self, kind: TokenKind) -> Option<Token> {
        if self.peek().kind == kind {
            Some(self.next())
        } else {
            None
        }
    }

    /// Consumes an identifier with the given (case-insensitive) text, for
    /// words the lexer does not reserve, like BEGIN.
    pub fn accept_ident(&mut self, word: &str) -> bool {
        let tok = self.peek();
        if tok.kind == TokenKind::Ident && tok.text.eq_ignore_ascii_case(word) {
            self.next();
            return true;
        }
        false
    }

    /// The token where lexing failed, if it did.  Grammar entry points
    /// check this before parsing.
    pub fn lex_error(&self) -> Option<&Token> {
        self.tokens.iter().find(|t| t.kind == TokenKind::Error)
    }
}

/// Runs `p`, rewinding the scanner if it fails.  Sequencing inside `p` uses
/// plain `?`; this is the boundary that makes the whole sequence atomic.
pub fn attempt<T>(s: &mut Scanner, p: impl FnOnce(&mut Scanner) -> PResult<T>) -> PResult<T> {
    let mark = s.mark();
    match p(s) {
        Ok(v) => Ok(v),
        Err(e) => {
            s.reset(mark);
            Err(e)
        }
    }
}

/// Tries each parser in turn, rewinding between attempts; the first success
/// wins.  On total failure, reports the error that got furthest.
pub fn one_of<T>(s: &mut Scanner, parsers: &[fn(&mut Scanner) -> PResult<T>]) -> PResult<T> {
    let mut best: Option<ParseError> = None;
    for p in parsers {
        match attempt(s, p) {
            Ok(v) => return Ok(v),
            Err(e) => {
                if best.as_ref().map_or(true, |b| e.offset >= b.offset) {
                    best = Some(e);
                }
            }
        }
    }
    Err(best.unwrap_or_else(|| s.error("one of several alternatives")))
}

/// Always succeeds; consumes input only if `p` succeeds.
pub fn optional<T>(s: &mut Scanner, p: impl FnOnce(&mut Scanner) -> PResult<T>) -> Option<T> {
    attempt(s, p).ok()
}

/// Applies `p` until it fails, collecting the results.
pub fn zero_or_more<T>(
    s: &mut Scanner,
    mut p: impl FnMut(&mut Scanner) -> PResult<T>,
) -> Vec<T> {
    let mut out = vec![];
    while let Ok(v) = attempt(s, &mut p) {
        out.push(v);
    }
    out
}

/// One or more `p`, separated by tokens of `sep`.
pub fn separated_by1<T>(
    s: &mut Scanner,
    sep: TokenKind,
    mut p: impl FnMut(&mut Scanner) -> PResult<T>,
) -> PResult<Vec<T>> {
    let mut out = vec![p(s)?];
    loop {
        let mark = s.mark();
        if s.accept(sep).is_none() {
            return Ok(out);
        }
        match attempt(s, &mut p) {
            Ok(v) => out.push(v),
            Err(e) => {
                // A trailing separator is not part of the list.
                s.reset(mark);
                let _ = e;
                return Ok(out);
            }
        }
    }
}

/// Builds a left-associative chain: `term (op term)*`.  `match_op` maps the
/// current token to an operator or declines.  This is how the expression
/// grammar avoids left recursion.
pub fn chainl<T, O>(
    s: &mut Scanner,
    mut term: impl FnMut(&mut Scanner) -> PResult<T>,
    match_op: impl Fn(&Token) -> Option<O>,
    make: impl Fn(T, O, T) -> T,
) -> PResult<T> {
    let mut lhs = term(s)?;
    loop {
        let op = match match_op(s.peek()) {
            Some(op) => op,
            None => return Ok(lhs),
        };
        s.next();
        let rhs = term(s)?;
        lhs = make(lhs, op, rhs);
    }
}

/// Runs `p` under a committed landmark.  The landmark names the construct
/// in errors raised inside `p`; position is restored on failure, the outer
/// landmark always.
pub fn committed<T>(
    s: &mut Scanner,
    landmark: &str,
    p: impl FnOnce(&mut Scanner) -> PResult<T>,
) -> PResult<T> {
    let prev = s.commit(landmark);
    let result = attempt(s, p);
    s.set_landmark(prev);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use TokenKind::*;

    fn ident(s: &mut Scanner) -> PResult<String> {
        Ok(s.expect(Ident, "identifier")?.text)
    }

    fn number(s: &mut Scanner) -> PResult<String> {
        Ok(s.expect(Number, "number")?.text)
    }

    #[test]
    fn test_peek_next_backup() {
        let mut s = Scanner::new("a b");
        assert_eq!(s.peek().text, "a");
        assert_eq!(s.next().text, "a");
        assert_eq!(s.next().text, "b");
        s.backup();
        assert_eq!(s.next().text, "b");
        assert_eq!(s.next().kind, Eof);
        // Eof is sticky.
        assert_eq!(s.next().kind, Eof);
    }

    #[test]
    fn test_attempt_rewinds_on_failure() {
        let mut s = Scanner::new("a 1");
        let r = attempt(&mut s, |s| {
            ident(s)?;
            ident(s) // fails on the number
        });
        assert!(r.is_err());
        assert_eq!(s.pos(), 0);
    }

    #[test]
    fn test_one_of_takes_first_success() {
        let mut s = Scanner::new("42");
        let r = one_of(&mut s, &[ident, number]).unwrap();
        assert_eq!(r, "42");
    }

    #[test]
    fn test_one_of_reports_furthest_error() {
        fn two_idents(s: &mut Scanner) -> PResult<String> {
            ident(s)?;
            ident(s)
        }
        fn a_number(s: &mut Scanner) -> PResult<String> {
            number(s)
        }
        let mut s = Scanner::new("a 1");
        let err = one_of(&mut s, &[two_idents, a_number]).unwrap_err();
        // two_idents got past the first token before failing; its error
        // (offset of "1") should win over a_number's (offset of "a").
        assert_eq!(err.offset, 2);
    }

    #[test]
    fn test_optional_and_zero_or_more() {
        let mut s = Scanner::new("a b c 1");
        assert_eq!(optional(&mut s, ident), Some(String::from("a")));
        assert_eq!(zero_or_more(&mut s, ident), vec!["b", "c"]);
        assert_eq!(optional(&mut s, ident), None);
        assert_eq!(number(&mut s).unwrap(), "1");
    }

    #[test]
    fn test_separated_by1() {
        let mut s = Scanner::new("a, b ,c");
        assert_eq!(
            separated_by1(&mut s, Comma, ident).unwrap(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_separated_by1_leaves_trailing_separator() {
        let mut s = Scanner::new("a, b, 1");
        assert_eq!(separated_by1(&mut s, Comma, ident).unwrap(), vec!["a", "b"]);
        // The comma before the non-matching element is unconsumed.
        assert_eq!(s.peek().kind, Comma);
    }

    #[test]
    fn test_chainl_left_associates() {
        let mut s = Scanner::new("1 - 2 - 3");
        let r = chainl(
            &mut s,
            |s| Ok(number(s)?),
            |t| (t.kind == Minus).then_some("-"),
            |l, _, r| format!("({}-{})", l, r),
        )
        .unwrap();
        assert_eq!(r, "((1-2)-3)");
    }

    #[test]
    fn test_committed_landmark_in_error() {
        let mut s = Scanner::new("select 1");
        let err = committed(&mut s, "SELECT statement", |s| {
            s.expect(Select, "SELECT")?;
            ident(s)
        })
        .unwrap_err();
        assert_eq!(err.landmark.as_deref(), Some("SELECT statement"));
        assert_eq!(err.offset, 7);
        assert_eq!(s.pos(), 0);
        // The landmark does not leak out of the committed region.
        assert!(s.error("x").landmark.is_none());
    }

    #[test]
    fn test_error_display() {
        let e = ParseError {
            offset: 12,
            landmark: Some(String::from("INSERT statement")),
            expected: String::from("VALUES"),
        };
        assert_eq!(
            format!("{}", e),
            "syntax error at offset 12 in INSERT statement: expected VALUES"
        );
    }
}
