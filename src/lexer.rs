//! lexer turns SQL text into a lazy stream of tokens.
//!
//! Each token carries its kind, its text, and the byte offset where it
//! began.  Keywords are case-insensitive identifiers; the lexer normalizes
//! their text to upper case.  Strings are single-quoted with doubled-quote
//! escaping.  A string that runs off the end of the input produces an
//! `Error` token, which the parser treats as fatal.
//!
//! Whitespace is emitted as its own token kind; the parser's scanner view
//! filters it.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::iter::Peekable;
use std::str::CharIndices;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Whitespace,
    Ident,
    Number,
    Str,
    Boolean,
    Comma,
    OpenParen,
    CloseParen,
    Asterisk,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Divide,
    And,
    Or,
    Not,
    Select,
    From,
    Where,
    As,
    Create,
    Insert,
    Into,
    Table,
    Values,
    If,
    Exists,
    Returning,
    Eof,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub offset: usize,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>, offset: usize) -> Token {
        Token {
            kind,
            text: text.into(),
            offset,
        }
    }
}

lazy_static! {
    static ref KEYWORDS: HashMap<&'static str, TokenKind> = {
        use TokenKind::*;
        HashMap::from([
            ("AND", And),
            ("OR", Or),
            ("NOT", Not),
            ("SELECT", Select),
            ("FROM", From),
            ("WHERE", Where),
            ("AS", As),
            ("CREATE", Create),
            ("INSERT", Insert),
            ("INTO", Into),
            ("TABLE", Table),
            ("VALUES", Values),
            ("IF", If),
            ("EXISTS", Exists),
            ("RETURNING", Returning),
            ("TRUE", Boolean),
            ("FALSE", Boolean),
        ])
    };
}

pub struct Lexer<'a> {
    input: &'a str,
    chars: Peekable<CharIndices<'a>>,
    emitted_eof: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Lexer<'a> {
        Lexer {
            input,
            chars: input.char_indices().peekable(),
            emitted_eof: false,
        }
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    /// Consumes while `pred` holds, returning the end offset (exclusive).
    fn eat_while(&mut self, pred: impl Fn(char) -> bool) -> usize {
        while let Some((_, c)) = self.chars.peek() {
            if !pred(*c) {
                break;
            }
            self.chars.next();
        }
        self.chars
            .peek()
            .map(|(i, _)| *i)
            .unwrap_or(self.input.len())
    }

    fn lex_string(&mut self, start: usize) -> Token {
        // The opening quote is consumed.  Doubled quotes stay in the raw
        // text here; the parser unescapes when it builds the constant.
        loop {
            match self.chars.next() {
                None => {
                    return Token::new(TokenKind::Error, &self.input[start..], start);
                }
                Some((i, '\'')) => {
                    if self.peek_char() == Some('\'') {
                        self.chars.next();
                        continue;
                    }
                    return Token::new(TokenKind::Str, &self.input[start..i + 1], start);
                }
                Some(_) => (),
            }
        }
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        use TokenKind::*;
        let (start, c) = match self.chars.next() {
            Some(x) => x,
            None => {
                if self.emitted_eof {
                    return None;
                }
                self.emitted_eof = true;
                return Some(Token::new(Eof, "", self.input.len()));
            }
        };

        let tok = match c {
            c if c.is_whitespace() => {
                let end = self.eat_while(|c| c.is_whitespace());
                Token::new(Whitespace, &self.input[start..end], start)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let end = self.eat_while(|c| c.is_ascii_alphanumeric() || c == '_');
                let text = &self.input[start..end];
                let upper = text.to_uppercase();
                match KEYWORDS.get(upper.as_str()) {
                    Some(kind) => Token::new(*kind, upper, start),
                    None => Token::new(Ident, text, start),
                }
            }
            c if c.is_ascii_digit() => {
                let end = self.eat_while(|c| c.is_ascii_digit());
                Token::new(Number, &self.input[start..end], start)
            }
            '\'' => self.lex_string(start),
            ',' => Token::new(Comma, ",", start),
            '(' => Token::new(OpenParen, "(", start),
            ')' => Token::new(CloseParen, ")", start),
            '*' => Token::new(Asterisk, "*", start),
            '+' => Token::new(Plus, "+", start),
            '-' => Token::new(Minus, "-", start),
            '/' => Token::new(Divide, "/", start),
            '=' => Token::new(Eq, "=", start),
            '!' => match self.peek_char() {
                Some('=') => {
                    self.chars.next();
                    Token::new(Ne, "!=", start)
                }
                _ => Token::new(Error, "!", start),
            },
            '<' => match self.peek_char() {
                Some('=') => {
                    self.chars.next();
                    Token::new(Le, "<=", start)
                }
                Some('>') => {
                    self.chars.next();
                    Token::new(Ne, "<>", start)
                }
                _ => Token::new(Lt, "<", start),
            },
            '>' => match self.peek_char() {
                Some('=') => {
                    self.chars.next();
                    Token::new(Ge, ">=", start)
                }
                _ => Token::new(Gt, ">", start),
            },
            _ => Token::new(Error, &self.input[start..start + c.len_utf8()], start),
        };
        Some(tok)
    }
}

/// Tokenizes `input` in full, dropping whitespace.  Always ends with `Eof`
/// (or an `Error` token where lexing stopped).
pub fn tokenize(input: &str) -> Vec<Token> {
    let mut out: Vec<Token> = vec![];
    for tok in Lexer::new(input) {
        let is_err = tok.kind == TokenKind::Error;
        if tok.kind != TokenKind::Whitespace {
            out.push(tok);
        }
        if is_err {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use TokenKind::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_select_statement_tokens() {
        let toks = tokenize("SELECT name FROM foo WHERE name = 'bar'");
        let expected: Vec<(TokenKind, &str)> = vec![
            (Select, "SELECT"),
            (Ident, "name"),
            (From, "FROM"),
            (Ident, "foo"),
            (Where, "WHERE"),
            (Ident, "name"),
            (Eq, "="),
            (Str, "'bar'"),
            (Eof, ""),
        ];
        assert_eq!(toks.len(), expected.len());
        for (tok, (kind, text)) in toks.iter().zip(expected) {
            assert_eq!(tok.kind, kind);
            assert_eq!(tok.text, text);
        }
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        let cases = vec![
            ("select", Select),
            ("SeLeCt", Select),
            ("CREATE", Create),
            ("vAlUeS", Values),
            ("tRuE", Boolean),
            ("begin", Ident), // transaction words are plain identifiers
        ];
        for case in cases {
            println!("Case: {}", case.0);
            let toks = tokenize(case.0);
            assert_eq!(toks[0].kind, case.1);
        }
    }

    #[test]
    fn test_keyword_text_is_normalized() {
        let toks = tokenize("sElEcT");
        assert_eq!(toks[0].text, "SELECT");
        // Identifier case is preserved.
        let toks = tokenize("MyTable");
        assert_eq!(toks[0].text, "MyTable");
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("= != < <= > >= + - * / ( ) ,"),
            vec![Eq, Ne, Lt, Le, Gt, Ge, Plus, Minus, Asterisk, Divide, OpenParen, CloseParen, Comma, Eof]
        );
        assert_eq!(kinds("<>"), vec![Ne, Eof]);
    }

    #[test]
    fn test_string_with_doubled_quote() {
        let toks = tokenize("'it''s'");
        assert_eq!(toks[0].kind, Str);
        assert_eq!(toks[0].text, "'it''s'");
    }

    #[test]
    fn test_runaway_string_is_error() {
        let toks = tokenize("SELECT 'oops");
        assert_eq!(toks.last().unwrap().kind, Error);
        assert_eq!(toks.last().unwrap().offset, 7);
    }

    #[test]
    fn test_offsets() {
        let toks = tokenize("ab  cd");
        assert_eq!(toks[0].offset, 0);
        assert_eq!(toks[1].offset, 4);
    }

    #[test]
    fn test_numbers() {
        let toks = tokenize("12 345");
        assert_eq!(toks[0], Token::new(Number, "12", 0));
        assert_eq!(toks[1], Token::new(Number, "345", 3));
    }

    #[test]
    fn test_unknown_character_is_error() {
        let toks = tokenize("select @");
        assert_eq!(toks.last().unwrap().kind, Error);
    }
}
