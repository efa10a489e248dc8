//! Byte stream to token stream. Hand-written, single-pass, position-tracking scanner.
//!
//! Errors never abort the lexer itself: an unrecognized byte produces an `ILLEGAL` token and
//! scanning continues, letting the caller (the parser) decide whether to abort. This mirrors
//! `y-lang`'s `Lexer`, which returns `ILLEGAL`/error tokens rather than failing outright.

use std::fmt::{self, Display};
use std::iter::Peekable;
use std::rc::Rc;
use std::str::Chars;

use log::trace;
use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::token::{Position, Token, TokenKind};

/// Multi-character operators, tried longest-match-first against the punctuation table.
static OPERATORS: Lazy<HashMap<&'static str, TokenKind>> = Lazy::new(|| {
    use TokenKind::*;
    HashMap::from([
        ("==", Eq),
        ("!=", Ne),
        ("<=", Le),
        (">=", Ge),
        ("&&", AndAnd),
        ("||", OrOr),
        ("=", Assign),
        ("<", Lt),
        (">", Gt),
        ("+", Plus),
        ("-", Minus),
        ("*", Star),
        ("/", Slash),
        ("%", Percent),
        ("!", Bang),
        ("(", LParen),
        (")", RParen),
        ("{", LBrace),
        ("}", RBrace),
        ("[", LBracket),
        ("]", RBracket),
        (",", Comma),
        (";", Semicolon),
        (":", Colon),
    ])
});

pub struct Lexer<'a> {
    path: Rc<str>,
    chars: Peekable<Chars<'a>>,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(path: impl Into<Rc<str>>, source: &'a str) -> Self {
        Self {
            path: path.into(),
            chars: source.chars().peekable(),
            line: 1,
            col: 1,
        }
    }

    fn pos(&self) -> Position {
        Position::new(self.path.clone(), self.line, self.col)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek2(&self) -> Option<char> {
        let mut clone = self.chars.clone();
        clone.next();
        clone.next()
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek2() == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek2() == Some('*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            None => break,
                            Some('*') => {
                                self.bump();
                                if self.peek() == Some('/') {
                                    self.bump();
                                    break;
                                }
                            }
                            Some(_) => {
                                self.bump();
                            }
                        }
                    }
                }
                _ => break,
            }
        }
    }

    /// Yields the next token, terminated by an `EOF` sentinel once the input is exhausted.
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();

        let position = self.pos();

        let Some(c) = self.peek() else {
            return Token::new(TokenKind::Eof, "", position);
        };

        let token = match c {
            'a'..='z' | 'A'..='Z' | '_' => self.lex_ident(position),
            '0'..='9' => self.lex_number(position),
            '\'' | '"' => self.lex_string(position, c),
            _ => self.lex_operator(position),
        };
        trace!("lexed {token}");
        token
    }

    fn lex_ident(&mut self, position: Position) -> Token {
        let mut lexeme = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                lexeme.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let kind = TokenKind::keyword(&lexeme).unwrap_or(TokenKind::Ident);
        Token::new(kind, lexeme, position)
    }

    fn lex_number(&mut self, position: Position) -> Token {
        let mut lexeme = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                lexeme.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if self.peek() == Some('.') && self.peek2().is_some_and(|c| c.is_ascii_digit()) {
            lexeme.push('.');
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    lexeme.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        Token::new(TokenKind::Number, lexeme, position)
    }

    fn lex_string(&mut self, position: Position, quote: char) -> Token {
        self.bump(); // opening quote
        let mut cooked = String::new();
        loop {
            match self.peek() {
                None => break,
                Some(c) if c == quote => {
                    self.bump();
                    break;
                }
                Some('\\') => {
                    self.bump();
                    match self.bump() {
                        Some('n') => cooked.push('\n'),
                        Some('r') => cooked.push('\r'),
                        Some('t') => cooked.push('\t'),
                        Some('"') => cooked.push('"'),
                        Some('\'') => cooked.push('\''),
                        Some('\\') => cooked.push('\\'),
                        Some(other) => cooked.push(other),
                        None => break,
                    }
                }
                Some(c) => {
                    cooked.push(c);
                    self.bump();
                }
            }
        }
        Token::new(TokenKind::String, cooked, position)
    }

    fn lex_operator(&mut self, position: Position) -> Token {
        let mut three = String::new();
        let mut clone = self.chars.clone();
        for _ in 0..2 {
            if let Some(c) = clone.next() {
                three.push(c);
            }
        }
        if three.len() == 2 && OPERATORS.contains_key(three.as_str()) {
            let kind = OPERATORS[three.as_str()];
            self.bump();
            self.bump();
            return Token::new(kind, three, position);
        }

        let one = self.peek().unwrap().to_string();
        if let Some(&kind) = OPERATORS.get(one.as_str()) {
            self.bump();
            return Token::new(kind, one, position);
        }

        let illegal = self.bump().unwrap();
        Token::new(TokenKind::Illegal, illegal.to_string(), position)
    }
}

impl Display for Lexer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lexer({})", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(src: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new("test.wisp", src);
        let mut kinds = vec![];
        loop {
            let tok = lexer.next_token();
            let done = tok.kind == TokenKind::Eof;
            kinds.push(tok.kind);
            if done {
                break;
            }
        }
        kinds
    }

    #[test]
    fn lexes_let_statement() {
        use TokenKind::*;
        assert_eq!(
            lex_all("let x = 1 + 2;"),
            vec![Let, Ident, Assign, Number, Plus, Number, Semicolon, Eof]
        );
    }

    #[test]
    fn lexes_keywords_vs_idents() {
        use TokenKind::*;
        assert_eq!(lex_all("if iffy"), vec![If, Ident, Eof]);
    }

    #[test]
    fn skips_line_and_block_comments() {
        use TokenKind::*;
        assert_eq!(
            lex_all("let x = 1; // trailing\n/* block */ let y = 2;"),
            vec![Let, Ident, Assign, Number, Semicolon, Let, Ident, Assign, Number, Semicolon, Eof]
        );
    }

    #[test]
    fn lexes_string_escapes() {
        let mut lexer = Lexer::new("test.wisp", r#""a\nb\"c""#);
        let tok = lexer.next_token();
        assert_eq!(tok.lexeme, "a\nb\"c");
    }

    #[test]
    fn unterminated_string_stops_at_eof() {
        let mut lexer = Lexer::new("test.wisp", "\"abc");
        let tok = lexer.next_token();
        assert_eq!(tok.kind, TokenKind::String);
        assert_eq!(tok.lexeme, "abc");
    }

    #[test]
    fn stray_ampersand_is_illegal() {
        let mut lexer = Lexer::new("test.wisp", "&");
        let tok = lexer.next_token();
        assert_eq!(tok.kind, TokenKind::Illegal);
    }

    #[test]
    fn position_tracks_lines_and_columns() {
        let mut lexer = Lexer::new("test.wisp", "a\nbb");
        let first = lexer.next_token();
        assert_eq!((first.position.line, first.position.col), (1, 1));
        let second = lexer.next_token();
        assert_eq!((second.position.line, second.position.col), (2, 1));
    }

    #[test]
    fn number_lexeme_preserved_verbatim() {
        let mut lexer = Lexer::new("test.wisp", "3.140");
        let tok = lexer.next_token();
        assert_eq!(tok.lexeme, "3.140");
    }
}
