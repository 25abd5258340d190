//! Tokenizer for selector expressions.
//!
//! Keywords such as `and` or `contains` are returned as identifiers; the
//! parser decides from position whether they are operators or member names.

use super::error::{ParseError, ParseResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Token<'input> {
    Integer(i64),
    Decimal(&'input str),
    /// String literal body without quotes, escapes not yet processed
    String(&'input str),
    Boolean(bool),
    /// `@2023-01-01T10:00:00Z`, kept as text
    DateTime(&'input str),
    Identifier(&'input str),
    /// `%name` environment variable
    Variable(&'input str),
    /// `$this`, `$index`
    Special(&'input str),

    Dot,
    Comma,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,

    Plus,
    Minus,
    Multiply,
    Divide,
    Ampersand,
    Union,
    Equal,
    NotEqual,
    Equivalent,
    NotEquivalent,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

pub struct Tokenizer<'input> {
    input: &'input str,
    position: usize,
}

impl<'input> Tokenizer<'input> {
    pub fn new(input: &'input str) -> Self {
        Self { input, position: 0 }
    }

    /// Tokenize the whole input, pairing each token with its byte offset.
    pub fn tokenize(mut self) -> ParseResult<Vec<(Token<'input>, usize)>> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.input[self.position..].chars();
        chars.next();
        chars.next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.position += c.len_utf8();
        Some(c)
    }

    fn take_while(&mut self, predicate: impl Fn(char) -> bool) -> &'input str {
        let start = self.position;
        while self.peek().is_some_and(&predicate) {
            self.bump();
        }
        &self.input[start..self.position]
    }

    pub fn next_token(&mut self) -> ParseResult<Option<(Token<'input>, usize)>> {
        self.take_while(char::is_whitespace);
        let start = self.position;
        let Some(c) = self.bump() else {
            return Ok(None);
        };

        let token = match c {
            '.' => Token::Dot,
            ',' => Token::Comma,
            '(' => Token::LeftParen,
            ')' => Token::RightParen,
            '[' => Token::LeftBracket,
            ']' => Token::RightBracket,
            '{' => Token::LeftBrace,
            '}' => Token::RightBrace,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Multiply,
            '/' => Token::Divide,
            '&' => Token::Ampersand,
            '|' => Token::Union,
            '~' => Token::Equivalent,
            '=' => {
                if self.peek() == Some('=') {
                    self.bump();
                }
                Token::Equal
            }
            '!' => match self.bump() {
                Some('=') => Token::NotEqual,
                Some('~') => Token::NotEquivalent,
                _ => {
                    return Err(ParseError::UnexpectedCharacter {
                        character: '!',
                        position: start,
                    })
                }
            },
            '<' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Token::LessThanOrEqual
                } else {
                    Token::LessThan
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Token::GreaterThanOrEqual
                } else {
                    Token::GreaterThan
                }
            }
            '\'' => Token::String(self.quoted('\'', start)?),
            '`' => Token::Identifier(self.quoted('`', start)?),
            '%' => {
                if self.peek() == Some('`') {
                    self.bump();
                    Token::Variable(self.quoted('`', start)?)
                } else {
                    let name = self.take_while(is_identifier_char);
                    if name.is_empty() {
                        return Err(ParseError::UnexpectedCharacter {
                            character: '%',
                            position: start,
                        });
                    }
                    Token::Variable(name)
                }
            }
            '$' => {
                let name = self.take_while(is_identifier_char);
                Token::Special(name)
            }
            '@' => {
                let text =
                    self.take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | ':' | '.' | '+'));
                Token::DateTime(text)
            }
            c if c.is_ascii_digit() => self.number(start)?,
            c if c.is_alphabetic() || c == '_' => {
                self.take_while(is_identifier_char);
                match &self.input[start..self.position] {
                    "true" => Token::Boolean(true),
                    "false" => Token::Boolean(false),
                    word => Token::Identifier(word),
                }
            }
            other => {
                return Err(ParseError::UnexpectedCharacter {
                    character: other,
                    position: start,
                })
            }
        };
        Ok(Some((token, start)))
    }

    fn quoted(&mut self, delimiter: char, start: usize) -> ParseResult<&'input str> {
        let body_start = self.position;
        loop {
            match self.bump() {
                Some('\\') => {
                    self.bump();
                }
                Some(c) if c == delimiter => {
                    return Ok(&self.input[body_start..self.position - delimiter.len_utf8()]);
                }
                Some(_) => {}
                None => return Err(ParseError::UnterminatedString { position: start }),
            }
        }
    }

    fn number(&mut self, start: usize) -> ParseResult<Token<'input>> {
        self.take_while(|c| c.is_ascii_digit());
        let is_decimal =
            self.peek() == Some('.') && self.peek_second().is_some_and(|c| c.is_ascii_digit());
        if is_decimal {
            self.bump();
            self.take_while(|c| c.is_ascii_digit());
            return Ok(Token::Decimal(&self.input[start..self.position]));
        }
        let text = &self.input[start..self.position];
        text.parse()
            .map(Token::Integer)
            .map_err(|_| ParseError::InvalidNumber {
                text: text.to_string(),
            })
    }
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
