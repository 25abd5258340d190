//! Pratt parser for selector expressions.

use super::error::{ParseError, ParseResult};
use super::tokenizer::{Token, Tokenizer};

/// Operator precedence levels (higher = tighter binding)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    Implies = 1,
    Or = 2,
    And = 3,
    Membership = 4,
    Equality = 5,
    Inequality = 6,
    Union = 7,
    Type = 8,
    Additive = 9,
    Multiplicative = 10,
    Unary = 11,
    Invocation = 12,
}

impl Precedence {
    const fn next_level(self) -> Self {
        match self {
            Precedence::Implies => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Membership,
            Precedence::Membership => Precedence::Equality,
            Precedence::Equality => Precedence::Inequality,
            Precedence::Inequality => Precedence::Union,
            Precedence::Union => Precedence::Type,
            Precedence::Type => Precedence::Additive,
            Precedence::Additive => Precedence::Multiplicative,
            Precedence::Multiplicative => Precedence::Unary,
            Precedence::Unary => Precedence::Invocation,
            Precedence::Invocation => Precedence::Invocation,
        }
    }

    const fn is_right_associative(self) -> bool {
        matches!(self, Precedence::Implies)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Implies,
    Or,
    Xor,
    And,
    In,
    Contains,
    Equal,
    NotEqual,
    Equivalent,
    NotEquivalent,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Union,
    Add,
    Subtract,
    Concatenate,
    Multiply,
    Divide,
    IntegerDivide,
    Modulo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Plus,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeOperator {
    Is,
    As,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Empty,
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    String(String),
    DateTime(String),
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Literal),
    /// Member name (or type name) evaluated against the current focus
    Identifier(String),
    Variable(String),
    This,
    Index,
    Member {
        target: Box<Expression>,
        name: String,
    },
    Function {
        target: Option<Box<Expression>>,
        name: String,
        args: Vec<Expression>,
    },
    Indexer {
        target: Box<Expression>,
        index: Box<Expression>,
    },
    Unary {
        op: UnaryOperator,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Type {
        op: TypeOperator,
        operand: Box<Expression>,
        type_name: String,
    },
}

/// Parse an expression string.
pub fn parse(input: &str) -> ParseResult<Expression> {
    let tokens = Tokenizer::new(input).tokenize()?;
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }
    let mut parser = Parser { tokens, cursor: 0 };
    let expression = parser.expression(Precedence::Implies)?;
    match parser.tokens.get(parser.cursor) {
        None => Ok(expression),
        Some((token, position)) => Err(ParseError::UnexpectedToken {
            token: format!("{token:?}"),
            position: *position,
        }),
    }
}

fn infix_precedence(token: &Token<'_>) -> Option<Precedence> {
    let precedence = match token {
        Token::Dot | Token::LeftBracket => Precedence::Invocation,
        Token::Equal | Token::NotEqual | Token::Equivalent | Token::NotEquivalent => {
            Precedence::Equality
        }
        Token::LessThan
        | Token::LessThanOrEqual
        | Token::GreaterThan
        | Token::GreaterThanOrEqual => Precedence::Inequality,
        Token::Plus | Token::Minus | Token::Ampersand => Precedence::Additive,
        Token::Multiply | Token::Divide => Precedence::Multiplicative,
        Token::Union => Precedence::Union,
        Token::Identifier(word) => match *word {
            "implies" => Precedence::Implies,
            "or" | "xor" => Precedence::Or,
            "and" => Precedence::And,
            "in" | "contains" => Precedence::Membership,
            "is" | "as" => Precedence::Type,
            "div" | "mod" => Precedence::Multiplicative,
            _ => return None,
        },
        _ => return None,
    };
    Some(precedence)
}

fn binary_operator(token: &Token<'_>) -> Option<BinaryOperator> {
    let op = match token {
        Token::Equal => BinaryOperator::Equal,
        Token::NotEqual => BinaryOperator::NotEqual,
        Token::Equivalent => BinaryOperator::Equivalent,
        Token::NotEquivalent => BinaryOperator::NotEquivalent,
        Token::LessThan => BinaryOperator::LessThan,
        Token::LessThanOrEqual => BinaryOperator::LessThanOrEqual,
        Token::GreaterThan => BinaryOperator::GreaterThan,
        Token::GreaterThanOrEqual => BinaryOperator::GreaterThanOrEqual,
        Token::Plus => BinaryOperator::Add,
        Token::Minus => BinaryOperator::Subtract,
        Token::Ampersand => BinaryOperator::Concatenate,
        Token::Multiply => BinaryOperator::Multiply,
        Token::Divide => BinaryOperator::Divide,
        Token::Union => BinaryOperator::Union,
        Token::Identifier(word) => match *word {
            "implies" => BinaryOperator::Implies,
            "or" => BinaryOperator::Or,
            "xor" => BinaryOperator::Xor,
            "and" => BinaryOperator::And,
            "in" => BinaryOperator::In,
            "contains" => BinaryOperator::Contains,
            "div" => BinaryOperator::IntegerDivide,
            "mod" => BinaryOperator::Modulo,
            _ => return None,
        },
        _ => return None,
    };
    Some(op)
}

struct Parser<'input> {
    tokens: Vec<(Token<'input>, usize)>,
    cursor: usize,
}

impl<'input> Parser<'input> {
    fn current(&self) -> Option<&Token<'input>> {
        self.tokens.get(self.cursor).map(|(t, _)| t)
    }

    fn advance(&mut self) -> ParseResult<(Token<'input>, usize)> {
        let token = self
            .tokens
            .get(self.cursor)
            .cloned()
            .ok_or(ParseError::UnexpectedEnd)?;
        self.cursor += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token<'input>) -> ParseResult<()> {
        let (token, position) = self.advance()?;
        if token == expected {
            Ok(())
        } else {
            Err(ParseError::UnexpectedToken {
                token: format!("{token:?} (expected {expected:?})"),
                position,
            })
        }
    }

    fn expression(&mut self, min: Precedence) -> ParseResult<Expression> {
        let mut left = self.prefix()?;

        while let Some(token) = self.current() {
            let Some(precedence) = infix_precedence(token) else {
                break;
            };
            if precedence < min {
                break;
            }

            left = match precedence {
                Precedence::Invocation => self.postfix(left)?,
                Precedence::Type => {
                    let (token, _) = self.advance()?;
                    let op = match token {
                        Token::Identifier("as") => TypeOperator::As,
                        _ => TypeOperator::Is,
                    };
                    Expression::Type {
                        op,
                        operand: Box::new(left),
                        type_name: self.type_specifier()?,
                    }
                }
                _ => {
                    let (token, position) = self.advance()?;
                    let op = binary_operator(&token).ok_or_else(|| ParseError::UnexpectedToken {
                        token: format!("{token:?}"),
                        position,
                    })?;
                    let next = if precedence.is_right_associative() {
                        precedence
                    } else {
                        precedence.next_level()
                    };
                    let right = self.expression(next)?;
                    Expression::Binary {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    }
                }
            };
        }
        Ok(left)
    }

    fn prefix(&mut self) -> ParseResult<Expression> {
        match self.current() {
            Some(Token::Plus) | Some(Token::Minus) => {
                let (token, _) = self.advance()?;
                let op = if token == Token::Minus {
                    UnaryOperator::Minus
                } else {
                    UnaryOperator::Plus
                };
                let operand = self.expression(Precedence::Unary)?;
                Ok(Expression::Unary {
                    op,
                    operand: Box::new(operand),
                })
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> ParseResult<Expression> {
        let (token, position) = self.advance()?;
        match token {
            Token::Integer(value) => Ok(Expression::Literal(Literal::Integer(value))),
            Token::Decimal(text) => text
                .parse()
                .map(|v| Expression::Literal(Literal::Decimal(v)))
                .map_err(|_| ParseError::InvalidNumber {
                    text: text.to_string(),
                }),
            Token::String(raw) => Ok(Expression::Literal(Literal::String(unescape(raw)))),
            Token::Boolean(value) => Ok(Expression::Literal(Literal::Boolean(value))),
            Token::DateTime(text) => Ok(Expression::Literal(Literal::DateTime(text.to_string()))),
            Token::Variable(name) => Ok(Expression::Variable(name.to_string())),
            Token::Special("this") => Ok(Expression::This),
            Token::Special("index") => Ok(Expression::Index),
            Token::Identifier(name) => {
                if self.current() == Some(&Token::LeftParen) {
                    let args = self.arguments()?;
                    Ok(Expression::Function {
                        target: None,
                        name: name.to_string(),
                        args,
                    })
                } else {
                    Ok(Expression::Identifier(name.to_string()))
                }
            }
            Token::LeftParen => {
                let inner = self.expression(Precedence::Implies)?;
                self.expect(Token::RightParen)?;
                Ok(inner)
            }
            Token::LeftBrace => {
                self.expect(Token::RightBrace)?;
                Ok(Expression::Literal(Literal::Empty))
            }
            other => Err(ParseError::UnexpectedToken {
                token: format!("{other:?}"),
                position,
            }),
        }
    }

    fn postfix(&mut self, target: Expression) -> ParseResult<Expression> {
        let (token, position) = self.advance()?;
        match token {
            Token::Dot => {
                let (name_token, name_position) = self.advance()?;
                let name = match name_token {
                    Token::Identifier(name) => name.to_string(),
                    other => {
                        return Err(ParseError::UnexpectedToken {
                            token: format!("{other:?}"),
                            position: name_position,
                        })
                    }
                };
                if self.current() == Some(&Token::LeftParen) {
                    let args = self.arguments()?;
                    Ok(Expression::Function {
                        target: Some(Box::new(target)),
                        name,
                        args,
                    })
                } else {
                    Ok(Expression::Member {
                        target: Box::new(target),
                        name,
                    })
                }
            }
            Token::LeftBracket => {
                let index = self.expression(Precedence::Implies)?;
                self.expect(Token::RightBracket)?;
                Ok(Expression::Indexer {
                    target: Box::new(target),
                    index: Box::new(index),
                })
            }
            other => Err(ParseError::UnexpectedToken {
                token: format!("{other:?}"),
                position,
            }),
        }
    }

    fn arguments(&mut self) -> ParseResult<Vec<Expression>> {
        self.expect(Token::LeftParen)?;
        let mut args = Vec::new();
        if self.current() == Some(&Token::RightParen) {
            self.advance()?;
            return Ok(args);
        }
        loop {
            args.push(self.expression(Precedence::Implies)?);
            let (token, position) = self.advance()?;
            match token {
                Token::Comma => continue,
                Token::RightParen => return Ok(args),
                other => {
                    return Err(ParseError::UnexpectedToken {
                        token: format!("{other:?}"),
                        position,
                    })
                }
            }
        }
    }

    /// `Observation`, `FHIR.Observation` or `System.String`; the namespace is dropped.
    fn type_specifier(&mut self) -> ParseResult<String> {
        let mut name = match self.advance()? {
            (Token::Identifier(name), _) => name.to_string(),
            (other, position) => {
                return Err(ParseError::UnexpectedToken {
                    token: format!("{other:?}"),
                    position,
                })
            }
        };
        while self.current() == Some(&Token::Dot) {
            self.advance()?;
            match self.advance()? {
                (Token::Identifier(part), _) => name = part.to_string(),
                (other, position) => {
                    return Err(ParseError::UnexpectedToken {
                        token: format!("{other:?}"),
                        position,
                    })
                }
            }
        }
        Ok(name)
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('f') => out.push('\u{c}'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
