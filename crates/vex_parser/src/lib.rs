use std::rc::Rc;

use regex::Regex;
use vex_syntax::{BinaryOp, Error, Node, NodeKind, Span, UnaryOp};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    True,
    False,
    Nil,
    In,
    Not,
    And,
    Or,
    Matches,
    Contains,
    StartsWith,
    EndsWith,
    // Data-carrying literals
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    StarStar,
    EqualEqual,
    BangEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    AndAnd,
    OrOr,
    Bang,
    Question,
    Colon,
    QuestionDot,
    DotDot,
    Dot,
    Hash,
    // Punctuation
    Comma,
    Semicolon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Eof,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::True => write!(f, "`true`"),
            TokenKind::False => write!(f, "`false`"),
            TokenKind::Nil => write!(f, "`nil`"),
            TokenKind::In => write!(f, "`in`"),
            TokenKind::Not => write!(f, "`not`"),
            TokenKind::And => write!(f, "`and`"),
            TokenKind::Or => write!(f, "`or`"),
            TokenKind::Matches => write!(f, "`matches`"),
            TokenKind::Contains => write!(f, "`contains`"),
            TokenKind::StartsWith => write!(f, "`startsWith`"),
            TokenKind::EndsWith => write!(f, "`endsWith`"),
            TokenKind::Ident(name) => write!(f, "identifier `{name}`"),
            TokenKind::Int(value) => write!(f, "integer literal `{value}`"),
            TokenKind::Float(value) => write!(f, "float literal `{value}`"),
            TokenKind::Str(value) => write!(f, "string literal \"{value}\""),
            TokenKind::Plus => write!(f, "`+`"),
            TokenKind::Minus => write!(f, "`-`"),
            TokenKind::Star => write!(f, "`*`"),
            TokenKind::Slash => write!(f, "`/`"),
            TokenKind::Percent => write!(f, "`%`"),
            TokenKind::StarStar => write!(f, "`**`"),
            TokenKind::EqualEqual => write!(f, "`==`"),
            TokenKind::BangEqual => write!(f, "`!=`"),
            TokenKind::Less => write!(f, "`<`"),
            TokenKind::LessEqual => write!(f, "`<=`"),
            TokenKind::Greater => write!(f, "`>`"),
            TokenKind::GreaterEqual => write!(f, "`>=`"),
            TokenKind::Equal => write!(f, "`=`"),
            TokenKind::AndAnd => write!(f, "`&&`"),
            TokenKind::OrOr => write!(f, "`||`"),
            TokenKind::Bang => write!(f, "`!`"),
            TokenKind::Question => write!(f, "`?`"),
            TokenKind::Colon => write!(f, "`:`"),
            TokenKind::QuestionDot => write!(f, "`?.`"),
            TokenKind::DotDot => write!(f, "`..`"),
            TokenKind::Dot => write!(f, "`.`"),
            TokenKind::Hash => write!(f, "`#`"),
            TokenKind::Comma => write!(f, "`,`"),
            TokenKind::Semicolon => write!(f, "`;`"),
            TokenKind::LParen => write!(f, "`(`"),
            TokenKind::RParen => write!(f, "`)`"),
            TokenKind::LBracket => write!(f, "`[`"),
            TokenKind::RBracket => write!(f, "`]`"),
            TokenKind::LBrace => write!(f, "`{{`"),
            TokenKind::RBrace => write!(f, "`}}`"),
            TokenKind::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

struct Lexer<'a> {
    chars: Vec<(usize, char)>,
    len: usize,
    pos: usize,
    source: &'a str,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Lexer {
            chars: source.char_indices().collect(),
            len: source.len(),
            pos: 0,
            source,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars.get(self.pos).map(|(o, _)| *o).unwrap_or(self.len)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn tokenize(mut self) -> Result<Vec<Token>, Error> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, Error> {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
        let start = self.offset();
        let Some(c) = self.peek() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                span: Span::new(start, start),
            });
        };

        let kind = match c {
            '0'..='9' => return self.number(start),
            '.' => {
                if matches!(self.peek_at(1), Some('0'..='9')) {
                    return self.number(start);
                }
                self.bump();
                if self.peek() == Some('.') {
                    self.bump();
                    TokenKind::DotDot
                } else {
                    TokenKind::Dot
                }
            }
            '\'' | '"' => return self.string(start, c),
            c if c.is_alphabetic() || c == '_' => return Ok(self.ident(start)),
            '+' => {
                self.bump();
                TokenKind::Plus
            }
            '-' => {
                self.bump();
                TokenKind::Minus
            }
            '*' => {
                self.bump();
                if self.peek() == Some('*') {
                    self.bump();
                    TokenKind::StarStar
                } else {
                    TokenKind::Star
                }
            }
            '/' => {
                self.bump();
                TokenKind::Slash
            }
            '%' => {
                self.bump();
                TokenKind::Percent
            }
            '=' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                }
            }
            '!' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                }
            }
            '<' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                }
            }
            '>' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                }
            }
            '&' => {
                self.bump();
                if self.peek() == Some('&') {
                    self.bump();
                    TokenKind::AndAnd
                } else {
                    return Err(Error::new(
                        "unknown character `&`",
                        Span::new(start, self.offset()),
                    ));
                }
            }
            '|' => {
                self.bump();
                if self.peek() == Some('|') {
                    self.bump();
                    TokenKind::OrOr
                } else {
                    return Err(Error::new(
                        "unknown character `|`",
                        Span::new(start, self.offset()),
                    ));
                }
            }
            '?' => {
                self.bump();
                if self.peek() == Some('.') {
                    self.bump();
                    TokenKind::QuestionDot
                } else {
                    TokenKind::Question
                }
            }
            ':' => {
                self.bump();
                TokenKind::Colon
            }
            '#' => {
                self.bump();
                TokenKind::Hash
            }
            ',' => {
                self.bump();
                TokenKind::Comma
            }
            ';' => {
                self.bump();
                TokenKind::Semicolon
            }
            '(' => {
                self.bump();
                TokenKind::LParen
            }
            ')' => {
                self.bump();
                TokenKind::RParen
            }
            '[' => {
                self.bump();
                TokenKind::LBracket
            }
            ']' => {
                self.bump();
                TokenKind::RBracket
            }
            '{' => {
                self.bump();
                TokenKind::LBrace
            }
            '}' => {
                self.bump();
                TokenKind::RBrace
            }
            other => {
                self.bump();
                return Err(Error::new(
                    format!("unknown character `{other}`"),
                    Span::new(start, self.offset()),
                ));
            }
        };
        Ok(Token {
            kind,
            span: Span::new(start, self.offset()),
        })
    }

    fn number(&mut self, start: usize) -> Result<Token, Error> {
        let mut seen_dot = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => {
                    self.bump();
                }
                // `1..3` keeps the range operator intact.
                '.' if !seen_dot && matches!(self.peek_at(1), Some('0'..='9')) => {
                    seen_dot = true;
                    self.bump();
                }
                _ => break,
            }
        }
        let end = self.offset();
        let text = &self.source[start..end];
        let kind = if seen_dot || text.starts_with('.') {
            let value = text
                .parse::<f64>()
                .map_err(|_| Error::new("invalid number", Span::new(start, end)))?;
            TokenKind::Float(value)
        } else {
            let value = text
                .parse::<i64>()
                .map_err(|_| Error::new("invalid number", Span::new(start, end)))?;
            TokenKind::Int(value)
        };
        Ok(Token {
            kind,
            span: Span::new(start, end),
        })
    }

    fn string(&mut self, start: usize, quote: char) -> Result<Token, Error> {
        self.bump();
        let mut value = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(Error::new(
                    "unterminated string",
                    Span::new(start, self.offset()),
                ));
            };
            match c {
                c if c == quote => break,
                '\\' => {
                    let Some(escape) = self.bump() else {
                        return Err(Error::new(
                            "unterminated string",
                            Span::new(start, self.offset()),
                        ));
                    };
                    match escape {
                        '\'' => value.push('\''),
                        '"' => value.push('"'),
                        '\\' => value.push('\\'),
                        'n' => value.push('\n'),
                        'r' => value.push('\r'),
                        't' => value.push('\t'),
                        other => {
                            return Err(Error::new(
                                format!("unknown escape sequence `\\{other}`"),
                                Span::new(start, self.offset()),
                            ))
                        }
                    }
                }
                other => value.push(other),
            }
        }
        Ok(Token {
            kind: TokenKind::Str(value),
            span: Span::new(start, self.offset()),
        })
    }

    fn ident(&mut self, start: usize) -> Token {
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.bump();
        }
        let end = self.offset();
        let kind = match &self.source[start..end] {
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "nil" => TokenKind::Nil,
            "in" => TokenKind::In,
            "not" => TokenKind::Not,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "matches" => TokenKind::Matches,
            "contains" => TokenKind::Contains,
            "startsWith" => TokenKind::StartsWith,
            "endsWith" => TokenKind::EndsWith,
            name => TokenKind::Ident(name.to_string()),
        };
        Token {
            kind,
            span: Span::new(start, end),
        }
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, Error> {
    Lexer::new(source).tokenize()
}

/// Comprehension and length builtins. Calls to these names parse into
/// Builtin nodes, and their brace-delimited arguments parse as closures.
pub const BUILTINS: &[&str] = &[
    "len", "all", "none", "any", "one", "filter", "map", "count",
];

// Binding powers, loosest to tightest. `**` is right-associative, the
// conditional is handled separately below them all.
const BP_TERNARY: u8 = 1;
const BP_OR: u8 = 2;
const BP_AND: u8 = 3;
const BP_MEMBERSHIP: u8 = 4;
const BP_EQUALITY: u8 = 5;
const BP_COMPARISON: u8 = 6;
const BP_RANGE: u8 = 7;
const BP_ADDITIVE: u8 = 8;
const BP_MULTIPLICATIVE: u8 = 9;
const BP_POW: u8 = 10;
const BP_UNARY: u8 = 11;

pub fn parse(source: &str) -> Result<Node, Error> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let node = parser.expression(0)?;
    match parser.current().kind {
        TokenKind::Eof => Ok(node),
        _ => Err(parser.unexpected("end of input")),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.current().kind
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, Error> {
        if self.peek_kind() == &kind {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&kind.to_string()))
        }
    }

    fn unexpected(&self, expected: &str) -> Error {
        let token = self.current();
        Error::new(
            format!("unexpected token {}, expected {expected}", token.kind),
            token.span,
        )
    }

    fn expression(&mut self, min_bp: u8) -> Result<Node, Error> {
        let mut lhs = self.prefix()?;
        loop {
            let (op, bp, right_assoc) = match self.peek_kind() {
                TokenKind::Question => {
                    if BP_TERNARY < min_bp {
                        break;
                    }
                    let question = self.advance();
                    let then = self.expression(0)?;
                    self.expect(TokenKind::Colon)?;
                    let otherwise = self.expression(BP_TERNARY)?;
                    lhs = Node::new(
                        NodeKind::Conditional {
                            cond: Box::new(lhs),
                            then: Box::new(then),
                            otherwise: Box::new(otherwise),
                        },
                        question.span,
                    );
                    continue;
                }
                TokenKind::Or | TokenKind::OrOr => (BinaryOp::Or, BP_OR, false),
                TokenKind::And | TokenKind::AndAnd => (BinaryOp::And, BP_AND, false),
                TokenKind::In => (BinaryOp::In, BP_MEMBERSHIP, false),
                TokenKind::Not => {
                    // `x not in y` negates the membership test.
                    if BP_MEMBERSHIP < min_bp {
                        break;
                    }
                    let not_token = self.advance();
                    let in_token = self.expect(TokenKind::In)?;
                    let rhs = self.expression(BP_MEMBERSHIP + 1)?;
                    let membership = Node::new(
                        NodeKind::Binary {
                            op: BinaryOp::In,
                            left: Box::new(lhs),
                            right: Box::new(rhs),
                        },
                        in_token.span,
                    );
                    lhs = Node::new(
                        NodeKind::Unary {
                            op: UnaryOp::Not,
                            node: Box::new(membership),
                        },
                        not_token.span,
                    );
                    continue;
                }
                TokenKind::Matches => {
                    if BP_MEMBERSHIP < min_bp {
                        break;
                    }
                    let op_token = self.advance();
                    let rhs = self.expression(BP_MEMBERSHIP + 1)?;
                    let regex = match &rhs.kind {
                        NodeKind::Str(pattern) => Some(
                            Regex::new(pattern)
                                .map(Rc::new)
                                .map_err(|err| Error::new(format!("{err}"), rhs.span))?,
                        ),
                        _ => None,
                    };
                    lhs = Node::new(
                        NodeKind::Matches {
                            left: Box::new(lhs),
                            right: Box::new(rhs),
                            regex,
                        },
                        op_token.span,
                    );
                    continue;
                }
                TokenKind::Contains => (BinaryOp::Contains, BP_MEMBERSHIP, false),
                TokenKind::StartsWith => (BinaryOp::StartsWith, BP_MEMBERSHIP, false),
                TokenKind::EndsWith => (BinaryOp::EndsWith, BP_MEMBERSHIP, false),
                TokenKind::EqualEqual | TokenKind::Equal => (BinaryOp::Eq, BP_EQUALITY, false),
                TokenKind::BangEqual => (BinaryOp::Ne, BP_EQUALITY, false),
                TokenKind::Less => (BinaryOp::Lt, BP_COMPARISON, false),
                TokenKind::LessEqual => (BinaryOp::Le, BP_COMPARISON, false),
                TokenKind::Greater => (BinaryOp::Gt, BP_COMPARISON, false),
                TokenKind::GreaterEqual => (BinaryOp::Ge, BP_COMPARISON, false),
                TokenKind::DotDot => (BinaryOp::Range, BP_RANGE, false),
                TokenKind::Plus => (BinaryOp::Add, BP_ADDITIVE, false),
                TokenKind::Minus => (BinaryOp::Sub, BP_ADDITIVE, false),
                TokenKind::Star => (BinaryOp::Mul, BP_MULTIPLICATIVE, false),
                TokenKind::Slash => (BinaryOp::Div, BP_MULTIPLICATIVE, false),
                TokenKind::Percent => (BinaryOp::Mod, BP_MULTIPLICATIVE, false),
                TokenKind::StarStar => (BinaryOp::Pow, BP_POW, true),
                _ => break,
            };
            if bp < min_bp {
                break;
            }
            let op_token = self.advance();
            let next_bp = if right_assoc { bp } else { bp + 1 };
            let rhs = self.expression(next_bp)?;
            // The node carries the operator's own span, so failures point
            // at the operator rather than the whole expression.
            lhs = Node::new(
                NodeKind::Binary {
                    op,
                    left: Box::new(lhs),
                    right: Box::new(rhs),
                },
                op_token.span,
            );
        }
        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Node, Error> {
        let token = self.current().clone();
        match &token.kind {
            TokenKind::Minus | TokenKind::Plus | TokenKind::Bang | TokenKind::Not => {
                let op = match token.kind {
                    TokenKind::Minus => UnaryOp::Neg,
                    TokenKind::Plus => UnaryOp::Pos,
                    _ => UnaryOp::Not,
                };
                self.advance();
                let node = self.expression(BP_UNARY)?;
                Ok(Node::new(
                    NodeKind::Unary {
                        op,
                        node: Box::new(node),
                    },
                    token.span,
                ))
            }
            _ => {
                let primary = self.primary()?;
                self.postfix(primary)
            }
        }
    }

    fn primary(&mut self) -> Result<Node, Error> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::True => {
                self.advance();
                Ok(Node::new(NodeKind::Bool(true), token.span))
            }
            TokenKind::False => {
                self.advance();
                Ok(Node::new(NodeKind::Bool(false), token.span))
            }
            TokenKind::Nil => {
                self.advance();
                Ok(Node::new(NodeKind::Nil, token.span))
            }
            TokenKind::Int(value) => {
                self.advance();
                Ok(Node::new(NodeKind::Int(value), token.span))
            }
            TokenKind::Float(value) => {
                self.advance();
                Ok(Node::new(NodeKind::Float(value), token.span))
            }
            TokenKind::Str(ref value) => {
                let value = value.clone();
                self.advance();
                Ok(Node::new(NodeKind::Str(value), token.span))
            }
            TokenKind::Ident(ref name) => {
                let name = name.clone();
                self.advance();
                if self.peek_kind() == &TokenKind::LParen {
                    self.call(name, token.span)
                } else {
                    Ok(Node::new(NodeKind::Identifier(name), token.span))
                }
            }
            TokenKind::Hash => {
                self.advance();
                Ok(Node::new(NodeKind::Pointer, token.span))
            }
            // A leading `.name` is a property of the current element.
            TokenKind::Dot => Ok(Node::new(NodeKind::Pointer, Span::new(
                token.span.start,
                token.span.start,
            ))),
            TokenKind::LParen => {
                self.advance();
                let node = self.expression(0)?;
                self.expect(TokenKind::RParen)?;
                Ok(node)
            }
            TokenKind::LBracket => self.array(token.span),
            TokenKind::LBrace => self.map(token.span),
            _ => Err(self.unexpected("expression")),
        }
    }

    fn array(&mut self, open: Span) -> Result<Node, Error> {
        self.expect(TokenKind::LBracket)?;
        let mut nodes = Vec::new();
        while self.peek_kind() != &TokenKind::RBracket {
            nodes.push(self.expression(0)?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        let close = self.expect(TokenKind::RBracket)?;
        Ok(Node::new(
            NodeKind::Array { nodes },
            open.join(close.span),
        ))
    }

    fn map(&mut self, open: Span) -> Result<Node, Error> {
        self.expect(TokenKind::LBrace)?;
        let mut pairs = Vec::new();
        while self.peek_kind() != &TokenKind::RBrace {
            let key = match self.peek_kind().clone() {
                TokenKind::Ident(name) => {
                    self.advance();
                    name
                }
                TokenKind::Str(value) => {
                    self.advance();
                    value
                }
                _ => return Err(self.unexpected("map key")),
            };
            self.expect(TokenKind::Colon)?;
            let value = self.expression(0)?;
            pairs.push((key, value));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        let close = self.expect(TokenKind::RBrace)?;
        Ok(Node::new(NodeKind::Map { pairs }, open.join(close.span)))
    }

    fn closure(&mut self) -> Result<Node, Error> {
        let open = self.expect(TokenKind::LBrace)?;
        let body = self.expression(0)?;
        let close = self.expect(TokenKind::RBrace)?;
        Ok(Node::new(
            NodeKind::Closure {
                node: Box::new(body),
            },
            open.span.join(close.span),
        ))
    }

    fn call(&mut self, name: String, name_span: Span) -> Result<Node, Error> {
        let builtin = BUILTINS.contains(&name.as_str());
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        while self.peek_kind() != &TokenKind::RParen {
            // Inside comprehension builtins a brace-delimited argument is a
            // closure over `#`; everywhere else braces are map literals.
            let arg = if builtin && self.peek_kind() == &TokenKind::LBrace {
                self.closure()?
            } else {
                self.expression(0)?
            };
            args.push(arg);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        if builtin {
            Ok(Node::new(NodeKind::Builtin { name, args }, name_span))
        } else {
            Ok(Node::new(NodeKind::Call { name, args }, name_span))
        }
    }

    fn postfix(&mut self, mut node: Node) -> Result<Node, Error> {
        let mut optional_chain = false;
        loop {
            match self.peek_kind() {
                TokenKind::Dot | TokenKind::QuestionDot => {
                    let optional = self.peek_kind() == &TokenKind::QuestionDot;
                    optional_chain |= optional;
                    self.advance();
                    let name_token = self.current().clone();
                    let name = match name_token.kind {
                        TokenKind::Ident(name) => {
                            self.advance();
                            name
                        }
                        _ => return Err(self.unexpected("property name")),
                    };
                    if self.peek_kind() == &TokenKind::LParen {
                        self.expect(TokenKind::LParen)?;
                        let mut args = Vec::new();
                        while self.peek_kind() != &TokenKind::RParen {
                            args.push(self.expression(0)?);
                            if !self.eat(&TokenKind::Comma) {
                                break;
                            }
                        }
                        self.expect(TokenKind::RParen)?;
                        node = Node::new(
                            NodeKind::Method {
                                node: Box::new(node),
                                method: name,
                                args,
                            },
                            name_token.span,
                        );
                    } else {
                        node = Node::new(
                            NodeKind::Property {
                                node: Box::new(node),
                                property: name,
                                optional,
                            },
                            name_token.span,
                        );
                    }
                }
                TokenKind::LBracket => {
                    let bracket = self.advance();
                    node = self.index_or_slice(node, bracket.span)?;
                }
                _ => break,
            }
        }
        if optional_chain {
            let span = node.span;
            node = Node::new(
                NodeKind::Chain {
                    node: Box::new(node),
                },
                span,
            );
        }
        Ok(node)
    }

    fn index_or_slice(&mut self, node: Node, bracket: Span) -> Result<Node, Error> {
        if self.eat(&TokenKind::Colon) {
            let to = if self.peek_kind() == &TokenKind::RBracket {
                None
            } else {
                Some(Box::new(self.expression(0)?))
            };
            self.expect(TokenKind::RBracket)?;
            return Ok(Node::new(
                NodeKind::Slice {
                    node: Box::new(node),
                    from: None,
                    to,
                },
                bracket,
            ));
        }
        let index = self.expression(0)?;
        if self.eat(&TokenKind::Colon) {
            let to = if self.peek_kind() == &TokenKind::RBracket {
                None
            } else {
                Some(Box::new(self.expression(0)?))
            };
            self.expect(TokenKind::RBracket)?;
            return Ok(Node::new(
                NodeKind::Slice {
                    node: Box::new(node),
                    from: Some(Box::new(index)),
                    to,
                },
                bracket,
            ));
        }
        self.expect(TokenKind::RBracket)?;
        Ok(Node::new(
            NodeKind::Index {
                node: Box::new(node),
                index: Box::new(index),
            },
            bracket,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump(source: &str) -> String {
        parse(source).expect(source).dump()
    }

    #[test]
    fn lexes_operators_and_literals() {
        let tokens = tokenize(r#"a ?. b .. 1.5 .5 "x\n" 'y' ** #"#).unwrap();
        let kinds: Vec<_> = tokens.into_iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::QuestionDot,
                TokenKind::Ident("b".into()),
                TokenKind::DotDot,
                TokenKind::Float(1.5),
                TokenKind::Float(0.5),
                TokenKind::Str("x\n".into()),
                TokenKind::Str("y".into()),
                TokenKind::StarStar,
                TokenKind::Hash,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lex_error_on_unterminated_string() {
        let err = tokenize(r#""abc"#).unwrap_err();
        assert_eq!(err.message, "unterminated string");
    }

    #[test]
    fn lex_error_on_unknown_character() {
        let err = tokenize("1 @ 2").unwrap_err();
        assert_eq!(err.message, "unknown character `@`");
        assert_eq!(err.span, Span::new(2, 3));
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(dump("1+2>2*0.5"), "((1 + 2) > (2 * 0.5))");
        assert_eq!(dump("2 ** 3 ** 2"), "(2 ** (3 ** 2))");
        assert_eq!(dump("true && false || false"), "((true and false) or false)");
        assert_eq!(dump("-(2-5)**3"), "((- (2 - 5)) ** 3)");
        assert_eq!(dump("0 in -1..1 and 1 in 1..1"), "((0 in ((- 1) .. 1)) and (1 in (1 .. 1)))");
        assert_eq!(dump("a = b"), "(a == b)");
    }

    #[test]
    fn ternary_nests_to_the_right() {
        assert_eq!(
            dump("a ? 1 : b ? 2 : 3"),
            "(a ? 1 : (b ? 2 : 3))"
        );
        assert_eq!(
            dump("(true ? 0+1 : 2+3) + (false ? -1 : -2)"),
            "((true ? (0 + 1) : (2 + 3)) + (false ? (- 1) : (- 2)))"
        );
    }

    #[test]
    fn not_in_membership() {
        assert_eq!(dump("a not in b"), "(not (a in b))");
        assert_eq!(dump("not a in b"), "((not a) in b)");
    }

    #[test]
    fn postfix_chains() {
        assert_eq!(dump("foo.bar.baz"), "foo.bar.baz");
        assert_eq!(dump("foo.bar(1, 2)"), "foo.bar(1, 2)");
        assert_eq!(dump("array[0] < array[1]"), "(array[0] < array[1])");
        assert_eq!(dump("string[3:9]"), "string[3:9]");
        assert_eq!(dump("array[:]"), "array[:]");
        assert_eq!(dump("array[2:]"), "array[2:]");
        assert_eq!(dump("a?.b.c"), "Chain(a?.b.c)");
    }

    #[test]
    fn calls_and_builtins() {
        assert_eq!(dump("sum(array)"), "sum(array)");
        assert_eq!(dump("len([1, 2, 3])"), "len([1, 2, 3])");
        assert_eq!(dump("filter(1..9, {# > 7})"), "filter((1 .. 9), {(# > 7)})");
        assert_eq!(
            dump("map(filter(tweets, {len(.text) > 10}), {format(.date)})"),
            "map(filter(tweets, {(len(#.text) > 10)}), {format(#.date)})"
        );
    }

    #[test]
    fn map_literals_and_closures_disambiguate() {
        assert_eq!(dump("{foo: 0, bar: 1}"), "{foo: 0, bar: 1}");
        assert_eq!(dump(r#"{"foo": 0}"#), "{foo: 0}");
        assert_eq!(dump("mapArg({foo: \"bar\"})"), "mapArg({foo: \"bar\"})");
    }

    #[test]
    fn literal_matches_patterns_precompile() {
        let node = parse(r#"string matches "s.+""#).unwrap();
        match node.kind {
            NodeKind::Matches { regex, .. } => assert!(regex.is_some()),
            other => panic!("unexpected node: {other:?}"),
        }
        let node = parse(r#"string matches ("^" + string + "$")"#).unwrap();
        match node.kind {
            NodeKind::Matches { regex, .. } => assert!(regex.is_none()),
            other => panic!("unexpected node: {other:?}"),
        }
    }

    #[test]
    fn invalid_literal_pattern_is_a_parse_error() {
        let err = parse(r#"x matches "[""#).unwrap_err();
        assert!(err.message.contains("regex"));
    }

    #[test]
    fn parse_error_reports_offending_token() {
        let err = parse("1 + )").unwrap_err();
        assert_eq!(err.span, Span::new(4, 5));
        assert!(err.message.contains("expected expression"));

        let err = parse("[1, 2").unwrap_err();
        assert!(err.message.contains("`]`"));

        let err = parse("1; 2").unwrap_err();
        assert!(err.message.contains("unexpected token"));
    }
}
