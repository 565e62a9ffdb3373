// Resolution predicates
//
// A small boolean language over descriptor fields, in the style of LSL's
// `resolve_bypred`:
//
//   name='Markers' and (type="EEG" or channel_count >= 8) and not hostname='lab-2'
//
// Strings compare with `=` and `!=`, numeric fields also with `<`, `>`, `<=`, `>=`.
// Keywords are case-insensitive. An empty predicate matches every stream. Anything
// else that does not parse is an error carrying the byte offset of the problem.

use crate::error::{LslError, LslResult};
use crate::types::{StreamDescriptor, ValueEncoding};
use std::fmt;

/// Longest predicate text accepted, in bytes
pub const MAX_PREDICATE_LEN: usize = 4096;

/// Deepest nesting of parentheses and `not`
const MAX_DEPTH: usize = 64;

/// Parsed resolution predicate
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    source: String,
    expr: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        field: Field,
        op: CompareOp,
        value: Literal,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Name,
    ContentType,
    SourceId,
    Uid,
    Hostname,
    ChannelCount,
    NominalRate,
    Encoding,
}

impl Field {
    fn lookup(ident: &str) -> Option<Self> {
        Some(match ident.to_ascii_lowercase().as_str() {
            "name" => Field::Name,
            "type" | "content_type" => Field::ContentType,
            "source_id" => Field::SourceId,
            "uid" => Field::Uid,
            "hostname" => Field::Hostname,
            "channel_count" => Field::ChannelCount,
            "nominal_srate" | "nominal_rate" => Field::NominalRate,
            "channel_format" | "encoding" => Field::Encoding,
            _ => return None,
        })
    }

    fn is_numeric(self) -> bool {
        matches!(self, Field::ChannelCount | Field::NominalRate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompareOp {
    fn is_equality(self) -> bool {
        matches!(self, CompareOp::Eq | CompareOp::Ne)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Text(String),
    Number(f64),
    Encoding(ValueEncoding),
}

impl Predicate {
    /// Parse a predicate expression
    pub fn parse(source: &str) -> LslResult<Self> {
        if source.len() > MAX_PREDICATE_LEN {
            return Err(predicate_error(
                MAX_PREDICATE_LEN,
                format!("predicate longer than {} bytes", MAX_PREDICATE_LEN),
            ));
        }
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };

        let expr = if parser.peek().kind == TokenKind::End {
            None
        } else {
            let expr = parser.parse_or()?;
            let trailing = parser.peek();
            if trailing.kind != TokenKind::End {
                return Err(predicate_error(
                    trailing.position,
                    format!("unexpected {}", trailing.kind),
                ));
            }
            Some(expr)
        };

        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Predicate that matches every stream
    pub fn any() -> Self {
        Self {
            source: String::new(),
            expr: None,
        }
    }

    /// Exact match on a single property, e.g. `by_property("name", "Markers")`
    pub fn by_property(property: &str, value: &str) -> LslResult<Self> {
        Self::parse(&format!("{}={}", property, quote(value)?))
    }

    /// Match by stream name and, when non-empty, content type
    pub fn name_and_type(name: &str, content_type: &str) -> LslResult<Self> {
        let mut clauses = Vec::new();
        if !name.is_empty() {
            clauses.push(format!("name={}", quote(name)?));
        }
        if !content_type.is_empty() {
            clauses.push(format!("type={}", quote(content_type)?));
        }
        Self::parse(&clauses.join(" and "))
    }

    pub fn matches(&self, descriptor: &StreamDescriptor) -> bool {
        self.expr
            .as_ref()
            .map_or(true, |expr| evaluate(expr, descriptor))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_any(&self) -> bool {
        self.expr.is_none()
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for Predicate {
    type Err = LslError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Predicate::parse(s)
    }
}

fn quote(value: &str) -> LslResult<String> {
    if !value.contains('\'') {
        Ok(format!("'{}'", value))
    } else if !value.contains('"') {
        Ok(format!("\"{}\"", value))
    } else {
        Err(LslError::Configuration(format!(
            "Value {} contains both quote characters",
            value
        )))
    }
}

fn evaluate(expr: &Expr, descriptor: &StreamDescriptor) -> bool {
    match expr {
        Expr::Or(lhs, rhs) => evaluate(lhs, descriptor) || evaluate(rhs, descriptor),
        Expr::And(lhs, rhs) => evaluate(lhs, descriptor) && evaluate(rhs, descriptor),
        Expr::Not(inner) => !evaluate(inner, descriptor),
        Expr::Compare { field, op, value } => compare(*field, *op, value, descriptor),
    }
}

fn compare(field: Field, op: CompareOp, value: &Literal, descriptor: &StreamDescriptor) -> bool {
    let equal = match (field, value) {
        (Field::ChannelCount, Literal::Number(n)) => {
            return ordering(op, descriptor.channel_count() as f64, *n)
        }
        (Field::NominalRate, Literal::Number(n)) => {
            return ordering(op, descriptor.nominal_rate().as_hz(), *n)
        }
        (Field::Encoding, Literal::Encoding(encoding)) => descriptor.encoding() == *encoding,
        (Field::Name, Literal::Text(s)) => descriptor.name() == s,
        (Field::ContentType, Literal::Text(s)) => descriptor.content_type() == s,
        (Field::SourceId, Literal::Text(s)) => descriptor.source_id() == s,
        (Field::Uid, Literal::Text(s)) => descriptor.uid() == s,
        (Field::Hostname, Literal::Text(s)) => descriptor.hostname() == s,
        // The parser only builds the pairs above
        _ => return false,
    };

    match op {
        CompareOp::Eq => equal,
        CompareOp::Ne => !equal,
        _ => false,
    }
}

fn ordering(op: CompareOp, actual: f64, expected: f64) -> bool {
    match op {
        CompareOp::Eq => actual == expected,
        CompareOp::Ne => actual != expected,
        CompareOp::Lt => actual < expected,
        CompareOp::Gt => actual > expected,
        CompareOp::Le => actual <= expected,
        CompareOp::Ge => actual >= expected,
    }
}

fn predicate_error(position: usize, message: impl Into<String>) -> LslError {
    LslError::Predicate {
        position,
        message: message.into(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Text(String),
    Number(f64),
    Op(CompareOp),
    LParen,
    RParen,
    End,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(s) => write!(f, "'{}'", s),
            TokenKind::Text(s) => write!(f, "string '{}'", s),
            TokenKind::Number(n) => write!(f, "number {}", n),
            TokenKind::Op(_) => f.write_str("operator"),
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
            TokenKind::End => f.write_str("end of input"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn tokenize(source: &str) -> LslResult<Vec<Token>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let kind = match c {
            b'(' => {
                i += 1;
                TokenKind::LParen
            }
            b')' => {
                i += 1;
                TokenKind::RParen
            }
            b'=' => {
                // Accept `==` as well as `=`
                i += if bytes.get(i + 1) == Some(&b'=') { 2 } else { 1 };
                TokenKind::Op(CompareOp::Eq)
            }
            b'!' => {
                if bytes.get(i + 1) != Some(&b'=') {
                    return Err(predicate_error(start, "expected '!='"));
                }
                i += 2;
                TokenKind::Op(CompareOp::Ne)
            }
            b'<' | b'>' => {
                let or_equal = bytes.get(i + 1) == Some(&b'=');
                i += if or_equal { 2 } else { 1 };
                TokenKind::Op(match (c, or_equal) {
                    (b'<', false) => CompareOp::Lt,
                    (b'<', true) => CompareOp::Le,
                    (_, false) => CompareOp::Gt,
                    (_, true) => CompareOp::Ge,
                })
            }
            b'\'' | b'"' => {
                let end = source[i + 1..]
                    .find(c as char)
                    .ok_or_else(|| predicate_error(start, "unterminated string"))?;
                let text = source[i + 1..i + 1 + end].to_string();
                i += end + 2;
                TokenKind::Text(text)
            }
            b'0'..=b'9' | b'-' | b'+' | b'.' => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'.' | b'-' | b'+'))
                {
                    i += 1;
                }
                let raw = &source[start..i];
                let number = raw
                    .parse::<f64>()
                    .map_err(|_| predicate_error(start, format!("invalid number '{}'", raw)))?;
                TokenKind::Number(number)
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                TokenKind::Ident(source[start..i].to_string())
            }
            _ => {
                let ch = source[start..].chars().next().unwrap_or('?');
                return Err(predicate_error(start, format!("unexpected character '{}'", ch)));
            }
        };

        tokens.push(Token {
            kind,
            position: start,
        });
    }

    tokens.push(Token {
        kind: TokenKind::End,
        position: source.len(),
    });
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The token list always ends with `End`
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        match &self.peek().kind {
            TokenKind::Ident(ident) if ident.eq_ignore_ascii_case(keyword) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn parse_or(&mut self) -> LslResult<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat_keyword("or") {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> LslResult<Expr> {
        let mut lhs = self.parse_unary()?;
        while self.eat_keyword("and") {
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> LslResult<Expr> {
        let nests = self.peek().kind == TokenKind::LParen
            || matches!(&self.peek().kind, TokenKind::Ident(ident) if ident.eq_ignore_ascii_case("not"));
        if !nests {
            return self.parse_comparison();
        }

        if self.depth >= MAX_DEPTH {
            return Err(predicate_error(
                self.peek().position,
                "expression nested too deeply",
            ));
        }
        self.depth += 1;
        let expr = self.parse_nested();
        self.depth -= 1;
        expr
    }

    fn parse_nested(&mut self) -> LslResult<Expr> {
        if self.eat_keyword("not") {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }

        self.advance();
        let inner = self.parse_or()?;
        let close = self.advance();
        if close.kind != TokenKind::RParen {
            return Err(predicate_error(
                close.position,
                format!("expected ')' but found {}", close.kind),
            ));
        }
        Ok(inner)
    }

    fn parse_comparison(&mut self) -> LslResult<Expr> {
        let field_token = self.advance();
        let field = match &field_token.kind {
            TokenKind::Ident(ident) => Field::lookup(ident).ok_or_else(|| {
                predicate_error(field_token.position, format!("unknown field '{}'", ident))
            })?,
            other => {
                return Err(predicate_error(
                    field_token.position,
                    format!("expected a field name but found {}", other),
                ))
            }
        };

        let op_token = self.advance();
        let op = match op_token.kind {
            TokenKind::Op(op) => op,
            other => {
                return Err(predicate_error(
                    op_token.position,
                    format!("expected a comparison operator but found {}", other),
                ))
            }
        };
        if !field.is_numeric() && !op.is_equality() {
            return Err(predicate_error(
                op_token.position,
                "ordering comparisons need a numeric field",
            ));
        }

        let value_token = self.advance();
        let value = literal_for(field, value_token)?;
        Ok(Expr::Compare { field, op, value })
    }
}

fn literal_for(field: Field, token: Token) -> LslResult<Literal> {
    let position = token.position;
    match (field, token.kind) {
        (Field::ChannelCount | Field::NominalRate, TokenKind::Number(n)) => Ok(Literal::Number(n)),
        (Field::ChannelCount | Field::NominalRate, TokenKind::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(Literal::Number)
            .map_err(|_| predicate_error(position, format!("'{}' is not a number", s))),
        (Field::Encoding, TokenKind::Text(s) | TokenKind::Ident(s)) => s
            .parse::<ValueEncoding>()
            .map(Literal::Encoding)
            .map_err(|_| predicate_error(position, format!("unknown channel format '{}'", s))),
        (_, TokenKind::Text(s)) => Ok(Literal::Text(s)),
        (_, other) => Err(predicate_error(
            position,
            format!("expected a quoted string but found {}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NominalRate;

    fn eeg() -> StreamDescriptor {
        StreamDescriptor::new(
            "BioSemi",
            "EEG",
            32,
            NominalRate::Regular(512.0),
            ValueEncoding::Float32,
            "amp-42",
        )
        .unwrap()
    }

    fn markers() -> StreamDescriptor {
        StreamDescriptor::new(
            "Markers",
            "Markers",
            1,
            NominalRate::Irregular,
            ValueEncoding::String,
            "",
        )
        .unwrap()
    }

    #[test]
    fn test_nesting_and_length_limits() {
        let nested = format!("{}name='x'{}", "(".repeat(30_000), ")".repeat(30_000));
        assert!(matches!(
            Predicate::parse(&nested),
            Err(LslError::Predicate { .. })
        ));

        let deep = format!("{}name='x'{}", "(".repeat(MAX_DEPTH + 1), ")".repeat(MAX_DEPTH + 1));
        let err = Predicate::parse(&deep).unwrap_err();
        assert!(err.to_string().contains("nested too deeply"));
        assert!(Predicate::parse(&"not ".repeat(MAX_DEPTH + 1)).is_err());

        let ok = format!("{}name='x'{}", "(".repeat(MAX_DEPTH), ")".repeat(MAX_DEPTH));
        assert!(!Predicate::parse(&ok).unwrap().matches(&eeg()));
        assert!(Predicate::parse(&format!("not {}", "not ".repeat(10) + "name='BioSemi'")).is_ok());

        let long = vec!["name='x'"; 1000].join(" or ");
        assert!(long.len() > MAX_PREDICATE_LEN);
        assert!(Predicate::parse(&long).is_err());
    }

    fn check(source: &str, descriptor: &StreamDescriptor) -> bool {
        Predicate::parse(source).unwrap().matches(descriptor)
    }

    #[test]
    fn test_simple_equality() {
        assert!(check("name='Markers'", &markers()));
        assert!(!check("name='Markers'", &eeg()));
        assert!(check("type=\"EEG\"", &eeg()));
        assert!(check("source_id='amp-42'", &eeg()));
        assert!(check("name!='Markers'", &eeg()));
    }

    #[test]
    fn test_empty_matches_everything() {
        let any = Predicate::parse("   ").unwrap();
        assert!(any.is_any());
        assert!(any.matches(&eeg()));
        assert!(Predicate::any().matches(&markers()));
    }

    #[test]
    fn test_boolean_expressions() {
        let expr = "type='EEG' and channel_count >= 16";
        assert!(check(expr, &eeg()));
        assert!(!check(expr, &markers()));

        let expr = "name='Markers' OR (type='EEG' and nominal_srate > 1000)";
        assert!(check(expr, &markers()));
        assert!(!check(expr, &eeg()));

        assert!(check("not name='Markers'", &eeg()));
        assert!(check("nominal_srate=0", &markers()));
        assert!(check("channel_count='32'", &eeg()));
    }

    #[test]
    fn test_precedence() {
        // `and` binds tighter than `or`
        let expr = "name='Markers' or name='BioSemi' and type='Markers'";
        assert!(check(expr, &markers()));
        assert!(!check(expr, &eeg()));
    }

    #[test]
    fn test_channel_format() {
        assert!(check("channel_format='float32'", &eeg()));
        assert!(check("channel_format='string'", &markers()));
        assert!(!check("channel_format='string'", &eeg()));

        let err = Predicate::parse("channel_format='complex'").unwrap_err();
        assert!(matches!(err, LslError::Predicate { position: 15, .. }));
    }

    #[test]
    fn test_errors_carry_position() {
        let cases = [
            ("name=", 5),
            ("name='x", 5),
            ("colour='red'", 0),
            ("name < 'x'", 5),
            ("name='x' and", 12),
            ("(name='x'", 9),
            ("name='x' garbage", 9),
            ("name='x' & type='y'", 9),
            ("channel_count=many", 14),
        ];

        for (source, expected) in cases {
            match Predicate::parse(source) {
                Err(LslError::Predicate { position, .. }) => {
                    assert_eq!(position, expected, "position for {:?}", source)
                }
                other => panic!("expected predicate error for {:?}, got {:?}", source, other),
            }
        }
    }

    #[test]
    fn test_builders() {
        let p = Predicate::by_property("name", "Markers").unwrap();
        assert_eq!(p.as_str(), "name='Markers'");
        assert!(p.matches(&markers()));

        let p = Predicate::by_property("name", "it's").unwrap();
        assert_eq!(p.to_string(), "name=\"it's\"");

        let p = Predicate::name_and_type("BioSemi", "EEG").unwrap();
        assert_eq!(p.as_str(), "name='BioSemi' and type='EEG'");
        assert!(p.matches(&eeg()));

        let p = Predicate::name_and_type("Markers", "").unwrap();
        assert!(p.matches(&markers()));
    }
}
