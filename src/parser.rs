// src/parser.rs
use crate::core::literal;
use crate::errors::ParseError;
use crate::types::Value;
use log::trace;
use once_cell::sync::Lazy;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use regex::Regex;

#[derive(Parser)]
#[grammar = "parser.pest"]
struct PlaceholderParser;

/// Quoted strings are matched first so a `$` inside them stays literal.
static NESTED_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""[^"]*"|'[^']*'|\$([^$]*)\$"#).expect("valid nested placeholder pattern"));

// --- Tokens ---
// One run of document text split into literal text and directives.

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Literal(String),
    Placeholder {
        /// Full `{{ ... }}` text as written.
        raw: String,
        /// Text between the braces, untrimmed.
        body: String,
        offset: usize,
    },
    LoopStart {
        raw: String,
        variable: String,
        collection: String,
    },
    LoopEnd {
        raw: String,
    },
    Image {
        raw: String,
        source: String,
    },
}

impl Token {
    pub fn raw(&self) -> &str {
        match self {
            Token::Literal(text) => text,
            Token::Placeholder { raw, .. }
            | Token::LoopStart { raw, .. }
            | Token::LoopEnd { raw }
            | Token::Image { raw, .. } => raw,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Token::Placeholder { .. })
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Token::LoopStart { .. } | Token::LoopEnd { .. } | Token::Image { .. })
    }
}

// --- Expression AST ---

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Path),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn symbol(&self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Attribute name as written; `__` separates nested lookups.
    pub name: String,
    pub call: Option<Vec<Value>>,
    pub filters: Vec<Condition>,
}

impl Segment {
    pub fn parts(&self) -> impl Iterator<Item = &str> {
        self.name.split("__")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Attribute chain on each element, `.` or `__` separated.
    pub field: String,
    pub expected: Value,
}

/// A parsed `{{ ... }}` body.
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    pub source: String,
    pub expr: Expr,
    pub format: Option<String>,
}

// --- Public Entry Points ---

/// Splits a run of document text into literal text and directive tokens.
///
/// An opening `{{`, `%loop` or `%endloop` with no matching close in the same
/// run is reported with its byte offset; the tokenizer never guesses a close.
pub fn tokenize(raw: &str) -> Result<Vec<Token>, ParseError> {
    trace!("Tokenizing text: {:?}", raw);
    let mut pairs = PlaceholderParser::parse(Rule::template, raw).map_err(|e| ParseError::Malformed {
        text: raw.to_string(),
        message: e.to_string(),
    })?;

    let mut tokens = Vec::new();
    let Some(template) = pairs.next() else {
        return Ok(tokens);
    };

    for pair in template.into_inner() {
        match pair.as_rule() {
            Rule::text => tokens.push(Token::Literal(pair.as_str().to_string())),
            Rule::placeholder => {
                let raw_tag = pair.as_str().to_string();
                let offset = pair.as_span().start();
                let body = pair
                    .into_inner()
                    .find(|p| p.as_rule() == Rule::placeholder_body)
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_default();
                tokens.push(Token::Placeholder { raw: raw_tag, body, offset });
            }
            Rule::loop_start => {
                let raw_tag = pair.as_str().to_string();
                let mut variable = String::new();
                let mut collection = String::new();
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::loop_variable => variable = inner.as_str().to_string(),
                        Rule::loop_collection => collection = inner.as_str().trim().to_string(),
                        _ => (),
                    }
                }
                tokens.push(Token::LoopStart { raw: raw_tag, variable, collection });
            }
            Rule::loop_end => tokens.push(Token::LoopEnd { raw: pair.as_str().to_string() }),
            Rule::image => {
                let raw_tag = pair.as_str().to_string();
                let source = pair
                    .into_inner()
                    .find(|p| p.as_rule() == Rule::image_source)
                    .map(|p| p.as_str().trim().to_string())
                    .unwrap_or_default();
                tokens.push(Token::Image { raw: raw_tag, source });
            }
            Rule::unterminated => {
                let offset = pair.as_span().start();
                let delimiter = match pair.into_inner().next().map(|p| p.as_str()) {
                    Some(open) if open.starts_with("%endloop") => "%endloop%",
                    Some(open) if open.starts_with("%loop") => "%loop%",
                    _ => "{{",
                };
                return Err(ParseError::Unterminated { delimiter, offset, text: raw.to_string() });
            }
            Rule::EOI => (),
            rule => {
                return Err(ParseError::Malformed {
                    text: raw.to_string(),
                    message: format!("unexpected rule {:?}", rule),
                })
            }
        }
    }
    Ok(tokens)
}

/// Number of `{{ ... }}` placeholders in a token stream.
pub fn placeholder_count(tokens: &[Token]) -> usize {
    tokens.iter().filter(|t| t.is_placeholder()).count()
}

/// Replaces every `$...$` span in `body` with the text produced by `resolve`.
///
/// This is a purely textual pre-pass: the substituted text becomes part of the
/// enclosing expression before that expression is parsed.
pub fn substitute_nested<E, F>(body: &str, mut resolve: F) -> Result<String, E>
where
    E: From<ParseError>,
    F: FnMut(&str) -> Result<String, E>,
{
    if !body.contains('$') {
        return Ok(body.to_string());
    }

    let unterminated = |gap: &str, start: usize| match gap.find('$') {
        Some(at) => Err(ParseError::Unterminated { delimiter: "$", offset: start + at, text: body.to_string() }),
        None => Ok(()),
    };

    let mut result = String::with_capacity(body.len());
    let mut last = 0;
    for captures in NESTED_PATTERN.captures_iter(body) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        unterminated(&body[last..whole.start()], last)?;
        result.push_str(&body[last..whole.start()]);
        match captures.get(1) {
            Some(inner) => {
                trace!("Resolving nested placeholder {:?}", inner.as_str());
                result.push_str(&resolve(inner.as_str().trim())?);
            }
            None => result.push_str(whole.as_str()),
        }
        last = whole.end();
    }
    unterminated(&body[last..], last)?;
    result.push_str(&body[last..]);
    Ok(result)
}

/// Parses the body of a placeholder (after `$...$` substitution) into an expression.
pub fn parse_expression(body: &str) -> Result<Placeholder, ParseError> {
    let source = body.trim();
    if source.is_empty() {
        return Err(ParseError::EmptyPlaceholder { text: body.to_string() });
    }
    if has_stray_brace(source) {
        return Err(ParseError::StrayBrace { text: source.to_string() });
    }

    let mut pairs = PlaceholderParser::parse(Rule::expression, source).map_err(|e| ParseError::Malformed {
        text: source.to_string(),
        message: e.to_string(),
    })?;
    let expression = pairs.next().ok_or_else(|| malformed(source, "empty parse"))?;

    let mut expr = None;
    let mut format = None;
    for pair in expression.into_inner() {
        match pair.as_rule() {
            Rule::arithmetic => expr = Some(build_arithmetic(pair, source)?),
            Rule::pipe => {
                let spec = pair
                    .into_inner()
                    .find(|p| p.as_rule() == Rule::format_spec)
                    .map(|p| unquote(p.as_str().trim()).to_string())
                    .unwrap_or_default();
                format = Some(spec);
            }
            Rule::EOI => (),
            rule => return Err(malformed(source, &format!("unexpected rule {:?}", rule))),
        }
    }

    let expr = expr.ok_or_else(|| malformed(source, "missing expression"))?;
    trace!("Parsed placeholder {:?} into {:?} (format: {:?})", source, expr, format);
    Ok(Placeholder { source: source.to_string(), expr, format })
}

// --- AST Building ---

fn build_arithmetic(pair: Pair<Rule>, source: &str) -> Result<Expr, ParseError> {
    fold_binary(pair, source, build_term)
}

fn build_term(pair: Pair<Rule>, source: &str) -> Result<Expr, ParseError> {
    fold_binary(pair, source, build_operand)
}

/// Left-associative fold of `operand (op operand)*`.
fn fold_binary(
    pair: Pair<Rule>,
    source: &str,
    build: fn(Pair<Rule>, &str) -> Result<Expr, ParseError>,
) -> Result<Expr, ParseError> {
    let mut inner = pair.into_inner();
    let first = inner.next().ok_or_else(|| malformed(source, "missing operand"))?;
    let mut lhs = build(first, source)?;

    while let Some(op_pair) = inner.next() {
        let op = match op_pair.as_str() {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            other => return Err(malformed(source, &format!("unknown operator {:?}", other))),
        };
        let rhs_pair = inner.next().ok_or_else(|| malformed(source, "operator without right operand"))?;
        let rhs = build(rhs_pair, source)?;
        lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
    }
    Ok(lhs)
}

fn build_operand(pair: Pair<Rule>, source: &str) -> Result<Expr, ParseError> {
    match pair.as_rule() {
        Rule::term => build_term(pair, source),
        Rule::arithmetic => build_arithmetic(pair, source),
        Rule::string => Ok(Expr::Literal(Value::String(string_contents(pair)))),
        Rule::number | Rule::boolean | Rule::null => Ok(Expr::Literal(literal::coerce(pair.as_str()))),
        Rule::path => build_path(pair, source).map(Expr::Path),
        rule => Err(malformed(source, &format!("unexpected operand {:?}", rule))),
    }
}

fn build_path(pair: Pair<Rule>, source: &str) -> Result<Path, ParseError> {
    let segments = pair
        .into_inner()
        .filter(|p| p.as_rule() == Rule::segment)
        .map(|p| build_segment(p, source))
        .collect::<Result<Vec<_>, _>>()?;
    if segments.is_empty() {
        return Err(malformed(source, "empty path"));
    }
    Ok(Path { segments })
}

fn build_segment(pair: Pair<Rule>, source: &str) -> Result<Segment, ParseError> {
    let mut name = None;
    let mut call = None;
    let mut filters = Vec::new();

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::identifier => name = Some(inner.as_str().to_string()),
            Rule::call => {
                let args = inner
                    .into_inner()
                    .map(|arg| match arg.as_rule() {
                        Rule::string => Value::String(string_contents(arg)),
                        _ => literal::coerce(arg.as_str()),
                    })
                    .collect();
                call = Some(args);
            }
            Rule::filter => {
                for condition in inner.into_inner().filter(|p| p.as_rule() == Rule::condition) {
                    filters.push(build_condition(condition, source)?);
                }
            }
            rule => return Err(malformed(source, &format!("unexpected rule {:?} in segment", rule))),
        }
    }

    let name = name.ok_or_else(|| malformed(source, "segment without a name"))?;
    Ok(Segment { name, call, filters })
}

fn build_condition(pair: Pair<Rule>, source: &str) -> Result<Condition, ParseError> {
    let raw_condition = pair.as_str().to_string();
    let mut inner = pair.into_inner();
    let field = inner
        .next()
        .filter(|p| p.as_rule() == Rule::condition_field)
        .ok_or_else(|| malformed(source, &format!("filter {:?} has no field", raw_condition)))?
        .as_str()
        .to_string();
    let value_pair = inner
        .next()
        .ok_or_else(|| malformed(source, &format!("filter {:?} has no value", raw_condition)))?;
    let expected = match value_pair.as_rule() {
        Rule::string => Value::String(string_contents(value_pair)),
        _ => literal::coerce(value_pair.as_str()),
    };
    Ok(Condition { field, expected })
}

fn string_contents(pair: Pair<Rule>) -> String {
    pair.into_inner().next().map(|p| p.as_str().to_string()).unwrap_or_default()
}

fn unquote(text: &str) -> &str {
    let quoted = text.len() >= 2
        && ((text.starts_with('"') && text.ends_with('"')) || (text.starts_with('\'') && text.ends_with('\'')));
    if quoted { &text[1..text.len() - 1] } else { text }
}

/// True when `{` or `}` appears outside a quoted string.
fn has_stray_brace(source: &str) -> bool {
    let mut quote = None;
    for c in source.chars() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '{' | '}') => return true,
            _ => (),
        }
    }
    false
}

fn malformed(source: &str, message: &str) -> ParseError {
    ParseError::Malformed { text: source.to_string(), message: message.to_string() }
}
