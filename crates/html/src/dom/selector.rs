//! A small selector matcher covering the compound selectors used by the
//! asset pipeline: `tag`, `.class`, `#id`, `[attr]`, `[attr=v]`,
//! `[attr*=v]`, `[attr^=v]`, `:not(...)` and comma-separated lists.
//!
//! Combinators are intentionally rejected; every selector matches a single
//! element in isolation.

use anyhow::{Error, anyhow, bail};
use indextree::NodeId;

use super::Document;

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrOp {
    Exists,
    Equals(String),
    Contains(String),
    Prefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Condition {
    Id(String),
    Class(String),
    Attr { name: String, op: AttrOp },
    Not(Box<Compound>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    conditions: Vec<Condition>,
}

/// A parsed selector list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    alternatives: Vec<Compound>,
}

impl Selector {
    /// Parses a comma-separated list of compound selectors.
    ///
    /// # Errors
    /// Returns an error on empty input, combinators, or malformed syntax.
    pub fn parse(source: &str) -> Result<Self, Error> {
        let mut alternatives = Vec::new();
        for part in source.split(',') {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                bail!("Empty selector in list {source:?}");
            }
            let mut cursor = Cursor::new(trimmed);
            let compound = cursor.compound()?;
            if !cursor.at_end() {
                bail!("Unsupported selector syntax in {trimmed:?}");
            }
            alternatives.push(compound);
        }
        Ok(Self { alternatives })
    }

    /// Whether `node` is an element matching any alternative.
    #[must_use]
    pub fn matches(&self, doc: &Document, node: NodeId) -> bool {
        doc.is_element(node)
            && self
                .alternatives
                .iter()
                .any(|compound| compound.matches(doc, node))
    }
}

impl Compound {
    fn matches(&self, doc: &Document, node: NodeId) -> bool {
        if let Some(tag) = &self.tag {
            if doc.tag(node) != Some(tag.as_str()) {
                return false;
            }
        }
        self.conditions.iter().all(|condition| match condition {
            Condition::Id(id) => doc.attr(node, "id") == Some(id.as_str()),
            Condition::Class(class) => doc.has_class(node, class),
            Condition::Attr { name, op } => {
                let Some(value) = doc.attr(node, name) else {
                    return false;
                };
                match op {
                    AttrOp::Exists => true,
                    AttrOp::Equals(expected) => value == expected,
                    AttrOp::Contains(needle) => !needle.is_empty() && value.contains(needle.as_str()),
                    AttrOp::Prefix(prefix) => !prefix.is_empty() && value.starts_with(prefix.as_str()),
                }
            }
            Condition::Not(inner) => !inner.matches(doc, node),
        })
    }
}

struct Cursor<'src> {
    chars: Vec<char>,
    pos: usize,
    source: &'src str,
}

impl<'src> Cursor<'src> {
    fn new(source: &'src str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            source,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        Some(ch)
    }

    fn expect(&mut self, wanted: char) -> Result<(), Error> {
        match self.bump() {
            Some(ch) if ch == wanted => Ok(()),
            other => Err(anyhow!(
                "Expected {wanted:?} but found {other:?} in selector {:?}",
                self.source
            )),
        }
    }

    fn skip_spaces(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn ident(&mut self) -> Result<String, Error> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|ch| ch.is_alphanumeric() || ch == '-' || ch == '_')
        {
            self.pos += 1;
        }
        if start == self.pos {
            bail!("Expected identifier at {start} in selector {:?}", self.source);
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn compound(&mut self) -> Result<Compound, Error> {
        let mut compound = Compound::default();
        match self.peek() {
            Some('*') => {
                self.pos += 1;
            }
            Some(ch) if ch.is_alphabetic() => {
                compound.tag = Some(self.ident()?.to_ascii_lowercase());
            }
            _ => {}
        }
        while let Some(ch) = self.peek() {
            let condition = match ch {
                '.' => {
                    self.pos += 1;
                    Condition::Class(self.ident()?)
                }
                '#' => {
                    self.pos += 1;
                    Condition::Id(self.ident()?)
                }
                '[' => self.attribute()?,
                ':' => self.negation()?,
                _ => break,
            };
            compound.conditions.push(condition);
        }
        if compound.tag.is_none() && compound.conditions.is_empty() && self.pos == 0 {
            bail!("Unsupported selector {:?}", self.source);
        }
        Ok(compound)
    }

    fn attribute(&mut self) -> Result<Condition, Error> {
        self.expect('[')?;
        self.skip_spaces();
        let name = self.ident()?.to_ascii_lowercase();
        self.skip_spaces();
        let op = match self.bump() {
            Some(']') => return Ok(Condition::Attr { name, op: AttrOp::Exists }),
            Some('=') => AttrOp::Equals(self.value()?),
            Some('*') => {
                self.expect('=')?;
                AttrOp::Contains(self.value()?)
            }
            Some('^') => {
                self.expect('=')?;
                AttrOp::Prefix(self.value()?)
            }
            other => bail!("Unsupported attribute operator {other:?} in {:?}", self.source),
        };
        self.skip_spaces();
        self.expect(']')?;
        Ok(Condition::Attr { name, op })
    }

    fn value(&mut self) -> Result<String, Error> {
        self.skip_spaces();
        match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().is_some_and(|ch| ch != quote) {
                    self.pos += 1;
                }
                let value: String = self.chars[start..self.pos].iter().collect();
                self.expect(quote)?;
                Ok(value)
            }
            _ => {
                let start = self.pos;
                while self.peek().is_some_and(|ch| ch != ']' && !ch.is_whitespace()) {
                    self.pos += 1;
                }
                Ok(self.chars[start..self.pos].iter().collect())
            }
        }
    }

    fn negation(&mut self) -> Result<Condition, Error> {
        self.expect(':')?;
        let name = self.ident()?;
        if !name.eq_ignore_ascii_case("not") {
            bail!("Unsupported pseudo-class :{name} in {:?}", self.source);
        }
        self.expect('(')?;
        self.skip_spaces();
        let inner = self.compound()?;
        self.skip_spaces();
        self.expect(')')?;
        Ok(Condition::Not(Box::new(inner)))
    }
}
