//! Bencode decoder used for `.torrent` files and tracker responses.
//!
//! The decoder only reads. While walking the top-level dictionary it records
//! where the encoding of the `info` value starts and ends, so that the
//! info-hash can be computed over the exact bytes that were on the wire.
use std::{fmt, ops::Range};

use thiserror::Error;

/// Nested lists and dictionaries deeper than this are rejected.
const MAX_DEPTH: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("The input is empty")]
    Empty,

    #[error("The top-level value is not a dictionary")]
    NotADictionary,

    #[error("Unexpected end of input at offset {0}")]
    UnexpectedEof(usize),

    #[error("Unexpected character `{ch}` at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("Malformed length prefix at offset {0}")]
    InvalidLength(usize),

    #[error("Malformed integer at offset {0}")]
    InvalidInteger(usize),

    #[error("Dictionary key at offset {0} is not a byte string")]
    InvalidKey(usize),

    #[error("Structure nested too deep at offset {0}")]
    TooDeep(usize),
}

/// A decoded bencode value.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Dictionary),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{i}"),
            Value::Bytes(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
            Value::List(l) => f.debug_list().entries(l).finish(),
            Value::Dict(d) => f
                .debug_map()
                .entries(d.iter().map(|(k, v)| (String::from_utf8_lossy(k), v)))
                .finish(),
        }
    }
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Lossy UTF-8 view of a byte string.
    pub fn as_str(&self) -> Option<String> {
        self.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dictionary> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Dictionary that keeps the key order of the input.
///
/// Keys are unique, a repeated key replaces the earlier value in place.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct Dictionary {
    entries: Vec<(Vec<u8>, Value)>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: Vec<u8>, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of a successful decode.
#[derive(Debug, Clone)]
pub struct Decoded<'a> {
    pub root: Dictionary,
    content: &'a [u8],
    info: Option<Range<usize>>,
}

impl<'a> Decoded<'a> {
    /// The raw encoding of the top-level `info` value, if present.
    pub fn info_section(&self) -> Option<&'a [u8]> {
        self.info.clone().map(|r| &self.content[r])
    }

    /// Byte offset and length of the `info` value inside the input.
    pub fn info_range(&self) -> Option<Range<usize>> {
        self.info.clone()
    }
}

/// Decode `content`, which must hold a dictionary.
///
/// Bytes after the top-level dictionary are ignored.
pub fn decode(content: &[u8]) -> Result<Decoded<'_>, DecodeError> {
    if content.is_empty() {
        return Err(DecodeError::Empty);
    }
    if content[0] != b'd' {
        // still surface a malformed input as a parse error
        let mut parser = Parser::new(content);
        parser.value(0)?;
        return Err(DecodeError::NotADictionary);
    }

    let mut parser = Parser::new(content);
    let root = parser.dictionary(0)?;

    Ok(Decoded { root, content, info: parser.info })
}

/// Decode any bencode value, used for tracker responses and tests.
pub fn decode_value(content: &[u8]) -> Result<Value, DecodeError> {
    if content.is_empty() {
        return Err(DecodeError::Empty);
    }
    Parser::new(content).value(0)
}

struct Parser<'a> {
    content: &'a [u8],
    index: usize,
    info: Option<Range<usize>>,
}

impl<'a> Parser<'a> {
    fn new(content: &'a [u8]) -> Self {
        Self { content, index: 0, info: None }
    }

    fn peek(&self) -> Result<u8, DecodeError> {
        self.content
            .get(self.index)
            .copied()
            .ok_or(DecodeError::UnexpectedEof(self.index))
    }

    fn value(&mut self, depth: usize) -> Result<Value, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep(self.index));
        }
        match self.peek()? {
            b'i' => self.integer().map(Value::Integer),
            b'0'..=b'9' => self.byte_string().map(Value::Bytes),
            b'l' => self.list(depth).map(Value::List),
            b'd' => self.dictionary(depth).map(Value::Dict),
            c => Err(DecodeError::UnexpectedChar {
                ch: c as char,
                offset: self.index,
            }),
        }
    }

    fn integer(&mut self) -> Result<i64, DecodeError> {
        let start = self.index;
        self.index += 1;

        let digits_start = self.index;
        if self.peek()? == b'-' {
            self.index += 1;
        }
        while self.peek()?.is_ascii_digit() {
            self.index += 1;
        }
        if self.peek()? != b'e' {
            return Err(DecodeError::UnexpectedChar {
                ch: self.content[self.index] as char,
                offset: self.index,
            });
        }

        let number = std::str::from_utf8(&self.content[digits_start..self.index])
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(DecodeError::InvalidInteger(start))?;

        self.index += 1;
        Ok(number)
    }

    fn byte_string(&mut self) -> Result<Vec<u8>, DecodeError> {
        let start = self.index;
        while self.peek()?.is_ascii_digit() {
            self.index += 1;
        }
        if self.peek()? != b':' {
            return Err(DecodeError::InvalidLength(start));
        }

        let len = std::str::from_utf8(&self.content[start..self.index])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(DecodeError::InvalidLength(start))?;
        self.index += 1;

        let end = self
            .index
            .checked_add(len)
            .filter(|end| *end <= self.content.len())
            .ok_or(DecodeError::UnexpectedEof(self.content.len()))?;

        let bytes = self.content[self.index..end].to_vec();
        self.index = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Vec<Value>, DecodeError> {
        self.index += 1;
        let mut list = Vec::new();
        while self.peek()? != b'e' {
            list.push(self.value(depth + 1)?);
        }
        self.index += 1;
        Ok(list)
    }

    fn dictionary(&mut self, depth: usize) -> Result<Dictionary, DecodeError> {
        self.index += 1;
        let mut dict = Dictionary::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(DecodeError::InvalidKey(self.index));
            }
            let key = self.byte_string()?;

            let value_start = self.index;
            let value = self.value(depth + 1)?;
            if depth == 0 && key == b"info" {
                self.info = Some(value_start..self.index);
            }

            dict.insert(key, value);
        }
        self.index += 1;
        Ok(dict)
    }
}
