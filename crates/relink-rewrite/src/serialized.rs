//! Codec for the length-prefixed composite serialization format
//! (`a:2:{i:0;s:5:"hello";i:1;b:1;}`).
//!
//! String lengths are byte counts, so any rewrite of a nested string must go
//! through [`SerializedValue::encode`] to recompute them.

use thiserror::Error;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEnd(usize),
    #[error("unexpected byte {found:?} at {at}, expected {expected}")]
    Unexpected {
        at: usize,
        found: char,
        expected: &'static str,
    },
    #[error("invalid number at byte {0}")]
    InvalidNumber(usize),
    #[error("string at byte {0} is not valid utf-8")]
    InvalidUtf8(usize),
    #[error("unsupported type tag {tag:?} at byte {at}")]
    UnsupportedTag { at: usize, tag: char },
    #[error("nesting deeper than {MAX_DEPTH}")]
    TooDeep,
    #[error("{0} trailing bytes after value")]
    TrailingInput(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializedKey {
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializedValue {
    Null,
    Bool(bool),
    Int(i64),
    /// Kept verbatim so re-encoding never changes float formatting.
    Float(String),
    Str(String),
    Array(Vec<(SerializedKey, SerializedValue)>),
    Object {
        class: String,
        members: Vec<(SerializedKey, SerializedValue)>,
    },
}

impl SerializedValue {
    /// Parses a complete serialized value; trailing bytes are an error.
    pub fn parse(input: &str) -> Result<Self, CodecError> {
        let mut parser = Parser {
            bytes: input.as_bytes(),
            pos: 0,
        };
        let value = parser.value(0)?;
        let trailing = parser.bytes.len() - parser.pos;
        if trailing > 0 {
            return Err(CodecError::TrailingInput(trailing));
        }
        Ok(value)
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        encode_into(self, &mut out);
        out
    }

    pub fn is_container(&self) -> bool {
        matches!(
            self,
            SerializedValue::Array(_) | SerializedValue::Object { .. }
        )
    }
}

/// Cheap shape test: does the value start like a serialized string, array or object?
pub fn looks_serialized(value: &str) -> bool {
    let bytes = value.trim().as_bytes();
    if bytes.len() < 4 || bytes[1] != b':' {
        return false;
    }
    match bytes[0] {
        b'a' | b'O' | b's' | b'C' => bytes[2].is_ascii_digit(),
        b'i' | b'd' | b'b' => bytes.ends_with(b";"),
        _ => false,
    }
}

fn encode_into(value: &SerializedValue, out: &mut String) {
    match value {
        SerializedValue::Null => out.push_str("N;"),
        SerializedValue::Bool(flag) => {
            out.push_str(if *flag { "b:1;" } else { "b:0;" });
        }
        SerializedValue::Int(number) => {
            out.push_str(&format!("i:{number};"));
        }
        SerializedValue::Float(raw) => {
            out.push_str(&format!("d:{raw};"));
        }
        SerializedValue::Str(text) => encode_str(text, out),
        SerializedValue::Array(entries) => {
            out.push_str(&format!("a:{}:{{", entries.len()));
            encode_entries(entries, out);
            out.push('}');
        }
        SerializedValue::Object { class, members } => {
            out.push_str(&format!(
                "O:{}:\"{}\":{}:{{",
                class.len(),
                class,
                members.len()
            ));
            encode_entries(members, out);
            out.push('}');
        }
    }
}

fn encode_str(text: &str, out: &mut String) {
    out.push_str(&format!("s:{}:\"", text.len()));
    out.push_str(text);
    out.push_str("\";");
}

fn encode_entries(entries: &[(SerializedKey, SerializedValue)], out: &mut String) {
    for (key, value) in entries {
        match key {
            SerializedKey::Int(index) => out.push_str(&format!("i:{index};")),
            SerializedKey::Str(name) => encode_str(name, out),
        }
        encode_into(value, out);
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn value(&mut self, depth: usize) -> Result<SerializedValue, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::TooDeep);
        }
        let at = self.pos;
        let tag = self.next()?;
        match tag {
            b'N' => {
                self.expect(b';', "';'")?;
                Ok(SerializedValue::Null)
            }
            b'b' => {
                self.expect(b':', "':'")?;
                let flag = match self.next()? {
                    b'0' => false,
                    b'1' => true,
                    _ => return Err(CodecError::InvalidNumber(self.pos - 1)),
                };
                self.expect(b';', "';'")?;
                Ok(SerializedValue::Bool(flag))
            }
            b'i' => {
                self.expect(b':', "':'")?;
                let number = self.integer_until(b';')?;
                Ok(SerializedValue::Int(number))
            }
            b'd' => {
                self.expect(b':', "':'")?;
                let raw = self.raw_until(b';')?;
                Ok(SerializedValue::Float(raw))
            }
            b's' => Ok(SerializedValue::Str(self.string_body()?)),
            b'a' => {
                self.expect(b':', "':'")?;
                let count = self.length_until(b':')?;
                let entries = self.entries(count, depth)?;
                Ok(SerializedValue::Array(entries))
            }
            b'O' => {
                self.expect(b':', "':'")?;
                let class_len = self.length_until(b':')?;
                self.expect(b'"', "'\"'")?;
                let class = self.take_str(class_len)?;
                self.expect(b'"', "'\"'")?;
                self.expect(b':', "':'")?;
                let count = self.length_until(b':')?;
                let members = self.entries(count, depth)?;
                Ok(SerializedValue::Object { class, members })
            }
            other => Err(CodecError::UnsupportedTag {
                at,
                tag: other as char,
            }),
        }
    }

    fn entries(
        &mut self,
        count: usize,
        depth: usize,
    ) -> Result<Vec<(SerializedKey, SerializedValue)>, CodecError> {
        self.expect(b'{', "'{'")?;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let key = self.key()?;
            let value = self.value(depth + 1)?;
            entries.push((key, value));
        }
        self.expect(b'}', "'}'")?;
        Ok(entries)
    }

    fn key(&mut self) -> Result<SerializedKey, CodecError> {
        let at = self.pos;
        match self.next()? {
            b'i' => {
                self.expect(b':', "':'")?;
                Ok(SerializedKey::Int(self.integer_until(b';')?))
            }
            b's' => Ok(SerializedKey::Str(self.string_body()?)),
            other => Err(CodecError::Unexpected {
                at,
                found: other as char,
                expected: "array key",
            }),
        }
    }

    /// `:<len>:"<bytes>";` after the `s` tag.
    fn string_body(&mut self) -> Result<String, CodecError> {
        self.expect(b':', "':'")?;
        let len = self.length_until(b':')?;
        self.expect(b'"', "'\"'")?;
        let text = self.take_str(len)?;
        self.expect(b'"', "'\"'")?;
        self.expect(b';', "';'")?;
        Ok(text)
    }

    fn take_str(&mut self, len: usize) -> Result<String, CodecError> {
        let start = self.pos;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(CodecError::UnexpectedEnd(self.bytes.len()))?;
        let text = std::str::from_utf8(&self.bytes[start..end])
            .map_err(|_| CodecError::InvalidUtf8(start))?;
        self.pos = end;
        Ok(text.to_string())
    }

    fn raw_until(&mut self, terminator: u8) -> Result<String, CodecError> {
        let start = self.pos;
        while self.peek()? != terminator {
            self.pos += 1;
        }
        let raw = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| CodecError::InvalidUtf8(start))?
            .to_string();
        self.pos += 1;
        if raw.is_empty() {
            return Err(CodecError::InvalidNumber(start));
        }
        Ok(raw)
    }

    fn integer_until(&mut self, terminator: u8) -> Result<i64, CodecError> {
        let start = self.pos;
        let raw = self.raw_until(terminator)?;
        raw.parse::<i64>()
            .map_err(|_| CodecError::InvalidNumber(start))
    }

    fn length_until(&mut self, terminator: u8) -> Result<usize, CodecError> {
        let start = self.pos;
        let raw = self.raw_until(terminator)?;
        if !raw.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(CodecError::InvalidNumber(start));
        }
        raw.parse::<usize>()
            .map_err(|_| CodecError::InvalidNumber(start))
    }

    fn peek(&self) -> Result<u8, CodecError> {
        self.bytes
            .get(self.pos)
            .copied()
            .ok_or(CodecError::UnexpectedEnd(self.pos))
    }

    fn next(&mut self) -> Result<u8, CodecError> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn expect(&mut self, wanted: u8, expected: &'static str) -> Result<(), CodecError> {
        let at = self.pos;
        let found = self.next()?;
        if found != wanted {
            return Err(CodecError::Unexpected {
                at,
                found: found as char,
                expected,
            });
        }
        Ok(())
    }
}
