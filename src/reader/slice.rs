//! Slice-based pull parser
//!
//! Reads markup from a UTF-8 string slice:
//! - memchr-driven scanning to the next delimiter
//! - Predefined and numeric character entities decoded on the fly
//! - Events borrow from the input wherever no decoding is needed

use std::borrow::Cow;

use memchr::memchr;

use crate::error::{Result, StoreError};

/// A raw attribute as it appears in a start tag
#[derive(Debug, Clone)]
pub struct RawAttr<'a> {
    pub name: &'a str,
    pub value: Cow<'a, str>,
}

/// A pull parsing event
#[derive(Debug, Clone)]
pub enum XmlEvent<'a> {
    /// Start of an element (`empty` for `<e/>` forms)
    StartElement {
        name: &'a str,
        attributes: Vec<RawAttr<'a>>,
        empty: bool,
    },
    /// End of an element
    EndElement { name: &'a str },
    /// Character data (entity-decoded)
    Text(Cow<'a, str>),
    /// Comment body (markers excluded)
    Comment(&'a str),
    /// Processing instruction
    ProcInst { target: &'a str, data: Option<&'a str> },
    /// XML declaration (contents ignored)
    XmlDecl,
}

fn err(offset: usize, message: impl Into<String>) -> StoreError {
    StoreError::Parse {
        offset,
        message: message.into(),
    }
}

/// Pull reader over a string slice
pub struct SliceReader<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> SliceReader<'a> {
    /// Create a reader at the start of the input
    pub fn new(input: &'a str) -> Self {
        SliceReader { input, pos: 0 }
    }

    /// Byte offset of the next unread character
    pub fn offset(&self) -> usize {
        self.pos
    }

    fn find(&self, needle: &str, from: usize) -> Option<usize> {
        self.input[from..].find(needle).map(|i| from + i)
    }

    /// Produce the next event, or None at end of input
    pub fn next_event(&mut self) -> Result<Option<XmlEvent<'a>>> {
        loop {
            let bytes = self.input.as_bytes();
            if self.pos >= bytes.len() {
                return Ok(None);
            }
            if bytes[self.pos] != b'<' {
                let end = memchr(b'<', &bytes[self.pos..])
                    .map(|i| self.pos + i)
                    .unwrap_or(bytes.len());
                let raw = &self.input[self.pos..end];
                let at = self.pos;
                self.pos = end;
                return Ok(Some(XmlEvent::Text(decode_entities(raw, at)?)));
            }

            // Markup
            let at = self.pos;
            match bytes.get(self.pos + 1) {
                Some(b'/') => {
                    let close = self
                        .find(">", self.pos + 2)
                        .ok_or_else(|| err(at, "unterminated end tag"))?;
                    let name = self.input[self.pos + 2..close].trim();
                    if name.is_empty() {
                        return Err(err(at, "end tag without a name"));
                    }
                    self.pos = close + 1;
                    return Ok(Some(XmlEvent::EndElement { name }));
                }
                Some(b'!') => {
                    if self.input[self.pos..].starts_with("<!--") {
                        let close = self
                            .find("-->", self.pos + 4)
                            .ok_or_else(|| err(at, "unterminated comment"))?;
                        let body = &self.input[self.pos + 4..close];
                        self.pos = close + 3;
                        return Ok(Some(XmlEvent::Comment(body)));
                    }
                    if self.input[self.pos..].starts_with("<![CDATA[") {
                        let close = self
                            .find("]]>", self.pos + 9)
                            .ok_or_else(|| err(at, "unterminated CDATA section"))?;
                        let body = &self.input[self.pos + 9..close];
                        self.pos = close + 3;
                        return Ok(Some(XmlEvent::Text(Cow::Borrowed(body))));
                    }
                    if self.input[self.pos..].starts_with("<!DOCTYPE") {
                        // Skip the declaration, honoring an internal subset
                        let mut depth = 0usize;
                        let mut i = self.pos + 9;
                        loop {
                            match bytes.get(i) {
                                None => return Err(err(at, "unterminated DOCTYPE")),
                                Some(b'[') => depth += 1,
                                Some(b']') => depth = depth.saturating_sub(1),
                                Some(b'>') if depth == 0 => break,
                                _ => {}
                            }
                            i += 1;
                        }
                        self.pos = i + 1;
                        continue;
                    }
                    return Err(err(at, "unsupported markup declaration"));
                }
                Some(b'?') => {
                    let close = self
                        .find("?>", self.pos + 2)
                        .ok_or_else(|| err(at, "unterminated processing instruction"))?;
                    let inside = &self.input[self.pos + 2..close];
                    self.pos = close + 2;
                    let (target, data) = match inside.find(char::is_whitespace) {
                        Some(split) => (&inside[..split], Some(inside[split..].trim_start())),
                        None => (inside, None),
                    };
                    if target.is_empty() {
                        return Err(err(at, "processing instruction without a target"));
                    }
                    if target.eq_ignore_ascii_case("xml") {
                        return Ok(Some(XmlEvent::XmlDecl));
                    }
                    return Ok(Some(XmlEvent::ProcInst { target, data }));
                }
                Some(_) => return self.start_tag(at).map(Some),
                None => return Err(err(at, "dangling \"<\" at end of input")),
            }
        }
    }

    fn start_tag(&mut self, at: usize) -> Result<XmlEvent<'a>> {
        let bytes = self.input.as_bytes();
        let mut i = self.pos + 1;
        let name_start = i;
        while i < bytes.len() && !matches!(bytes[i], b'/' | b'>') && !bytes[i].is_ascii_whitespace()
        {
            i += 1;
        }
        let name = &self.input[name_start..i];
        if name.is_empty() {
            return Err(err(at, "start tag without a name"));
        }

        let mut attributes = Vec::new();
        loop {
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            match bytes.get(i) {
                None => return Err(err(at, "unterminated start tag")),
                Some(b'>') => {
                    self.pos = i + 1;
                    return Ok(XmlEvent::StartElement {
                        name,
                        attributes,
                        empty: false,
                    });
                }
                Some(b'/') => {
                    if bytes.get(i + 1) != Some(&b'>') {
                        return Err(err(i, "expected \"/>\""));
                    }
                    self.pos = i + 2;
                    return Ok(XmlEvent::StartElement {
                        name,
                        attributes,
                        empty: true,
                    });
                }
                Some(_) => {
                    let attr_start = i;
                    while i < bytes.len()
                        && bytes[i] != b'='
                        && !bytes[i].is_ascii_whitespace()
                        && !matches!(bytes[i], b'/' | b'>')
                    {
                        i += 1;
                    }
                    let attr_name = &self.input[attr_start..i];
                    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                        i += 1;
                    }
                    if bytes.get(i) != Some(&b'=') {
                        return Err(err(attr_start, "attribute without \"=\""));
                    }
                    i += 1;
                    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                        i += 1;
                    }
                    let quote = match bytes.get(i) {
                        Some(&q @ (b'"' | b'\'')) => q,
                        _ => return Err(err(i, "attribute value must be quoted")),
                    };
                    i += 1;
                    let value_start = i;
                    let close = memchr(quote, &bytes[i..])
                        .map(|n| i + n)
                        .ok_or_else(|| err(value_start, "unterminated attribute value"))?;
                    let value = decode_entities(&self.input[value_start..close], value_start)?;
                    attributes.push(RawAttr {
                        name: attr_name,
                        value,
                    });
                    i = close + 1;
                }
            }
        }
    }
}

/// Decode predefined and numeric character entities
fn decode_entities(raw: &str, at: usize) -> Result<Cow<'_, str>> {
    if !raw.contains('&') {
        return Ok(Cow::Borrowed(raw));
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let semi = tail
            .find(';')
            .ok_or_else(|| err(at, "unterminated entity reference"))?;
        let entity = &tail[1..semi];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "apos" => out.push('\''),
            "quot" => out.push('"'),
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x").or(entity.strip_prefix("#X"))
                {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                let ch = code
                    .and_then(char::from_u32)
                    .ok_or_else(|| err(at, format!("unknown entity \"&{};\"", entity)))?;
                out.push(ch);
            }
        }
        rest = &tail[semi + 1..];
    }
    out.push_str(rest);
    Ok(Cow::Owned(out))
}
