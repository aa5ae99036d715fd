//! RFC 4515 string search filters and their BER form (RFC 4511 §4.5.1.7).

use crate::error::LdapError;
use crate::ldap_protocol::BerWriter;
use crate::result_code::{err2string, FILTER_ERROR};
use anyhow::{bail, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, Vec<u8>),
    Substrings {
        attr: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_: Option<Vec<u8>>,
    },
    GreaterOrEqual(String, Vec<u8>),
    LessOrEqual(String, Vec<u8>),
    Present(String),
    Approx(String, Vec<u8>),
    Extensible {
        matching_rule: Option<String>,
        attr: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

const TAG_AND: u8 = 0xA0;
const TAG_OR: u8 = 0xA1;
const TAG_NOT: u8 = 0xA2;
const TAG_EQUALITY: u8 = 0xA3;
const TAG_SUBSTRINGS: u8 = 0xA4;
const TAG_GREATER_OR_EQUAL: u8 = 0xA5;
const TAG_LESS_OR_EQUAL: u8 = 0xA6;
const TAG_PRESENT: u8 = 0x87;
const TAG_APPROX: u8 = 0xA8;
const TAG_EXTENSIBLE: u8 = 0xA9;

impl Filter {
    pub fn parse(s: &str) -> Result<Filter> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            bail!("Empty search filter");
        }
        // A bare item like "uid=jdoe" is accepted as "(uid=jdoe)".
        let wrapped;
        let text = if trimmed.starts_with('(') {
            trimmed
        } else {
            wrapped = format!("({})", trimmed);
            wrapped.as_str()
        };
        let mut parser = Parser {
            input: text.as_bytes(),
            pos: 0,
        };
        let filter = parser.parse_filter()?;
        if parser.pos != parser.input.len() {
            bail!("Trailing characters in filter at offset {}", parser.pos);
        }
        Ok(filter)
    }

    pub fn encode(&self, writer: &mut BerWriter) {
        match self {
            Filter::And(items) | Filter::Or(items) => {
                let tag = if matches!(self, Filter::And(_)) { TAG_AND } else { TAG_OR };
                let pos = writer.start_constructed(tag);
                for item in items {
                    item.encode(writer);
                }
                writer.end_constructed(pos);
            }
            Filter::Not(inner) => {
                let pos = writer.start_constructed(TAG_NOT);
                inner.encode(writer);
                writer.end_constructed(pos);
            }
            Filter::Equality(attr, value) => encode_ava(writer, TAG_EQUALITY, attr, value),
            Filter::GreaterOrEqual(attr, value) => encode_ava(writer, TAG_GREATER_OR_EQUAL, attr, value),
            Filter::LessOrEqual(attr, value) => encode_ava(writer, TAG_LESS_OR_EQUAL, attr, value),
            Filter::Approx(attr, value) => encode_ava(writer, TAG_APPROX, attr, value),
            Filter::Present(attr) => writer.write_tagged(TAG_PRESENT, attr.as_bytes()),
            Filter::Substrings {
                attr,
                initial,
                any,
                final_,
            } => {
                let pos = writer.start_constructed(TAG_SUBSTRINGS);
                writer.write_string(attr);
                let subs = writer.start_sequence();
                if let Some(v) = initial {
                    writer.write_tagged(0x80, v);
                }
                for v in any {
                    writer.write_tagged(0x81, v);
                }
                if let Some(v) = final_ {
                    writer.write_tagged(0x82, v);
                }
                writer.end_sequence(subs);
                writer.end_constructed(pos);
            }
            Filter::Extensible {
                matching_rule,
                attr,
                value,
                dn_attributes,
            } => {
                let pos = writer.start_constructed(TAG_EXTENSIBLE);
                if let Some(rule) = matching_rule {
                    writer.write_tagged(0x81, rule.as_bytes());
                }
                if let Some(attr) = attr {
                    writer.write_tagged(0x82, attr.as_bytes());
                }
                writer.write_tagged(0x83, value);
                if *dn_attributes {
                    writer.write_tagged(0x84, &[0xFF]);
                }
                writer.end_constructed(pos);
            }
        }
    }
}

impl std::str::FromStr for Filter {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        Filter::parse(s)
    }
}

/// Parse a filter string, reporting failures as `Bad search filter`.
pub fn parse_filter(s: &str) -> crate::error::Result<Filter> {
    Filter::parse(s).map_err(|e| {
        LdapError::protocol_with_text(FILTER_ERROR, format!("{}: {}", err2string(FILTER_ERROR), e))
    })
}

fn encode_ava(writer: &mut BerWriter, tag: u8, attr: &str, value: &[u8]) {
    let pos = writer.start_constructed(tag);
    writer.write_string(attr);
    writer.write_octet_string(value);
    writer.end_constructed(pos);
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        match self.peek() {
            Some(b) if b == byte => {
                self.pos += 1;
                Ok(())
            }
            Some(b) => bail!(
                "Expected '{}' at offset {}, found '{}'",
                byte as char,
                self.pos,
                b as char
            ),
            None => bail!("Expected '{}' at end of filter", byte as char),
        }
    }

    fn parse_filter(&mut self) -> Result<Filter> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => bail!("Unterminated filter"),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn parse_list(&mut self) -> Result<Vec<Filter>> {
        let mut items = Vec::new();
        while self.peek() == Some(b'(') {
            items.push(self.parse_filter()?);
        }
        if items.is_empty() {
            bail!("Empty filter list at offset {}", self.pos);
        }
        Ok(items)
    }

    fn parse_item(&mut self) -> Result<Filter> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'=' || b == b')' || b == b'(' {
                break;
            }
            self.pos += 1;
        }
        if self.peek() != Some(b'=') {
            bail!("Missing '=' in filter item at offset {}", start);
        }
        let mut desc = &self.input[start..self.pos];
        self.pos += 1;

        let value_start = self.pos;
        while let Some(b) = self.peek() {
            if b == b')' || b == b'(' {
                break;
            }
            self.pos += 1;
        }
        let raw_value = &self.input[value_start..self.pos];

        let op = desc.last().copied();
        if matches!(op, Some(b'~') | Some(b'>') | Some(b'<') | Some(b':')) {
            desc = &desc[..desc.len() - 1];
        }
        let attr = std::str::from_utf8(desc)?.trim().to_string();

        match op {
            Some(b'~') => Ok(Filter::Approx(required_attr(attr)?, unescape(raw_value)?)),
            Some(b'>') => Ok(Filter::GreaterOrEqual(required_attr(attr)?, unescape(raw_value)?)),
            Some(b'<') => Ok(Filter::LessOrEqual(required_attr(attr)?, unescape(raw_value)?)),
            Some(b':') => parse_extensible(&attr, raw_value),
            _ => {
                let attr = required_attr(attr)?;
                if raw_value == b"*" {
                    Ok(Filter::Present(attr))
                } else if raw_value.contains(&b'*') {
                    parse_substrings(attr, raw_value)
                } else {
                    Ok(Filter::Equality(attr, unescape(raw_value)?))
                }
            }
        }
    }
}

fn required_attr(attr: String) -> Result<String> {
    if attr.is_empty() {
        bail!("Missing attribute description in filter");
    }
    Ok(attr)
}

fn parse_substrings(attr: String, raw: &[u8]) -> Result<Filter> {
    let pieces: Vec<&[u8]> = raw.split(|&b| b == b'*').collect();
    let last = pieces.len() - 1;
    let mut initial = None;
    let mut any = Vec::new();
    let mut final_ = None;
    for (i, piece) in pieces.iter().enumerate() {
        if piece.is_empty() {
            continue;
        }
        let value = unescape(piece)?;
        if i == 0 {
            initial = Some(value);
        } else if i == last {
            final_ = Some(value);
        } else {
            any.push(value);
        }
    }
    Ok(Filter::Substrings {
        attr,
        initial,
        any,
        final_,
    })
}

/// `attr[:dn][:rule]:=value` with the trailing ':' already stripped.
fn parse_extensible(desc: &str, raw: &[u8]) -> Result<Filter> {
    let mut parts = desc.split(':');
    let attr = parts.next().unwrap_or_default();
    let mut dn_attributes = false;
    let mut matching_rule = None;
    for part in parts {
        if part.eq_ignore_ascii_case("dn") {
            dn_attributes = true;
        } else if !part.is_empty() {
            matching_rule = Some(part.to_string());
        }
    }
    let attr = if attr.is_empty() { None } else { Some(attr.to_string()) };
    if attr.is_none() && matching_rule.is_none() {
        bail!("Extensible match needs an attribute or a matching rule");
    }
    Ok(Filter::Extensible {
        matching_rule,
        attr,
        value: unescape(raw)?,
        dn_attributes,
    })
}

/// Decode `\XX` hex escapes.
fn unescape(raw: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' {
            let hex = raw
                .get(i + 1..i + 3)
                .ok_or_else(|| anyhow::anyhow!("Truncated escape in filter value"))?;
            let hex = std::str::from_utf8(hex)?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| anyhow::anyhow!("Invalid escape \\{} in filter value", hex))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    Ok(out)
}
