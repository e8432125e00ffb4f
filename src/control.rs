//! Debian control paragraph codec
//!
//! Parses and re-emits the RFC-822-style stanzas used by `Release` and
//! `Packages` files. Field order is preserved so a rewritten file stays
//! recognizable next to its upstream original.

use std::fmt::Write as _;

use anyhow::{bail, Result};
use nom::bytes::complete::take_until;
use nom::character::complete::{char, space0};
use nom::combinator::{map, rest, verify};
use nom::sequence::{pair, separated_pair};
use nom::IResult;

/// One ` <hex> <size> <filename>` line of a checksum list field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    pub hash: String,
    pub size: u64,
    pub filename: String,
}

/// Tagged value of a control field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Scalar(String),
    /// Single-line value of a declared list field, split on the separator.
    List(Vec<String>),
    /// Folded multi-line value; continuation lines in order, the inline
    /// part (when non-empty) first.
    Lines(Vec<String>),
    /// Converted checksum list (`MD5Sum`, `SHA256`, ...).
    Checksums(Vec<ChecksumEntry>),
}

/// An ordered control paragraph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Paragraph {
    fields: Vec<(String, FieldValue)>,
}

impl Paragraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == name)
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut FieldValue> {
        self.fields
            .iter_mut()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Exact key of a field matched case-insensitively.
    pub fn key_ignore_case(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .map(|(k, _)| k.as_str())
            .find(|k| k.eq_ignore_ascii_case(name))
    }

    pub fn scalar(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(FieldValue::Scalar(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Scalar value of a field matched case-insensitively.
    pub fn scalar_ignore_case(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| match v {
                FieldValue::Scalar(s) => Some(s.as_str()),
                _ => None,
            })
    }

    pub fn list(&self, name: &str) -> Option<&[String]> {
        match self.get(name) {
            Some(FieldValue::List(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn checksums(&self, name: &str) -> Option<&[ChecksumEntry]> {
        match self.get(name) {
            Some(FieldValue::Checksums(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Append a field without looking for an existing one.
    pub fn push(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.push((name.into(), value));
    }

    /// Replace an existing field in place, or append it.
    pub fn set(&mut self, name: &str, value: FieldValue) {
        match self.get_mut(name) {
            Some(slot) => *slot = value,
            None => self.push(name, value),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        let pos = self.fields.iter().position(|(k, _)| k == name)?;
        Some(self.fields.remove(pos).1)
    }
}

/// Declared field categories of one file flavor.
#[derive(Debug, Clone, Copy)]
pub struct Syntax {
    pub list_fields: &'static [&'static str],
    pub list_sep: char,
    pub empty_keys: &'static [&'static str],
    pub checksum_fields: &'static [&'static str],
}

impl Syntax {
    /// `Release` / `InRelease` stanzas.
    pub fn release() -> Self {
        Syntax {
            list_fields: &["Architectures", "Components"],
            list_sep: ' ',
            empty_keys: &["Description"],
            checksum_fields: &["MD5Sum", "SHA1", "SHA256", "SHA512"],
        }
    }

    /// `Packages` stanzas.
    pub fn packages() -> Self {
        Syntax {
            list_fields: &[],
            list_sep: ' ',
            empty_keys: &["Description"],
            checksum_fields: &[],
        }
    }

    pub fn is_list(&self, name: &str) -> bool {
        self.list_fields.iter().any(|f| *f == name)
    }

    pub fn is_empty_key(&self, name: &str) -> bool {
        self.empty_keys.iter().any(|f| *f == name)
    }

    pub fn is_checksum(&self, name: &str) -> bool {
        self.checksum_fields
            .iter()
            .any(|f| f.eq_ignore_ascii_case(name))
    }
}

fn field_name(input: &str) -> IResult<&str, &str> {
    verify(take_until(":"), |s: &str| {
        !s.is_empty() && !s.contains('\n')
    })(input)
}

fn separator(input: &str) -> IResult<&str, ()> {
    map(pair(char(':'), space0), |_| ())(input)
}

/// Split one `Name: value` line.
fn field_line(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(field_name, separator, rest)(input)
}

fn finish_field(
    paragraph: &mut Paragraph,
    syntax: &Syntax,
    key: String,
    inline: String,
    continuations: Vec<String>,
) -> Result<()> {
    let value = if !continuations.is_empty() {
        let mut lines = Vec::with_capacity(continuations.len() + 1);
        if !inline.is_empty() {
            lines.push(inline);
        }
        lines.extend(continuations);
        FieldValue::Lines(lines)
    } else if inline.is_empty() {
        // checksum lists may come back empty after pruning
        if !syntax.is_empty_key(&key) && !syntax.is_checksum(&key) {
            bail!("format error: key '{}' without value", key);
        }
        FieldValue::Lines(Vec::new())
    } else if syntax.is_list(&key) {
        FieldValue::List(
            inline
                .split(syntax.list_sep)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    } else {
        FieldValue::Scalar(inline)
    };
    paragraph.push(key, value);

    Ok(())
}

/// Parse a stream of control paragraphs.
///
/// A duplicated key within a paragraph starts a new paragraph, which is how
/// a `Packages` file parses into one stanza per binary package.
pub fn parse_paragraphs(input: &str, syntax: &Syntax) -> Result<Vec<Paragraph>> {
    let mut paragraphs = Vec::new();
    let mut current = Paragraph::new();
    let mut key: Option<String> = None;
    let mut inline = String::new();
    let mut continuations: Vec<String> = Vec::new();

    for raw in input.lines() {
        let line = raw.trim_end();
        if line.trim().is_empty() {
            if let Some(k) = key.take() {
                finish_field(
                    &mut current,
                    syntax,
                    k,
                    std::mem::take(&mut inline),
                    std::mem::take(&mut continuations),
                )?;
            }
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
            continue;
        }
        if line.starts_with(|c: char| c.is_whitespace()) {
            if key.is_none() {
                bail!("format error: value line without a key: '{}'", line.trim());
            }
            continuations.push(line.trim().to_string());
            continue;
        }
        match field_line(line) {
            Ok((_, (name, value))) => {
                if let Some(k) = key.take() {
                    finish_field(
                        &mut current,
                        syntax,
                        k,
                        std::mem::take(&mut inline),
                        std::mem::take(&mut continuations),
                    )?;
                }
                let name = name.trim();
                if current.contains(name) {
                    paragraphs.push(std::mem::take(&mut current));
                }
                key = Some(name.to_string());
                inline = value.trim().to_string();
            }
            Err(_) => {
                // no separator on the line; tolerated as a continuation
                if key.is_none() {
                    bail!("format error: value line without a key: '{}'", line);
                }
                continuations.push(line.trim().to_string());
            }
        }
    }
    if let Some(k) = key.take() {
        finish_field(&mut current, syntax, k, inline, continuations)?;
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }

    Ok(paragraphs)
}

/// Emit one paragraph, newline-terminated per field.
pub fn emit_paragraph(paragraph: &Paragraph, syntax: &Syntax, out: &mut String) {
    for (name, value) in paragraph.iter() {
        match value {
            FieldValue::Scalar(v) => {
                let _ = writeln!(out, "{}: {}", name, v);
            }
            FieldValue::List(vs) => {
                let _ = writeln!(out, "{}: {}", name, vs.join(&syntax.list_sep.to_string()));
            }
            FieldValue::Lines(vs) => {
                if syntax.is_empty_key(name) {
                    let _ = writeln!(out, "{}:", name);
                    for v in vs {
                        let _ = writeln!(out, " {}", v);
                    }
                } else {
                    let mut lines = vs.iter();
                    let first = lines.next().map(String::as_str).unwrap_or_default();
                    let _ = writeln!(out, "{}: {}", name, first);
                    for v in lines {
                        let _ = writeln!(out, " {}", v);
                    }
                }
            }
            FieldValue::Checksums(entries) => {
                let _ = writeln!(out, "{}:", name);
                for e in entries {
                    let _ = writeln!(out, " {} {:>10} {}", e.hash, e.size, e.filename);
                }
            }
        }
    }
}

/// Emit a sequence of paragraphs separated by blank lines.
pub fn emit_paragraphs(paragraphs: &[Paragraph], syntax: &Syntax) -> String {
    let mut out = String::new();
    for (n, p) in paragraphs.iter().enumerate() {
        if n > 0 {
            out.push('\n');
        }
        emit_paragraph(p, syntax, &mut out);
    }

    out
}
