//! A hand-written reader for the narrow YAML subset the orchestrator's
//! config file needs: block mappings, block sequences, scalars, and
//! `#` comments outside quotes. No flow collections, anchors, or
//! multi-document streams; the config file's shape never needs them,
//! and a narrow hand-rolled reader avoids pulling in a full YAML crate.

use std::collections::BTreeMap;
use std::fmt;

/// A parsed YAML value restricted to the supported subset.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Scalar(String),
    Sequence(Vec<Value>),
    Mapping(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Scalar(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.as_str()? {
            "true" | "True" | "TRUE" => Some(true),
            "false" | "False" | "FALSE" => Some(false),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_str()?.parse().ok()
    }

    pub fn as_mapping(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(s) => Some(s),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_mapping()?.get(key)
    }
}

#[derive(Debug)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

struct Line {
    number: usize,
    indent: usize,
    content: String,
}

/// Strip a `#` comment that starts outside of any quoted string.
fn strip_comment(raw: &str) -> &str {
    let mut in_single = false;
    let mut in_double = false;
    for (i, c) in raw.char_indices() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '#' if !in_single && !in_double => {
                // A comment must be preceded by whitespace or be at line start
                // to avoid treating `http://foo#bar` style values as comments
                // (not a concern for this config's value shapes, but cheap to
                // keep correct).
                if i == 0 || raw.as_bytes()[i - 1].is_ascii_whitespace() {
                    return &raw[..i];
                }
            }
            _ => {}
        }
    }
    raw
}

fn tokenize(input: &str) -> Result<Vec<Line>, ParseError> {
    let mut lines = Vec::new();
    for (idx, raw) in input.lines().enumerate() {
        let number = idx + 1;
        if raw.contains('\t') {
            return Err(ParseError {
                line: number,
                message: "tabs are not allowed for indentation".into(),
            });
        }
        let stripped = strip_comment(raw);
        let trimmed = stripped.trim_end();
        if trimmed.trim().is_empty() {
            continue;
        }
        let indent = trimmed.len() - trimmed.trim_start().len();
        lines.push(Line {
            number,
            indent,
            content: trimmed.trim_start().to_string(),
        });
    }
    Ok(lines)
}

fn parse_scalar(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
    {
        return Value::Scalar(inner.replace("\\\"", "\""));
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
    {
        return Value::Scalar(inner.replace("''", "'"));
    }
    if trimmed == "~" || trimmed == "null" {
        return Value::Null;
    }
    Value::Scalar(trimmed.to_string())
}

/// Parse a block at `lines[*pos..]` whose entries are indented at exactly
/// `indent`. Advances `*pos` past everything consumed.
fn parse_block(lines: &[Line], pos: &mut usize, indent: usize) -> Result<Value, ParseError> {
    if *pos >= lines.len() || lines[*pos].indent < indent {
        return Ok(Value::Null);
    }

    if lines[*pos].content.starts_with("- ") || lines[*pos].content == "-" {
        return parse_sequence(lines, pos, indent);
    }
    parse_mapping(lines, pos, indent)
}

fn parse_sequence(lines: &[Line], pos: &mut usize, indent: usize) -> Result<Value, ParseError> {
    let mut items = Vec::new();
    while *pos < lines.len() {
        let line = &lines[*pos];
        if line.indent != indent {
            break;
        }
        let rest = match line.content.strip_prefix("- ") {
            Some(rest) => rest.to_string(),
            None if line.content == "-" => String::new(),
            None => break,
        };
        *pos += 1;

        if rest.is_empty() {
            // Nested block starts on the following, more-indented lines.
            let nested_indent = lines.get(*pos).map(|l| l.indent).unwrap_or(indent);
            if nested_indent > indent {
                items.push(parse_block(lines, pos, nested_indent)?);
            } else {
                items.push(Value::Null);
            }
            continue;
        }

        if let Some((key, value)) = split_mapping_entry(&rest) {
            // `- key: value` starts an inline mapping item; subsequent more
            // indented lines (aligned past the `- `) are siblings of `key`.
            let mut map = BTreeMap::new();
            if value.trim().is_empty() {
                let nested_indent = lines.get(*pos).map(|l| l.indent).unwrap_or(0);
                let item_indent = indent + 2;
                if nested_indent > indent {
                    map.insert(
                        key,
                        parse_block(lines, pos, nested_indent.max(item_indent))?,
                    );
                } else {
                    map.insert(key, Value::Null);
                }
            } else {
                map.insert(key, parse_scalar(&value));
            }
            // Continue consuming sibling `key: value` lines indented to match
            // the first key's column (indent + 2, the width of "- ").
            let sibling_indent = indent + 2;
            while *pos < lines.len() && lines[*pos].indent == sibling_indent {
                let sibling = &lines[*pos];
                if let Some((k, v)) = split_mapping_entry(&sibling.content) {
                    *pos += 1;
                    if v.trim().is_empty() {
                        let nested_indent = lines.get(*pos).map(|l| l.indent).unwrap_or(0);
                        if nested_indent > sibling_indent {
                            map.insert(k, parse_block(lines, pos, nested_indent)?);
                        } else {
                            map.insert(k, Value::Null);
                        }
                    } else {
                        map.insert(k, parse_scalar(&v));
                    }
                } else {
                    break;
                }
            }
            items.push(Value::Mapping(map));
        } else {
            items.push(parse_scalar(&rest));
        }
    }
    Ok(Value::Sequence(items))
}

fn split_mapping_entry(content: &str) -> Option<(String, String)> {
    let mut in_single = false;
    let mut in_double = false;
    let bytes = content.as_bytes();
    for (i, c) in content.char_indices() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            ':' if !in_single && !in_double => {
                let after = bytes.get(i + 1);
                if after.is_none() || after == Some(&b' ') {
                    let key = content[..i].trim().to_string();
                    let value = content[i + 1..].to_string();
                    return Some((unquote_key(&key), value));
                }
            }
            _ => {}
        }
    }
    None
}

fn unquote_key(key: &str) -> String {
    if let Some(inner) = key.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return inner.to_string();
    }
    if let Some(inner) = key.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return inner.to_string();
    }
    key.to_string()
}

fn parse_mapping(lines: &[Line], pos: &mut usize, indent: usize) -> Result<Value, ParseError> {
    let mut map = BTreeMap::new();
    while *pos < lines.len() {
        let line = &lines[*pos];
        if line.indent != indent {
            break;
        }
        let Some((key, value)) = split_mapping_entry(&line.content) else {
            return Err(ParseError {
                line: line.number,
                message: format!("expected `key: value`, got `{}`", line.content),
            });
        };
        *pos += 1;

        if value.trim().is_empty() {
            let nested_indent = lines.get(*pos).map(|l| l.indent).unwrap_or(0);
            if nested_indent > indent {
                map.insert(key, parse_block(lines, pos, nested_indent)?);
            } else {
                map.insert(key, Value::Null);
            }
        } else {
            map.insert(key, parse_scalar(&value));
        }
    }
    Ok(Value::Mapping(map))
}

/// Parse a full YAML document from the supported subset.
pub fn parse(input: &str) -> Result<Value, ParseError> {
    let lines = tokenize(input)?;
    if lines.is_empty() {
        return Ok(Value::Mapping(BTreeMap::new()));
    }
    let base_indent = lines[0].indent;
    let mut pos = 0;
    let value = parse_block(&lines, &mut pos, base_indent)?;
    if pos != lines.len() {
        return Err(ParseError {
            line: lines[pos].number,
            message: "unexpected indentation".into(),
        });
    }
    Ok(value)
}
