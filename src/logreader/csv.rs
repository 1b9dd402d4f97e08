//! Tokenizer for V8 log lines
//!
//! Fields are comma separated. A field that starts with `"` runs to the
//! matching quote, with `""` standing for one literal quote. Unquoted fields
//! may carry backslash escapes: `\n`, `\\`, `\xHH` and `\uHHHH`.

use crate::error::{Error, Result};

/// Split one log line into decoded fields
pub fn parse_line(line: &str) -> Result<Vec<String>> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let mut fields = Vec::new();
    if line.is_empty() {
        return Ok(fields);
    }

    let mut rest = line;
    loop {
        if let Some(quoted) = rest.strip_prefix('"') {
            let (field, after) = parse_quoted(quoted)?;
            fields.push(field);
            match after.strip_prefix(',') {
                Some(next) => rest = next,
                None if after.is_empty() => break,
                None => {
                    return Err(Error::parse_error(format!(
                        "unexpected characters after quoted field: {:?}",
                        after
                    )))
                }
            }
        } else {
            match rest.find(',') {
                Some(comma) => {
                    fields.push(unescape(&rest[..comma])?);
                    rest = &rest[comma + 1..];
                }
                None => {
                    fields.push(unescape(rest)?);
                    break;
                }
            }
        }
    }
    Ok(fields)
}

/// Returns the field content and the text after the closing quote
fn parse_quoted(input: &str) -> Result<(String, &str)> {
    let mut field = String::new();
    let mut chars = input.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if c != '"' {
            field.push(c);
            continue;
        }
        if let Some((_, '"')) = chars.peek() {
            chars.next();
            field.push('"');
            continue;
        }
        return Ok((field, &input[idx + 1..]));
    }
    Err(Error::parse_error("unterminated quoted field"))
}

/// Decode the backslash escapes of an unquoted field
pub fn unescape(field: &str) -> Result<String> {
    if !field.contains('\\') {
        return Ok(field.to_string());
    }

    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some('x') => out.push(hex_char(&mut chars, 2)?),
            Some('u') => out.push(hex_char(&mut chars, 4)?),
            Some(other) => {
                return Err(Error::parse_error(format!(
                    "unknown escape sequence '\\{}'",
                    other
                )))
            }
            None => return Err(Error::parse_error("dangling backslash at end of field")),
        }
    }
    Ok(out)
}

fn hex_char(chars: &mut std::str::Chars<'_>, digits: usize) -> Result<char> {
    let hex: String = chars.by_ref().take(digits).collect();
    if hex.len() != digits {
        return Err(Error::parse_error(format!("truncated escape '{}'", hex)));
    }
    let code = u32::from_str_radix(&hex, 16)
        .map_err(|_| Error::parse_error(format!("invalid hex escape '{}'", hex)))?;
    char::from_u32(code).ok_or_else(|| Error::parse_error(format!("invalid code point {:#x}", code)))
}
