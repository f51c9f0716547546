//! Text codec for the SQL surface: array literals, string quoting and
//! locale-independent float formatting. Array literals follow the
//! `{e1,e2,…}` form with string elements double-quoted and
//! backslash-escaped; the decoder also accepts unquoted elements as the
//! server emits them.

use crate::error::{Result, StoreError};

/// Formats a float so that parsing the text recovers the exact bit pattern.
/// Rust's shortest-round-trip `Display` is locale independent.
pub fn fmt_f64(v: f64) -> String {
    format!("{v}")
}

/// Wraps text in a SQL single-quoted literal, doubling embedded quotes.
pub fn sql_quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for ch in text.chars() {
        if ch == '\'' {
            out.push('\'');
        }
        out.push(ch);
    }
    out.push('\'');
    out
}

/// Embeds a node name using dollar quoting, picking a tag the name does not
/// contain.
pub fn dollar_quote(name: &str) -> String {
    let mut tag = "$q$".to_string();
    let mut n = 0u32;
    while name.contains(&tag) {
        n += 1;
        tag = format!("$q{n}$");
    }
    format!("{tag}{name}{tag}")
}

pub fn float_array_literal(xs: &[f64]) -> String {
    let mut inner = String::from("{");
    for (i, v) in xs.iter().enumerate() {
        if i > 0 {
            inner.push_str(", ");
        }
        inner.push_str(&fmt_f64(*v));
    }
    inner.push('}');
    sql_quote(&inner)
}

pub fn id_array_literal(ids: &[u64]) -> String {
    let mut inner = String::from("{");
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            inner.push_str(", ");
        }
        inner.push_str(&id.to_string());
    }
    inner.push('}');
    sql_quote(&inner)
}

pub fn string_array_literal<S: AsRef<str>>(xs: &[S]) -> String {
    let mut inner = String::from("{");
    for (i, s) in xs.iter().enumerate() {
        if i > 0 {
            inner.push_str(", ");
        }
        inner.push('"');
        for ch in s.as_ref().chars() {
            if ch == '"' || ch == '\\' {
                inner.push('\\');
            }
            inner.push(ch);
        }
        inner.push('"');
    }
    inner.push('}');
    sql_quote(&inner)
}

fn array_body(text: &str) -> Result<&str> {
    let t = text.trim();
    let t = t
        .strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .ok_or_else(|| StoreError::Schema(format!("not an array literal: {text:?}")))?;
    Ok(t)
}

pub fn parse_u64_array(text: &str) -> Result<Vec<u64>> {
    let body = array_body(text)?;
    let mut out = Vec::new();
    for tok in body.split(',') {
        let tok = tok.trim();
        if tok.is_empty() {
            continue;
        }
        let v = tok
            .parse::<u64>()
            .map_err(|_| StoreError::Schema(format!("bad id in array: {tok:?}")))?;
        out.push(v);
    }
    Ok(out)
}

pub fn parse_f64_array(text: &str) -> Result<Vec<f64>> {
    let body = array_body(text)?;
    let mut out = Vec::new();
    for tok in body.split(',') {
        let tok = tok.trim();
        if tok.is_empty() {
            continue;
        }
        let v = tok
            .parse::<f64>()
            .map_err(|_| StoreError::Schema(format!("bad float in array: {tok:?}")))?;
        out.push(v);
    }
    Ok(out)
}

/// Parses a text array. Elements may be double-quoted with backslash
/// escapes, or bare; bare elements are trimmed.
pub fn parse_string_array(text: &str) -> Result<Vec<String>> {
    let body = array_body(text)?;
    let mut out = Vec::new();
    let mut chars = body.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        match chars.peek() {
            None => break,
            Some('"') => {
                chars.next();
                let mut elem = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(c) => elem.push(c),
                            None => {
                                return Err(StoreError::Schema(
                                    "dangling escape in array literal".into(),
                                ))
                            }
                        },
                        Some('"') => break,
                        Some(c) => elem.push(c),
                        None => {
                            return Err(StoreError::Schema(
                                "unterminated string in array literal".into(),
                            ))
                        }
                    }
                }
                out.push(elem);
                // Consume the separator, if any.
                while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                    chars.next();
                }
                if matches!(chars.peek(), Some(',')) {
                    chars.next();
                }
            }
            Some(_) => {
                let mut elem = String::new();
                for c in chars.by_ref() {
                    if c == ',' {
                        break;
                    }
                    elem.push(c);
                }
                out.push(elem.trim().to_string());
            }
        }
    }
    Ok(out)
}
