//! Text coercion: a column value rendered as text → typed `FieldValue`.
//!
//! Archive files and database rows carry every field as text. Integers arrive
//! as decimal or `0x` hex, bytes with or without a prefix (or Postgres `\x`),
//! and arrays in whatever shape the exporter chose: JSON (`["a","b"]`),
//! Python lists (`['a', 'b']`), Postgres arrays (`{a,b}`) or bare
//! comma-delimited text. Tuples appear as `(a,b)` or `[a,b]`.

use alloy_core::dyn_abi::DynSolType;
use alloy_primitives::{I256, U256};
use chaingov_core::FieldValue;

use crate::value::{decode_hex, hex_prefixed};

/// Coerce `raw` to the given ABI type. The error is a human-readable reason.
pub fn coerce(ty: &DynSolType, raw: &str) -> Result<FieldValue, String> {
    let s = raw.trim();
    match ty {
        DynSolType::Bool => parse_bool(s).map(FieldValue::Bool),
        DynSolType::Uint(_) => parse_uint(s).map(FieldValue::Uint),
        DynSolType::Int(_) => parse_int(s).map(FieldValue::Int),
        DynSolType::Address => parse_address(s).map(FieldValue::Address),
        DynSolType::FixedBytes(_) | DynSolType::Bytes | DynSolType::Function => {
            decode_hex(unquote(s).as_str())
                .map(|b| FieldValue::Bytes(hex_prefixed(&b)))
                .map_err(|e| format!("bad hex '{s}': {e}"))
        }
        DynSolType::String => Ok(FieldValue::Str(raw.to_string())),
        DynSolType::Array(inner) | DynSolType::FixedArray(inner, _) => {
            let items = split_list(s)?;
            items
                .iter()
                .map(|item| coerce(inner, item))
                .collect::<Result<Vec<_>, _>>()
                .map(FieldValue::Array)
        }
        DynSolType::Tuple(types) => {
            let items = split_list(s)?;
            if items.len() != types.len() {
                return Err(format!(
                    "tuple expects {} elements, got {} in '{s}'",
                    types.len(),
                    items.len()
                ));
            }
            types
                .iter()
                .zip(items.iter())
                .map(|(t, item)| coerce(t, item))
                .collect::<Result<Vec<_>, _>>()
                .map(FieldValue::Tuple)
        }
        #[allow(unreachable_patterns)]
        _ => Ok(FieldValue::Str(raw.to_string())),
    }
}

pub fn parse_uint(s: &str) -> Result<U256, String> {
    let s = unquote(s);
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) if hex.is_empty() => Ok(U256::ZERO),
        Some(hex) => U256::from_str_radix(hex, 16),
        None => U256::from_str_radix(s.trim_end_matches(".0"), 10),
    };
    parsed.map_err(|e| format!("bad uint '{s}': {e}"))
}

pub fn parse_int(s: &str) -> Result<I256, String> {
    let s = unquote(s);
    let parsed = if s.starts_with("0x") || s.starts_with("-0x") {
        I256::from_hex_str(&s)
    } else {
        I256::from_dec_str(s.trim_end_matches(".0"))
    };
    parsed.map_err(|e| format!("bad int '{s}': {e}"))
}

pub fn parse_bool(s: &str) -> Result<bool, String> {
    match unquote(s).to_ascii_lowercase().as_str() {
        "true" | "t" | "1" => Ok(true),
        "false" | "f" | "0" => Ok(false),
        other => Err(format!("bad bool '{other}'")),
    }
}

pub fn parse_address(s: &str) -> Result<String, String> {
    let bytes = decode_hex(unquote(s).as_str()).map_err(|e| format!("bad address '{s}': {e}"))?;
    match bytes.len() {
        20 => Ok(hex_prefixed(&bytes)),
        // Left-padded 32-byte word, as stored by some exporters.
        32 if bytes[..12].iter().all(|b| *b == 0) => Ok(hex_prefixed(&bytes[12..])),
        n => Err(format!("address '{s}' has {n} bytes")),
    }
}

/// Split a list literal into its top-level items.
///
/// Commas inside quotes or nested brackets do not split. Each item is trimmed
/// and unquoted; nested lists are returned verbatim for recursive coercion.
pub fn split_list(raw: &str) -> Result<Vec<String>, String> {
    let s = raw.trim();
    let inner = match (s.chars().next(), s.chars().last()) {
        (Some('['), Some(']')) | (Some('{'), Some('}')) | (Some('('), Some(')')) if s.len() >= 2 => {
            &s[1..s.len() - 1]
        }
        _ => s,
    };
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut items = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in inner.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match quote {
            Some(q) => {
                if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
                current.push(c);
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    current.push(c);
                }
                '[' | '(' | '{' => {
                    depth += 1;
                    current.push(c);
                }
                ']' | ')' | '}' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(format!("unbalanced brackets in '{s}'"));
                    }
                    current.push(c);
                }
                ',' if depth == 0 => items.push(unquote(&std::mem::take(&mut current))),
                _ => current.push(c),
            },
        }
    }
    if quote.is_some() || depth != 0 {
        return Err(format!("unterminated list '{s}'"));
    }
    items.push(unquote(&current));
    Ok(items)
}

/// Trim and strip one pair of matching outer quotes, resolving `\` escapes.
fn unquote(s: &str) -> String {
    let t = s.trim();
    let quoted = t.len() >= 2
        && ((t.starts_with('"') && t.ends_with('"')) || (t.starts_with('\'') && t.ends_with('\'')));
    if !quoted {
        return t.to_string();
    }
    let body = &t[1..t.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}
