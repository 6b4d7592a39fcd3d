//! Media type parsing, in the shape of `Content-Type` headers.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{HostError, HostResult};

/// A parsed media type such as `text/html; charset=utf-8`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaType {
    /// Lowercased `type/subtype`.
    pub media_type: String,
    /// Parameter names are lowercased; values keep their case.
    pub parameters: HashMap<String, String>,
}

/// Parse a media type with optional `key=value` parameters. Quoted
/// parameter values may contain `;` and escaped quotes.
pub fn parse_media_type(value: &str) -> HostResult<MediaType> {
    let mut rest = value.trim();
    let media_type = match rest.find(';') {
        Some(idx) => {
            let head = &rest[..idx];
            rest = &rest[idx + 1..];
            head
        }
        None => {
            let head = rest;
            rest = "";
            head
        }
    };

    let media_type = media_type.trim().to_ascii_lowercase();
    if media_type.is_empty() {
        return Err(HostError::invalid_argument("no media type"));
    }
    if media_type.contains(' ') {
        return Err(HostError::invalid_argument(format!(
            "invalid media type: {media_type:?}"
        )));
    }

    let mut parameters = HashMap::new();
    while !rest.trim().is_empty() {
        let (name, value, remaining) = next_parameter(rest)?;
        parameters.insert(name, value);
        rest = remaining;
    }

    Ok(MediaType {
        media_type,
        parameters,
    })
}

/// Render a media type and parameters back into header form. Values
/// needing it are quoted.
pub fn format_media_type(media_type: &str, parameters: &HashMap<String, String>) -> String {
    let mut out = media_type.to_ascii_lowercase();
    let mut names: Vec<_> = parameters.keys().collect();
    names.sort();
    for name in names {
        let value = &parameters[name];
        out.push_str("; ");
        out.push_str(&name.to_ascii_lowercase());
        out.push('=');
        if needs_quoting(value) {
            out.push('"');
            for c in value.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
        } else {
            out.push_str(value);
        }
    }
    out
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '+')))
}

/// Parse one `name=value` parameter off the front of `rest`, returning
/// what remains after it.
fn next_parameter(rest: &str) -> HostResult<(String, String, &str)> {
    let rest = rest.trim_start();
    let eq = rest
        .find('=')
        .ok_or_else(|| HostError::invalid_argument(format!("invalid parameter: {rest:?}")))?;
    let name = rest[..eq].trim().to_ascii_lowercase();
    if name.is_empty() {
        return Err(HostError::invalid_argument("empty parameter name"));
    }
    let after = &rest[eq + 1..];

    if let Some(quoted) = after.strip_prefix('"') {
        let mut value = String::new();
        let mut chars = quoted.char_indices();
        while let Some((idx, c)) = chars.next() {
            match c {
                '\\' => {
                    let Some((_, escaped)) = chars.next() else {
                        return Err(HostError::invalid_argument("unterminated escape"));
                    };
                    value.push(escaped);
                }
                '"' => {
                    let remaining = quoted[idx + 1..].trim_start().trim_start_matches(';');
                    return Ok((name, value, remaining));
                }
                other => value.push(other),
            }
        }
        Err(HostError::invalid_argument("unterminated quoted value"))
    } else {
        match after.find(';') {
            Some(idx) => Ok((
                name,
                after[..idx].trim().to_string(),
                &after[idx + 1..],
            )),
            None => Ok((name, after.trim().to_string(), "")),
        }
    }
}
