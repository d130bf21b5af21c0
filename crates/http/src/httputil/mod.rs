//! Parsing helpers shared by the connection layer.
//!
//! This module contains the textual plumbing of HTTP/1.x: header blocks,
//! query strings, and `multipart/form-data` bodies. Everything here is
//! lenient the way browsers expect: duplicate header names keep the last
//! value, damaged multipart parts are skipped with a warning instead of
//! failing the request.

use std::collections::HashMap;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::protocol::{ParseError, UploadedFile};
use crate::utils::find_subsequence;

/// Parses a block of `Name: Value` lines separated by CRLF.
///
/// Header names are matched case-insensitively; when a name repeats, the
/// last occurrence wins. Values keep high-bit bytes as received.
///
/// # Errors
///
/// Fails when a line has no colon or a name or value contains bytes that
/// are not legal in a header.
pub fn parse_headers(text: &str) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::new();
    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::invalid_header(format!("no colon in line {line:?}")))?;
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(ParseError::invalid_header)?;
        let value =
            HeaderValue::from_bytes(value.trim().as_bytes()).map_err(ParseError::invalid_header)?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Parses an `application/x-www-form-urlencoded` query string into a map
/// of name to value list. Pairs with an empty value are dropped; repeated
/// names accumulate in arrival order.
pub fn parse_query_string(query: &str) -> HashMap<String, Vec<String>> {
    let mut arguments: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in form_urlencoded::parse(query.as_bytes()) {
        if value.is_empty() {
            continue;
        }
        arguments.entry(name.into_owned()).or_default().push(value.into_owned());
    }
    arguments
}

/// Decodes percent escapes and `+` in a single url-encoded token.
pub fn url_decode(encoded: &str) -> String {
    form_urlencoded::parse(encoded.as_bytes())
        .map(|(name, value)| {
            if value.is_empty() {
                name.into_owned()
            } else {
                format!("{name}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Splits a `multipart/form-data` body into its parts and routes each one:
/// parts carrying a `filename` land in `files` (last one wins per field
/// name), the rest append to `arguments`.
///
/// A part is dropped with a warning when it has no header separator, no
/// `form-data` disposition, no field name, or is not delimiter-terminated.
pub fn parse_multipart(
    boundary: &str,
    data: &[u8],
    arguments: &mut HashMap<String, Vec<String>>,
    files: &mut HashMap<String, UploadedFile>,
) {
    // Some clients quote the boundary parameter even though they should not.
    let boundary = boundary
        .strip_prefix('"')
        .and_then(|b| b.strip_suffix('"'))
        .unwrap_or(boundary);

    let footer_length = if data.ends_with(b"\r\n") {
        boundary.len() + 6
    } else {
        boundary.len() + 4
    };
    if data.len() < footer_length {
        warn!("multipart body shorter than its closing delimiter");
        return;
    }
    let data = &data[..data.len() - footer_length];

    let marker = format!("--{boundary}\r\n");
    for part in split_on(data, marker.as_bytes()) {
        if part.is_empty() {
            continue;
        }
        let Some(eoh) = find_subsequence(part, b"\r\n\r\n") else {
            warn!("multipart/form-data part missing headers");
            continue;
        };
        let header_text = String::from_utf8_lossy(&part[..eoh]);
        let headers = match parse_headers(&header_text) {
            Ok(headers) => headers,
            Err(e) => {
                warn!(cause = %e, "multipart/form-data part has invalid headers");
                continue;
            }
        };
        let disposition = headers
            .get(header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if !disposition.starts_with("form-data;") || !part.ends_with(b"\r\n") {
            warn!("invalid multipart/form-data part");
            continue;
        }
        // A part can end right at its header separator, leaving no room
        // for a body slice.
        let Some(value) = part.get(eoh + 4..part.len() - 2) else {
            warn!("invalid multipart/form-data part");
            continue;
        };

        let mut attributes = HashMap::new();
        for pair in disposition["form-data;".len()..].split(';') {
            let Some((name, attribute)) = pair.trim().split_once('=') else {
                continue;
            };
            attributes.insert(name.to_owned(), url_decode(attribute.trim_matches('"')));
        }
        let name = attributes.get("name").map(String::as_str).unwrap_or("");
        if name.is_empty() {
            warn!("multipart/form-data part missing name");
            continue;
        }

        let filename = attributes.get("filename").filter(|filename| !filename.is_empty());
        if let Some(filename) = filename {
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("application/unknown");
            files.insert(
                name.to_owned(),
                UploadedFile {
                    filename: filename.clone(),
                    content_type: content_type.to_owned(),
                    body: Bytes::copy_from_slice(value),
                },
            );
        } else {
            arguments
                .entry(name.to_owned())
                .or_default()
                .push(String::from_utf8_lossy(value).into_owned());
        }
    }
}

/// Splits `data` on every occurrence of `marker`, Python style: leading,
/// trailing, and adjacent markers produce empty pieces.
fn split_on<'a>(data: &'a [u8], marker: &[u8]) -> Vec<&'a [u8]> {
    let mut pieces = Vec::new();
    let mut rest = data;
    while let Some(pos) = find_subsequence(rest, marker) {
        pieces.push(&rest[..pos]);
        rest = &rest[pos + marker.len()..];
    }
    pieces.push(rest);
    pieces
}
