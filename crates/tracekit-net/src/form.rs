//! Multipart form data decoding.
//!
//! The file-open hand-off posts a `multipart/form-data` body carrying one
//! binary file field and zero or more scalar fields. This module decodes that
//! body into entries the router can walk.

use bytes::Bytes;
use mime::Mime;

use crate::NetError;

/// A decoded form field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FormValue {
    /// Scalar text field.
    Text(String),
    /// Binary file field.
    File { filename: String, content: Bytes },
}

/// A decoded form field.
#[derive(Debug, Clone, PartialEq)]
pub struct FormEntry {
    pub name: String,
    pub value: FormValue,
}

/// Decode a `multipart/form-data` body.
///
/// `content_type` is the request's Content-Type header, which must carry the
/// part boundary. Entries are returned in document order.
pub fn parse_multipart(content_type: &str, body: &[u8]) -> Result<Vec<FormEntry>, NetError> {
    let mime: Mime = content_type
        .parse()
        .map_err(|_| NetError::InvalidForm(format!("unparseable content type: {content_type}")))?;

    if mime.type_() != mime::MULTIPART || mime.subtype() != mime::FORM_DATA {
        return Err(NetError::InvalidForm(format!(
            "expected multipart/form-data, got {mime}"
        )));
    }

    let boundary = mime
        .get_param(mime::BOUNDARY)
        .ok_or_else(|| NetError::InvalidForm("missing multipart boundary".to_string()))?;
    let delimiter = format!("--{}", boundary.as_str()).into_bytes();

    let mut entries = Vec::new();
    let mut pos = find_from(body, &delimiter, 0)
        .ok_or_else(|| NetError::InvalidForm("boundary not found in body".to_string()))?
        + delimiter.len();

    loop {
        let rest = &body[pos..];
        if rest.starts_with(b"--") {
            // Closing delimiter.
            break;
        }
        if !rest.starts_with(b"\r\n") {
            return Err(NetError::InvalidForm(
                "malformed part delimiter".to_string(),
            ));
        }
        let header_start = pos + 2;
        let header_end = find_from(body, b"\r\n\r\n", header_start)
            .ok_or_else(|| NetError::InvalidForm("unterminated part headers".to_string()))?;
        let content_start = header_end + 4;
        let next_delim = find_from(body, &delimiter, content_start)
            .ok_or_else(|| NetError::InvalidForm("unterminated part body".to_string()))?;
        if next_delim < content_start + 2 {
            return Err(NetError::InvalidForm("truncated part body".to_string()));
        }
        // Content ends before the CRLF that precedes the next delimiter.
        let content = &body[content_start..next_delim - 2];

        let headers = String::from_utf8_lossy(&body[header_start..header_end]);
        let (name, filename) = parse_disposition(&headers)?;

        let value = match filename {
            Some(filename) => FormValue::File {
                filename,
                content: Bytes::copy_from_slice(content),
            },
            None => FormValue::Text(String::from_utf8_lossy(content).into_owned()),
        };
        entries.push(FormEntry { name, value });

        pos = next_delim + delimiter.len();
    }

    Ok(entries)
}

/// Extract the field name and optional filename from a part's headers.
fn parse_disposition(headers: &str) -> Result<(String, Option<String>), NetError> {
    for line in headers.split("\r\n") {
        let Some((key, params)) = line.split_once(':') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("content-disposition") {
            continue;
        }

        let mut name = None;
        let mut filename = None;
        for param in params.split(';') {
            let param = param.trim();
            if let Some(value) = param.strip_prefix("name=") {
                name = Some(unquote(value));
            } else if let Some(value) = param.strip_prefix("filename=") {
                filename = Some(unquote(value));
            }
        }

        let name = name.ok_or_else(|| {
            NetError::InvalidForm("content-disposition without a field name".to_string())
        })?;
        return Ok((name, filename));
    }
    Err(NetError::InvalidForm(
        "part without content-disposition".to_string(),
    ))
}

fn unquote(value: &str) -> String {
    value.trim_matches('"').to_string()
}

fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < from || haystack.len() - from < needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "----TraceKitFormBoundary";

    fn encode(entries: &[(&str, FormValue)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in entries {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match value {
                FormValue::Text(text) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{text}\r\n"
                        )
                        .as_bytes(),
                    );
                }
                FormValue::File { filename, content } => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(content);
                    body.extend_from_slice(b"\r\n");
                }
            }
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn content_type() -> String {
        format!("multipart/form-data; boundary={BOUNDARY}")
    }

    #[test]
    fn test_parse_text_and_file_fields() {
        let body = encode(&[
            ("localOnly", FormValue::Text("true".to_string())),
            (
                "trace",
                FormValue::File {
                    filename: "run.json".to_string(),
                    content: Bytes::from_static(b"\x00\x01binary\xff"),
                },
            ),
        ]);

        let entries = parse_multipart(&content_type(), &body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "localOnly");
        assert_eq!(entries[0].value, FormValue::Text("true".to_string()));
        assert_eq!(entries[1].name, "trace");
        match &entries[1].value {
            FormValue::File { filename, content } => {
                assert_eq!(filename, "run.json");
                assert_eq!(content.as_ref(), b"\x00\x01binary\xff");
            }
            other => panic!("expected file value, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_empty_form() {
        let body = encode(&[]);
        let entries = parse_multipart(&content_type(), &body).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_file_content_may_contain_crlf() {
        let body = encode(&[(
            "trace",
            FormValue::File {
                filename: "t.bin".to_string(),
                content: Bytes::from_static(b"line1\r\nline2\r\n"),
            },
        )]);

        let entries = parse_multipart(&content_type(), &body).unwrap();
        match &entries[0].value {
            FormValue::File { content, .. } => assert_eq!(content.as_ref(), b"line1\r\nline2\r\n"),
            other => panic!("expected file value, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_missing_boundary() {
        let err = parse_multipart("multipart/form-data", b"").unwrap_err();
        assert!(matches!(err, NetError::InvalidForm(_)));
    }

    #[test]
    fn test_rejects_wrong_content_type() {
        let err = parse_multipart("application/json", b"{}").unwrap_err();
        assert!(matches!(err, NetError::InvalidForm(_)));
    }
}
