//! JSON decoding that tolerates non-finite numerics.
//!
//! Scientific agents serialize `NaN`, `Infinity`, and `-Infinity` into their
//! state payloads.  `serde_json` rejects those tokens, and its `Value` type
//! cannot represent them, so the decoder rewrites bare non-finite tokens
//! (outside string literals) to `null` before parsing.  Encoding never
//! produces non-finite tokens, so the rewrite is decode-only.

use serde::de::DeserializeOwned;

/// Deserialize `bytes` as JSON, accepting non-finite number tokens.
///
/// Strict parsing is attempted first; the rewrite only runs on payloads that
/// fail it, and the original parse error is reported when the rewrite does
/// not apply.
pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, serde_json::Error> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Ok(value),
        Err(strict_err) => match rewrite_non_finite(bytes) {
            Some(rewritten) => serde_json::from_slice(&rewritten).map_err(|_| strict_err),
            None => Err(strict_err),
        },
    }
}

/// Replace bare `NaN` / `Infinity` / `-Infinity` tokens with `null`.
/// Returns `None` when nothing was rewritten.
fn rewrite_non_finite(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut changed = false;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            out.push(b);
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match b {
            b'"' => {
                in_string = true;
                out.push(b);
                i += 1;
            }
            b'N' if bytes[i..].starts_with(b"NaN") => {
                out.extend_from_slice(b"null");
                changed = true;
                i += 3;
            }
            b'I' if bytes[i..].starts_with(b"Infinity") => {
                out.extend_from_slice(b"null");
                changed = true;
                i += 8;
            }
            b'-' if bytes[i + 1..].starts_with(b"Infinity") => {
                out.extend_from_slice(b"null");
                changed = true;
                i += 9;
            }
            _ => {
                out.push(b);
                i += 1;
            }
        }
    }
    changed.then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn strict_json_passes_through() {
        let v: Value = from_slice(br#"{"a": 1.5, "b": [true, null]}"#).unwrap();
        assert_eq!(v, json!({"a": 1.5, "b": [true, null]}));
    }

    #[test]
    fn nan_and_infinities_parse_as_null() {
        let v: Value =
            from_slice(br#"{"x": NaN, "y": [Infinity, -Infinity], "z": 3}"#).unwrap();
        assert_eq!(v, json!({"x": null, "y": [null, null], "z": 3}));
    }

    #[test]
    fn non_finite_tokens_inside_strings_are_preserved() {
        let v: Value = from_slice(br#"{"label": "NaN vs -Infinity", "v": NaN}"#).unwrap();
        assert_eq!(v, json!({"label": "NaN vs -Infinity", "v": null}));
    }

    #[test]
    fn escaped_quotes_do_not_break_string_tracking() {
        let v: Value = from_slice(br#"{"s": "a \" Infinity", "v": Infinity}"#).unwrap();
        assert_eq!(v, json!({"s": "a \" Infinity", "v": null}));
    }

    #[test]
    fn genuinely_invalid_json_reports_the_strict_error() {
        assert!(from_slice::<Value>(b"{nope").is_err());
        assert!(from_slice::<Value>(b"{\"a\": Nan}").is_err());
    }
}
