use crate::request::RequestId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// How error-free bodies are compared once their bytes differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompareMode {
    /// Byte-identical bodies only.
    Strict,
    /// Also accept structurally equal JSON when the first body starts a JSON object.
    #[default]
    JsonObject,
    /// Also accept structurally equal JSON of any kind (arrays, scalars).
    Json,
}

impl FromStr for CompareMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(CompareMode::Strict),
            "json-object" => Ok(CompareMode::JsonObject),
            "json" => Ok(CompareMode::Json),
            other => Err(format!(
                "invalid compare mode: {other}, must be 'strict', 'json-object' or 'json'"
            )),
        }
    }
}

impl fmt::Display for CompareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompareMode::Strict => "strict",
            CompareMode::JsonObject => "json-object",
            CompareMode::Json => "json",
        })
    }
}

/// Outcome of one exchange against one endpoint.
#[derive(Debug, Clone)]
pub struct Response {
    /// Index of the producing pool.
    pub endpoint: usize,
    pub endpoint_uri: Arc<str>,
    pub request_id: RequestId,
    pub body: Option<Vec<u8>>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl Response {
    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_deref().unwrap_or_default()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Whether two endpoints answered the same request the same way.
    ///
    /// Errored responses match only when both the message and the body agree.
    /// An errored and an error-free response never match.
    pub fn equivalent(&self, other: &Response, mode: CompareMode) -> bool {
        match (&self.error, &other.error) {
            (None, None) => {
                self.body_bytes() == other.body_bytes()
                    || json_equal(self.body_bytes(), other.body_bytes(), mode)
            }
            (Some(a), Some(b)) => a == b && self.body_bytes() == other.body_bytes(),
            _ => false,
        }
    }
}

/// Structural JSON comparison, ignoring whitespace and key order.
fn json_equal(a: &[u8], b: &[u8], mode: CompareMode) -> bool {
    match mode {
        CompareMode::Strict => return false,
        CompareMode::JsonObject if a.first() != Some(&b'{') => return false,
        CompareMode::JsonObject | CompareMode::Json => {}
    }

    let Ok(a) = serde_json::from_slice::<serde_json::Value>(a) else {
        return false;
    };
    let Ok(b) = serde_json::from_slice::<serde_json::Value>(b) else {
        return false;
    };
    a == b
}

/// Diff view of a mismatched group, relative to its first response.
pub struct Responses<'a>(pub &'a [Response]);

impl fmt::Display for Responses<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(first) = self.0.first() else {
            return Ok(());
        };

        for (i, resp) in self.0.iter().enumerate() {
            write!(f, "\t{:?}", resp.elapsed)?;

            match (&resp.error, &first.error) {
                (None, None) => {
                    if resp.body_bytes() != first.body_bytes() {
                        write!(
                            f,
                            "[{}: body mismatch:\n{}\n\t{}\n{}\n\t{}]",
                            i,
                            resp.endpoint_uri,
                            String::from_utf8_lossy(resp.body_bytes()),
                            first.endpoint_uri,
                            String::from_utf8_lossy(first.body_bytes()),
                        )?;
                    }
                }
                (Some(a), Some(b)) if a == b => {
                    if resp.body_bytes() != first.body_bytes() {
                        write!(f, "[{}: error body mismatch: {}]", i, a)?;
                    }
                }
                (a, b) => {
                    write!(
                        f,
                        "[{}: error mismatch: {} != {}]",
                        i,
                        a.as_deref().unwrap_or("<nil>"),
                        b.as_deref().unwrap_or("<nil>"),
                    )?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(body: &str, error: Option<&str>) -> Response {
        Response {
            endpoint: 0,
            endpoint_uri: Arc::from("noop://a"),
            request_id: 7,
            body: Some(body.as_bytes().to_vec()),
            error: error.map(str::to_string),
            elapsed: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_identical_errors_and_bodies_match() {
        let a = resp("oops", Some("bad status code: 500"));
        let b = resp("oops", Some("bad status code: 500"));
        assert!(a.equivalent(&b, CompareMode::Strict));
    }

    #[test]
    fn test_error_bodies_must_match_too() {
        let a = resp("oops", Some("bad status code: 500"));
        let b = resp("other", Some("bad status code: 500"));
        assert!(!a.equivalent(&b, CompareMode::Json));
    }

    #[test]
    fn test_one_sided_error_never_matches() {
        let a = resp("", Some("timeout"));
        let b = resp("", None);
        for mode in [CompareMode::Strict, CompareMode::JsonObject, CompareMode::Json] {
            assert!(!a.equivalent(&b, mode));
            assert!(!b.equivalent(&a, mode));
        }
    }

    #[test]
    fn test_missing_and_empty_bodies_match() {
        let mut a = resp("", None);
        a.body = None;
        let b = resp("", None);
        assert!(a.equivalent(&b, CompareMode::Strict));
    }

    #[test]
    fn test_json_key_order_ignored() {
        let a = resp(r#"{"a":1,"b":[1,2]}"#, None);
        let b = resp(r#"{ "b": [1, 2], "a": 1 }"#, None);
        assert!(a.equivalent(&b, CompareMode::JsonObject));
        assert!(a.equivalent(&b, CompareMode::Json));
        assert!(!a.equivalent(&b, CompareMode::Strict));
    }

    #[test]
    fn test_different_json_values_do_not_match() {
        let a = resp(r#"{"a":1}"#, None);
        let b = resp(r#"{"a":2}"#, None);
        assert!(!a.equivalent(&b, CompareMode::JsonObject));
        assert!(!a.equivalent(&b, CompareMode::Json));
    }

    #[test]
    fn test_json_arrays_depend_on_mode() {
        let a = resp("[1, 2]", None);
        let b = resp("[1,2]", None);
        assert!(!a.equivalent(&b, CompareMode::JsonObject));
        assert!(a.equivalent(&b, CompareMode::Json));
    }

    #[test]
    fn test_invalid_json_does_not_match() {
        let a = resp("{not json", None);
        let b = resp("{not  json", None);
        assert!(!a.equivalent(&b, CompareMode::Json));
    }

    #[test]
    fn test_compare_mode_parse() {
        assert_eq!("strict".parse::<CompareMode>(), Ok(CompareMode::Strict));
        assert_eq!("json-object".parse::<CompareMode>(), Ok(CompareMode::JsonObject));
        assert_eq!("json".parse::<CompareMode>(), Ok(CompareMode::Json));
        assert!("loose".parse::<CompareMode>().is_err());
        assert_eq!(CompareMode::default().to_string(), "json-object");
    }

    #[test]
    fn test_responses_diff() {
        let mut b = resp(r#"{"a":2}"#, None);
        b.endpoint_uri = Arc::from("noop://b");
        let group = vec![resp(r#"{"a":1}"#, None), b, resp("", Some("timeout"))];

        let out = Responses(&group).to_string();
        assert!(out.contains("[1: body mismatch:\nnoop://b"), "{out}");
        assert!(out.contains("[2: error mismatch: timeout != <nil>]"), "{out}");
        assert!(!out.contains("[0:"), "{out}");
    }
}
