//! Request and response types that travel through the queue.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque caller metadata, round-tripped untouched.
pub type Meta = Map<String, Value>;

/// HTTP options for one outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl RequestOptions {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get() -> Self {
        Self::new("GET")
    }

    pub fn post(body: Value) -> Self {
        Self::new("POST").with_body(body)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::get()
    }
}

/// One outbound API call.
///
/// Immutable once enqueued, except for `attempts` which the bucket manager
/// bumps on every internal retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub route: String,
    pub options: RequestOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(default)]
    pub attempts: u32,
}

impl ApiRequest {
    pub fn new(route: &str, options: RequestOptions, meta: Option<Meta>) -> Self {
        Self {
            route: route.to_string(),
            options,
            meta,
            attempts: 0,
        }
    }

    pub fn method(&self) -> &str {
        &self.options.method
    }
}

/// Response body, parsed when the content type is JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResponseBody {
    Json(Value),
    Text(String),
    Empty,
}

impl ResponseBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, ResponseBody::Json(_))
    }
}

/// Completed HTTP exchange as delivered to the producer.
///
/// Header names are stored lower-cased.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: ResponseBody,
}

impl ApiResponse {
    /// Build a response from raw parts, parsing JSON bodies.
    pub fn from_parts(status: u16, headers: BTreeMap<String, String>, bytes: &[u8]) -> Self {
        let headers: BTreeMap<String, String> = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();

        let is_json = headers
            .get("content-type")
            .is_some_and(|ct| ct.contains("json"));

        let body = if bytes.is_empty() {
            ResponseBody::Empty
        } else if is_json {
            match serde_json::from_slice(bytes) {
                Ok(v) => ResponseBody::Json(v),
                Err(_) => ResponseBody::Text(String::from_utf8_lossy(bytes).into_owned()),
            }
        } else {
            ResponseBody::Text(String::from_utf8_lossy(bytes).into_owned())
        };

        Self {
            status,
            headers,
            body,
        }
    }

    /// Get a header by (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_json_body_is_parsed() {
        let resp = ApiResponse::from_parts(
            200,
            headers(&[("Content-Type", "application/json")]),
            br#"{"id":"1"}"#,
        );
        assert_eq!(resp.body.as_json().unwrap()["id"], "1");
        assert_eq!(resp.header("content-type"), Some("application/json"));
    }

    #[test]
    fn test_html_body_stays_raw() {
        let resp = ApiResponse::from_parts(
            429,
            headers(&[("content-type", "text/html")]),
            b"<html>banned</html>",
        );
        assert_eq!(resp.body, ResponseBody::Text("<html>banned</html>".into()));
    }

    #[test]
    fn test_malformed_json_falls_back_to_text() {
        let resp =
            ApiResponse::from_parts(500, headers(&[("content-type", "application/json")]), b"{");
        assert!(matches!(resp.body, ResponseBody::Text(_)));
    }

    #[test]
    fn test_empty_body() {
        let resp = ApiResponse::from_parts(204, BTreeMap::new(), b"");
        assert_eq!(resp.body, ResponseBody::Empty);
        assert!(resp.is_success());
    }

    #[test]
    fn test_method_is_uppercased() {
        assert_eq!(RequestOptions::new("patch").method, "PATCH");
    }
}
