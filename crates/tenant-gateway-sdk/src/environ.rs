//! Request environment handed to tenant applications

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Index;

/// Well-known environment keys
pub mod keys {
    pub const HTTP_HOST: &str = "HTTP_HOST";
    pub const SCRIPT_NAME: &str = "SCRIPT_NAME";
    pub const PATH_INFO: &str = "PATH_INFO";
    pub const QUERY_STRING: &str = "QUERY_STRING";
    pub const REQUEST_METHOD: &str = "REQUEST_METHOD";
    pub const CONTENT_TYPE: &str = "CONTENT_TYPE";
    pub const CONTENT_LENGTH: &str = "CONTENT_LENGTH";
    pub const REQUEST_ID: &str = "gateway.request_id";
}

/// An incoming request: a string mapping plus the raw request body.
///
/// # Example
/// ```ignore
/// let host = environ.get(keys::HTTP_HOST).unwrap_or("localhost");
/// let name = &environ[keys::SCRIPT_NAME];
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environ {
    /// CGI-style variables (`HTTP_HOST`, `PATH_INFO`, `HTTP_*` headers, ...)
    #[serde(default)]
    pub vars: HashMap<String, String>,

    /// Request body
    #[serde(skip)]
    pub input: Bytes,
}

impl Environ {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set a variable
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Builder pattern: set the request body
    pub fn with_input(mut self, input: impl Into<Bytes>) -> Self {
        self.input = input.into();
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Look up a request header by its HTTP name (`Content-Type`, `x-api-key`)
    pub fn header(&self, name: &str) -> Option<&str> {
        let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        self.get(&key)
    }

    /// Parse the body as JSON into a typed struct.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, crate::HandlerError> {
        serde_json::from_slice(&self.input)
            .map_err(|e| crate::HandlerError::BadRequest(format!("Invalid JSON: {}", e)))
    }
}

impl Index<&str> for Environ {
    type Output = str;

    /// Panics when the key is absent, like `HashMap` indexing.
    fn index(&self, key: &str) -> &str {
        &self.vars[key]
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environ {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            input: Bytes::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup() {
        let environ = Environ::new().with("HTTP_X_API_KEY", "secret");
        assert_eq!(environ.header("x-api-key"), Some("secret"));
        assert_eq!(environ.header("Authorization"), None);
    }

    #[test]
    fn test_json_body() {
        let environ = Environ::new().with_input(&b"{\"n\": 3}"[..]);
        let value: serde_json::Value = environ.json().unwrap();
        assert_eq!(value["n"], 3);

        let err = Environ::new().with_input("nope").json::<serde_json::Value>().unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
