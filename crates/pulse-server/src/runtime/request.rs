//! Per-request data bridged into the script runtime.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable view of one in-flight HTTP request, plus the mutable response
/// state the script's host functions write into.
///
/// The dispatcher rebinds a fresh `Arc<RequestState>` into the context's
/// association entry before every handler invocation; host functions only
/// ever see the request currently bound to their own context.
pub struct RequestState {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub remote_ip: String,
    pub response: Mutex<ResponseState>,
}

/// Script-controlled response metadata; the body is the handler's return
/// value and never lives here.
pub struct ResponseState {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
        }
    }
}

impl RequestState {
    pub fn new(
        method: String,
        path: String,
        query: HashMap<String, String>,
        headers: HashMap<String, String>,
        body: String,
        remote_ip: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            method,
            path,
            query,
            headers,
            body,
            remote_ip,
            response: Mutex::new(ResponseState::default()),
        })
    }

    /// The exact-match route key handlers are registered under.
    pub fn route_key(&self) -> String {
        format!("{} {}", self.method, self.path)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        // HTTP header names are case-insensitive; they are stored
        // lowercased at capture time.
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(|v| v.as_str())
    }

    /// The client-facing host name, from the `Host` header.
    pub fn host(&self) -> &str {
        self.header("host").unwrap_or_default()
    }

    /// The front end only speaks plain HTTP/1.1.
    pub fn protocol(&self) -> &'static str {
        "http"
    }

    /// Field from an `application/x-www-form-urlencoded` body. Any other
    /// content type has no form fields.
    pub fn form_param(&self, name: &str) -> Option<String> {
        let content_type = self.header("content-type").unwrap_or_default();
        if !content_type.starts_with("application/x-www-form-urlencoded") {
            return None;
        }
        parse_pairs(&self.body).remove(name)
    }

    /// Value of one cookie from the `Cookie` request header.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.header("cookie")?
            .split(';')
            .filter_map(|part| part.trim().split_once('='))
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.to_string())
    }

    /// Names of every cookie the request carried.
    pub fn cookie_names(&self) -> Vec<String> {
        self.header("cookie")
            .map(|header| {
                header
                    .split(';')
                    .filter_map(|part| part.trim().split_once('='))
                    .map(|(name, _)| name.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Split a `name=value&name=value` string into pairs, as found in query
/// strings and form-encoded bodies. Values keep their raw encoding; a bare
/// name maps to the empty string.
pub(crate) fn parse_pairs(raw: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((name, value)) => pairs.insert(name.to_string(), value.to_string()),
            None => pairs.insert(pair.to_string(), String::new()),
        };
    }
    pairs
}
