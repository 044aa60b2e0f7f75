//! Request and response values exchanged between the host, the cache and the network.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// HTTP method of an intercepted request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  #[default]
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
      Method::Options => "OPTIONS",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      "OPTIONS" => Ok(Method::Options),
      other => Err(format!("unsupported method: {}", other)),
    }
  }
}

/// A request as seen by the worker. Header names are stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
  #[serde(default)]
  pub method: Method,
  pub url: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: Method::Get,
      url: url.into(),
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn post_json(url: impl Into<String>, body: &serde_json::Value) -> Self {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    Self {
      method: Method::Post,
      url: url.into(),
      headers,
      body: Some(body.to_string().into_bytes()),
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// Whether the caller expects an HTML document (navigation-style request).
  pub fn accepts_html(&self) -> bool {
    self
      .header("accept")
      .map(|accept| accept.contains("text/html"))
      .unwrap_or(false)
  }
}

/// How a response body is carried inside a JSON reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
  Utf8,
  Base64,
}

/// A response, either fresh from the network, read back from a partition, or synthesized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), content_type.to_string());
    Self {
      status,
      headers,
      body: body.into(),
    }
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self::new(status, "application/json", value.to_string())
  }

  pub fn html(status: u16, document: impl Into<String>) -> Self {
    Self::new(status, "text/html; charset=utf-8", document.into())
  }

  /// Only a plain 200 is considered cacheable.
  pub fn is_ok(&self) -> bool {
    self.status == 200
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// Media types whose bodies are never sent as text, even if they decode as UTF-8.
  fn is_binary(&self) -> bool {
    self
      .header("content-type")
      .map(|ct| {
        let ct = ct.trim().to_ascii_lowercase();
        (ct.starts_with("image/") && !ct.starts_with("image/svg"))
          || ct.starts_with("audio/")
          || ct.starts_with("video/")
          || ct.starts_with("font/")
          || ct.starts_with("application/octet-stream")
      })
      .unwrap_or(false)
  }

  /// Body as a JSON-safe string. Text stays readable; anything else is base64.
  pub fn encoded_body(&self) -> (BodyEncoding, String) {
    if !self.is_binary() {
      if let Ok(text) = std::str::from_utf8(&self.body) {
        return (BodyEncoding::Utf8, text.to_string());
      }
    }
    (BodyEncoding::Base64, BASE64.encode(&self.body))
  }

  #[cfg(test)]
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}
