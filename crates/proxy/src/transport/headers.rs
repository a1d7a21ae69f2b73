//! Inbound header passthrough
//!
//! Each network transport kind forwards a fixed allow-list of headers from
//! the client request to the backend. Headers the client did not send are
//! left out entirely.

use std::fmt;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};

pub const MCP_SESSION_ID: &str = "mcp-session-id";
pub const LAST_EVENT_ID: &str = "last-event-id";

/// Headers forwarded to legacy SSE backends
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SseHeaders {
    pub authorization: Option<HeaderValue>,
}

impl SseHeaders {
    pub const ALLOW_LIST: &'static [&'static str] = &["authorization"];

    pub fn from_inbound(inbound: &HeaderMap) -> Self {
        let mut headers = Self::default();
        for name in Self::ALLOW_LIST {
            if let Some(value) = inbound.get(*name) {
                if *name == "authorization" {
                    headers.authorization = Some(value.clone());
                }
            }
        }
        headers
    }

    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        if let Some(value) = &self.authorization {
            map.insert(AUTHORIZATION, value.clone());
        }
        map
    }
}

/// Headers forwarded to streamable-HTTP backends
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StreamableHttpHeaders {
    pub authorization: Option<HeaderValue>,
    pub mcp_session_id: Option<HeaderValue>,
    pub last_event_id: Option<HeaderValue>,
}

impl StreamableHttpHeaders {
    pub const ALLOW_LIST: &'static [&'static str] =
        &["authorization", MCP_SESSION_ID, LAST_EVENT_ID];

    pub fn from_inbound(inbound: &HeaderMap) -> Self {
        let mut headers = Self::default();
        for name in Self::ALLOW_LIST {
            let Some(value) = inbound.get(*name) else {
                continue;
            };
            match *name {
                "authorization" => headers.authorization = Some(value.clone()),
                MCP_SESSION_ID => headers.mcp_session_id = Some(value.clone()),
                LAST_EVENT_ID => headers.last_event_id = Some(value.clone()),
                _ => {}
            }
        }
        headers
    }

    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        if let Some(value) = &self.authorization {
            map.insert(AUTHORIZATION, value.clone());
        }
        if let Some(value) = &self.mcp_session_id {
            map.insert(HeaderName::from_static(MCP_SESSION_ID), value.clone());
        }
        if let Some(value) = &self.last_event_id {
            map.insert(HeaderName::from_static(LAST_EVENT_ID), value.clone());
        }
        map
    }
}

/// `Bearer <token>` header value, or `None` if the token is not a valid header value
pub fn bearer_value(token: &str) -> Option<HeaderValue> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token)).ok()?;
    value.set_sensitive(true);
    Some(value)
}

/// Names of the present headers only; values are never rendered
fn present<'a>(fields: &[(&'a str, bool)]) -> Vec<&'a str> {
    fields
        .iter()
        .filter(|(_, present)| *present)
        .map(|(name, _)| *name)
        .collect()
}

impl fmt::Debug for SseHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseHeaders")
            .field(
                "present",
                &present(&[("authorization", self.authorization.is_some())]),
            )
            .finish()
    }
}

impl fmt::Debug for StreamableHttpHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamableHttpHeaders")
            .field(
                "present",
                &present(&[
                    ("authorization", self.authorization.is_some()),
                    (MCP_SESSION_ID, self.mcp_session_id.is_some()),
                    (LAST_EVENT_ID, self.last_event_id.is_some()),
                ]),
            )
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn inbound(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn test_sse_forwards_only_authorization() {
        let headers = SseHeaders::from_inbound(&inbound(&[
            ("authorization", "Bearer client"),
            ("mcp-session-id", "abc"),
            ("cookie", "secret"),
        ]));

        let map = headers.to_header_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(AUTHORIZATION).unwrap(), "Bearer client");
    }

    #[test]
    fn test_streamable_http_forwards_allow_list() {
        let headers = StreamableHttpHeaders::from_inbound(&inbound(&[
            ("authorization", "Bearer client"),
            ("mcp-session-id", "abc"),
            ("last-event-id", "42"),
            ("x-forwarded-for", "10.0.0.1"),
        ]));

        let map = headers.to_header_map();
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(MCP_SESSION_ID).unwrap(), "abc");
        assert_eq!(map.get(LAST_EVENT_ID).unwrap(), "42");
        assert!(map.get("x-forwarded-for").is_none());
    }

    #[test]
    fn test_absent_headers_are_omitted() {
        let headers = StreamableHttpHeaders::from_inbound(&inbound(&[("mcp-session-id", "abc")]));

        let map = headers.to_header_map();
        assert_eq!(map.len(), 1);
        assert!(!map.contains_key(AUTHORIZATION));
        assert!(!map.contains_key(LAST_EVENT_ID));
    }

    #[test]
    fn test_debug_never_renders_values() {
        let headers = SseHeaders::from_inbound(&inbound(&[("authorization", "Bearer top-secret")]));
        let rendered = format!("{:?}", headers);
        assert!(rendered.contains("authorization"));
        assert!(!rendered.contains("top-secret"));
    }

    #[test]
    fn test_bearer_value() {
        assert_eq!(bearer_value("tok").unwrap(), "Bearer tok");
        assert!(bearer_value("bad\ntoken").is_none());
    }
}
