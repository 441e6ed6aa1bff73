//! Response model, shared by the client (streaming body) and server
//! handlers (producer body).

use crate::body::BoxBody;
use crate::streaming::BodyStream;

/// An HTTP response with a body of type `B`.
///
/// Client fetches yield `Response<BodyStream>` with header names
/// lowercased and values whitespace-trimmed. Server handlers return
/// `Response<BoxBody>`, whose chunks are streamed to the peer one write
/// at a time.
pub struct Response<B = BodyStream> {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: B,
}

impl<B> Response<B> {
    /// Get the first header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl Response<BoxBody> {
    /// Build a handler response.
    pub fn new(status: u16) -> Self {
        Response {
            status,
            headers: Vec::new(),
            body: crate::body::empty_body(),
        }
    }

    /// Append a response header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the response body.
    pub fn with_body(mut self, body: BoxBody) -> Self {
        self.body = body;
        self
    }
}
