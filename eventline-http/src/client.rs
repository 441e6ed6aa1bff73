//! Top-level HTTP client.

use std::path::PathBuf;

use eventline::{EventLoop, StopToken};

use crate::mux::Mux;
use crate::operation::FetchFuture;
use crate::request::Request;
use crate::transfer::TlsClientConfig;

/// Client configuration.
///
/// `cache_path` enables the alternate-services cache at
/// `<cache_path>/alt-svc.txt`; without it the client touches no disk.
/// With the `tls` feature, `tls` supplies a pre-built rustls client
/// config (peer verification is always on); `https` URLs are rejected
/// without one.
#[derive(Default)]
pub struct HttpClientConfig {
    pub cache_path: Option<PathBuf>,
    #[cfg(feature = "tls")]
    pub tls: Option<std::sync::Arc<rustls::ClientConfig>>,
}

/// An HTTP client multiplexing any number of concurrent fetches over a
/// shared event loop.
///
/// # Example
///
/// ```rust,ignore
/// let client = HttpClient::new(&event_loop, HttpClientConfig::default());
/// let response = client
///     .fetch(Request::get("http://127.0.0.1:8080/"), StopToken::never())
///     .await?;
/// assert_eq!(response.status, 200);
/// ```
pub struct HttpClient {
    mux: Mux,
}

impl HttpClient {
    pub fn new(event_loop: &EventLoop, config: HttpClientConfig) -> HttpClient {
        #[cfg(feature = "tls")]
        let tls: TlsClientConfig = config.tls;
        #[cfg(not(feature = "tls"))]
        let tls: TlsClientConfig = None;
        HttpClient {
            mux: Mux::new(event_loop.clone(), config.cache_path, tls),
        }
    }

    /// Execute `request`, resolving once response headers are complete
    /// (or the transfer fails). The response body streams lazily;
    /// cancellation via `stop_token` aborts the transfer and resumes the
    /// awaiter with an interrupted error.
    pub fn fetch(&self, request: Request, stop_token: StopToken) -> FetchFuture {
        self.mux.fetch(request, stop_token)
    }
}
