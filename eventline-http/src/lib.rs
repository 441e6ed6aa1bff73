//! Async HTTP client and server for the eventline runtime.
//!
//! The client multiplexes any number of concurrent transfers over one
//! event loop, exposing each response as a lazily streamed body with
//! flow control in both directions: a slow consumer pauses receiving, a
//! slow request-body producer pauses sending. The server accepts
//! requests, runs a user handler per connection, streams the returned
//! body chunk by chunk with write-drained acknowledgments, and shuts
//! down gracefully once in-flight connections drain.
//!
//! Cancellation is first-class on both sides: stop tokens abort
//! in-flight transfers and wake their awaiters with an interrupted
//! error; server shutdown chains into every per-connection stop source.
//!
//! # Client
//!
//! ```rust,ignore
//! use eventline::{EventLoop, StopToken};
//! use eventline_http::{HttpClient, HttpClientConfig, Request};
//!
//! let event_loop = EventLoop::new()?;
//! let client = HttpClient::new(&event_loop, HttpClientConfig::default());
//! event_loop.clone().spawn(async move {
//!     let mut response = client
//!         .fetch(Request::get("http://127.0.0.1:8080/"), StopToken::never())
//!         .await
//!         .unwrap();
//!     while let Some(chunk) = response.body.next_chunk().await.unwrap() {
//!         // process each chunk as it arrives
//!     }
//! });
//! event_loop.run()?;
//! ```
//!
//! # Server
//!
//! ```rust,ignore
//! use eventline_http::{body, HttpHandler, HttpServer, HttpServerConfig, Response};
//!
//! struct Hello;
//!
//! impl HttpHandler for Hello {
//!     fn handle(
//!         &self,
//!         _request: eventline_http::Request,
//!         _stop: eventline::StopToken,
//!     ) -> impl std::future::Future<
//!         Output = Result<Response<body::BoxBody>, eventline_http::HttpError>,
//!     > + 'static {
//!         async move {
//!             Ok(Response::new(200)
//!                 .with_header("content-type", "text/plain")
//!                 .with_body(body::body_from("hi")))
//!         }
//!     }
//! }
//!
//! let server = HttpServer::serve(&event_loop, &config, Hello)?;
//! ```

pub mod body;
mod altsvc;
mod client;
mod conn;
mod error;
mod metrics;
mod mux;
mod operation;
mod request;
mod response;
mod server;
mod streaming;
#[cfg(feature = "tls")]
pub mod tls;
mod transfer;
mod wire;

pub use body::{BoxBody, ChunkSource};
pub use client::{HttpClient, HttpClientConfig};
pub use error::HttpError;
pub use operation::FetchFuture;
pub use request::Request;
pub use response::Response;
pub use server::{HttpHandler, HttpServer, HttpServerConfig};
pub use streaming::BodyStream;
