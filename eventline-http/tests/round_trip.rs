//! Integration tests: client and server round trips on one event loop.
//!
//! Each test spawns the whole scenario as a task, runs the loop until it
//! drains, and asserts the scenario reached its end.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use bytes::Bytes;
use eventline::{EventLoop, Sleep, StopSource, StopToken};
use eventline_http::{
    body, BoxBody, ChunkSource, HttpClient, HttpClientConfig, HttpError, HttpHandler, HttpServer,
    HttpServerConfig, Request, Response,
};

fn server_config() -> HttpServerConfig {
    HttpServerConfig {
        address: "127.0.0.1".to_string(),
        port: 0,
    }
}

fn run_scenario(event_loop: EventLoop, done: Rc<Cell<bool>>) {
    event_loop.run().unwrap();
    assert!(done.get(), "scenario did not run to completion");
}

async fn wait_until(event_loop: &EventLoop, mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        event_loop.sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within bound");
}

// ── Test handlers and bodies ────────────────────────────────────────

/// Replies with fixed status, headers, and body chunks.
struct StaticHandler {
    status: u16,
    headers: Vec<(String, String)>,
    chunks: Vec<Bytes>,
}

impl StaticHandler {
    fn new(status: u16, headers: &[(&str, &str)], chunks: &[&str]) -> Self {
        StaticHandler {
            status,
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            chunks: chunks.iter().map(|c| Bytes::copy_from_slice(c.as_bytes())).collect(),
        }
    }
}

impl HttpHandler for StaticHandler {
    fn handle(
        &self,
        _request: Request,
        _stop: StopToken,
    ) -> impl Future<Output = Result<Response<BoxBody>, HttpError>> + 'static {
        let status = self.status;
        let headers = self.headers.clone();
        let chunks = self.chunks.clone();
        async move {
            let mut response = Response::new(status);
            for (name, value) in headers {
                response = response.with_header(name, value);
            }
            Ok(response.with_body(body::body_from_chunks(chunks)))
        }
    }
}

/// Records the request body it sees, then replies 200 with no body.
struct RecordingHandler {
    seen: Rc<RefCell<Option<String>>>,
}

impl HttpHandler for RecordingHandler {
    fn handle(
        &self,
        request: Request,
        _stop: StopToken,
    ) -> impl Future<Output = Result<Response<BoxBody>, HttpError>> + 'static {
        let seen = self.seen.clone();
        async move {
            let text = match request.body {
                Some(mut source) => {
                    let data = body::collect(source.as_mut()).await?;
                    String::from_utf8(data.to_vec()).unwrap()
                }
                None => String::new(),
            };
            *seen.borrow_mut() = Some(text);
            Ok(Response::new(200).with_header("content-length", "0"))
        }
    }
}

/// A body yielding chunks with a pause between them, so the consumer
/// side exercises real pacing.
struct PacedBody {
    chunks: std::collections::VecDeque<Bytes>,
    delay: Duration,
    event_loop: EventLoop,
    sleeping: Option<Pin<Box<Sleep>>>,
}

impl PacedBody {
    fn new(event_loop: EventLoop, chunks: &[Bytes], delay: Duration) -> Self {
        PacedBody {
            chunks: chunks.iter().cloned().collect(),
            delay,
            event_loop,
            sleeping: None,
        }
    }
}

impl ChunkSource for PacedBody {
    fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, HttpError>>> {
        if let Some(sleeping) = &mut self.sleeping {
            match sleeping.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => self.sleeping = None,
            }
        }
        match self.chunks.pop_front() {
            Some(chunk) => {
                if !self.chunks.is_empty() {
                    self.sleeping = Some(Box::pin(self.event_loop.sleep(self.delay)));
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            None => Poll::Ready(None),
        }
    }
}

/// Replies with a paced multi-chunk body.
struct PacedHandler {
    event_loop: EventLoop,
    chunks: Vec<Bytes>,
    delay: Duration,
}

impl HttpHandler for PacedHandler {
    fn handle(
        &self,
        _request: Request,
        _stop: StopToken,
    ) -> impl Future<Output = Result<Response<BoxBody>, HttpError>> + 'static {
        let event_loop = self.event_loop.clone();
        let chunks = self.chunks.clone();
        let delay = self.delay;
        async move {
            let paced = PacedBody::new(event_loop, &chunks, delay);
            Ok(Response::new(200).with_body(Box::new(paced) as BoxBody))
        }
    }
}

type Gate = Rc<RefCell<(bool, Option<Waker>)>>;

fn new_gate() -> Gate {
    Rc::new(RefCell::new((false, None)))
}

fn open_gate(gate: &Gate) {
    let waker = {
        let mut gate = gate.borrow_mut();
        gate.0 = true;
        gate.1.take()
    };
    if let Some(waker) = waker {
        waker.wake();
    }
}

/// A body that yields one chunk, then holds the connection open until
/// the gate opens.
struct GatedBody {
    first: Option<Bytes>,
    gate: Gate,
}

impl ChunkSource for GatedBody {
    fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, HttpError>>> {
        if let Some(chunk) = self.first.take() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        let mut gate = self.gate.borrow_mut();
        if gate.0 {
            Poll::Ready(None)
        } else {
            gate.1 = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Serves a long-lived gated response; records the shutdown hook.
struct GatedHandler {
    gate: Gate,
    quit_ran: Rc<Cell<bool>>,
}

impl HttpHandler for GatedHandler {
    fn handle(
        &self,
        _request: Request,
        _stop: StopToken,
    ) -> impl Future<Output = Result<Response<BoxBody>, HttpError>> + 'static {
        let gate = self.gate.clone();
        async move {
            let gated = GatedBody {
                first: Some(Bytes::from_static(b"first chunk bytes")),
                gate,
            };
            Ok(Response::new(200).with_body(Box::new(gated) as BoxBody))
        }
    }

    fn on_quit(&self) {
        self.quit_ran.set(true);
    }
}

/// A request-body producer that fails on its second chunk.
struct FailingBody {
    yielded: bool,
}

impl ChunkSource for FailingBody {
    fn poll_chunk(&mut self, _cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, HttpError>>> {
        if !self.yielded {
            self.yielded = true;
            Poll::Ready(Some(Ok(Bytes::from_static(b"first "))))
        } else {
            Poll::Ready(Some(Err(HttpError::Protocol("producer failed".into()))))
        }
    }
}

// ── Scenarios ───────────────────────────────────────────────────────

#[test]
fn simple_get_round_trip() {
    let event_loop = EventLoop::new().unwrap();
    let done = Rc::new(Cell::new(false));

    let el = event_loop.clone();
    let flag = done.clone();
    event_loop.spawn(async move {
        let handler = StaticHandler::new(200, &[("content-type", "text/plain")], &["hi"]);
        let server = HttpServer::serve(&el, &server_config(), handler).unwrap();
        let port = server.local_addr().port();

        let client = HttpClient::new(&el, HttpClientConfig::default());
        let mut response = client
            .fetch(
                Request::get(format!("http://127.0.0.1:{port}/")),
                StopToken::never(),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-type"), Some("text/plain"));

        let mut collected = Vec::new();
        while let Some(chunk) = response.body.next_chunk().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"hi");

        flag.set(true);
    });

    run_scenario(event_loop, done);
}

#[test]
fn response_header_names_lowercased_and_values_trimmed() {
    let event_loop = EventLoop::new().unwrap();
    let done = Rc::new(Cell::new(false));

    let el = event_loop.clone();
    let flag = done.clone();
    event_loop.spawn(async move {
        let handler = StaticHandler::new(200, &[("X-Custom-Header", "  spaced  ")], &["ok"]);
        let server = HttpServer::serve(&el, &server_config(), handler).unwrap();
        let port = server.local_addr().port();

        let client = HttpClient::new(&el, HttpClientConfig::default());
        let mut response = client
            .fetch(
                Request::get(format!("http://127.0.0.1:{port}/")),
                StopToken::never(),
            )
            .await
            .unwrap();

        assert!(response
            .headers
            .iter()
            .any(|(name, value)| name == "x-custom-header" && value == "spaced"));

        while response.body.next_chunk().await.unwrap().is_some() {}
        flag.set(true);
    });

    run_scenario(event_loop, done);
}

#[test]
fn empty_body_resolves_without_chunks() {
    let event_loop = EventLoop::new().unwrap();
    let done = Rc::new(Cell::new(false));

    let el = event_loop.clone();
    let flag = done.clone();
    event_loop.spawn(async move {
        let handler = StaticHandler::new(200, &[("content-length", "0")], &[]);
        let server = HttpServer::serve(&el, &server_config(), handler).unwrap();
        let port = server.local_addr().port();

        let client = HttpClient::new(&el, HttpClientConfig::default());
        let mut response = client
            .fetch(
                Request::get(format!("http://127.0.0.1:{port}/")),
                StopToken::never(),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert!(response.body.next_chunk().await.unwrap().is_none());
        flag.set(true);
    });

    run_scenario(event_loop, done);
}

#[test]
fn chunked_download_backpressure_bounds_buffering() {
    let event_loop = EventLoop::new().unwrap();
    let done = Rc::new(Cell::new(false));

    let el = event_loop.clone();
    let flag = done.clone();
    event_loop.spawn(async move {
        let chunk = Bytes::from_static(b"0123456789abcdef");
        let handler = PacedHandler {
            event_loop: el.clone(),
            chunks: vec![chunk.clone(), chunk.clone(), chunk.clone(), chunk.clone()],
            delay: Duration::from_millis(10),
        };
        let server = HttpServer::serve(&el, &server_config(), handler).unwrap();
        let port = server.local_addr().port();

        let client = HttpClient::new(&el, HttpClientConfig::default());
        let mut response = client
            .fetch(
                Request::get(format!("http://127.0.0.1:{port}/")),
                StopToken::never(),
            )
            .await
            .unwrap();

        let mut collected = Vec::new();
        let first = response.body.next_chunk().await.unwrap().unwrap();
        collected.extend_from_slice(&first);

        // Stall the consumer while the producer keeps sending. At most
        // one chunk may sit buffered; the transport is paused beyond it.
        el.sleep(Duration::from_millis(120)).await;
        assert!(
            response.body.buffered_byte_count() <= 16,
            "buffered {} bytes; back-pressure failed",
            response.body.buffered_byte_count()
        );

        while let Some(chunk) = response.body.next_chunk().await.unwrap() {
            assert!(response.body.buffered_byte_count() <= 16);
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected.len(), 64);
        assert_eq!(&collected[..16], b"0123456789abcdef");

        flag.set(true);
    });

    run_scenario(event_loop, done);
}

#[test]
fn streaming_upload_with_content_length() {
    let event_loop = EventLoop::new().unwrap();
    let done = Rc::new(Cell::new(false));

    let el = event_loop.clone();
    let flag = done.clone();
    event_loop.spawn(async move {
        let seen = Rc::new(RefCell::new(None));
        let handler = RecordingHandler { seen: seen.clone() };
        let server = HttpServer::serve(&el, &server_config(), handler).unwrap();
        let port = server.local_addr().port();

        let client = HttpClient::new(&el, HttpClientConfig::default());
        let request = Request::post(format!("http://127.0.0.1:{port}/upload"))
            .header("content-length", "11")
            .body(body::body_from_chunks(["hello ", "world"]));
        let response = client.fetch(request, StopToken::never()).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(seen.borrow().as_deref(), Some("hello world"));

        flag.set(true);
    });

    run_scenario(event_loop, done);
}

#[test]
fn streaming_upload_chunked_without_content_length() {
    let event_loop = EventLoop::new().unwrap();
    let done = Rc::new(Cell::new(false));

    let el = event_loop.clone();
    let flag = done.clone();
    event_loop.spawn(async move {
        let seen = Rc::new(RefCell::new(None));
        let handler = RecordingHandler { seen: seen.clone() };
        let server = HttpServer::serve(&el, &server_config(), handler).unwrap();
        let port = server.local_addr().port();

        let client = HttpClient::new(&el, HttpClientConfig::default());
        let request = Request::new("PUT", format!("http://127.0.0.1:{port}/upload"))
            .body(body::body_from_chunks(["chunk one, ", "chunk two"]));
        let response = client.fetch(request, StopToken::never()).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(seen.borrow().as_deref(), Some("chunk one, chunk two"));

        flag.set(true);
    });

    run_scenario(event_loop, done);
}

#[test]
fn cancellation_mid_response_interrupts_and_releases_watchers() {
    let event_loop = EventLoop::new().unwrap();
    let done = Rc::new(Cell::new(false));

    let el = event_loop.clone();
    let flag = done.clone();
    event_loop.spawn(async move {
        // A large paced response: 64 chunks of 16 KiB.
        let chunk = Bytes::from(vec![0x5a; 16 * 1024]);
        let handler = PacedHandler {
            event_loop: el.clone(),
            chunks: vec![chunk; 64],
            delay: Duration::from_millis(5),
        };
        let server = HttpServer::serve(&el, &server_config(), handler).unwrap();
        let port = server.local_addr().port();

        let client = HttpClient::new(&el, HttpClientConfig::default());
        let source = Rc::new(StopSource::new());
        let mut response = client
            .fetch(
                Request::get(format!("http://127.0.0.1:{port}/")),
                source.token(),
            )
            .await
            .unwrap();

        let first = response.body.next_chunk().await.unwrap();
        assert!(first.is_some());

        source.request_stop();

        // Buffered chunks may drain first; the interrupted error then
        // surfaces, strictly after every delivered byte.
        let error = loop {
            match response.body.next_chunk().await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("stream closed cleanly despite cancellation"),
                Err(error) => break error,
            }
        };
        assert!(error.is_interrupted(), "unexpected error: {error}");

        drop(response);

        // Once the server notices the dead connection, only the listener
        // watcher remains registered.
        wait_until(&el, || el.watcher_count() <= 1).await;

        flag.set(true);
    });

    run_scenario(event_loop, done);
}

#[test]
fn cancellation_before_response_resolves_with_interrupted() {
    let event_loop = EventLoop::new().unwrap();
    let done = Rc::new(Cell::new(false));

    let el = event_loop.clone();
    let flag = done.clone();
    event_loop.spawn(async move {
        let gate = new_gate();
        let handler = GatedHandler {
            gate: gate.clone(),
            quit_ran: Rc::new(Cell::new(false)),
        };
        let server = HttpServer::serve(&el, &server_config(), handler).unwrap();
        let port = server.local_addr().port();

        let client = HttpClient::new(&el, HttpClientConfig::default());
        let source = Rc::new(StopSource::new());
        let fetch = client.fetch(
            Request::get(format!("http://127.0.0.1:{port}/")),
            source.token(),
        );

        el.post({
            let source = source.clone();
            move || {
                source.request_stop();
            }
        });

        let result = fetch.await;
        assert!(matches!(result, Err(HttpError::Interrupted)));

        open_gate(&gate);
        flag.set(true);
    });

    run_scenario(event_loop, done);
}

#[test]
fn error_mid_upload_propagates_to_the_awaiter() {
    let event_loop = EventLoop::new().unwrap();
    let done = Rc::new(Cell::new(false));

    let el = event_loop.clone();
    let flag = done.clone();
    event_loop.spawn(async move {
        let seen = Rc::new(RefCell::new(None));
        let handler = RecordingHandler { seen: seen.clone() };
        let server = HttpServer::serve(&el, &server_config(), handler).unwrap();
        let port = server.local_addr().port();

        let client = HttpClient::new(&el, HttpClientConfig::default());
        let request = Request::post(format!("http://127.0.0.1:{port}/upload"))
            .body(Box::new(FailingBody { yielded: false }) as BoxBody);
        let result = client.fetch(request, StopToken::never()).await;

        match result {
            Err(HttpError::Protocol(message)) => assert_eq!(message, "producer failed"),
            Err(other) => panic!("expected the producer error, got {other}"),
            Ok(response) => panic!("expected the producer error, got status {}", response.status),
        }

        // The transfer is gone; only the listener (and possibly the
        // server's dying connection) remain.
        wait_until(&el, || el.watcher_count() <= 1).await;
        flag.set(true);
    });

    run_scenario(event_loop, done);
}

#[test]
fn shutdown_waits_for_active_connection_and_rejects_new_ones() {
    let event_loop = EventLoop::new().unwrap();
    let done = Rc::new(Cell::new(false));

    let el = event_loop.clone();
    let flag = done.clone();
    event_loop.spawn(async move {
        let gate = new_gate();
        let quit_ran = Rc::new(Cell::new(false));
        let handler = GatedHandler {
            gate: gate.clone(),
            quit_ran: quit_ran.clone(),
        };
        let server = HttpServer::serve(&el, &server_config(), handler).unwrap();
        let port = server.local_addr().port();

        let client = Rc::new(HttpClient::new(&el, HttpClientConfig::default()));

        // A long-lived response holds a connection open.
        let got_first = Rc::new(Cell::new(false));
        let long_done = Rc::new(Cell::new(false));
        el.spawn({
            let client = client.clone();
            let got_first = got_first.clone();
            let long_done = long_done.clone();
            let url = format!("http://127.0.0.1:{port}/long");
            async move {
                let mut response = client
                    .fetch(Request::get(url), StopToken::never())
                    .await
                    .unwrap();
                let first = response.body.next_chunk().await.unwrap();
                assert!(first.is_some());
                got_first.set(true);
                while let Ok(Some(_)) = response.body.next_chunk().await {}
                long_done.set(true);
            }
        });

        wait_until(&el, || got_first.get()).await;

        // GET /quit starts the graceful shutdown and replies 200.
        let quit_response = client
            .fetch(
                Request::get(format!("http://127.0.0.1:{port}/quit")),
                StopToken::never(),
            )
            .await
            .unwrap();
        assert_eq!(quit_response.status, 200);

        // Shutdown must not complete while the connection is live.
        el.sleep(Duration::from_millis(50)).await;
        assert!(!quit_ran.get());

        // New connections are refused with 500 once shutdown began.
        let refused = client
            .fetch(
                Request::get(format!("http://127.0.0.1:{port}/late")),
                StopToken::never(),
            )
            .await
            .unwrap();
        assert_eq!(refused.status, 500);

        // Let the long response finish; shutdown then drains.
        open_gate(&gate);
        wait_until(&el, || quit_ran.get()).await;
        wait_until(&el, || long_done.get()).await;

        // A second quit is a no-op that resolves immediately.
        server.quit().await;

        flag.set(true);
    });

    run_scenario(event_loop, done);
}
