//! HTTP server: accepts requests on a bound socket, invokes the user
//! handler, streams the response body with per-chunk write-drained
//! acknowledgments, and coordinates graceful shutdown.
//!
//! Each connection serves one request/response cycle. Its cancellation
//! source is wired to peer-close detection and chained to the
//! server-wide stop source, so shutdown cancels in-flight handlers.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use eventline::{
    EventLoop, FdWatch, Interest, Signal, StopCallback, StopSource, StopToken, UserEvent,
};
use socket2::{Domain, Protocol, Socket, Type};

use crate::body::{self, BoxBody};
use crate::conn::ServerConn;
use crate::error::HttpError;
use crate::metrics;
use crate::request::Request;
use crate::response::Response;
use crate::wire;

/// A request handler. `handle` runs as its own task per connection; the
/// stop token cancels when the peer disconnects or the server shuts
/// down. `on_quit` runs after a graceful shutdown completes.
pub trait HttpHandler: 'static {
    fn handle(
        &self,
        request: Request,
        stop: StopToken,
    ) -> impl Future<Output = Result<Response<BoxBody>, HttpError>> + 'static;

    fn on_quit(&self) {}
}

/// Server configuration. The reserved path `/quit` triggers graceful
/// shutdown.
#[derive(Clone, Debug)]
pub struct HttpServerConfig {
    pub address: String,
    pub port: u16,
}

struct Listener {
    // Watch first: it must be deleted while the fd is still open.
    _watch: FdWatch,
    socket: Socket,
}

struct ServerInner<H> {
    event_loop: EventLoop,
    handler: H,
    listener: RefCell<Option<Listener>>,
    quitting: Cell<bool>,
    current_connections: Cell<u32>,
    stop_source: StopSource,
    quit_event: RefCell<Option<UserEvent>>,
    quit_signal: Signal,
    local_addr: SocketAddr,
}

/// An HTTP server bound to `{address, port}`.
pub struct HttpServer<H: HttpHandler> {
    inner: Rc<ServerInner<H>>,
}

impl<H: HttpHandler> HttpServer<H> {
    /// Bind the listening socket and start accepting requests.
    pub fn serve(
        event_loop: &EventLoop,
        config: &HttpServerConfig,
        handler: H,
    ) -> Result<HttpServer<H>, HttpError> {
        let ip: IpAddr = config
            .address
            .parse()
            .map_err(|_| HttpError::Protocol(format!("bad listen address: {:?}", config.address)))?;
        let address = SocketAddr::new(ip, config.port);

        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&address.into())?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| HttpError::Protocol("listener address unavailable".into()))?;

        let inner = Rc::new(ServerInner {
            event_loop: event_loop.clone(),
            handler,
            listener: RefCell::new(None),
            quitting: Cell::new(false),
            current_connections: Cell::new(0),
            stop_source: StopSource::new(),
            quit_event: RefCell::new(None),
            quit_signal: Signal::new(),
            local_addr,
        });

        let watch = event_loop.watch_fd(
            socket.as_raw_fd(),
            Interest {
                readable: true,
                writable: false,
                persist: true,
            },
            {
                let weak = Rc::downgrade(&inner);
                move |_| {
                    if let Some(inner) = weak.upgrade() {
                        accept_ready(&inner);
                    }
                }
            },
        )?;
        *inner.listener.borrow_mut() = Some(Listener {
            _watch: watch,
            socket,
        });

        let quit_event = event_loop.user_event({
            let weak = Rc::downgrade(&inner);
            move || {
                if let Some(inner) = weak.upgrade() {
                    // Free the listener, then release the shutdown waiter.
                    inner.listener.borrow_mut().take();
                    inner.quit_signal.notify();
                }
            }
        });
        *inner.quit_event.borrow_mut() = Some(quit_event);

        tracing::debug!(address = %local_addr, "http server listening");
        Ok(HttpServer { inner })
    }

    /// The bound address (useful when configured with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Graceful shutdown: stop accepting work, cancel in-flight handlers
    /// via the chained stop callbacks, wait for connections to drain,
    /// free the listener, then run the handler's `on_quit` hook.
    /// Idempotent; repeat calls resolve immediately.
    pub fn quit(&self) -> impl Future<Output = ()> + use<H> {
        do_quit(self.inner.clone())
    }
}

async fn do_quit<H: HttpHandler>(inner: Rc<ServerInner<H>>) {
    if inner.quitting.get() {
        return;
    }
    inner.quitting.set(true);
    inner.stop_source.request_stop();
    if inner.current_connections.get() == 0 {
        if let Some(event) = inner.quit_event.borrow().as_ref() {
            event.trigger();
        }
    }
    inner.quit_signal.wait().await;
    inner.handler.on_quit();
}

fn accept_ready<H: HttpHandler>(inner: &Rc<ServerInner<H>>) {
    loop {
        let accepted = {
            let listener = inner.listener.borrow();
            let Some(listener) = listener.as_ref() else {
                return;
            };
            listener.socket.accept()
        };
        match accepted {
            Ok((socket, _peer)) => {
                metrics::CONNECTIONS_ACCEPTED.increment();
                let inner = inner.clone();
                inner.event_loop.clone().spawn(async move {
                    serve_connection(inner, socket).await;
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

async fn serve_connection<H: HttpHandler>(inner: Rc<ServerInner<H>>, socket: Socket) {
    let conn = match ServerConn::new(&inner.event_loop, socket) {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(error = %e, "failed to set up connection");
            return;
        }
    };

    let request = match read_request(&conn).await {
        Ok(request) => request,
        Err(_) => {
            if !conn.is_closed() {
                write_simple(&conn, 400).await;
            }
            metrics::CONNECTIONS_CLOSED.increment();
            return;
        }
    };

    if inner.quitting.get() {
        write_simple(&conn, 500).await;
        metrics::CONNECTIONS_CLOSED.increment();
        return;
    }
    if request.url == "/quit" {
        write_simple(&conn, 200).await;
        metrics::CONNECTIONS_CLOSED.increment();
        do_quit(inner).await;
        return;
    }

    // Per-connection cancellation: fires on peer close, and chains from
    // the server-wide stop source.
    let conn_stop = Rc::new(StopSource::new());
    conn.set_close_hook({
        let stop = conn_stop.clone();
        move || {
            stop.request_stop();
        }
    });
    let _chain = StopCallback::new(&inner.stop_source.token(), {
        let stop = conn_stop.clone();
        move || {
            stop.request_stop();
        }
    });

    inner.current_connections.set(inner.current_connections.get() + 1);

    let reply_started = Cell::new(false);
    let result = handle_request(&inner, &conn, request, conn_stop.token(), &reply_started).await;
    if let Err(error) = result {
        if !reply_started.get() {
            write_simple(&conn, 500).await;
        } else {
            // The reply already started: abandon the connection without a
            // terminating trailer. The server itself keeps running.
            tracing::debug!(error = %error, "handler failed mid-reply; abandoning connection");
        }
    }

    conn.clear_close_hook();
    metrics::CONNECTIONS_CLOSED.increment();
    inner
        .current_connections
        .set(inner.current_connections.get() - 1);
    if inner.current_connections.get() == 0 && inner.quitting.get() {
        if let Some(event) = inner.quit_event.borrow().as_ref() {
            event.trigger();
        }
    }
}

async fn handle_request<H: HttpHandler>(
    inner: &Rc<ServerInner<H>>,
    conn: &ServerConn,
    request: Request,
    stop: StopToken,
    reply_started: &Cell<bool>,
) -> Result<(), HttpError> {
    let response = inner.handler.handle(request, stop).await?;

    let sized = response
        .headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("content-length"));
    let mut headers = response.headers;
    if !sized {
        headers.push(("transfer-encoding".into(), "chunked".into()));
    }
    if !headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("connection"))
    {
        headers.push(("connection".into(), "close".into()));
    }

    let mut head = BytesMut::new();
    wire::encode_response_head(response.status, &headers, &mut head);
    reply_started.set(true);
    conn.write(&head);

    let server_token = inner.stop_source.token();
    let mut response_body = response.body;
    loop {
        let chunk = match body::next_chunk(response_body.as_mut()).await {
            None => break,
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => return Err(e),
        };
        if chunk.is_empty() {
            continue;
        }
        if sized {
            conn.write(&chunk);
        } else {
            let mut frame = BytesMut::new();
            wire::encode_chunk(&chunk, &mut frame);
            conn.write(&frame);
        }
        if !await_drained(conn, &server_token).await {
            // Abandoned: the peer is gone or shutdown released us early
            // with bytes still queued.
            return Ok(());
        }
    }

    if !sized {
        conn.write(wire::LAST_CHUNK);
        await_drained(conn, &server_token).await;
    }
    Ok(())
}

/// Wait for the connection's write buffer to drain. A chained
/// stop-callback releases the wait early on server shutdown. Returns
/// false when the connection should be abandoned.
async fn await_drained(conn: &ServerConn, server_token: &StopToken) -> bool {
    let drained = Signal::new();
    conn.set_flush_signal(drained.clone());
    let _early = StopCallback::new(server_token, {
        let signal = drained.clone();
        move || signal.notify()
    });
    drained.wait().await;

    if conn.is_closed() {
        return false;
    }
    if server_token.stop_requested() && !conn.out_is_empty() {
        return false;
    }
    true
}

async fn write_simple(conn: &ServerConn, status: u16) {
    let headers = vec![
        ("content-length".to_string(), "0".to_string()),
        ("connection".to_string(), "close".to_string()),
    ];
    let mut head = BytesMut::new();
    wire::encode_response_head(status, &headers, &mut head);
    conn.write(&head);

    let drained = Signal::new();
    conn.set_flush_signal(drained.clone());
    drained.wait().await;
}

async fn read_request(conn: &ServerConn) -> Result<Request, HttpError> {
    let head = loop {
        if let Some(end) = conn.find_header_end() {
            let head_bytes = conn.split_to(end + 4);
            break wire::parse_request_head(&head_bytes[..end]).ok_or(HttpError::Parse)?;
        }
        if conn.is_closed() {
            return Err(HttpError::ConnectionClosed);
        }
        conn.fill().await;
    };

    let body_bytes = if let Some(length) = head.content_length {
        let mut collected = BytesMut::with_capacity(length.min(64 * 1024) as usize);
        while (collected.len() as u64) < length {
            let needed = (length - collected.len() as u64) as usize;
            let available = conn.buffered_len().min(needed);
            if available > 0 {
                collected.extend_from_slice(&conn.split_to(available));
            } else {
                if conn.is_closed() {
                    return Err(HttpError::ConnectionClosed);
                }
                conn.fill().await;
            }
        }
        collected.freeze()
    } else if head.chunked {
        let mut decoder = wire::BodyDecoder::chunked();
        let mut collected = BytesMut::new();
        while !decoder.is_complete() {
            let data = conn.split_all();
            if data.is_empty() {
                if conn.is_closed() {
                    return Err(HttpError::ConnectionClosed);
                }
                conn.fill().await;
                continue;
            }
            for piece in decoder.feed(&data)? {
                collected.extend_from_slice(&piece);
            }
        }
        collected.freeze()
    } else {
        Bytes::new()
    };

    let mut request = Request::new(head.method, head.target);
    request.headers = head.headers;
    if !body_bytes.is_empty() {
        request.body = Some(body::body_from(body_bytes));
    }
    Ok(request)
}
