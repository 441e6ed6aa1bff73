//! A single in-flight transfer: socket, wire state machine, request-body
//! pump, owner routing, and cancellation.
//!
//! Transport events dispatch to whichever owner currently holds the
//! transfer: the pending operation during header collection, or the live
//! body stream afterwards. The transition rebinds `owner` atomically on
//! the loop thread, so no empty state is needed.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use eventline::{FdWatch, Interest, Readiness, StopCallback, StopToken, UserEvent};
use socket2::{Domain, Protocol, Socket, Type};

use crate::body::BoxBody;
use crate::error::HttpError;
use crate::metrics;
use crate::operation::OperationShared;
use crate::request::{ParsedUrl, Request, Scheme};
use crate::streaming::{BodyShared, WriteOutcome};
use crate::wire::{self, BodyDecoder};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const OUT_HIGH_WATER: usize = 64 * 1024;
const BODY_READ_MAX: usize = 16 * 1024;
const MAX_HEAD: usize = 64 * 1024;
const READ_BUF: usize = 8 * 1024;

/// Client TLS configuration handed to each transfer. Without the `tls`
/// feature there is nothing to configure and the only value is `None`.
#[cfg(feature = "tls")]
pub(crate) type TlsClientConfig = Option<std::sync::Arc<rustls::ClientConfig>>;
#[cfg(not(feature = "tls"))]
pub(crate) type TlsClientConfig = Option<std::convert::Infallible>;

/// The currently-bound sink for transport callbacks.
#[derive(Clone)]
pub(crate) enum Owner {
    Operation(Rc<RefCell<OperationShared>>),
    Body(Rc<RefCell<BodyShared>>),
}

/// How the request body is presented to the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UploadMode {
    None,
    /// POST requests.
    Post,
    /// Any other method with a body.
    Upload,
}

pub(crate) enum ReadStep {
    Data(usize),
    Eof,
    Blocked,
    /// Wire bytes consumed without plaintext (TLS handshake traffic).
    #[cfg(feature = "tls")]
    Progress,
}

pub(crate) struct Transfer {
    pub(crate) id: usize,
    socket: Option<Socket>,
    pub(crate) fd: RawFd,
    connected: bool,
    pub(crate) deadline: Option<Instant>,
    method: String,

    // Outbound wire state.
    out: BytesMut,
    pub(crate) upload_mode: UploadMode,
    pub(crate) content_length: Option<u64>,
    pub(crate) chunked_upload: bool,
    has_body: bool,
    body_done: bool,

    // Request-body pump.
    pub(crate) body_source: Option<BoxBody>,
    current_chunk: Option<Bytes>,
    chunk_index: usize,
    chunk_positioned: bool,
    source_done: bool,
    send_paused: bool,
    pub(crate) next_chunk_event: Option<UserEvent>,

    // Inbound wire state.
    head_buf: BytesMut,
    head_done: bool,
    pub(crate) http_status: Option<u16>,
    decoder: Option<BodyDecoder>,
    undelivered: VecDeque<Bytes>,
    recv_paused: bool,
    response_complete: bool,
    pub(crate) alt_svc: Option<String>,
    pub(crate) origin: String,

    // Ownership and cancellation.
    pub(crate) owner: Owner,
    stop_token: StopToken,
    /// Cancellation subscription; held for RAII until the transfer
    /// is destroyed.
    pub(crate) _stop_callback: Option<StopCallback>,
    pub(crate) watch: Option<FdWatch>,
    last_interest: (bool, bool),
    pub(crate) completed: bool,

    #[cfg(feature = "tls")]
    tls: Option<crate::tls::TlsSession>,
}

impl Transfer {
    /// Configure the transfer synchronously: parse the URL, start the
    /// non-blocking connect, and serialize the request head. Watcher,
    /// stop-callback, and body-pump wiring is added at registration.
    pub(crate) fn new(
        request: Request,
        connect_override: Option<(String, u16)>,
        stop_token: StopToken,
        owner: Owner,
        tls_config: TlsClientConfig,
    ) -> Result<Transfer, HttpError> {
        let url = crate::request::parse_url(&request.url)?;
        let content_length = request.content_length()?;
        let has_body = request.body.is_some();
        let upload_mode = match (&request.body, request.method.as_str()) {
            (None, _) => UploadMode::None,
            (Some(_), "POST") => UploadMode::Post,
            (Some(_), _) => UploadMode::Upload,
        };
        let chunked_upload = has_body && content_length.is_none();

        #[cfg(feature = "tls")]
        let tls = match url.scheme {
            Scheme::Https => {
                let config = tls_config
                    .ok_or_else(|| HttpError::Tls("no TLS configuration provided".into()))?;
                Some(crate::tls::TlsSession::new(config, &url.host)?)
            }
            Scheme::Http => None,
        };
        #[cfg(not(feature = "tls"))]
        {
            let _ = tls_config;
            if url.scheme == Scheme::Https {
                return Err(HttpError::Protocol(
                    "https requires the `tls` feature".into(),
                ));
            }
        }

        let (connect_host, connect_port) = connect_override
            .unwrap_or_else(|| (url.host.clone(), url.port));
        let (socket, connected) = start_connect(&connect_host, connect_port)?;
        let fd = socket.as_raw_fd();

        let mut out = BytesMut::with_capacity(1024);
        encode_request_head(&request, &url, chunked_upload, &mut out);
        tracing::trace!(
            method = %request.method,
            origin = %url.origin(),
            mode = ?upload_mode,
            content_length = ?content_length,
            "transfer configured"
        );

        Ok(Transfer {
            id: usize::MAX,
            socket: Some(socket),
            fd,
            connected,
            deadline: Some(Instant::now() + CONNECT_TIMEOUT),
            method: request.method,
            out,
            upload_mode,
            content_length,
            chunked_upload,
            has_body,
            body_done: !has_body,
            body_source: request.body,
            current_chunk: None,
            chunk_index: 0,
            chunk_positioned: false,
            source_done: false,
            send_paused: false,
            next_chunk_event: None,
            head_buf: BytesMut::new(),
            head_done: false,
            http_status: None,
            decoder: None,
            undelivered: VecDeque::new(),
            recv_paused: false,
            response_complete: false,
            alt_svc: None,
            origin: url.origin(),
            owner,
            stop_token,
            _stop_callback: None,
            watch: None,
            last_interest: (false, false),
            completed: false,
            #[cfg(feature = "tls")]
            tls,
        })
    }

    /// Drive the transfer after a readiness event. Returns a completion
    /// message for the multiplexer when the transfer terminates.
    pub(crate) fn on_io(&mut self, readiness: Readiness) -> Option<Result<(), HttpError>> {
        if self.completed {
            return None;
        }
        // Progress poll: abort promptly once stop is requested, even if
        // the stop callback has not reached us.
        if self.stop_token.stop_requested() {
            return Some(Err(HttpError::Interrupted));
        }

        if !self.connected {
            if !readiness.writable {
                return None;
            }
            match self.finish_connect() {
                Ok(()) => {}
                Err(e) => return Some(Err(e)),
            }
        }

        if let Err(e) = self.flush_out() {
            return Some(Err(e));
        }
        if readiness.readable {
            if let Err(e) = self.fill_in() {
                return Some(Err(e));
            }
        }
        self.update_interest();
        self.completion()
    }

    /// Resume receiving after consumer back-pressure cleared. May return
    /// a deferred completion if the final bytes were pending delivery.
    pub(crate) fn unpause_recv(&mut self) -> Option<Result<(), HttpError>> {
        if self.completed {
            return None;
        }
        self.recv_paused = false;
        self.deliver_undelivered();
        self.update_interest();
        self.completion()
    }

    /// Resume sending after the body pump positioned the next chunk.
    pub(crate) fn unpause_send(&mut self) {
        if self.completed {
            return;
        }
        self.send_paused = false;
        self.update_interest();
    }

    /// Record the pump's result: the next chunk, or end of the sequence.
    pub(crate) fn position_chunk(&mut self, chunk: Option<Bytes>) {
        match chunk {
            Some(chunk) => self.current_chunk = Some(chunk),
            None => self.source_done = true,
        }
        self.chunk_index = 0;
        self.chunk_positioned = true;
        self.unpause_send();
    }

    /// Tear down the transfer's registrations after its outcome has been
    /// recorded. Idempotent.
    pub(crate) fn mark_completed(&mut self) {
        tracing::trace!(id = self.id, status = ?self.http_status, "transfer finished");
        self.completed = true;
        self.watch = None;
        self.deadline = None;
    }

    pub(crate) fn desired_interest(&self) -> Interest {
        let want_read = self.connected
            && !self.response_complete
            && !self.recv_paused
            && self.undelivered.is_empty();
        #[allow(unused_mut)]
        let mut want_write = !self.connected
            || !self.out.is_empty()
            || (self.has_body && !self.body_done && !self.send_paused);
        #[cfg(feature = "tls")]
        if let Some(tls) = &self.tls {
            if tls.connection.wants_write() {
                want_write = true;
            }
        }
        Interest {
            readable: want_read,
            writable: want_write,
            persist: true,
        }
    }

    pub(crate) fn set_watch(&mut self, watch: FdWatch) {
        let interest = self.desired_interest();
        self.last_interest = (interest.readable, interest.writable);
        self.watch = Some(watch);
    }

    fn completion(&self) -> Option<Result<(), HttpError>> {
        if !self.completed && self.response_complete && self.undelivered.is_empty() {
            Some(Ok(()))
        } else {
            None
        }
    }

    fn finish_connect(&mut self) -> Result<(), HttpError> {
        let socket = self.socket.as_ref().ok_or(HttpError::ConnectionClosed)?;
        if let Some(error) = socket.take_error()? {
            return Err(HttpError::Io(error));
        }
        self.connected = true;
        self.deadline = None;
        Ok(())
    }

    fn update_interest(&mut self) {
        let Some(watch) = &self.watch else { return };
        let interest = self.desired_interest();
        if (interest.readable, interest.writable) == self.last_interest {
            return;
        }
        self.last_interest = (interest.readable, interest.writable);
        if let Err(e) = watch.modify(interest) {
            tracing::warn!(fd = self.fd, error = %e, "failed to update socket interest");
        }
    }

    // ── Outbound path ───────────────────────────────────────────────

    fn flush_out(&mut self) -> Result<(), HttpError> {
        loop {
            while self.out.len() < OUT_HIGH_WATER
                && self.has_body
                && !self.body_done
                && !self.send_paused
            {
                self.produce_body_bytes();
            }
            if self.out.is_empty() {
                break;
            }
            match self.socket_write() {
                Ok(0) => return Err(HttpError::ConnectionClosed),
                Ok(n) => {
                    let _ = self.out.split_to(n);
                    metrics::BYTES_SENT.add(n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Fill `out` from the current request-body chunk. Mirrors the
    /// transport read callback: pause until the chunk is positioned,
    /// zero bytes at end-of-sequence.
    fn produce_body_bytes(&mut self) {
        if !self.chunk_positioned {
            self.send_paused = true;
            return;
        }
        match &self.current_chunk {
            None if self.source_done => {
                if self.chunked_upload {
                    self.out.extend_from_slice(wire::LAST_CHUNK);
                }
                self.body_done = true;
            }
            None => {
                self.send_paused = true;
            }
            Some(chunk) => {
                let len = chunk.len();
                let end = (self.chunk_index + BODY_READ_MAX).min(len);
                let piece = chunk.slice(self.chunk_index..end);
                if self.chunked_upload {
                    wire::encode_chunk(&piece, &mut self.out);
                } else {
                    self.out.extend_from_slice(&piece);
                }
                self.chunk_index = end;
                if self.chunk_index >= len {
                    // Chunk exhausted: request the next one and pause
                    // sending until the pump advances the sequence.
                    self.current_chunk = None;
                    self.chunk_positioned = false;
                    if let Some(event) = &self.next_chunk_event {
                        event.trigger();
                    }
                }
            }
        }
    }

    // ── Inbound path ────────────────────────────────────────────────

    fn fill_in(&mut self) -> Result<(), HttpError> {
        let mut buf = [0u8; READ_BUF];
        loop {
            if self.recv_paused || !self.undelivered.is_empty() || self.response_complete {
                break;
            }
            match self.socket_read(&mut buf)? {
                ReadStep::Data(n) => {
                    metrics::BYTES_RECEIVED.add(n as u64);
                    self.ingest(&buf[..n])?;
                }
                ReadStep::Eof => {
                    self.handle_eof()?;
                    break;
                }
                ReadStep::Blocked => break,
                #[cfg(feature = "tls")]
                ReadStep::Progress => {}
            }
        }
        #[cfg(feature = "tls")]
        self.flush_tls()?;
        Ok(())
    }

    fn handle_eof(&mut self) -> Result<(), HttpError> {
        if !self.head_done {
            return Err(HttpError::ConnectionClosed);
        }
        if let Some(decoder) = &mut self.decoder {
            decoder.finish()?;
            if decoder.is_complete() {
                self.response_complete = true;
            }
        }
        Ok(())
    }

    fn ingest(&mut self, data: &[u8]) -> Result<(), HttpError> {
        if !self.head_done {
            self.head_buf.extend_from_slice(data);
            self.process_head()?;
            return Ok(());
        }
        self.decode_body_bytes(data)
    }

    fn process_head(&mut self) -> Result<(), HttpError> {
        while !self.head_done {
            let Some(end) = wire::find_header_end(&self.head_buf) else {
                if self.head_buf.len() > MAX_HEAD {
                    return Err(HttpError::Protocol("response head too large".into()));
                }
                return Ok(());
            };
            let head_bytes = self.head_buf.split_to(end + 4);
            let head = wire::parse_response_head(&head_bytes[..end]).ok_or(HttpError::Parse)?;
            if (100..200).contains(&head.status) {
                // Interim response: discard and keep collecting. This is
                // the "status line resets the header list" rule.
                continue;
            }
            self.head_done = true;
            self.http_status = Some(head.status);
            self.alt_svc = head.alt_svc.clone();
            self.route_head(head.status, head.headers);
            let decoder = if head.chunked {
                BodyDecoder::chunked()
            } else if let Some(length) = head.content_length {
                BodyDecoder::sized(length)
            } else if matches!(head.status, 204 | 304) || self.method == "HEAD" {
                BodyDecoder::sized(0)
            } else {
                BodyDecoder::until_close()
            };
            if decoder.is_complete() {
                self.response_complete = true;
            }
            self.decoder = Some(decoder);
        }
        if !self.head_buf.is_empty() {
            let rest = self.head_buf.split_off(0).freeze();
            self.decode_body_bytes(&rest)?;
        }
        Ok(())
    }

    fn decode_body_bytes(&mut self, data: &[u8]) -> Result<(), HttpError> {
        let Some(decoder) = &mut self.decoder else {
            return Err(HttpError::Protocol("body bytes before head".into()));
        };
        let pieces = decoder.feed(data)?;
        self.undelivered.extend(pieces);
        if self.decoder.as_ref().is_some_and(BodyDecoder::is_complete) {
            self.response_complete = true;
        }
        self.deliver_undelivered();
        Ok(())
    }

    fn deliver_undelivered(&mut self) {
        while !self.recv_paused {
            let Some(chunk) = self.undelivered.pop_front() else {
                break;
            };
            match self.route_write(chunk.clone()) {
                WriteOutcome::Accepted => {}
                WriteOutcome::Pause => {
                    self.undelivered.push_front(chunk);
                    self.recv_paused = true;
                }
            }
        }
    }

    // ── Owner routing ───────────────────────────────────────────────

    fn route_head(&mut self, status: u16, headers: Vec<(String, String)>) {
        match &self.owner {
            Owner::Operation(operation) => {
                let mut op = operation.borrow_mut();
                op.status = Some(status);
                op.headers = headers;
            }
            Owner::Body(_) => {
                tracing::trace!("response head while body-owned; ignored");
            }
        }
    }

    fn route_write(&mut self, chunk: Bytes) -> WriteOutcome {
        match &self.owner {
            Owner::Operation(operation) => {
                let mut op = operation.borrow_mut();
                if !op.body_started {
                    op.body_started = true;
                    if let Some(event) = &op.headers_ready {
                        event.trigger();
                    }
                }
                op.body_buf.extend_from_slice(&chunk);
                WriteOutcome::Accepted
            }
            Owner::Body(shared) => shared.borrow_mut().write_chunk(chunk),
        }
    }

    // ── Socket I/O ──────────────────────────────────────────────────

    fn socket_write(&mut self) -> io::Result<usize> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        #[cfg(feature = "tls")]
        if let Some(tls) = &mut self.tls {
            let n = tls.connection.writer().write(&self.out)?;
            tls.flush(socket)?;
            return Ok(n);
        }
        (&*socket).write(&self.out)
    }

    fn socket_read(&mut self, buf: &mut [u8]) -> Result<ReadStep, HttpError> {
        let socket = self.socket.as_ref().ok_or(HttpError::ConnectionClosed)?;
        #[cfg(feature = "tls")]
        if let Some(tls) = &mut self.tls {
            return tls.read_step(socket, buf);
        }
        match (&*socket).read(buf) {
            Ok(0) => Ok(ReadStep::Eof),
            Ok(n) => Ok(ReadStep::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadStep::Blocked),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadStep::Blocked),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(feature = "tls")]
    fn flush_tls(&mut self) -> Result<(), HttpError> {
        if let (Some(tls), Some(socket)) = (&mut self.tls, self.socket.as_ref()) {
            tls.flush(socket)?;
        }
        Ok(())
    }
}

fn start_connect(host: &str, port: u16) -> Result<(Socket, bool), HttpError> {
    let address = (host, port)
        .to_socket_addrs()
        .map_err(HttpError::Io)?
        .next()
        .ok_or_else(|| HttpError::InvalidUrl(format!("{host}:{port}")))?;

    let domain = Domain::for_address(address);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;

    match socket.connect(&address.into()) {
        Ok(()) => Ok((socket, true)),
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock =>
        {
            Ok((socket, false))
        }
        Err(e) => Err(e.into()),
    }
}

fn encode_request_head(request: &Request, url: &ParsedUrl, chunked_upload: bool, out: &mut BytesMut) {
    out.extend_from_slice(request.method.as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(url.target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    if request.header_value("host").is_none() {
        out.extend_from_slice(b"host: ");
        out.extend_from_slice(url.authority().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    // One response per connection; no reuse.
    if request.header_value("connection").is_none() {
        out.extend_from_slice(b"connection: close\r\n");
    }
    if chunked_upload && request.header_value("transfer-encoding").is_none() {
        out.extend_from_slice(b"transfer-encoding: chunked\r\n");
    }

    for (name, value) in &request.headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}
