//! HTTP/1.1 wire codec: head parsing and serialization, chunked transfer
//! framing, and incremental body decoding, shared by client and server.

use bytes::{Bytes, BytesMut};

use crate::error::HttpError;

/// Find the position of `\r\n\r\n` in data, returning the index of the
/// first `\r`.
pub(crate) fn find_header_end(data: &[u8]) -> Option<usize> {
    (0..data.len().saturating_sub(3)).find(|&i| {
        data[i] == b'\r' && data[i + 1] == b'\n' && data[i + 2] == b'\r' && data[i + 3] == b'\n'
    })
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    (0..data.len().saturating_sub(1)).find(|&i| data[i] == b'\r' && data[i + 1] == b'\n')
}

/// A parsed response head (status line plus headers, before `\r\n\r\n`).
///
/// Header names are lowercased and values whitespace-trimmed, which is
/// the shape the client hands to its caller.
pub(crate) struct ResponseHead {
    pub(crate) status: u16,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) content_length: Option<u64>,
    pub(crate) chunked: bool,
    pub(crate) alt_svc: Option<String>,
}

pub(crate) fn parse_response_head(data: &[u8]) -> Option<ResponseHead> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.split("\r\n");

    // Status line: HTTP/1.1 200 OK
    let status_line = lines.next()?;
    if !status_line.starts_with("HTTP") {
        return None;
    }
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next()?;
    let status: u16 = parts.next()?.parse().ok()?;
    if !(100..=599).contains(&status) {
        return None;
    }

    let mut headers = Vec::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut alt_svc = None;

    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().to_string();

        if name == "content-length" {
            content_length = value.parse().ok();
        }
        if name == "transfer-encoding" && value.eq_ignore_ascii_case("chunked") {
            chunked = true;
        }
        if name == "alt-svc" {
            alt_svc = Some(value.clone());
        }

        headers.push((name, value));
    }

    Some(ResponseHead {
        status,
        headers,
        content_length,
        chunked,
        alt_svc,
    })
}

/// A parsed request head (request line plus headers).
///
/// Header names and values are kept as received, in wire order.
pub(crate) struct RequestHead {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) content_length: Option<u64>,
    pub(crate) chunked: bool,
}

pub(crate) fn parse_request_head(data: &[u8]) -> Option<RequestHead> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.split("\r\n");

    // Request line: GET /path HTTP/1.1
    let request_line = lines.next()?;
    let mut parts = request_line.splitn(3, ' ');
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    let version = parts.next()?;
    if method.is_empty() || target.is_empty() || !version.starts_with("HTTP/") {
        return None;
    }

    let mut headers = Vec::new();
    let mut content_length = None;
    let mut chunked = false;

    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().ok();
        }
        if name.eq_ignore_ascii_case("transfer-encoding") && value.eq_ignore_ascii_case("chunked") {
            chunked = true;
        }

        headers.push((name.to_string(), value.to_string()));
    }

    Some(RequestHead {
        method,
        target,
        headers,
        content_length,
        chunked,
    })
}

/// Append one chunked-transfer frame for `data` to `out`. Empty input is
/// skipped: a zero-length frame is the body terminator.
pub(crate) fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// The chunked-body terminator frame.
pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

enum ChunkStep<'a> {
    Complete {
        data: &'a [u8],
        consumed: usize,
        is_last: bool,
    },
    NeedMore,
    Invalid,
}

/// Decode one chunk from chunked transfer encoding.
fn decode_chunk(data: &[u8]) -> ChunkStep<'_> {
    // Chunk size line: <hex>[;ext]\r\n
    let crlf = match find_crlf(data) {
        Some(pos) => pos,
        None => {
            // Bound the size line so garbage cannot grow without limit.
            if data.len() > 64 {
                return ChunkStep::Invalid;
            }
            return ChunkStep::NeedMore;
        }
    };

    let size_str = match std::str::from_utf8(&data[..crlf]) {
        Ok(s) => s.trim(),
        Err(_) => return ChunkStep::Invalid,
    };
    let size_hex = size_str.split(';').next().unwrap_or("").trim();
    let size = match u64::from_str_radix(size_hex, 16) {
        Ok(s) => s as usize,
        Err(_) => return ChunkStep::Invalid,
    };

    if size == 0 {
        // Last chunk: size line, then the terminating CRLF.
        let total = crlf + 4;
        if data.len() < total {
            // Accept a bare "0\r\n" from peers that never send trailers
            // only once the final CRLF arrives.
            return ChunkStep::NeedMore;
        }
        return ChunkStep::Complete {
            data: &[],
            consumed: total,
            is_last: true,
        };
    }

    let chunk_start = crlf + 2;
    let chunk_end = chunk_start + size;
    let total = chunk_end + 2; // trailing \r\n
    if data.len() < total {
        return ChunkStep::NeedMore;
    }

    ChunkStep::Complete {
        data: &data[chunk_start..chunk_end],
        consumed: total,
        is_last: false,
    }
}

enum Framing {
    Sized { remaining: u64 },
    Chunked { partial: BytesMut },
    UntilClose,
}

/// Incremental message-body decoder. Feed it raw wire bytes; it yields
/// decoded body pieces and reports completion.
pub(crate) struct BodyDecoder {
    framing: Framing,
    complete: bool,
}

impl BodyDecoder {
    pub(crate) fn sized(length: u64) -> Self {
        BodyDecoder {
            framing: Framing::Sized { remaining: length },
            complete: length == 0,
        }
    }

    pub(crate) fn chunked() -> Self {
        BodyDecoder {
            framing: Framing::Chunked {
                partial: BytesMut::new(),
            },
            complete: false,
        }
    }

    /// Body delimited by connection close (no framing on the wire).
    pub(crate) fn until_close() -> Self {
        BodyDecoder {
            framing: Framing::UntilClose,
            complete: false,
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    /// Feed raw bytes, returning decoded body pieces. Bytes past the end
    /// of a sized or chunked body are ignored.
    pub(crate) fn feed(&mut self, data: &[u8]) -> Result<Vec<Bytes>, HttpError> {
        let mut pieces = Vec::new();
        match &mut self.framing {
            Framing::Sized { remaining } => {
                if self.complete {
                    return Ok(pieces);
                }
                let take = (*remaining).min(data.len() as u64) as usize;
                if take > 0 {
                    pieces.push(Bytes::copy_from_slice(&data[..take]));
                    *remaining -= take as u64;
                }
                if *remaining == 0 {
                    self.complete = true;
                }
            }
            Framing::Chunked { partial } => {
                if self.complete {
                    return Ok(pieces);
                }
                partial.extend_from_slice(data);
                loop {
                    match decode_chunk(partial) {
                        ChunkStep::Complete {
                            data,
                            consumed,
                            is_last,
                        } => {
                            if !data.is_empty() {
                                pieces.push(Bytes::copy_from_slice(data));
                            }
                            let _ = partial.split_to(consumed);
                            if is_last {
                                self.complete = true;
                                break;
                            }
                        }
                        ChunkStep::NeedMore => break,
                        ChunkStep::Invalid => return Err(HttpError::Parse),
                    }
                }
            }
            Framing::UntilClose => {
                if !data.is_empty() {
                    pieces.push(Bytes::copy_from_slice(data));
                }
            }
        }
        Ok(pieces)
    }

    /// Signal end of input. Returns an error if the body was framed and
    /// incomplete.
    pub(crate) fn finish(&mut self) -> Result<(), HttpError> {
        match self.framing {
            Framing::UntilClose => {
                self.complete = true;
                Ok(())
            }
            _ if self.complete => Ok(()),
            _ => Err(HttpError::ConnectionClosed),
        }
    }
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Serialize a response head. Headers are written in the order given.
pub(crate) fn encode_response_head(
    status: u16,
    headers: &[(String, String)],
    out: &mut BytesMut,
) {
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status)).as_bytes());
    for (name, value) in headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_response() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n";
        let head = parse_response_head(data).unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.content_length, Some(5));
        assert!(!head.chunked);
        assert_eq!(head.headers.len(), 1);
        // Names lowercased on the client side.
        assert_eq!(head.headers[0].0, "content-length");
    }

    #[test]
    fn response_header_values_are_trimmed() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Type:   text/plain  \r\n";
        let head = parse_response_head(data).unwrap();
        assert_eq!(head.headers[0], ("content-type".into(), "text/plain".into()));
    }

    #[test]
    fn parse_chunked_response() {
        let data = b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n";
        let head = parse_response_head(data).unwrap();
        assert!(head.chunked);
        assert_eq!(head.content_length, None);
    }

    #[test]
    fn parse_response_rejects_garbage() {
        assert!(parse_response_head(b"NOPE 200\r\n").is_none());
        assert!(parse_response_head(b"HTTP/1.1 999 Weird\r\n").is_none());
    }

    #[test]
    fn parse_request_preserves_header_case_and_order() {
        let data = b"POST /upload HTTP/1.1\r\nHost: example\r\nX-First: 1\r\nX-Second: 2\r\n";
        let head = parse_request_head(data).unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "/upload");
        assert_eq!(head.headers[0].0, "Host");
        assert_eq!(head.headers[1], ("X-First".into(), "1".into()));
        assert_eq!(head.headers[2], ("X-Second".into(), "2".into()));
    }

    #[test]
    fn find_header_end_found() {
        let data = b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\nbody";
        assert_eq!(find_header_end(data), Some(34));
    }

    #[test]
    fn find_header_end_not_found() {
        let data = b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n";
        assert_eq!(find_header_end(data), None);
    }

    #[test]
    fn chunk_round_trip() {
        let mut out = BytesMut::new();
        encode_chunk(b"hello", &mut out);
        encode_chunk(b" world", &mut out);
        out.extend_from_slice(LAST_CHUNK);

        let mut decoder = BodyDecoder::chunked();
        let pieces = decoder.feed(&out).unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(&pieces[0][..], b"hello");
        assert_eq!(&pieces[1][..], b" world");
        assert!(decoder.is_complete());
    }

    #[test]
    fn chunked_decoder_handles_split_input() {
        let mut decoder = BodyDecoder::chunked();
        let wire = b"5\r\nhello\r\n0\r\n\r\n";
        let mut collected = Vec::new();
        for byte in wire.iter() {
            for piece in decoder.feed(std::slice::from_ref(byte)).unwrap() {
                collected.extend_from_slice(&piece);
            }
        }
        assert_eq!(collected, b"hello");
        assert!(decoder.is_complete());
    }

    #[test]
    fn chunked_decoder_rejects_bad_size() {
        let mut decoder = BodyDecoder::chunked();
        assert!(decoder.feed(b"zz\r\nhello\r\n").is_err());
    }

    #[test]
    fn sized_decoder_ignores_extra_bytes() {
        let mut decoder = BodyDecoder::sized(4);
        let pieces = decoder.feed(b"bodyextra").unwrap();
        assert_eq!(pieces.len(), 1);
        assert_eq!(&pieces[0][..], b"body");
        assert!(decoder.is_complete());
    }

    #[test]
    fn zero_length_sized_body_is_complete_immediately() {
        let decoder = BodyDecoder::sized(0);
        assert!(decoder.is_complete());
    }

    #[test]
    fn until_close_completes_on_finish() {
        let mut decoder = BodyDecoder::until_close();
        let pieces = decoder.feed(b"data").unwrap();
        assert_eq!(pieces.len(), 1);
        assert!(!decoder.is_complete());
        decoder.finish().unwrap();
        assert!(decoder.is_complete());
    }

    #[test]
    fn incomplete_sized_body_errors_on_finish() {
        let mut decoder = BodyDecoder::sized(10);
        decoder.feed(b"short").unwrap();
        assert!(decoder.finish().is_err());
    }

    #[test]
    fn response_head_serialization() {
        let mut out = BytesMut::new();
        let headers = vec![("content-type".to_string(), "text/plain".to_string())];
        encode_response_head(200, &headers, &mut out);
        assert_eq!(
            &out[..],
            b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\n\r\n"
        );
    }
}
