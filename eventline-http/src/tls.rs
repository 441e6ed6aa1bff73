//! TLS client session pumped by the transfer's socket paths.
//!
//! The session wraps a rustls `ClientConnection`; the transfer feeds it
//! wire bytes and drains plaintext through the same pause-aware read
//! path it uses for cleartext sockets. Peer verification is always on —
//! the roots come from the user-supplied client config.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use socket2::Socket;

use crate::error::HttpError;
use crate::transfer::ReadStep;

pub(crate) struct TlsSession {
    pub(crate) connection: ClientConnection,
}

impl TlsSession {
    pub(crate) fn new(config: Arc<ClientConfig>, host: &str) -> Result<TlsSession, HttpError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| HttpError::Tls(format!("invalid server name: {host:?}")))?;
        let connection = ClientConnection::new(config, server_name)
            .map_err(|e| HttpError::Tls(e.to_string()))?;
        Ok(TlsSession { connection })
    }

    /// One read step: pull wire bytes, process records, and surface any
    /// plaintext into `buf`.
    pub(crate) fn read_step(
        &mut self,
        socket: &Socket,
        buf: &mut [u8],
    ) -> Result<ReadStep, HttpError> {
        let mut consumed_wire_bytes = false;
        match self.connection.read_tls(&mut &*socket) {
            Ok(0) => return Ok(ReadStep::Eof),
            Ok(_) => consumed_wire_bytes = true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // No wire bytes; there may still be buffered plaintext.
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        let state = self
            .connection
            .process_new_packets()
            .map_err(|e| HttpError::Tls(e.to_string()))?;

        match self.connection.reader().read(buf) {
            Ok(0) => Ok(ReadStep::Eof),
            Ok(n) => Ok(ReadStep::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if state.peer_has_closed() {
                    Ok(ReadStep::Eof)
                } else if consumed_wire_bytes {
                    // Handshake or record progress without plaintext; the
                    // caller loops until the socket would block.
                    Ok(ReadStep::Progress)
                } else {
                    Ok(ReadStep::Blocked)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Flush pending TLS records to the socket.
    pub(crate) fn flush(&mut self, socket: &Socket) -> Result<(), HttpError> {
        while self.connection.wants_write() {
            match self.connection.write_tls(&mut &*socket) {
                Ok(0) => return Err(HttpError::ConnectionClosed),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Build a client config from a PEM bundle of root certificates (the
/// root-CA blob option). Unparsable entries are skipped.
pub fn client_config_from_ca_pem(pem: &[u8]) -> Result<Arc<ClientConfig>, HttpError> {
    let mut reader = io::BufReader::new(pem);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| HttpError::Tls(format!("bad CA bundle: {e}")))?;
    if certs.is_empty() {
        return Err(HttpError::Tls("CA bundle contains no certificates".into()));
    }
    let mut roots = RootCertStore::empty();
    let (_added, _skipped) = roots.add_parsable_certificates(certs);
    if roots.is_empty() {
        return Err(HttpError::Tls("CA bundle contains no usable roots".into()));
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
