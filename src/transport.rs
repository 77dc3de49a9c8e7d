//! Byte-stream transports beneath a connection
//!
//! Accepted URIs: `ldap://host[:port]` (default 389), `ldaps://host[:port]` (default 636) and
//! `ldapi://percent-encoded-path` (Unix domain socket). StartTLS and `ldaps` wrap the TCP
//! stream in rustls; the wrapped stream still splits into independently usable read and write
//! halves so the connection's reader thread and writers do not serialise each other. The raw
//! socket read is performed outside the TLS session lock.

use crate::error::Error;
#[cfg(unix)]
use percent_encoding::percent_decode_str;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(unix)]
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use url::Url;

pub const LDAP_PORT: u16 = 389;
pub const LDAPS_PORT: u16 = 636;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ldap,
    Ldaps,
    Ldapi,
}

/// A parsed LDAP URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapUri {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    #[cfg(unix)]
    pub socket_path: Option<PathBuf>,
}

impl FromStr for LdapUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if let Some(rest) = s.strip_prefix("ldapi://") {
            #[cfg(not(unix))]
            {
                let _ = rest;
                return Err(Error::InvalidUri(
                    "ldapi is only available on Unix".to_string(),
                ));
            }
            #[cfg(unix)]
            {
                let encoded = rest.split('/').next().unwrap_or("");
                if encoded.is_empty() {
                    return Err(Error::InvalidUri("empty socket path".to_string()));
                }
                let path = percent_decode_str(encoded)
                    .decode_utf8()
                    .map_err(|_| Error::InvalidUri(s.to_string()))?;
                return Ok(LdapUri {
                    scheme: Scheme::Ldapi,
                    host: "localhost".to_string(),
                    port: 0,
                    socket_path: Some(PathBuf::from(path.as_ref())),
                });
            }
        }
        let url = Url::parse(s).map_err(|e| Error::InvalidUri(format!("{}: {}", s, e)))?;
        let (scheme, default_port) = match url.scheme() {
            "ldap" => (Scheme::Ldap, LDAP_PORT),
            "ldaps" => (Scheme::Ldaps, LDAPS_PORT),
            other => {
                return Err(Error::InvalidUri(format!("unsupported scheme {}", other)));
            }
        };
        let host = url
            .host_str()
            .unwrap_or("localhost")
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        Ok(LdapUri {
            scheme,
            host,
            port: url.port().unwrap_or(default_port),
            #[cfg(unix)]
            socket_path: None,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// TLS client configuration trusting the platform certificate store.
pub fn default_tls_config() -> Result<Arc<ClientConfig>, Error> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        log::warn!("native certificate store: {}", error);
    }
    roots.add_parsable_certificates(native.certs);
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// An established byte stream to the server.
#[derive(Debug)]
pub enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Tls(TlsStream),
}

impl Transport {
    /// Connect per the URI scheme; `ldaps` performs the TLS handshake before returning.
    pub fn connect(
        uri: &LdapUri,
        timeout: Option<Duration>,
        tls_config: Option<Arc<ClientConfig>>,
    ) -> Result<Transport, Error> {
        match uri.scheme {
            #[cfg(unix)]
            Scheme::Ldapi => {
                let path = uri
                    .socket_path
                    .as_ref()
                    .ok_or_else(|| Error::InvalidUri("missing socket path".to_string()))?;
                Ok(Transport::Unix(UnixStream::connect(path)?))
            }
            #[cfg(not(unix))]
            Scheme::Ldapi => Err(Error::InvalidUri(
                "ldapi is only available on Unix".to_string(),
            )),
            Scheme::Ldap => Ok(Transport::Tcp(connect_tcp(&uri.host, uri.port, timeout)?)),
            Scheme::Ldaps => {
                let sock = connect_tcp(&uri.host, uri.port, timeout)?;
                let config = match tls_config {
                    Some(config) => config,
                    None => default_tls_config()?,
                };
                Ok(Transport::Tls(TlsStream::handshake(
                    sock, &uri.host, config,
                )?))
            }
        }
    }

    /// Promote a cleartext TCP stream to TLS in place (the transport side of StartTLS).
    pub fn start_tls(
        self,
        host: &str,
        tls_config: Option<Arc<ClientConfig>>,
    ) -> Result<Transport, Error> {
        match self {
            Transport::Tcp(sock) => {
                let config = match tls_config {
                    Some(config) => config,
                    None => default_tls_config()?,
                };
                Ok(Transport::Tls(TlsStream::handshake(sock, host, config)?))
            }
            other => {
                log::debug!("start_tls on a non-TCP transport is a no-op");
                Ok(other)
            }
        }
    }

    /// Split into independently owned read and write halves.
    pub fn split(self) -> io::Result<(ReadHalf, WriteHalf)> {
        match self {
            Transport::Tcp(sock) => {
                let reader = sock.try_clone()?;
                Ok((ReadHalf::Tcp(reader), WriteHalf::Tcp(sock)))
            }
            #[cfg(unix)]
            Transport::Unix(sock) => {
                let reader = sock.try_clone()?;
                Ok((ReadHalf::Unix(reader), WriteHalf::Unix(sock)))
            }
            Transport::Tls(stream) => {
                let TlsStream { conn, sock } = stream;
                let read_sock = sock.try_clone()?;
                Ok((
                    ReadHalf::Tls(TlsReader {
                        conn: conn.clone(),
                        sock: read_sock,
                    }),
                    WriteHalf::Tls(TlsWriter { conn, sock }),
                ))
            }
        }
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match self {
            Transport::Tcp(sock) => sock.read_exact(buf),
            #[cfg(unix)]
            Transport::Unix(sock) => sock.read_exact(buf),
            Transport::Tls(stream) => stream.read_exact_plain(buf),
        }
    }

    pub fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(sock) => sock.read(buf),
            #[cfg(unix)]
            Transport::Unix(sock) => sock.read(buf),
            Transport::Tls(stream) => stream.read_plain(buf),
        }
    }

    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Transport::Tcp(sock) => sock.write_all(buf),
            #[cfg(unix)]
            Transport::Unix(sock) => sock.write_all(buf),
            Transport::Tls(stream) => stream.write_all_plain(buf),
        }
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> Result<TcpStream, Error> {
    let mut last_error = None;
    for addr in (host, port).to_socket_addrs()? {
        let attempt = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(sock) => {
                sock.set_nodelay(true).ok();
                return Ok(sock);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(match last_error {
        Some(e) => Error::Connection(e),
        None => Error::InvalidUri(format!("no addresses for {}:{}", host, port)),
    })
}

/// A TLS session over TCP. Reads and writes go through the shared session state; the blocking
/// socket read never happens while the session lock is held.
pub struct TlsStream {
    conn: Arc<Mutex<ClientConnection>>,
    sock: TcpStream,
}

impl std::fmt::Debug for TlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream").field("sock", &self.sock).finish()
    }
}

impl TlsStream {
    fn handshake(
        mut sock: TcpStream,
        host: &str,
        config: Arc<ClientConfig>,
    ) -> Result<TlsStream, Error> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| Error::InvalidUri(format!("invalid TLS server name {}", host)))?;
        let mut conn = ClientConnection::new(config, server_name)?;
        while conn.is_handshaking() {
            conn.complete_io(&mut sock)?;
        }
        Ok(TlsStream {
            conn: Arc::new(Mutex::new(conn)),
            sock,
        })
    }

    fn read_plain(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = TlsReader {
            conn: self.conn.clone(),
            sock: self.sock.try_clone()?,
        };
        reader.read(buf)
    }

    fn read_exact_plain(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut reader = TlsReader {
            conn: self.conn.clone(),
            sock: self.sock.try_clone()?,
        };
        reader.read_exact(buf)
    }

    fn write_all_plain(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut writer = TlsWriter {
            conn: self.conn.clone(),
            sock: self.sock.try_clone()?,
        };
        writer.write_all(buf)
    }
}

#[derive(Debug)]
pub enum ReadHalf {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Tls(TlsReader),
}

impl Read for ReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ReadHalf::Tcp(sock) => sock.read(buf),
            #[cfg(unix)]
            ReadHalf::Unix(sock) => sock.read(buf),
            ReadHalf::Tls(reader) => reader.read(buf),
        }
    }
}

#[derive(Debug)]
pub enum WriteHalf {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Tls(TlsWriter),
}

impl Write for WriteHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            WriteHalf::Tcp(sock) => sock.write(buf),
            #[cfg(unix)]
            WriteHalf::Unix(sock) => sock.write(buf),
            WriteHalf::Tls(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            WriteHalf::Tcp(sock) => sock.flush(),
            #[cfg(unix)]
            WriteHalf::Unix(sock) => sock.flush(),
            WriteHalf::Tls(writer) => writer.flush(),
        }
    }
}

impl WriteHalf {
    /// Tear down the underlying socket in both directions; unblocks the reader thread.
    pub fn shutdown(&self) {
        match self {
            WriteHalf::Tcp(sock) => {
                sock.shutdown(Shutdown::Both).ok();
            }
            #[cfg(unix)]
            WriteHalf::Unix(sock) => {
                sock.shutdown(Shutdown::Both).ok();
            }
            WriteHalf::Tls(writer) => {
                writer.sock.shutdown(Shutdown::Both).ok();
            }
        }
    }
}

pub struct TlsReader {
    conn: Arc<Mutex<ClientConnection>>,
    sock: TcpStream,
}

impl std::fmt::Debug for TlsReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsReader").field("sock", &self.sock).finish()
    }
}

impl Read for TlsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            {
                let mut conn = lock(&self.conn);
                match conn.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }
            // no plaintext buffered; pull ciphertext off the socket without holding the lock
            let mut raw = [0u8; 16 * 1024];
            let n = self.sock.read(&mut raw)?;
            if n == 0 {
                return Ok(0);
            }
            let mut conn = lock(&self.conn);
            let mut slice: &[u8] = &raw[..n];
            while !slice.is_empty() {
                if conn.read_tls(&mut slice)? == 0 {
                    break;
                }
            }
            conn.process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            // the session may owe the peer data (key updates, close_notify replies)
            while conn.wants_write() {
                conn.write_tls(&mut (&self.sock))?;
            }
        }
    }
}

pub struct TlsWriter {
    conn: Arc<Mutex<ClientConnection>>,
    sock: TcpStream,
}

impl std::fmt::Debug for TlsWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsWriter").field("sock", &self.sock).finish()
    }
}

impl Write for TlsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut conn = lock(&self.conn);
        let n = conn.writer().write(buf)?;
        while conn.wants_write() {
            conn.write_tls(&mut (&self.sock))?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut conn = lock(&self.conn);
        while conn.wants_write() {
            conn.write_tls(&mut (&self.sock))?;
        }
        (&self.sock).flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ldap_uri() {
        let uri = LdapUri::from_str("ldap://example.org").expect("parse failed");
        assert_eq!(uri.scheme, Scheme::Ldap);
        assert_eq!(uri.host, "example.org");
        assert_eq!(uri.port, 389);

        let uri = LdapUri::from_str("ldap://example.org:10389").expect("parse failed");
        assert_eq!(uri.port, 10389);

        let uri = LdapUri::from_str("ldaps://secure.example.org").expect("parse failed");
        assert_eq!(uri.scheme, Scheme::Ldaps);
        assert_eq!(uri.port, 636);
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_ldapi_uri() {
        let uri = LdapUri::from_str("ldapi://%2Fvar%2Frun%2Fldapi").expect("parse failed");
        assert_eq!(uri.scheme, Scheme::Ldapi);
        assert_eq!(uri.socket_path, Some(PathBuf::from("/var/run/ldapi")));
    }

    #[test]
    fn test_reject_unknown_scheme() {
        assert!(LdapUri::from_str("http://example.org").is_err());
        assert!(LdapUri::from_str("ldapi://").is_err());
    }
}
