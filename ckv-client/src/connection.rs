//! # Connections
//!
//! Purpose: Own one socket to one server and run request/response exchanges
//! over it, in either a blocking or a cooperative flavor.
//!
//! ## Design Principles
//! 1. **Transport Agnostic**: TCP, unix sockets and TLS sit behind one boxed
//!    stream so pools and executors never branch on transport.
//! 2. **Strict Ordering**: One connection carries one exchange at a time;
//!    replies are read back in the order commands were written.
//! 3. **Buffer Reuse**: Each connection keeps its own framing buffers.
//! 4. **Ready On Return**: `connect` authenticates and selects the database
//!    before handing the connection out.

use std::io::{BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::BytesMut;
use ckv_common::{CacheError, CacheOptions, CacheResult, Endpoint, ServerAddress, TransportError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::Cmd;
use crate::resp::{self, encode_command, read_response, RespValue};

/// Socket level settings shared by every connection of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectSettings {
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl ConnectSettings {
    pub fn from_options(options: &CacheOptions) -> Self {
        ConnectSettings {
            connect_timeout: options.connect_timeout,
            read_timeout: options.read_timeout,
            write_timeout: options.write_timeout,
        }
    }
}

trait SyncStream: Read + Write + Send {
    /// Replaces both socket timeouts.
    fn set_timeouts(&self, timeout: Option<Duration>) -> std::io::Result<()>;
}

impl SyncStream for TcpStream {
    fn set_timeouts(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }
}

#[cfg(unix)]
impl SyncStream for std::os::unix::net::UnixStream {
    fn set_timeouts(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }
}

#[cfg(feature = "tls")]
impl SyncStream for rustls::StreamOwned<rustls::ClientConnection, TcpStream> {
    fn set_timeouts(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.sock.set_timeouts(timeout)
    }
}

/// Blocking connection with reusable buffers.
pub struct Connection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<Box<dyn SyncStream>>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    label: String,
}

impl Connection {
    /// Opens, authenticates and selects the database.
    pub fn connect(addr: &ServerAddress, settings: &ConnectSettings) -> CacheResult<Self> {
        let stream = open_stream(addr, settings)?;
        let mut conn = Connection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            label: addr.label(),
        };
        for cmd in handshake(addr) {
            let reply = conn.exec(&cmd)?;
            check_handshake(&cmd, reply)?;
        }
        Ok(conn)
    }

    /// Address label this connection was opened against.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Executes one command and returns the reply, error replies included.
    pub fn exec(&mut self, cmd: &Cmd) -> CacheResult<RespValue> {
        self.write_buf.clear();
        encode_command(cmd.args(), &mut self.write_buf);
        self.flush_write_buf()?;
        read_response(&mut self.reader, &mut self.line_buf)
    }

    /// Writes all commands in one batch, then reads one reply per command.
    pub fn exec_batch(&mut self, cmds: &[Cmd]) -> CacheResult<Vec<RespValue>> {
        self.write_buf.clear();
        for cmd in cmds {
            encode_command(cmd.args(), &mut self.write_buf);
        }
        self.flush_write_buf()?;
        let mut replies = Vec::with_capacity(cmds.len());
        for _ in cmds {
            replies.push(read_response(&mut self.reader, &mut self.line_buf)?);
        }
        Ok(replies)
    }

    /// Courtesy QUIT bounded by `remaining`; failures are irrelevant because
    /// the socket is dropped next.
    pub fn quit(mut self, remaining: Duration) {
        // A zero socket timeout is rejected by the OS and would mean "wait forever".
        if remaining.is_zero() || self.reader.get_ref().set_timeouts(Some(remaining)).is_err() {
            return;
        }
        let _ = self.exec(&Cmd::new("QUIT"));
    }

    fn flush_write_buf(&mut self) -> CacheResult<()> {
        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;
        Ok(())
    }
}

fn open_stream(addr: &ServerAddress, settings: &ConnectSettings) -> CacheResult<Box<dyn SyncStream>> {
    match &addr.endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = connect_tcp(host, *port, settings.connect_timeout)?;
            stream.set_read_timeout(settings.read_timeout)?;
            stream.set_write_timeout(settings.write_timeout)?;
            // Disable Nagle to keep request latency low for small payloads.
            stream.set_nodelay(true)?;
            if addr.tls {
                return wrap_tls(host, stream);
            }
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix { path } => {
            let stream = std::os::unix::net::UnixStream::connect(path)
                .map_err(|err| connect_error(err, path))?;
            stream.set_read_timeout(settings.read_timeout)?;
            stream.set_write_timeout(settings.write_timeout)?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(CacheError::Config(
            "unix sockets are not available on this platform".into(),
        )),
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> CacheResult<TcpStream> {
    let label = format!("{host}:{port}");
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|err| connect_error(err, &label))?
        .collect();

    let mut last_err = None;
    for sock in addrs {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&sock, timeout),
            None => TcpStream::connect(sock),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => connect_error(err, &label),
        None => CacheError::Config(format!("{label} did not resolve to any address")),
    })
}

/// Maps connect-phase IO errors onto the transport taxonomy.
fn connect_error(err: std::io::Error, addr: &str) -> CacheError {
    let addr = addr.to_string();
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            TransportError::ConnectTimeout { addr }.into()
        }
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound => {
            TransportError::Refused { addr }.into()
        }
        _ => TransportError::Io(err).into(),
    }
}

#[cfg(feature = "tls")]
fn tls_config() -> std::sync::Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    std::sync::Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

#[cfg(feature = "tls")]
fn server_name(host: &str) -> CacheResult<rustls::pki_types::ServerName<'static>> {
    rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|err| CacheError::Config(format!("invalid TLS server name {host:?}: {err}")))
}

#[cfg(feature = "tls")]
fn wrap_tls(host: &str, stream: TcpStream) -> CacheResult<Box<dyn SyncStream>> {
    let session = rustls::ClientConnection::new(tls_config(), server_name(host)?)
        .map_err(|err| CacheError::Protocol(format!("TLS setup failed: {err}")))?;
    Ok(Box::new(rustls::StreamOwned::new(session, stream)))
}

#[cfg(not(feature = "tls"))]
fn wrap_tls(_host: &str, _stream: TcpStream) -> CacheResult<Box<dyn SyncStream>> {
    Err(CacheError::Config(
        "TLS addresses require the `tls` feature".into(),
    ))
}

/// Commands sent right after connecting.
fn handshake(addr: &ServerAddress) -> Vec<Cmd> {
    let mut cmds = Vec::new();
    if let Some(password) = &addr.password {
        let mut auth = Cmd::new("AUTH");
        if let Some(user) = &addr.username {
            auth.push_arg(user.as_str());
        }
        auth.push_arg(password.as_str());
        cmds.push(auth);
    }
    if addr.db != 0 {
        cmds.push(Cmd::new("SELECT").arg(&addr.db));
    }
    cmds
}

fn check_handshake(cmd: &Cmd, reply: RespValue) -> CacheResult<()> {
    match reply {
        RespValue::Error(message) => Err(CacheError::Server(format!(
            "{} failed: {}",
            cmd.name(),
            String::from_utf8_lossy(&message)
        ))),
        _ => Ok(()),
    }
}

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Cooperative connection. Bound to the scheduler that created it.
pub struct AsyncConnection {
    stream: Box<dyn AsyncStream>,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    label: String,
}

impl AsyncConnection {
    /// Opens, authenticates and selects the database.
    pub async fn connect(addr: &ServerAddress, settings: &ConnectSettings) -> CacheResult<Self> {
        let stream = with_deadline(settings.connect_timeout, open_async_stream(addr))
            .await
            .map_err(|_| {
                CacheError::from(TransportError::ConnectTimeout {
                    addr: addr.label(),
                })
            })??;

        let mut conn = AsyncConnection {
            stream,
            read_buf: BytesMut::with_capacity(8 * 1024),
            write_buf: Vec::with_capacity(256),
            read_timeout: settings.read_timeout,
            write_timeout: settings.write_timeout,
            label: addr.label(),
        };
        for cmd in handshake(addr) {
            let reply = conn.exec(&cmd).await?;
            check_handshake(&cmd, reply)?;
        }
        Ok(conn)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn exec(&mut self, cmd: &Cmd) -> CacheResult<RespValue> {
        self.write_buf.clear();
        encode_command(cmd.args(), &mut self.write_buf);
        self.flush_write_buf().await?;
        self.read_value().await
    }

    pub async fn exec_batch(&mut self, cmds: &[Cmd]) -> CacheResult<Vec<RespValue>> {
        self.write_buf.clear();
        for cmd in cmds {
            encode_command(cmd.args(), &mut self.write_buf);
        }
        self.flush_write_buf().await?;
        let mut replies = Vec::with_capacity(cmds.len());
        for _ in cmds {
            replies.push(self.read_value().await?);
        }
        Ok(replies)
    }

    /// Courtesy QUIT bounded by `deadline`.
    pub async fn quit(mut self, deadline: Duration) {
        let _ = tokio::time::timeout(deadline, self.exec(&Cmd::new("QUIT"))).await;
    }

    async fn flush_write_buf(&mut self) -> CacheResult<()> {
        let write = async {
            self.stream.write_all(&self.write_buf).await?;
            self.stream.flush().await
        };
        with_deadline(self.write_timeout, write)
            .await
            .map_err(|_| CacheError::from(TransportError::Closed))??;
        Ok(())
    }

    async fn read_value(&mut self) -> CacheResult<RespValue> {
        loop {
            if let Some(value) = resp::decode(&mut self.read_buf)? {
                return Ok(value);
            }
            let read = with_deadline(self.read_timeout, self.stream.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| CacheError::from(TransportError::ReadTimeout))??;
            if read == 0 {
                return Err(TransportError::Closed.into());
            }
        }
    }
}

async fn open_async_stream(addr: &ServerAddress) -> CacheResult<Box<dyn AsyncStream>> {
    match &addr.endpoint {
        Endpoint::Tcp { host, port } => {
            let label = format!("{host}:{port}");
            let stream = tokio::net::TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(|err| connect_error(err, &label))?;
            stream.set_nodelay(true)?;
            if addr.tls {
                return wrap_async_tls(host, stream).await;
            }
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix { path } => {
            let stream = tokio::net::UnixStream::connect(path)
                .await
                .map_err(|err| connect_error(err, path))?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(CacheError::Config(
            "unix sockets are not available on this platform".into(),
        )),
    }
}

#[cfg(feature = "tls")]
async fn wrap_async_tls(
    host: &str,
    stream: tokio::net::TcpStream,
) -> CacheResult<Box<dyn AsyncStream>> {
    let connector = tokio_rustls::TlsConnector::from(tls_config());
    let tls = connector.connect(server_name(host)?, stream).await?;
    Ok(Box::new(tls))
}

#[cfg(not(feature = "tls"))]
async fn wrap_async_tls(
    _host: &str,
    _stream: tokio::net::TcpStream,
) -> CacheResult<Box<dyn AsyncStream>> {
    Err(CacheError::Config(
        "TLS addresses require the `tls` feature".into(),
    ))
}

/// Runs `fut`, bounded by `limit` when one is set.
async fn with_deadline<F: std::future::Future>(
    limit: Option<Duration>,
    fut: F,
) -> Result<F::Output, tokio::time::error::Elapsed> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await,
        None => Ok(fut.await),
    }
}
