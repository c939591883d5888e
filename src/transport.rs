//! Byte-stream transports: plain TCP or TLS over TCP
//!
//! The flavour is chosen once when a connection is established; everything
//! above this module only sees `Stream`.

use crate::error::Result;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection, StreamOwned};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

pub enum Stream {
    Plain(TcpStream),
    TlsServer(Box<StreamOwned<ServerConnection, TcpStream>>),
    TlsClient(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(s) => s,
            Stream::TlsServer(s) => &s.sock,
            Stream::TlsClient(s) => &s.sock,
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    pub fn set_read_timeout(&self, dur: Option<Duration>) -> std::io::Result<()> {
        self.tcp().set_read_timeout(dur)
    }

    /// Best-effort close: TLS close_notify, then TCP shutdown.
    pub fn close(&mut self) {
        match self {
            Stream::Plain(_) => {}
            Stream::TlsServer(s) => {
                s.conn.send_close_notify();
                let _ = s.flush();
            }
            Stream::TlsClient(s) => {
                s.conn.send_close_notify();
                let _ = s.flush();
            }
        }
        let _ = self.tcp().shutdown(Shutdown::Both);
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::TlsServer(s) => s.read(buf),
            Stream::TlsClient(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::TlsServer(s) => s.write(buf),
            Stream::TlsClient(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::TlsServer(s) => s.flush(),
            Stream::TlsClient(s) => s.flush(),
        }
    }
}

/// Responder side: how accepted sockets are wrapped.
#[derive(Clone)]
pub enum Acceptor {
    Plain,
    Tls(Arc<ServerConfig>),
}

impl Acceptor {
    pub fn wrap(&self, tcp: TcpStream) -> Result<Stream> {
        tune_socket(&tcp);
        match self {
            Acceptor::Plain => Ok(Stream::Plain(tcp)),
            Acceptor::Tls(cfg) => {
                let conn = ServerConnection::new(Arc::clone(cfg))?;
                let mut s = StreamOwned::new(conn, tcp);
                while s.conn.is_handshaking() {
                    s.conn.complete_io(&mut s.sock)?;
                }
                Ok(Stream::TlsServer(Box::new(s)))
            }
        }
    }
}

/// Initiator side: how outgoing sockets are wrapped.
#[derive(Clone)]
pub enum Connector {
    Plain,
    Tls {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
}

impl Connector {
    pub fn connect(&self, addr: SocketAddr) -> Result<Stream> {
        let tcp = TcpStream::connect(addr)?;
        tune_socket(&tcp);
        match self {
            Connector::Plain => Ok(Stream::Plain(tcp)),
            Connector::Tls {
                config,
                server_name,
            } => {
                let conn = ClientConnection::new(Arc::clone(config), server_name.clone())?;
                let mut s = StreamOwned::new(conn, tcp);
                while s.conn.is_handshaking() {
                    s.conn.complete_io(&mut s.sock)?;
                }
                Ok(Stream::TlsClient(Box::new(s)))
            }
        }
    }
}

// Disable Nagle and enlarge buffers for bulk streaming
#[allow(unused_variables)]
fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        let fd = stream.as_raw_fd();
        let keepalive: libc::c_int = 1;
        let sz: libc::c_int = 4 * 1024 * 1024;
        unsafe {
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &keepalive as *const _ as *const libc::c_void,
                std::mem::size_of_val(&keepalive) as libc::socklen_t,
            );
            let p = &sz as *const _ as *const libc::c_void;
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                p,
                std::mem::size_of_val(&sz) as libc::socklen_t,
            );
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                p,
                std::mem::size_of_val(&sz) as libc::socklen_t,
            );
        }
    }
}
