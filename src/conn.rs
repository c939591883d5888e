//! Framed connection over one stream
//!
//! Headers, control frames, compressed values and raw sized bodies all go
//! through here. Every receive drains exactly the requested count; a zero
//! read means the peer went away.

use crate::error::{Error, Result};
use crate::protocol::{Command, HEADER_FIXED_LEN, IO_CHUNK, MAX_VALUE_SIZE, SIGNAL_LEN};
use crate::protocol_core::{self, Header};
use crate::transport::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

pub struct Connection {
    stream: Stream,
    peer: SocketAddr,
    broken: bool,
}

impl Connection {
    pub fn new(stream: Stream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream,
            peer,
            broken: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Set once any transport error has been seen on this connection.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn set_timeout(&self, dur: Option<Duration>) -> Result<()> {
        Ok(self.stream.set_read_timeout(dur)?)
    }

    pub fn close(&mut self) {
        self.broken = true;
        self.stream.close();
    }

    fn mark<T>(&mut self, r: Result<T>) -> Result<T> {
        if matches!(r, Err(Error::Io(_)) | Err(Error::PeerGone)) {
            self.broken = true;
        }
        r
    }

    pub fn send_bytes(&mut self, buf: &[u8]) -> Result<()> {
        let r = self.stream.write_all(buf).map_err(Error::from);
        self.mark(r)
    }

    pub fn flush(&mut self) -> Result<()> {
        let r = self.stream.flush().map_err(Error::from);
        self.mark(r)
    }

    /// Fill `buf` completely, looping over short reads.
    pub fn recv_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return self.mark(Err(Error::PeerGone)),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return self.mark(Err(e.into())),
            }
        }
        Ok(())
    }

    pub fn recv_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.recv_into(&mut buf)?;
        Ok(buf)
    }

    /// Stream exactly `n` bytes from the peer into `out`. Each read lands in
    /// `out` as soon as it arrives, so a connection lost mid-body leaves every
    /// received byte behind. Write errors on `out` are reported as filesystem
    /// errors after the remaining bytes are drained, so the connection stays
    /// in sync.
    pub fn recv_to_writer<W: Write>(
        &mut self,
        mut n: u64,
        out: &mut W,
        on_chunk: &mut dyn FnMut(u64),
    ) -> Result<std::io::Result<()>> {
        let mut buf = vec![0u8; IO_CHUNK.min(n.max(1) as usize)];
        let mut write_err: Option<std::io::Error> = None;
        while n > 0 {
            let want = (n as usize).min(buf.len());
            let got = match self.stream.read(&mut buf[..want]) {
                Ok(0) => return self.mark(Err(Error::PeerGone)),
                Ok(got) => got,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return self.mark(Err(e.into())),
            };
            if write_err.is_none() {
                if let Err(e) = out.write_all(&buf[..got]) {
                    write_err = Some(e);
                }
            }
            n -= got as u64;
            on_chunk(got as u64);
        }
        Ok(match write_err {
            Some(e) => Err(e),
            None => Ok(()),
        })
    }

    pub fn send_header(&mut self, header: &Header) -> Result<()> {
        let bytes = header.encode()?;
        self.send_bytes(&bytes)
    }

    pub fn send_command(&mut self, command: Command, size: u64, name: &str) -> Result<()> {
        self.send_header(&Header::new(command, size, name))
    }

    pub fn recv_header(&mut self) -> Result<Header> {
        let mut fixed = [0u8; HEADER_FIXED_LEN];
        self.recv_into(&mut fixed)?;
        let (command, size, name_len) = protocol_core::parse_header_fixed(&fixed)?;
        let name_bytes = self.recv_exact(name_len)?;
        let name = String::from_utf8(name_bytes)
            .map_err(|_| Error::protocol("header name is not valid UTF-8"))?;
        Ok(Header {
            command,
            size,
            name,
        })
    }

    /// Receive a header and insist on its command.
    pub fn expect_header(&mut self, command: Command) -> Result<Header> {
        let h = self.recv_header()?;
        if h.command != command {
            return Err(Error::protocol(format!(
                "expected {:?}, got {:?}",
                command, h.command
            )));
        }
        Ok(h)
    }

    pub fn send_signal(&mut self, value: i64) -> Result<()> {
        self.send_bytes(&protocol_core::encode_signal(value))
    }

    pub fn recv_signal(&mut self) -> Result<i64> {
        let mut buf = [0u8; SIGNAL_LEN];
        self.recv_into(&mut buf)?;
        Ok(protocol_core::decode_signal(buf))
    }

    pub fn send_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let blob = protocol_core::encode_value(value)?;
        let mut out = Vec::with_capacity(8 + blob.len());
        out.extend_from_slice(&(blob.len() as u64).to_be_bytes());
        out.extend_from_slice(&blob);
        self.send_bytes(&out)
    }

    pub fn recv_value<T: DeserializeOwned>(&mut self) -> Result<T> {
        let mut len = [0u8; 8];
        self.recv_into(&mut len)?;
        let len = u64::from_be_bytes(len);
        if len > MAX_VALUE_SIZE {
            return Err(Error::protocol(format!("value frame too large: {} bytes", len)));
        }
        let blob = self.recv_exact(len as usize)?;
        protocol_core::decode_value(&blob)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.broken {
            self.stream.close();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::{TcpListener, TcpStream};

    /// Two plain connections joined over loopback.
    pub(crate) fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (
            Connection::new(Stream::Plain(a)).unwrap(),
            Connection::new(Stream::Plain(b)).unwrap(),
        )
    }

    #[test]
    fn header_signal_and_value_frames() {
        let (mut a, mut b) = pair();
        let t = std::thread::spawn(move || {
            a.send_command(Command::SendFolder, 77, "photos/2024").unwrap();
            a.send_signal(-2).unwrap();
            let mut m = BTreeMap::new();
            m.insert("x".to_string(), 1u64);
            a.send_value(&m).unwrap();
            a
        });
        let h = b.recv_header().unwrap();
        assert_eq!(h, Header::new(Command::SendFolder, 77, "photos/2024"));
        assert_eq!(b.recv_signal().unwrap(), -2);
        let m: BTreeMap<String, u64> = b.recv_value().unwrap();
        assert_eq!(m.get("x"), Some(&1));
        t.join().unwrap();
    }

    #[test]
    fn zero_read_is_peer_gone() {
        let (a, mut b) = pair();
        drop(a);
        assert!(matches!(b.recv_header(), Err(Error::PeerGone)));
        assert!(b.is_broken());
    }

    #[test]
    fn unexpected_header_is_protocol_error() {
        let (mut a, mut b) = pair();
        a.send_command(Command::ChatMessage, 0, "hi").unwrap();
        assert!(matches!(
            b.expect_header(Command::Finished),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn recv_to_writer_drains_exact_count() {
        let (mut a, mut b) = pair();
        let payload: Vec<u8> = (0..3_000_000u32).map(|i| (i % 251) as u8).collect();
        let expect = payload.clone();
        let t = std::thread::spawn(move || {
            a.send_bytes(&payload).unwrap();
            a.send_signal(5).unwrap();
            a
        });
        let mut out = Vec::new();
        let mut seen = 0u64;
        b.recv_to_writer(3_000_000, &mut out, &mut |n| seen += n)
            .unwrap()
            .unwrap();
        assert_eq!(out, expect);
        assert_eq!(seen, 3_000_000);
        // Stream is still aligned on the next frame
        assert_eq!(b.recv_signal().unwrap(), 5);
        t.join().unwrap();
    }
}
