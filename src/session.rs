//! Session bootstrap: one authenticated primary connection plus a pool of
//! worker connections bound to it by a random voucher

use crate::config::Config;
use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::protocol::{signal, Command, VOUCHER_LEN};
use crate::transport::{Acceptor, Connector};
use parking_lot::{Mutex, MutexGuard};
use rand::RngCore;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Who is on the other end: `"<platform>|<username>"` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTag {
    pub platform: String,
    pub username: String,
}

impl PeerTag {
    pub fn local() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            username: local_username(),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}|{}", self.platform, self.username)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (platform, username) = s
            .split_once('|')
            .ok_or_else(|| Error::Auth(format!("malformed peer tag {:?}", s)))?;
        Ok(Self {
            platform: platform.to_string(),
            username: username.to_string(),
        })
    }
}

impl std::fmt::Display for PeerTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.username, self.platform)
    }
}

pub fn local_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

pub type Voucher = [u8; VOUCHER_LEN];

pub fn new_voucher() -> Voucher {
    let mut v = [0u8; VOUCHER_LEN];
    rand::thread_rng().fill_bytes(&mut v);
    v
}

fn worker_proof(password: &str, voucher: &Voucher) -> Vec<u8> {
    let mut proof = Vec::with_capacity(password.len() + VOUCHER_LEN);
    proof.extend_from_slice(password.as_bytes());
    proof.extend_from_slice(voucher);
    proof
}

/// A worker joins only from the primary's address and with the exact proof.
pub fn worker_admissible(
    primary_ip: IpAddr,
    worker_ip: IpAddr,
    expected: &[u8],
    presented: &[u8],
) -> bool {
    primary_ip == worker_ip && expected == presented
}

fn agree_threads(ours: usize, theirs: usize) -> usize {
    ours.min(theirs).max(1)
}

/// Timeouts and early hangups during bootstrap are authentication failures.
fn as_auth(e: Error) -> Error {
    match e {
        Error::Io(io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            Error::Auth("timed out waiting for peer".into())
        }
        Error::PeerGone => Error::Auth("peer closed the connection during authentication".into()),
        Error::Protocol(m) => Error::Auth(m),
        other => other,
    }
}

/// An established pairing. The primary carries commands; the workers are
/// lent out to one folder operation at a time.
pub struct Session {
    primary: Mutex<Connection>,
    workers: Mutex<Vec<Connection>>,
    threads: usize,
    peer: PeerTag,
    peer_addr: SocketAddr,
}

impl Session {
    pub fn peer(&self) -> &PeerTag {
        &self.peer
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Worker count agreed at bootstrap.
    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn primary(&self) -> MutexGuard<'_, Connection> {
        self.primary.lock()
    }

    /// Claim the worker pool for one folder operation.
    pub fn try_workers(&self) -> Result<MutexGuard<'_, Vec<Connection>>> {
        let mut guard = self.workers.try_lock().ok_or(Error::Busy)?;
        let before = guard.len();
        guard.retain(|c| !c.is_broken());
        if guard.len() < before {
            warn!("{} worker connections lost", before - guard.len());
        }
        if guard.is_empty() {
            return Err(Error::Protocol("no live worker connections".into()));
        }
        Ok(guard)
    }

    /// Tear down every connection.
    pub fn shutdown(&self) {
        self.primary.lock().close();
        if let Some(mut ws) = self.workers.try_lock() {
            for w in ws.iter_mut() {
                w.close();
            }
        }
    }
}

/// Initiator side: full handshake on the primary, then open the workers.
pub fn connect(cfg: &Config, addr: SocketAddr, connector: &Connector) -> Result<Session> {
    let mut primary = Connection::new(connector.connect(addr)?)?;
    let voucher = new_voucher();
    let tag = PeerTag::local();

    primary.send_command(Command::PreSessionAuth, cfg.threads as u64, &cfg.password)?;
    primary.send_command(Command::Null, 0, &tag.encode())?;
    primary.send_bytes(&voucher)?;
    primary.flush()?;

    primary.set_timeout(Some(cfg.auth_timeout()))?;
    let reply = primary.recv_signal().map_err(as_auth)?;
    if reply <= 0 {
        return Err(Error::Auth("password rejected by peer".into()));
    }
    let peer_tag = primary.expect_header(Command::Null).map_err(as_auth)?;
    let peer = PeerTag::parse(&peer_tag.name)?;
    primary.set_timeout(None)?;

    let threads = agree_threads(cfg.threads, reply as usize);
    let proof = worker_proof(&cfg.password, &voucher);
    let mut workers = Vec::with_capacity(threads);
    for i in 0..threads {
        let mut w = Connection::new(connector.connect(addr)?)?;
        w.send_bytes(&proof)?;
        w.flush()?;
        w.set_timeout(Some(cfg.auth_timeout()))?;
        if w.recv_signal().map_err(as_auth)? != signal::CONTINUE {
            return Err(Error::Auth(format!("worker {} rejected", i)));
        }
        w.set_timeout(None)?;
        workers.push(w);
    }
    info!("session with {} at {} using {} workers", peer, addr, threads);

    Ok(Session {
        primary: Mutex::new(primary),
        workers: Mutex::new(workers),
        threads,
        peer,
        peer_addr: addr,
    })
}

/// Responder side.
pub struct Listener {
    tcp: TcpListener,
    acceptor: Acceptor,
}

impl Listener {
    pub fn bind(addr: SocketAddr, acceptor: Acceptor) -> Result<Self> {
        let tcp = TcpListener::bind(addr)?;
        Ok(Self { tcp, acceptor })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }

    /// Accept one primary connection and its workers. Returns an auth error
    /// for a bad password, a bad worker or a peer that went quiet; callers
    /// usually log it and accept again.
    pub fn accept_session(&self, cfg: &Config) -> Result<Session> {
        self.tcp.set_nonblocking(false)?;
        let (tcp, addr) = self.tcp.accept()?;
        debug!("primary connection from {}", addr);
        tcp.set_read_timeout(Some(cfg.auth_timeout()))?;
        let mut primary = Connection::new(self.acceptor.wrap(tcp).map_err(as_auth)?)?;

        let hello = primary.recv_header().map_err(as_auth)?;
        if hello.command != Command::PreSessionAuth {
            primary.close();
            return Err(Error::Auth(format!("expected PreSessionAuth, got {:?}", hello.command)));
        }
        let tag = primary.expect_header(Command::Null).map_err(as_auth)?;
        let mut voucher = [0u8; VOUCHER_LEN];
        primary.recv_into(&mut voucher).map_err(as_auth)?;

        if hello.name != cfg.password {
            warn!("wrong password from {}", addr);
            let _ = primary.send_signal(signal::CANCEL);
            let _ = primary.flush();
            primary.close();
            return Err(Error::Auth(format!("wrong password from {}", addr)));
        }
        let peer = PeerTag::parse(&tag.name)?;
        let threads = agree_threads(cfg.threads, hello.size as usize);

        primary.send_signal(cfg.threads.max(1) as i64)?;
        primary.send_command(Command::Null, 0, &PeerTag::local().encode())?;
        primary.flush()?;
        primary.set_timeout(None)?;

        let proof = worker_proof(&cfg.password, &voucher);
        let workers = self.accept_workers(cfg, addr.ip(), &proof, threads)?;
        info!("session with {} at {} using {} workers", peer, addr, threads);

        Ok(Session {
            primary: Mutex::new(primary),
            workers: Mutex::new(workers),
            threads,
            peer,
            peer_addr: addr,
        })
    }

    /// Collect `want` workers; the wait restarts after every connection.
    fn accept_workers(
        &self,
        cfg: &Config,
        primary_ip: IpAddr,
        proof: &[u8],
        want: usize,
    ) -> Result<Vec<Connection>> {
        let timeout = cfg.auth_timeout();
        let mut workers = Vec::with_capacity(want);
        let mut deadline = Instant::now() + timeout;

        self.tcp.set_nonblocking(true)?;
        while workers.len() < want && Instant::now() < deadline {
            let (tcp, addr) = match self.tcp.accept() {
                Ok(x) => x,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                Err(e) => {
                    self.tcp.set_nonblocking(false)?;
                    return Err(e.into());
                }
            };
            deadline = Instant::now() + timeout;
            match self.admit_worker(tcp, primary_ip, proof, timeout) {
                Ok(w) => workers.push(w),
                Err(e) => warn!("rejected worker connection from {}: {}", addr, e),
            }
        }
        self.tcp.set_nonblocking(false)?;

        if workers.len() < want {
            return Err(Error::Auth(format!("only {} of {} workers joined", workers.len(), want)));
        }
        Ok(workers)
    }

    fn admit_worker(
        &self,
        tcp: std::net::TcpStream,
        primary_ip: IpAddr,
        proof: &[u8],
        timeout: Duration,
    ) -> Result<Connection> {
        tcp.set_nonblocking(false)?;
        tcp.set_read_timeout(Some(timeout))?;
        let mut w = Connection::new(self.acceptor.wrap(tcp).map_err(as_auth)?)?;
        let presented = w.recv_exact(proof.len()).map_err(as_auth)?;
        if !worker_admissible(primary_ip, w.peer_addr().ip(), proof, &presented) {
            w.close();
            return Err(Error::Auth("voucher or address mismatch".into()));
        }
        w.send_signal(signal::CONTINUE)?;
        w.flush()?;
        w.set_timeout(None)?;
        Ok(w)
    }
}
