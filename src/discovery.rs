//! LAN discovery over UDP broadcast
//!
//! Messages are plain `|`-separated strings:
//! `TAG|host|user|platform|tcp_port`.

use crate::error::{Error, Result};
use crate::protocol::discovery_tag;
use crate::session::local_username;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub tag: String,
    pub host: String,
    pub user: String,
    pub platform: String,
    pub port: u16,
}

impl Announcement {
    pub fn local(tag: &str, port: u16) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            tag: tag.to_string(),
            host,
            user: local_username(),
            platform: std::env::consts::OS.to_string(),
            port,
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.tag, self.host, self.user, self.platform, self.port
        )
    }

    /// `None` for anything that is not one of our messages.
    pub fn parse(msg: &str) -> Option<Self> {
        let parts: Vec<&str> = msg.trim().split('|').collect();
        let [tag, host, user, platform, port] = parts.as_slice() else {
            return None;
        };
        if ![discovery_tag::ANNOUNCE, discovery_tag::HERE, discovery_tag::CONNECT].contains(tag) {
            return None;
        }
        Some(Self {
            tag: tag.to_string(),
            host: host.to_string(),
            user: user.to_string(),
            platform: platform.to_string(),
            port: port.parse().ok()?,
        })
    }
}

/// A responder that answered an announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// TCP address to connect to.
    pub addr: SocketAddr,
    /// Where its discovery socket listens.
    pub udp: SocketAddr,
    pub info: Announcement,
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}@{}, {})",
            self.addr, self.info.user, self.info.host, self.info.platform
        )
    }
}

/// Subnet broadcast address of every up, broadcast-capable IPv4 interface,
/// plus the limited broadcast address.
pub fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut out = interface_broadcasts();
    if !out.contains(&Ipv4Addr::BROADCAST) {
        out.push(Ipv4Addr::BROADCAST);
    }
    out
}

#[cfg(unix)]
fn interface_broadcasts() -> Vec<Ipv4Addr> {
    let mut out = Vec::new();
    unsafe {
        let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifap) != 0 {
            return out;
        }
        let mut cur = ifap;
        while !cur.is_null() {
            let ifa = &*cur;
            cur = ifa.ifa_next;
            let flags = ifa.ifa_flags as libc::c_int;
            if flags & libc::IFF_UP == 0 || flags & libc::IFF_BROADCAST == 0 {
                continue;
            }
            if ifa.ifa_addr.is_null() || ifa.ifa_netmask.is_null() {
                continue;
            }
            if (*ifa.ifa_addr).sa_family as libc::c_int != libc::AF_INET {
                continue;
            }
            let addr = &*(ifa.ifa_addr as *const libc::sockaddr_in);
            let mask = &*(ifa.ifa_netmask as *const libc::sockaddr_in);
            let ip = u32::from_be(addr.sin_addr.s_addr);
            let m = u32::from_be(mask.sin_addr.s_addr);
            let bcast = Ipv4Addr::from(ip | !m);
            if !out.contains(&bcast) {
                out.push(bcast);
            }
        }
        libc::freeifaddrs(ifap);
    }
    out
}

#[cfg(not(unix))]
fn interface_broadcasts() -> Vec<Ipv4Addr> {
    Vec::new()
}

/// Broadcast an announcement and collect replies for `wait`.
pub fn discover(tcp_port: u16, broadcast_port: u16, wait: Duration) -> Result<Vec<Peer>> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    sock.set_broadcast(true)?;
    let msg = Announcement::local(discovery_tag::ANNOUNCE, tcp_port).encode();
    for b in broadcast_addresses() {
        if let Err(e) = sock.send_to(msg.as_bytes(), (b, broadcast_port)) {
            debug!("announce to {} failed: {}", b, e);
        }
    }
    collect_replies(&sock, wait)
}

fn collect_replies(sock: &UdpSocket, wait: Duration) -> Result<Vec<Peer>> {
    let deadline = Instant::now() + wait;
    let mut peers: Vec<Peer> = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        sock.set_read_timeout(Some(left))?;
        let (n, from) = match sock.recv_from(&mut buf) {
            Ok(x) => x,
            Err(e) if is_timeout(&e) => break,
            Err(e) => return Err(Error::Io(e)),
        };
        let Some(info) = Announcement::parse(&String::from_utf8_lossy(&buf[..n])) else {
            continue;
        };
        if info.tag != discovery_tag::HERE {
            continue;
        }
        let peer = Peer {
            addr: SocketAddr::new(from.ip(), info.port),
            udp: from,
            info,
        };
        if !peers.iter().any(|p| p.addr == peer.addr) {
            peers.push(peer);
        }
    }
    Ok(peers)
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

/// One peer is taken as is; several go to `chooser`, which returns an index.
pub fn choose<F>(mut peers: Vec<Peer>, chooser: F) -> Option<Peer>
where
    F: FnOnce(&[Peer]) -> Option<usize>,
{
    match peers.len() {
        0 => None,
        1 => peers.pop(),
        _ => {
            let i = chooser(&peers)?;
            (i < peers.len()).then(|| peers.swap_remove(i))
        }
    }
}

/// Tell the chosen peer we are about to open the TCP session.
pub fn send_connect(peer: &Peer, tcp_port: u16) -> Result<()> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    let msg = Announcement::local(discovery_tag::CONNECT, tcp_port).encode();
    sock.send_to(msg.as_bytes(), peer.udp)?;
    Ok(())
}

/// Answers announcements on the broadcast port until stopped.
pub struct Responder {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    local: SocketAddr,
}

impl Responder {
    pub fn spawn(broadcast_port: u16, tcp_port: u16) -> Result<Self> {
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, broadcast_port))?;
        sock.set_read_timeout(Some(Duration::from_millis(300)))?;
        let local = sock.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let reply = Announcement::local(discovery_tag::HERE, tcp_port).encode();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 1024];
            while !flag.load(Ordering::Relaxed) {
                let (n, from) = match sock.recv_from(&mut buf) {
                    Ok(x) => x,
                    Err(e) if is_timeout(&e) => continue,
                    Err(e) => {
                        warn!("discovery socket failed: {}", e);
                        return;
                    }
                };
                match Announcement::parse(&String::from_utf8_lossy(&buf[..n])) {
                    Some(a) if a.tag == discovery_tag::ANNOUNCE => {
                        debug!("announcement from {} at {}", a.host, from);
                        if let Err(e) = sock.send_to(reply.as_bytes(), from) {
                            debug!("reply to {} failed: {}", from, e);
                        }
                    }
                    Some(a) if a.tag == discovery_tag::CONNECT => {
                        info!("{}@{} is connecting from {}", a.user, a.host, from.ip());
                    }
                    _ => {}
                }
            }
        });
        Ok(Self {
            stop,
            handle: Some(handle),
            local,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_round_trip() {
        let a = Announcement {
            tag: discovery_tag::HERE.into(),
            host: "box".into(),
            user: "ops".into(),
            platform: "linux".into(),
            port: 9421,
        };
        assert_eq!(Announcement::parse(&a.encode()), Some(a));
        assert_eq!(Announcement::parse("OTHER|a|b|c|1"), None);
        assert_eq!(Announcement::parse("TANDEM_HERE|a|b|c"), None);
        assert_eq!(Announcement::parse("TANDEM_HERE|a|b|c|port"), None);
    }

    #[test]
    fn broadcast_list_has_fallback() {
        assert!(broadcast_addresses().contains(&Ipv4Addr::BROADCAST));
    }

    #[test]
    fn single_peer_is_auto_selected() {
        let p = Peer {
            addr: "10.0.0.2:9421".parse().unwrap(),
            udp: "10.0.0.2:9422".parse().unwrap(),
            info: Announcement::local(discovery_tag::HERE, 9421),
        };
        let chosen = choose(vec![p.clone()], |_| panic!("chooser must not run"));
        assert_eq!(chosen, Some(p.clone()));

        let mut q = p.clone();
        q.addr = "10.0.0.3:9421".parse().unwrap();
        assert_eq!(choose(vec![p.clone(), q.clone()], |_| Some(1)), Some(q));
        assert_eq!(choose(vec![p.clone(), p], |_| Some(5)), None);
    }

    #[test]
    fn responder_answers_unicast_announce() {
        let r = Responder::spawn(0, 7777).unwrap();
        let port = r.local_addr().port();
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let msg = Announcement::local(discovery_tag::ANNOUNCE, 1).encode();
        sock.send_to(msg.as_bytes(), ("127.0.0.1", port)).unwrap();
        let peers = collect_replies(&sock, Duration::from_secs(2)).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].addr, "127.0.0.1:7777".parse().unwrap());
    }
}
