//! tandem - point-to-point folder transfer
//!
//! One side runs `serve`; the other side connects (by host or LAN discovery)
//! and issues a single command per invocation.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::collections::BTreeSet;
use std::io::{BufRead, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn};

use tandem::cli::{Args, Cmd, Target};
use tandem::client::Client;
use tandem::config::Config;
use tandem::discovery::{self, Peer};
use tandem::session::{self, Listener, Session};
use tandem::transport::{Acceptor, Connector};
use tandem::{logging, peer, tls};

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted. Closing connections...");
        std::process::exit(130);
    })
    .context("install Ctrl-C handler")?;

    let args = Args::parse();
    let cfg_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut cfg = Config::load(&cfg_path)?;
    if args.plain {
        cfg.tls = false;
    }

    if logging::init(args.verbose, Some(&cfg.log_dir)).is_err() {
        logging::init(args.verbose, None)?;
    }

    match args.command {
        Cmd::Serve {
            save_path,
            port,
            no_discovery,
        } => {
            if let Some(p) = save_path {
                cfg.save_path = p;
            }
            if let Some(p) = port {
                cfg.port = p;
            }
            serve(&cfg, !no_discovery)
        }
        Cmd::Discover { wait } => {
            let peers =
                discovery::discover(cfg.port, cfg.broadcast_port, Duration::from_secs(wait))?;
            if peers.is_empty() {
                println!("No peers answered.");
            }
            for p in peers {
                println!("{}", p);
            }
            Ok(())
        }
        Cmd::InitCert => {
            let (cert, key) = cfg.cert_paths();
            tls::load_or_generate_server_config(&cert, &key)?;
            if !cfg_path.exists() {
                Config::default().save(&cfg_path)?;
                println!("{}", cfg_path.display());
            }
            println!("{}", cert.display());
            println!("sha256 {}", tls::pem_fingerprint(&cert)?);
            Ok(())
        }
        Cmd::Send {
            folder,
            dest_name,
            target,
        } => with_session(&mut cfg, &target, |client| {
            let name = match dest_name {
                Some(n) => n,
                None => folder_name(&folder)?,
            };
            let outcome = client.send_folder(&folder, &name)?;
            println!(
                "{} of {} files transferred",
                outcome.completed, outcome.requested
            );
            for n in &outcome.failed_names {
                println!("  failed: {}", n);
            }
            Ok(())
        }),
        Cmd::Compare {
            local,
            remote,
            target,
        } => with_session(&mut cfg, &target, |client| {
            let report = client.compare_folder(&local, &remote)?;
            print_set("only here", &report.result.source_only);
            print_set("only on peer", &report.result.target_only);
            print_set("smaller here", &report.result.source_smaller);
            print_set("smaller on peer", &report.result.target_smaller);
            print_set("content differs", &report.content_mismatch);
            println!(
                "{} files identical by content",
                report.content_equal.len()
            );
            Ok(())
        }),
        Cmd::Sync {
            local,
            remote,
            yes,
            target,
        } => with_session(&mut cfg, &target, |client| {
            let report =
                client.force_sync(&local, &remote, |remove| yes || confirm_removal(remove))?;
            if report.declined {
                println!("Nothing changed.");
                return Ok(());
            }
            if report.plan.is_empty() {
                println!("Already in sync.");
                return Ok(());
            }
            println!(
                "{} removed on peer, {} to send",
                report.plan.remove.len() - report.removal_failures.len(),
                report.plan.send.len()
            );
            if let Some(o) = report.outcome {
                println!("{} of {} files transferred", o.completed, o.requested);
            }
            Ok(())
        }),
        Cmd::Exec { command, target } => with_session(&mut cfg, &target, |client| {
            let line = command.join(" ");
            match client.exec(&line, |out| println!("{}", out))? {
                Some(code) => println!("[exit {}]", code),
                None => println!("[could not start]"),
            }
            Ok(())
        }),
        Cmd::Sysinfo { target } => with_session(&mut cfg, &target, |client| {
            let s = client.sysinfo()?;
            println!("host:      {}", s.hostname);
            println!("user:      {}", s.username);
            println!("platform:  {}", s.platform);
            println!("cpus:      {} ({} physical)", s.cpus, s.physical_cores);
            Ok(())
        }),
        Cmd::Chat { message, target } => {
            with_session(&mut cfg, &target, |client| Ok(client.chat(&message)?))
        }
    }
}

fn folder_name(p: &Path) -> Result<String> {
    let abs = p
        .canonicalize()
        .with_context(|| format!("resolve {}", p.display()))?;
    abs.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} has no folder name", abs.display()))
}

fn print_set(label: &str, set: &BTreeSet<String>) {
    if set.is_empty() {
        return;
    }
    println!("{} ({}):", label, set.len());
    for n in set {
        println!("  {}", n);
    }
}

fn prompt(question: &str) -> String {
    print!("{}", question);
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    let _ = std::io::stdin().lock().read_line(&mut answer);
    answer.trim().to_string()
}

fn confirm_removal(remove: &BTreeSet<String>) -> bool {
    println!("These files will be moved to the peer's trash:");
    for n in remove {
        println!("  {}", n);
    }
    matches!(prompt("Proceed? [y/N] ").as_str(), "y" | "Y" | "yes")
}

fn choose_peer(peers: &[Peer]) -> Option<usize> {
    for (i, p) in peers.iter().enumerate() {
        println!("  [{}] {}", i + 1, p);
    }
    let pick: usize = prompt("Peer number: ").parse().ok()?;
    pick.checked_sub(1)
}

/// `host`, `host:port`, `[v6]` or `[v6]:port`.
fn split_host_port(s: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("unclosed bracket in {}", s))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().with_context(|| format!("bad port in {}", s))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }
    match s.rsplit_once(':') {
        Some((h, p)) if !h.contains(':') => {
            let port = p.parse().with_context(|| format!("bad port in {}", s))?;
            Ok((h.to_string(), port))
        }
        _ => Ok((s.to_string(), default_port)),
    }
}

/// Explicit host[:port], or whichever peer answers on the LAN.
fn resolve_target(cfg: &Config, target: &Target) -> Result<(String, SocketAddr)> {
    if let Some(h) = &target.host {
        let (host, port) = split_host_port(h, cfg.port)?;
        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .with_context(|| format!("resolve {}", h))?
            .next()
            .ok_or_else(|| anyhow!("no address for {}", h))?;
        return Ok((host, addr));
    }

    let peers = discovery::discover(cfg.port, cfg.broadcast_port, Duration::from_secs(2))?;
    if peers.len() > 1 {
        println!("Several peers answered:");
    }
    let peer = discovery::choose(peers, choose_peer)
        .ok_or_else(|| anyhow!("no peer selected; pass --host"))?;
    discovery::send_connect(&peer, cfg.port)?;
    Ok((peer.addr.ip().to_string(), peer.addr))
}

fn connector_for(cfg: &Config, host: &str, addr: SocketAddr) -> Result<Connector> {
    if !cfg.tls {
        return Ok(Connector::Plain);
    }
    Ok(Connector::Tls {
        config: tls::build_client_config_tofu(host, addr.port(), &cfg.known_hosts_path()),
        server_name: tls::server_name_for(host)?,
    })
}

fn with_session<F>(cfg: &mut Config, target: &Target, op: F) -> Result<()>
where
    F: FnOnce(&Client) -> Result<()>,
{
    if let Some(t) = target.threads {
        cfg.threads = t;
    }
    cfg.validate()?;
    let (host, addr) = resolve_target(cfg, target)?;
    let connector = connector_for(cfg, &host, addr)?;
    let session = session::connect(cfg, addr, &connector)
        .with_context(|| format!("connect to {}", addr))?;
    let client = Client::new(&session, cfg).with_progress(true);
    let r = op(&client);
    if let Err(e) = client.close() {
        warn!("close failed: {}", e);
    }
    r
}

fn serve(cfg: &Config, discoverable: bool) -> Result<()> {
    let acceptor = if cfg.tls {
        let (cert, key) = cfg.cert_paths();
        let server_cfg = tls::load_or_generate_server_config(&cert, &key)?;
        info!("tls fingerprint sha256 {}", tls::pem_fingerprint(&cert)?);
        Acceptor::Tls(Arc::new(server_cfg))
    } else {
        warn!("serving without TLS");
        Acceptor::Plain
    };

    let _responder = if discoverable {
        match discovery::Responder::spawn(cfg.broadcast_port, cfg.port) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("discovery disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    let listener = Listener::bind(SocketAddr::from(([0, 0, 0, 0], cfg.port)), acceptor)?;
    info!(
        "listening on {}, saving into {}",
        listener.local_addr()?,
        cfg.save_path.display()
    );

    loop {
        let session: Session = match listener.accept_session(cfg) {
            Ok(s) => s,
            Err(e) => {
                warn!("session not established: {}", e);
                continue;
            }
        };
        let session = Arc::new(session);
        let worker_cfg = cfg.clone();
        let s = Arc::clone(&session);
        let span = info_span!(
            "session",
            id = %uuid::Uuid::new_v4().simple(),
            peer = %session.peer()
        );
        let handle = std::thread::spawn(move || span.in_scope(|| peer::serve(&s, &worker_cfg)));
        match handle.join() {
            Ok(Ok(())) => info!(
                "session with {} at {} ended",
                session.peer(),
                session.peer_addr()
            ),
            Ok(Err(e)) => warn!(
                "session with {} at {} failed: {}",
                session.peer(),
                session.peer_addr(),
                e
            ),
            Err(_) => warn!("session thread panicked"),
        }
        session.shutdown();
    }
}
