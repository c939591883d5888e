use anyhow::Result;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use tandem::client::Client;
use tandem::config::Config;
use tandem::conn::Connection;
use tandem::protocol::{Command, VOUCHER_LEN};
use tandem::session::{self, Listener, PeerTag};
use tandem::transport::{Acceptor, Connector, Stream};
use tandem::{peer, tls, Error};

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    let mut buf = vec![0u8; 1024 * 64];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(7);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

fn config(save: &Path, trash: &Path) -> Config {
    Config {
        save_path: save.to_path_buf(),
        trash_path: Some(trash.to_path_buf()),
        password: "correct horse".into(),
        threads: 3,
        tls: false,
        auth_timeout_secs: 2,
        ..Config::default()
    }
}

/// Bind on loopback and serve exactly one session on a background thread.
fn start_server(
    cfg: Config,
    acceptor: Acceptor,
) -> Result<(SocketAddr, JoinHandle<tandem::Result<()>>)> {
    let listener = Listener::bind("127.0.0.1:0".parse()?, acceptor)?;
    let addr = listener.local_addr()?;
    let handle = std::thread::spawn(move || {
        let session = listener.accept_session(&cfg)?;
        peer::serve(&session, &cfg)
    });
    Ok((addr, handle))
}

#[test]
fn compare_force_sync_reaches_fixed_point() -> Result<()> {
    let src = tempfile::tempdir()?;
    let srv = tempfile::tempdir()?;
    let trash = tempfile::tempdir()?;
    write_file(&src.path().join("a.txt"), 100)?;
    write_file(&src.path().join("b.bin"), 2_000_000)?;
    std::fs::create_dir_all(src.path().join("empty/inner"))?;
    std::fs::create_dir_all(srv.path().join("mirror"))?;

    let cfg = config(srv.path(), trash.path());
    let (addr, server) = start_server(cfg.clone(), Acceptor::Plain)?;
    let session = session::connect(&cfg, addr, &Connector::Plain)?;
    let client = Client::new(&session, &cfg);

    let before = client.compare_folder(src.path(), "mirror")?;
    let names: Vec<&str> = before.result.source_only.iter().map(|s| s.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.bin"]);
    assert!(before.result.equal.is_empty());

    let sync = client.force_sync(src.path(), "mirror", |_| panic!("nothing to remove"))?;
    assert!(sync.plan.remove.is_empty());
    let outcome = sync.outcome.expect("files were sent");
    assert_eq!((outcome.requested, outcome.completed), (2, 2));

    let after = client.compare_folder(src.path(), "mirror")?;
    assert!(after.result.is_in_sync());
    assert_eq!(after.content_equal.len(), 2);
    assert!(after.content_mismatch.is_empty());
    assert!(srv.path().join("mirror/empty/inner").is_dir());

    // Drift on the target: an extra file and a resized one
    write_file(&srv.path().join("mirror/stale.log"), 10)?;
    write_file(&srv.path().join("mirror/a.txt"), 42)?;
    let mut shown = Vec::new();
    let sync = client.force_sync(src.path(), "mirror", |remove| {
        shown = remove.iter().cloned().collect();
        true
    })?;
    assert_eq!(shown, vec!["a.txt".to_string(), "stale.log".to_string()]);
    assert!(sync.removal_failures.is_empty());
    assert_eq!(sync.outcome.map(|o| o.failed()), Some(0));

    let last = client.compare_folder(src.path(), "mirror")?;
    assert!(last.result.is_in_sync());
    assert!(last.content_mismatch.is_empty());
    assert_eq!(
        std::fs::read(srv.path().join("mirror/a.txt"))?,
        std::fs::read(src.path().join("a.txt"))?
    );
    assert!(!srv.path().join("mirror/a (1).txt").exists());

    // Removed files went to the trash, not away
    let trashed: Vec<_> = walkdir::WalkDir::new(trash.path())
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() == "stale.log")
        .collect();
    assert_eq!(trashed.len(), 1);

    client.close()?;
    assert!(server.join().expect("server thread").is_ok());
    Ok(())
}

#[test]
fn busy_pool_leaves_peer_untouched() -> Result<()> {
    let src = tempfile::tempdir()?;
    let srv = tempfile::tempdir()?;
    let trash = tempfile::tempdir()?;
    write_file(&src.path().join("keep.txt"), 64)?;
    write_file(&srv.path().join("mirror/stale.txt"), 32)?;

    let cfg = config(srv.path(), trash.path());
    let (addr, server) = start_server(cfg.clone(), Acceptor::Plain)?;
    let session = session::connect(&cfg, addr, &Connector::Plain)?;
    let client = Client::new(&session, &cfg);

    let held = session.try_workers()?;
    let r = client.force_sync(src.path(), "mirror", |_| true);
    assert!(matches!(r, Err(Error::Busy)));
    assert!(srv.path().join("mirror/stale.txt").exists());
    drop(held);

    let sync = client.force_sync(src.path(), "mirror", |_| true)?;
    assert_eq!(sync.plan.remove.len(), 1);
    assert!(!srv.path().join("mirror/stale.txt").exists());
    assert!(srv.path().join("mirror/keep.txt").exists());

    client.close()?;
    server.join().expect("server thread")?;
    Ok(())
}

#[test]
fn interrupted_large_file_resumes() -> Result<()> {
    let src = tempfile::tempdir()?;
    let srv = tempfile::tempdir()?;
    let trash = tempfile::tempdir()?;
    write_file(&src.path().join("big.dat"), 10_000_000)?;
    let data = std::fs::read(src.path().join("big.dat"))?;
    std::fs::create_dir_all(srv.path().join("drop"))?;
    std::fs::write(srv.path().join("drop/big.dat.tandem-part"), &data[..4_000_000])?;

    let cfg = config(srv.path(), trash.path());
    let (addr, server) = start_server(cfg.clone(), Acceptor::Plain)?;
    let session = session::connect(&cfg, addr, &Connector::Plain)?;
    let client = Client::new(&session, &cfg);

    let outcome = client.send_folder(src.path(), "drop")?;
    assert_eq!(outcome.completed, 1);
    assert!(std::fs::read(srv.path().join("drop/big.dat"))? == data);
    assert!(!srv.path().join("drop/big.dat.tandem-part").exists());

    client.close()?;
    server.join().expect("server thread")?;
    Ok(())
}

#[test]
fn worker_with_wrong_voucher_is_rejected() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let mut cfg = config(srv.path(), srv.path());
    cfg.threads = 1;
    cfg.auth_timeout_secs = 1;

    let listener = Listener::bind("127.0.0.1:0".parse()?, Acceptor::Plain)?;
    let addr = listener.local_addr()?;
    let server_cfg = cfg.clone();
    let server = std::thread::spawn(move || listener.accept_session(&server_cfg).map(|_| ()));

    // Hand-rolled primary handshake so the worker can lie about the voucher
    let mut primary = Connection::new(Connector::Plain.connect(addr)?)?;
    primary.send_command(Command::PreSessionAuth, 1, &cfg.password)?;
    primary.send_command(Command::Null, 0, &PeerTag::local().encode())?;
    primary.send_bytes(&[1u8; VOUCHER_LEN])?;
    primary.flush()?;
    assert!(primary.recv_signal()? > 0);
    primary.expect_header(Command::Null)?;

    let tcp = std::net::TcpStream::connect(addr)?;
    let mut worker = Connection::new(Stream::Plain(tcp))?;
    let mut proof = cfg.password.as_bytes().to_vec();
    proof.extend_from_slice(&[2u8; VOUCHER_LEN]);
    worker.send_bytes(&proof)?;
    worker.flush()?;
    assert!(worker.recv_signal().is_err());

    let r = server.join().expect("server thread");
    assert!(matches!(r, Err(Error::Auth(_))));
    Ok(())
}

#[test]
fn tls_session_runs_commands() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let src = tempfile::tempdir()?;
    let keys = tempfile::tempdir()?;
    write_file(&src.path().join("docs/readme.md"), 3_000)?;
    write_file(&src.path().join("docs/blob.bin"), 1_500_000)?;

    let cert = keys.path().join("cert.pem");
    let key = keys.path().join("key.pem");
    let server_tls = tls::load_or_generate_server_config(&cert, &key)?;

    let cfg = config(srv.path(), srv.path());
    let (addr, server) = start_server(cfg.clone(), Acceptor::Tls(Arc::new(server_tls)))?;
    let connector = Connector::Tls {
        config: tls::build_client_config_tofu(
            "localhost",
            addr.port(),
            &keys.path().join("known_hosts"),
        ),
        server_name: tls::server_name_for("localhost")?,
    };
    let session = session::connect(&cfg, addr, &connector)?;
    assert_eq!(session.threads(), 3);
    let client = Client::new(&session, &cfg);

    let info = client.sysinfo()?;
    assert_eq!(info.platform, std::env::consts::OS);

    let outcome = client.send_folder(src.path(), "incoming")?;
    assert_eq!(outcome.failed(), 0);
    assert_eq!(std::fs::metadata(srv.path().join("incoming/docs/blob.bin"))?.len(), 1_500_000);

    #[cfg(unix)]
    {
        let mut lines = Vec::new();
        let code = client.exec("echo hello; echo world; exit 3", |l| lines.push(l.to_string()))?;
        assert_eq!(lines, vec!["hello", "world"]);
        assert_eq!(code, Some(3));
    }

    client.chat("done here")?;
    client.close()?;
    server.join().expect("server thread")?;
    assert!(std::fs::read_to_string(keys.path().join("known_hosts"))?.contains("localhost:"));
    Ok(())
}
