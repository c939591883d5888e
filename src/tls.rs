//! TLS setup: self-signed server identity and trust-on-first-use clients

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use rustls::SignatureScheme;

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("Tandem");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("tandem");
    }
    PathBuf::from(".tandem")
}

pub fn default_cert_paths() -> (PathBuf, PathBuf) {
    let dir = config_dir();
    (dir.join("cert.pem"), dir.join("key.pem"))
}

/// Write a fresh self-signed certificate and its private key as PEM.
pub fn generate_self_signed(cert_path: &Path, key_path: &Path, names: Vec<String>) -> Result<()> {
    for p in [cert_path, key_path] {
        if let Some(dir) = p.parent() {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
    }
    let cert = rcgen::generate_simple_self_signed(names).context("generate self-signed cert")?;
    fs::write(cert_path, cert.serialize_pem().context("serialize cert")?)
        .context("write cert pem")?;
    fs::write(key_path, cert.serialize_private_key_pem()).context("write key pem")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(key_path, fs::Permissions::from_mode(0o600));
    }
    Ok(())
}

/// Load the server identity, generating one on first use.
pub fn load_or_generate_server_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<rustls::ServerConfig> {
    if !cert_path.exists() || !key_path.exists() {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "tandem.local".to_string());
        generate_self_signed(cert_path, key_path, vec![host, "localhost".to_string()])?;
    }

    let certs = {
        let mut rd = BufReader::new(fs::File::open(cert_path).context("open cert")?);
        let mut out = Vec::new();
        for c in rustls_pemfile::certs(&mut rd) {
            out.push(c.context("read cert")?);
        }
        out
    };
    let key = {
        let mut rd = BufReader::new(fs::File::open(key_path).context("open key")?);
        match rustls_pemfile::private_key(&mut rd).context("read key")? {
            Some(k) => k,
            None => return Err(anyhow!("no private key in {}", key_path.display())),
        }
    };

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build server tls config")
}

fn read_known_hosts(path: &Path) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Ok(f) = fs::File::open(path) {
        for line in BufReader::new(f).lines().map_while(|l| l.ok()) {
            if line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                map.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
    }
    map
}

fn write_known_hosts(path: &Path, map: &HashMap<String, String>) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir).context("create known_hosts parent dir")?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).context("create temp known_hosts")?;
    writeln!(tmp, "# tandem known_hosts v1")?;
    let mut keys: Vec<_> = map.keys().collect();
    keys.sort();
    for k in keys {
        writeln!(tmp, "{}={}", k, map[k])?;
    }
    tmp.flush()?;
    tmp.persist(path).context("replace known_hosts")?;
    Ok(())
}

pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(cert.as_ref());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Fingerprint of the first certificate in a PEM file.
pub fn pem_fingerprint(cert_path: &Path) -> Result<String> {
    let file = fs::File::open(cert_path).with_context(|| format!("open {}", cert_path.display()))?;
    let mut rd = BufReader::new(file);
    let cert = rustls_pemfile::certs(&mut rd)
        .next()
        .ok_or_else(|| anyhow!("no certificate in {}", cert_path.display()))?
        .context("read cert")?;
    Ok(fingerprint(&cert))
}

/// Pins the first certificate seen for a host:port and refuses changes.
#[derive(Debug)]
struct TofuVerifier {
    hostport: String,
    known_path: PathBuf,
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let fp = fingerprint(end_entity);
        let mut map = read_known_hosts(&self.known_path);
        match map.get(&self.hostport) {
            Some(saved) if saved == &fp => Ok(ServerCertVerified::assertion()),
            Some(_) => Err(rustls::Error::General(format!(
                "certificate for {} changed; refusing connection",
                self.hostport
            ))),
            None => {
                map.insert(self.hostport.clone(), fp);
                if let Err(e) = write_known_hosts(&self.known_path, &map) {
                    tracing::warn!("could not record peer certificate: {:#}", e);
                }
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}

pub fn build_client_config_tofu(
    host: &str,
    port: u16,
    known_hosts: &Path,
) -> Arc<rustls::ClientConfig> {
    let verifier = TofuVerifier {
        hostport: format!("{}:{}", host, port),
        known_path: known_hosts.to_path_buf(),
    };
    Arc::new(
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth(),
    )
}

pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|e| anyhow!("invalid server name {}: {}", host, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_loads_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let cert = tmp.path().join("c/cert.pem");
        let key = tmp.path().join("c/key.pem");
        load_or_generate_server_config(&cert, &key).unwrap();
        assert!(cert.exists() && key.exists());
        let before = fs::read(&cert).unwrap();
        // Second load reuses the stored identity
        load_or_generate_server_config(&cert, &key).unwrap();
        assert_eq!(before, fs::read(&cert).unwrap());
    }

    #[test]
    fn known_hosts_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("known_hosts");
        let mut map = HashMap::new();
        map.insert("10.0.0.2:9421".to_string(), "abcd".to_string());
        write_known_hosts(&path, &map).unwrap();
        assert_eq!(read_known_hosts(&path), map);
    }

    #[test]
    fn server_names() {
        assert!(matches!(server_name_for("127.0.0.1").unwrap(), ServerName::IpAddress(_)));
        assert!(server_name_for("peer.local").is_ok());
    }
}
