use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use rustls::{Certificate, PrivateKey, ServerConfig};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

#[derive(Debug, Error)]
pub enum TlsLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("serving config rejected: {0}")]
    Config(#[from] rustls::Error),
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        source: notify::Error,
    },
}

fn read_certs(path: &Path) -> Result<Vec<Certificate>, TlsLoadError> {
    let file = File::open(path).map_err(|source| TlsLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file)).map_err(|source| {
        TlsLoadError::Io {
            path: path.to_path_buf(),
            source,
        }
    })?;
    if certs.is_empty() {
        return Err(TlsLoadError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn read_key(path: &Path) -> Result<PrivateKey, TlsLoadError> {
    let file = File::open(path).map_err(|source| TlsLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let items = rustls_pemfile::read_all(&mut BufReader::new(file)).map_err(|source| {
        TlsLoadError::Io {
            path: path.to_path_buf(),
            source,
        }
    })?;
    for item in items {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(PrivateKey(key)),
            _ => continue,
        }
    }
    Err(TlsLoadError::NoPrivateKey(path.to_path_buf()))
}

pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, TlsLoadError> {
    let certs = read_certs(cert_path)?;
    let key = read_key(key_path)?;
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(config)
}

/// Serving cert/key pair with hot reload. A failed reload keeps the previous
/// config; only the initial load is fatal.
pub struct ReloadableTls {
    cert_path: PathBuf,
    key_path: PathBuf,
    config: RwLock<Arc<ServerConfig>>,
}

impl ReloadableTls {
    pub fn load(cert_path: PathBuf, key_path: PathBuf) -> Result<Arc<Self>, TlsLoadError> {
        let config = load_server_config(&cert_path, &key_path)?;
        Ok(Arc::new(Self {
            cert_path,
            key_path,
            config: RwLock::new(Arc::new(config)),
        }))
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.current())
    }

    pub fn current(&self) -> Arc<ServerConfig> {
        self.config.read().expect("tls lock poisoned").clone()
    }

    pub fn reload(&self) -> Result<(), TlsLoadError> {
        let next = load_server_config(&self.cert_path, &self.key_path)?;
        *self.config.write().expect("tls lock poisoned") = Arc::new(next);
        Ok(())
    }
}

/// Watches the directories holding the cert and key (secret mounts swap the
/// whole directory on rotation) and swaps the serving config in place.
/// The returned watcher must stay alive for the watch to keep running.
pub fn spawn_cert_watcher(tls: Arc<ReloadableTls>) -> Result<RecommendedWatcher, TlsLoadError> {
    let reloader = tls.clone();
    let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
        match res {
            Ok(_) => match reloader.reload() {
                Ok(()) => tracing::info!("serving certificate reloaded"),
                Err(err) => {
                    tracing::warn!(%err, "certificate reload failed; keeping previous cert")
                }
            },
            Err(err) => tracing::warn!(%err, "certificate watcher error"),
        }
    })
    .map_err(|source| TlsLoadError::Watch {
        path: tls.cert_path.clone(),
        source,
    })?;

    let mut watched = Vec::new();
    for path in [&tls.cert_path, &tls.key_path] {
        let dir = path.parent().unwrap_or(Path::new("."));
        if watched.contains(&dir.to_path_buf()) {
            continue;
        }
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| TlsLoadError::Watch {
                path: dir.to_path_buf(),
                source,
            })?;
        watched.push(dir.to_path_buf());
    }
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_self_signed(dir: &Path) -> (PathBuf, PathBuf) {
        let cert = rcgen::generate_simple_self_signed(vec!["cp.test".to_string()]).unwrap();
        let cert_path = dir.join("tls.crt");
        let key_path = dir.join("tls.key");
        File::create(&cert_path)
            .unwrap()
            .write_all(cert.serialize_pem().unwrap().as_bytes())
            .unwrap();
        File::create(&key_path)
            .unwrap()
            .write_all(cert.serialize_private_key_pem().as_bytes())
            .unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn loads_pem_pair() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path());
        assert!(load_server_config(&cert_path, &key_path).is_ok());
    }

    #[test]
    fn missing_cert_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_server_config(&dir.path().join("nope.crt"), &dir.path().join("nope.key"))
            .unwrap_err();
        assert!(matches!(err, TlsLoadError::Io { .. }));
    }

    #[test]
    fn failed_reload_keeps_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path());
        let tls = ReloadableTls::load(cert_path.clone(), key_path).unwrap();
        let before = tls.current();
        std::fs::write(&cert_path, b"garbage").unwrap();
        assert!(tls.reload().is_err());
        assert!(Arc::ptr_eq(&before, &tls.current()));
    }

    #[test]
    fn reload_swaps_config() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path());
        let tls = ReloadableTls::load(cert_path.clone(), key_path.clone()).unwrap();
        let before = tls.current();
        // rewrite with a fresh pair
        let cert = rcgen::generate_simple_self_signed(vec!["cp2.test".to_string()]).unwrap();
        std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
        std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();
        tls.reload().unwrap();
        assert!(!Arc::ptr_eq(&before, &tls.current()));
    }
}
