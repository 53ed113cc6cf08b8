//! Certificate material as laid out by certbot.
//!
//! The full-chain file is the only signal used to decide whether a domain
//! already has a certificate. Contents are never parsed.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

use crate::config::{CHAIN, FULL_CHAIN, PRIVATE_KEY};

/// Paths of one domain's certificate files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub full_chain: PathBuf,
    pub private_key: PathBuf,
    pub chain: PathBuf,
}

/// Read-only view of the certbot live directory.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    base_dir: PathBuf,
}

impl CertificateStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Expected file locations for `domain`, whether or not they exist yet.
    pub fn bundle(&self, domain: &str) -> CertificateBundle {
        let live = self.base_dir.join(domain);
        CertificateBundle {
            full_chain: live.join(FULL_CHAIN),
            private_key: live.join(PRIVATE_KEY),
            chain: live.join(CHAIN),
        }
    }

    /// Whether a certificate has been issued for `domain`.
    ///
    /// Reflects the file system on every call. A missing base directory is
    /// the same as a missing certificate.
    pub fn exists(&self, domain: &str) -> bool {
        self.bundle(domain).full_chain.exists()
    }

    /// When the full chain was last written, if it exists.
    pub fn written_at(&self, domain: &str) -> Option<DateTime<Utc>> {
        self.modified(domain).map(DateTime::<Utc>::from)
    }

    /// Time since the full chain was last written, if it exists.
    pub fn age(&self, domain: &str) -> Option<Duration> {
        SystemTime::now().duration_since(self.modified(domain)?).ok()
    }

    fn modified(&self, domain: &str) -> Option<SystemTime> {
        std::fs::metadata(self.bundle(domain).full_chain)
            .and_then(|m| m.modified())
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_uses_certbot_file_names() {
        let store = CertificateStore::new("/etc/letsencrypt/live");
        let bundle = store.bundle("example.com");
        assert_eq!(
            bundle.full_chain,
            Path::new("/etc/letsencrypt/live/example.com/fullchain.pem")
        );
        assert_eq!(
            bundle.private_key,
            Path::new("/etc/letsencrypt/live/example.com/privkey.pem")
        );
        assert_eq!(
            bundle.chain,
            Path::new("/etc/letsencrypt/live/example.com/chain.pem")
        );
    }

    #[test]
    fn test_exists_missing_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path().join("does-not-exist"));
        assert!(!store.exists("example.com"));
        assert_eq!(store.age("example.com"), None);
        assert_eq!(store.written_at("example.com"), None);
    }

    #[test]
    fn test_exists_tracks_live_file_system() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        assert!(!store.exists("example.com"));

        let live = dir.path().join("example.com");
        std::fs::create_dir_all(&live).unwrap();
        // Only the full chain counts.
        std::fs::write(live.join("privkey.pem"), "key").unwrap();
        assert!(!store.exists("example.com"));

        std::fs::write(live.join("fullchain.pem"), "chain").unwrap();
        assert!(store.exists("example.com"));
        assert!(!store.exists("other.example.com"));
        assert!(store.age("example.com").is_some());
        let written = store.written_at("example.com").unwrap();
        assert!((Utc::now() - written).num_seconds() < 60);

        std::fs::remove_file(live.join("fullchain.pem")).unwrap();
        assert!(!store.exists("example.com"));
    }
}
