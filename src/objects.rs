//! Local-disk object storage with user-namespaced paths and signed URLs.
//!
//! Paths are namespaced by the owning user's id as the first segment. Every
//! caller-supplied path is validated before any filesystem access: traversal
//! sequences and absolute markers are rejected outright, and ownership checks
//! require the requesting user's namespace prefix.

use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum ObjectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object path: {0}")]
    InvalidPath(String),

    #[error("Path not in caller's namespace: {0}")]
    NamespaceMismatch(String),

    #[error("Signed URL rejected: {0}")]
    BadSignature(String),
}

pub type Result<T> = std::result::Result<T, ObjectError>;

pub struct ObjectStore {
    root: PathBuf,
    secret: Vec<u8>,
}

impl ObjectStore {
    pub fn new(root: PathBuf, secret: String) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            secret: secret.into_bytes(),
        })
    }

    /// Reject traversal sequences, absolute markers, and empty segments.
    pub fn validate_path(path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(ObjectError::InvalidPath("empty path".to_string()));
        }
        if path.starts_with('/') || path.starts_with('\\') || path.contains(':') {
            return Err(ObjectError::InvalidPath(format!(
                "absolute marker in {path:?}"
            )));
        }
        if path.split(['/', '\\']).any(|seg| seg == ".." || seg.is_empty()) {
            return Err(ObjectError::InvalidPath(format!(
                "traversal or empty segment in {path:?}"
            )));
        }
        Ok(())
    }

    /// Validate that a path sits inside the requesting user's namespace.
    pub fn validate_owner(path: &str, user_id: Uuid) -> Result<()> {
        Self::validate_path(path)?;
        let prefix = format!("{user_id}/");
        if !path.starts_with(&prefix) {
            return Err(ObjectError::NamespaceMismatch(path.to_string()));
        }
        Ok(())
    }

    /// Canonical namespaced path for a user's file.
    pub fn namespaced_path(user_id: Uuid, file_name: &str) -> String {
        // Strip any directory components the client sent along.
        let base = file_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(file_name)
            .trim();
        format!("{user_id}/{base}")
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        Self::validate_path(path)?;
        Ok(self.root.join(path))
    }

    fn sidecar_path(&self, path: &str) -> Result<PathBuf> {
        Self::validate_path(path)?;
        Ok(self.root.join(format!("{path}.ctype")))
    }

    pub fn download(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.full_path(path)?;
        if !full.exists() {
            return Err(ObjectError::NotFound(path.to_string()));
        }
        Ok(fs::read(full)?)
    }

    pub fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&full, bytes)?;
        fs::write(self.sidecar_path(path)?, content_type)?;
        Ok(())
    }

    /// Stored content type for an object, if recorded.
    pub fn content_type(&self, path: &str) -> Option<String> {
        let sidecar = self.sidecar_path(path).ok()?;
        fs::read_to_string(sidecar).ok()
    }

    /// Remove objects; missing paths are ignored.
    pub fn remove(&self, paths: &[String]) -> Result<()> {
        for path in paths {
            let full = self.full_path(path)?;
            if full.exists() {
                fs::remove_file(&full)?;
            }
            let sidecar = self.sidecar_path(path)?;
            if sidecar.exists() {
                fs::remove_file(sidecar)?;
            }
        }
        Ok(())
    }

    fn signature(&self, path: &str, expires: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(path.as_bytes());
        mac.update(b":");
        mac.update(expires.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Create an expiring URL path for an object.
    pub fn create_signed_url(&self, path: &str, ttl_secs: i64) -> Result<String> {
        Self::validate_path(path)?;
        let expires = Utc::now().timestamp() + ttl_secs;
        let sig = self.signature(path, expires);
        Ok(format!(
            "/objects/{}?expires={}&sig={}",
            urlencoding::encode(path),
            expires,
            sig
        ))
    }

    pub fn create_signed_urls(&self, paths: &[String], ttl_secs: i64) -> Result<Vec<String>> {
        paths
            .iter()
            .map(|p| self.create_signed_url(p, ttl_secs))
            .collect()
    }

    /// Verify a signed URL's signature and expiry.
    pub fn verify_signed(&self, path: &str, expires: i64, sig: &str) -> Result<()> {
        Self::validate_path(path)?;
        if Utc::now().timestamp() > expires {
            return Err(ObjectError::BadSignature("URL expired".to_string()));
        }
        let sig_bytes =
            hex::decode(sig).map_err(|_| ObjectError::BadSignature("bad hex".to_string()))?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(path.as_bytes());
        mac.update(b":");
        mac.update(expires.to_string().as_bytes());
        mac.verify_slice(&sig_bytes)
            .map_err(|_| ObjectError::BadSignature("signature mismatch".to_string()))
    }
}
