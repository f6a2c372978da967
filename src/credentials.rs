//! Bearer token persistence.
//!
//! File layout: magic, version byte, u32 length, token bytes, CRC32 of the
//! token. Writers take an exclusive lock and readers a shared one, so two
//! clients sharing a credentials file never observe a torn token.

use crate::error::{Result, SyncError};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic bytes for the token file.
const TOKEN_MAGIC: &[u8; 4] = b"TOK\0";

/// Current token file format version.
const TOKEN_VERSION: u8 = 1;

/// Upper bound on a stored token.
const MAX_TOKEN_LEN: usize = 4096;

/// A token file on disk.
#[derive(Clone, Debug)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved token. A missing file is `Ok(None)`.
    pub fn load(&self) -> Result<Option<String>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        file.lock_shared()?;
        let result = Self::read_token(&mut file);
        file.unlock()?;

        let token = result?;
        debug!(target: "tablesync::credentials", path = %self.path.display(), "loaded token");
        Ok(Some(token))
    }

    /// Persist `token`, replacing any previous one.
    pub fn save(&self, token: &str) -> Result<()> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(SyncError::InvalidToken(format!(
                "token is {} bytes, limit is {}",
                token.len(),
                MAX_TOKEN_LEN
            )));
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let result = Self::write_token(&mut file, token);
        file.unlock()?;
        result?;

        debug!(target: "tablesync::credentials", path = %self.path.display(), "saved token");
        Ok(())
    }

    fn write_token(file: &mut File, token: &str) -> Result<()> {
        file.set_len(0)?;
        let bytes = token.as_bytes();
        let mut buf = Vec::with_capacity(TOKEN_MAGIC.len() + 1 + 4 + bytes.len() + 4);
        buf.extend_from_slice(TOKEN_MAGIC);
        buf.push(TOKEN_VERSION);
        buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(bytes);
        buf.extend_from_slice(&crc32fast::hash(bytes).to_le_bytes());
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    fn read_token(file: &mut File) -> Result<String> {
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != TOKEN_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid token file magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != TOKEN_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported token file version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_TOKEN_LEN {
            return Err(SyncError::InvalidFormat("Token too large".into()));
        }

        let mut token = vec![0u8; len];
        file.read_exact(&mut token)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&token);
        if expected != got {
            return Err(SyncError::ChecksumMismatch { expected, got });
        }

        String::from_utf8(token).map_err(|_| SyncError::InvalidFormat("Token is not UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("token"));
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("nested/token"));
        store.save("first-token").unwrap();
        store.save("second").unwrap();
        assert_eq!(store.load().unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn test_corrupted_token_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token");
        let store = CredentialStore::new(&path);
        store.save("abcdef").unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[9] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            store.load(),
            Err(SyncError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token");
        fs::write(&path, b"JUNKJUNKJUNK").unwrap();
        assert!(matches!(
            CredentialStore::new(&path).load(),
            Err(SyncError::InvalidFormat(_))
        ));
    }
}
