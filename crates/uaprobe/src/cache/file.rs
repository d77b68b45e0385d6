use super::CacheProvider;
use crate::error::CacheError;
use crate::lookup::Properties;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;

/// Default lifetime of an on-disk entry (one day)
pub const DEFAULT_ITEM_EXPIRY: Duration = Duration::from_secs(86_400);

const EXTENSION: &str = "json";

#[derive(Serialize, Deserialize)]
struct Envelope {
    expires_at: u64,
    value: Properties,
}

/// On-disk cache, one JSON file per entry
///
/// Entries live under `dir/ab/cd/abcd….json`, where the name is the SHA-256
/// of the key. The two directory levels keep any single directory small.
#[derive(Debug, Clone)]
pub struct FileCacheProvider {
    dir: PathBuf,
    default_ttl: Duration,
}

impl FileCacheProvider {
    /// Cache rooted at `dir`; entries stored without a ttl expire after `default_ttl`
    pub fn new(dir: impl Into<PathBuf>, default_ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            default_ttl,
        }
    }

    /// Root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File that holds `key`
    pub fn entry_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir
            .join(&digest[0..2])
            .join(&digest[2..4])
            .join(format!("{}.{}", digest, EXTENSION))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

impl CacheProvider for FileCacheProvider {
    fn get(&self, key: &str) -> Result<Option<Properties>, CacheError> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope: Envelope = serde_json::from_slice(&bytes)?;
        if envelope.expires_at <= now_secs() {
            let _ = fs::remove_file(&path);
            return Ok(None);
        }
        Ok(Some(envelope.value))
    }

    fn set(&self, key: &str, value: &Properties, ttl: Option<Duration>) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        fs::create_dir_all(parent)?;

        let envelope = Envelope {
            expires_at: now_secs() + ttl.unwrap_or(self.default_ttl).as_secs(),
            value: value.clone(),
        };
        let tmp = NamedTempFile::new_in(parent)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, &envelope)?;
            writer.flush()?;
        }
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self) -> Result<(), CacheError> {
        match remove_entries(&self.dir) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other.map_err(CacheError::from),
        }
    }
}

/// Delete every `.json` file below `dir`
fn remove_entries(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            remove_entries(&path)?;
        } else if path.extension() == Some(OsStr::new(EXTENSION)) {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
