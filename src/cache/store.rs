//! On-disk cache entries.
//!
//! One file per key under the cache root, laid out like a bare HTTP response:
//!
//! ```text
//! CACHE <status> <fingerprint>\r\n
//! <name>: <value>\r\n          zero or more, Cache-Control and Expires excluded
//! \r\n
//! <body bytes, verbatim>
//! ```
//!
//! Writes go to a `.staging-*` file in the same directory and are renamed onto
//! the canonical path on commit, so readers only ever see complete entries.

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use tempfile::{NamedTempFile, TempPath};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{info, warn};

use super::keys::{CacheKey, Fingerprint};
use super::policy::FreshnessPolicy;

const SOURCE: &str = "cache::store";

/// Literal tag opening every entry's descriptor line.
pub const ENTRY_TAG: &str = "CACHE";

const STAGING_PREFIX: &str = ".staging-";
const MAX_HEAD_BYTES: u64 = 256 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache entry expired")]
    Expired,
    #[error("invalid cache entry: {reason}")]
    InvalidEntry { reason: &'static str },
    #[error("cache key collision: entry fingerprint {stored}, request fingerprint {expected}")]
    KeyCollision {
        stored: Fingerprint,
        expected: Fingerprint,
    },
    #[error("cache io error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    fn invalid(reason: &'static str) -> Self {
        Self::InvalidEntry { reason }
    }

    /// Short label for log fields and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::InvalidEntry { .. } => "invalid_entry",
            Self::KeyCollision { .. } => "key_collision",
            Self::Io(_) => "io",
        }
    }
}

/// A validated entry, positioned at the first body byte.
#[derive(Debug)]
pub struct StoredEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub modified: SystemTime,
    pub body: BufReader<File>,
}

impl StoredEntry {
    /// Read the remaining body into memory.
    pub async fn into_body_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        self.body.read_to_end(&mut body).await?;
        Ok(body)
    }
}

/// Filesystem-backed entry storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the cache root if it does not exist yet.
    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    /// Canonical path of the entry for `key`.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    /// Open a staged entry and write its descriptor and header block.
    ///
    /// Nothing becomes visible at the canonical path until
    /// [`EntryWriter::commit`]; dropping the writer discards the staging file.
    pub async fn begin_write(
        &self,
        key: &CacheKey,
        status: StatusCode,
        fingerprint: Fingerprint,
        headers: &HeaderMap,
    ) -> Result<EntryWriter, StoreError> {
        let root = self.root.clone();
        let (file, staging) = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&root)?;
            tempfile::Builder::new()
                .prefix(STAGING_PREFIX)
                .tempfile_in(&root)
                .map(NamedTempFile::into_parts)
        })
        .await
        .map_err(io::Error::other)??;

        let mut file = BufWriter::new(File::from_std(file));
        file.write_all(&encode_head(status, fingerprint, headers))
            .await?;

        Ok(EntryWriter {
            file,
            staging,
            target: self.entry_path(key),
            body_bytes: 0,
        })
    }

    /// Read a fresh entry for `key`.
    ///
    /// Check order: presence, descriptor, fingerprint, freshness, header block.
    /// A fingerprint mismatch is reported before freshness so that a
    /// collision is never mistaken for an ordinary miss.
    pub async fn read(
        &self,
        key: &CacheKey,
        expected: Fingerprint,
        policy: &FreshnessPolicy,
    ) -> Result<StoredEntry, StoreError> {
        self.open(key, expected, Some(policy)).await
    }

    /// Read an entry regardless of its age.
    pub async fn read_stale(
        &self,
        key: &CacheKey,
        expected: Fingerprint,
    ) -> Result<StoredEntry, StoreError> {
        self.open(key, expected, None).await
    }

    /// Remove staging files left behind by an interrupted process.
    ///
    /// Only safe while no populate is running against this root.
    pub async fn sweep_staging(&self) -> io::Result<usize> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let is_staging = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(STAGING_PREFIX));
            if !is_staging {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(
                    target = SOURCE,
                    op = "sweep_staging",
                    path = %entry.path().display(),
                    error = %err,
                    "Failed to remove orphaned staging file"
                ),
            }
        }

        if removed > 0 {
            info!(
                target = SOURCE,
                op = "sweep_staging",
                root = %self.root.display(),
                removed,
                "Removed orphaned staging files"
            );
        }
        Ok(removed)
    }

    async fn open(
        &self,
        key: &CacheKey,
        expected: Fingerprint,
        policy: Option<&FreshnessPolicy>,
    ) -> Result<StoredEntry, StoreError> {
        let file = match File::open(self.entry_path(key)).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::invalid("entry file missing"));
            }
            Err(err) => return Err(err.into()),
        };
        let modified = file.metadata().await?.modified()?;

        let mut reader = BufReader::new(file);
        let mut budget = MAX_HEAD_BYTES;

        let descriptor = read_head_line(&mut reader, &mut budget).await?;
        let (status, stored) = parse_descriptor(&descriptor)?;
        if stored != expected {
            return Err(StoreError::KeyCollision { stored, expected });
        }

        if let Some(policy) = policy
            && !policy.is_fresh(status.as_u16(), modified, SystemTime::now())
        {
            return Err(StoreError::Expired);
        }

        let headers = read_header_block(&mut reader, &mut budget).await?;

        Ok(StoredEntry {
            status,
            headers,
            modified,
            body: reader,
        })
    }
}

/// Staged entry being populated.
#[derive(Debug)]
pub struct EntryWriter {
    file: BufWriter<File>,
    staging: TempPath,
    target: PathBuf,
    body_bytes: u64,
}

impl EntryWriter {
    pub async fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.body_bytes += chunk.len() as u64;
        Ok(())
    }

    pub fn body_bytes(&self) -> u64 {
        self.body_bytes
    }

    /// Flush, sync and atomically publish the entry at its canonical path.
    pub async fn commit(self) -> Result<PathBuf, StoreError> {
        let Self {
            mut file,
            staging,
            target,
            ..
        } = self;

        file.flush().await?;
        let file = file.into_inner();
        file.sync_all().await?;
        drop(file);

        let destination = target.clone();
        tokio::task::spawn_blocking(move || staging.persist(&destination))
            .await
            .map_err(io::Error::other)?
            .map_err(|err| StoreError::Io(err.error))?;

        Ok(target)
    }
}

/// Encode the descriptor line and header block of an entry.
pub fn encode_head(status: StatusCode, fingerprint: Fingerprint, headers: &HeaderMap) -> Vec<u8> {
    let mut head = format!("{ENTRY_TAG} {} {}\r\n", status.as_u16(), fingerprint).into_bytes();
    for (name, value) in headers {
        if *name == header::CACHE_CONTROL || *name == header::EXPIRES {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

async fn read_head_line(
    reader: &mut BufReader<File>,
    budget: &mut u64,
) -> Result<Vec<u8>, StoreError> {
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(*budget)
        .read_until(b'\n', &mut line)
        .await?;
    *budget -= read as u64;

    if line.pop() != Some(b'\n') {
        return Err(if *budget == 0 {
            StoreError::invalid("entry head too large")
        } else {
            StoreError::invalid("entry head truncated")
        });
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(line)
}

fn parse_descriptor(line: &[u8]) -> Result<(StatusCode, Fingerprint), StoreError> {
    let text =
        std::str::from_utf8(line).map_err(|_| StoreError::invalid("descriptor is not utf-8"))?;
    let mut fields = text.split_ascii_whitespace();

    let (Some(tag), Some(status), Some(fingerprint), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(StoreError::invalid("descriptor must have exactly three fields"));
    };

    if tag != ENTRY_TAG {
        return Err(StoreError::invalid("descriptor tag mismatch"));
    }

    let status = status
        .parse::<u16>()
        .ok()
        .filter(|code| *code != 0)
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| StoreError::invalid("descriptor status is not a status code"))?;

    let fingerprint = fingerprint
        .parse::<u32>()
        .ok()
        .and_then(Fingerprint::new)
        .ok_or_else(|| StoreError::invalid("descriptor fingerprint is not a nonzero u32"))?;

    Ok((status, fingerprint))
}

async fn read_header_block(
    reader: &mut BufReader<File>,
    budget: &mut u64,
) -> Result<HeaderMap, StoreError> {
    let mut headers = HeaderMap::new();
    loop {
        let line = read_head_line(reader, budget).await?;
        if line.is_empty() {
            return Ok(headers);
        }

        let colon = line
            .iter()
            .position(|byte| *byte == b':')
            .ok_or_else(|| StoreError::invalid("header line without colon"))?;
        let name = HeaderName::from_bytes(&line[..colon])
            .map_err(|_| StoreError::invalid("invalid header name"))?;
        let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii())
            .map_err(|_| StoreError::invalid("invalid header value"))?;
        headers.append(name, value);
    }
}
