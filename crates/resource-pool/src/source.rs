//! Resource sources
//!
//! A source yields raw records, one per resource. Records are either a bare
//! credential or `id=secret`. Bare credentials get a generated id from the
//! pool so the credential never doubles as a log or health field. Blank
//! lines and `#` comments are ignored; everything else that does not parse
//! is skipped by the pool.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use common::Secret;
use tracing::info;

use crate::error::{Error, Result};

/// Finite, non-restartable supply of raw resource records.
pub trait ResourceSource: Send + Sync {
    /// Human-readable origin for logs (path, "static", ...)
    fn describe(&self) -> String;

    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>>;
}

/// One parsed resource record.
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    /// `None` for bare records; the pool assigns one on load.
    pub id: Option<String>,
    pub secret: Secret<String>,
}

/// Parse result for a single raw record.
#[derive(Debug)]
pub enum Parsed {
    Entry(ResourceEntry),
    /// Blank line or comment
    Ignored,
    Malformed,
}

impl ResourceEntry {
    pub fn parse(raw: &str) -> Parsed {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            return Parsed::Ignored;
        }

        let (id, secret) = match line.split_once('=') {
            Some((id, secret)) => {
                let id = id.trim();
                if id.is_empty() || id.chars().any(char::is_whitespace) {
                    return Parsed::Malformed;
                }
                (Some(id.to_string()), secret.trim())
            }
            None if line.chars().any(char::is_whitespace) => return Parsed::Malformed,
            None => (None, line),
        };

        if secret.is_empty() {
            return Parsed::Malformed;
        }

        Parsed::Entry(ResourceEntry {
            id,
            secret: Secret::new(secret.to_string()),
        })
    }
}

/// Line-oriented text file, one record per line.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ResourceSource for FileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>> {
        Box::pin(async move {
            let contents = tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|e| Error::Unreadable(format!("{}: {e}", self.path.display())))?;
            let records: Vec<String> = contents.lines().map(str::to_owned).collect();
            info!(path = %self.path.display(), lines = records.len(), "read resource file");
            Ok(records)
        })
    }
}

/// In-memory records, for embedding and tests.
pub struct StaticSource {
    records: Vec<String>,
}

impl StaticSource {
    pub fn new<I, S>(records: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            records: records.into_iter().map(Into::into).collect(),
        }
    }
}

impl ResourceSource for StaticSource {
    fn describe(&self) -> String {
        "static".to_string()
    }

    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>> {
        let records = self.records.clone();
        Box::pin(async move { Ok(records) })
    }
}
