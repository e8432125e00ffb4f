//! Resource-addressed HTTP downloads
//!
//! Every download streams into a temporary sibling and is atomically
//! renamed over the destination, so a partially written file is never
//! observable under the mirror tree.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use reqwest::Client;
use tempfile::NamedTempFile;

/// Result of a single fetch that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Downloaded,
    /// Upstream answered non-200 and the caller declared the file optional.
    Missing,
}

pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("constructing HTTP client")?;

        Ok(Fetcher { client })
    }

    /// Download `remote` to `local`.
    ///
    /// On a non-200 answer: with `absent_ok` any stale local copy is
    /// removed and `Missing` is returned; otherwise the fetch fails. No
    /// retries happen at this layer.
    pub async fn fetch(&self, remote: &str, local: &Path, absent_ok: bool) -> Result<FetchOutcome> {
        let parent = parent_dir(local);
        tokio::fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating '{}'", parent.display()))?;

        let mut response = self
            .client
            .get(remote)
            .send()
            .await
            .with_context(|| format!("requesting '{}'", remote))?;
        if response.status() != reqwest::StatusCode::OK {
            if absent_ok {
                debug!("'{}' not found, removing local copy also", remote);
                if local.exists() {
                    tokio::fs::remove_file(local)
                        .await
                        .with_context(|| format!("removing stale '{}'", local.display()))?;
                }
                return Ok(FetchOutcome::Missing);
            }
            bail!("'{}' answered HTTP {}", remote, response.status());
        }

        let mut temp = NamedTempFile::new_in(&parent)
            .with_context(|| format!("creating temporary file in '{}'", parent.display()))?;
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("reading body of '{}'", remote))?
        {
            temp.write_all(&chunk)?;
        }
        temp.flush()?;
        temp.persist(local)
            .with_context(|| format!("replacing '{}'", local.display()))?;
        info!("'{}' ==> '{}'", remote, local.display());

        Ok(FetchOutcome::Downloaded)
    }

    /// Probe `base` under each extension in order; stop at the first one
    /// upstream has. Returns the winning extension.
    pub async fn fetch_first(
        &self,
        remote_base: &str,
        local_base: &Path,
        extensions: &[String],
    ) -> Result<Option<String>> {
        for ext in extensions {
            let remote = format!("{}{}", remote_base, ext);
            let local = ext_path(local_base, ext);
            if self.fetch(&remote, &local, true).await? == FetchOutcome::Downloaded {
                return Ok(Some(ext.clone()));
            }
        }

        Ok(None)
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// `base` with an extension string appended to its file name.
pub fn ext_path(base: &Path, ext: &str) -> PathBuf {
    if ext.is_empty() {
        return base.to_path_buf();
    }
    let mut name = base.as_os_str().to_os_string();
    name.push(ext);

    PathBuf::from(name)
}

/// Join URL segments onto a base with single slashes.
pub fn join_url(base: &str, sub: &[String]) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    for part in sub {
        url.push('/');
        url.push_str(part);
    }

    url
}

/// Atomically replace `path` with `content`.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = parent_dir(path);
    std::fs::create_dir_all(&parent)
        .with_context(|| format!("creating '{}'", parent.display()))?;
    let mut temp = NamedTempFile::new_in(&parent)
        .with_context(|| format!("creating temporary file in '{}'", parent.display()))?;
    temp.write_all(content)?;
    temp.flush()?;
    temp.persist(path)
        .with_context(|| format!("replacing '{}'", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ext_path() {
        let base = Path::new("/mirror/dists/bullseye/main/binary-amd64/Packages");
        assert_eq!(ext_path(base, ""), base);
        assert_eq!(
            ext_path(base, ".gz"),
            Path::new("/mirror/dists/bullseye/main/binary-amd64/Packages.gz")
        );
    }

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url(
                "http://deb.debian.org/debian/",
                &["dists".to_string(), "bullseye".to_string(), "Release".to_string()]
            ),
            "http://deb.debian.org/debian/dists/bullseye/Release"
        );
        assert_eq!(join_url("http://host/repo", &[]), "http://host/repo");
    }

    #[test]
    fn test_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deep/nested/file");
        atomic_write(&target, b"one").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"one");
        atomic_write(&target, b"two").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"two");
    }
}
