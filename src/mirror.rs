//! Per-mirror synchronization driver

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use tokio::task::spawn_blocking;

use crate::config::MirrorSpec;
use crate::fetch::{join_url, Fetcher, FetchOutcome};
use crate::hash::{digest_file, ChecksumKind};
use crate::packages::PackagesIndex;
use crate::release::{FileEntry, ReleaseFile, Variant};
use crate::sign::ReleaseSigner;
use crate::trash::{remove_trash, PathLog};

const DOWNLOAD_WORKERS: usize = 8;

pub struct MirrorRunner<'a> {
    spec: &'a MirrorSpec,
    fetcher: &'a Fetcher,
    signer: Option<&'a ReleaseSigner>,
    remove_valid_until: bool,
    log: PathLog,
}

impl<'a> MirrorRunner<'a> {
    pub fn new(
        spec: &'a MirrorSpec,
        fetcher: &'a Fetcher,
        signer: Option<&'a ReleaseSigner>,
        remove_valid_until: bool,
    ) -> Self {
        MirrorRunner {
            spec,
            fetcher,
            signer,
            remove_valid_until,
            log: PathLog::new(),
        }
    }

    /// Synchronize every distribution, then clean up whatever the run did
    /// not touch.
    pub async fn run(mut self) -> Result<()> {
        let spec = self.spec;
        if spec.versions.is_some() && self.signer.is_none() {
            bail!("version retention rewrites release files and requires a resigning key");
        }
        let mut failed = 0usize;
        for distr in &spec.distributives {
            info!("Processing distribution '{}' ...", distr);
            if let Err(err) = self.process_distributive(distr).await {
                error!("Error while processing distribution '{}': {:?}", distr, err);
                failed += 1;
            }
        }
        if failed > 0 {
            // an incomplete path log must not drive deletions
            bail!("{} distribution(s) failed, trash removal skipped", failed);
        }
        info!(
            "Cleaning up '{}' ({} paths recorded) ...",
            spec.destination.display(),
            self.log.len()
        );
        remove_trash(&self.log, &spec.destination)?;

        Ok(())
    }

    async fn process_distributive(&mut self, distr: &str) -> Result<()> {
        let spec = self.spec;
        let source = spec.source.as_str();
        let dest = spec.destination.clone();
        let mut release = ReleaseFile::new(Variant::Plain, source, &dest, distr);
        let mut inrelease = ReleaseFile::new(Variant::Inline, source, &dest, distr);
        let got_release = release.synchronize(self.fetcher).await?;
        let got_inrelease = inrelease.synchronize(self.fetcher).await?;

        let synthesized = !got_release && !got_inrelease;
        if synthesized {
            info!(
                "No release files found for '{}', synthesizing from the configured grid",
                distr
            );
            self.synthesize_release(distr, &mut release, &mut inrelease)
                .await?;
        }
        let (primary, secondary) = if got_release || synthesized {
            (&mut release, &mut inrelease)
        } else {
            (&mut inrelease, &mut release)
        };

        let prune = spec.versions.is_some() || self.remove_valid_until;
        if prune && !synthesized {
            let signer = self
                .signer
                .ok_or_else(|| anyhow!("rewriting release files requires a resigning key"))?;
            if !spec.architectures.is_empty() {
                primary.strip_architectures(&spec.architectures)?;
            }
            primary.strip_sections(&spec.sections)?;
            primary.strip_diff_directories()?;
            if let Some(keep) = spec.versions {
                primary
                    .strip_packages_versions(keep as usize, self.fetcher)
                    .await?;
            }
            if self.remove_valid_until {
                primary.remove_valid_until()?;
            }
            primary.sign(signer)?;
            secondary.create_from(primary)?;
        }

        // every file the release manifest references
        let entries = primary.subfiles()?;
        if !entries.is_empty() {
            info!(
                "Synchronizing {} files from the release manifest ...",
                entries.len()
            );
            self.fetch_entries(entries).await?;
        }

        // every package blob the Packages indices reference
        let mut archs = if spec.architectures.is_empty() {
            primary.architectures()
        } else {
            spec.architectures.clone()
        };
        if !archs.iter().any(|a| a == "all") && !primary.skip_all_architecture() {
            debug!("forcing pseudo-architecture 'all' into the grid");
            archs.push("all".to_string());
        }
        for section in &spec.sections {
            for arch in &archs {
                info!("Processing section '{}', architecture '{}'", section, arch);
                let index = primary.packages_index(section, arch)?;
                self.process_packages_index(index, section, arch).await?;
            }
        }

        self.log.record_all(release.local_paths());
        self.log.record_all(inrelease.local_paths());

        Ok(())
    }

    async fn process_packages_index(
        &mut self,
        index: Option<PackagesIndex>,
        section: &str,
        arch: &str,
    ) -> Result<()> {
        let Some(mut index) = index else {
            return Ok(());
        };
        if !index.synchronize(self.fetcher).await? {
            warn!(
                "no 'Packages' found for section '{}', architecture '{}'",
                section, arch
            );
            return Ok(());
        }
        self.log.record_all(index.local_paths());
        index.open()?;
        let blobs = index.subfiles()?;
        info!(
            "Synchronizing {} package(s) from '{}' ...",
            blobs.len(),
            index.rel_path()
        );
        self.fetch_entries(blobs).await?;

        Ok(())
    }

    /// Fan a batch of manifest entries out over the download worker pool;
    /// the produced paths are recorded once the batch has drained.
    async fn fetch_entries(&mut self, entries: Vec<FileEntry>) -> Result<()> {
        let fetcher = self.fetcher;
        let source = self.spec.source.clone();
        let dest = self.spec.destination.clone();
        let results = stream::iter(entries.into_iter().map(|entry| {
            let source = source.clone();
            let dest = dest.clone();
            async move {
                let label = entry.path.clone();
                sync_by_checksum(fetcher, &source, &dest, &entry)
                    .await
                    .with_context(|| format!("processing '{}'", label))
            }
        }))
        .buffer_unordered(DOWNLOAD_WORKERS)
        .collect::<Vec<_>>()
        .await;
        for result in results {
            if let Some(paths) = result? {
                self.log.record_all(paths);
            }
        }

        Ok(())
    }

    /// Fallback for upstreams without release files: download the
    /// configured `Packages` grid and build a Release around it.
    async fn synthesize_release(
        &mut self,
        distr: &str,
        release: &mut ReleaseFile,
        inrelease: &mut ReleaseFile,
    ) -> Result<()> {
        let spec = self.spec;
        if spec.architectures.is_empty() {
            bail!(
                "upstream provides no release file for '{}' and the mirror \
                 does not configure architectures",
                distr
            );
        }
        let remote_dir = join_url(&spec.source, &["dists".to_string(), distr.to_string()]);
        let local_dir = spec.destination.join("dists").join(distr);
        let mut packages_paths = Vec::new();
        for section in &spec.sections {
            for arch in &spec.architectures {
                let rel_path = format!("{}/binary-{}/Packages", section, arch);
                let mut index = PackagesIndex::new(&remote_dir, &local_dir, &rel_path);
                if !index.synchronize(self.fetcher).await? {
                    warn!(
                        "no 'Packages' found for section '{}', architecture '{}'",
                        section, arch
                    );
                    continue;
                }
                if let Some(keep) = self.spec.versions {
                    index.open()?;
                    index.strip_versions(keep as usize)?;
                    index.write().await?;
                }
                let paths = index.local_paths();
                packages_paths.extend(paths.iter().cloned());
                self.log.record_all(paths);
            }
        }
        release.create(distr, self.spec, &packages_paths)?;
        match self.signer {
            Some(signer) => {
                release.sign(signer)?;
                inrelease.create_from(release)?;
            }
            None => warn!("no resigning key available, the synthesized release stays unsigned"),
        }

        Ok(())
    }
}

/// Checksum-aware synchronization of one manifest entry: skip the download
/// when the local copy already verifies, verify after download otherwise,
/// then materialize any `by-hash` aliases as relative symlinks.
///
/// Returns every path produced, or None when the file is absent upstream.
pub async fn sync_by_checksum(
    fetcher: &Fetcher,
    remote_root: &str,
    local_root: &Path,
    entry: &FileEntry,
) -> Result<Option<Vec<PathBuf>>> {
    let local = local_root.join(entry.sub.iter().collect::<PathBuf>());
    if verify_entry(&local, entry).await? {
        debug!("'{}' is up to date, no need to download", local.display());
    } else {
        let remote = join_url(remote_root, &entry.sub);
        match fetcher.fetch(&remote, &local, true).await? {
            FetchOutcome::Downloaded => {
                if !verify_entry(&local, entry).await? {
                    bail!("checksum mismatch for '{}'", local.display());
                }
            }
            FetchOutcome::Missing => {
                warn!("'{}' is listed but absent upstream", remote);
                return Ok(None);
            }
        }
    }

    let mut produced = vec![local.clone()];
    for alias in &entry.by_hash {
        let link = local_root.join(alias.iter().collect::<PathBuf>());
        let link_dir = link
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&link_dir).await?;
        if tokio::fs::symlink_metadata(&link).await.is_ok() {
            tokio::fs::remove_file(&link).await?;
        }
        let target = relative_to(&local, &link_dir);
        std::os::unix::fs::symlink(&target, &link)
            .with_context(|| format!("creating symlink '{}'", link.display()))?;
        debug!("'{}' ==> '{}'", link.display(), target.display());
        produced.push(link);
    }

    Ok(Some(produced))
}

/// True when the local file exists with the expected size and digests.
async fn verify_entry(local: &Path, entry: &FileEntry) -> Result<bool> {
    let Ok(meta) = tokio::fs::metadata(local).await else {
        return Ok(false);
    };
    if meta.len() != entry.size {
        return Ok(false);
    }
    let kinds: Vec<ChecksumKind> = entry.hashes.iter().map(|(k, _)| *k).collect();
    let path = local.to_path_buf();
    let digests = spawn_blocking(move || digest_file(&path, &kinds)).await??;
    for (kind, expected) in &entry.hashes {
        match digests.get(kind) {
            Some(got) if got.eq_ignore_ascii_case(expected) => {}
            _ => {
                debug!("hash comparison failed for '{}'", local.display());
                return Ok(false);
            }
        }
    }

    Ok(true)
}

/// Relative path from `from_dir` to `target`.
fn relative_to(target: &Path, from_dir: &Path) -> PathBuf {
    let target_parts: Vec<_> = target.components().collect();
    let from_parts: Vec<_> = from_dir.components().collect();
    let common = target_parts
        .iter()
        .zip(from_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut relative = PathBuf::new();
    for _ in common..from_parts.len() {
        relative.push("..");
    }
    for part in &target_parts[common..] {
        relative.push(part);
    }

    relative
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_relative_to() {
        assert_eq!(
            relative_to(
                Path::new("/mirror/dists/bullseye/main/binary-amd64/Packages.gz"),
                Path::new("/mirror/dists/bullseye/main/binary-amd64/by-hash/SHA256"),
            ),
            Path::new("../../Packages.gz")
        );
        assert_eq!(
            relative_to(Path::new("/a/b/file"), Path::new("/a/b")),
            Path::new("file")
        );
    }

    #[tokio::test]
    async fn test_sync_by_checksum_skips_valid_local_copy() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let canonical = root.join("dists/bullseye/main/binary-amd64/Packages.gz");
        std::fs::create_dir_all(canonical.parent().unwrap()).unwrap();
        std::fs::write(&canonical, b"compressed index").unwrap();
        let digests = digest_file(&canonical, &[ChecksumKind::Sha256]).unwrap();
        let sha256 = digests[&ChecksumKind::Sha256].clone();

        let entry = FileEntry {
            path: "main/binary-amd64/Packages.gz".to_string(),
            size: 16,
            hashes: vec![(ChecksumKind::Sha256, sha256.clone())],
            sub: ["dists", "bullseye", "main", "binary-amd64", "Packages.gz"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            by_hash: vec![vec![
                "dists".to_string(),
                "bullseye".to_string(),
                "main".to_string(),
                "binary-amd64".to_string(),
                "by-hash".to_string(),
                "SHA256".to_string(),
                sha256.clone(),
            ]],
        };

        // the local copy verifies, so the dead URL is never contacted
        let fetcher = Fetcher::new(Duration::from_secs(1)).unwrap();
        let produced = sync_by_checksum(&fetcher, "http://127.0.0.1:1/none", root, &entry)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(produced.len(), 2);
        let alias = &produced[1];
        assert!(std::fs::symlink_metadata(alias).unwrap().file_type().is_symlink());
        // the alias resolves to the canonical file
        assert_eq!(std::fs::read(alias).unwrap(), b"compressed index");
        let target = std::fs::read_link(alias).unwrap();
        assert_eq!(target, Path::new("../../Packages.gz"));

        // corrupting the file makes verification fail and forces a fetch,
        // which hits the dead URL and errors out
        std::fs::write(&canonical, b"tampered content").unwrap();
        assert!(
            sync_by_checksum(&fetcher, "http://127.0.0.1:1/none", root, &entry)
                .await
                .is_err()
        );
    }
}
