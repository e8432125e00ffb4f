//! Packages index handling
//!
//! One `PackagesIndex` covers a single `dists/<distr>/<section>/
//! binary-<arch>/Packages` base path in every compression variant the
//! mirror carries.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_compression::tokio::write::{BzEncoder, GzipEncoder, LzmaEncoder, XzEncoder};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use log::debug;
use rayon::prelude::*;
use tokio::io::AsyncWriteExt;
use xz2::read::XzDecoder;
use xz2::stream::Stream;

use crate::control::{self, Paragraph, Syntax};
use crate::fetch::{ext_path, join_url, Fetcher, FetchOutcome};
use crate::hash::{digest_file, file_size, ChecksumKind};
use crate::release::FileEntry;

/// Candidate compression extensions, probe order.
pub const PACKAGES_EXTENSIONS: [&str; 5] = ["", ".gz", ".xz", ".bz2", ".lzma"];

/// Expected size and digests of one compression variant, as recorded
/// upstream.
#[derive(Debug, Clone)]
pub struct UpstreamChecksums {
    pub size: u64,
    pub hashes: HashMap<ChecksumKind, String>,
}

/// Size and digests of one re-emitted variant, ready to splice back into a
/// `Release`.
#[derive(Debug, Clone)]
pub struct WrittenVariant {
    pub filename: String,
    pub size: u64,
    pub hashes: HashMap<ChecksumKind, String>,
}

pub struct PackagesIndex {
    remote_dir: String,
    local_dir: PathBuf,
    rel_path: String,
    extensions: Vec<String>,
    checksums: Option<HashMap<String, UpstreamChecksums>>,
    paragraphs: Vec<Paragraph>,
}

impl PackagesIndex {
    /// An index with no upstream checksum knowledge; every candidate
    /// extension is probed.
    pub fn new(remote_dir: &str, local_dir: &Path, rel_path: &str) -> Self {
        PackagesIndex {
            remote_dir: remote_dir.to_string(),
            local_dir: local_dir.to_path_buf(),
            rel_path: rel_path.to_string(),
            extensions: PACKAGES_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            checksums: None,
            paragraphs: Vec::new(),
        }
    }

    /// An index constructed from a `Release` manifest; only the variants
    /// the manifest lists are handled.
    pub fn with_checksums(
        remote_dir: &str,
        local_dir: &Path,
        rel_path: &str,
        checksums: HashMap<String, UpstreamChecksums>,
    ) -> Self {
        let mut extensions: Vec<String> = PACKAGES_EXTENSIONS
            .iter()
            .filter(|e| checksums.contains_key(**e))
            .map(|e| e.to_string())
            .collect();
        let mut extra: Vec<String> = checksums
            .keys()
            .filter(|e| !PACKAGES_EXTENSIONS.contains(&e.as_str()))
            .cloned()
            .collect();
        extra.sort();
        extensions.extend(extra);

        PackagesIndex {
            remote_dir: remote_dir.to_string(),
            local_dir: local_dir.to_path_buf(),
            rel_path: rel_path.to_string(),
            extensions,
            checksums: Some(checksums),
            paragraphs: Vec::new(),
        }
    }

    pub fn rel_path(&self) -> &str {
        &self.rel_path
    }

    pub fn packages(&self) -> &[Paragraph] {
        &self.paragraphs
    }

    fn local_base(&self) -> PathBuf {
        let mut path = self.local_dir.clone();
        path.extend(self.rel_path.split('/'));
        path
    }

    fn local_path(&self, ext: &str) -> PathBuf {
        ext_path(&self.local_base(), ext)
    }

    fn remote_path(&self, ext: &str) -> String {
        format!(
            "{}{}",
            join_url(&self.remote_dir, &[self.rel_path.clone()]),
            ext
        )
    }

    /// Local paths of every variant currently on disk.
    pub fn local_paths(&self) -> Vec<PathBuf> {
        self.extensions
            .iter()
            .map(|ext| self.local_path(ext))
            .filter(|p| p.exists())
            .collect()
    }

    /// Delete every local variant, forcing the next synchronize to
    /// download.
    pub fn remove_local(&self) {
        for ext in &self.extensions {
            let path = self.local_path(ext);
            if path.exists() {
                std::fs::remove_file(&path).ok();
            }
        }
    }

    /// Verify existing local variants against the upstream checksums.
    /// True only when every listed variant is present and matches.
    fn verify_local(&self, checksums: &HashMap<String, UpstreamChecksums>) -> Result<bool> {
        for (ext, upstream) in checksums {
            let path = self.local_path(ext);
            if !path.exists() {
                return Ok(false);
            }
            if !verify_file(&path, upstream.size, &upstream.hashes)? {
                debug!("'{}' failed checksum verification", path.display());
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Bring the index up to date.
    ///
    /// With upstream checksums every listed variant is downloaded and
    /// verified; without them the extensions are probed in order and the
    /// first hit wins. Returns false when the section/architecture simply
    /// does not exist upstream.
    pub async fn synchronize(&self, fetcher: &Fetcher) -> Result<bool> {
        if let Some(checksums) = self.checksums.clone() {
            if self.verify_local(&checksums)? {
                debug!("'{}' is up to date", self.local_base().display());
                return Ok(true);
            }
            let mut any = false;
            for ext in &self.extensions {
                let outcome = fetcher
                    .fetch(&self.remote_path(ext), &self.local_path(ext), true)
                    .await?;
                any |= outcome == FetchOutcome::Downloaded;
            }
            if !any {
                return Ok(false);
            }
            for (ext, upstream) in &checksums {
                let path = self.local_path(ext);
                if !path.exists() {
                    bail!(
                        "'{}' is listed upstream but could not be downloaded",
                        self.remote_path(ext)
                    );
                }
                if !verify_file(&path, upstream.size, &upstream.hashes)? {
                    bail!("checksum mismatch for '{}'", path.display());
                }
            }
            return Ok(true);
        }

        let base = self.local_base();
        let winner = fetcher
            .fetch_first(
                &join_url(&self.remote_dir, &[self.rel_path.clone()]),
                &base,
                &self.extensions,
            )
            .await?;

        Ok(winner.is_some())
    }

    /// Open the first extant variant and parse it.
    pub fn open(&mut self) -> Result<()> {
        let (path, ext) = self
            .extensions
            .iter()
            .map(|ext| (self.local_path(ext), ext.clone()))
            .find(|(p, _)| p.exists())
            .ok_or_else(|| anyhow!("no local copy of '{}'", self.local_base().display()))?;
        let raw = read_decompressed(&path, &ext)?;
        let text = String::from_utf8_lossy(&raw);
        let mut paragraphs = control::parse_paragraphs(&text, &Syntax::packages())?;
        // a lone paragraph is a package list only if it describes a package
        if paragraphs.len() == 1 && !paragraphs[0].contains("Filename") {
            paragraphs.clear();
        }
        debug!(
            "parsed {} package stanzas from '{}'",
            paragraphs.len(),
            path.display()
        );
        self.paragraphs = paragraphs;

        Ok(())
    }

    /// Manifest entries for the package blobs this index references.
    pub fn subfiles(&self) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::with_capacity(self.paragraphs.len());
        for p in &self.paragraphs {
            let filename = p
                .scalar("Filename")
                .ok_or_else(|| anyhow!("package stanza without a Filename field"))?;
            let size: u64 = p
                .scalar("Size")
                .ok_or_else(|| anyhow!("package '{}' without a Size field", filename))?
                .parse()
                .with_context(|| format!("bad Size for '{}'", filename))?;
            let mut hashes = Vec::new();
            for kind in ChecksumKind::ALL {
                if let Some(hex) = p.scalar_ignore_case(kind.package_field()) {
                    hashes.push((kind, hex.to_string()));
                }
            }
            if hashes.is_empty() {
                bail!("package '{}' carries no checksum field", filename);
            }
            entries.push(FileEntry {
                path: filename.to_string(),
                size,
                hashes,
                sub: filename.split('/').map(str::to_string).collect(),
                by_hash: Vec::new(),
            });
        }

        Ok(entries)
    }

    /// Keep only the `keep` greatest versions of every package.
    pub fn strip_versions(&mut self, keep: usize) -> Result<()> {
        if keep == 0 {
            bail!("the number of versions to retain must be positive");
        }
        let before = self.paragraphs.len();
        let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
        for (n, p) in self.paragraphs.iter().enumerate() {
            if let Some(name) = p.scalar("Package") {
                groups.entry(name).or_default().push(n);
            }
        }
        let mut drop = vec![false; self.paragraphs.len()];
        for (_, mut indices) in groups {
            if indices.len() <= keep {
                continue;
            }
            // stable descending sort; ties keep their original order
            indices.sort_by(|&a, &b| {
                let va = self.paragraphs[a].scalar("Version").unwrap_or_default();
                let vb = self.paragraphs[b].scalar("Version").unwrap_or_default();
                crate::version::compare(vb, va)
            });
            for &n in &indices[keep..] {
                drop[n] = true;
            }
        }
        let mut n = 0;
        self.paragraphs.retain(|_| {
            let keep_this = !drop[n];
            n += 1;
            keep_this
        });
        debug!(
            "version retention: {} of {} package stanzas kept",
            self.paragraphs.len(),
            before
        );

        Ok(())
    }

    /// Serialize the current stanzas into every configured compression
    /// variant, replacing previous content.
    pub async fn write(&self) -> Result<()> {
        let body = control::emit_paragraphs(&self.paragraphs, &Syntax::packages());
        for ext in &self.extensions {
            self.write_variant(body.as_bytes(), ext).await?;
        }

        Ok(())
    }

    async fn write_variant(&self, body: &[u8], ext: &str) -> Result<()> {
        let target = self.local_path(ext);
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&parent).await?;
        let temp = tempfile::NamedTempFile::new_in(&parent)?;
        let file = tokio::fs::File::create(temp.path()).await?;
        match ext {
            "" => {
                let mut out = file;
                out.write_all(body).await?;
                out.shutdown().await?;
            }
            ".gz" => {
                let mut out = GzipEncoder::new(file);
                out.write_all(body).await?;
                out.shutdown().await?;
            }
            ".xz" => {
                let mut out = XzEncoder::new(file);
                out.write_all(body).await?;
                out.shutdown().await?;
            }
            ".bz2" => {
                let mut out = BzEncoder::new(file);
                out.write_all(body).await?;
                out.shutdown().await?;
            }
            ".lzma" => {
                let mut out = LzmaEncoder::new(file);
                out.write_all(body).await?;
                out.shutdown().await?;
            }
            other => bail!("unsupported compression extension '{}'", other),
        }
        temp.persist(&target)
            .with_context(|| format!("replacing '{}'", target.display()))?;

        Ok(())
    }

    /// Size and digests of every variant produced by [`write`], keyed by
    /// extension.
    pub fn updated_checksums(&self) -> Result<HashMap<String, WrittenVariant>> {
        self.extensions
            .par_iter()
            .map(|ext| -> Result<(String, WrittenVariant)> {
                let path = self.local_path(ext);
                let size = file_size(&path)?;
                let hashes = digest_file(&path, &ChecksumKind::ALL)?;
                Ok((
                    ext.clone(),
                    WrittenVariant {
                        filename: format!("{}{}", self.rel_path, ext),
                        size,
                        hashes,
                    },
                ))
            })
            .collect()
    }
}

/// Check a file against an expected size and digest set.
pub fn verify_file(
    path: &Path,
    size: u64,
    hashes: &HashMap<ChecksumKind, String>,
) -> Result<bool> {
    if file_size(path)? != size {
        return Ok(false);
    }
    let kinds: Vec<ChecksumKind> = hashes.keys().copied().collect();
    let actual = digest_file(path, &kinds)?;
    for (kind, expected) in hashes {
        match actual.get(kind) {
            Some(got) if got.eq_ignore_ascii_case(expected) => {}
            _ => return Ok(false),
        }
    }

    Ok(true)
}

fn read_decompressed(path: &Path, ext: &str) -> Result<Vec<u8>> {
    let file = std::fs::File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut raw = Vec::new();
    match ext {
        "" => {
            let mut file = file;
            file.read_to_end(&mut raw)?;
        }
        ".gz" => {
            GzDecoder::new(file).read_to_end(&mut raw)?;
        }
        ".xz" => {
            XzDecoder::new(file).read_to_end(&mut raw)?;
        }
        ".bz2" => {
            BzDecoder::new(file).read_to_end(&mut raw)?;
        }
        ".lzma" => {
            let stream = Stream::new_lzma_decoder(u64::MAX)?;
            XzDecoder::new_stream(file, stream).read_to_end(&mut raw)?;
        }
        other => bail!("unsupported compression extension '{}'", other),
    }

    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = "\
Package: foo
Version: 1.0
Architecture: amd64
Filename: pool/main/f/foo/foo_1.0_amd64.deb
Size: 10
SHA256: 1111111111111111111111111111111111111111111111111111111111111111

Package: foo
Version: 2.0
Architecture: amd64
Filename: pool/main/f/foo/foo_2.0_amd64.deb
Size: 11
SHA256: 2222222222222222222222222222222222222222222222222222222222222222

Package: foo
Version: 1.1
Architecture: amd64
Filename: pool/main/f/foo/foo_1.1_amd64.deb
Size: 12
SHA256: 3333333333333333333333333333333333333333333333333333333333333333

Package: bar
Version: 3.0
Architecture: amd64
Filename: pool/main/b/bar/bar_3.0_amd64.deb
Size: 13
MD5sum: 44444444444444444444444444444444
";

    fn fixture_index(dir: &Path) -> PackagesIndex {
        let rel = "main/binary-amd64/Packages";
        let base: PathBuf = {
            let mut p = dir.to_path_buf();
            p.extend(rel.split('/'));
            p
        };
        std::fs::create_dir_all(base.parent().unwrap()).unwrap();
        std::fs::write(&base, FIXTURE).unwrap();

        PackagesIndex::new("http://localhost/unused", dir, rel)
    }

    #[test]
    fn test_open_and_subfiles() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = fixture_index(dir.path());
        index.open().unwrap();
        assert_eq!(index.packages().len(), 4);
        let entries = index.subfiles().unwrap();
        assert_eq!(entries[0].path, "pool/main/f/foo/foo_1.0_amd64.deb");
        assert_eq!(
            entries[0].sub,
            vec!["pool", "main", "f", "foo", "foo_1.0_amd64.deb"]
        );
        assert_eq!(entries[0].hashes, vec![(
            ChecksumKind::Sha256,
            "1111111111111111111111111111111111111111111111111111111111111111".to_string()
        )]);
        assert_eq!(entries[3].hashes[0].0, ChecksumKind::Md5);
    }

    #[test]
    fn test_strip_versions_retention() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = fixture_index(dir.path());
        index.open().unwrap();
        index.strip_versions(2).unwrap();
        let versions: Vec<(&str, &str)> = index
            .packages()
            .iter()
            .map(|p| (p.scalar("Package").unwrap(), p.scalar("Version").unwrap()))
            .collect();
        assert_eq!(
            versions,
            vec![("foo", "2.0"), ("foo", "1.1"), ("bar", "3.0")]
        );
        assert!(index.strip_versions(0).is_err());
    }

    #[tokio::test]
    async fn test_write_all_variants_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = fixture_index(dir.path());
        index.open().unwrap();
        index.strip_versions(2).unwrap();
        index.write().await.unwrap();

        let plain = read_decompressed(&index.local_path(""), "").unwrap();
        for ext in &[".gz", ".xz", ".bz2", ".lzma"] {
            let variant = read_decompressed(&index.local_path(ext), ext).unwrap();
            assert_eq!(variant, plain, "variant '{}' differs", ext);
        }

        let updated = index.updated_checksums().unwrap();
        assert_eq!(updated.len(), PACKAGES_EXTENSIONS.len());
        let gz = &updated[".gz"];
        assert_eq!(gz.filename, "main/binary-amd64/Packages.gz");
        assert_eq!(gz.size, file_size(&index.local_path(".gz")).unwrap());
        assert!(verify_file(&index.local_path(".gz"), gz.size, &gz.hashes).unwrap());
        // a fresh parse of the rewritten index sees the retained stanzas only
        let mut reopened = PackagesIndex::new("http://localhost/unused", dir.path(), index.rel_path());
        reopened.open().unwrap();
        assert_eq!(reopened.packages().len(), 3);
    }
}
