//! Release and InRelease handling
//!
//! Both variants share one implementation: the inline-signed flavor strips
//! its PGP envelope on open and remembers the signature block so a sibling
//! can be regenerated without re-signing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use rayon::prelude::*;
use regex::Regex;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::config::MirrorSpec;
use crate::control::{self, ChecksumEntry, FieldValue, Paragraph, Syntax};
use crate::fetch::{atomic_write, join_url, Fetcher, FetchOutcome};
use crate::hash::{digest_file, file_size, kind_from_field, ChecksumKind};
use crate::packages::{PackagesIndex, UpstreamChecksums, WrittenVariant};
use crate::sign::ReleaseSigner;

pub const CHECKSUM_FIELDS: [&str; 4] = ["MD5Sum", "SHA1", "SHA256", "SHA512"];
const SELF_REFERENCES: [&str; 3] = ["Release", "Release.gpg", "InRelease"];

const MESSAGE_START: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_START: &str = "-----BEGIN PGP SIGNATURE-----";
const SIGNATURE_END: &str = "-----END PGP SIGNATURE-----";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// `Release`, detached signature in a sibling `Release.gpg`.
    Plain,
    /// `InRelease`, inline-signed.
    Inline,
}

impl Variant {
    fn file_name(self) -> &'static str {
        match self {
            Variant::Plain => "Release",
            Variant::Inline => "InRelease",
        }
    }
}

/// One file referenced by a Release (or a package blob referenced by a
/// Packages index), merged across checksum algorithms.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Path as listed upstream.
    pub path: String,
    pub size: u64,
    pub hashes: Vec<(ChecksumKind, String)>,
    /// Path components relative to the mirror root.
    pub sub: Vec<String>,
    /// `by-hash` alias paths, one per algorithm, when advertised.
    pub by_hash: Vec<Vec<String>>,
}

pub struct ReleaseFile {
    variant: Variant,
    remote_root: String,
    local_root: PathBuf,
    sub: Vec<String>,
    paragraph: Option<Paragraph>,
    signature: Option<String>,
}

impl ReleaseFile {
    pub fn new(variant: Variant, remote_root: &str, local_root: &Path, distr: &str) -> Self {
        let sub = vec![
            "dists".to_string(),
            distr.to_string(),
            variant.file_name().to_string(),
        ];
        debug!(
            "release file: '{}' ==> '{}'",
            join_url(remote_root, &sub),
            local_root.join(sub.iter().collect::<PathBuf>()).display()
        );

        ReleaseFile {
            variant,
            remote_root: remote_root.to_string(),
            local_root: local_root.to_path_buf(),
            sub,
            paragraph: None,
            signature: None,
        }
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn local(&self) -> PathBuf {
        self.local_root.join(self.sub.iter().collect::<PathBuf>())
    }

    fn sig_path(&self) -> PathBuf {
        let mut name = self.local().into_os_string();
        name.push(".gpg");
        PathBuf::from(name)
    }

    fn local_dir(&self) -> PathBuf {
        self.local().parent().unwrap_or(Path::new(".")).to_path_buf()
    }

    fn remote(&self) -> String {
        join_url(&self.remote_root, &self.sub)
    }

    fn remote_dir(&self) -> String {
        join_url(&self.remote_root, &self.sub[..self.sub.len() - 1])
    }

    /// Extant local paths belonging to this file.
    pub fn local_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if self.local().exists() {
            paths.push(self.local());
        }
        if self.variant == Variant::Plain && self.sig_path().exists() {
            paths.push(self.sig_path());
        }

        paths
    }

    /// Fetch from upstream; also fetches the detached signature for the
    /// plain variant. Missing upstream is not an error.
    pub async fn synchronize(&mut self, fetcher: &Fetcher) -> Result<bool> {
        let got = fetcher.fetch(&self.remote(), &self.local(), true).await?
            == FetchOutcome::Downloaded;
        if !got {
            return Ok(false);
        }
        if self.variant == Variant::Plain {
            let sig_remote = format!("{}.gpg", self.remote());
            fetcher.fetch(&sig_remote, &self.sig_path(), true).await?;
        }
        self.open()?;

        Ok(true)
    }

    /// Parse the file on disk, stripping the PGP envelope for the inline
    /// variant.
    pub fn open(&mut self) -> Result<()> {
        let local = self.local();
        let raw = std::fs::read_to_string(&local)
            .with_context(|| format!("reading '{}'", local.display()))?;
        let (body, signature) = match self.variant {
            Variant::Plain => (raw, None),
            Variant::Inline => split_envelope(&raw),
        };
        let mut paragraphs = control::parse_paragraphs(&body, &Syntax::release())
            .with_context(|| format!("parsing '{}'", local.display()))?;
        if paragraphs.len() != 1 {
            bail!(
                "'{}' must contain exactly one paragraph, found {}",
                local.display(),
                paragraphs.len()
            );
        }
        let mut paragraph = paragraphs.pop().unwrap();
        convert_checksums(&mut paragraph, &local)?;
        convert_components(&mut paragraph, &local);
        self.signature = signature;
        self.paragraph = Some(paragraph);

        Ok(())
    }

    fn paragraph(&self) -> Result<&Paragraph> {
        self.paragraph
            .as_ref()
            .ok_or_else(|| anyhow!("'{}' has not been opened", self.local().display()))
    }

    fn paragraph_mut(&mut self) -> Result<&mut Paragraph> {
        let local = self.local();
        self.paragraph
            .as_mut()
            .ok_or_else(|| anyhow!("'{}' has not been opened", local.display()))
    }

    pub fn architectures(&self) -> Vec<String> {
        self.paragraph
            .as_ref()
            .and_then(|p| p.list("Architectures"))
            .map(<[String]>::to_vec)
            .unwrap_or_default()
    }

    pub fn components(&self) -> Vec<String> {
        self.paragraph
            .as_ref()
            .and_then(|p| p.list("Components"))
            .map(<[String]>::to_vec)
            .unwrap_or_default()
    }

    fn flag(&self, name: &str) -> bool {
        self.paragraph
            .as_ref()
            .and_then(|p| p.scalar(name))
            .map(|v| {
                let v = v.to_ascii_lowercase();
                v == "yes" || v == "true"
            })
            .unwrap_or(false)
    }

    /// Upstream advertises content-addressed index aliases.
    pub fn acquire_by_hash(&self) -> bool {
        self.flag("Acquire-By-Hash")
    }

    /// The pseudo-architecture `all` must not be forced into the grid.
    pub fn skip_all_architecture(&self) -> bool {
        self.flag("No-Support-for-Architecture-all")
    }

    /// The file manifest, merged across algorithms.
    pub fn subfiles(&self) -> Result<Vec<FileEntry>> {
        let p = self.paragraph()?;
        let by_hash = self.acquire_by_hash();
        let release_sub = &self.sub[..self.sub.len() - 1];
        let mut entries: Vec<FileEntry> = Vec::new();
        let mut by_path: HashMap<String, usize> = HashMap::new();
        for field in CHECKSUM_FIELDS {
            let Some(list) = p.checksums(field) else {
                continue;
            };
            let kind = kind_from_field(field)?;
            for record in list {
                let slot = match by_path.get(&record.filename) {
                    Some(&n) => {
                        if entries[n].size != record.size {
                            bail!(
                                "sizes do not match for '{}' in '{}'",
                                record.filename,
                                self.local().display()
                            );
                        }
                        n
                    }
                    None => {
                        let mut sub = release_sub.to_vec();
                        sub.extend(record.filename.split('/').map(str::to_string));
                        entries.push(FileEntry {
                            path: record.filename.clone(),
                            size: record.size,
                            hashes: Vec::new(),
                            sub,
                            by_hash: Vec::new(),
                        });
                        by_path.insert(record.filename.clone(), entries.len() - 1);
                        entries.len() - 1
                    }
                };
                entries[slot].hashes.push((kind, record.hash.clone()));
                if by_hash {
                    let mut alias = release_sub.to_vec();
                    if let Some((dir, _)) = record.filename.rsplit_once('/') {
                        alias.extend(dir.split('/').map(str::to_string));
                    }
                    alias.push("by-hash".to_string());
                    alias.push(field.to_string());
                    alias.push(record.hash.clone());
                    entries[slot].by_hash.push(alias);
                }
            }
        }

        Ok(entries)
    }

    /// Locate the `Packages` index of a (section, architecture) pair and
    /// hand back a handler primed with the upstream checksums.
    pub fn packages_index(&self, section: &str, arch: &str) -> Result<Option<PackagesIndex>> {
        let p = self.paragraph()?;
        if let Some(archs) = p.list("Architectures") {
            if !archs.iter().any(|a| a == arch) {
                warn!(
                    "architecture '{}' is not covered by '{}'",
                    arch,
                    self.local().display()
                );
                return Ok(None);
            }
        }
        if let Some(components) = p.list("Components") {
            if !components.iter().any(|c| c == section) {
                warn!(
                    "section '{}' is not covered by '{}'",
                    section,
                    self.local().display()
                );
                return Ok(None);
            }
        }

        let prefix = format!("{}/binary-{}/", section, arch);
        let mut grouped: HashMap<String, HashMap<String, UpstreamChecksums>> = HashMap::new();
        for entry in self.subfiles()? {
            let (base, ext) = split_extension(&entry.path);
            if !base.starts_with(&prefix) || base_name(base) != "Packages" {
                continue;
            }
            grouped.entry(base.to_string()).or_default().insert(
                ext.to_string(),
                UpstreamChecksums {
                    size: entry.size,
                    hashes: entry.hashes.into_iter().collect(),
                },
            );
        }
        if grouped.len() != 1 {
            if arch == "all" {
                return Ok(None);
            }
            bail!(
                "found {} version(s) of 'Packages' for '{}/binary-{}' in '{}'",
                grouped.len(),
                section,
                arch,
                self.local().display()
            );
        }
        let (base, checksums) = grouped.into_iter().next().unwrap();

        Ok(Some(PackagesIndex::with_checksums(
            &self.remote_dir(),
            &self.local_dir(),
            &base,
            checksums,
        )))
    }

    /// Delete `Valid-Until`, and the stale detached signature with it.
    pub fn remove_valid_until(&mut self) -> Result<()> {
        if self.paragraph_mut()?.remove("Valid-Until").is_some() {
            debug!("removed 'Valid-Until' from '{}'", self.local().display());
        }
        if self.variant == Variant::Plain {
            let sig = self.sig_path();
            if sig.exists() {
                debug!("removing '{}'", sig.display());
                std::fs::remove_file(&sig)
                    .with_context(|| format!("removing '{}'", sig.display()))?;
            }
        }
        self.write()
    }

    fn strip_filename_records(&mut self, patterns: &[Regex]) -> Result<usize> {
        let p = self.paragraph_mut()?;
        let mut removed = 0;
        for field in CHECKSUM_FIELDS {
            if let Some(FieldValue::Checksums(records)) = p.get_mut(field) {
                let before = records.len();
                records.retain(|r| !patterns.iter().any(|rx| rx.is_match(&r.filename)));
                removed += before - records.len();
            }
        }

        Ok(removed)
    }

    /// Drop architectures outside `keep` (the pseudo-architecture `all`
    /// always stays) together with their checksum records.
    pub fn strip_architectures(&mut self, keep: &[String]) -> Result<()> {
        let current = self.architectures();
        if current.is_empty() {
            warn!(
                "current 'Architectures' list of '{}' is empty, nothing to strip",
                self.local().display()
            );
            return Ok(());
        }
        let kept: Vec<String> = current
            .iter()
            .filter(|a| keep.contains(a) || a.as_str() == "all")
            .cloned()
            .collect();
        let dropped: Vec<String> = current
            .iter()
            .filter(|a| !kept.contains(a))
            .cloned()
            .collect();
        if dropped.is_empty() {
            debug!("nothing to remove from 'Architectures'");
            return Ok(());
        }
        let patterns = dropped
            .iter()
            .map(|arch| Regex::new(&format!("-{}(\\.|$|/)", regex::escape(arch))))
            .collect::<Result<Vec<_>, _>>()?;
        let removed = self.strip_filename_records(&patterns)?;
        debug!(
            "architectures {:?} stripped, {} checksum records removed",
            dropped, removed
        );
        self.paragraph_mut()?
            .set("Architectures", FieldValue::List(kept));
        self.write()
    }

    /// Drop components outside `keep` together with their checksum
    /// records.
    pub fn strip_sections(&mut self, keep: &[String]) -> Result<()> {
        let current = self.components();
        if current.is_empty() {
            warn!(
                "current 'Components' list of '{}' is empty, nothing to strip",
                self.local().display()
            );
            return Ok(());
        }
        let kept: Vec<String> = current.iter().filter(|c| keep.contains(c)).cloned().collect();
        let dropped: Vec<String> = current
            .iter()
            .filter(|c| !kept.contains(c))
            .cloned()
            .collect();
        if dropped.is_empty() {
            debug!("nothing to remove from 'Components'");
            return Ok(());
        }
        let patterns = dropped
            .iter()
            .map(|section| Regex::new(&format!("^{}/", regex::escape(section))))
            .collect::<Result<Vec<_>, _>>()?;
        let removed = self.strip_filename_records(&patterns)?;
        debug!(
            "sections {:?} stripped, {} checksum records removed",
            dropped, removed
        );
        self.paragraph_mut()?
            .set("Components", FieldValue::List(kept));
        self.write()
    }

    /// Drop every `.diff` (pdiff) record; the mirror never carries them.
    pub fn strip_diff_directories(&mut self) -> Result<()> {
        let patterns = [Regex::new(r"\.diff(/|$)").unwrap()];
        let removed = self.strip_filename_records(&patterns)?;
        if removed > 0 {
            debug!("{} '.diff' checksum records removed", removed);
        }
        self.write()
    }

    /// Re-download every (section × architecture) `Packages`, retain the
    /// `keep` latest versions in each, and splice the rewritten sizes and
    /// digests back into this file.
    pub async fn strip_packages_versions(&mut self, keep: usize, fetcher: &Fetcher) -> Result<()> {
        let sections = self.components();
        let archs = self.architectures();
        for section in &sections {
            for arch in &archs {
                let Some(mut index) = self.packages_index(section, arch)? else {
                    warn!(
                        "no 'Packages' found for section '{}', architecture '{}'",
                        section, arch
                    );
                    continue;
                };
                info!(
                    "retaining {} version(s) per package in '{}'",
                    keep,
                    index.rel_path()
                );
                index.remove_local();
                if !index.synchronize(fetcher).await? {
                    warn!("unable to synchronize '{}'", index.rel_path());
                    continue;
                }
                index.open()?;
                index.strip_versions(keep)?;
                index.write().await?;
                let updated = index.updated_checksums()?;
                self.splice_checksums(&updated)?;
            }
        }
        self.write()
    }

    /// Replace the checksum records of rewritten `Packages` variants. The
    /// upstream spelling of each algorithm field is preserved.
    fn splice_checksums(&mut self, updated: &HashMap<String, WrittenVariant>) -> Result<()> {
        for variant in updated.values() {
            for (kind, hex) in &variant.hashes {
                let Some(field) = self
                    .paragraph()?
                    .key_ignore_case(kind.release_field())
                    .map(str::to_string)
                else {
                    debug!("no '{}' field, nothing to update", kind.release_field());
                    continue;
                };
                if let Some(FieldValue::Checksums(records)) =
                    self.paragraph_mut()?.get_mut(&field)
                {
                    records.retain(|r| r.filename != variant.filename);
                    records.push(ChecksumEntry {
                        hash: hex.clone(),
                        size: variant.size,
                        filename: variant.filename.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Serialize the paragraph back to disk. Does not sign.
    pub fn write(&self) -> Result<()> {
        let mut body = String::new();
        control::emit_paragraph(self.paragraph()?, &Syntax::release(), &mut body);
        atomic_write(&self.local(), body.as_bytes())
    }

    /// Sign the file: detached `Release.gpg` for the plain variant, an
    /// in-place cleartext signature for the inline one.
    pub fn sign(&mut self, signer: &ReleaseSigner) -> Result<()> {
        match self.variant {
            Variant::Plain => signer.sign_detached(&self.local(), &self.sig_path())?,
            Variant::Inline => {
                signer.sign_cleartext(&self.local())?;
                self.open()?;
            }
        }

        Ok(())
    }

    /// Synthesize a Release when upstream provides none, hashing the local
    /// `Packages` files.
    pub fn create(&mut self, distr: &str, mirror: &MirrorSpec, packages: &[PathBuf]) -> Result<()> {
        info!("creating '{}' from scratch", self.local().display());
        let date = OffsetDateTime::now_utc().format(&format_description!(
            "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] UTC"
        ))?;
        let mut p = Paragraph::new();
        p.push("Codename", FieldValue::Scalar(distr.to_string()));
        p.push("Date", FieldValue::Scalar(date));
        p.push(
            "Architectures",
            FieldValue::List(mirror.architectures.clone()),
        );
        p.push("Components", FieldValue::List(mirror.sections.clone()));

        let local_dir = self.local_dir();
        let hashed = packages
            .par_iter()
            .map(|path| -> Result<(String, u64, HashMap<ChecksumKind, String>)> {
                let rel = path.strip_prefix(&local_dir).with_context(|| {
                    format!(
                        "'{}' is outside of '{}'",
                        path.display(),
                        local_dir.display()
                    )
                })?;
                let rel = rel
                    .iter()
                    .map(|c| c.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                Ok((rel, file_size(path)?, digest_file(path, &ChecksumKind::ALL)?))
            })
            .collect::<Result<Vec<_>>>()?;
        for field in CHECKSUM_FIELDS {
            let kind = kind_from_field(field)?;
            let records = hashed
                .iter()
                .map(|(rel, size, digests)| ChecksumEntry {
                    hash: digests[&kind].clone(),
                    size: *size,
                    filename: rel.clone(),
                })
                .collect();
            p.push(field, FieldValue::Checksums(records));
        }
        self.paragraph = Some(p);
        self.write()?;
        self.open()
    }

    /// Produce this variant from an already prepared sibling without
    /// re-computing or re-signing anything.
    pub fn create_from(&mut self, other: &ReleaseFile) -> Result<()> {
        let body = other.plain_body()?;
        let signature = other.stored_signature()?;
        match self.variant {
            Variant::Inline => match signature {
                Some(sig) => {
                    let mut out = String::with_capacity(body.len() + sig.len() + 64);
                    out.push_str(MESSAGE_START);
                    // the digest the sibling's signature used is unknown here
                    warn!("assuming 'Hash: SHA512' for the inline signature header");
                    out.push_str("\nHash: SHA512\n\n");
                    out.push_str(&body);
                    out.push_str(&sig);
                    atomic_write(&self.local(), out.as_bytes())?;
                }
                None => {
                    warn!(
                        "'{}' carries no signature, writing '{}' unsigned",
                        other.local().display(),
                        self.local().display()
                    );
                    atomic_write(&self.local(), body.as_bytes())?;
                }
            },
            Variant::Plain => {
                atomic_write(&self.local(), body.as_bytes())?;
                if let Some(sig) = signature {
                    atomic_write(&self.sig_path(), sig.as_bytes())?;
                }
            }
        }
        self.open()
    }

    /// The parseable body, with any PGP envelope removed.
    fn plain_body(&self) -> Result<String> {
        let raw = std::fs::read_to_string(self.local())
            .with_context(|| format!("reading '{}'", self.local().display()))?;
        Ok(match self.variant {
            Variant::Plain => raw,
            Variant::Inline => split_envelope(&raw).0,
        })
    }

    /// The signature block covering the body, if any.
    fn stored_signature(&self) -> Result<Option<String>> {
        match self.variant {
            Variant::Inline => Ok(self.signature.clone()),
            Variant::Plain => {
                let sig = self.sig_path();
                if !sig.exists() {
                    warn!("release file '{}' has no signature", self.local().display());
                    return Ok(None);
                }
                Ok(Some(std::fs::read_to_string(&sig).with_context(|| {
                    format!("reading '{}'", sig.display())
                })?))
            }
        }
    }
}

/// Split an inline-signed document into its body and signature block. A
/// document without an envelope is returned whole.
fn split_envelope(raw: &str) -> (String, Option<String>) {
    let mut lines = raw.lines();
    let mut started = false;
    for line in &mut lines {
        if line.starts_with(MESSAGE_START) {
            started = true;
            break;
        }
    }
    if !started {
        return (raw.to_string(), None);
    }

    let mut body = String::new();
    let mut signature = String::new();
    let mut in_signature = false;
    // armor headers between the marker and the body
    for line in &mut lines {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("Hash:") || trimmed.starts_with("Comment:") {
            continue;
        }
        if line.starts_with(SIGNATURE_START) {
            in_signature = true;
            signature.push_str(line);
            signature.push('\n');
        } else {
            body.push_str(line);
            body.push('\n');
        }
        break;
    }
    for line in lines {
        if in_signature {
            signature.push_str(line);
            signature.push('\n');
            if line.starts_with(SIGNATURE_END) {
                break;
            }
        } else if line.starts_with(SIGNATURE_START) {
            in_signature = true;
            signature.push_str(line);
            signature.push('\n');
        } else {
            body.push_str(line);
            body.push('\n');
        }
    }

    (body, in_signature.then_some(signature))
}

/// Convert the raw value lines of every declared checksum field,
/// rejecting self-referential records.
fn convert_checksums(p: &mut Paragraph, path: &Path) -> Result<()> {
    for field in CHECKSUM_FIELDS {
        let lines = match p.get(field) {
            None | Some(FieldValue::Checksums(_)) => continue,
            Some(FieldValue::Lines(lines)) => lines.clone(),
            Some(_) => bail!(
                "'{}': field '{}' is not a checksum list",
                path.display(),
                field
            ),
        };
        let mut records = Vec::with_capacity(lines.len());
        for line in &lines {
            let mut parts = line.split_whitespace();
            let (Some(hash), Some(size), Some(filename), None) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                bail!(
                    "'{}': checksum line '{}' does not split cleanly",
                    path.display(),
                    line
                );
            };
            if SELF_REFERENCES.contains(&filename) {
                warn!(
                    "'{}' includes checksums for itself, skipping '{}'",
                    path.display(),
                    filename
                );
                continue;
            }
            records.push(ChecksumEntry {
                hash: hash.to_string(),
                size: size
                    .parse()
                    .with_context(|| format!("bad size in checksum line '{}'", line))?,
                filename: filename.to_string(),
            });
        }
        p.set(field, FieldValue::Checksums(records));
    }

    Ok(())
}

/// Security archives list components as `updates/main`; the mirrored
/// layout uses flat names.
fn convert_components(p: &mut Paragraph, path: &Path) {
    match p.get_mut("Components") {
        Some(FieldValue::List(components)) => {
            *components = components
                .iter()
                .map(|c| c.rsplit('/').next().unwrap_or(c.as_str()).to_string())
                .filter(|c| !c.is_empty())
                .collect();
        }
        _ => warn!("'Components' field is absent in '{}'", path.display()),
    }
}

/// Split a trailing compression extension off the file name part.
fn split_extension(path: &str) -> (&str, &str) {
    let name_start = path.rfind('/').map(|n| n + 1).unwrap_or(0);
    match path[name_start..].rfind('.') {
        Some(dot) if dot > 0 => path.split_at(name_start + dot),
        _ => (path, ""),
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELEASE: &str = "\
Origin: Debian
Codename: bullseye
Date: Sat, 09 Oct 2021 09:51:05 UTC
Architectures: amd64 arm64 all
Components: updates/main updates/contrib
MD5Sum:
 11111111111111111111111111111111       1234 main/binary-amd64/Packages
 22222222222222222222222222222222        567 main/binary-amd64/Packages.gz
 99999999999999999999999999999999        100 Release
SHA256:
 1111111111111111111111111111111111111111111111111111111111111111       1234 main/binary-amd64/Packages
 2222222222222222222222222222222222222222222222222222222222222222        567 main/binary-amd64/Packages.gz
 3333333333333333333333333333333333333333333333333333333333333333        890 contrib/binary-arm64/Packages.xz
 4444444444444444444444444444444444444444444444444444444444444444        321 main/binary-amd64/Packages.diff/Index
";

    fn release_fixture(dir: &Path, content: &str) -> ReleaseFile {
        let local = dir.join("dists/bullseye/Release");
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(&local, content).unwrap();
        let mut release = ReleaseFile::new(Variant::Plain, "http://localhost/debian", dir, "bullseye");
        release.open().unwrap();
        release
    }

    #[test]
    fn test_open_converts_checksums_and_components() {
        let dir = tempfile::tempdir().unwrap();
        let release = release_fixture(dir.path(), RELEASE);
        // components reduced to basenames
        assert_eq!(release.components(), vec!["main", "contrib"]);
        let p = release.paragraph().unwrap();
        // the self-referential record is dropped
        let md5 = p.checksums("MD5Sum").unwrap();
        assert_eq!(md5.len(), 2);
        assert!(md5.iter().all(|r| r.filename != "Release"));
    }

    #[test]
    fn test_subfiles_merges_algorithms() {
        let dir = tempfile::tempdir().unwrap();
        let release = release_fixture(dir.path(), RELEASE);
        let entries = release.subfiles().unwrap();
        assert_eq!(entries.len(), 4);
        let packages = entries
            .iter()
            .find(|e| e.path == "main/binary-amd64/Packages")
            .unwrap();
        assert_eq!(packages.size, 1234);
        assert_eq!(packages.hashes.len(), 2);
        assert_eq!(
            packages.sub,
            vec!["dists", "bullseye", "main", "binary-amd64", "Packages"]
        );
        assert!(packages.by_hash.is_empty());
    }

    #[test]
    fn test_subfiles_size_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let content = "\
MD5Sum:
 11111111111111111111111111111111       1234 main/binary-amd64/Packages
SHA256:
 1111111111111111111111111111111111111111111111111111111111111111       4321 main/binary-amd64/Packages
";
        let release = release_fixture(dir.path(), content);
        assert!(release.subfiles().is_err());
    }

    #[test]
    fn test_subfiles_by_hash_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!("Acquire-By-Hash: yes\n{}", RELEASE);
        let release = release_fixture(dir.path(), &content);
        let entries = release.subfiles().unwrap();
        let packages = entries
            .iter()
            .find(|e| e.path == "main/binary-amd64/Packages")
            .unwrap();
        assert_eq!(packages.by_hash.len(), 2);
        assert_eq!(
            packages.by_hash[0],
            vec![
                "dists",
                "bullseye",
                "main",
                "binary-amd64",
                "by-hash",
                "MD5Sum",
                "11111111111111111111111111111111"
            ]
        );
        assert_eq!(packages.by_hash[1][5], "SHA256");
    }

    #[test]
    fn test_packages_index_selection() {
        let dir = tempfile::tempdir().unwrap();
        let release = release_fixture(dir.path(), RELEASE);
        let index = release.packages_index("main", "amd64").unwrap().unwrap();
        assert_eq!(index.rel_path(), "main/binary-amd64/Packages");
        // covered architecture without any Packages entry
        assert!(release.packages_index("main", "all").unwrap().is_none());
        // architecture outside the Architectures list
        assert!(release.packages_index("main", "sparc").unwrap().is_none());
        assert!(release.packages_index("invalid", "amd64").unwrap().is_none());
    }

    #[test]
    fn test_strip_architectures() {
        let dir = tempfile::tempdir().unwrap();
        let mut release = release_fixture(dir.path(), RELEASE);
        release
            .strip_architectures(&["amd64".to_string()])
            .unwrap();
        assert_eq!(release.architectures(), vec!["amd64", "all"]);
        let p = release.paragraph().unwrap();
        let sha256 = p.checksums("SHA256").unwrap();
        assert!(sha256.iter().all(|r| !r.filename.contains("arm64")));
        assert!(sha256.iter().any(|r| r.filename.contains("amd64")));
    }

    #[test]
    fn test_strip_sections() {
        let dir = tempfile::tempdir().unwrap();
        let mut release = release_fixture(dir.path(), RELEASE);
        release.strip_sections(&["main".to_string()]).unwrap();
        assert_eq!(release.components(), vec!["main"]);
        let p = release.paragraph().unwrap();
        let sha256 = p.checksums("SHA256").unwrap();
        assert!(sha256.iter().all(|r| !r.filename.starts_with("contrib/")));
    }

    #[test]
    fn test_strip_diff_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut release = release_fixture(dir.path(), RELEASE);
        release.strip_diff_directories().unwrap();
        let p = release.paragraph().unwrap();
        assert!(p
            .checksums("SHA256")
            .unwrap()
            .iter()
            .all(|r| !r.filename.contains(".diff")));
    }

    #[test]
    fn test_remove_valid_until() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!("Valid-Until: Sat, 23 Oct 2021 09:51:05 UTC\n{}", RELEASE);
        let mut release = release_fixture(dir.path(), &content);
        let sig = dir.path().join("dists/bullseye/Release.gpg");
        std::fs::write(&sig, "stale signature").unwrap();
        release.remove_valid_until().unwrap();
        assert!(!sig.exists());
        let rewritten =
            std::fs::read_to_string(dir.path().join("dists/bullseye/Release")).unwrap();
        assert!(!rewritten.contains("Valid-Until"));
    }

    #[test]
    fn test_split_envelope() {
        let inline = "\
-----BEGIN PGP SIGNED MESSAGE-----
Hash: SHA256

Origin: Debian
Codename: bullseye
-----BEGIN PGP SIGNATURE-----

base64base64base64
-----END PGP SIGNATURE-----
";
        let (body, signature) = split_envelope(inline);
        assert_eq!(body, "Origin: Debian\nCodename: bullseye\n");
        let signature = signature.unwrap();
        assert!(signature.starts_with(SIGNATURE_START));
        assert!(signature.trim_end().ends_with(SIGNATURE_END));

        // a plain document passes through untouched
        let (body, signature) = split_envelope("Origin: Debian\n");
        assert_eq!(body, "Origin: Debian\n");
        assert!(signature.is_none());
    }

    #[test]
    fn test_create_from_plain_to_inline() {
        let dir = tempfile::tempdir().unwrap();
        let release = release_fixture(dir.path(), RELEASE);
        let sig = "-----BEGIN PGP SIGNATURE-----\n\nsigsigsig\n-----END PGP SIGNATURE-----\n";
        std::fs::write(dir.path().join("dists/bullseye/Release.gpg"), sig).unwrap();

        let mut inrelease =
            ReleaseFile::new(Variant::Inline, "http://localhost/debian", dir.path(), "bullseye");
        inrelease.create_from(&release).unwrap();

        let written = std::fs::read_to_string(inrelease.local()).unwrap();
        assert!(written.starts_with(MESSAGE_START));
        assert!(written.contains("Codename: bullseye"));
        assert!(written.contains("sigsigsig"));
        // the regenerated file parses back to the same manifest
        assert_eq!(
            inrelease.subfiles().unwrap().len(),
            release.subfiles().unwrap().len()
        );
        assert_eq!(inrelease.stored_signature().unwrap().unwrap(), sig);
    }

    #[test]
    fn test_create_synthesizes_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let packages_path = dir.path().join("dists/bullseye/main/binary-amd64/Packages");
        std::fs::create_dir_all(packages_path.parent().unwrap()).unwrap();
        std::fs::write(&packages_path, "Package: foo\nFilename: pool/foo.deb\n").unwrap();

        let mirror = MirrorSpec {
            source: "http://localhost/debian".to_string(),
            destination: dir.path().to_path_buf(),
            distributives: vec!["bullseye".to_string()],
            sections: vec!["main".to_string()],
            architectures: vec!["amd64".to_string()],
            versions: None,
            enabled: true,
        };
        let mut release =
            ReleaseFile::new(Variant::Plain, "http://localhost/debian", dir.path(), "bullseye");
        release
            .create("bullseye", &mirror, &[packages_path.clone()])
            .unwrap();

        assert_eq!(release.architectures(), vec!["amd64"]);
        let entries = release.subfiles().unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.path, "main/binary-amd64/Packages");
        assert_eq!(entry.hashes.len(), 4);
        let digests = digest_file(&packages_path, &ChecksumKind::ALL).unwrap();
        for (kind, hex) in &entry.hashes {
            assert_eq!(&digests[kind], hex);
        }
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(
            split_extension("main/binary-amd64/Packages.gz"),
            ("main/binary-amd64/Packages", ".gz")
        );
        assert_eq!(
            split_extension("main/binary-amd64/Packages"),
            ("main/binary-amd64/Packages", "")
        );
        assert_eq!(split_extension(".hidden"), (".hidden", ""));
    }
}
