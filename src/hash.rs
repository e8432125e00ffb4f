//! Multi-digest file hashing

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use faster_hex::hex_string;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

const CHUNK_SIZE: usize = 1024 * 1024;

/// A digest algorithm appearing in APT metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumKind {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumKind {
    pub const ALL: [ChecksumKind; 4] = [
        ChecksumKind::Md5,
        ChecksumKind::Sha1,
        ChecksumKind::Sha256,
        ChecksumKind::Sha512,
    ];

    /// Resolve a metadata field name (any case, `Release` or `Packages`
    /// spelling) to the algorithm it denotes.
    pub fn from_field(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "md5" | "md5sum" => Some(ChecksumKind::Md5),
            "sha1" => Some(ChecksumKind::Sha1),
            "sha256" => Some(ChecksumKind::Sha256),
            "sha512" => Some(ChecksumKind::Sha512),
            _ => None,
        }
    }

    /// Field spelling used in `Release` files.
    pub fn release_field(self) -> &'static str {
        match self {
            ChecksumKind::Md5 => "MD5Sum",
            ChecksumKind::Sha1 => "SHA1",
            ChecksumKind::Sha256 => "SHA256",
            ChecksumKind::Sha512 => "SHA512",
        }
    }

    /// Field spelling used in `Packages` stanzas.
    pub fn package_field(self) -> &'static str {
        match self {
            ChecksumKind::Md5 => "MD5sum",
            ChecksumKind::Sha1 => "SHA1",
            ChecksumKind::Sha256 => "SHA256",
            ChecksumKind::Sha512 => "SHA512",
        }
    }
}

enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn new(kind: ChecksumKind) -> Self {
        match kind {
            ChecksumKind::Md5 => Hasher::Md5(Md5::new()),
            ChecksumKind::Sha1 => Hasher::Sha1(Sha1::new()),
            ChecksumKind::Sha256 => Hasher::Sha256(Sha256::new()),
            ChecksumKind::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(chunk),
            Hasher::Sha1(h) => h.update(chunk),
            Hasher::Sha256(h) => h.update(chunk),
            Hasher::Sha512(h) => h.update(chunk),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex_string(&h.finalize()),
            Hasher::Sha1(h) => hex_string(&h.finalize()),
            Hasher::Sha256(h) => hex_string(&h.finalize()),
            Hasher::Sha512(h) => hex_string(&h.finalize()),
        }
    }
}

/// Hash a file under every requested algorithm in a single read pass.
pub fn digest_file(path: &Path, kinds: &[ChecksumKind]) -> Result<HashMap<ChecksumKind, String>> {
    let mut f = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut hashers: Vec<(ChecksumKind, Hasher)> =
        kinds.iter().map(|k| (*k, Hasher::new(*k))).collect();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("reading '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        for (_, hasher) in hashers.iter_mut() {
            hasher.update(&buf[..n]);
        }
    }

    Ok(hashers
        .into_iter()
        .map(|(kind, hasher)| (kind, hasher.finalize_hex()))
        .collect())
}

/// Size of a file in bytes.
pub fn file_size(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)
        .with_context(|| format!("stat '{}'", path.display()))?
        .len())
}

/// Resolve a field name or fail on an unsupported algorithm.
pub fn kind_from_field(name: &str) -> Result<ChecksumKind> {
    ChecksumKind::from_field(name)
        .ok_or_else(|| anyhow!("checksum algorithm '{}' is not supported", name))
}
