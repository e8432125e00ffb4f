use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::warn;
use serde::Deserialize;

/// One mirror entry of the JSON configuration. Unknown keys are ignored.
#[derive(Deserialize, Clone, Debug)]
pub struct MirrorSpec {
    /// Absolute HTTP(S) URL of the archive root.
    pub source: String,
    /// Local directory; relative paths are resolved against the config
    /// file's directory.
    pub destination: PathBuf,
    pub distributives: Vec<String>,
    pub sections: Vec<String>,
    /// Empty means every architecture upstream offers.
    #[serde(default)]
    pub architectures: Vec<String>,
    /// Retain only the N latest versions of every package.
    #[serde(default)]
    pub versions: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub fn parse_config<P: AsRef<Path>>(path: P) -> Result<Vec<MirrorSpec>> {
    let path = path.as_ref();
    let mut f =
        File::open(path).with_context(|| format!("opening config '{}'", path.display()))?;
    let mut content = String::new();
    content.reserve(1024);
    f.read_to_string(&mut content)?;
    let mut mirrors: Vec<MirrorSpec> = serde_json::from_str(&content)
        .with_context(|| format!("parsing config '{}'", path.display()))?;

    let config_dir = path
        .canonicalize()
        .with_context(|| format!("resolving config path '{}'", path.display()))?
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    for mirror in &mut mirrors {
        validate_mirror(mirror)?;
        if mirror.destination.is_relative() {
            mirror.destination = config_dir.join(&mirror.destination);
        }
    }

    Ok(mirrors)
}

fn validate_mirror(mirror: &MirrorSpec) -> Result<()> {
    if !mirror.source.starts_with("http://") && !mirror.source.starts_with("https://") {
        bail!("mirror source '{}' is not an HTTP(S) URL", mirror.source);
    }
    if mirror.distributives.is_empty() {
        bail!("mirror '{}' lists no distributives", mirror.source);
    }
    if mirror.sections.is_empty() {
        bail!("mirror '{}' lists no sections", mirror.source);
    }
    if mirror.versions == Some(0) {
        bail!(
            "mirror '{}': 'versions' must be a positive integer",
            mirror.source
        );
    }

    Ok(())
}

pub fn lint_config(mirrors: &[MirrorSpec]) {
    for mirror in mirrors {
        if !mirror.enabled {
            warn!("Mirror '{}' is disabled and will be skipped.", mirror.source);
        }
        if mirror.architectures.is_empty() {
            warn!(
                "Mirror '{}' does not restrict architectures; everything upstream offers will be downloaded.",
                mirror.source
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("mirrors.json");
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"[{
                "source": "http://deb.debian.org/debian",
                "destination": "mirror",
                "distributives": ["bullseye"],
                "sections": ["main"],
                "unknown-key": "is ignored"
            }]"#,
        );
        let mirrors = parse_config(&path).unwrap();
        assert_eq!(mirrors.len(), 1);
        let mirror = &mirrors[0];
        assert!(mirror.enabled);
        assert!(mirror.architectures.is_empty());
        assert_eq!(mirror.versions, None);
        // relative destination resolved against the config directory
        assert!(mirror.destination.is_absolute());
        assert!(mirror.destination.ends_with("mirror"));
    }

    #[test]
    fn test_parse_full_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"[{
                "source": "https://archive.example.org/debian",
                "destination": "/srv/mirror",
                "distributives": ["bullseye", "bookworm"],
                "sections": ["main", "contrib"],
                "architectures": ["amd64"],
                "versions": 2,
                "enabled": false
            }]"#,
        );
        let mirrors = parse_config(&path).unwrap();
        let mirror = &mirrors[0];
        assert!(!mirror.enabled);
        assert_eq!(mirror.versions, Some(2));
        assert_eq!(mirror.destination, PathBuf::from("/srv/mirror"));
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        // not a list
        let path = write_config(dir.path(), r#"{"source": "http://x"}"#);
        assert!(parse_config(&path).is_err());
        // missing required keys
        let path = write_config(dir.path(), r#"[{"source": "http://x"}]"#);
        assert!(parse_config(&path).is_err());
        // not an HTTP URL
        let path = write_config(
            dir.path(),
            r#"[{"source": "ftp://x", "destination": "m", "distributives": ["d"], "sections": ["s"]}]"#,
        );
        assert!(parse_config(&path).is_err());
        // zero retention
        let path = write_config(
            dir.path(),
            r#"[{"source": "http://x", "destination": "m", "distributives": ["d"], "sections": ["s"], "versions": 0}]"#,
        );
        assert!(parse_config(&path).is_err());
    }
}
