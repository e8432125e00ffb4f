//! Release file signing

use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use openpgp::armor;
use openpgp::cert::{Cert, CertParser};
use openpgp::crypto::{KeyPair, Password};
use openpgp::packet::Packet;
use openpgp::parse::{PacketParser, PacketParserResult, Parse};
use openpgp::policy::StandardPolicy;
use openpgp::serialize::stream::{Armorer, Message, Signer};
use openpgp::Fingerprint;
use secrecy::{ExposeSecret, SecretString};
use sequoia_openpgp as openpgp;

use crate::fetch::atomic_write;

/// Holds the unlocked signing key for the duration of a run.
///
/// The key material lives in process memory only; nothing is written to a
/// keyring on disk.
pub struct ReleaseSigner {
    keypair: KeyPair,
    fingerprint: Fingerprint,
}

impl ReleaseSigner {
    /// Import the single secret key contained in `key_path` and unlock it
    /// with `passphrase`. A file carrying more than one certificate is
    /// rejected.
    pub fn new(key_path: &Path, passphrase: &SecretString) -> Result<Self> {
        let certs = CertParser::from_file(key_path)
            .with_context(|| format!("reading key file '{}'", key_path.display()))?
            .collect::<openpgp::Result<Vec<Cert>>>()
            .with_context(|| format!("parsing key file '{}'", key_path.display()))?;
        if certs.len() != 1 {
            bail!(
                "'{}' must contain exactly one secret key, found {}",
                key_path.display(),
                certs.len()
            );
        }
        let cert = certs.into_iter().next().unwrap();
        if !cert.is_tsk() {
            bail!("'{}' carries no secret key material", key_path.display());
        }

        let policy = StandardPolicy::new();
        let ka = cert
            .keys()
            .secret()
            .with_policy(&policy, None)
            .supported()
            .alive()
            .revoked(false)
            .for_signing()
            .next()
            .ok_or_else(|| anyhow!("no usable signing key found in '{}'", key_path.display()))?;
        let mut key = ka.key().clone();
        if key.secret().is_encrypted() {
            let password = Password::from(passphrase.expose_secret());
            key = key
                .decrypt_secret(&password)
                .with_context(|| format!("unlocking '{}'", key_path.display()))?;
        }
        let fingerprint = key.fingerprint();
        let keypair = key.into_keypair()?;
        info!("Imported signing key '{}'", fingerprint);

        Ok(ReleaseSigner {
            keypair,
            fingerprint,
        })
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Rewrite `path` in place as an inline-signed document whose body is
    /// the original content.
    pub fn sign_cleartext(&self, path: &Path) -> Result<()> {
        let content =
            std::fs::read(path).with_context(|| format!("reading '{}'", path.display()))?;
        let mut sink = Vec::new();
        {
            let message = Message::new(&mut sink);
            let mut signer = Signer::new(message, self.keypair.clone())
                .cleartext()
                .build()?;
            signer.write_all(&content)?;
            signer.finalize()?;
        }
        self.verify_own_signature(&sink)?;
        atomic_write(path, &sink)?;
        debug!("signed '{}' in place", path.display());

        Ok(())
    }

    /// Produce an armored detached signature of `path` at `output`.
    pub fn sign_detached(&self, path: &Path, output: &Path) -> Result<()> {
        let content =
            std::fs::read(path).with_context(|| format!("reading '{}'", path.display()))?;
        let mut sink = Vec::new();
        {
            let message = Message::new(&mut sink);
            let message = Armorer::new(message).kind(armor::Kind::Signature).build()?;
            let mut signer = Signer::new(message, self.keypair.clone())
                .detached()
                .build()?;
            signer.write_all(&content)?;
            signer.finalize()?;
        }
        self.verify_own_signature(&sink)?;
        atomic_write(output, &sink)?;
        debug!(
            "detached signature of '{}' written to '{}'",
            path.display(),
            output.display()
        );

        Ok(())
    }

    /// Every produced signature must name the imported key.
    fn verify_own_signature(&self, data: &[u8]) -> Result<()> {
        let mut found = false;
        let mut ppr = PacketParser::from_bytes(data)?;
        while let PacketParserResult::Some(pp) = ppr {
            let (packet, next) = pp.next()?;
            if let Packet::Signature(sig) = packet {
                found = true;
                if !sig.issuer_fingerprints().any(|f| *f == self.fingerprint) {
                    bail!(
                        "signature does not match the imported key '{}'",
                        self.fingerprint
                    );
                }
            }
            ppr = next;
        }
        if !found {
            bail!("signing produced no signature packet");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openpgp::cert::CertBuilder;
    use openpgp::serialize::SerializeInto;
    use openpgp::types::KeyFlags;

    fn write_test_key(dir: &Path) -> std::path::PathBuf {
        let (cert, _) = CertBuilder::new()
            .add_userid("Mirror Test <mirror@example.org>")
            .add_subkey(KeyFlags::empty().set_signing(), None, None)
            .generate()
            .unwrap();
        let path = dir.join("signing.key");
        std::fs::write(&path, cert.as_tsk().armored().to_vec().unwrap()).unwrap();
        path
    }

    #[test]
    fn test_sign_cleartext_and_detached() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = write_test_key(dir.path());
        let signer = ReleaseSigner::new(&key_path, &SecretString::from("".to_string())).unwrap();

        let doc = dir.path().join("Release");
        std::fs::write(&doc, "Origin: Test\nCodename: bullseye\n").unwrap();

        let sig = dir.path().join("Release.gpg");
        signer.sign_detached(&doc, &sig).unwrap();
        let armored = std::fs::read_to_string(&sig).unwrap();
        assert!(armored.starts_with("-----BEGIN PGP SIGNATURE-----"));
        assert!(armored.trim_end().ends_with("-----END PGP SIGNATURE-----"));
        // the signed file itself is untouched
        assert_eq!(
            std::fs::read_to_string(&doc).unwrap(),
            "Origin: Test\nCodename: bullseye\n"
        );

        signer.sign_cleartext(&doc).unwrap();
        let inline = std::fs::read_to_string(&doc).unwrap();
        assert!(inline.starts_with("-----BEGIN PGP SIGNED MESSAGE-----"));
        assert!(inline.contains("Codename: bullseye"));
        assert!(inline.contains("-----BEGIN PGP SIGNATURE-----"));
    }

    #[test]
    fn test_multi_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut combined = Vec::new();
        for _ in 0..2 {
            let (cert, _) = CertBuilder::new()
                .add_userid("Mirror Test <mirror@example.org>")
                .add_subkey(KeyFlags::empty().set_signing(), None, None)
                .generate()
                .unwrap();
            combined.extend(cert.as_tsk().to_vec().unwrap());
        }
        let path = dir.path().join("two.key");
        std::fs::write(&path, combined).unwrap();
        assert!(ReleaseSigner::new(&path, &SecretString::from("".to_string())).is_err());
    }
}
