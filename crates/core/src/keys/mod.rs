use std::fs;
use std::path::{Path, PathBuf};

use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::{self, LineEnding};
use russh::keys::{PrivateKey, PublicKey};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Generated pairs are always 4096-bit RSA.
const RSA_KEY_BITS: usize = 4096;
const KEY_COMMENT: &str = "sockbridge";

#[derive(Debug, Error)]
pub enum KeyError {
  #[error("unable to read key material at {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("unable to parse key material at {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: russh::keys::Error,
  },
  #[error("unable to generate key pair: {source}")]
  Generate {
    #[source]
    source: ssh_key::Error,
  },
  #[error("unable to serialize key material: {source}")]
  Serialize {
    #[source]
    source: ssh_key::Error,
  },
  #[error("unable to write key file {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

pub type Result<T> = std::result::Result<T, KeyError>;

/// The configured identity: private key plus its public half in the
/// single-line OpenSSH authorized-key form. That form is the canonical byte
/// representation compared during authentication on both sides.
pub struct Identity {
  pub key: PrivateKey,
  pub public_openssh: String,
}

impl Identity {
  /// Whether `offered` is byte-equal to this identity's public key. The
  /// comparison is on the marshalled key blob, so the comment a key file
  /// may carry does not affect it; a single differing byte in the key data
  /// fails the match.
  pub fn matches(&self, offered: &PublicKey) -> bool {
    offered.key_data() == self.key.public_key().key_data()
  }
}

/// Load the private key at `identity_path` (OpenSSH or PKCS#8 PEM).
pub fn load_identity(identity_path: &Path) -> Result<Identity> {
  debug!(event = "identity_load", path = %identity_path.display(), "reading private key");
  let key = russh::keys::load_secret_key(identity_path, None)
    .map_err(|source| KeyError::Parse { path: identity_path.to_path_buf(), source })?;
  let public_openssh = key
    .public_key()
    .to_openssh()
    .map_err(|source| KeyError::Serialize { source: source.into() })?;
  Ok(Identity { key, public_openssh })
}

/// Generate a fresh 4096-bit RSA pair, overwriting any existing one.
///
/// Writes the private key to `identity_path` (mode 0700), the public key to
/// `<identity_path>.pub` (mode 0755), and the authorized-key line to
/// `authorized_keys_path` when one is configured.
pub fn generate_key_pair(identity_path: &Path, authorized_keys_path: Option<&Path>) -> Result<()> {
  info!(event = "keygen_started", path = %identity_path.display(), bits = RSA_KEY_BITS, "generating RSA key pair");
  let keypair = RsaKeypair::random(&mut ssh_key::rand_core::OsRng, RSA_KEY_BITS)
    .map_err(|source| KeyError::Generate { source })?;
  let key = PrivateKey::new(KeypairData::Rsa(keypair), KEY_COMMENT)
    .map_err(|source| KeyError::Generate { source })?;
  write_key_files(&key, identity_path, authorized_keys_path)
}

fn write_key_files(key: &PrivateKey, identity_path: &Path, authorized_keys_path: Option<&Path>) -> Result<()> {
  if let Some(parent) = identity_path.parent() {
    fs::create_dir_all(parent).map_err(|source| KeyError::Write { path: parent.to_path_buf(), source })?;
  }

  let pem = key.to_openssh(LineEnding::LF).map_err(|source| KeyError::Serialize { source })?;
  write_with_mode(identity_path, pem.as_bytes(), 0o700)?;

  let public_line = format!(
    "{}\n",
    key.public_key().to_openssh().map_err(|source| KeyError::Serialize { source: source.into() })?
  );
  let public_path = public_key_path(identity_path);
  write_with_mode(&public_path, public_line.as_bytes(), 0o755)?;

  match authorized_keys_path {
    Some(path) => write_with_mode(path, public_line.as_bytes(), 0o755)?,
    None => warn!(event = "keygen_no_authorized_keys", "no authorized keys path provided, skipping"),
  }

  info!(event = "keygen_finished", path = %identity_path.display(), "key pair written");
  Ok(())
}

pub fn public_key_path(identity_path: &Path) -> PathBuf {
  let mut os = identity_path.as_os_str().to_os_string();
  os.push(".pub");
  PathBuf::from(os)
}

fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
  fs::write(path, contents).map_err(|source| KeyError::Write { path: path.to_path_buf(), source })?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
      .map_err(|source| KeyError::Write { path: path.to_path_buf(), source })?;
  }
  #[cfg(not(unix))]
  let _ = mode;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_key() -> PrivateKey {
    PrivateKey::random(&mut ssh_key::rand_core::OsRng, ssh_key::Algorithm::Ed25519).unwrap()
  }

  #[test]
  fn written_identity_round_trips() {
    let td = tempfile::tempdir().unwrap();
    let identity_path = td.path().join("id_test");
    let authorized = td.path().join("authorized_keys");

    let key = test_key();
    write_key_files(&key, &identity_path, Some(&authorized)).unwrap();

    let identity = load_identity(&identity_path).unwrap();
    assert_eq!(identity.public_openssh, key.public_key().to_openssh().unwrap());

    let pub_file = std::fs::read_to_string(public_key_path(&identity_path)).unwrap();
    assert_eq!(pub_file.trim_end(), identity.public_openssh);
    let authorized_file = std::fs::read_to_string(&authorized).unwrap();
    assert_eq!(authorized_file, pub_file);
  }

  #[cfg(unix)]
  #[test]
  fn key_files_carry_the_expected_modes() {
    use std::os::unix::fs::PermissionsExt;

    let td = tempfile::tempdir().unwrap();
    let identity_path = td.path().join("id_test");
    write_key_files(&test_key(), &identity_path, None).unwrap();

    let private_mode = std::fs::metadata(&identity_path).unwrap().permissions().mode() & 0o777;
    assert_eq!(private_mode, 0o700);
    let public_mode =
      std::fs::metadata(public_key_path(&identity_path)).unwrap().permissions().mode() & 0o777;
    assert_eq!(public_mode, 0o755);
  }

  #[test]
  fn matches_rejects_a_different_key() {
    let td = tempfile::tempdir().unwrap();
    let identity_path = td.path().join("id_test");
    let key = test_key();
    write_key_files(&key, &identity_path, None).unwrap();
    let identity = load_identity(&identity_path).unwrap();

    assert!(identity.matches(key.public_key()));
    let other = test_key();
    assert!(!identity.matches(other.public_key()));
  }

  #[test]
  fn missing_identity_is_an_error() {
    let td = tempfile::tempdir().unwrap();
    assert!(load_identity(&td.path().join("absent")).is_err());
  }

  // 4096-bit generation takes a while in debug builds; run with --ignored.
  #[test]
  #[ignore]
  fn generated_rsa_pair_round_trips() {
    let td = tempfile::tempdir().unwrap();
    let identity_path = td.path().join("id_rsa");
    generate_key_pair(&identity_path, None).unwrap();

    let identity = load_identity(&identity_path).unwrap();
    assert!(identity.public_openssh.starts_with("ssh-rsa "));
  }
}
