//! Credential provider backed by a key directory.
//!
//! The directory holds an OpenSSH key pair. The private key authenticates
//! git over ssh; the public key is what operators register as a deploy key.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

pub const PRIVATE_KEY_FILE: &str = "id_recoon";
pub const PUBLIC_KEY_FILE: &str = "id_recoon.pub";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub private_key: PathBuf,
    /// `<algo> <base64> [comment]`
    pub public_key: String,
}

impl Credentials {
    /// Value for `GIT_SSH_COMMAND`.
    pub fn ssh_command(&self) -> String {
        format!(
            "ssh -i '{}' -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
            self.private_key.display()
        )
    }
}

#[derive(Debug, Clone)]
pub struct KeyDir {
    dir: PathBuf,
}

impl KeyDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn load(&self) -> Result<Credentials> {
        let private_key = self.dir.join(PRIVATE_KEY_FILE);
        if !private_key.is_file() {
            bail!("private key missing at {}", private_key.display());
        }
        let pub_path = self.dir.join(PUBLIC_KEY_FILE);
        let text = std::fs::read_to_string(&pub_path).with_context(|| format!("failed to load public key file {}", pub_path.display()))?;
        let public_key = parse_public_key(&text)?;
        Ok(Credentials { private_key, public_key })
    }
}

fn parse_public_key(text: &str) -> Result<String> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#'));
    let Some(line) = lines.next() else {
        bail!("public key file is empty");
    };
    if lines.next().is_some() {
        bail!("public key file contains too much information");
    }
    let mut fields = line.split_whitespace();
    match (fields.next(), fields.next()) {
        (Some(algo), Some(_key)) if algo.starts_with("ssh-") || algo.starts_with("ecdsa-") => Ok(line.to_string()),
        (Some(algo), Some(_)) => bail!("got unsupported key type {algo:?}"),
        _ => bail!("public key has invalid format"),
    }
}
