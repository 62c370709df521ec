//! Authorized key loading

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context as _;

/// The set of public keys allowed to use the relay.
///
/// Keys are held in their `type base64-blob` text form, which is also how
/// sshd presents them in `SSH_USER_AUTH`; options and comments are dropped
/// on the way in.
#[derive(Debug, Default)]
pub(crate) struct AuthorizedKeys {
    keys: HashSet<String>,
}

impl AuthorizedKeys {
    /// Reads an OpenSSH `authorized_keys` style file.
    ///
    /// # Errors
    /// Fails if the file cannot be read or any non-comment line does not
    /// contain a key.
    pub(crate) fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not open authorized keys file {}", path.display()))?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> anyhow::Result<Self> {
        let mut keys = HashSet::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let _ = keys.insert(normalize(line)?);
        }
        Ok(Self { keys })
    }

    /// How many keys were loaded
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the presented key (in any `authorized_keys` or
    /// `SSH_USER_AUTH` form) is in the set
    pub(crate) fn contains(&self, key: &str) -> bool {
        normalize(key).is_ok_and(|k| self.keys.contains(&k))
    }
}

/// Reduces an `authorized_keys` line to its `type blob` core, dropping any
/// leading options and trailing comment.
fn normalize(line: &str) -> anyhow::Result<String> {
    let mut words = line.split_whitespace();
    while let Some(word) = words.next() {
        if word.starts_with("ssh-") || word.starts_with("ecdsa-") || word.starts_with("sk-") {
            let blob = words
                .next()
                .with_context(|| format!("authorized key line is missing its key data: {line:?}"))?;
            return Ok(format!("{word} {blob}"));
        }
    }
    anyhow::bail!("could not parse authorized key: {line:?}")
}
