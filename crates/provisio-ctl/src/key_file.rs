//! Reading a public key from a `.pub` file.

use std::path::Path;

use anyhow::{Context, Result, bail};

/// Return the single key line in `path`.
///
/// Blank lines and `#` comments are skipped. More than one key line is an
/// error: a request carries exactly one key and `authorized_keys` is
/// overwritten with it.
pub fn read_public_key(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read public key file {}", path.display()))?;
    parse_public_key(&content)
        .with_context(|| format!("Invalid public key file {}", path.display()))
}

fn parse_public_key(content: &str) -> Result<String> {
    let mut lines = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'));

    let Some(key) = lines.next() else {
        bail!("no key found");
    };
    if lines.next().is_some() {
        bail!("more than one key line");
    }
    Ok(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_key_with_trailing_newline() {
        let key = parse_public_key("ssh-ed25519 AAAA alice@host\n").expect("key");
        assert_eq!(key, "ssh-ed25519 AAAA alice@host");
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let key = parse_public_key("# laptop\n\n  ssh-rsa BBBB bob  \n").expect("key");
        assert_eq!(key, "ssh-rsa BBBB bob");
    }

    #[test]
    fn empty_and_multi_key_files_are_rejected() {
        assert!(parse_public_key("\n# nothing\n").is_err());
        assert!(parse_public_key("ssh-ed25519 A\nssh-ed25519 B\n").is_err());
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("id_ed25519.pub");
        std::fs::write(&path, "ssh-ed25519 AAAA alice\n").expect("write");
        assert_eq!(read_public_key(&path).expect("read"), "ssh-ed25519 AAAA alice");
        assert!(read_public_key(&dir.path().join("missing.pub")).is_err());
    }
}
