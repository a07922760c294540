use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::unistd::{Group, User, geteuid};
use provisio_core::config::PrivilegeMode;
use tokio::io::AsyncWriteExt;

use super::{AccountError, AccountManager, CommandRunner, NewAccount, SUDO};

/// Check if the current process is running as root.
pub fn is_root() -> bool {
    geteuid().is_root()
}

/// How [`SystemAccounts`] reaches root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Already root: native calls plus `groupadd`/`useradd`.
    Direct,
    /// Every operation is a `sudo -n` subprocess.
    Sudo,
}

impl Privilege {
    /// Resolve the configured mode against the current effective uid.
    pub fn resolve(mode: PrivilegeMode) -> Self {
        match mode {
            PrivilegeMode::Direct => Self::Direct,
            PrivilegeMode::Sudo => Self::Sudo,
            PrivilegeMode::Auto if is_root() => Self::Direct,
            PrivilegeMode::Auto => Self::Sudo,
        }
    }
}

/// Account management on the local host.
#[derive(Debug, Clone)]
pub struct SystemAccounts {
    runner: CommandRunner,
    privilege: Privilege,
}

impl SystemAccounts {
    pub fn new(privilege: Privilege, timeout: std::time::Duration) -> Self {
        match privilege {
            Privilege::Direct => Self {
                runner: CommandRunner::new(timeout),
                privilege,
            },
            Privilege::Sudo => Self::escalated_with(SUDO, timeout),
        }
    }

    /// [`Privilege::Sudo`] behaviour with a custom escalation command in
    /// place of `sudo -n`.
    pub fn escalated_with<S: Into<String>>(
        prefix: impl IntoIterator<Item = S>,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            runner: CommandRunner::escalated(prefix, timeout),
            privilege: Privilege::Sudo,
        }
    }

    fn is_direct(&self) -> bool {
        self.privilege == Privilege::Direct
    }

    /// Escalated counterpart of [`refuse_symlink`].
    async fn refuse_symlink_escalated(&self, path: &Path) -> Result<(), AccountError> {
        let p = path_arg(path)?;
        if self.runner.check("test", &["-L", p]).await? {
            return Err(AccountError::Symlink(path.to_path_buf()));
        }
        Ok(())
    }
}

fn path_arg(path: &Path) -> Result<&str, AccountError> {
    path.to_str().ok_or_else(|| {
        AccountError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path is not valid UTF-8"),
        )
    })
}

/// Fail if `path` exists and is a symlink. Missing paths are fine.
async fn refuse_symlink(path: &Path) -> Result<(), AccountError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.file_type().is_symlink() => Err(AccountError::Symlink(path.to_path_buf())),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AccountError::io(path, e)),
    }
}

async fn lookup_ids(user: &str, group: &str) -> Result<(u32, u32), AccountError> {
    let (user, group) = (user.to_string(), group.to_string());
    tokio::task::spawn_blocking(move || {
        let uid = User::from_name(&user)
            .map_err(|e| AccountError::Lookup(e.to_string()))?
            .ok_or_else(|| AccountError::UnknownPrincipal {
                kind: "user",
                name: user.clone(),
            })?
            .uid;
        let gid = Group::from_name(&group)
            .map_err(|e| AccountError::Lookup(e.to_string()))?
            .ok_or_else(|| AccountError::UnknownPrincipal {
                kind: "group",
                name: group.clone(),
            })?
            .gid;
        Ok((uid.as_raw(), gid.as_raw()))
    })
    .await
    .map_err(|e| AccountError::Lookup(e.to_string()))?
}

impl AccountManager for SystemAccounts {
    async fn ensure_group(&self, name: &str) -> Result<(), AccountError> {
        // `-f` exits 0 when the group already exists.
        self.runner
            .run(&format!("ensuring group {name}"), "groupadd", &["-f", name])
            .await
    }

    async fn account_exists(&self, name: &str) -> Result<bool, AccountError> {
        if self.is_direct() {
            let name = name.to_string();
            return tokio::task::spawn_blocking(move || User::from_name(&name))
                .await
                .map_err(|e| AccountError::Lookup(e.to_string()))?
                .map(|user| user.is_some())
                .map_err(|e| AccountError::Lookup(e.to_string()));
        }
        self.runner.probe("id", &["-u", name]).await
    }

    async fn create_account(&self, account: &NewAccount<'_>) -> Result<(), AccountError> {
        self.runner
            .run(
                &format!("creating account {}", account.username),
                "useradd",
                &[
                    "-m",
                    "-s",
                    account.shell,
                    "-c",
                    account.comment,
                    "-g",
                    account.primary_group,
                    account.username,
                ],
            )
            .await
    }

    async fn create_directory(&self, path: &Path, mode: u32) -> Result<(), AccountError> {
        if !self.is_direct() {
            let p = path_arg(path)?;
            self.refuse_symlink_escalated(path).await?;
            self.runner
                .run(&format!("creating {p}"), "mkdir", &["-p", p])
                .await?;
            return self.set_mode(path, mode).await;
        }

        refuse_symlink(path).await?;
        tracing::info!("creating directory: {}", path.display());
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| AccountError::io(path, e))?;
        tokio::fs::set_permissions(path, Permissions::from_mode(mode))
            .await
            .map_err(|e| AccountError::io(path, e))
    }

    async fn set_owner(&self, path: &Path, user: &str, group: &str) -> Result<(), AccountError> {
        if !self.is_direct() {
            let p = path_arg(path)?;
            let owner = format!("{user}:{group}");
            return self
                .runner
                .run(&format!("setting ownership on {p}"), "chown", &["-h", &owner, p])
                .await;
        }

        let (uid, gid) = lookup_ids(user, group).await?;
        tracing::info!("setting ownership on {} to {user}:{group}", path.display());
        std::os::unix::fs::lchown(path, Some(uid), Some(gid)).map_err(|e| AccountError::io(path, e))
    }

    async fn write_file(&self, path: &Path, content: &[u8], mode: u32) -> Result<(), AccountError> {
        if !self.is_direct() {
            let p = path_arg(path)?;
            // `tee` opens through symlinks.
            self.refuse_symlink_escalated(path).await?;
            self.runner
                .run_with_stdin(&format!("writing {p}"), "tee", &[p], Some(content))
                .await?;
            return self.set_mode(path, mode).await;
        }

        tracing::info!("writing file: {}", path.display());
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .custom_flags(nix::libc::O_NOFOLLOW)
            .open(path)
            .await
            .map_err(|e| AccountError::io(path, e))?;
        file.write_all(content)
            .await
            .map_err(|e| AccountError::io(path, e))?;
        file.sync_all().await.map_err(|e| AccountError::io(path, e))
    }

    async fn set_mode(&self, path: &Path, mode: u32) -> Result<(), AccountError> {
        if !self.is_direct() {
            let p = path_arg(path)?;
            self.refuse_symlink_escalated(path).await?;
            let mode = format!("{mode:o}");
            return self
                .runner
                .run(&format!("setting mode {mode} on {p}"), "chmod", &[&mode, p])
                .await;
        }

        refuse_symlink(path).await?;
        tokio::fs::set_permissions(path, Permissions::from_mode(mode))
            .await
            .map_err(|e| AccountError::io(path, e))
    }
}
