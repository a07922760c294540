//! Privileged OS account management.
//!
//! [`AccountManager`] is the narrow capability set the provisioner needs.
//! [`SystemAccounts`] performs the operations on the host, [`MemoryAccounts`]
//! simulates them for tests.

mod cmd;
mod memory;
mod system;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use cmd::{CommandRunner, SUDO};
pub use memory::{AccountRecord, FileRecord, MemoryAccounts, MemoryState};
pub use system::{Privilege, SystemAccounts, is_root};

/// Parameters for a new OS account. Home directory is created by the
/// account tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewAccount<'a> {
    pub username: &'a str,
    pub primary_group: &'a str,
    pub comment: &'a str,
    pub shell: &'a str,
}

/// One capability of [`AccountManager`], used to label calls and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    EnsureGroup,
    AccountExists,
    CreateAccount,
    CreateDirectory,
    SetOwner,
    WriteFile,
    SetMode,
}

impl Capability {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EnsureGroup => "ensure_group",
            Self::AccountExists => "account_exists",
            Self::CreateAccount => "create_account",
            Self::CreateDirectory => "create_directory",
            Self::SetOwner => "set_owner",
            Self::WriteFile => "write_file",
            Self::SetMode => "set_mode",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("failed to execute `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("`{command}` timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing to follow symlink at {}", .0.display())]
    Symlink(PathBuf),

    #[error("no such {kind}: {name}")]
    UnknownPrincipal { kind: &'static str, name: String },

    #[error("account database lookup failed: {0}")]
    Lookup(String),

    /// Injected by [`MemoryAccounts`].
    #[error("simulated {0} failure")]
    Simulated(Capability),
}

impl AccountError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Capability-scoped OS account management. Every operation is idempotent
/// except `create_account`, which callers guard with `account_exists`.
pub trait AccountManager: Send + Sync {
    /// Create the group if it does not exist.
    fn ensure_group(&self, name: &str) -> impl Future<Output = Result<(), AccountError>> + Send;

    fn account_exists(&self, name: &str)
    -> impl Future<Output = Result<bool, AccountError>> + Send;

    fn create_account(
        &self,
        account: &NewAccount<'_>,
    ) -> impl Future<Output = Result<(), AccountError>> + Send;

    /// Create the directory (and parents) if missing and set its mode.
    fn create_directory(
        &self,
        path: &Path,
        mode: u32,
    ) -> impl Future<Output = Result<(), AccountError>> + Send;

    fn set_owner(
        &self,
        path: &Path,
        user: &str,
        group: &str,
    ) -> impl Future<Output = Result<(), AccountError>> + Send;

    /// Replace the file's content with `content`, byte for byte. New files
    /// are created with `mode`.
    fn write_file(
        &self,
        path: &Path,
        content: &[u8],
        mode: u32,
    ) -> impl Future<Output = Result<(), AccountError>> + Send;

    fn set_mode(&self, path: &Path, mode: u32)
    -> impl Future<Output = Result<(), AccountError>> + Send;
}
