//! Account provisioning sequence.
//!
//! [`Provisioner::provision`] runs eight steps in a fixed order and stops at
//! the first failure. Nothing is rolled back: a retry re-runs the whole
//! sequence from the first step, which is safe because every step is
//! idempotent (account creation is skipped when the account exists, the
//! rest create-if-missing or overwrite).

use std::fmt;
use std::path::{Path, PathBuf};

use provisio_core::ProvisioningRequest;
use tracing::{debug, info};

use crate::accounts::{AccountError, AccountManager, NewAccount};

/// Mode of `~/.ssh`.
pub const SSH_DIR_MODE: u32 = 0o700;

/// Mode of `~/.ssh/authorized_keys`.
pub const AUTHORIZED_KEYS_MODE: u32 = 0o600;

/// One step of the provisioning sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    EnsureGroup,
    CheckAccount,
    CreateAccount,
    CreateSshDir,
    ChownSshDir,
    WriteAuthorizedKeys,
    ChmodAuthorizedKeys,
    ChownAuthorizedKeys,
}

impl Step {
    pub const ALL: [Self; 8] = [
        Self::EnsureGroup,
        Self::CheckAccount,
        Self::CreateAccount,
        Self::CreateSshDir,
        Self::ChownSshDir,
        Self::WriteAuthorizedKeys,
        Self::ChmodAuthorizedKeys,
        Self::ChownAuthorizedKeys,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EnsureGroup => "ensure_group",
            Self::CheckAccount => "check_account",
            Self::CreateAccount => "create_account",
            Self::CreateSshDir => "create_ssh_dir",
            Self::ChownSshDir => "chown_ssh_dir",
            Self::WriteAuthorizedKeys => "write_authorized_keys",
            Self::ChmodAuthorizedKeys => "chmod_authorized_keys",
            Self::ChownAuthorizedKeys => "chown_authorized_keys",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A step failed; the remaining steps were not attempted. Always recoverable
/// from the provisioner's point of view, the retry policy decides the rest.
#[derive(Debug, thiserror::Error)]
#[error("{step} failed: {source}")]
pub struct StepError {
    pub step: Step,
    #[source]
    pub source: AccountError,
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    /// `false` when the account already existed.
    pub account_created: bool,
    pub ssh_dir: PathBuf,
    pub authorized_keys: PathBuf,
}

pub struct Provisioner<A> {
    accounts: A,
    home_root: PathBuf,
    shell: String,
}

impl<A: AccountManager> Provisioner<A> {
    pub fn new(accounts: A, home_root: impl Into<PathBuf>, shell: impl Into<String>) -> Self {
        Self {
            accounts,
            home_root: home_root.into(),
            shell: shell.into(),
        }
    }

    pub const fn accounts(&self) -> &A {
        &self.accounts
    }

    pub fn ssh_dir(&self, username: &str) -> PathBuf {
        self.home_root.join(username).join(".ssh")
    }

    /// Run the full sequence for one request.
    pub async fn provision(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ProvisionReport, StepError> {
        let user = request.username.as_str();
        let group = request.group.as_str();
        let ssh_dir = self.ssh_dir(user);
        let authorized_keys = authorized_keys_path(&self.home_root, user);
        let key_content = request.authorized_keys_content();

        step(Step::EnsureGroup, self.accounts.ensure_group(group)).await?;

        let exists = step(Step::CheckAccount, self.accounts.account_exists(user)).await?;
        if exists {
            debug!(username = user, "account exists, skipping creation");
        } else {
            let account = NewAccount {
                username: user,
                primary_group: group,
                comment: &request.description,
                shell: &self.shell,
            };
            step(Step::CreateAccount, self.accounts.create_account(&account)).await?;
        }

        step(
            Step::CreateSshDir,
            self.accounts.create_directory(&ssh_dir, SSH_DIR_MODE),
        )
        .await?;
        step(
            Step::ChownSshDir,
            self.accounts.set_owner(&ssh_dir, user, group),
        )
        .await?;
        step(
            Step::WriteAuthorizedKeys,
            self.accounts
                .write_file(&authorized_keys, key_content.as_bytes(), AUTHORIZED_KEYS_MODE),
        )
        .await?;
        step(
            Step::ChmodAuthorizedKeys,
            self.accounts.set_mode(&authorized_keys, AUTHORIZED_KEYS_MODE),
        )
        .await?;
        step(
            Step::ChownAuthorizedKeys,
            self.accounts.set_owner(&authorized_keys, user, group),
        )
        .await?;

        info!(
            username = user,
            group,
            account_created = !exists,
            "Account provisioned"
        );

        Ok(ProvisionReport {
            account_created: !exists,
            ssh_dir,
            authorized_keys,
        })
    }
}

async fn step<T>(
    step: Step,
    op: impl Future<Output = Result<T, AccountError>>,
) -> Result<T, StepError> {
    debug!(%step, "provisioning step");
    op.await.map_err(|source| StepError { step, source })
}

impl<A> fmt::Debug for Provisioner<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provisioner")
            .field("home_root", &self.home_root)
            .field("shell", &self.shell)
            .finish_non_exhaustive()
    }
}

/// `authorized_keys` path for a user under `home_root`.
pub fn authorized_keys_path(home_root: &Path, username: &str) -> PathBuf {
    home_root.join(username).join(".ssh").join("authorized_keys")
}
