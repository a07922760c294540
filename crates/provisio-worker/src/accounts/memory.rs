//! In-memory account backend.
//!
//! Models the parts of the host the provisioner touches (groups, accounts,
//! directories, files) closely enough to check end states, records every
//! call, and can be told to fail specific capabilities.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{AccountError, AccountManager, Capability, NewAccount};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub primary_group: String,
    pub comment: String,
    pub shell: String,
    pub home: PathBuf,
}

/// A directory or file. Directories have empty content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub content: Vec<u8>,
    pub mode: u32,
    pub owner: Option<(String, String)>,
}

impl FileRecord {
    fn new(mode: u32) -> Self {
        Self {
            content: Vec::new(),
            mode,
            owner: None,
        }
    }
}

/// Snapshot of the simulated host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryState {
    pub groups: BTreeSet<String>,
    pub accounts: BTreeMap<String, AccountRecord>,
    pub directories: BTreeMap<PathBuf, FileRecord>,
    pub files: BTreeMap<PathBuf, FileRecord>,
}

#[derive(Debug, Clone, Copy)]
enum FailurePlan {
    Always,
    Times(u32),
}

#[derive(Debug)]
pub struct MemoryAccounts {
    home_root: PathBuf,
    state: Mutex<MemoryState>,
    calls: Mutex<Vec<Capability>>,
    failures: Mutex<HashMap<Capability, FailurePlan>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_found(path: &Path) -> AccountError {
    AccountError::io(path, std::io::ErrorKind::NotFound.into())
}

impl MemoryAccounts {
    pub fn new(home_root: impl Into<PathBuf>) -> Self {
        let home_root = home_root.into();
        let mut state = MemoryState::default();
        state
            .directories
            .insert(home_root.clone(), FileRecord::new(0o755));
        Self {
            home_root,
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Make every call to `capability` fail.
    pub fn fail_always(&self, capability: Capability) {
        lock(&self.failures).insert(capability, FailurePlan::Always);
    }

    /// Make the next `times` calls to `capability` fail.
    pub fn fail_times(&self, capability: Capability, times: u32) {
        lock(&self.failures).insert(capability, FailurePlan::Times(times));
    }

    pub fn heal(&self) {
        lock(&self.failures).clear();
    }

    /// Every capability invoked so far, in order.
    pub fn calls(&self) -> Vec<Capability> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, capability: Capability) -> usize {
        lock(&self.calls).iter().filter(|c| **c == capability).count()
    }

    pub fn snapshot(&self) -> MemoryState {
        lock(&self.state).clone()
    }

    /// Seed a pre-existing file, e.g. an old `authorized_keys`.
    pub fn insert_file(&self, path: impl Into<PathBuf>, content: &[u8], mode: u32) {
        let mut record = FileRecord::new(mode);
        record.content = content.to_vec();
        lock(&self.state).files.insert(path.into(), record);
    }

    fn enter(&self, capability: Capability) -> Result<MutexGuard<'_, MemoryState>, AccountError> {
        lock(&self.calls).push(capability);

        let mut failures = lock(&self.failures);
        match failures.get(&capability).copied() {
            Some(FailurePlan::Always) => return Err(AccountError::Simulated(capability)),
            Some(FailurePlan::Times(n)) if n > 0 => {
                failures.insert(capability, FailurePlan::Times(n - 1));
                return Err(AccountError::Simulated(capability));
            }
            _ => {}
        }
        drop(failures);

        Ok(lock(&self.state))
    }
}

impl AccountManager for MemoryAccounts {
    async fn ensure_group(&self, name: &str) -> Result<(), AccountError> {
        let mut state = self.enter(Capability::EnsureGroup)?;
        state.groups.insert(name.to_string());
        Ok(())
    }

    async fn account_exists(&self, name: &str) -> Result<bool, AccountError> {
        let state = self.enter(Capability::AccountExists)?;
        Ok(state.accounts.contains_key(name))
    }

    async fn create_account(&self, account: &NewAccount<'_>) -> Result<(), AccountError> {
        let mut state = self.enter(Capability::CreateAccount)?;
        if !state.groups.contains(account.primary_group) {
            return Err(AccountError::UnknownPrincipal {
                kind: "group",
                name: account.primary_group.to_string(),
            });
        }
        if state.accounts.contains_key(account.username) {
            return Err(AccountError::CommandFailed {
                command: format!("useradd {}", account.username),
                status: "exit status: 9".to_string(),
                stderr: format!("useradd: user '{}' already exists", account.username),
            });
        }

        let home = self.home_root.join(account.username);
        let mut home_dir = FileRecord::new(0o755);
        home_dir.owner = Some((
            account.username.to_string(),
            account.primary_group.to_string(),
        ));
        state.directories.insert(home.clone(), home_dir);
        state.accounts.insert(
            account.username.to_string(),
            AccountRecord {
                primary_group: account.primary_group.to_string(),
                comment: account.comment.to_string(),
                shell: account.shell.to_string(),
                home,
            },
        );
        Ok(())
    }

    async fn create_directory(&self, path: &Path, mode: u32) -> Result<(), AccountError> {
        let mut state = self.enter(Capability::CreateDirectory)?;
        if state.files.contains_key(path) {
            return Err(AccountError::io(
                path,
                std::io::ErrorKind::AlreadyExists.into(),
            ));
        }
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            state
                .directories
                .entry(ancestor.to_path_buf())
                .or_insert_with(|| FileRecord::new(0o755));
        }
        state
            .directories
            .entry(path.to_path_buf())
            .or_insert_with(|| FileRecord::new(mode))
            .mode = mode;
        Ok(())
    }

    async fn set_owner(&self, path: &Path, user: &str, group: &str) -> Result<(), AccountError> {
        let mut state = self.enter(Capability::SetOwner)?;
        if !state.accounts.contains_key(user) {
            return Err(AccountError::UnknownPrincipal {
                kind: "user",
                name: user.to_string(),
            });
        }
        if !state.groups.contains(group) {
            return Err(AccountError::UnknownPrincipal {
                kind: "group",
                name: group.to_string(),
            });
        }
        let MemoryState {
            directories, files, ..
        } = &mut *state;
        let record = directories
            .get_mut(path)
            .or_else(|| files.get_mut(path))
            .ok_or_else(|| not_found(path))?;
        record.owner = Some((user.to_string(), group.to_string()));
        Ok(())
    }

    async fn write_file(&self, path: &Path, content: &[u8], mode: u32) -> Result<(), AccountError> {
        let mut state = self.enter(Capability::WriteFile)?;
        let parent = path.parent().ok_or_else(|| not_found(path))?;
        if !state.directories.contains_key(parent) {
            return Err(not_found(parent));
        }
        state
            .files
            .entry(path.to_path_buf())
            .or_insert_with(|| FileRecord::new(mode))
            .content = content.to_vec();
        Ok(())
    }

    async fn set_mode(&self, path: &Path, mode: u32) -> Result<(), AccountError> {
        let mut state = self.enter(Capability::SetMode)?;
        let MemoryState {
            directories, files, ..
        } = &mut *state;
        let record = directories
            .get_mut(path)
            .or_else(|| files.get_mut(path))
            .ok_or_else(|| not_found(path))?;
        record.mode = mode;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_account_requires_group() {
        let accounts = MemoryAccounts::new("/home");
        let new = NewAccount {
            username: "alice",
            primary_group: "devs",
            comment: "Alice R",
            shell: "/bin/bash",
        };

        assert!(accounts.create_account(&new).await.is_err());
        accounts.ensure_group("devs").await.expect("group");
        accounts.create_account(&new).await.expect("account");
        assert!(accounts.account_exists("alice").await.expect("exists"));
        assert!(
            accounts
                .snapshot()
                .directories
                .contains_key(Path::new("/home/alice"))
        );
    }

    #[tokio::test]
    async fn fail_times_recovers_after_count() {
        let accounts = MemoryAccounts::new("/home");
        accounts.fail_times(Capability::EnsureGroup, 2);

        assert!(accounts.ensure_group("devs").await.is_err());
        assert!(accounts.ensure_group("devs").await.is_err());
        assert!(accounts.ensure_group("devs").await.is_ok());
        assert_eq!(accounts.call_count(Capability::EnsureGroup), 3);
    }

    #[tokio::test]
    async fn write_file_needs_parent_directory() {
        let accounts = MemoryAccounts::new("/home");
        let err = accounts
            .write_file(Path::new("/home/alice/.ssh/authorized_keys"), b"k", 0o600)
            .await
            .expect_err("no parent");
        assert!(matches!(err, AccountError::Io { .. }));
    }
}
