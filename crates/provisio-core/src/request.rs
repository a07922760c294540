//! Provisioning request payload.
//!
//! A [`ProvisioningRequest`] is what the registration side hands to the task
//! queue and what a worker turns into an OS account. Validation lives here so
//! that producers can reject bad input before anything is enqueued; the
//! provisioner itself trusts the payload and lets the OS tools reject it.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Login and group names accepted by `useradd`/`groupadd` in their default
/// (non-`--badname`) mode.
#[allow(clippy::expect_used)]
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("static regex is valid"));

/// Key type prefixes accepted in an authorized-keys line.
const KEY_TYPE_PREFIXES: &[&str] = &["ssh-", "ecdsa-", "sk-"];

/// Request to create and configure one OS account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRequest {
    /// OS login name; also the unique user identifier.
    pub username: String,
    /// Primary group, created if absent.
    pub group: String,
    /// Becomes the account comment (GECOS) field.
    pub description: String,
    /// Single public-key line for `authorized_keys`.
    pub public_key: String,
}

/// Why a request was rejected before enqueue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field} {value:?}: must match [a-z_][a-z0-9_-]{{0,31}}")]
    InvalidName { field: &'static str, value: String },

    #[error("description must not contain ':' or line breaks")]
    InvalidDescription,

    #[error("public key must be a single line starting with a supported key type")]
    InvalidPublicKey,
}

impl ProvisioningRequest {
    pub fn new(
        username: impl Into<String>,
        group: impl Into<String>,
        description: impl Into<String>,
        public_key: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            group: group.into(),
            description: description.into(),
            public_key: public_key.into(),
        }
    }

    /// Check the request the way the registration layer must before enqueue.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("username", &self.username),
            ("group", &self.group),
            ("description", &self.description),
            ("publicKey", &self.public_key),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingField(field));
            }
        }

        for (field, value) in [("username", &self.username), ("group", &self.group)] {
            if !NAME_RE.is_match(value) {
                return Err(ValidationError::InvalidName {
                    field,
                    value: value.clone(),
                });
            }
        }

        if self
            .description
            .chars()
            .any(|c| c == ':' || c == '\n' || c == '\r')
        {
            return Err(ValidationError::InvalidDescription);
        }

        let key = self.public_key.trim_end_matches(['\r', '\n']);
        if key.contains(['\r', '\n'])
            || !KEY_TYPE_PREFIXES
                .iter()
                .any(|prefix| key.starts_with(prefix))
        {
            return Err(ValidationError::InvalidPublicKey);
        }

        Ok(())
    }

    /// Authorized-keys file content: the key line with exactly one trailing newline.
    pub fn authorized_keys_content(&self) -> String {
        let mut content = self.public_key.trim_end_matches(['\r', '\n']).to_string();
        content.push('\n');
        content
    }
}

impl fmt::Display for ProvisioningRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.username, self.group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> ProvisioningRequest {
        ProvisioningRequest::new("alice", "devs", "Alice R", "ssh-ed25519 AAAAC3Nz alice@host")
    }

    #[test]
    fn valid_request_passes() {
        assert_eq!(alice().validate(), Ok(()));
    }

    #[test]
    fn empty_fields_are_rejected() {
        let mut req = alice();
        req.group = "  ".into();
        assert_eq!(req.validate(), Err(ValidationError::MissingField("group")));

        let mut req = alice();
        req.public_key = String::new();
        assert_eq!(
            req.validate(),
            Err(ValidationError::MissingField("publicKey"))
        );
    }

    #[test]
    fn bad_login_names_are_rejected() {
        for name in ["Alice", "1alice", "al ice", "alice;rm", &"a".repeat(33)] {
            let mut req = alice();
            req.username = name.to_string();
            assert!(
                matches!(
                    req.validate(),
                    Err(ValidationError::InvalidName {
                        field: "username",
                        ..
                    })
                ),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn description_with_gecos_separator_is_rejected() {
        let mut req = alice();
        req.description = "Alice:R".into();
        assert_eq!(req.validate(), Err(ValidationError::InvalidDescription));
    }

    #[test]
    fn multi_line_key_is_rejected() {
        let mut req = alice();
        req.public_key = "ssh-ed25519 AAAA\nssh-rsa BBBB".into();
        assert_eq!(req.validate(), Err(ValidationError::InvalidPublicKey));

        req.public_key = "not-a-key AAAA".into();
        assert_eq!(req.validate(), Err(ValidationError::InvalidPublicKey));
    }

    #[test]
    fn trailing_newline_on_key_is_tolerated() {
        let mut req = alice();
        req.public_key.push('\n');
        assert_eq!(req.validate(), Ok(()));
        assert_eq!(
            req.authorized_keys_content(),
            "ssh-ed25519 AAAAC3Nz alice@host\n"
        );
    }

    #[test]
    fn serializes_with_camel_case_public_key() {
        let json = serde_json::to_value(alice()).expect("serialize");
        assert_eq!(json["publicKey"], "ssh-ed25519 AAAAC3Nz alice@host");
        assert_eq!(json["group"], "devs");

        let back: ProvisioningRequest = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, alice());
    }
}
