//! Channel types: the secret pair and launch parameters behind an
//! interactive operation.

use std::collections::BTreeMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{Dimensions, Error, OperationId, Result};

/// Number of random bytes in a channel secret (hex-encoded to twice as many chars).
pub const SECRET_BYTES: usize = 64;

/// Environment every exec session starts from.
pub const DEFAULT_ENVIRONMENT: &[(&str, &str)] = &[
    ("HOME", "/root"),
    ("LANG", "C.UTF-8"),
    ("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"),
    ("TERM", "xterm-256color"),
    ("USER", "root"),
];

/// The role a secret grants on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    /// Terminal byte stream
    Data,
    /// Out-of-band control messages
    Control,
}

impl std::fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelRole::Data => f.write_str("data"),
            ChannelRole::Control => f.write_str("control"),
        }
    }
}

/// What to launch once the data role attaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    /// Argument vector (ignored for console sessions)
    pub command: Vec<String>,
    /// Full environment, defaults already merged
    pub environment: BTreeMap<String, String>,
    /// Numeric user id
    pub user: u32,
    /// Numeric group id
    pub group: u32,
    /// Initial terminal size
    pub dimensions: Dimensions,
    /// Attach to the instance console instead of running a command
    pub is_console: bool,
    /// Client asked for an interactive terminal
    pub interactive: bool,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            environment: default_environment(),
            user: 0,
            group: 0,
            dimensions: Dimensions::default(),
            is_console: false,
            interactive: true,
        }
    }
}

/// Secret pair plus launch parameters for one interactive operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Owning operation id
    pub id: OperationId,
    /// Secret for the terminal stream
    pub data_secret: String,
    /// Secret for the control stream
    pub control_secret: String,
    /// Launch parameters
    pub session: SessionParams,
    /// Data secret already used
    pub data_claimed: bool,
    /// Control secret already used
    pub control_claimed: bool,
}

impl Channel {
    /// Create a channel with a freshly generated, pairwise-distinct secret pair.
    pub fn new(id: OperationId, session: SessionParams) -> Self {
        let data_secret = generate_secret();
        let mut control_secret = generate_secret();
        while control_secret == data_secret {
            control_secret = generate_secret();
        }
        Self {
            id,
            data_secret,
            control_secret,
            session,
            data_claimed: false,
            control_claimed: false,
        }
    }

    /// The `fds` map announced to clients.
    pub fn fds(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("0".to_string(), self.data_secret.clone()),
            ("control".to_string(), self.control_secret.clone()),
        ])
    }

    /// Role `secret` would claim right now, without consuming it.
    pub fn role_of(&self, secret: &str) -> Option<ChannelRole> {
        let is_data = secrets_match(&self.data_secret, secret);
        let is_control = secrets_match(&self.control_secret, secret);

        if is_data && !self.data_claimed {
            Some(ChannelRole::Data)
        } else if is_control && !self.control_claimed {
            Some(ChannelRole::Control)
        } else {
            None
        }
    }

    /// Consume the role matching `secret`.
    ///
    /// Both secrets are always compared so timing does not reveal which one
    /// (if any) matched.
    pub fn claim(&mut self, secret: &str) -> Result<ChannelRole> {
        let role = self.role_of(secret).ok_or(Error::AuthMismatch)?;
        match role {
            ChannelRole::Data => self.data_claimed = true,
            ChannelRole::Control => self.control_claimed = true,
        }
        Ok(role)
    }
}

/// Generate a hex-encoded secret from the thread-local CSPRNG.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time comparison for equal-length inputs.
pub fn secrets_match(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// The fixed default exec environment.
pub fn default_environment() -> BTreeMap<String, String> {
    DEFAULT_ENVIRONMENT
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Merge request-supplied variables over the default environment.
pub fn merge_environment<I>(overrides: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env = default_environment();
    env.extend(overrides);
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel() -> Channel {
        Channel::new(OperationId::new(), SessionParams::default())
    }

    #[test]
    fn test_secret_shape() {
        let secret = generate_secret();
        assert_eq!(secret.len(), SECRET_BYTES * 2);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_secrets_are_distinct() {
        let channel = test_channel();
        assert_ne!(channel.data_secret, channel.control_secret);
    }

    #[test]
    fn test_claim_data_then_control() {
        let mut channel = test_channel();
        let data = channel.data_secret.clone();
        let control = channel.control_secret.clone();

        assert_eq!(channel.claim(&data).unwrap(), ChannelRole::Data);
        assert_eq!(channel.claim(&control).unwrap(), ChannelRole::Control);
        assert!(channel.data_claimed);
        assert!(channel.control_claimed);
    }

    #[test]
    fn test_claim_twice_is_rejected() {
        let mut channel = test_channel();
        let data = channel.data_secret.clone();
        channel.claim(&data).unwrap();
        assert!(matches!(channel.claim(&data), Err(Error::AuthMismatch)));
    }

    #[test]
    fn test_claim_wrong_secret() {
        let mut channel = test_channel();
        assert!(matches!(channel.claim("nope"), Err(Error::AuthMismatch)));
        assert!(matches!(
            channel.claim(&generate_secret()),
            Err(Error::AuthMismatch)
        ));
        assert!(!channel.data_claimed);
        assert!(!channel.control_claimed);
    }

    #[test]
    fn test_role_of_does_not_consume() {
        let channel = test_channel();
        assert_eq!(channel.role_of(&channel.data_secret), Some(ChannelRole::Data));
        assert_eq!(channel.role_of(&channel.data_secret), Some(ChannelRole::Data));
        assert_eq!(channel.role_of("nope"), None);
        assert!(!channel.data_claimed);
    }

    #[test]
    fn test_secrets_match() {
        assert!(secrets_match("abc", "abc"));
        assert!(!secrets_match("abc", "abd"));
        assert!(!secrets_match("abc", "abcd"));
        assert!(!secrets_match("abc", ""));
    }

    #[test]
    fn test_fds_map() {
        let channel = test_channel();
        let fds = channel.fds();
        assert_eq!(fds["0"], channel.data_secret);
        assert_eq!(fds["control"], channel.control_secret);
    }

    #[test]
    fn test_merge_environment_overrides_defaults() {
        let env = merge_environment([
            ("TERM".to_string(), "vt100".to_string()),
            ("FOO".to_string(), "bar".to_string()),
        ]);
        assert_eq!(env["TERM"], "vt100");
        assert_eq!(env["FOO"], "bar");
        assert_eq!(env["HOME"], "/root");
        assert_eq!(env.len(), DEFAULT_ENVIRONMENT.len() + 1);
    }

    #[test]
    fn test_empty_overrides_yield_defaults() {
        assert_eq!(merge_environment(Vec::new()), default_environment());
    }
}
