//! API credential types shared by the pool and the analysis collaborator.

use serde::{Deserialize, Serialize};

/// Identifier of a configured credential (`key-0`, `key-1`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(pub String);

impl CredentialId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CredentialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One rotatable API key handed to the analysis call.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: CredentialId,
    secret: String,
}

impl Credential {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: CredentialId::new(id),
            secret: secret.into(),
        }
    }

    /// The raw secret, for the outbound call only.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// First four characters of the secret followed by an ellipsis.
    pub fn masked(&self) -> String {
        let prefix: String = self.secret.chars().take(4).collect();
        format!("{prefix}…")
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("secret", &self.masked())
            .finish()
    }
}

/// Point-in-time view of one credential's rate-limit state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialStatus {
    pub id: CredentialId,
    pub masked_secret: String,
    pub usable: bool,
    /// Milliseconds left before a cooling credential becomes usable again.
    pub cooldown_remaining_ms: u64,
    pub consecutive_failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_the_secret() {
        let credential = Credential::new("key-0", "AIzaSyVerySecretValue");
        let printed = format!("{credential:?}");
        assert!(!printed.contains("VerySecret"));
        assert!(printed.contains("AIza…"));
        assert_eq!(credential.secret(), "AIzaSyVerySecretValue");
    }
}
