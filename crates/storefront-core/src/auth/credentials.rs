use anyhow::{Context, Result};
use keyring::Entry;

use super::session::Session;
use super::store::SessionBackend;

const SERVICE_NAME: &str = "storefront";

/// Keyring account the serialized session is stored under
const SESSION_ACCOUNT: &str = "session";

/// Keeps the session in the OS keychain as a single JSON secret
pub struct KeyringBackend {
    account: String,
}

impl KeyringBackend {
    pub fn new() -> Self {
        Self::for_account(SESSION_ACCOUNT)
    }

    /// Separate keychain entry, e.g. one per store environment
    pub fn for_account(account: &str) -> Self {
        Self {
            account: account.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(SERVICE_NAME, &self.account).context("Failed to create keyring entry")
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBackend for KeyringBackend {
    fn read(&self) -> Result<Option<Session>> {
        match self.entry()?.get_password() {
            Ok(secret) => {
                let session = serde_json::from_str(&secret)
                    .context("Failed to parse session from keychain")?;
                Ok(Some(session))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve session from keychain"),
        }
    }

    fn write(&self, session: &Session) -> Result<()> {
        let secret = serde_json::to_string(session)?;
        self.entry()?
            .set_password(&secret)
            .context("Failed to store session in keychain")?;
        Ok(())
    }

    fn erase(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete session from keychain"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Talks to the real OS credential store; run with `--ignored` on a
    // machine that has one.
    #[test]
    #[ignore = "needs an OS credential store"]
    fn test_session_survives_separate_backends() {
        let account = format!("test-{}", uuid::Uuid::new_v4());
        let session = Session::new("a".into(), Some("r".into()), None);

        KeyringBackend::for_account(&account).write(&session).unwrap();

        let reopened = KeyringBackend::for_account(&account);
        let stored = reopened.read().unwrap();
        reopened.erase().unwrap();

        assert_eq!(stored.map(|s| s.access_token).as_deref(), Some("a"));
        assert!(reopened.read().unwrap().is_none());
    }

    #[test]
    fn test_default_account() {
        assert_eq!(KeyringBackend::default().account, SESSION_ACCOUNT);
        assert_eq!(KeyringBackend::for_account("staging").account, "staging");
    }
}
