use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::store::SessionBackend;

/// Session file name in the data directory
const SESSION_FILE: &str = "session.json";

/// Identity payload returned by the BFF. Only `id`, `email` and `name` are
/// interpreted; everything else is carried through untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, deserialize_with = "deserialize_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Ids arrive as strings from some services and as numbers from others.
fn deserialize_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

impl UserProfile {
    /// Best available label for display
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.email.as_deref())
            .or(self.id.as_deref())
            .unwrap_or("customer")
    }
}

/// Tokens and profile for the signed-in customer.
///
/// Serialized under the fixed keys `accessToken`, `refreshToken` and `user`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user: Option<UserProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(access_token: String, refresh_token: Option<String>, user: Option<UserProfile>) -> Self {
        Self {
            access_token,
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
            user,
            updated_at: Some(Utc::now()),
        }
    }

    /// Replace the access token in place. A rotated refresh token replaces
    /// the stored one; `None` keeps it.
    pub fn rotate(&mut self, access_token: String, refresh_token: Option<String>) {
        self.access_token = access_token;
        if let Some(token) = refresh_token.filter(|t| !t.is_empty()) {
            self.refresh_token = Some(token);
        }
        self.updated_at = Some(Utc::now());
    }

    pub fn set_user(&mut self, user: UserProfile) {
        self.user = Some(user);
        self.updated_at = Some(Utc::now());
    }

    pub fn is_authenticated(&self) -> bool {
        !self.access_token.is_empty() && self.user.is_some()
    }

    /// Minutes since the session was last written (for display)
    pub fn minutes_since_update(&self) -> Option<i64> {
        self.updated_at
            .map(|at| (Utc::now() - at).num_minutes().max(0))
    }
}

/// What the application shell hears about the session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A refresh handshake replaced the access token
    Refreshed,
    /// The session could not be recovered and was cleared; the shell should
    /// send the user to login
    Expired { reason: String },
    /// The user logged out
    LoggedOut,
}

/// Persists the session as JSON in a directory on disk
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }
}

impl SessionBackend for FileBackend {
    fn read(&self) -> Result<Option<Session>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .context("Failed to read session file")?;
        let session: Session = serde_json::from_str(&contents)
            .context("Failed to parse session file")?;
        Ok(Some(session))
    }

    fn write(&self, session: &Session) -> Result<()> {
        let path = self.path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(session)?;
        std::fs::write(&path, contents).context("Failed to write session file")?;

        // Tokens are secrets: owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, permissions)
                .context("Failed to restrict session file permissions")?;
        }

        Ok(())
    }

    fn erase(&self) -> Result<()> {
        let path = self.path();
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove session file")?;
        }
        Ok(())
    }
}
