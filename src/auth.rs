/// API key table and the authorization contract for ingestion
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::AuthError;

/// One API key: bound to a single client, or an admin key without client
/// restriction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub admin: bool,
}

impl ApiKey {
    pub fn client(client_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            admin: false,
        }
    }

    pub fn admin() -> Self {
        Self {
            client_id: None,
            admin: true,
        }
    }
}

/// Persisted as `auth.json` in the storage root.
///
/// An empty table means authorization is disabled and every request is
/// accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub keys: BTreeMap<String, ApiKey>,
}

impl AuthConfig {
    pub fn is_enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Check that `api_key` may submit readings on behalf of `client_id`
    pub fn authorize(&self, api_key: Option<&str>, client_id: &str) -> Result<(), AuthError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let key = api_key.ok_or(AuthError::MissingKey)?;
        let entry = self.keys.get(key).ok_or(AuthError::UnknownKey)?;

        if entry.admin {
            return Ok(());
        }
        match entry.client_id.as_deref() {
            Some(bound) if bound == client_id => Ok(()),
            _ => Err(AuthError::ClientMismatch(client_id.to_string())),
        }
    }

    fn require_admin(&self, admin_key: Option<&str>) -> Result<(), AuthError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let key = admin_key.ok_or(AuthError::MissingKey)?;
        match self.keys.get(key) {
            Some(entry) if entry.admin => Ok(()),
            Some(_) => Err(AuthError::AdminRequired),
            None => Err(AuthError::UnknownKey),
        }
    }

    pub fn add_key(
        &mut self,
        admin_key: Option<&str>,
        key: &str,
        entry: ApiKey,
    ) -> Result<(), AuthError> {
        // The first key is added without credentials and must be an admin key,
        // otherwise nobody could ever manage the table again
        if !self.is_enabled() && !entry.admin {
            return Err(AuthError::AdminRequired);
        }
        self.require_admin(admin_key)?;
        self.keys.insert(key.to_string(), entry);
        Ok(())
    }

    /// Remove a key, returning whether it existed
    pub fn revoke_key(&mut self, admin_key: Option<&str>, key: &str) -> Result<bool, AuthError> {
        self.require_admin(admin_key)?;
        Ok(self.keys.remove(key).is_some())
    }
}
