//! TOML users database with Argon2 password hashes.
//!
//! ```toml
//! [users.john]
//! displayname = "John Doe"
//! email = "john.doe@example.com"
//! password = "$argon2id$v=19$m=19456,t=2,p=1$..."
//! groups = ["admins", "dev"]
//! ```

use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{collections::HashMap, path::Path, sync::Arc};
use tracing::{debug, info};

use super::{BackendError, UserBackend, UserDetails};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UsersFile {
    #[serde(default)]
    users: HashMap<String, UserEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UserEntry {
    #[serde(default)]
    displayname: Option<String>,
    #[serde(default)]
    email: Option<String>,
    password: String,
    #[serde(default)]
    groups: Vec<String>,
}

#[derive(Debug)]
struct StoredUser {
    password_hash: Arc<str>,
    details: UserDetails,
}

#[derive(Debug)]
pub struct FileUserBackend {
    users: HashMap<String, StoredUser>,
    dummy_hash: Arc<str>,
}

/// Hash `password` into an Argon2id PHC string suitable for the users database.
///
/// # Errors
/// Returns `BackendError::Verification` if hashing fails.
pub fn hash_password(password: &SecretString) -> Result<String, BackendError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.expose_secret().as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| BackendError::Verification(err.to_string()))
}

impl FileUserBackend {
    /// # Errors
    /// Returns `BackendError` if the file cannot be read or holds invalid entries.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| BackendError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let backend = Self::parse(&content)?;
        info!(
            path = %path.display(),
            users = backend.users.len(),
            "loaded users database"
        );
        Ok(backend)
    }

    /// # Errors
    /// Returns `BackendError` for malformed TOML or password hashes.
    pub fn parse(content: &str) -> Result<Self, BackendError> {
        let file: UsersFile = toml::from_str(content)?;

        let users = file
            .users
            .into_iter()
            .map(|(username, entry)| -> Result<(String, StoredUser), BackendError> {
                PasswordHash::new(&entry.password).map_err(|err| BackendError::InvalidHash {
                    username: username.clone(),
                    reason: err.to_string(),
                })?;

                let details = UserDetails {
                    username: username.clone(),
                    display_name: entry.displayname.unwrap_or_else(|| username.clone()),
                    email: entry.email,
                    groups: entry.groups,
                };
                let stored = StoredUser {
                    password_hash: Arc::from(entry.password),
                    details,
                };
                Ok((username, stored))
            })
            .collect::<Result<HashMap<_, _>, BackendError>>()?;

        // Unknown usernames are checked against this hash so they cost the
        // same as known ones.
        let dummy = SecretString::from(String::from("vigil-unknown-user"));
        let dummy_hash = Arc::from(hash_password(&dummy)?);

        Ok(Self { users, dummy_hash })
    }
}

#[async_trait]
impl UserBackend for FileUserBackend {
    async fn check_password(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<bool, BackendError> {
        let (hash, known) = match self.users.get(username) {
            Some(user) => (user.password_hash.clone(), true),
            None => (self.dummy_hash.clone(), false),
        };
        let password = SecretString::from(password.expose_secret().to_owned());

        let matches = tokio::task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&hash)
                .map_err(|err| BackendError::Verification(err.to_string()))?;
            Ok::<bool, BackendError>(
                Argon2::default()
                    .verify_password(password.expose_secret().as_bytes(), &parsed)
                    .is_ok(),
            )
        })
        .await
        .map_err(|err| BackendError::Verification(err.to_string()))??;

        if !known {
            debug!("Password check for unknown user {username}");
        }
        Ok(known && matches)
    }

    async fn get_details(&self, username: &str) -> Result<Option<UserDetails>, BackendError> {
        Ok(self.users.get(username).map(|user| user.details.clone()))
    }
}
