//! Administrator credential store.

use std::collections::HashMap;

use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use rand::rngs::OsRng;
use serde::Serialize;

use crate::ServerError;
use crate::config::Admin;
use crate::error::Result;

/// A fixed argon2id PHC string no password verifies against.
///
/// Unknown usernames are verified against it so that the unknown-username
/// and wrong-password paths cost the same and return the same error.
const DUMMY_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$gZiV/M1gPc22ElAH/Jh1Hw$CWOrkoo7oJBQ/iyh7uJ0LO2aLEfrHwTWllSAxT0zRno";

/// A provisioned administrator identity. Read-only at runtime.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AdminIdentity {
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub display_name: String,
    pub role: String,
}

/// Holds administrator identities and verifies passwords against their
/// argon2id hashes.
pub struct CredentialStore {
    admins: HashMap<String, AdminIdentity>,
}

impl CredentialStore {
    /// Create a new [`CredentialStore`] from provisioned entries.
    pub fn new(admins: &[Admin]) -> Self {
        let admins = admins
            .iter()
            .map(|admin| {
                (
                    admin.username.clone(),
                    AdminIdentity {
                        username: admin.username.clone(),
                        password_hash: admin.password_hash.clone(),
                        display_name: admin.display_name.clone(),
                        role: admin.role.clone(),
                    },
                )
            })
            .collect();

        Self { admins }
    }

    /// Verify a (username, password) pair.
    ///
    /// Returns the same [`ServerError::Auth`] whether the username is
    /// unknown or the password is wrong: no enumeration signal.
    pub fn verify(
        &self,
        username: &str,
        password: &str,
    ) -> Result<&AdminIdentity> {
        let Some(identity) = self.admins.get(username) else {
            let _ = check(password, DUMMY_HASH);
            return Err(ServerError::Auth);
        };

        check(password, &identity.password_hash)?;
        Ok(identity)
    }
}

fn check(password: &str, phc_hash: &str) -> Result<()> {
    let parsed = PasswordHash::new(phc_hash).map_err(|_| ServerError::Auth)?;

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| ServerError::Auth)
}

/// Hash a password into an argon2id PHC string, for provisioning.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ServerError::Internal {
            details: err.to_string(),
        })
}
