//! Password authentication from the server config

use std::collections::HashMap;

use async_trait::async_trait;
use wisp_mux::Authenticator;

/// Checks credentials against a fixed username -> password table
pub struct StaticAuthenticator {
    users: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn verify(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|expected| expected == password)
    }
}
