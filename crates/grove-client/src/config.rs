//! Client configuration.

use crate::{Error, Result};
use grove_storage::Signature;
use serde::{Deserialize, Serialize};

/// Author and committer recorded in commits this client creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Display name.
    pub name: String,
    /// Email address.
    pub email: String,
}

impl Identity {
    /// Creates a validated identity.
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Result<Self> {
        let identity = Self {
            name: name.into(),
            email: email.into(),
        };
        identity.validate()?;
        Ok(identity)
    }

    /// Checks that both fields can be written into a commit header.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("name", &self.name), ("email", &self.email)] {
            if value.trim().is_empty() {
                return Err(Error::InvalidIdentity(format!("{field} is empty")));
            }
            if value.contains(['<', '>', '\n', '\r']) {
                return Err(Error::InvalidIdentity(format!(
                    "{field} {value:?} contains '<', '>' or a line break"
                )));
            }
        }
        Ok(())
    }

    /// A signature for this identity stamped with the current time.
    pub fn signature_now(&self) -> Signature {
        Signature::now(self.name.clone(), self.email.clone())
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Remote repository: a URL (`https://`, `git://`, `ssh://`, `file://`,
    /// `memory://`), an scp-like `user@host:path`, or a local path.
    pub endpoint: String,
    /// Identity for new commits; reads work without one.
    #[serde(default)]
    pub identity: Option<Identity>,
    /// Fetch trees without blob content when the remote supports it.
    #[serde(default = "default_partial_fetch")]
    pub partial_fetch: bool,
    /// Agent string sent to remotes.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_partial_fetch() -> bool {
    true
}

fn default_user_agent() -> String {
    concat!("grove/", env!("CARGO_PKG_VERSION")).to_string()
}

impl ClientConfig {
    /// Creates a configuration for `endpoint` with defaults for everything else.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            identity: None,
            partial_fetch: default_partial_fetch(),
            user_agent: default_user_agent(),
        }
    }

    /// Sets the commit identity.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Enables or disables partial (blob-less) fetches.
    pub fn with_partial_fetch(mut self, enabled: bool) -> Self {
        self.partial_fetch = enabled;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::UnsupportedEndpoint("endpoint is empty".to_string()));
        }
        if let Some(identity) = &self.identity {
            identity.validate()?;
        }
        Ok(())
    }
}
