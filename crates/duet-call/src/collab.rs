//! Interfaces the call layer consumes from the surrounding application.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Supplies the local identity. `None` while nobody is signed in.
pub trait IdentityProvider: Send + Sync {
    fn local_identity(&self) -> Option<String>;
}

/// Fixed identity, for tools and tests.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    identity: RwLock<Option<String>>,
}

impl StaticIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: RwLock::new(Some(identity.into())),
        }
    }

    pub fn set(&self, identity: Option<String>) {
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = identity;
    }
}

impl IdentityProvider for StaticIdentity {
    fn local_identity(&self) -> Option<String> {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// What a UI shows for a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub identity: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl Profile {
    /// Profile with the identity as its display name.
    pub fn bare(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            display_name: identity.to_string(),
            avatar_url: None,
        }
    }
}

/// Caller name and avatar lookup. Only presentation code uses it.
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn profile(&self, identity: &str) -> Option<Profile>;

    async fn display_name(&self, identity: &str) -> String {
        self.profile(identity)
            .await
            .map(|p| p.display_name)
            .unwrap_or_else(|| identity.to_string())
    }
}

#[derive(Debug, Default)]
pub struct StaticProfiles {
    profiles: HashMap<String, Profile>,
}

impl StaticProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, profile: Profile) -> Self {
        self.profiles.insert(profile.identity.clone(), profile);
        self
    }
}

#[async_trait]
impl ProfileLookup for StaticProfiles {
    async fn profile(&self, identity: &str) -> Option<Profile> {
        self.profiles.get(identity).cloned()
    }
}
