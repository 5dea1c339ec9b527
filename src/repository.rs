use std::path::Path;

use async_trait::async_trait;
use color_eyre::eyre::Context;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tokio::fs;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct User {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) auth_token: String,
    #[serde(default)]
    pub(crate) can_specify_subdomains: bool,
    #[serde(default)]
    pub(crate) can_specify_hostnames: bool,
    #[serde(default)]
    pub(crate) can_share_tcp_ports: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct SubdomainReservation {
    pub(crate) subdomain: String,
    pub(crate) user_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct HostnameReservation {
    // Either an exact hostname or a pattern with `*` wildcards.
    pub(crate) hostname: String,
    pub(crate) user_id: u64,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait UserRepository {
    async fn get_user_by_token(&self, token: &str) -> Option<User>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait SubdomainRepository {
    async fn get_subdomain_by_name(&self, name: &str) -> Option<SubdomainReservation>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait HostnameRepository {
    async fn get_hostnames_by_user_id(&self, user_id: u64) -> Vec<HostnameReservation>;
}

// Repository kept entirely in memory, optionally seeded from a JSON file of the form:
//
// {"users": [...], "subdomains": [...], "hostnames": [...]}
#[derive(Debug, Default, Deserialize)]
pub(crate) struct MemoryRepository {
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    subdomains: Vec<SubdomainReservation>,
    #[serde(default)]
    hostnames: Vec<HostnameReservation>,
}

impl MemoryRepository {
    pub(crate) async fn from_file(path: &Path) -> color_eyre::Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Error reading users file {}", path.display()))?;
        let repository: MemoryRepository = serde_json::from_str(&contents)
            .with_context(|| format!("Error parsing users file {}", path.display()))?;
        info!(
            users = repository.users.len(),
            subdomains = repository.subdomains.len(),
            hostnames = repository.hostnames.len(),
            "Loaded users file."
        );
        Ok(repository)
    }
}

#[async_trait]
impl UserRepository for MemoryRepository {
    async fn get_user_by_token(&self, token: &str) -> Option<User> {
        self.users
            .iter()
            .find(|user| !user.auth_token.is_empty() && user.auth_token == token)
            .cloned()
    }
}

#[async_trait]
impl SubdomainRepository for MemoryRepository {
    async fn get_subdomain_by_name(&self, name: &str) -> Option<SubdomainReservation> {
        self.subdomains
            .iter()
            .find(|reservation| reservation.subdomain.eq_ignore_ascii_case(name))
            .cloned()
    }
}

#[async_trait]
impl HostnameRepository for MemoryRepository {
    async fn get_hostnames_by_user_id(&self, user_id: u64) -> Vec<HostnameReservation> {
        self.hostnames
            .iter()
            .filter(|reservation| reservation.user_id == user_id)
            .cloned()
            .collect()
    }
}
