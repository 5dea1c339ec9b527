use std::sync::Arc;

use bon::Builder;
use tracing::debug;

use crate::{
    addressing::{hostname_matches, is_valid_subdomain},
    config::Messages,
    connections::LiveBindings,
    error::ServerError,
    protocol::ServerMessage,
    repository::{HostnameRepository, SubdomainRepository, User, UserRepository},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RejectionKind {
    AuthenticationFailed,
    SubdomainTaken,
    HostnameTaken,
}

// Refusal of an authentication attempt, along with the message shown to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rejection {
    pub(crate) kind: RejectionKind,
    pub(crate) message: String,
}

impl Rejection {
    pub(crate) fn authentication_failed(message: impl Into<String>) -> Self {
        Rejection {
            kind: RejectionKind::AuthenticationFailed,
            message: message.into(),
        }
    }

    pub(crate) fn subdomain_taken(message: &str, subdomain: &str) -> Self {
        Rejection {
            kind: RejectionKind::SubdomainTaken,
            message: message.replace(":subdomain", subdomain),
        }
    }

    pub(crate) fn hostname_taken(message: &str, hostname: &str) -> Self {
        Rejection {
            kind: RejectionKind::HostnameTaken,
            message: message.replace(":hostname", hostname),
        }
    }

    pub(crate) fn into_message(self) -> ServerMessage {
        let Rejection { kind, message } = self;
        match kind {
            RejectionKind::AuthenticationFailed => ServerMessage::AuthenticationFailed { message },
            RejectionKind::SubdomainTaken => ServerMessage::SubdomainTaken { message },
            RejectionKind::HostnameTaken => ServerMessage::HostnameTaken { message },
        }
    }
}

// Subdomain that a client may bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AuthorizedSubdomain {
    // If missing, a random subdomain must be assigned.
    pub(crate) subdomain: Option<String>,
    // Informational message to forward to the client, such as a demotion to a random subdomain.
    pub(crate) notice: Option<String>,
}

// Decides what an identity may bind, from the user repositories and the live bindings.
#[derive(Builder)]
pub(crate) struct IdentityAuthorizer {
    users: Arc<dyn UserRepository + Send + Sync>,
    subdomains: Arc<dyn SubdomainRepository + Send + Sync>,
    hostnames: Arc<dyn HostnameRepository + Send + Sync>,
    bindings: Arc<dyn LiveBindings + Send + Sync>,
    messages: Arc<Messages>,
    // Whether an authentication token is required from every client.
    validate_auth_tokens: bool,
    #[builder(into)]
    admin_subdomain: String,
}

impl IdentityAuthorizer {
    // Resolve the token to a user. When token validation is disabled, there is no user
    // and no restriction.
    pub(crate) async fn verify_auth_token(
        &self,
        token: Option<&str>,
    ) -> Result<Option<User>, ServerError> {
        if !self.validate_auth_tokens {
            return Ok(None);
        }
        let token = token
            .filter(|token| !token.is_empty())
            .ok_or(ServerError::AuthenticationFailed)?;
        let user = self
            .users
            .get_user_by_token(token)
            .await
            .ok_or(ServerError::AuthenticationFailed)?;
        debug!(user = %user.name, "Authenticated user.");
        Ok(Some(user))
    }

    // Same as verify_auth_token, turning a failure into the message for the client.
    pub(crate) async fn authenticate(&self, token: Option<&str>) -> Result<Option<User>, Rejection> {
        self.verify_auth_token(token)
            .await
            .map_err(|_| Rejection::authentication_failed(&self.messages.invalid_auth_token))
    }

    pub(crate) async fn authorize_subdomain(
        &self,
        requested: Option<&str>,
        user: Option<&User>,
    ) -> Result<AuthorizedSubdomain, Rejection> {
        let Some(requested) = requested.filter(|subdomain| !subdomain.is_empty()) else {
            return Ok(AuthorizedSubdomain {
                subdomain: None,
                notice: None,
            });
        };
        if user.is_some_and(|user| !user.can_specify_subdomains) {
            return Ok(AuthorizedSubdomain {
                subdomain: None,
                notice: Some(self.messages.custom_subdomain_unauthorized.clone()),
            });
        }
        let subdomain = requested.to_ascii_lowercase();
        if !is_valid_subdomain(&subdomain) {
            return Err(Rejection::subdomain_taken(
                &self.messages.subdomain_invalid,
                requested,
            ));
        }
        if let Some(user) = user {
            if let Some(reservation) = self.subdomains.get_subdomain_by_name(&subdomain).await {
                if reservation.user_id != user.id {
                    return Err(Rejection::subdomain_taken(
                        &self.messages.subdomain_reserved,
                        &subdomain,
                    ));
                }
            }
        }
        if subdomain.eq_ignore_ascii_case(&self.admin_subdomain)
            || self.bindings.is_subdomain_bound(&subdomain)
        {
            return Err(Rejection::subdomain_taken(
                &self.messages.subdomain_taken,
                &subdomain,
            ));
        }
        Ok(AuthorizedSubdomain {
            subdomain: Some(subdomain),
            notice: None,
        })
    }

    pub(crate) async fn authorize_hostname(
        &self,
        requested: &str,
        user: Option<&User>,
    ) -> Result<String, Rejection> {
        let hostname = requested.trim_end_matches('.').to_ascii_lowercase();
        let Some(user) = user else {
            return Err(Rejection::hostname_taken(
                &self.messages.hostname_invalid,
                &hostname,
            ));
        };
        if !user.can_specify_hostnames {
            return Err(Rejection::hostname_taken(
                &self.messages.custom_hostname_unauthorized,
                &hostname,
            ));
        }
        let reserved = self
            .hostnames
            .get_hostnames_by_user_id(user.id)
            .await
            .iter()
            .any(|reservation| hostname_matches(&reservation.hostname, &hostname));
        if !reserved {
            return Err(Rejection::hostname_taken(
                &self.messages.hostname_invalid,
                &hostname,
            ));
        }
        if self.bindings.is_hostname_bound(&hostname) {
            return Err(Rejection::hostname_taken(
                &self.messages.hostname_taken,
                &hostname,
            ));
        }
        Ok(hostname)
    }

    // Whether any user holds a reservation for the subdomain.
    pub(crate) async fn is_subdomain_reserved(&self, subdomain: &str) -> bool {
        self.subdomains
            .get_subdomain_by_name(&subdomain.to_ascii_lowercase())
            .await
            .is_some()
    }

    pub(crate) fn authorize_tcp_sharing(&self, user: Option<&User>) -> bool {
        !user.is_some_and(|user| !user.can_share_tcp_ports)
    }

    pub(crate) fn messages(&self) -> &Messages {
        &self.messages
    }
}
