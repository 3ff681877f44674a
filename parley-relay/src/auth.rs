//! CONNECT authentication.
//!
//! End-user devices present `{appId, deviceId, token}` on `/`; operators
//! present `{appId, agentId, token}` on `/admin`. Token validation itself
//! sits behind [`Authenticator`] so deployments can plug in their own
//! identity provider.

use crate::config::AuthConfig;
use async_trait::async_trait;
use parley_types::{AgentId, AppId, ConnectAuth, DeviceId, Namespace};

/// Who a connection belongs to, once authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// End-user device on the client namespace.
    User {
        /// Application the device belongs to.
        app_id: AppId,
        /// The device.
        device_id: DeviceId,
    },
    /// Operator on the admin namespace.
    Agent {
        /// Application the operator serves.
        app_id: AppId,
        /// The operator.
        agent_id: AgentId,
        /// Display name shown on their messages.
        name: String,
    },
}

impl Identity {
    /// Application of the connection.
    pub fn app_id(&self) -> &AppId {
        match self {
            Identity::User { app_id, .. } | Identity::Agent { app_id, .. } => app_id,
        }
    }

    /// Namespace this identity is valid on.
    pub fn namespace(&self) -> Namespace {
        match self {
            Identity::User { .. } => Namespace::Client,
            Identity::Agent { .. } => Namespace::Admin,
        }
    }
}

/// Authentication failures. The message is sent back in CONNECT_ERROR.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Client namespace requires a device id.
    #[error("deviceId is required")]
    MissingDevice,
    /// Admin namespace requires an agent id.
    #[error("agentId is required")]
    MissingAgent,
    /// App id is not configured.
    #[error("unknown app")]
    UnknownApp,
    /// Token did not match.
    #[error("invalid token")]
    InvalidToken,
}

/// Validates CONNECT credentials.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate a connection attempt on `namespace`.
    async fn authenticate(
        &self,
        namespace: Namespace,
        auth: &ConnectAuth,
    ) -> Result<Identity, AuthError>;

    /// Whether `token` grants admin access to `app_id` (HTTP admin API).
    fn is_admin_token(&self, app_id: &AppId, token: &str) -> bool;
}

/// Static credentials from the `[auth]` config section.
#[derive(Debug, Clone)]
pub struct ConfigAuthenticator {
    config: AuthConfig,
}

impl ConfigAuthenticator {
    /// Create an authenticator over the configured apps.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Authenticator for ConfigAuthenticator {
    async fn authenticate(
        &self,
        namespace: Namespace,
        auth: &ConnectAuth,
    ) -> Result<Identity, AuthError> {
        let app = self
            .config
            .apps
            .get(auth.app_id.as_str())
            .ok_or(AuthError::UnknownApp)?;

        match namespace {
            Namespace::Client => {
                let device_id = auth.device_id.clone().ok_or(AuthError::MissingDevice)?;
                if app.client_secret.is_empty() || app.client_secret != auth.token {
                    return Err(AuthError::InvalidToken);
                }
                Ok(Identity::User {
                    app_id: auth.app_id.clone(),
                    device_id,
                })
            }
            Namespace::Admin => {
                let agent_id = auth.agent_id.clone().ok_or(AuthError::MissingAgent)?;
                if !self.is_admin_token(&auth.app_id, &auth.token) {
                    return Err(AuthError::InvalidToken);
                }
                let name = app
                    .agents
                    .get(agent_id.as_str())
                    .cloned()
                    .unwrap_or_else(|| agent_id.to_string());
                Ok(Identity::Agent {
                    app_id: auth.app_id.clone(),
                    agent_id,
                    name,
                })
            }
        }
    }

    fn is_admin_token(&self, app_id: &AppId, token: &str) -> bool {
        self.config
            .apps
            .get(app_id.as_str())
            .is_some_and(|app| !app.admin_token.is_empty() && app.admin_token == token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppCredentials;
    use std::collections::HashMap;

    fn authenticator() -> ConfigAuthenticator {
        let mut apps = HashMap::new();
        apps.insert(
            "acme".to_string(),
            AppCredentials {
                client_secret: "s3cret".to_string(),
                admin_token: "adm1n".to_string(),
                agents: HashMap::from([("a7".to_string(), "Sam".to_string())]),
            },
        );
        ConfigAuthenticator::new(AuthConfig { apps })
    }

    fn user_auth(token: &str) -> ConnectAuth {
        ConnectAuth {
            app_id: "acme".into(),
            device_id: Some("d1".into()),
            agent_id: None,
            token: token.to_string(),
        }
    }

    fn agent_auth(agent: &str, token: &str) -> ConnectAuth {
        ConnectAuth {
            app_id: "acme".into(),
            device_id: None,
            agent_id: Some(agent.into()),
            token: token.to_string(),
        }
    }

    #[tokio::test]
    async fn user_with_client_secret_is_accepted() {
        let identity = authenticator()
            .authenticate(Namespace::Client, &user_auth("s3cret"))
            .await
            .unwrap();
        assert_eq!(
            identity,
            Identity::User {
                app_id: "acme".into(),
                device_id: "d1".into(),
            }
        );
        assert_eq!(identity.namespace(), Namespace::Client);
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let result = authenticator()
            .authenticate(Namespace::Client, &user_auth("nope"))
            .await;
        assert_eq!(result, Err(AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn unknown_app_is_rejected() {
        let auth = ConnectAuth {
            app_id: "globex".into(),
            ..user_auth("s3cret")
        };
        let result = authenticator().authenticate(Namespace::Client, &auth).await;
        assert_eq!(result, Err(AuthError::UnknownApp));
    }

    #[tokio::test]
    async fn client_namespace_needs_device() {
        let auth = ConnectAuth {
            device_id: None,
            ..user_auth("s3cret")
        };
        let result = authenticator().authenticate(Namespace::Client, &auth).await;
        assert_eq!(result, Err(AuthError::MissingDevice));
    }

    #[tokio::test]
    async fn client_secret_does_not_open_admin() {
        let result = authenticator()
            .authenticate(Namespace::Admin, &agent_auth("a7", "s3cret"))
            .await;
        assert_eq!(result, Err(AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn agent_name_comes_from_config() {
        let auth = authenticator();
        let known = auth
            .authenticate(Namespace::Admin, &agent_auth("a7", "adm1n"))
            .await
            .unwrap();
        let unknown = auth
            .authenticate(Namespace::Admin, &agent_auth("a9", "adm1n"))
            .await
            .unwrap();

        assert!(matches!(known, Identity::Agent { ref name, .. } if name == "Sam"));
        assert!(matches!(unknown, Identity::Agent { ref name, .. } if name == "a9"));
        assert_eq!(known.app_id(), &AppId::from("acme"));
    }

    #[test]
    fn admin_token_check() {
        let auth = authenticator();
        assert!(auth.is_admin_token(&"acme".into(), "adm1n"));
        assert!(!auth.is_admin_token(&"acme".into(), "s3cret"));
        assert!(!auth.is_admin_token(&"globex".into(), "adm1n"));
    }
}
