//! Signed-in user tracking on top of [`ApiClient`]

use crate::client::ApiClient;
use crate::error::Result;
use crate::token_store::TokenStorage;
use crate::types::{AuthResponse, EmployeeRegisterData, ManagerRegisterData, RegisterData, User};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Session state of the app: who is signed in, if anyone
pub struct Session<S: TokenStorage> {
    client: ApiClient<S>,
    user: RwLock<Option<User>>,
}

impl<S: TokenStorage> Session<S> {
    pub fn new(client: ApiClient<S>) -> Self {
        Self {
            client,
            user: RwLock::new(None),
        }
    }

    pub fn client(&self) -> &ApiClient<S> {
        &self.client
    }

    pub async fn current_user(&self) -> Option<User> {
        self.user.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.user.read().await.is_some()
    }

    /// Resume the session persisted by a previous run
    ///
    /// Without a stored access token this is a no-op. A profile fetch that
    /// fails even after the client's own refresh gets one explicit refresh
    /// and a second try; if that fails too the tokens are dropped and the
    /// session ends signed out. Never fails.
    pub async fn restore(&self) -> Option<User> {
        if self.client.access_token().await.is_none() {
            debug!("No stored session");
            return None;
        }

        let user = match self.client.profile().await {
            Ok(profile) => Some(profile.user),
            Err(e) => {
                warn!(error = %e, "Failed to load profile, retrying after token refresh");
                self.profile_after_refresh().await
            }
        };

        match &user {
            Some(u) => info!(user_id = %u.id, "Session restored"),
            None => {
                self.client.clear_tokens().await;
                info!("Stored session is no longer valid");
            }
        }
        *self.user.write().await = user.clone();
        user
    }

    async fn profile_after_refresh(&self) -> Option<User> {
        if let Err(e) = self.client.refresh_tokens().await {
            warn!(error = %e, "Failed to refresh token");
            return None;
        }
        match self.client.profile().await {
            Ok(profile) => Some(profile.user),
            Err(e) => {
                warn!(error = %e, "Failed to load profile after refresh");
                None
            }
        }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Option<User>> {
        let response = self.client.login(email, password).await?;
        Ok(self.adopt(&response).await)
    }

    pub async fn register(&self, data: &RegisterData) -> Result<Option<User>> {
        let response = self.client.register(data).await?;
        Ok(self.adopt(&response).await)
    }

    pub async fn register_manager(&self, data: &ManagerRegisterData) -> Result<Option<User>> {
        let response = self.client.register_manager(data).await?;
        Ok(self.adopt(&response).await)
    }

    /// Sign up with an invitation code
    ///
    /// The full response is returned so the caller can tell an account
    /// awaiting approval (still signed out) from one that is ready to use.
    pub async fn register_employee(&self, data: &EmployeeRegisterData) -> Result<AuthResponse> {
        let response = self.client.register_employee(data).await?;
        self.adopt(&response).await;
        Ok(response)
    }

    /// Only a response that issued tokens signs the user in
    async fn adopt(&self, response: &AuthResponse) -> Option<User> {
        if response.tokens().is_none() {
            debug!(requires_approval = response.requires_approval, "Auth response did not sign in");
            return None;
        }
        *self.user.write().await = response.user.clone();
        response.user.clone()
    }

    /// Sign out locally even when the server cannot be told
    pub async fn logout(&self) {
        if let Err(e) = self.client.logout().await {
            warn!(error = %e, "Logout request failed");
        }
        *self.user.write().await = None;
        self.client.clear_tokens().await;
    }

    /// Refetch the profile; on failure the cached user is kept
    pub async fn reload_profile(&self) -> Option<User> {
        match self.client.profile().await {
            Ok(profile) => {
                *self.user.write().await = Some(profile.user.clone());
                Some(profile.user)
            }
            Err(e) => {
                warn!(error = %e, "Failed to reload profile");
                self.current_user().await
            }
        }
    }
}
