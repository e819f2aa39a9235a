//! Authentication API client methods
//!
//! These endpoints never carry a bearer token and are never retried.

use super::{ApiClient, ClientError};
use crate::session::AuthBackend;
use anagrafe_core::{
    AuthResponse, LoginRequest, RefreshTokenRequest, RegistrationRequest, UserResponse,
};
use async_trait::async_trait;
use reqwest::Method;

pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Endpoints that are sent without credentials and never trigger recovery
pub const UNAUTHENTICATED_PATHS: [&str; 4] = [LOGIN_PATH, REGISTER_PATH, REFRESH_PATH, LOGOUT_PATH];

impl ApiClient {
    /// Exchange credentials for a token pair
    pub async fn login(&self, credentials: &LoginRequest) -> Result<AuthResponse, ClientError> {
        let request = self.request(Method::POST, LOGIN_PATH).json(credentials);
        self.execute(request).await
    }

    /// Create an account. Does not log in.
    pub async fn register(
        &self,
        profile: &RegistrationRequest,
    ) -> Result<UserResponse, ClientError> {
        let request = self.request(Method::POST, REGISTER_PATH).json(profile);
        self.execute(request).await
    }

    /// Mint a new token pair from a refresh token
    pub async fn refresh(&self, refresh_token: &str) -> Result<AuthResponse, ClientError> {
        let request = self
            .request(Method::POST, REFRESH_PATH)
            .json(&RefreshTokenRequest {
                refresh_token: refresh_token.to_string(),
            });
        self.execute(request).await
    }

    /// Revoke a refresh token server-side
    pub async fn logout(&self, refresh_token: &str) -> Result<(), ClientError> {
        let request = self
            .request(Method::POST, LOGOUT_PATH)
            .json(&RefreshTokenRequest {
                refresh_token: refresh_token.to_string(),
            });
        self.execute_empty(request).await
    }
}

#[async_trait]
impl AuthBackend for ApiClient {
    async fn login(&self, credentials: &LoginRequest) -> Result<AuthResponse, ClientError> {
        ApiClient::login(self, credentials).await
    }

    async fn register(&self, profile: &RegistrationRequest) -> Result<UserResponse, ClientError> {
        ApiClient::register(self, profile).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthResponse, ClientError> {
        ApiClient::refresh(self, refresh_token).await
    }

    async fn logout(&self, refresh_token: &str) -> Result<(), ClientError> {
        ApiClient::logout(self, refresh_token).await
    }
}
