//! User endpoints
//!
//! All of these are protected and go through the [`Gateway`].

use super::error::ClientError;
use super::gateway::Gateway;
use anagrafe_core::{UserRequest, UserResponse, UserUpdateRequest};
use reqwest::Method;

impl Gateway {
    /// Profile of the logged-in user
    pub async fn me(&self) -> Result<UserResponse, ClientError> {
        self.execute(self.request(Method::GET, "/auth/me")).await
    }

    pub async fn list_users(&self) -> Result<Vec<UserResponse>, ClientError> {
        self.execute(self.request(Method::GET, "/utenti")).await
    }

    pub async fn get_user(&self, id: i64) -> Result<UserResponse, ClientError> {
        self.execute(self.request(Method::GET, &format!("/utenti/{id}")))
            .await
    }

    /// Search users by name, surname or codice fiscale
    pub async fn search_users(&self, query: &str) -> Result<Vec<UserResponse>, ClientError> {
        let request = self
            .request(Method::GET, "/utenti/search")
            .query(&[("query", query)]);
        self.execute(request).await
    }

    pub async fn create_user(&self, user: &UserRequest) -> Result<UserResponse, ClientError> {
        self.execute(self.request(Method::POST, "/utenti").json(user))
            .await
    }

    pub async fn update_user(
        &self,
        id: i64,
        user: &UserUpdateRequest,
    ) -> Result<UserResponse, ClientError> {
        let request = self
            .request(Method::PUT, &format!("/utenti/{id}"))
            .json(user);
        self.execute(request).await
    }

    pub async fn delete_user(&self, id: i64) -> Result<(), ClientError> {
        self.execute_empty(self.request(Method::DELETE, &format!("/utenti/{id}")))
            .await
    }
}
