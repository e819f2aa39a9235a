//! Authenticated request gateway
//!
//! Attaches the bearer token to every protected request. When a protected
//! request comes back `401` and a refresh token is stored, the gateway joins
//! the session's shared refresh and replays the request once with the new
//! access token. The auth endpoints themselves are sent bare and never
//! recovered, so a failing refresh cannot recurse.

use super::auth::UNAUTHENTICATED_PATHS;
use super::{ApiClient, read_empty, read_json};
use crate::client::error::ClientError;
use crate::session::SessionStore;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Method, Request, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

/// Transport for every non-auth endpoint
#[derive(Clone)]
pub struct Gateway {
    api: ApiClient,
    session: SessionStore,
}

impl Gateway {
    pub fn new(api: ApiClient, session: SessionStore) -> Self {
        Self { api, session }
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Create a request builder for a path relative to the base URL
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.api.request(method, path)
    }

    /// Send a request, recovering once from an expired access token
    ///
    /// Any response other than a recoverable `401` is returned as-is, error
    /// statuses included. Requests whose body cannot be cloned are never
    /// replayed.
    pub async fn dispatch(&self, mut request: Request) -> Result<Response, ClientError> {
        let protected = !is_unauthenticated_endpoint(request.url().path());

        let sent_token = if protected {
            let token = self.session.access_token();
            if let Some(token) = token.as_deref() {
                set_bearer(&mut request, token)?;
            }
            token
        } else {
            None
        };

        let replay = request.try_clone();
        let response = self.api.http().execute(request).await?;

        if !protected
            || response.status() != StatusCode::UNAUTHORIZED
            || self.session.refresh_token().is_none()
        {
            return Ok(response);
        }

        let Some(replay) = replay else {
            debug!("401 on a request with a streaming body, not replaying");
            return Ok(response);
        };

        self.recover(replay, sent_token).await
    }

    /// Execute a request and decode a JSON body
    pub async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = self.dispatch(request.build()?).await?;
        read_json(response).await
    }

    /// Execute a request whose response body is ignored
    pub async fn execute_empty(&self, request: RequestBuilder) -> Result<(), ClientError> {
        let response = self.dispatch(request.build()?).await?;
        read_empty(response).await
    }

    async fn recover(
        &self,
        mut replay: Request,
        sent_token: Option<String>,
    ) -> Result<Response, ClientError> {
        let current = self.session.access_token();

        let token = match current {
            // Another caller already refreshed while this request was out
            Some(current) if sent_token.as_deref() != Some(current.as_str()) => {
                debug!(url = %replay.url(), "access token changed since send, replaying");
                current
            }
            _ => {
                debug!(url = %replay.url(), "access token rejected, refreshing");
                self.session.refresh_current().await?.access_token
            }
        };

        set_bearer(&mut replay, &token)?;
        Ok(self.api.http().execute(replay).await?)
    }
}

fn set_bearer(request: &mut Request, token: &str) -> Result<(), ClientError> {
    let value = HeaderValue::from_str(&format!("Bearer {token}"))?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(())
}

/// Whether `path` is one of the auth endpoints that carry no credentials
pub fn is_unauthenticated_endpoint(path: &str) -> bool {
    let path = path.trim_end_matches('/');
    UNAUTHENTICATED_PATHS
        .iter()
        .any(|endpoint| path.ends_with(endpoint))
}
