//! Request and response bodies exchanged with the Anagrafe backend
//!
//! Field names follow the backend's camelCase JSON.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::UnknownRole;

/// Role attached to an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    Utente,
}

impl Role {
    /// Wire name of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "ADMIN",
            Self::Utente => "UTENTE",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Ok(Self::Admin),
            "UTENTE" => Ok(Self::Utente),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

/// Credentials for `POST /auth/login`
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub codice_fiscale: String,
    pub password: String,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("codice_fiscale", &self.codice_fiscale)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Profile for `POST /auth/register`
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub nome: String,
    pub cognome: String,
    pub codice_fiscale: String,
    pub data_nascita: NaiveDate,
    pub password: String,
}

impl RegistrationRequest {
    /// Login credentials matching this registration
    pub fn credentials(&self) -> LoginRequest {
        LoginRequest {
            codice_fiscale: self.codice_fiscale.clone(),
            password: self.password.clone(),
        }
    }
}

impl fmt::Debug for RegistrationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationRequest")
            .field("nome", &self.nome)
            .field("cognome", &self.cognome)
            .field("codice_fiscale", &self.codice_fiscale)
            .field("data_nascita", &self.data_nascita)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Token pair issued by login and refresh
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub codice_fiscale: String,
    pub ruolo: Role,
}

impl fmt::Debug for AuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthResponse")
            .field("codice_fiscale", &self.codice_fiscale)
            .field("ruolo", &self.ruolo)
            .finish_non_exhaustive()
    }
}

/// Body of `POST /auth/refresh` and `POST /auth/logout`
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

/// A user record as returned by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: i64,
    pub nome: String,
    pub cognome: String,
    pub data_nascita: NaiveDate,
    pub ruolo: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codice_fiscale: Option<String>,
}

/// Admin request creating a user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRequest {
    pub nome: String,
    pub cognome: String,
    pub codice_fiscale: String,
    pub data_nascita: NaiveDate,
    pub ruolo: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Admin request updating a user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdateRequest {
    pub nome: String,
    pub cognome: String,
    pub data_nascita: NaiveDate,
    pub ruolo: Role,
}

/// Error body produced by the backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub timestamp: Option<String>,
    pub status: u16,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}
