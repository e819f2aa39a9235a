//! Anagrafe core types and utilities
//!
//! Shared by the HTTP client and the command-line front end. Nothing in this
//! crate performs I/O.

pub mod error;
pub mod jwt;
pub mod types;

pub use error::{TokenDecodeError, UnknownRole};
pub use jwt::Claims;
pub use types::{
    AuthResponse, ErrorResponse, LoginRequest, RefreshTokenRequest, RegistrationRequest, Role,
    UserRequest, UserResponse, UserUpdateRequest,
};
