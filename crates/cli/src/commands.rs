//! CLI commands

use anagrafe_core::{
    LoginRequest, RegistrationRequest, Role, UserRequest, UserResponse, UserUpdateRequest,
};
use anagrafe_http::{ApiClient, FileTokenStore, Gateway, Session, SessionConfig, SessionStore};
use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{self, Settings};
use crate::state_dir::StateDir;

#[derive(Subcommand)]
pub enum Commands {
    /// Manage the settings file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    #[command(flatten)]
    Session(SessionCommands),
}

/// Commands that run against the backend with the persisted session
#[derive(Subcommand)]
pub enum SessionCommands {
    /// Log in with codice fiscale and password
    Login {
        codice_fiscale: String,

        #[arg(long, env = "ANAGRAFE_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Create a new account
    Register {
        #[command(flatten)]
        profile: ProfileArgs,

        #[arg(long, env = "ANAGRAFE_PASSWORD", hide_env_values = true)]
        password: String,

        /// Log in right after registering
        #[arg(long)]
        login: bool,
    },

    /// End the session and revoke the refresh token
    Logout,

    /// Show session state
    Status,

    /// Show the logged-in user's profile
    Me,

    /// Manage users (ADMIN only)
    Users {
        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Args)]
pub struct ProfileArgs {
    #[arg(long)]
    nome: String,

    #[arg(long)]
    cognome: String,

    #[arg(long)]
    codice_fiscale: String,

    /// Date of birth, YYYY-MM-DD
    #[arg(long)]
    data_nascita: NaiveDate,
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// List all users
    List,

    /// Show one user
    Get { id: i64 },

    /// Search by name, surname or codice fiscale
    Search { query: String },

    /// Create a user
    Create {
        #[command(flatten)]
        profile: ProfileArgs,

        #[arg(long, default_value = "UTENTE")]
        ruolo: Role,

        /// Initial password; the backend assigns one when omitted
        #[arg(long)]
        password: Option<String>,
    },

    /// Update a user's profile and role
    Update {
        id: i64,

        #[arg(long)]
        nome: String,

        #[arg(long)]
        cognome: String,

        #[arg(long)]
        data_nascita: NaiveDate,

        #[arg(long)]
        ruolo: Role,
    },

    /// Delete a user
    Delete { id: i64 },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Write a settings file with default values
    Init {
        /// Output file path (defaults to the platform config directory)
        output: Option<PathBuf>,
    },
}

impl ConfigCommands {
    pub fn execute(self, state_dir: &StateDir) -> Result<()> {
        match self {
            Self::Init { output } => {
                let path = output.unwrap_or_else(|| state_dir.config_path());
                config::generate_default_config(&path)?;
                println!("Generated configuration at: {}", path.display());
                Ok(())
            }
        }
    }
}

/// Client pieces shared by the session commands
pub struct App {
    gateway: Gateway,
}

impl App {
    /// Build the client stack and reconcile the persisted session
    pub async fn open(settings: &Settings, state_dir: &StateDir) -> Result<Self> {
        let api = ApiClient::builder()
            .base_url(&settings.api_base_url)
            .timeout(settings.timeout())
            .build()
            .context("Failed to build API client")?;

        let session_path = state_dir.session_path();
        let tokens = FileTokenStore::open(&session_path)
            .with_context(|| format!("Failed to open {}", session_path.display()))?;

        let session = SessionStore::new(
            Arc::new(api.clone()),
            Arc::new(tokens),
            SessionConfig {
                refresh_lead: settings.refresh_lead(),
            },
        );
        session.start().await;
        debug!(api = %api.base_url(), "session ready");

        Ok(Self::from_gateway(Gateway::new(api, session)))
    }

    pub fn from_gateway(gateway: Gateway) -> Self {
        Self { gateway }
    }

    pub fn session(&self) -> &SessionStore {
        self.gateway.session()
    }

    pub fn shutdown(&self) {
        self.session().shutdown();
    }

    /// Fails unless a valid session exists
    fn require_login(&self) -> Result<()> {
        if !self.session().is_logged_in() {
            bail!("Not logged in. Run `anagrafe login` first.");
        }
        Ok(())
    }

    /// Fails unless the session holds one of `allowed`
    fn require_role(&self, allowed: &[Role]) -> Result<()> {
        self.require_login()?;
        if !self.session().has_role(allowed) {
            bail!("Access denied: this command is reserved to administrators.");
        }
        Ok(())
    }
}

/// Who a fresh session belongs to; fails when the store did not keep it
fn signed_in_as(store: &SessionStore, session: &Session) -> Result<String> {
    if !store.is_logged_in() {
        bail!("The server issued an access token that is already about to expire. Not logged in.");
    }
    Ok(format!(
        "{} ({})",
        session.codice_fiscale.as_deref().unwrap_or("-"),
        session.role
    ))
}

/// Wait for the background logout call; reports whether the task completed
async fn await_revocation(pending: JoinHandle<()>) -> bool {
    match pending.await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "server-side logout task did not complete");
            false
        }
    }
}

impl SessionCommands {
    pub async fn execute(self, app: &App) -> Result<()> {
        match self {
            Self::Login {
                codice_fiscale,
                password,
            } => {
                let session = app
                    .session()
                    .login(&LoginRequest {
                        codice_fiscale,
                        password,
                    })
                    .await?;
                println!("Logged in as {}", signed_in_as(app.session(), &session)?);
                Ok(())
            }
            Self::Register {
                profile,
                password,
                login,
            } => {
                let registration = profile.into_registration(password);
                if login {
                    let session = app.session().register_and_login(&registration).await?;
                    println!(
                        "Registered and logged in as {}",
                        signed_in_as(app.session(), &session)?
                    );
                } else {
                    let user = app.session().register(&registration).await?;
                    println!("Registered user #{}. Run `anagrafe login` to sign in.", user.id);
                }
                Ok(())
            }
            Self::Logout => {
                if let Some(pending) = app.session().logout() {
                    // let the server-side revocation finish before exiting
                    await_revocation(pending).await;
                }
                println!("Logged out");
                Ok(())
            }
            Self::Status => {
                print_status(app.session());
                Ok(())
            }
            Self::Me => {
                app.require_login()?;
                let user = app.gateway.me().await?;
                print_user(&user);
                Ok(())
            }
            Self::Users { command } => {
                app.require_role(&[Role::Admin])?;
                command.execute(&app.gateway).await
            }
        }
    }
}

impl UserCommands {
    async fn execute(self, gateway: &Gateway) -> Result<()> {
        match self {
            Self::List => print_users(&gateway.list_users().await?),
            Self::Get { id } => print_user(&gateway.get_user(id).await?),
            Self::Search { query } => print_users(&gateway.search_users(&query).await?),
            Self::Create {
                profile,
                ruolo,
                password,
            } => {
                let user = gateway
                    .create_user(&UserRequest {
                        nome: profile.nome,
                        cognome: profile.cognome,
                        codice_fiscale: profile.codice_fiscale,
                        data_nascita: profile.data_nascita,
                        ruolo,
                        password,
                    })
                    .await?;
                info!(user_id = user.id, "user created");
                print_user(&user);
            }
            Self::Update {
                id,
                nome,
                cognome,
                data_nascita,
                ruolo,
            } => {
                let user = gateway
                    .update_user(
                        id,
                        &UserUpdateRequest {
                            nome,
                            cognome,
                            data_nascita,
                            ruolo,
                        },
                    )
                    .await?;
                print_user(&user);
            }
            Self::Delete { id } => {
                gateway.delete_user(id).await?;
                println!("Deleted user #{id}");
            }
        }
        Ok(())
    }
}

impl ProfileArgs {
    fn into_registration(self, password: String) -> RegistrationRequest {
        RegistrationRequest {
            nome: self.nome,
            cognome: self.cognome,
            codice_fiscale: self.codice_fiscale,
            data_nascita: self.data_nascita,
            password,
        }
    }
}

fn print_status(session: &SessionStore) {
    let status = session.status();
    println!("Logged in:    {}", if status.authenticated { "yes" } else { "no" });
    println!(
        "Role:         {}",
        status.role.map_or_else(|| "-".to_string(), |role| role.to_string())
    );

    if let Some(expires_at) = session.expires_at() {
        let remaining = expires_at.signed_duration_since(Utc::now());
        if remaining.num_seconds() > 0 {
            println!(
                "Expires:      {} (in {} min)",
                expires_at.to_rfc3339(),
                remaining.num_minutes()
            );
        } else {
            println!("Expires:      {} (expired)", expires_at.to_rfc3339());
        }
    }

    if let Some(next) = session.next_refresh_in() {
        println!("Next refresh: in {} min", next.as_secs() / 60);
    }
}

fn print_user(user: &UserResponse) {
    println!(
        "#{:<5} {} {}  {}  {}  {}",
        user.id,
        user.nome,
        user.cognome,
        user.codice_fiscale.as_deref().unwrap_or("-"),
        user.data_nascita,
        user.ruolo
    );
}

fn print_users(users: &[UserResponse]) {
    if users.is_empty() {
        println!("No users found");
        return;
    }
    for user in users {
        print_user(user);
    }
}
