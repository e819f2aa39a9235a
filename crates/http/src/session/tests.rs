use super::storage::MemoryTokenStore;
use super::*;
use chrono::NaiveDate;
use jsonwebtoken::{EncodingKey, Header, encode};
use mockall::mock;
use mockall::predicate::eq;
use reqwest::StatusCode;
use serde::Serialize;
use std::sync::atomic::AtomicUsize;

const CODICE_FISCALE: &str = "RSSMRA80A01H501U";

mock! {
    pub Backend {}

    #[async_trait]
    impl AuthBackend for Backend {
        async fn login(&self, credentials: &LoginRequest) -> Result<AuthResponse, ClientError>;
        async fn register(
            &self,
            profile: &RegistrationRequest,
        ) -> Result<UserResponse, ClientError>;
        async fn refresh(&self, refresh_token: &str) -> Result<AuthResponse, ClientError>;
        async fn logout(&self, refresh_token: &str) -> Result<(), ClientError>;
    }
}

#[derive(Serialize)]
struct TestClaims {
    sub: String,
    exp: i64,
    iat: i64,
}

fn token_expiring_in(secs: i64) -> String {
    let now = Utc::now().timestamp();
    let claims = TestClaims {
        sub: CODICE_FISCALE.to_string(),
        exp: now + secs,
        iat: now,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(b"test-secret")).unwrap()
}

fn auth_response(access_token: String, refresh_token: &str, role: Role) -> AuthResponse {
    AuthResponse {
        access_token,
        refresh_token: refresh_token.to_string(),
        codice_fiscale: CODICE_FISCALE.to_string(),
        ruolo: role,
    }
}

fn credentials() -> LoginRequest {
    LoginRequest {
        codice_fiscale: CODICE_FISCALE.to_string(),
        password: "Password1!".to_string(),
    }
}

fn unauthorized() -> ClientError {
    ClientError::from_status(StatusCode::UNAUTHORIZED, "")
}

fn store_with(
    backend: impl AuthBackend,
    tokens: StoredTokens,
) -> (SessionStore, Arc<MemoryTokenStore>) {
    let memory = Arc::new(MemoryTokenStore::with_tokens(tokens));
    let store = SessionStore::new(Arc::new(backend), memory.clone(), SessionConfig::default());
    (store, memory)
}

fn persisted(access_token: String, refresh_token: Option<&str>) -> StoredTokens {
    StoredTokens {
        access_token: Some(access_token),
        refresh_token: refresh_token.map(str::to_string),
        role: Some(Role::Utente),
    }
}

/// Backend whose refresh takes a while, so concurrent callers overlap
struct SlowBackend {
    refresh_calls: AtomicUsize,
    fail: bool,
}

impl SlowBackend {
    fn new(fail: bool) -> Self {
        Self {
            refresh_calls: AtomicUsize::new(0),
            fail,
        }
    }
}

#[async_trait]
impl AuthBackend for SlowBackend {
    async fn login(&self, _: &LoginRequest) -> Result<AuthResponse, ClientError> {
        Ok(auth_response(token_expiring_in(3600), "refresh-login", Role::Admin))
    }

    async fn register(&self, _: &RegistrationRequest) -> Result<UserResponse, ClientError> {
        unimplemented!()
    }

    async fn refresh(&self, _: &str) -> Result<AuthResponse, ClientError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        if self.fail {
            Err(unauthorized())
        } else {
            Ok(auth_response(token_expiring_in(3600), "refresh-2", Role::Utente))
        }
    }

    async fn logout(&self, _: &str) -> Result<(), ClientError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn login_stores_tokens_and_schedules_refresh() {
    let mut backend = MockBackend::new();
    let access = token_expiring_in(3600);
    let issued = access.clone();
    backend
        .expect_login()
        .times(1)
        .returning(move |_| Ok(auth_response(issued.clone(), "refresh-1", Role::Admin)));

    let (store, memory) = store_with(backend, StoredTokens::default());
    let mut status = store.subscribe();

    let session = store.login(&credentials()).await.unwrap();

    assert_eq!(session.role, Role::Admin);
    assert_eq!(
        memory.snapshot(),
        StoredTokens {
            access_token: Some(access),
            refresh_token: Some("refresh-1".to_string()),
            role: Some(Role::Admin),
        }
    );
    assert!(store.is_logged_in());
    assert!(store.is_admin());

    assert!(status.has_changed().unwrap());
    assert_eq!(
        *status.borrow_and_update(),
        AuthStatus {
            authenticated: true,
            role: Some(Role::Admin),
        }
    );

    // 60 minute token with a 5 minute lead
    let next = store.next_refresh_in().unwrap();
    assert!(next > Duration::from_secs(3290) && next <= Duration::from_secs(3300));
}

#[tokio::test]
async fn failed_login_leaves_state_untouched() {
    let mut backend = MockBackend::new();
    backend.expect_login().returning(|_| Err(unauthorized()));

    let (store, memory) = store_with(backend, StoredTokens::default());

    let err = store.login(&credentials()).await.unwrap_err();

    assert!(err.requires_login());
    assert!(memory.snapshot().is_empty());
    assert_eq!(store.status(), AuthStatus::default());
    assert!(store.next_refresh_in().is_none());
}

#[tokio::test]
async fn register_and_login_logs_in_with_same_credentials() {
    let mut backend = MockBackend::new();
    backend.expect_register().times(1).returning(|profile| {
        Ok(UserResponse {
            id: 7,
            nome: profile.nome.clone(),
            cognome: profile.cognome.clone(),
            data_nascita: profile.data_nascita,
            ruolo: Role::Utente,
            codice_fiscale: Some(profile.codice_fiscale.clone()),
        })
    });
    backend
        .expect_login()
        .withf(|credentials| {
            credentials.codice_fiscale == CODICE_FISCALE && credentials.password == "Password1!"
        })
        .times(1)
        .returning(|_| Ok(auth_response(token_expiring_in(3600), "refresh-1", Role::Utente)));

    let (store, _) = store_with(backend, StoredTokens::default());
    let profile = RegistrationRequest {
        nome: "Mario".to_string(),
        cognome: "Rossi".to_string(),
        codice_fiscale: CODICE_FISCALE.to_string(),
        data_nascita: NaiveDate::from_ymd_opt(1980, 1, 1).unwrap(),
        password: "Password1!".to_string(),
    };

    let session = store.register_and_login(&profile).await.unwrap();

    assert_eq!(session.role, Role::Utente);
    assert!(store.has_role(&[Role::Utente]));
    assert!(!store.has_role(&[Role::Admin]));
}

#[tokio::test]
async fn failed_refresh_clears_session() {
    let mut backend = MockBackend::new();
    backend
        .expect_refresh()
        .with(eq("refresh-1"))
        .times(1)
        .returning(|_| Err(unauthorized()));

    let (store, memory) =
        store_with(backend, persisted(token_expiring_in(3600), Some("refresh-1")));

    let err = store.refresh_current().await.unwrap_err();

    assert!(matches!(err, ClientError::RefreshFailed(_)));
    assert_eq!(err.status(), Some(401));
    assert!(memory.snapshot().is_empty());
    assert!(!store.status().authenticated);
}

#[tokio::test]
async fn refresh_without_refresh_token_is_rejected() {
    let (store, _) = store_with(MockBackend::new(), StoredTokens::default());

    let err = store.refresh_current().await.unwrap_err();
    assert!(matches!(err, ClientError::NoRefreshToken));
}

#[tokio::test(start_paused = true)]
async fn concurrent_refreshes_share_one_backend_call() {
    let backend = Arc::new(SlowBackend::new(false));
    let memory = Arc::new(MemoryTokenStore::with_tokens(persisted(
        token_expiring_in(3600),
        Some("refresh-1"),
    )));
    let store = SessionStore::new(backend.clone(), memory.clone(), SessionConfig::default());

    let results = futures::future::join_all((0..5).map(|_| store.refresh_current())).await;

    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
    let tokens: Vec<_> = results
        .into_iter()
        .map(|result| result.unwrap().refresh_token)
        .collect();
    assert!(tokens.iter().all(|token| token == "refresh-2"));
    assert_eq!(memory.snapshot().refresh_token.as_deref(), Some("refresh-2"));

    // The slot is released once the flight lands
    store.refresh_current().await.unwrap();
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_refresh_failure_reaches_every_caller() {
    let backend = Arc::new(SlowBackend::new(true));
    let memory = Arc::new(MemoryTokenStore::with_tokens(persisted(
        token_expiring_in(3600),
        Some("refresh-1"),
    )));
    let store = SessionStore::new(backend.clone(), memory.clone(), SessionConfig::default());

    let results = futures::future::join_all((0..3).map(|_| store.refresh("refresh-1"))).await;

    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|result| {
        matches!(result, Err(err) if err.requires_login())
    }));
    assert!(memory.snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn logout_during_refresh_discards_the_result() {
    let backend = Arc::new(SlowBackend::new(false));
    let memory = Arc::new(MemoryTokenStore::with_tokens(persisted(
        token_expiring_in(3600),
        Some("refresh-1"),
    )));
    let store = SessionStore::new(backend.clone(), memory.clone(), SessionConfig::default());

    let refreshing = tokio::spawn({
        let store = store.clone();
        async move { store.refresh_current().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    store.logout().unwrap().await.unwrap();
    assert!(memory.snapshot().is_empty());

    let err = refreshing.await.unwrap().unwrap_err();
    assert!(matches!(&err, ClientError::RefreshFailed(cause)
        if matches!(**cause, ClientError::SessionClosed)));
    assert!(err.requires_login());

    // The late answer must not bring the session back
    assert!(memory.snapshot().is_empty());
    assert!(!store.is_logged_in());
    assert!(store.next_refresh_in().is_none());
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_refresh_failure_keeps_new_login() {
    let backend = Arc::new(SlowBackend::new(true));
    let memory = Arc::new(MemoryTokenStore::with_tokens(persisted(
        token_expiring_in(3600),
        Some("refresh-1"),
    )));
    let store = SessionStore::new(backend.clone(), memory.clone(), SessionConfig::default());

    let refreshing = tokio::spawn({
        let store = store.clone();
        async move { store.refresh("refresh-1").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    store.logout().unwrap().await.unwrap();
    store.login(&credentials()).await.unwrap();

    let err = refreshing.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::RefreshFailed(_)));

    let stored = memory.snapshot();
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-login"));
    assert_eq!(stored.role, Some(Role::Admin));
    assert!(store.is_logged_in());
    assert!(store.next_refresh_in().is_some());
}

#[tokio::test]
async fn logout_clears_locally_even_when_backend_fails() {
    let mut backend = MockBackend::new();
    backend
        .expect_logout()
        .with(eq("refresh-1"))
        .times(1)
        .returning(|_| Err(ClientError::from_status(StatusCode::INTERNAL_SERVER_ERROR, "")));

    let (store, memory) = store_with(
        backend,
        persisted(token_expiring_in(3600), Some("refresh-1")),
    );

    let handle = store.logout();

    // Cleared before the server call completes
    assert!(memory.snapshot().is_empty());
    assert!(!store.status().authenticated);
    assert!(store.status().role.is_none());

    handle.unwrap().await.unwrap();
    assert!(memory.snapshot().is_empty());
}

#[tokio::test]
async fn logout_without_refresh_token_skips_backend() {
    let (store, memory) = store_with(
        MockBackend::new(),
        persisted(token_expiring_in(3600), None),
    );

    assert!(store.logout().is_none());
    assert!(memory.snapshot().is_empty());
}

#[tokio::test]
async fn token_inside_refresh_lead_logs_out() {
    let mut backend = MockBackend::new();
    backend
        .expect_login()
        .returning(|_| Ok(auth_response(token_expiring_in(10), "refresh-1", Role::Utente)));
    backend.expect_logout().returning(|_| Ok(()));

    let (store, memory) = store_with(backend, StoredTokens::default());

    store.login(&credentials()).await.unwrap();

    assert!(memory.snapshot().is_empty());
    assert!(!store.status().authenticated);
    assert!(store.next_refresh_in().is_none());

    // let the background logout run
    tokio::task::yield_now().await;
}

#[tokio::test(start_paused = true)]
async fn scheduled_refresh_fires_before_expiry() {
    let mut backend = MockBackend::new();
    backend
        .expect_login()
        .returning(|_| Ok(auth_response(token_expiring_in(3600), "refresh-1", Role::Utente)));
    backend
        .expect_refresh()
        .with(eq("refresh-1"))
        .times(1)
        .returning(|_| Ok(auth_response(token_expiring_in(3600), "refresh-2", Role::Utente)));

    let (store, memory) = store_with(backend, StoredTokens::default());
    store.login(&credentials()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(3290)).await;
    assert_eq!(memory.snapshot().refresh_token.as_deref(), Some("refresh-1"));

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(memory.snapshot().refresh_token.as_deref(), Some("refresh-2"));
    assert!(store.next_refresh_in().is_some());

    store.shutdown();
    assert!(store.next_refresh_in().is_none());
}

#[tokio::test]
async fn startup_without_tokens_is_logged_out() {
    let (store, _) = store_with(MockBackend::new(), StoredTokens::default());

    store.start().await;

    assert_eq!(store.status(), AuthStatus::default());
}

#[tokio::test]
async fn startup_with_valid_token_schedules_refresh() {
    let (store, memory) = store_with(
        MockBackend::new(),
        persisted(token_expiring_in(3600), Some("refresh-1")),
    );

    store.start().await;

    assert!(store.status().authenticated);
    assert!(store.next_refresh_in().is_some());
    assert!(memory.snapshot().access_token.is_some());
}

#[tokio::test]
async fn startup_with_expired_token_refreshes() {
    let mut backend = MockBackend::new();
    backend
        .expect_refresh()
        .with(eq("refresh-1"))
        .times(1)
        .returning(|_| Ok(auth_response(token_expiring_in(3600), "refresh-2", Role::Utente)));

    let (store, memory) = store_with(
        backend,
        persisted(token_expiring_in(-60), Some("refresh-1")),
    );
    assert!(!store.status().authenticated);

    store.start().await;

    assert!(store.status().authenticated);
    assert_eq!(memory.snapshot().refresh_token.as_deref(), Some("refresh-2"));
}

#[tokio::test]
async fn startup_with_expired_token_and_failed_refresh_logs_out() {
    let mut backend = MockBackend::new();
    backend.expect_refresh().returning(|_| Err(unauthorized()));

    let (store, memory) = store_with(
        backend,
        persisted(token_expiring_in(-60), Some("refresh-1")),
    );

    store.start().await;

    assert!(memory.snapshot().is_empty());
    assert!(!store.status().authenticated);
}

#[tokio::test]
async fn startup_with_expired_token_and_no_refresh_token_clears() {
    let (store, memory) = store_with(
        MockBackend::new(),
        persisted(token_expiring_in(-60), None),
    );

    store.start().await;

    assert!(memory.snapshot().is_empty());
}

#[tokio::test]
async fn malformed_token_is_kept_but_never_scheduled() {
    let (store, memory) = store_with(
        MockBackend::new(),
        persisted("not-a-jwt".to_string(), Some("refresh-1")),
    );

    store.start().await;

    assert!(store.next_refresh_in().is_none());
    assert!(!store.has_valid_token());
    assert_eq!(memory.snapshot().access_token.as_deref(), Some("not-a-jwt"));
}

#[test]
fn session_debug_hides_tokens() {
    let session = Session::from(auth_response(
        "secret-access".to_string(),
        "secret-refresh",
        Role::Admin,
    ));

    let rendered = format!("{session:?}");
    assert!(!rendered.contains("secret"));
    assert!(rendered.contains("Admin"));
}
