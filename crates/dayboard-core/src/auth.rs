//! Email/password accounts gated by a one-time access key.
//!
//! Every account gets an access key at sign-up. The first sign-in must
//! present it; once that succeeds the email is marked validated and later
//! sign-ins need only the password.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{DocPath, DocumentBackend};
use crate::datastore::{load_json, remove_file_if_exists, save_json_atomic};
use crate::subscription::{Broadcast, Subscription};

pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uid: String,
    pub email: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication service not available. Enable the remote store (remote.enabled=on).")]
    Unavailable,
    #[error("Please enter a valid email address.")]
    InvalidEmail,
    #[error("Password should be at least 6 characters long.")]
    WeakPassword,
    #[error("This email is already registered. Please sign in instead.")]
    EmailInUse,
    #[error("No account found with this email. Please create an account first.")]
    UserNotFound,
    #[error("Incorrect password. Please try again.")]
    WrongPassword,
    #[error("Access not provisioned. Contact admin to enable access.")]
    NotProvisioned,
    #[error("Invalid access key. Please contact admin for the correct key.")]
    InvalidAccessKey,
    #[error("This email already has validated access. Sign in as that account to issue a new key.")]
    AlreadyValidated,
    #[error("authentication storage failed: {0}")]
    Backend(String),
}

impl AuthError {
    fn backend(err: anyhow::Error) -> Self {
        Self::Backend(format!("{err:#}"))
    }
}

/// Access-key bookkeeping for one email, stored at `accessKeys/<emailKey>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessRecord {
    pub key: String,
    pub email: String,
    pub uid: Option<String>,
    pub created_at: Option<i64>,
    pub validated: bool,
    pub once_logged: bool,
    pub validated_at: Option<i64>,
}

impl AccessRecord {
    pub fn is_validated(&self) -> bool {
        self.validated || self.once_logged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    NotProvisioned,
    KeyRequired,
    Validated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUp {
    pub user: User,
    /// `None` when the key could not be stored; the account still exists.
    pub access_key: Option<String>,
}

/// Lower-cased email with characters that are illegal in document paths
/// replaced by `_`.
pub fn email_key(email: &str) -> String {
    email
        .trim()
        .to_lowercase()
        .chars()
        .map(|ch| match ch {
            '.' | '#' | '$' | '[' | ']' | '/' => '_',
            other => other,
        })
        .collect()
}

/// 32 lowercase hex characters.
pub fn generate_access_key() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn validate_email(email: &str) -> Result<(), AuthError> {
    let email = email.trim();
    let Some((local, domain)) = email.split_once('@') else {
        return Err(AuthError::InvalidEmail);
    };
    let domain_ok = domain
        .split_once('.')
        .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty());
    if local.is_empty() || domain.contains('@') || !domain_ok || email.contains(char::is_whitespace)
    {
        return Err(AuthError::InvalidEmail);
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::WeakPassword);
    }
    Ok(())
}

/// The password side of authentication.
pub trait CredentialProvider: Send + Sync {
    fn create_account(&self, email: &str, password: &str) -> Result<User, AuthError>;

    fn verify(&self, email: &str, password: &str) -> Result<User, AuthError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Account {
    uid: String,
    email: String,
    salt: String,
    digest: String,
    #[serde(default)]
    created_at: Option<i64>,
}

/// Accounts kept in the document store under `accounts/<emailKey>` with
/// salted SHA-256 password digests.
pub struct LocalCredentials {
    backend: Arc<dyn DocumentBackend>,
}

impl LocalCredentials {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self { backend }
    }

    fn account_path(email: &str) -> Result<DocPath, AuthError> {
        DocPath::new(["accounts".to_string(), email_key(email)]).map_err(|_| AuthError::InvalidEmail)
    }

    fn load(&self, email: &str) -> Result<Option<Account>, AuthError> {
        let path = Self::account_path(email)?;
        let Some(value) = self.backend.get(&path).map_err(AuthError::backend)? else {
            return Ok(None);
        };
        match serde_json::from_value::<Account>(value) {
            Ok(account) => Ok(Some(account)),
            Err(err) => Err(AuthError::Backend(format!("corrupt account record: {err}"))),
        }
    }
}

impl CredentialProvider for LocalCredentials {
    #[tracing::instrument(skip(self, password))]
    fn create_account(&self, email: &str, password: &str) -> Result<User, AuthError> {
        validate_email(email)?;
        validate_password(password)?;
        if self.load(email)?.is_some() {
            return Err(AuthError::EmailInUse);
        }

        let salt = Uuid::new_v4().simple().to_string();
        let account = Account {
            uid: Uuid::new_v4().simple().to_string(),
            email: email.trim().to_lowercase(),
            digest: password_digest(&salt, password),
            salt,
            created_at: Some(Utc::now().timestamp_millis()),
        };
        let value = serde_json::to_value(&account).map_err(|err| AuthError::backend(err.into()))?;
        self.backend
            .set(&Self::account_path(email)?, value)
            .map_err(AuthError::backend)?;

        info!(uid = %account.uid, "created account");
        Ok(User {
            uid: account.uid,
            email: account.email,
        })
    }

    #[tracing::instrument(skip(self, password))]
    fn verify(&self, email: &str, password: &str) -> Result<User, AuthError> {
        validate_email(email)?;
        let account = self.load(email)?.ok_or(AuthError::UserNotFound)?;
        if password_digest(&account.salt, password) != account.digest {
            return Err(AuthError::WrongPassword);
        }
        Ok(User {
            uid: account.uid,
            email: account.email,
        })
    }
}

fn password_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct AuthService {
    backend: Option<Arc<dyn DocumentBackend>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    session_path: PathBuf,
    current: Mutex<Option<User>>,
    changes: Broadcast<Option<User>>,
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService")
            .field("available", &self.is_available())
            .field("session_path", &self.session_path)
            .field("current", &*self.current.lock())
            .finish()
    }
}

impl AuthService {
    /// Restores the last session from `session_path`, if any.
    #[tracing::instrument(skip(session_path))]
    pub fn new(session_path: &Path) -> anyhow::Result<Self> {
        let current = match load_json::<User>(session_path) {
            Ok(user) => user,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "ignoring unreadable session");
                None
            }
        };
        debug!(signed_in = current.is_some(), "restored session");
        Ok(Self {
            backend: None,
            credentials: None,
            session_path: session_path.to_path_buf(),
            current: Mutex::new(current),
            changes: Broadcast::new(),
        })
    }

    /// Uses `backend` for access keys, and for accounts unless another
    /// provider was set.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn DocumentBackend>) -> Self {
        if self.credentials.is_none() {
            self.credentials = Some(Arc::new(LocalCredentials::new(Arc::clone(&backend))));
        }
        self.backend = Some(backend);
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some() && self.credentials.is_some()
    }

    pub fn current_user(&self) -> Option<User> {
        self.current.lock().clone()
    }

    /// Delivers the current identity immediately, then every change.
    pub fn on_auth_change(&self) -> Subscription<Option<User>> {
        self.changes.subscribe(self.current_user())
    }

    /// Creates the account and issues its access key. The caller stays
    /// signed out; the key is needed for the first sign-in.
    #[tracing::instrument(skip(self, password))]
    pub fn sign_up(&self, email: &str, password: &str) -> Result<SignUp, AuthError> {
        let credentials = self.credentials()?;
        validate_email(email)?;
        validate_password(password)?;

        let user = credentials.create_account(email, password)?;
        let access_key = match self.issue_access_key(&user.email, Some(user.uid.as_str())) {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(error = %err, "account created but access key could not be stored");
                None
            }
        };

        if let Err(err) = self.sign_out() {
            warn!(error = %format!("{err:#}"), "failed to clear session after sign-up");
        }
        info!(uid = %user.uid, "signed up");
        Ok(SignUp { user, access_key })
    }

    #[tracing::instrument(skip(self, password, access_key))]
    pub fn sign_in(
        &self,
        email: &str,
        password: &str,
        access_key: Option<&str>,
    ) -> Result<User, AuthError> {
        let credentials = self.credentials()?;
        validate_email(email)?;

        let record = self.access_record(email)?;
        let validated = record.as_ref().is_some_and(AccessRecord::is_validated);
        if !validated {
            let expected = record
                .as_ref()
                .map(|record| record.key.as_str())
                .filter(|key| !key.is_empty())
                .ok_or(AuthError::NotProvisioned)?;
            let presented = access_key.map(str::trim).unwrap_or_default();
            if presented.is_empty() || presented != expected {
                warn!("access key rejected");
                return Err(AuthError::InvalidAccessKey);
            }
        }

        let user = credentials.verify(email, password)?;

        if !validated && let Some(record) = record {
            if let Err(err) = self.mark_validated(email, record, &user.uid) {
                warn!(error = %err, "could not record access validation");
            }
        }

        self.set_current(Some(user.clone()))
            .map_err(AuthError::backend)?;
        info!(uid = %user.uid, first_login = !validated, "signed in");
        Ok(user)
    }

    #[tracing::instrument(skip(self))]
    pub fn sign_out(&self) -> anyhow::Result<()> {
        if self.current_user().is_none() {
            return Ok(());
        }
        self.set_current(None)?;
        info!("signed out");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub fn access_status(&self, email: &str) -> Result<AccessStatus, AuthError> {
        self.access_backend()?;
        validate_email(email)?;
        Ok(match self.access_record(email)? {
            None => AccessStatus::NotProvisioned,
            Some(record) if record.is_validated() => AccessStatus::Validated,
            Some(record) if record.key.is_empty() => AccessStatus::NotProvisioned,
            Some(_) => AccessStatus::KeyRequired,
        })
    }

    /// Stores a fresh key for `email`, resetting its validation.
    #[tracing::instrument(skip(self))]
    pub fn issue_access_key(&self, email: &str, uid: Option<&str>) -> Result<String, AuthError> {
        let backend = self.access_backend()?;
        let key = generate_access_key();
        let record = AccessRecord {
            key: key.clone(),
            email: email.trim().to_lowercase(),
            uid: uid.map(str::to_string),
            created_at: Some(Utc::now().timestamp_millis()),
            validated: false,
            once_logged: false,
            validated_at: None,
        };
        let value = serde_json::to_value(&record).map_err(|err| AuthError::backend(err.into()))?;
        backend
            .set(&access_path(email)?, value)
            .map_err(AuthError::backend)?;
        debug!("issued access key");
        Ok(key)
    }

    /// Issues a replacement key for `email`, keeping any recorded uid.
    /// Emails that never completed a keyed sign-in can be re-provisioned by
    /// anyone; a validated email only by its own signed-in account, since
    /// the new key resets validation.
    #[tracing::instrument(skip(self))]
    pub fn reissue_access_key(&self, email: &str) -> Result<String, AuthError> {
        validate_email(email)?;
        let record = self.access_record(email)?;
        if record.as_ref().is_some_and(AccessRecord::is_validated) {
            let own = self
                .current_user()
                .is_some_and(|user| email_key(&user.email) == email_key(email));
            if !own {
                warn!("refusing to reset validated access");
                return Err(AuthError::AlreadyValidated);
            }
        }
        let uid = record.and_then(|record| record.uid);
        self.issue_access_key(email, uid.as_deref())
    }

    pub fn access_record(&self, email: &str) -> Result<Option<AccessRecord>, AuthError> {
        let backend = self.access_backend()?;
        let Some(value) = backend.get(&access_path(email)?).map_err(AuthError::backend)? else {
            return Ok(None);
        };
        match serde_json::from_value::<AccessRecord>(value) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(error = %err, "unreadable access record; treating as missing");
                Ok(None)
            }
        }
    }

    fn mark_validated(&self, email: &str, mut record: AccessRecord, uid: &str) -> Result<(), AuthError> {
        let backend = self.access_backend()?;
        record.validated = true;
        record.once_logged = true;
        record.validated_at = Some(Utc::now().timestamp_millis());
        record.uid = Some(uid.to_string());
        let value = serde_json::to_value(&record).map_err(|err| AuthError::backend(err.into()))?;
        backend
            .set(&access_path(email)?, value)
            .map_err(AuthError::backend)
    }

    fn set_current(&self, user: Option<User>) -> anyhow::Result<()> {
        match &user {
            Some(user) => save_json_atomic(&self.session_path, user)?,
            None => remove_file_if_exists(&self.session_path)?,
        }
        let changed = {
            let mut current = self.current.lock();
            let changed = *current != user;
            *current = user.clone();
            changed
        };
        if changed {
            self.changes.publish(&user);
        }
        Ok(())
    }

    fn credentials(&self) -> Result<&Arc<dyn CredentialProvider>, AuthError> {
        self.credentials.as_ref().ok_or(AuthError::Unavailable)
    }

    fn access_backend(&self) -> Result<&Arc<dyn DocumentBackend>, AuthError> {
        self.backend.as_ref().ok_or(AuthError::Unavailable)
    }
}

fn access_path(email: &str) -> Result<DocPath, AuthError> {
    DocPath::new(["accessKeys".to_string(), email_key(email)]).map_err(|_| AuthError::InvalidEmail)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        AccessStatus, AuthError, AuthService, User, email_key, generate_access_key,
        validate_email,
    };
    use crate::backend::MemoryBackend;

    fn service(dir: &std::path::Path, backend: &Arc<MemoryBackend>) -> AuthService {
        AuthService::new(&dir.join("session.json"))
            .expect("auth service")
            .with_backend(backend.clone())
    }

    #[test]
    fn email_keys_are_path_safe() {
        assert_eq!(email_key("John.Doe@Example.com"), "john_doe@example_com");
        assert_eq!(email_key("a#b$c[d]e/f@x.io"), "a_b_c_d_e_f@x_io");
    }

    #[test]
    fn access_keys_are_32_hex_chars() {
        let key = generate_access_key();
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));
        assert_ne!(key, generate_access_key());
    }

    #[test]
    fn email_validation() {
        assert!(validate_email("a@b.co").is_ok());
        assert!(validate_email("nobody").is_err());
        assert!(validate_email("x@localhost").is_err());
        assert!(validate_email("a b@c.de").is_err());
    }

    #[test]
    fn first_login_needs_key_then_never_again() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(MemoryBackend::new());
        let auth = service(dir.path(), &backend);

        let signup = auth.sign_up("a@x.com", "secret1").expect("sign up");
        assert!(auth.current_user().is_none());
        let key = signup.access_key.expect("key issued");
        assert_eq!(auth.access_status("a@x.com").expect("status"), AccessStatus::KeyRequired);

        assert!(matches!(
            auth.sign_in("a@x.com", "secret1", None),
            Err(AuthError::InvalidAccessKey)
        ));
        assert!(matches!(
            auth.sign_in("a@x.com", "secret1", Some("wrong")),
            Err(AuthError::InvalidAccessKey)
        ));

        let user = auth
            .sign_in("a@x.com", "secret1", Some(key.as_str()))
            .expect("first login");
        assert_eq!(auth.current_user(), Some(user.clone()));

        let record = auth
            .access_record("a@x.com")
            .expect("read")
            .expect("record exists");
        assert!(record.validated && record.once_logged);
        assert_eq!(record.uid.as_deref(), Some(user.uid.as_str()));
        assert!(record.validated_at.is_some());

        auth.sign_out().expect("sign out");
        let again = auth.sign_in("A@X.com", "secret1", None).expect("no key needed");
        assert_eq!(again.uid, user.uid);
    }

    #[test]
    fn failures_map_to_taxonomy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(MemoryBackend::new());
        let auth = service(dir.path(), &backend);

        assert!(matches!(auth.sign_up("bad", "secret1"), Err(AuthError::InvalidEmail)));
        assert!(matches!(auth.sign_up("a@x.com", "123"), Err(AuthError::WeakPassword)));
        let key = auth
            .sign_up("a@x.com", "secret1")
            .expect("sign up")
            .access_key
            .expect("key");
        assert!(matches!(auth.sign_up("a@x.com", "secret2"), Err(AuthError::EmailInUse)));
        assert!(matches!(
            auth.sign_in("ghost@x.com", "secret1", Some("k")),
            Err(AuthError::NotProvisioned)
        ));
        assert!(matches!(
            auth.sign_in("a@x.com", "nope-nope", Some(key.as_str())),
            Err(AuthError::WrongPassword)
        ));
        // A rejected password does not consume the key.
        assert_eq!(auth.access_status("a@x.com").expect("status"), AccessStatus::KeyRequired);
        assert_eq!(
            AuthError::NotProvisioned.to_string(),
            "Access not provisioned. Contact admin to enable access."
        );
    }

    #[test]
    fn validated_access_is_reset_only_by_its_owner() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(MemoryBackend::new());
        let auth = service(dir.path(), &backend);

        let first = auth
            .sign_up("a@x.com", "secret1")
            .expect("sign up")
            .access_key
            .expect("key");
        // Pending accounts can get a replacement key; the old one stops working.
        let second = auth.reissue_access_key("a@x.com").expect("reissue pending");
        assert_ne!(first, second);
        assert!(matches!(
            auth.sign_in("a@x.com", "secret1", Some(first.as_str())),
            Err(AuthError::InvalidAccessKey)
        ));
        let user = auth
            .sign_in("a@x.com", "secret1", Some(second.as_str()))
            .expect("sign in");
        auth.sign_out().expect("sign out");

        assert!(matches!(
            auth.reissue_access_key("A@x.com"),
            Err(AuthError::AlreadyValidated)
        ));
        assert_eq!(auth.access_status("a@x.com").expect("status"), AccessStatus::Validated);

        auth.sign_in("a@x.com", "secret1", None).expect("sign in again");
        auth.reissue_access_key("a@x.com").expect("owner rotates key");
        let record = auth
            .access_record("a@x.com")
            .expect("read")
            .expect("record");
        assert!(!record.is_validated());
        assert_eq!(record.uid.as_deref(), Some(user.uid.as_str()));
    }

    #[test]
    fn offline_auth_is_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let auth = AuthService::new(&dir.path().join("session.json")).expect("auth service");
        assert!(matches!(auth.sign_up("a@x.com", "secret1"), Err(AuthError::Unavailable)));
        assert!(matches!(
            auth.sign_in("a@x.com", "secret1", Some("k")),
            Err(AuthError::Unavailable)
        ));
        assert!(auth.current_user().is_none());
    }

    #[test]
    fn auth_changes_are_observable_and_session_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(MemoryBackend::new());
        let auth = service(dir.path(), &backend);
        let mut changes = auth.on_auth_change();
        assert_eq!(changes.try_recv(), Some(None));

        let key = auth
            .sign_up("a@x.com", "secret1")
            .expect("sign up")
            .access_key
            .expect("key");
        let user = auth.sign_in("a@x.com", "secret1", Some(key.as_str())).expect("sign in");
        assert_eq!(changes.try_recv(), Some(Some(user.clone())));

        let restored = service(dir.path(), &backend);
        assert_eq!(restored.current_user(), Some(user));

        auth.sign_out().expect("sign out");
        assert_eq!(changes.try_recv(), Some(None::<User>));
        assert!(service(dir.path(), &backend).current_user().is_none());
    }
}
