//! Bearer-token gate in front of every RPC.
//!
//! A [`TokenProvider`] supplies the token clients must present. When the
//! provider has nothing ([`AuthError::NotFound`]) the server runs open.

use std::path::PathBuf;
use std::sync::Arc;

use subtle::ConstantTimeEq;
use thiserror::Error;
use tonic::service::Interceptor;
use tonic::{Request, Status};
use tracing::warn;

pub const TOKEN_ENV: &str = "RUNNER_API_TOKEN";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credential available")]
    NotFound,
    #[error("failed to read credential from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid credential: {0}")]
    Invalid(String),
}

/// True when the failure only means nobody has logged in yet.
pub fn recoverable_with_login(err: &AuthError) -> bool {
    matches!(err, AuthError::NotFound)
}

pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<String, AuthError>;
}

/// Provider that never has a token.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoToken;

impl TokenProvider for NoToken {
    fn token(&self) -> Result<String, AuthError> {
        Err(AuthError::NotFound)
    }
}

/// Token stored in a file, surrounding whitespace ignored.
#[derive(Debug, Clone)]
pub struct FileTokenProvider {
    path: PathBuf,
}

impl FileTokenProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenProvider for FileTokenProvider {
    fn token(&self) -> Result<String, AuthError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(AuthError::NotFound),
            Err(source) => {
                return Err(AuthError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let token = raw.trim();
        if token.is_empty() {
            return Err(AuthError::NotFound);
        }
        validate(token)?;
        Ok(token.to_string())
    }
}

/// Prefers a token from the environment over the wrapped provider.
pub struct EnvTokenProvider<P> {
    var: String,
    inner: P,
}

impl<P: TokenProvider> EnvTokenProvider<P> {
    pub fn new(inner: P) -> Self {
        Self::with_var(TOKEN_ENV, inner)
    }

    pub fn with_var(var: impl Into<String>, inner: P) -> Self {
        Self {
            var: var.into(),
            inner,
        }
    }
}

impl<P: TokenProvider> TokenProvider for EnvTokenProvider<P> {
    fn token(&self) -> Result<String, AuthError> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => {
                let token = token.trim();
                validate(token)?;
                Ok(token.to_string())
            }
            _ => self.inner.token(),
        }
    }
}

fn validate(token: &str) -> Result<(), AuthError> {
    if token.bytes().all(|b| b.is_ascii_graphic()) {
        Ok(())
    } else {
        Err(AuthError::Invalid(
            "token must be printable ASCII without spaces".to_string(),
        ))
    }
}

/// Checks `authorization: Bearer <token>` on incoming requests.
#[derive(Clone, Default)]
pub struct BearerAuth {
    expected: Option<Arc<str>>,
}

impl BearerAuth {
    /// Token from `provider`; a missing token disables the check.
    pub fn from_provider(provider: &dyn TokenProvider) -> Result<Self, AuthError> {
        match provider.token() {
            Ok(token) => Ok(Self {
                expected: Some(token.into()),
            }),
            Err(err) if recoverable_with_login(&err) => {
                warn!("no API token configured, serving without authentication");
                Ok(Self::default())
            }
            Err(err) => Err(err),
        }
    }

    pub fn is_enforced(&self) -> bool {
        self.expected.is_some()
    }
}

impl Interceptor for BearerAuth {
    fn call(&mut self, req: Request<()>) -> Result<Request<()>, Status> {
        let Some(expected) = &self.expected else {
            return Ok(req);
        };
        let presented = req
            .metadata()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match presented {
            Some(token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => Ok(req),
            Some(_) => Err(Status::unauthenticated("invalid bearer token")),
            None => Err(Status::unauthenticated("missing bearer token")),
        }
    }
}
