//! Caller layer for the allowlist operations
//!
//! Authenticates the caller, checks the `dbdirect` feature, then hands the
//! request to the [`AllowlistManager`] and maps the outcome to a status and a
//! JSON body. Nothing reaches the manager for a 401 or 403.

use crate::core::error::Error;
use crate::core::identity::{Directory, Principal};
use crate::core::manager::AllowlistManager;
use crate::core::store::AllowlistStore;
use crate::core::sync::FirewallSync;
use serde_json::{Value, json};
use strum::{AsRefStr, Display};
use tracing::{debug, warn};

/// Feature that guards every allowlist operation
pub const FEATURE_NAME: &str = "dbdirect";

/// What a caller presents to identify itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    ApiKey(String),
    /// An already established session for the named account
    Session(String),
}

/// Resolves credentials to a principal; `None` means unauthenticated
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> Option<Principal>;
}

/// Per-principal feature switch
pub trait FeatureGate: Send + Sync {
    fn is_enabled(&self, principal: &Principal, feature: &str) -> bool;
}

impl Authenticator for Directory {
    fn authenticate(&self, credentials: &Credentials) -> Option<Principal> {
        match credentials {
            Credentials::ApiKey(key) => self.find_by_api_key(key).cloned(),
            Credentials::Session(username) => self.principal(username).cloned(),
        }
    }
}

impl FeatureGate for Directory {
    fn is_enabled(&self, principal: &Principal, feature: &str) -> bool {
        self.has_feature(&principal.username, feature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
pub enum Status {
    #[strum(serialize = "200 OK")]
    Ok,
    #[strum(serialize = "201 Created")]
    Created,
    #[strum(serialize = "204 No Content")]
    NoContent,
    #[strum(serialize = "401 Unauthorized")]
    Unauthorized,
    #[strum(serialize = "403 Forbidden")]
    Forbidden,
    #[strum(serialize = "422 Unprocessable Entity")]
    UnprocessableEntity,
    #[strum(serialize = "500 Internal Server Error")]
    InternalServerError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Created => 201,
            Self::NoContent => 204,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::UnprocessableEntity => 422,
            Self::InternalServerError => 500,
        }
    }

    pub fn is_success(self) -> bool {
        (200..300).contains(&self.code())
    }
}

/// Status plus optional JSON body
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    pub body: Option<Value>,
}

impl Response {
    fn new(status: Status, body: Value) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }

    fn no_content() -> Self {
        Self {
            status: Status::NoContent,
            body: None,
        }
    }

    fn ips(status: Status, ips: &[String]) -> Self {
        Self::new(status, json!({ "ips": ips }))
    }

    fn errors(status: Status, errors: Value) -> Self {
        Self::new(status, json!({ "errors": errors }))
    }
}

impl From<Error> for Response {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation { field, message } => {
                Self::errors(Status::UnprocessableEntity, json!({ field: [message] }))
            }
            Error::Firewall(e) => {
                Self::errors(Status::InternalServerError, Value::String(e.message().to_string()))
            }
            other => Self::errors(Status::InternalServerError, Value::String(other.to_string())),
        }
    }
}

pub struct Service<A, G, F, S> {
    authenticator: A,
    gate: G,
    manager: AllowlistManager<F, S>,
}

impl<A, G, F, S> Service<A, G, F, S>
where
    A: Authenticator,
    G: FeatureGate,
    F: FirewallSync,
    S: AllowlistStore,
{
    pub fn new(authenticator: A, gate: G, manager: AllowlistManager<F, S>) -> Self {
        Self {
            authenticator,
            gate,
            manager,
        }
    }

    pub fn manager(&self) -> &AllowlistManager<F, S> {
        &self.manager
    }

    /// Replaces the caller's allowlist from a `{"ips": [...]}` body.
    ///
    /// 201 with the normalized list, 422 for a bad list, 500 if the firewall
    /// or the store failed.
    pub async fn update(&self, credentials: Option<&Credentials>, body: &Value) -> Response {
        let principal = match self.admit(credentials) {
            Ok(p) => p,
            Err(denied) => return denied,
        };

        let ips = body.get("ips").unwrap_or(&Value::Null);
        match self.manager.update(&principal, ips).await {
            Ok(ips) => Response::ips(Status::Created, &ips),
            Err(e) => {
                if e.is_client_error() {
                    debug!(user = %principal.username, "Rejected allowlist: {e}");
                }
                e.into()
            }
        }
    }

    /// Clears the caller's allowlist. 204 without a body, 500 on failure.
    pub async fn destroy(&self, credentials: Option<&Credentials>) -> Response {
        let principal = match self.admit(credentials) {
            Ok(p) => p,
            Err(denied) => return denied,
        };

        match self.manager.delete(&principal).await {
            Ok(()) => Response::no_content(),
            Err(e) => e.into(),
        }
    }

    /// 200 with the effective allowlist, empty when none is stored
    pub async fn show(&self, credentials: Option<&Credentials>) -> Response {
        let principal = match self.admit(credentials) {
            Ok(p) => p,
            Err(denied) => return denied,
        };

        match self.manager.show(&principal).await {
            Ok(ips) => Response::ips(Status::Ok, &ips),
            Err(e) => e.into(),
        }
    }

    fn admit(&self, credentials: Option<&Credentials>) -> Result<Principal, Response> {
        let Some(principal) = credentials.and_then(|c| self.authenticator.authenticate(c)) else {
            warn!("Rejected unauthenticated allowlist request");
            return Err(Response::errors(
                Status::Unauthorized,
                Value::String("You need to sign in or sign up before continuing.".into()),
            ));
        };

        if !self.gate.is_enabled(&principal, FEATURE_NAME) {
            warn!(user = %principal.username, "Allowlist request without {FEATURE_NAME} feature");
            return Err(Response::errors(
                Status::Forbidden,
                Value::String(format!("The {FEATURE_NAME} feature is not enabled for this account")),
            ));
        }

        Ok(principal)
    }
}
