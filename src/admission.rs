//! Decides whether an upgrade request becomes a relay pair.
//!
//! Checks run in a fixed order: global capacity (503), per-IP capacity (429),
//! origin allow-list (403), path (404). Only an accepted request takes a
//! registry slot, and it takes it in the same lock acquisition as the capacity
//! check.

use std::{collections::HashSet, sync::Arc};
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::registry::{CapacityError, ConnectionLease, Registry};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Server at maximum capacity")]
    AtCapacity,
    #[error("Too many connections from this IP")]
    TooManyFromIp,
    #[error("Origin not allowed")]
    OriginNotAllowed,
    #[error("Path not found")]
    PathNotFound,
}

impl Rejection {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::AtCapacity => StatusCode::SERVICE_UNAVAILABLE,
            Self::TooManyFromIp => StatusCode::TOO_MANY_REQUESTS,
            Self::OriginNotAllowed => StatusCode::FORBIDDEN,
            Self::PathNotFound => StatusCode::NOT_FOUND,
        }
    }
}

impl From<CapacityError> for Rejection {
    fn from(err: CapacityError) -> Self {
        match err {
            CapacityError::Global(_) => Self::AtCapacity,
            CapacityError::PerIp(_) => Self::TooManyFromIp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPolicy {
    Any,
    AllowList(HashSet<String>),
}

impl OriginPolicy {
    /// A leading `*` opens the relay to every origin. Elsewhere in the list it
    /// is only an entry that no real `Origin` header matches.
    pub fn from_list(origins: &[String]) -> Self {
        if origins.first().is_some_and(|origin| origin == "*") {
            Self::Any
        } else {
            Self::AllowList(origins.iter().cloned().collect())
        }
    }

    #[must_use]
    pub fn allows(&self, origin: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::AllowList(allowed) => origin.is_some_and(|origin| allowed.contains(origin)),
        }
    }
}

/// Accepted path prefixes.
#[derive(Debug, Clone)]
pub struct PathRules {
    prefix: String,
    alternate: String,
}

impl PathRules {
    pub fn new(prefix: impl Into<String>, alternate: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            alternate: alternate.into(),
        }
    }

    /// Maps a request target (path plus optional query) to the backend target,
    /// or `None` when the path is not relayed.
    #[must_use]
    pub fn backend_target(&self, target: &str) -> Option<String> {
        let path = target.split_once('?').map_or(target, |(path, _)| path);

        if path.starts_with(&self.prefix) {
            return Some(target.to_string());
        }
        if self.alternate.is_empty() {
            return None;
        }
        path.strip_prefix(&self.alternate)
            .filter(|rest| rest.starts_with(&self.prefix))
            .map(|_| target[self.alternate.len()..].to_string())
    }
}

/// The parts of an upgrade request admission looks at.
#[derive(Debug, Clone, Copy)]
pub struct UpgradeRequest<'a> {
    pub source_ip: &'a str,
    pub origin: Option<&'a str>,
    pub target: &'a str,
}

#[derive(Debug)]
pub struct Admission {
    pub lease: ConnectionLease,
    /// Request target to append to the backend base URL.
    pub backend_target: String,
}

#[derive(Debug)]
pub struct AdmissionGate {
    registry: Arc<Registry>,
    origins: OriginPolicy,
    paths: PathRules,
}

impl AdmissionGate {
    pub fn new(registry: Arc<Registry>, origins: OriginPolicy, paths: PathRules) -> Self {
        Self {
            registry,
            origins,
            paths,
        }
    }

    pub fn evaluate(&self, request: &UpgradeRequest<'_>) -> Result<Admission, Rejection> {
        let policy = if self.origins.allows(request.origin) {
            self.paths
                .backend_target(request.target)
                .ok_or(Rejection::PathNotFound)
        } else {
            Err(Rejection::OriginNotAllowed)
        };

        match policy {
            Ok(backend_target) => {
                let lease = self.registry.try_admit(request.source_ip)?;
                Ok(Admission {
                    lease,
                    backend_target,
                })
            }
            // Capacity outranks policy, but a rejected request never takes a slot.
            Err(rejection) => Err(self
                .registry
                .check_capacity(request.source_ip)
                .map_or_else(Rejection::from, |()| rejection)),
        }
    }
}
