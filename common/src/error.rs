// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the fleet control plane

use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::time::Duration;
use uuid::Uuid;

/// An error that can be generated within a control plane component
///
/// These may be generated while executing a mutation against a universe or as
/// part of background maintenance.  The first group of variants is the
/// taxonomy callers are expected to act on; the rest describe plumbing
/// failures.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// Another mutation holds (or has already advanced) the universe.  The
    /// caller must retry later with a fresh expected version and must never
    /// silently proceed.
    #[error(
        "Concurrent modification of universe {universe_id}: {message}"
    )]
    ConcurrentModification { universe_id: Uuid, message: String },
    /// A node could not be reached.  This is generally transient.
    #[error("Node {node_name} unreachable: {message}")]
    NodeUnreachable { node_name: String, message: String },
    /// Some existing resource is not in a state this operation can work with.
    /// This requires operator intervention and is never retried
    /// automatically.
    #[error("Precondition failed: {message}")]
    PreconditionFailed { message: String },
    /// A command or RPC issued against a node failed.
    #[error("Remote command failed on {node_name}: {message}")]
    RemoteCommandFailed { node_name: String, message: String },
    /// A readiness wait exceeded its bound.
    #[error("Timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// An object needed as part of this operation was not found.
    #[error("Object (of type {type_name}) not found: {id}")]
    ObjectNotFound { type_name: ResourceType, id: Uuid },
    /// The request was well-formed, but the operation cannot be completed given
    /// the current state of the system.
    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },
    /// The system encountered an unhandled operational error.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
}

/// Kinds of objects that may be named in an [`Error::ObjectNotFound`]
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
    strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ResourceType {
    Universe,
    Cluster,
    Node,
    Task,
    Backup,
    Schedule,
    StorageConfig,
}

impl Error {
    /// Returns whether the error is likely transient and could reasonably be
    /// retried
    pub fn retryable(&self) -> bool {
        match self {
            Error::ConcurrentModification { .. }
            | Error::NodeUnreachable { .. } => true,

            Error::PreconditionFailed { .. }
            | Error::RemoteCommandFailed { .. }
            | Error::Timeout { .. }
            | Error::ObjectNotFound { .. }
            | Error::InvalidRequest { .. }
            | Error::InternalError { .. } => false,
        }
    }

    /// Returns whether this error represents a failed operation against a
    /// node.  A readiness timeout counts as one.
    pub fn is_remote_command_failure(&self) -> bool {
        matches!(
            self,
            Error::RemoteCommandFailed { .. } | Error::Timeout { .. }
        )
    }

    pub fn concurrent_modification(universe_id: Uuid, message: &str) -> Error {
        Error::ConcurrentModification {
            universe_id,
            message: message.to_owned(),
        }
    }

    pub fn node_unreachable(node_name: &str, message: &str) -> Error {
        Error::NodeUnreachable {
            node_name: node_name.to_owned(),
            message: message.to_owned(),
        }
    }

    pub fn precondition_failed(message: &str) -> Error {
        Error::PreconditionFailed { message: message.to_owned() }
    }

    pub fn remote_command_failed(node_name: &str, message: &str) -> Error {
        Error::RemoteCommandFailed {
            node_name: node_name.to_owned(),
            message: message.to_owned(),
        }
    }

    pub fn timeout(what: &str, elapsed: Duration) -> Error {
        Error::Timeout { what: what.to_owned(), elapsed }
    }

    /// Generates an [`Error::ObjectNotFound`] error for a lookup by object id.
    pub fn not_found_by_id(type_name: ResourceType, id: &Uuid) -> Error {
        Error::ObjectNotFound { type_name, id: *id }
    }

    /// Generates an [`Error::InternalError`] error with the specific message
    ///
    /// InternalError should be used for operational conditions that should not
    /// happen but that we cannot reasonably handle at runtime (e.g., a
    /// subtask panicking, or a record that fails to serialize).
    pub fn internal_error(internal_message: &str) -> Error {
        Error::InternalError { internal_message: internal_message.to_owned() }
    }

    /// Generates an [`Error::InvalidRequest`] error with the specific message
    ///
    /// This should be used for failures due possibly to invalid client input
    /// or malformed requests.
    pub fn invalid_request(message: &str) -> Error {
        Error::InvalidRequest { message: message.to_owned() }
    }

    /// Given an [`Error`] with a free-form message, return the same error with
    /// `context` prepended to it to provide more context
    ///
    /// Variants that only carry identifiers are returned unchanged.
    pub fn internal_context<C>(self, context: C) -> Error
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Error::ObjectNotFound { .. }
            | Error::ConcurrentModification { .. }
            | Error::Timeout { .. } => self,
            Error::NodeUnreachable { node_name, message } => {
                Error::NodeUnreachable {
                    node_name,
                    message: format!("{}: {}", context, message),
                }
            }
            Error::PreconditionFailed { message } => {
                Error::PreconditionFailed {
                    message: format!("{}: {}", context, message),
                }
            }
            Error::RemoteCommandFailed { node_name, message } => {
                Error::RemoteCommandFailed {
                    node_name,
                    message: format!("{}: {}", context, message),
                }
            }
            Error::InvalidRequest { message } => Error::InvalidRequest {
                message: format!("{}: {}", context, message),
            },
            Error::InternalError { internal_message } => Error::InternalError {
                internal_message: format!("{}: {}", context, internal_message),
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::internal_error(&e.to_string())
    }
}

/// Like [`assert!`], except that instead of panicking, this function returns an
/// `Err(Error::InternalError)` with an appropriate message if the given
/// condition is not true.
#[macro_export]
macro_rules! bail_unless {
    ($cond:expr $(,)?) => {
        $crate::bail_unless!($cond, "failed runtime check: {:?}", stringify!($cond))
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            Err($crate::error::Error::internal_error(&format!(
                $($arg)*)))?;
        }
    };
}

/// Implements a pattern similar to `anyhow::Context` for providing extra
/// context for error messages
///
/// Unlike `anyhow::Context`, this does not add a new Error to the cause chain.
/// It replaces the given Error with one that has the modified message.
pub trait InternalContext<T> {
    fn internal_context<C>(self, s: C) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static;

    fn with_internal_context<C, F>(self, f: F) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T> InternalContext<T> for Result<T, Error> {
    fn internal_context<C>(self, context: C) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        self.map_err(|error| error.internal_context(context))
    }

    fn with_internal_context<C, F>(self, make_context: F) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|error| error.internal_context(make_context()))
    }
}
