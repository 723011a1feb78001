// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Fleet Control Plane
//!
//! This crate implements facilities shared by the pieces of the fleet control
//! plane: the data model for database clusters ("universes") and their nodes,
//! the backup records that background maintenance operates on, the error type
//! used across component boundaries, and the bounded polling helper used for
//! every readiness wait.
//!
//! The orchestration logic itself lives in `fleet_orchestrator`.

// We only use rustdoc for internal documentation, including private items, so
// it's expected that we'll have links to private items in the docs.
#![allow(rustdoc::private_intra_doc_links)]

pub mod backup;
pub mod error;
pub mod poll;
pub mod universe;

pub use error::Error;
pub use error::InternalContext;
pub use error::ResourceType;
