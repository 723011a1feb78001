// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Orchestration of mutations and maintenance across a fleet of database
//! clusters ("universes")
//!
//! Every change to a universe runs as a *task* on the [`executor`].  A task
//! first takes the universe [`lock`], then emits ordered groups of subtasks.
//! For upgrade-class tasks the groups come from the [`upgrade`] engine, which
//! uses [`node_ordering`] to decide the order nodes are touched in.  The
//! [`background`] tasks periodically scan the fleet and submit tasks of their
//! own (backup garbage collection and helper agent upgrades).
//!
//! Everything outside the orchestrator (nodes, the metadata database, the
//! load balancer, backup storage) is reached through the traits in
//! [`external`].  [`sim`] implements all of them in memory.

// We only use rustdoc for internal documentation, including private items, so
// it's expected that we'll have links to private items in the docs.
#![allow(rustdoc::private_intra_doc_links)]

pub mod app;
pub mod background;
pub mod config;
pub mod executor;
pub mod external;
pub mod lock;
pub mod node_ordering;
pub mod sim;
pub mod tasks;
pub mod test_util;
pub mod upgrade;

pub use app::Orchestrator;
