// SPDX-FileCopyrightText: 2025 The fdgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bounded open-file cache and peer socket governor for a BitTorrent client.
//!
//! A [`governor::ResourceGovernor`] owns a fixed pool of file handles, keyed by
//! (transfer, file index) and recycled least-recently-used, plus a count of
//! open peer sockets held under a configurable cap. Async code reaches it
//! through [`resource_manager::GovernorClient`].

pub mod config;
pub mod errors;
pub mod fd_cache;
pub mod governor;
pub mod resource_manager;
pub mod storage;

pub use errors::{GovernorError, OpenError, SocketError};
pub use fd_cache::{FileIndex, OwnerId, PreallocationMode};
pub use governor::{GovernorLimits, ResourceGovernor};
pub use resource_manager::{FileRequest, GovernorActor, GovernorClient};
