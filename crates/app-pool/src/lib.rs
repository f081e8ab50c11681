// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of PlexServe.
//
// PlexServe is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// PlexServe is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with PlexServe. If not, see <https://www.gnu.org/licenses/>.

//! # PlexServe Application Pool
//!
//! ## Purpose
//! The core subsystem of the PlexServe application server: multiplexes many
//! incoming request sessions across a dynamically managed fleet of long-lived
//! worker processes, one application instance per process. The pool spawns,
//! reuses, restarts, idles-out and retires workers on behalf of any number of
//! deployments while enforcing fleet-wide and per-group capacity limits.
//!
//! ## Architecture Context
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                           Pool                                │
//! │   admission control • capacity eviction • FIFO wait queues    │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐            │
//! │  │ Group "a"   │  │ Group "b"   │  │ Group "c"   │  ...       │
//! │  │  restart    │  │             │  │             │            │
//! │  │  markers    │  │  waiters    │  │  bad flag   │            │
//! │  │ ┌──┐ ┌──┐   │  │ ┌──┐        │  │ ┌──┐ ┌──┐   │            │
//! │  │ │P1│ │P2│   │  │ │P3│        │  │ │P4│ │P5│   │            │
//! │  │ └─┬┘ └──┘   │  │ └──┘        │  │ └──┘ └──┘   │            │
//! │  └───┼─────────┘  └─────────────┘  └─────────────┘            │
//! │      │ Session (stream + strong process ref)                  │
//! └──────┼────────────────────────────────────────────────────────┘
//!        ▼
//!     caller                       Spawner (external, async trait)
//! ```
//!
//! ## Key Components
//! - [`Pool`]: admission, queues, restart handling, inspection
//! - [`Session`]: one in-flight request bound to one worker process
//! - [`PoolOptions`] / [`PoolSettings`]: per-deployment and fleet-wide knobs
//! - [`Spawner`]: narrow async contract to the external process manager
//! - [`ProcessHandle`]: pid, session socket, counters, lifecycle flags
//! - [`MockSpawner`]: in-tree test double serving scripted bodies
//!
//! ## Restart Markers
//! Deployments trigger reloads through the filesystem: touching
//! `restart.txt` under the app's restart directory restarts its group once;
//! an `always_restart.txt` (file or directory) restarts on every admission.
//! The pool never deletes either marker.
//!
//! ## Concurrency
//! One coarse async mutex guards the aggregate state; it is released across
//! spawner calls and queue waits. Waiter queues are strictly FIFO. Background
//! work (idle cleanup, session release events, background spawns, rolling
//! restarts) runs on detached tasks that stop on the pool's shutdown signal.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod group;
pub mod mock_spawner;
mod options;
mod pool;
mod process;
mod restart;
mod session;
mod spawner;

pub use error::{PoolError, PoolResult, SpawnError};
pub use mock_spawner::MockSpawner;
pub use options::{PoolOptions, PoolSettings, SpawnMethod};
pub use pool::Pool;
pub use process::ProcessHandle;
pub use session::Session;
pub use spawner::{SpawnedProcess, Spawner};
