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

//! Narrow contract between the pool and the external process spawner

use crate::error::SpawnError;
use crate::options::PoolOptions;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Child;

/// A freshly spawned, fully initialized worker process
///
/// Returned by [`Spawner::spawn`] once the worker is listening on its session
/// socket. The pool wraps this in a
/// [`ProcessHandle`](crate::process::ProcessHandle) and takes over lifecycle
/// management from here.
#[derive(Debug)]
pub struct SpawnedProcess {
    /// OS process id of the worker
    pub pid: u32,
    /// Unix socket the worker accepts session connections on
    pub socket_path: PathBuf,
    /// Shared secret a session must echo in `PASSENGER_CONNECT_PASSWORD`
    pub connect_password: String,
    /// The worker child, when the spawner runs it directly. `None` for
    /// workers owned by an out-of-process spawn server; those are probed
    /// and signalled by pid instead.
    pub child: Option<Child>,
}

/// External process manager the pool delegates spawning to
///
/// ## Purpose
/// The pool never forks application code itself. It hands the fully resolved
/// [`PoolOptions`] to a spawner, which produces an initialized worker and
/// returns the endpoints the pool needs to open sessions against it.
///
/// ## Contract
/// - `spawn` may block for as long as application boot takes and must be safe
///   to call concurrently for different groups.
/// - `reload` is an idempotent, best-effort invalidation of any cached
///   framework or application images for the given root. The pool calls it
///   before retiring a group's processes on restart.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Produce one initialized worker process for the given options
    async fn spawn(&self, options: &PoolOptions) -> Result<SpawnedProcess, SpawnError>;

    /// Drop any cached state for the application rooted at `app_root`
    async fn reload(&self, app_root: &Path);
}
