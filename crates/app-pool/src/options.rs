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

//! Per-request pool options and pool-wide tuning settings

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How the spawner produces a new worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnMethod {
    /// Fork from a preloaded framework image (fast, shares memory)
    #[default]
    Smart,
    /// Boot a fresh interpreter for every process (slow, maximally isolated)
    Conservative,
}

/// Options accepted by [`Pool::get`](crate::Pool::get)
///
/// ## Purpose
/// Describes which application a session is requested for and how its group of
/// worker processes should be managed. The group remembers the most recently
/// seen options, so per-deployment knobs such as `min_processes` or
/// `max_requests` follow whatever the latest caller asked for.
///
/// ## Examples
/// ```rust
/// use plexserve_app_pool::PoolOptions;
///
/// let options = PoolOptions {
///     min_processes: 3,
///     use_global_queue: true,
///     ..PoolOptions::new("/srv/apps/store")
/// };
/// assert_eq!(options.app_group_name(), "/srv/apps/store");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Filesystem root of the application; doubles as the group identity
    /// unless `app_group_name` overrides it
    pub app_root: PathBuf,
    /// Explicit group key; multiple app roots may share one group
    pub app_group_name: Option<String>,
    /// Framework flavor forwarded to the spawner ("rack", "wsgi", ...)
    pub app_type: String,
    /// Spawner-side strategy; the pool merely records and forwards it
    pub spawn_method: SpawnMethod,
    /// Lower bound of desired processes for the group
    pub min_processes: u32,
    /// Per-group process cap; 0 means unlimited
    pub max_instances: u32,
    /// Requests a process may serve before graceful retirement; 0 = unlimited
    pub max_requests: u64,
    /// Wait on the pool-wide FIFO queue instead of spawning or waiting
    /// per-group when everything is busy
    pub use_global_queue: bool,
    /// Replace processes one at a time on restart, keeping the old code
    /// serving until each replacement is ready
    pub rolling_restart: bool,
    /// Background spawn failures flag the group bad instead of surfacing
    pub ignore_spawn_errors: bool,
    /// Log spawn failures loudly; purely cosmetic, errors still propagate
    pub print_exceptions: bool,
    /// Directory holding the restart markers; absolute, or relative to
    /// `app_root`. Defaults to `<app_root>/tmp`
    pub restart_dir: Option<PathBuf>,
    /// Prefer the process previously tagged with this session id
    pub sticky_session_id: Option<String>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            app_root: PathBuf::new(),
            app_group_name: None,
            app_type: "rack".to_string(),
            spawn_method: SpawnMethod::Smart,
            min_processes: 0,
            max_instances: 0,
            max_requests: 0,
            use_global_queue: false,
            rolling_restart: false,
            ignore_spawn_errors: false,
            print_exceptions: true,
            restart_dir: None,
            sticky_session_id: None,
        }
    }
}

impl PoolOptions {
    /// Options for the application rooted at `app_root`, everything else at
    /// its default
    pub fn new(app_root: impl Into<PathBuf>) -> Self {
        Self {
            app_root: app_root.into(),
            ..Self::default()
        }
    }

    /// The key processes of this application are grouped under
    pub fn app_group_name(&self) -> String {
        match &self.app_group_name {
            Some(name) => name.clone(),
            None => self.app_root.display().to_string(),
        }
    }

    /// Directory scanned for `restart.txt` / `always_restart.txt`
    pub fn resolved_restart_dir(&self) -> PathBuf {
        match &self.restart_dir {
            None => self.app_root.join("tmp"),
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.app_root.join(dir),
        }
    }
}

/// Pool-wide tuning knobs
///
/// All of these can be changed at runtime through the pool's setters; changes
/// take effect on the next admission or cleanup cycle and never preempt
/// in-flight sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Fleet-wide cap on worker processes
    pub max: u32,
    /// Default per-group cap when the options leave `max_instances` at 0;
    /// 0 means unlimited
    pub max_per_app: u32,
    /// Idle time after which a process becomes eligible for cleanup
    pub max_idle_time: Duration,
    /// How often the idle cleaner wakes up
    pub cleaner_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL when retiring a process
    pub termination_grace: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max: 6,
            max_per_app: 0,
            max_idle_time: Duration::from_secs(300),
            cleaner_interval: Duration::from_millis(200),
            termination_grace: Duration::from_secs(5),
        }
    }
}
