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

//! Per-deployment group state
//!
//! A group owns every worker process serving one `app_group_name`, its FIFO
//! waiter queue, and the restart bookkeeping for its app root. All mutation
//! happens under the pool lock.

use crate::error::SpawnError;
use crate::options::PoolOptions;
use crate::pool::Waiter;
use crate::process::ProcessHandle;
use crate::restart::RestartTracker;
use std::collections::VecDeque;
use std::sync::Arc;

pub(crate) struct Group {
    /// Enrollment order; selection works off per-handle idle state
    pub(crate) handles: Vec<Arc<ProcessHandle>>,
    /// Callers waiting for this group specifically (non-global-queue mode)
    pub(crate) waiters: VecDeque<Waiter>,
    pub(crate) restart: RestartTracker,
    /// Set when a tolerated background spawn failed; no spawns happen for a
    /// bad group until an explicit restart marker clears it
    pub(crate) bad: bool,
    /// Spawns currently running for this group, foreground and background.
    /// Non-zero keeps the group (and its restart snapshot) alive
    pub(crate) spawns_in_flight: u32,
    /// Background spawn failure waiting to surface on the next admission
    pub(crate) pending_spawn_error: Option<SpawnError>,
    /// A rolling restart task is replacing this group's processes
    pub(crate) rolling_restart_active: bool,
    /// Most recently seen options; deployment knobs follow the latest caller
    pub(crate) options: PoolOptions,
    /// Bumped on every restart; processes remember the epoch they were
    /// spawned under so rolling restarts can tell old from new
    pub(crate) epoch: u64,
}

impl Group {
    pub(crate) fn new(options: &PoolOptions) -> Self {
        Self {
            handles: Vec::new(),
            waiters: VecDeque::new(),
            restart: RestartTracker::new(options),
            bad: false,
            spawns_in_flight: 0,
            pending_spawn_error: None,
            rolling_restart_active: false,
            options: options.clone(),
            epoch: 0,
        }
    }

    pub(crate) fn count(&self) -> u32 {
        self.handles.len() as u32
    }

    pub(crate) fn active(&self) -> u32 {
        self.handles.iter().map(|h| h.sessions()).sum()
    }

    pub(crate) fn idle_count(&self) -> u32 {
        self.handles.iter().filter(|h| h.is_idle()).count() as u32
    }

    /// Per-group process cap: the options' `max_instances` wins, then the
    /// pool-wide per-app default. 0 means unlimited.
    pub(crate) fn effective_max(&self, default_per_app: u32) -> u32 {
        if self.options.max_instances > 0 {
            self.options.max_instances
        } else {
            default_per_app
        }
    }

    /// Pick a process for checkout: the sticky-tagged idle process when the
    /// caller asked for one, otherwise the least recently used idle process,
    /// ties broken by lower pid.
    pub(crate) fn select_idle(&self, sticky: Option<&str>) -> Option<Arc<ProcessHandle>> {
        if let Some(wanted) = sticky {
            let tagged = self.handles.iter().find(|h| {
                h.is_idle() && h.sticky_session_id().as_deref() == Some(wanted)
            });
            if let Some(handle) = tagged {
                return Some(Arc::clone(handle));
            }
        }
        self.lru_idle()
    }

    /// Least recently used idle process
    pub(crate) fn lru_idle(&self) -> Option<Arc<ProcessHandle>> {
        self.handles
            .iter()
            .filter(|h| h.is_idle())
            .min_by_key(|h| (h.last_used(), h.pid()))
            .cloned()
    }

    pub(crate) fn remove_handle(&mut self, pid: u32) -> Option<Arc<ProcessHandle>> {
        let index = self.handles.iter().position(|h| h.pid() == pid)?;
        Some(self.handles.remove(index))
    }

    /// Oldest process spawned before the current epoch, idle ones first.
    /// Rolling restarts retire these one at a time.
    pub(crate) fn stale_handle(&self) -> Option<Arc<ProcessHandle>> {
        let stale = |h: &&Arc<ProcessHandle>| h.epoch() < self.epoch && h.in_pool();
        self.handles
            .iter()
            .filter(stale)
            .min_by_key(|h| (!h.is_idle(), h.last_used(), h.pid()))
            .cloned()
    }

    pub(crate) fn has_stale_handles(&self) -> bool {
        self.handles.iter().any(|h| h.epoch() < self.epoch)
    }

    /// A group disappears once nothing references it: no processes, no
    /// waiters, no spawn or rollout still in flight.
    pub(crate) fn deletable(&self) -> bool {
        self.handles.is_empty()
            && self.waiters.is_empty()
            && self.spawns_in_flight == 0
            && !self.rolling_restart_active
    }
}
