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

//! Handle to one spawned worker process

use crate::spawner::SpawnedProcess;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Accounting for one worker, updated while the pool lock is held
#[derive(Debug)]
struct ProcessStats {
    /// Live sessions currently checked out against this process
    sessions: u32,
    /// Total requests ever checked out against this process
    processed: u64,
    /// Last checkout or release
    last_used: Instant,
    /// Session affinity tag, set by clients through their session
    sticky_session_id: Option<String>,
    /// Serves its current sessions to completion, then is terminated
    retiring: bool,
    /// The OS process is gone; never hand out new sessions
    defunct: bool,
    /// Still listed in a group. Cleared on detach, eviction, restart and
    /// shutdown; releases of an unlisted handle touch no pool counters
    in_pool: bool,
}

/// Outcome of releasing one session, used by the pool's release path
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReleaseOutcome {
    /// Sessions remaining after the release
    pub sessions: u32,
    /// The handle wants to be removed once drained
    pub retiring: bool,
    /// The handle was still listed in its group at release time
    pub in_pool: bool,
}

/// Owns one spawned worker process
///
/// ## Purpose
/// Exactly one `ProcessHandle` exists per spawned OS process. The group lists
/// it while it is poolable; every live [`Session`](crate::Session) holds a
/// strong reference as well, so a handle (and the socket identity it carries)
/// outlives pool shutdown for as long as sessions are in flight.
///
/// ## Lifecycle
/// Created from a [`SpawnedProcess`] at enrollment. Retires when it hits its
/// request ceiling, idles out, is displaced by a restart or capacity
/// eviction, is detached by key, or the pool shuts down. Retirement is
/// graceful: the process is removed from its group immediately, in-flight
/// sessions finish, then the OS process is signalled.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    socket_path: PathBuf,
    connect_password: String,
    detach_key: String,
    spawned_at: Instant,
    /// Group restart generation this process was spawned under
    epoch: u64,
    child: Mutex<Option<Child>>,
    stats: Mutex<ProcessStats>,
}

impl ProcessHandle {
    pub(crate) fn new(spawned: SpawnedProcess, epoch: u64) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            pid: spawned.pid,
            socket_path: spawned.socket_path,
            connect_password: spawned.connect_password,
            detach_key: ulid::Ulid::new().to_string(),
            spawned_at: now,
            epoch,
            child: Mutex::new(spawned.child),
            stats: Mutex::new(ProcessStats {
                sessions: 0,
                processed: 0,
                last_used: now,
                sticky_session_id: None,
                retiring: false,
                defunct: false,
                in_pool: true,
            }),
        })
    }

    fn stats(&self) -> MutexGuard<'_, ProcessStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn child(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// OS process id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Unix socket new sessions connect to
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Shared secret sessions echo in their header frame
    pub fn connect_password(&self) -> &str {
        &self.connect_password
    }

    /// Opaque key external callers use to remove this process from the pool
    pub fn detach_key(&self) -> &str {
        &self.detach_key
    }

    /// Time since this process was enrolled
    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Sessions currently checked out against this process
    pub fn sessions(&self) -> u32 {
        self.stats().sessions
    }

    /// Requests this process has served
    pub fn processed(&self) -> u64 {
        self.stats().processed
    }

    /// How long this process has been idle
    pub fn idle_for(&self) -> Duration {
        self.stats().last_used.elapsed()
    }

    pub(crate) fn last_used(&self) -> Instant {
        self.stats().last_used
    }

    /// Idle, healthy and still poolable: eligible for checkout and cleanup
    pub(crate) fn is_idle(&self) -> bool {
        let stats = self.stats();
        stats.sessions == 0 && !stats.retiring && !stats.defunct && stats.in_pool
    }

    pub(crate) fn sticky_session_id(&self) -> Option<String> {
        self.stats().sticky_session_id.clone()
    }

    pub(crate) fn set_sticky_session_id(&self, id: &str) {
        self.stats().sticky_session_id = Some(id.to_string());
    }

    /// Account one checkout. Flags the handle retiring once it reaches
    /// `max_requests` (0 = unlimited); the session just checked out is still
    /// served to completion.
    pub(crate) fn checkout(&self, max_requests: u64) {
        let mut stats = self.stats();
        stats.sessions += 1;
        stats.processed += 1;
        stats.last_used = Instant::now();
        if max_requests > 0 && stats.processed >= max_requests && !stats.retiring {
            debug!(
                pid = self.pid,
                processed = stats.processed,
                "process reached its request ceiling, retiring after this session"
            );
            stats.retiring = true;
        }
    }

    /// Account one release
    pub(crate) fn release(&self) -> ReleaseOutcome {
        let mut stats = self.stats();
        stats.sessions = stats.sessions.saturating_sub(1);
        stats.last_used = Instant::now();
        ReleaseOutcome {
            sessions: stats.sessions,
            retiring: stats.retiring || stats.defunct,
            in_pool: stats.in_pool,
        }
    }

    /// Take the handle out of its group's books. Returns the number of
    /// sessions that were still running, which the caller subtracts from the
    /// pool's active count; those sessions keep their connection and release
    /// without touching pool counters.
    pub(crate) fn remove_from_pool(&self) -> u32 {
        let mut stats = self.stats();
        stats.in_pool = false;
        stats.retiring = true;
        stats.sessions
    }

    pub(crate) fn in_pool(&self) -> bool {
        self.stats().in_pool
    }

    pub(crate) fn mark_defunct(&self) {
        self.stats().defunct = true;
    }

    /// Non-blocking liveness probe. Reaps the child when the spawner handed
    /// it to us, otherwise falls back to `kill(pid, 0)`. A dead result makes
    /// the handle defunct.
    pub fn is_alive(&self) -> bool {
        if self.stats().defunct {
            return false;
        }
        let alive = {
            let mut child = self.child();
            match child.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(None)),
                None if self.pid > 0 => {
                    signal::kill(Pid::from_raw(self.pid as i32), None).is_ok()
                }
                None => true,
            }
        };
        if !alive {
            self.mark_defunct();
        }
        alive
    }

    /// Gracefully terminate the OS process: SIGTERM, a bounded wait, then
    /// SIGKILL. Runs on a detached task; callers must have removed the handle
    /// from the pool's books first.
    pub(crate) fn terminate(self: &Arc<Self>, grace: Duration) {
        let handle = Arc::clone(self);
        tokio::spawn(async move {
            if handle.pid > 0 {
                let _ = signal::kill(Pid::from_raw(handle.pid as i32), Signal::SIGTERM);
            }
            let child = handle.child().take();
            if let Some(mut child) = child {
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(pid = handle.pid, %status, "worker process exited");
                    }
                    Ok(Err(err)) => {
                        warn!(pid = handle.pid, error = %err, "failed to reap worker process");
                    }
                    Err(_) => {
                        warn!(pid = handle.pid, "worker ignored SIGTERM, killing");
                        let _ = child.kill().await;
                    }
                }
            }
            handle.mark_defunct();
        });
    }
}
