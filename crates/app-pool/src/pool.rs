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

//! The application pool
//!
//! ## Purpose
//! Multiplexes request sessions across a dynamically managed fleet of worker
//! processes, grouped per application deployment. Combines admission control
//! (fleet-wide and per-group caps, FIFO waiting queues), process lifecycle
//! management (spawn, reuse, restart, idle-out, eviction, detach), and
//! filesystem-marker driven reloads.
//!
//! ## Architecture Context
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          Pool                              │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │ PoolState (one coarse async lock)                    │  │
//! │  │   groups: app_group_name -> Group                    │  │
//! │  │   global FIFO waiter queue, fleet counters           │  │
//! │  └──────┬───────────────────────────────┬───────────────┘  │
//! │         │ checkout / enqueue            │ enroll / retire  │
//! │         ▼                               ▼                  │
//! │  ┌──────────────┐   spawn/reload  ┌──────────────┐         │
//! │  │ Group        │ ──────────────► │ Spawner      │         │
//! │  │  handles     │                 │ (external)   │         │
//! │  │  waiters     │                 └──────────────┘         │
//! │  │  restart     │                                          │
//! │  └──────┬───────┘                                          │
//! │         │ Session (owns stream + strong handle ref)        │
//! │         ▼                                                  │
//! │     caller                                                 │
//! └────────────────────────────────────────────────────────────┘
//! ```
//! Background tasks (idle cleaner, release event loop, background spawns,
//! rolling restarts) hold weak references and exit on the shutdown watch.
//!
//! ## Concurrency Model
//! A single `tokio::sync::Mutex` protects all aggregate state. It is released
//! across every suspension point: queue waits, spawner calls. After a spawn
//! completes the state is revalidated; an adversely changed state enrolls the
//! process anyway and re-runs admission rather than surfacing an error.

use crate::error::{PoolError, PoolResult};
use crate::group::Group;
use crate::options::{PoolOptions, PoolSettings};
use crate::process::ProcessHandle;
use crate::session::Session;
use crate::spawner::Spawner;
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

/// Message delivered to a queued waiter
pub(crate) enum Wake {
    /// A process was checked out on the waiter's behalf
    Ready(Checkout),
    /// Conditions changed; re-run admission from the top
    Retry,
    /// The pool was cleared or shut down
    Closed,
}

/// One queued `get` call
pub(crate) struct Waiter {
    pub(crate) group: String,
    pub(crate) tx: oneshot::Sender<Wake>,
}

/// A process checked out for exactly one session
pub(crate) struct Checkout {
    handle: Arc<ProcessHandle>,
    guard: ReleaseGuard,
}

impl Checkout {
    pub(crate) fn into_parts(self) -> (Arc<ProcessHandle>, ReleaseGuard) {
        (self.handle, self.guard)
    }
}

/// Returns a checked-out process to the pool exactly once, on drop or
/// explicitly. Holding the strong handle reference here is what lets sessions
/// outlive pool shutdown.
pub(crate) struct ReleaseGuard {
    handle: Option<Arc<ProcessHandle>>,
    group: String,
    release_tx: mpsc::UnboundedSender<ReleaseEvent>,
    inner: Weak<PoolInner>,
}

impl ReleaseGuard {
    /// Release synchronously, so the caller observes the updated counters
    pub(crate) async fn release_now(mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let group = std::mem::take(&mut self.group);
        match self.inner.upgrade() {
            Some(inner) => {
                let mut state = inner.state.lock().await;
                inner.release_process(&mut state, &group, &handle);
            }
            None => {
                // The pool is gone; only the handle's own books remain.
                let outcome = handle.release();
                if outcome.sessions == 0 && outcome.retiring {
                    handle.terminate(PoolSettings::default().termination_grace);
                }
            }
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let group = std::mem::take(&mut self.group);
            if let Err(err) = self.release_tx.send(ReleaseEvent { group, handle }) {
                // Release loop already gone; settle the handle's own books.
                err.0.handle.release();
            }
        }
    }
}

struct ReleaseEvent {
    group: String,
    handle: Arc<ProcessHandle>,
}

struct PoolState {
    groups: IndexMap<String, Group>,
    settings: PoolSettings,
    global_waiters: VecDeque<Waiter>,
    /// Enrolled worker processes, fleet-wide
    count: u32,
    /// Live sessions, fleet-wide
    active: u32,
    /// Spawns in flight holding a capacity slot. `count + reservations`
    /// never exceeds `settings.max`
    spawn_reservations: u32,
}

pub(crate) struct PoolInner {
    spawner: Arc<dyn Spawner>,
    state: Mutex<PoolState>,
    release_tx: mpsc::UnboundedSender<ReleaseEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

enum AdmitOutcome {
    Checked(Checkout),
    Spawn { epoch: u64 },
    Wait(oneshot::Receiver<Wake>),
    Restart { rolling: bool },
    Fail(PoolError),
}

/// Pool of application worker processes
///
/// ## Purpose
/// The front door of the application server: callers ask for a
/// [`Session`] against a deployment described by [`PoolOptions`], and the
/// pool reuses, spawns, restarts or queues as needed while keeping fleet-wide
/// and per-group limits intact.
///
/// ## Examples
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use plexserve_app_pool::{MockSpawner, Pool, PoolOptions};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = Pool::new(Arc::new(MockSpawner::new()));
///
/// let mut session = pool.get(PoolOptions::new("/srv/apps/store")).await?;
/// let password = session.connect_password();
/// session
///     .send_headers(&[
///         ("REQUEST_METHOD", "GET"),
///         ("PATH_INFO", "/"),
///         ("PASSENGER_CONNECT_PASSWORD", &password),
///     ])
///     .await?;
/// session.shutdown_writer().await?;
/// let body = session.read_to_end().await?;
/// session.close().await;
/// # let _ = body;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool with default [`PoolSettings`]
    pub fn new(spawner: Arc<dyn Spawner>) -> Self {
        Self::with_settings(spawner, PoolSettings::default())
    }

    /// Create a pool with explicit tuning settings
    pub fn with_settings(spawner: Arc<dyn Spawner>, settings: PoolSettings) -> Self {
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(PoolInner {
            spawner,
            state: Mutex::new(PoolState {
                groups: IndexMap::new(),
                settings,
                global_waiters: VecDeque::new(),
                count: 0,
                active: 0,
                spawn_reservations: 0,
            }),
            release_tx,
            shutdown_tx,
        });
        tokio::spawn(release_loop(
            Arc::downgrade(&inner),
            release_rx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(cleaner_loop(Arc::downgrade(&inner), shutdown_rx));
        Self { inner }
    }

    /// Obtain a session for the deployment described by `options`
    ///
    /// Blocks until a process is available. Reuses an idle process when it
    /// can, spawns (possibly evicting an idle process of another group) when
    /// allowed, and otherwise queues the caller on the group queue, or on the
    /// pool-wide queue when `options.use_global_queue` is set. Restart
    /// markers are honored before anything is handed out.
    ///
    /// ## Errors
    /// - [`PoolError::SpawnFailed`]: a foreground spawn failed, or an earlier
    ///   background spawn failure for this group is being surfaced
    /// - [`PoolError::PoolClosed`]: the pool was cleared while waiting
    pub async fn get(&self, options: PoolOptions) -> PoolResult<Session> {
        let key = options.app_group_name();
        let mut restart_done = false;
        let mut requeue_front = false;
        loop {
            let outcome = {
                let mut state = self.inner.state.lock().await;
                self.inner
                    .admit(&mut state, &key, &options, restart_done, requeue_front)
            };
            match outcome {
                AdmitOutcome::Checked(checkout) => return Ok(Session::new(checkout)),
                AdmitOutcome::Spawn { epoch } => {
                    match self.spawn_foreground(&key, &options, epoch).await? {
                        Some(session) => return Ok(session),
                        None => continue,
                    }
                }
                AdmitOutcome::Wait(rx) => match rx.await {
                    Ok(Wake::Ready(checkout)) => return Ok(Session::new(checkout)),
                    Ok(Wake::Retry) => {
                        requeue_front = true;
                        continue;
                    }
                    Ok(Wake::Closed) | Err(_) => return Err(PoolError::PoolClosed),
                },
                AdmitOutcome::Restart { rolling } => {
                    restart_done = true;
                    if rolling {
                        let inner = Arc::clone(&self.inner);
                        let task_key = key.clone();
                        let task_options = options.clone();
                        tokio::spawn(async move {
                            rolling_restart_task(inner, task_key, task_options).await;
                        });
                    } else {
                        info!(app_group = %key, "restart marker honored, replacing processes");
                        self.inner.spawner.reload(&options.app_root).await;
                        let mut state = self.inner.state.lock().await;
                        self.inner.restart_group(&mut state, &key);
                    }
                    continue;
                }
                AdmitOutcome::Fail(err) => return Err(err),
            }
        }
    }

    /// Foreground spawn with the pool lock released for the duration. The
    /// spawned process is always enrolled; when a restart raced the spawn the
    /// caller re-runs admission instead of taking the process directly.
    async fn spawn_foreground(
        &self,
        key: &str,
        options: &PoolOptions,
        epoch: u64,
    ) -> PoolResult<Option<Session>> {
        debug!(app_group = %key, "spawning worker process");
        let result = self.inner.spawner.spawn(options).await;
        let mut state = self.inner.state.lock().await;
        let state = &mut *state;
        state.spawn_reservations = state.spawn_reservations.saturating_sub(1);
        let grace = state.settings.termination_grace;

        if !state.groups.contains_key(key) {
            // Cleared while spawning; don't leak the worker.
            if let Ok(spawned) = result {
                ProcessHandle::new(spawned, 0).terminate(grace);
            }
            self.inner.pump_waiters(state);
            return Ok(None);
        }

        let enrolled = {
            let group = match state.groups.get_mut(key) {
                Some(group) => group,
                None => return Ok(None),
            };
            group.spawns_in_flight = group.spawns_in_flight.saturating_sub(1);
            match result {
                Err(err) => Err(err),
                Ok(spawned) => {
                    let handle = ProcessHandle::new(spawned, group.epoch);
                    group.handles.push(Arc::clone(&handle));
                    Ok((handle, group.epoch))
                }
            }
        };
        match enrolled {
            Err(err) => {
                if options.print_exceptions {
                    warn!(app_group = %key, error = %err, "spawn failed");
                } else {
                    debug!(app_group = %key, error = %err, "spawn failed");
                }
                // The freed reservation is capacity someone may be waiting on.
                self.inner.pump_waiters(state);
                Err(PoolError::SpawnFailed {
                    app_group: key.to_string(),
                    source: err,
                })
            }
            Ok((handle, group_epoch)) => {
                state.count += 1;
                info!(app_group = %key, pid = handle.pid(), "worker process enrolled");

                if group_epoch != epoch {
                    // A restart happened while we were spawning; the process
                    // stays enrolled and admission runs again.
                    self.inner.pump_waiters(state);
                    return Ok(None);
                }

                let checkout = self.inner.checkout_handle(state, key, &handle);
                self.inner.schedule_min_fill(state, key);
                Ok(Some(Session::new(checkout)))
            }
        }
    }

    /// Remove the process with the given detach key from the pool
    ///
    /// Sessions already running against it continue undisturbed; no new ones
    /// are issued. Returns `true` iff a process was removed.
    pub async fn detach(&self, detach_key: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        let found = state.groups.iter().find_map(|(key, group)| {
            group
                .handles
                .iter()
                .find(|h| h.detach_key() == detach_key)
                .map(|h| (key.clone(), h.pid()))
        });
        match found {
            Some((key, pid)) => {
                info!(app_group = %key, pid, "detaching worker process");
                self.inner.remove_process(&mut state, &key, pid);
                true
            }
            None => false,
        }
    }

    /// Gracefully retire every process in every group
    ///
    /// Waiters are woken with [`PoolError::PoolClosed`]. Outstanding sessions
    /// keep working; they own their stream and process reference. The pool
    /// itself remains usable and will spawn again on the next `get`.
    pub async fn clear(&self) {
        let mut state = self.inner.state.lock().await;
        let state = &mut *state;
        info!("clearing application pool");
        let grace = state.settings.termination_grace;
        let groups: Vec<Group> = state.groups.drain(..).map(|(_, group)| group).collect();
        for mut group in groups {
            for waiter in group.waiters.drain(..) {
                let _ = waiter.tx.send(Wake::Closed);
            }
            for handle in group.handles.drain(..) {
                let running = handle.remove_from_pool();
                state.count = state.count.saturating_sub(1);
                state.active = state.active.saturating_sub(running);
                if running == 0 {
                    handle.terminate(grace);
                }
            }
        }
        for waiter in state.global_waiters.drain(..) {
            let _ = waiter.tx.send(Wake::Closed);
        }
    }

    /// Set the fleet-wide process cap; takes effect on the next admission
    pub async fn set_max(&self, max: u32) {
        let mut state = self.inner.state.lock().await;
        state.settings.max = max;
        self.inner.pump_waiters(&mut state);
    }

    /// Set the default per-group cap (0 = unlimited); `max_instances` in the
    /// options still wins
    pub async fn set_max_per_app(&self, max_per_app: u32) {
        let mut state = self.inner.state.lock().await;
        state.settings.max_per_app = max_per_app;
        self.inner.pump_waiters(&mut state);
    }

    /// Set the idle time after which processes are cleaned; picked up on the
    /// next cleaner cycle
    pub async fn set_max_idle_time(&self, max_idle_time: Duration) {
        let mut state = self.inner.state.lock().await;
        state.settings.max_idle_time = max_idle_time;
    }

    /// Number of worker processes currently enrolled
    pub async fn get_count(&self) -> u32 {
        self.inner.state.lock().await.count
    }

    /// Number of live sessions across all groups
    pub async fn get_active(&self) -> u32 {
        self.inner.state.lock().await.active
    }

    /// Number of callers waiting on the pool-wide queue
    pub async fn get_global_queue_size(&self) -> u32 {
        let state = self.inner.state.lock().await;
        state
            .global_waiters
            .iter()
            .filter(|w| !w.tx.is_closed())
            .count() as u32
    }

    /// Human-readable snapshot of the pool
    pub async fn inspect(&self) -> String {
        let state = self.inner.state.lock().await;
        let mut out = String::new();
        let _ = writeln!(out, "max = {}", state.settings.max);
        let _ = writeln!(out, "count = {}", state.count);
        let _ = writeln!(out, "active = {}", state.active);
        let _ = writeln!(
            out,
            "global queue size = {}",
            state.global_waiters.iter().filter(|w| !w.tx.is_closed()).count()
        );
        for (key, group) in &state.groups {
            let _ = writeln!(out);
            let _ = writeln!(out, "{}:", key);
            let _ = writeln!(out, "  App root: {}", group.options.app_root.display());
            let _ = writeln!(
                out,
                "  Active: {} / {} processes",
                group.active(),
                group.count()
            );
            if group.bad {
                let _ = writeln!(out, "  Flagged bad; spawning disabled until restart");
            }
            for handle in &group.handles {
                let _ = writeln!(
                    out,
                    "  * PID: {}   Sessions: {}   Processed: {}   Uptime: {}s",
                    handle.pid(),
                    handle.sessions(),
                    handle.processed(),
                    handle.uptime().as_secs()
                );
            }
        }
        out
    }

    /// Machine-readable snapshot. Listening endpoints and connect passwords
    /// are only included when `include_sensitive` is set.
    pub async fn to_xml(&self, include_sensitive: bool) -> String {
        let state = self.inner.state.lock().await;
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str("<info>\n");
        let _ = writeln!(out, "<max>{}</max>", state.settings.max);
        let _ = writeln!(out, "<count>{}</count>", state.count);
        let _ = writeln!(out, "<active>{}</active>", state.active);
        let _ = writeln!(
            out,
            "<global_queue_size>{}</global_queue_size>",
            state.global_waiters.iter().filter(|w| !w.tx.is_closed()).count()
        );
        out.push_str("<groups>\n");
        for (key, group) in &state.groups {
            out.push_str("<group>\n");
            let _ = writeln!(out, "<name>{}</name>", xml_escape(key));
            let _ = writeln!(
                out,
                "<app_root>{}</app_root>",
                xml_escape(&group.options.app_root.display().to_string())
            );
            let _ = writeln!(out, "<bad>{}</bad>", group.bad);
            out.push_str("<processes>\n");
            for handle in &group.handles {
                out.push_str("<process>\n");
                let _ = writeln!(out, "<pid>{}</pid>", handle.pid());
                let _ = writeln!(out, "<sessions>{}</sessions>", handle.sessions());
                let _ = writeln!(out, "<processed>{}</processed>", handle.processed());
                let _ = writeln!(out, "<uptime>{}s</uptime>", handle.uptime().as_secs());
                let _ = writeln!(
                    out,
                    "<last_used>{}s</last_used>",
                    handle.idle_for().as_secs()
                );
                if include_sensitive {
                    out.push_str("<server_sockets>\n<server_socket>\n");
                    let _ = writeln!(
                        out,
                        "<address>unix:{}</address>",
                        xml_escape(&handle.socket_path().display().to_string())
                    );
                    out.push_str("</server_socket>\n</server_sockets>\n");
                    let _ = writeln!(
                        out,
                        "<connect_password>{}</connect_password>",
                        xml_escape(handle.connect_password())
                    );
                }
                out.push_str("</process>\n");
            }
            out.push_str("</processes>\n</group>\n");
        }
        out.push_str("</groups>\n</info>\n");
        out
    }
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

impl PoolInner {
    /// One admission pass, executed under the pool lock
    fn admit(
        self: &Arc<Self>,
        state: &mut PoolState,
        key: &str,
        options: &PoolOptions,
        restart_done: bool,
        requeue_front: bool,
    ) -> AdmitOutcome {
        if !state.groups.contains_key(key) {
            debug!(app_group = %key, "creating application group");
            state.groups.insert(key.to_string(), Group::new(options));
        }
        if let Some(group) = state.groups.get_mut(key) {
            group.options = options.clone();
            group.restart.update_dir(options);
        }

        // A tolerated-but-deferred background spawn failure surfaces to the
        // next caller, which is us.
        if let Some(err) = state
            .groups
            .get_mut(key)
            .and_then(|group| group.pending_spawn_error.take())
        {
            return AdmitOutcome::Fail(PoolError::SpawnFailed {
                app_group: key.to_string(),
                source: err,
            });
        }

        if !restart_done {
            if let Some(group) = state.groups.get_mut(key) {
                if !group.rolling_restart_active && group.restart.should_restart() {
                    if options.rolling_restart && !group.handles.is_empty() {
                        group.rolling_restart_active = true;
                        group.epoch += 1;
                        group.bad = false;
                        group.pending_spawn_error = None;
                        return AdmitOutcome::Restart { rolling: true };
                    }
                    return AdmitOutcome::Restart { rolling: false };
                }
            }
        }

        // Lazy death detection: quietly drop idle processes whose pid is gone.
        let dead: Vec<u32> = state
            .groups
            .get(key)
            .map(|group| {
                group
                    .handles
                    .iter()
                    .filter(|h| h.sessions() == 0 && !h.is_alive())
                    .map(|h| h.pid())
                    .collect()
            })
            .unwrap_or_default();
        for pid in dead {
            info!(app_group = %key, pid, "worker process died, removing");
            self.remove_process(state, key, pid);
        }

        if let Some(handle) = state
            .groups
            .get(key)
            .and_then(|group| group.select_idle(options.sticky_session_id.as_deref()))
        {
            let checkout = self.checkout_handle(state, key, &handle);
            self.schedule_min_fill(state, key);
            return AdmitOutcome::Checked(checkout);
        }

        let (under_group_cap, bad) = match state.groups.get(key) {
            Some(group) => {
                let cap = group.effective_max(state.settings.max_per_app);
                (
                    cap == 0 || group.count() + group.spawns_in_flight < cap,
                    group.bad,
                )
            }
            None => (false, false),
        };

        if under_group_cap && !bad {
            if state.count + state.spawn_reservations < state.settings.max {
                return self.reserve_spawn(state, key);
            }
            if let Some((victim_group, victim_pid)) = find_eviction_candidate(&state.groups, key)
            {
                info!(
                    from_group = %victim_group,
                    pid = victim_pid,
                    for_group = %key,
                    "evicting idle worker to free a slot"
                );
                self.remove_process(state, &victim_group, victim_pid);
                return self.reserve_spawn(state, key);
            }
        }

        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            group: key.to_string(),
            tx,
        };
        if options.use_global_queue {
            debug!(app_group = %key, "waiting on global queue");
            if requeue_front {
                state.global_waiters.push_front(waiter);
            } else {
                state.global_waiters.push_back(waiter);
            }
        } else if let Some(group) = state.groups.get_mut(key) {
            debug!(app_group = %key, "waiting on group queue");
            if requeue_front {
                group.waiters.push_front(waiter);
            } else {
                group.waiters.push_back(waiter);
            }
        }
        AdmitOutcome::Wait(rx)
    }

    /// Take one capacity slot and tell the caller to spawn
    fn reserve_spawn(self: &Arc<Self>, state: &mut PoolState, key: &str) -> AdmitOutcome {
        state.spawn_reservations += 1;
        let epoch = match state.groups.get_mut(key) {
            Some(group) => {
                group.spawns_in_flight += 1;
                group.epoch
            }
            None => 0,
        };
        AdmitOutcome::Spawn { epoch }
    }

    /// Check a process out and build the session's release guard
    fn checkout_handle(
        self: &Arc<Self>,
        state: &mut PoolState,
        key: &str,
        handle: &Arc<ProcessHandle>,
    ) -> Checkout {
        let max_requests = state
            .groups
            .get(key)
            .map(|group| group.options.max_requests)
            .unwrap_or(0);
        handle.checkout(max_requests);
        state.active += 1;
        Checkout {
            handle: Arc::clone(handle),
            guard: ReleaseGuard {
                handle: Some(Arc::clone(handle)),
                group: key.to_string(),
                release_tx: self.release_tx.clone(),
                inner: Arc::downgrade(self),
            },
        }
    }

    /// One session came back; settle counters and hand the process onward
    fn release_process(
        self: &Arc<Self>,
        state: &mut PoolState,
        group_key: &str,
        handle: &Arc<ProcessHandle>,
    ) {
        let outcome = handle.release();
        let grace = state.settings.termination_grace;
        if !outcome.in_pool {
            // Detached or already retired; the pool's books were settled at
            // removal time.
            if outcome.sessions == 0 {
                handle.terminate(grace);
            }
            return;
        }
        state.active = state.active.saturating_sub(1);
        if outcome.retiring || !handle.is_alive() {
            self.remove_process(state, group_key, handle.pid());
            return;
        }
        self.dispatch_idle(state, group_key, handle);
        self.pump_waiters(state);
    }

    /// Remove one process from its group's books and terminate it once its
    /// sessions drain. Frees a capacity slot, so waiters are pumped.
    fn remove_process(self: &Arc<Self>, state: &mut PoolState, group_key: &str, pid: u32) {
        let Some(handle) = state
            .groups
            .get_mut(group_key)
            .and_then(|group| group.remove_handle(pid))
        else {
            return;
        };
        let running = handle.remove_from_pool();
        state.count = state.count.saturating_sub(1);
        state.active = state.active.saturating_sub(running);
        debug!(app_group = %group_key, pid, running, "worker process removed");
        if running == 0 {
            handle.terminate(state.settings.termination_grace);
        }
        self.pump_waiters(state);
    }

    /// Offer a now-idle process to queued callers: the group's own FIFO head
    /// first, then the first pool-wide waiter targeting this group.
    fn dispatch_idle(
        self: &Arc<Self>,
        state: &mut PoolState,
        key: &str,
        handle: &Arc<ProcessHandle>,
    ) {
        if !handle.is_idle() {
            return;
        }
        loop {
            let waiter = match state.groups.get_mut(key).and_then(|g| g.waiters.pop_front()) {
                Some(waiter) => waiter,
                None => break,
            };
            if waiter.tx.is_closed() {
                continue;
            }
            let checkout = self.checkout_handle(state, key, handle);
            // A failed send means the waiter was cancelled in the last
            // instant; the dropped checkout releases through the event
            // channel and the process is re-dispatched from there.
            let _ = waiter.tx.send(Wake::Ready(checkout));
            return;
        }
        let position = state
            .global_waiters
            .iter()
            .position(|w| w.group == key && !w.tx.is_closed());
        if let Some(position) = position {
            if let Some(waiter) = state.global_waiters.remove(position) {
                let checkout = self.checkout_handle(state, key, handle);
                let _ = waiter.tx.send(Wake::Ready(checkout));
            }
        }
    }

    /// Wake queue heads whose admission could now succeed
    fn pump_waiters(self: &Arc<Self>, state: &mut PoolState) {
        state.global_waiters.retain(|w| !w.tx.is_closed());
        for group in state.groups.values_mut() {
            group.waiters.retain(|w| !w.tx.is_closed());
        }

        if let Some(head_group) = state.global_waiters.front().map(|w| w.group.clone()) {
            let idle = state.groups.get(&head_group).and_then(|g| g.lru_idle());
            if let Some(handle) = idle {
                if let Some(waiter) = state.global_waiters.pop_front() {
                    let checkout = self.checkout_handle(state, &head_group, &handle);
                    let _ = waiter.tx.send(Wake::Ready(checkout));
                }
            } else if could_admit(state, &head_group) {
                if let Some(waiter) = state.global_waiters.pop_front() {
                    let _ = waiter.tx.send(Wake::Retry);
                }
            }
        }

        let waiting_groups: Vec<String> = state
            .groups
            .iter()
            .filter(|(_, g)| !g.waiters.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        for key in waiting_groups {
            let idle = state.groups.get(&key).and_then(|g| g.lru_idle());
            if let Some(handle) = idle {
                self.dispatch_idle(state, &key, &handle);
            } else if could_admit(state, &key) {
                if let Some(waiter) = state
                    .groups
                    .get_mut(&key)
                    .and_then(|g| g.waiters.pop_front())
                {
                    let _ = waiter.tx.send(Wake::Retry);
                }
            }
        }
    }

    /// Keep at least `min_processes` around by spawning in the background
    fn schedule_min_fill(self: &Arc<Self>, state: &mut PoolState, key: &str) {
        let (target, options) = match state.groups.get(key) {
            // A bad group stops spawning entirely until an explicit restart.
            Some(group) if !group.bad => {
                let cap = group.effective_max(state.settings.max_per_app);
                let mut target = group.options.min_processes;
                if cap > 0 {
                    target = target.min(cap);
                }
                (target, group.options.clone())
            }
            _ => return,
        };
        loop {
            let current = match state.groups.get(key) {
                Some(group) => group.count() + group.spawns_in_flight,
                None => return,
            };
            if current >= target {
                return;
            }
            if state.count + state.spawn_reservations >= state.settings.max {
                return;
            }
            state.spawn_reservations += 1;
            if let Some(group) = state.groups.get_mut(key) {
                group.spawns_in_flight += 1;
            }
            debug!(app_group = %key, "scheduling background spawn to reach minimum");
            let inner = Arc::clone(self);
            let task_key = key.to_string();
            let task_options = options.clone();
            tokio::spawn(async move {
                background_spawn(inner, task_key, task_options).await;
            });
        }
    }

    /// Retire every process of a group, then let admission spawn anew
    fn restart_group(self: &Arc<Self>, state: &mut PoolState, key: &str) {
        let grace = state.settings.termination_grace;
        let handles = match state.groups.get_mut(key) {
            Some(group) => {
                group.epoch += 1;
                group.bad = false;
                group.pending_spawn_error = None;
                std::mem::take(&mut group.handles)
            }
            None => return,
        };
        for handle in handles {
            let running = handle.remove_from_pool();
            state.count = state.count.saturating_sub(1);
            state.active = state.active.saturating_sub(running);
            info!(app_group = %key, pid = handle.pid(), "retiring worker for restart");
            if running == 0 {
                handle.terminate(grace);
            }
        }
        self.pump_waiters(state);
    }
}

/// Could a fresh admission for this group spawn right now?
fn could_admit(state: &PoolState, key: &str) -> bool {
    let Some(group) = state.groups.get(key) else {
        return false;
    };
    if group.bad {
        return false;
    }
    let cap = group.effective_max(state.settings.max_per_app);
    if cap != 0 && group.count() + group.spawns_in_flight >= cap {
        return false;
    }
    state.count + state.spawn_reservations < state.settings.max
        || find_eviction_candidate(&state.groups, key).is_some()
}

/// Pick the process another group gives up when the fleet is full: from the
/// group with the largest idle share, its least recently used idle process.
/// A pure function of the current group list.
fn find_eviction_candidate(
    groups: &IndexMap<String, Group>,
    requesting: &str,
) -> Option<(String, u32)> {
    let mut best: Option<(f64, tokio::time::Instant, String, u32)> = None;
    for (key, group) in groups {
        if key == requesting || group.count() == 0 {
            continue;
        }
        let Some(victim) = group.lru_idle() else {
            continue;
        };
        let ratio = group.idle_count() as f64 / group.count() as f64;
        let last_used = victim.last_used();
        let better = match &best {
            None => true,
            Some((best_ratio, best_last_used, _, _)) => {
                ratio > *best_ratio || (ratio == *best_ratio && last_used < *best_last_used)
            }
        };
        if better {
            best = Some((ratio, last_used, key.clone(), victim.pid()));
        }
    }
    best.map(|(_, _, key, pid)| (key, pid))
}

/// Spawn one process for a group without a caller attached
async fn background_spawn(inner: Arc<PoolInner>, key: String, options: PoolOptions) {
    let result = inner.spawner.spawn(&options).await;
    let mut state = inner.state.lock().await;
    let state = &mut *state;
    state.spawn_reservations = state.spawn_reservations.saturating_sub(1);
    let grace = state.settings.termination_grace;

    let enrolled = match state.groups.get_mut(&key) {
        None => {
            // Group vanished (cleared); don't leak the worker.
            if let Ok(spawned) = result {
                ProcessHandle::new(spawned, 0).terminate(grace);
            }
            None
        }
        Some(group) => {
            group.spawns_in_flight = group.spawns_in_flight.saturating_sub(1);
            match result {
                Ok(spawned) => {
                    let handle = ProcessHandle::new(spawned, group.epoch);
                    group.handles.push(Arc::clone(&handle));
                    Some(handle)
                }
                Err(err) => {
                    if group.options.ignore_spawn_errors {
                        group.bad = true;
                        if group.options.print_exceptions {
                            warn!(app_group = %key, error = %err, "background spawn failed; group flagged bad");
                        } else {
                            debug!(app_group = %key, error = %err, "background spawn failed; group flagged bad");
                        }
                    } else {
                        if group.options.print_exceptions {
                            warn!(app_group = %key, error = %err, "background spawn failed");
                        } else {
                            debug!(app_group = %key, error = %err, "background spawn failed");
                        }
                        group.pending_spawn_error = Some(err);
                    }
                    None
                }
            }
        }
    };

    if let Some(handle) = enrolled {
        state.count += 1;
        info!(app_group = %key, pid = handle.pid(), "background spawn completed");
        // A waiter already blocked wins over a get() arriving right now.
        inner.dispatch_idle(state, &key, &handle);
    }
    // Enrollment and a freed reservation both change what admission can do.
    inner.pump_waiters(state);
}

/// Replace a group's processes one at a time, keeping the old code serving
/// until each replacement is ready
async fn rolling_restart_task(inner: Arc<PoolInner>, key: String, options: PoolOptions) {
    info!(app_group = %key, "rolling restart started");
    inner.spawner.reload(&options.app_root).await;

    enum Step {
        Done,
        Saturated,
        Spawn,
    }

    loop {
        let step = {
            let mut state = inner.state.lock().await;
            let state = &mut *state;
            let stale = state
                .groups
                .get(&key)
                .map(|g| g.has_stale_handles())
                .unwrap_or(false);
            if !stale {
                if let Some(group) = state.groups.get_mut(&key) {
                    group.rolling_restart_active = false;
                }
                Step::Done
            } else {
                if state.count + state.spawn_reservations >= state.settings.max {
                    // No headroom for a side-by-side replacement; give up an
                    // idle old process first.
                    let victim = state
                        .groups
                        .get(&key)
                        .and_then(|g| g.stale_handle())
                        .filter(|h| h.is_idle());
                    if let Some(victim) = victim {
                        inner.remove_process(state, &key, victim.pid());
                    }
                }
                if state.count + state.spawn_reservations < state.settings.max {
                    state.spawn_reservations += 1;
                    if let Some(group) = state.groups.get_mut(&key) {
                        group.spawns_in_flight += 1;
                    }
                    Step::Spawn
                } else {
                    Step::Saturated
                }
            }
        };

        match step {
            Step::Done => break,
            Step::Saturated => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
            Step::Spawn => match inner.spawner.spawn(&options).await {
                Ok(spawned) => {
                    let mut state = inner.state.lock().await;
                    let state = &mut *state;
                    state.spawn_reservations = state.spawn_reservations.saturating_sub(1);
                    let grace = state.settings.termination_grace;
                    let handle = match state.groups.get_mut(&key) {
                        None => {
                            ProcessHandle::new(spawned, 0).terminate(grace);
                            None
                        }
                        Some(group) => {
                            group.spawns_in_flight = group.spawns_in_flight.saturating_sub(1);
                            let handle = ProcessHandle::new(spawned, group.epoch);
                            group.handles.push(Arc::clone(&handle));
                            Some(handle)
                        }
                    };
                    let Some(handle) = handle else {
                        inner.pump_waiters(state);
                        break;
                    };
                    state.count += 1;
                    info!(app_group = %key, pid = handle.pid(), "replacement ready, retiring one old worker");
                    let victim = state.groups.get(&key).and_then(|g| g.stale_handle());
                    if let Some(victim) = victim {
                        inner.remove_process(state, &key, victim.pid());
                    }
                    inner.dispatch_idle(state, &key, &handle);
                    inner.pump_waiters(state);
                }
                Err(err) => {
                    let mut state = inner.state.lock().await;
                    state.spawn_reservations = state.spawn_reservations.saturating_sub(1);
                    if let Some(group) = state.groups.get_mut(&key) {
                        group.spawns_in_flight = group.spawns_in_flight.saturating_sub(1);
                        group.rolling_restart_active = false;
                        if options.ignore_spawn_errors {
                            group.bad = true;
                            warn!(app_group = %key, error = %err, "rolling restart aborted; group flagged bad, old workers kept");
                        } else {
                            warn!(app_group = %key, error = %err, "rolling restart aborted");
                            group.pending_spawn_error = Some(err);
                        }
                    }
                    inner.pump_waiters(&mut state);
                    break;
                }
            },
        }
    }
    debug!(app_group = %key, "rolling restart finished");
}

/// Drains session release events; sessions drop their guard from arbitrary
/// tasks and this loop settles the pool's books for them
async fn release_loop(
    inner: Weak<PoolInner>,
    mut release_rx: mpsc::UnboundedReceiver<ReleaseEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = release_rx.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = inner.upgrade() else { break };
                let mut state = inner.state.lock().await;
                inner.release_process(&mut state, &event.group, &event.handle);
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Retires processes idle beyond `max_idle_time`, never shrinking a group
/// below its `min_processes`, and drops empty groups
async fn cleaner_loop(inner: Weak<PoolInner>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        let interval = match inner.upgrade() {
            Some(strong) => strong.state.lock().await.settings.cleaner_interval,
            None => break,
        };
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
        let Some(strong) = inner.upgrade() else { break };
        let mut state = strong.state.lock().await;
        clean_idle(&strong, &mut state);
    }
}

fn clean_idle(inner: &Arc<PoolInner>, state: &mut PoolState) {
    let max_idle = state.settings.max_idle_time;
    let keys: Vec<String> = state.groups.keys().cloned().collect();
    for key in keys {
        loop {
            let candidate = match state.groups.get(&key) {
                Some(group) if group.count() > group.options.min_processes => group
                    .lru_idle()
                    .filter(|handle| handle.idle_for() > max_idle),
                _ => None,
            };
            match candidate {
                Some(handle) => {
                    debug!(app_group = %key, pid = handle.pid(), "idle timeout, cleaning worker");
                    inner.remove_process(state, &key, handle.pid());
                }
                None => break,
            }
        }
        if state
            .groups
            .get(&key)
            .map(|group| group.deletable())
            .unwrap_or(false)
        {
            debug!(app_group = %key, "removing empty application group");
            state.groups.shift_remove(&key);
        }
    }
}
