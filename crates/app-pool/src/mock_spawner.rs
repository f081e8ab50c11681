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

//! Mock spawner for tests and examples
//!
//! Produces workers that are real OS processes (a parked `sleep`, so pids,
//! liveness probes and signals behave) while the session traffic is served by
//! an in-process Unix socket echo task: read the request frame until EOF,
//! write the configured body, close. Supports failure injection, a reload
//! log, and gating of spawns so restart rollouts can be observed mid-flight.

use crate::error::SpawnError;
use crate::options::PoolOptions;
use crate::spawner::{SpawnedProcess, Spawner};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::debug;

const DEFAULT_BODY: &[u8] = b"hello <b>world</b>";

struct MockState {
    /// Response body per app root; `DEFAULT_BODY` when unset
    bodies: HashMap<PathBuf, Vec<u8>>,
    /// App roots whose spawns fail, as if the app raised at boot
    broken: HashSet<PathBuf>,
    /// Every `reload` call, in order
    reload_log: Vec<PathBuf>,
}

/// Test double for the external process spawner
///
/// ## Examples
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use plexserve_app_pool::{MockSpawner, Pool, PoolOptions};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let spawner = Arc::new(MockSpawner::new());
/// spawner.set_body("/srv/apps/store", b"store body".to_vec());
/// let pool = Pool::new(spawner.clone());
/// let session = pool.get(PoolOptions::new("/srv/apps/store")).await?;
/// # drop(session);
/// # Ok(())
/// # }
/// ```
pub struct MockSpawner {
    state: Mutex<MockState>,
    socket_dir: PathBuf,
    spawn_count: AtomicU32,
    attempt_count: AtomicU32,
    hold_tx: watch::Sender<bool>,
    hold_rx: watch::Receiver<bool>,
}

impl Default for MockSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSpawner {
    /// Create a mock spawner with a fresh socket directory
    pub fn new() -> Self {
        let (hold_tx, hold_rx) = watch::channel(false);
        Self {
            state: Mutex::new(MockState {
                bodies: HashMap::new(),
                broken: HashSet::new(),
                reload_log: Vec::new(),
            }),
            socket_dir: std::env::temp_dir()
                .join(format!("plexserve-mock-{}", ulid::Ulid::new())),
            spawn_count: AtomicU32::new(0),
            attempt_count: AtomicU32::new(0),
            hold_tx,
            hold_rx,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Configure the body workers for this app root respond with
    pub fn set_body(&self, app_root: impl Into<PathBuf>, body: Vec<u8>) {
        self.state().bodies.insert(app_root.into(), body);
    }

    /// Make spawns for this app root fail, as a broken app would
    pub fn set_broken(&self, app_root: impl Into<PathBuf>, broken: bool) {
        let app_root = app_root.into();
        let mut state = self.state();
        if broken {
            state.broken.insert(app_root);
        } else {
            state.broken.remove(&app_root);
        }
    }

    /// Park all spawns until released; lets tests observe a rollout while the
    /// replacement is still "booting"
    pub fn hold_spawns(&self, hold: bool) {
        let _ = self.hold_tx.send(hold);
    }

    /// App roots `reload` has been called for, in call order
    pub fn reload_log(&self) -> Vec<PathBuf> {
        self.state().reload_log.clone()
    }

    /// Total successful spawns
    pub fn spawn_count(&self) -> u32 {
        self.spawn_count.load(Ordering::SeqCst)
    }

    /// Total spawn attempts, failures included
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::SeqCst)
    }
}

impl Drop for MockSpawner {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.socket_dir);
    }
}

#[async_trait]
impl Spawner for MockSpawner {
    async fn spawn(&self, options: &PoolOptions) -> Result<SpawnedProcess, SpawnError> {
        let mut hold_rx = self.hold_rx.clone();
        hold_rx
            .wait_for(|hold| !*hold)
            .await
            .map_err(|_| SpawnError::new("mock spawner shut down"))?;

        self.attempt_count.fetch_add(1, Ordering::SeqCst);
        let body = {
            let state = self.state();
            if state.broken.contains(&options.app_root) {
                return Err(SpawnError::new(format!(
                    "application at '{}' raised during boot",
                    options.app_root.display()
                )));
            }
            state
                .bodies
                .get(&options.app_root)
                .cloned()
                .unwrap_or_else(|| DEFAULT_BODY.to_vec())
        };

        std::fs::create_dir_all(&self.socket_dir)?;
        let socket_path = self
            .socket_dir
            .join(format!("{}.sock", ulid::Ulid::new()));
        let listener = UnixListener::bind(&socket_path)?;
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.into_split();
                    let mut frame = Vec::new();
                    // The request frame ends when the client half-closes.
                    let _ = reader.read_to_end(&mut frame).await;
                    let _ = writer.write_all(&body).await;
                    let _ = writer.shutdown().await;
                });
            }
        });

        // A parked real process, so the pool's pid bookkeeping, liveness
        // probes and termination signals all work against something genuine.
        let child = Command::new("sleep")
            .arg("86400")
            .kill_on_drop(true)
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| SpawnError::new("mock worker exited before it was enrolled"))?;

        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        debug!(pid, app_root = %options.app_root.display(), "mock worker spawned");
        Ok(SpawnedProcess {
            pid,
            socket_path,
            connect_password: ulid::Ulid::new().to_string(),
            child: Some(child),
        })
    }

    async fn reload(&self, app_root: &Path) {
        debug!(app_root = %app_root.display(), "mock reload");
        self.state().reload_log.push(app_root.to_path_buf());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_produces_a_live_worker() {
        let spawner = MockSpawner::new();
        let spawned = spawner
            .spawn(&PoolOptions::new("/srv/apps/blog"))
            .await
            .unwrap();
        assert!(spawned.pid > 0);
        assert!(spawned.socket_path.exists());
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn broken_root_fails_to_spawn() {
        let spawner = MockSpawner::new();
        spawner.set_broken("/srv/apps/blog", true);
        let result = spawner.spawn(&PoolOptions::new("/srv/apps/blog")).await;
        assert!(result.is_err());

        spawner.set_broken("/srv/apps/blog", false);
        assert!(spawner.spawn(&PoolOptions::new("/srv/apps/blog")).await.is_ok());
    }

    #[tokio::test]
    async fn reload_is_logged() {
        let spawner = MockSpawner::new();
        spawner.reload(Path::new("/srv/apps/blog")).await;
        assert_eq!(
            spawner.reload_log(),
            vec![PathBuf::from("/srv/apps/blog")]
        );
    }
}
