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

//! End-to-end pool behavior against the mock spawner
//!
//! ## Test Scenarios
//! - Session round-trips and release accounting
//! - Process reuse, per-group isolation, capacity queueing and eviction
//! - Global queue mode, detach, sticky sessions
//! - Minimum process fill and idle cleanup
//! - Sessions outliving pool shutdown

use plexserve_app_pool::{MockSpawner, Pool, PoolOptions, PoolSettings, Session};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Poll an async condition until it holds or the deadline passes.
macro_rules! eventually {
    ($cond:expr) => {
        eventually!($cond, 5000)
    };
    ($cond:expr, $timeout_ms:expr) => {{
        let deadline = std::time::Instant::now() + Duration::from_millis($timeout_ms);
        loop {
            if $cond {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "condition not met in time: {}",
                stringify!($cond)
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }};
}

fn test_pool(max: u32) -> (Pool, Arc<MockSpawner>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let spawner = Arc::new(MockSpawner::new());
    let settings = PoolSettings {
        max,
        ..PoolSettings::default()
    };
    (Pool::with_settings(spawner.clone(), settings), spawner)
}

/// A fake app root with the conventional `tmp/` marker directory
fn app_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
    dir
}

async fn roundtrip(session: &mut Session) -> Vec<u8> {
    let password = session.connect_password();
    session
        .send_headers(&[
            ("REQUEST_METHOD", "GET"),
            ("QUERY_STRING", ""),
            ("PATH_INFO", "/"),
            ("REMOTE_ADDR", "localhost"),
            ("PASSENGER_CONNECT_PASSWORD", &password),
        ])
        .await
        .unwrap();
    session.shutdown_writer().await.unwrap();
    session.read_to_end().await.unwrap()
}

#[tokio::test]
async fn session_roundtrip_releases_one_active() {
    let (pool, spawner) = test_pool(6);
    let dir = app_dir();
    spawner.set_body(dir.path(), b"hello <b>world</b>".to_vec());

    let mut session = pool.get(PoolOptions::new(dir.path())).await.unwrap();
    assert_eq!(pool.get_active().await, 1);
    assert_eq!(pool.get_count().await, 1);

    let body = roundtrip(&mut session).await;
    assert_eq!(body, b"hello <b>world</b>");
    session.close().await;

    assert_eq!(pool.get_active().await, 0);
    assert_eq!(pool.get_count().await, 1);
}

#[tokio::test]
async fn a_released_process_is_reused() {
    let (pool, spawner) = test_pool(6);
    let dir = app_dir();

    let first = pool.get(PoolOptions::new(dir.path())).await.unwrap();
    let pid = first.pid();
    first.close().await;

    let second = pool.get(PoolOptions::new(dir.path())).await.unwrap();
    assert_eq!(second.pid(), pid);
    assert_eq!(pool.get_count().await, 1);
    assert_eq!(spawner.spawn_count(), 1);
    second.close().await;
}

#[tokio::test]
async fn distinct_groups_get_distinct_processes() {
    let (pool, spawner) = test_pool(6);
    let dir_a = app_dir();
    let dir_b = app_dir();
    spawner.set_body(dir_a.path(), b"app a".to_vec());
    spawner.set_body(dir_b.path(), b"app b".to_vec());

    let mut session_a = pool.get(PoolOptions::new(dir_a.path())).await.unwrap();
    let mut session_b = pool.get(PoolOptions::new(dir_b.path())).await.unwrap();
    assert_ne!(session_a.pid(), session_b.pid());
    assert_eq!(pool.get_active().await, 2);
    assert_eq!(pool.get_count().await, 2);

    assert_eq!(roundtrip(&mut session_a).await, b"app a");
    assert_eq!(roundtrip(&mut session_b).await, b"app b");

    session_a.close().await;
    session_b.close().await;
    assert_eq!(pool.get_active().await, 0);
    assert_eq!(pool.get_count().await, 2);
}

#[tokio::test]
async fn full_pool_queues_until_a_release() {
    let (pool, _spawner) = test_pool(2);
    let dir_a = app_dir();
    let dir_b = app_dir();
    let dir_c = app_dir();

    let session_a = pool.get(PoolOptions::new(dir_a.path())).await.unwrap();
    let session_b = pool.get(PoolOptions::new(dir_b.path())).await.unwrap();
    assert_eq!(pool.get_count().await, 2);

    let done = Arc::new(AtomicBool::new(false));
    let waiter = {
        let pool = pool.clone();
        let root = dir_c.path().to_path_buf();
        let done = done.clone();
        tokio::spawn(async move {
            let session = pool.get(PoolOptions::new(root)).await.unwrap();
            done.store(true, Ordering::SeqCst);
            session
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!done.load(Ordering::SeqCst), "get must wait while the pool is full");
    assert_eq!(pool.get_count().await, 2);

    session_a.close().await;
    let session_c = waiter.await.unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(pool.get_count().await, 2);
    assert_eq!(pool.get_active().await, 2);

    session_b.close().await;
    session_c.close().await;
}

#[tokio::test]
async fn an_idle_process_is_evicted_for_another_group() {
    let (pool, _spawner) = test_pool(2);
    let dir_a = app_dir();
    let dir_b = app_dir();

    // Two processes for group a, then both idle.
    let first = pool.get(PoolOptions::new(dir_a.path())).await.unwrap();
    let second = pool.get(PoolOptions::new(dir_a.path())).await.unwrap();
    assert_eq!(pool.get_count().await, 2);
    first.close().await;
    second.close().await;
    assert_eq!(pool.get_active().await, 0);

    // A full pool with idle slack gives one up instead of queueing.
    let session_b = pool.get(PoolOptions::new(dir_b.path())).await.unwrap();
    assert_eq!(pool.get_count().await, 2);
    assert_eq!(pool.get_active().await, 1);
    session_b.close().await;
}

#[tokio::test]
async fn request_ceiling_replaces_the_process() {
    let (pool, _spawner) = test_pool(6);
    let dir = app_dir();
    let options = PoolOptions {
        max_requests: 4,
        ..PoolOptions::new(dir.path())
    };

    let first = pool.get(options.clone()).await.unwrap();
    let original = first.pid();
    first.close().await;

    for _ in 0..3 {
        let session = pool.get(options.clone()).await.unwrap();
        assert_eq!(session.pid(), original);
        session.close().await;
    }

    // Four sessions served; the process retired on the last release.
    assert_eq!(pool.get_count().await, 0);
    let fifth = pool.get(options.clone()).await.unwrap();
    assert_ne!(fifth.pid(), original);
    fifth.close().await;
}

#[tokio::test]
async fn global_queue_blocks_and_drains() {
    let (pool, _spawner) = test_pool(1);
    let dir = app_dir();
    let options = PoolOptions {
        use_global_queue: true,
        ..PoolOptions::new(dir.path())
    };

    let held = pool.get(options.clone()).await.unwrap();
    let held_pid = held.pid();

    let done = Arc::new(AtomicBool::new(false));
    let waiter = {
        let pool = pool.clone();
        let options = options.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let session = pool.get(options).await.unwrap();
            done.store(true, Ordering::SeqCst);
            session
        })
    };

    eventually!(pool.get_global_queue_size().await == 1);
    assert!(!done.load(Ordering::SeqCst));
    assert_eq!(pool.get_active().await, 1);
    assert_eq!(pool.get_count().await, 1);

    held.close().await;
    let session = waiter.await.unwrap();
    assert_eq!(session.pid(), held_pid);
    assert_eq!(pool.get_global_queue_size().await, 0);
    session.close().await;
}

#[tokio::test]
async fn detach_removes_a_process_exactly_once() {
    let (pool, _spawner) = test_pool(6);
    let dir = app_dir();

    let busy = pool.get(PoolOptions::new(dir.path())).await.unwrap();
    let second = pool.get(PoolOptions::new(dir.path())).await.unwrap();
    let idle_key = second.detach_key();
    second.close().await;
    assert_eq!(pool.get_count().await, 2);
    assert_eq!(pool.get_active().await, 1);

    // Detaching the idle process leaves the active count alone.
    assert!(pool.detach(&idle_key).await);
    assert_eq!(pool.get_count().await, 1);
    assert_eq!(pool.get_active().await, 1);

    // Same key again is a no-op.
    assert!(!pool.detach(&idle_key).await);
    assert_eq!(pool.get_count().await, 1);

    // Detaching the busy process drops it from the books while its session
    // keeps running.
    assert!(pool.detach(&busy.detach_key()).await);
    assert_eq!(pool.get_count().await, 0);
    assert_eq!(pool.get_active().await, 0);
    busy.close().await;
}

#[tokio::test]
async fn sticky_session_prefers_the_tagged_process() {
    let (pool, _spawner) = test_pool(6);
    let dir = app_dir();

    let tagged = pool.get(PoolOptions::new(dir.path())).await.unwrap();
    let other = pool.get(PoolOptions::new(dir.path())).await.unwrap();
    let tagged_pid = tagged.pid();
    let other_pid = other.pid();
    tagged.set_sticky_session_id("1234");

    // Release the untagged one first so plain selection would prefer it.
    other.close().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    tagged.close().await;

    let sticky = pool
        .get(PoolOptions {
            sticky_session_id: Some("1234".into()),
            ..PoolOptions::new(dir.path())
        })
        .await
        .unwrap();
    assert_eq!(sticky.pid(), tagged_pid);
    sticky.close().await;

    // An unknown tag falls back to normal selection.
    let fallback = pool
        .get(PoolOptions {
            sticky_session_id: Some("9999".into()),
            ..PoolOptions::new(dir.path())
        })
        .await
        .unwrap();
    assert_eq!(fallback.pid(), other_pid);
    fallback.close().await;
}

#[tokio::test]
async fn minimum_processes_fill_in_the_background() {
    let (pool, _spawner) = test_pool(6);
    let dir = app_dir();
    let options = PoolOptions {
        min_processes: 3,
        ..PoolOptions::new(dir.path())
    };

    let session = pool.get(options).await.unwrap();
    assert_eq!(pool.get_active().await, 1);
    eventually!(pool.get_count().await == 3);
    session.close().await;
}

#[tokio::test]
async fn idle_cleanup_never_goes_below_the_minimum() {
    let (pool, _spawner) = test_pool(6);
    let dir = app_dir();
    let options = PoolOptions {
        min_processes: 2,
        ..PoolOptions::new(dir.path())
    };

    // Scale the group up to 3 busy processes.
    let s1 = pool.get(options.clone()).await.unwrap();
    eventually!(pool.get_count().await == 2);
    let s2 = pool.get(options.clone()).await.unwrap();
    let s3 = pool.get(options.clone()).await.unwrap();
    eventually!(pool.get_count().await == 3);

    pool.set_max_idle_time(Duration::from_millis(100)).await;
    s1.close().await;
    s2.close().await;
    s3.close().await;

    eventually!(pool.get_count().await == 2);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(pool.get_count().await, 2, "cleanup must respect min_processes");
}

#[tokio::test]
async fn idle_cleanup_empties_groups_without_a_minimum() {
    let (pool, _spawner) = test_pool(6);
    let dir = app_dir();

    let session = pool.get(PoolOptions::new(dir.path())).await.unwrap();
    pool.set_max_idle_time(Duration::from_millis(100)).await;
    session.close().await;

    eventually!(pool.get_count().await == 0);
}

#[tokio::test]
async fn sessions_survive_pool_clear() {
    let (pool, spawner) = test_pool(6);
    let dir = app_dir();
    spawner.set_body(dir.path(), b"still here".to_vec());

    let mut session = pool.get(PoolOptions::new(dir.path())).await.unwrap();
    pool.clear().await;
    assert_eq!(pool.get_count().await, 0);
    assert_eq!(pool.get_active().await, 0);
    drop(pool);

    // The session owns its stream and its process reference.
    assert_eq!(roundtrip(&mut session).await, b"still here");
    session.close().await;
}

#[tokio::test]
async fn clear_wakes_waiters_with_an_error() {
    let (pool, _spawner) = test_pool(1);
    let dir_a = app_dir();
    let dir_b = app_dir();

    let held = pool.get(PoolOptions::new(dir_a.path())).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        let root = dir_b.path().to_path_buf();
        tokio::spawn(async move { pool.get(PoolOptions::new(root)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    pool.clear().await;
    let result = waiter.await.unwrap();
    assert!(matches!(
        result,
        Err(plexserve_app_pool::PoolError::PoolClosed)
    ));
    held.close().await;
}

#[tokio::test]
async fn a_dead_process_is_replaced_silently() {
    let (pool, _spawner) = test_pool(6);
    let dir = app_dir();

    let session = pool.get(PoolOptions::new(dir.path())).await.unwrap();
    let pid = session.pid();
    session.close().await;

    // Kill the worker behind the pool's back.
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let replacement = pool.get(PoolOptions::new(dir.path())).await.unwrap();
    assert_ne!(replacement.pid(), pid);
    assert_eq!(pool.get_count().await, 1);
    replacement.close().await;
}

#[tokio::test]
async fn inspection_reports_processes() {
    let (pool, _spawner) = test_pool(6);
    let dir = app_dir();
    let session = pool.get(PoolOptions::new(dir.path())).await.unwrap();

    let text = pool.inspect().await;
    assert!(text.contains("max = 6"), "inspect output:\n{text}");
    assert!(text.contains(&format!("PID: {}", session.pid())));

    let xml = pool.to_xml(true).await;
    assert!(xml.contains("<process>"));
    assert!(xml.contains(&format!("<pid>{}</pid>", session.pid())));
    assert!(xml.contains("<last_used>"));
    assert!(xml.contains("<server_sockets>"));
    assert!(xml.contains("<connect_password>"));

    let xml = pool.to_xml(false).await;
    assert!(xml.contains(&format!("<pid>{}</pid>", session.pid())));
    assert!(!xml.contains("<server_sockets>"));
    assert!(!xml.contains("<connect_password>"));

    session.close().await;
}

#[tokio::test]
async fn raising_the_cap_unblocks_a_global_waiter() {
    let (pool, _spawner) = test_pool(1);
    let dir_a = app_dir();
    let dir_b = app_dir();

    let held = pool.get(PoolOptions::new(dir_a.path())).await.unwrap();
    let options_b = PoolOptions {
        use_global_queue: true,
        ..PoolOptions::new(dir_b.path())
    };
    let waiter = {
        let pool = pool.clone();
        let options = options_b.clone();
        tokio::spawn(async move { pool.get(options).await })
    };
    eventually!(pool.get_global_queue_size().await == 1);

    pool.set_max(2).await;
    let session = waiter.await.unwrap().unwrap();
    assert_eq!(pool.get_count().await, 2);
    session.close().await;
    held.close().await;
}
