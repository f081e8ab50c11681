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

//! Filesystem restart markers
//!
//! Deployments ask for a reload by touching `restart.txt` (one-shot,
//! mtime-tracked) or keeping `always_restart.txt` around (restart on every
//! admission). Both are honored whether they are files or directories, and
//! the pool never deletes either of them.

use crate::options::PoolOptions;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

const RESTART_FILE: &str = "restart.txt";
const ALWAYS_RESTART_FILE: &str = "always_restart.txt";

/// Per-group snapshot of the restart markers
///
/// Lives on the group so recorded mtimes survive across admissions. A marker
/// that already exists when the group is created does not trigger (there is
/// nothing to restart yet); it triggers once its mtime moves, or when it
/// appears somewhere the group has looked before. Callers may move the
/// marker directory between requests; each consulted path keeps its own
/// recorded state.
#[derive(Debug)]
pub(crate) struct RestartTracker {
    restart_dir: PathBuf,
    /// Marker paths this group has consulted: `Some(mtime)` when last seen
    /// present, `None` when last seen absent
    seen: HashMap<PathBuf, Option<SystemTime>>,
}

fn marker_mtime(path: &Path) -> Option<SystemTime> {
    // A directory counts as a marker too.
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

impl RestartTracker {
    pub(crate) fn new(options: &PoolOptions) -> Self {
        let restart_dir = options.resolved_restart_dir();
        let marker = restart_dir.join(RESTART_FILE);
        let mut seen = HashMap::new();
        seen.insert(marker.clone(), marker_mtime(&marker));
        Self { restart_dir, seen }
    }

    /// Follow the marker directory the latest caller asked for
    pub(crate) fn update_dir(&mut self, options: &PoolOptions) {
        self.restart_dir = options.resolved_restart_dir();
    }

    /// Decide whether the group must be restarted now. Consumes one-shot
    /// triggers by recording the observed mtime; never touches the markers
    /// themselves.
    pub(crate) fn should_restart(&mut self) -> bool {
        if self.restart_dir.join(ALWAYS_RESTART_FILE).exists() {
            debug!(dir = %self.restart_dir.display(), "always-restart marker present");
            return true;
        }

        let marker = self.restart_dir.join(RESTART_FILE);
        let current = marker_mtime(&marker);
        let previous = self.seen.insert(marker, current);
        let triggered = match (previous, current) {
            (_, None) => false,
            // First time this path is consulted and the marker is there.
            (None, Some(_)) => true,
            // Appeared since the last check.
            (Some(None), Some(_)) => true,
            (Some(Some(recorded)), Some(mtime)) => mtime > recorded,
        };
        if triggered {
            debug!(dir = %self.restart_dir.display(), "restart marker triggered");
        }
        triggered
    }
}
