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

//! Error types for the application pool

use std::io;

/// Error returned by the spawner when a worker process could not be produced.
///
/// Kept as a plain message so it can be recorded on a group and surfaced to a
/// later `get()` without holding a non-clonable error source.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SpawnError {
    /// Human-readable description of the spawn failure
    pub message: String,
}

impl SpawnError {
    /// Create a spawn error from any displayable cause
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<io::Error> for SpawnError {
    fn from(err: io::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Errors surfaced by [`Pool`](crate::Pool) operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A worker process could not be spawned for the given application group
    #[error("could not spawn application process for '{app_group}': {source}")]
    SpawnFailed {
        /// Group the spawn was attempted for
        app_group: String,
        /// Underlying spawner error
        #[source]
        source: SpawnError,
    },

    /// The pool was cleared or shut down while the caller was waiting
    #[error("application pool is shutting down")]
    PoolClosed,

    /// I/O failure on a session stream
    #[error("session I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience alias used throughout the crate
pub type PoolResult<T> = Result<T, PoolError>;
