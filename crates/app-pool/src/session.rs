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

//! One in-flight request against one worker process

use crate::error::PoolResult;
use crate::pool::{Checkout, ReleaseGuard};
use crate::process::ProcessHandle;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// A checked-out request slot on a worker process
///
/// ## Purpose
/// Obtained from [`Pool::get`](crate::Pool::get). The session owns its
/// connection to the worker and a strong reference to the process handle, so
/// it stays usable even after the pool is cleared or dropped.
///
/// ## Wire contract
/// The caller writes a CGI-style header frame (null-terminated NAME, VALUE
/// pairs, including `PASSENGER_CONNECT_PASSWORD` echoing
/// [`connect_password`](Session::connect_password)), optionally a body, then
/// half-closes with [`shutdown_writer`](Session::shutdown_writer) and reads
/// the response until EOF. The pool forwards the frame blindly; it never
/// parses HTTP.
///
/// ## Release
/// Dropping the session returns the slot to the pool and wakes at most one
/// waiter. [`close`](Session::close) does the same synchronously, which makes
/// `active` counts deterministic for the caller.
pub struct Session {
    handle: Arc<ProcessHandle>,
    guard: ReleaseGuard,
    stream: Option<UnixStream>,
}

impl Session {
    pub(crate) fn new(checkout: Checkout) -> Self {
        let (handle, guard) = checkout.into_parts();
        Self {
            handle,
            guard,
            stream: None,
        }
    }

    /// Pid of the worker process serving this session
    pub fn pid(&self) -> u32 {
        self.handle.pid()
    }

    /// Key with which [`Pool::detach`](crate::Pool::detach) can remove this
    /// session's worker
    pub fn detach_key(&self) -> String {
        self.handle.detach_key().to_string()
    }

    /// Secret the header frame must echo in `PASSENGER_CONNECT_PASSWORD`
    pub fn connect_password(&self) -> String {
        self.handle.connect_password().to_string()
    }

    /// Tag this session's worker so later requests carrying the same
    /// `sticky_session_id` prefer it
    pub fn set_sticky_session_id(&self, id: &str) {
        self.handle.set_sticky_session_id(id);
    }

    async fn stream(&mut self) -> PoolResult<&mut UnixStream> {
        if self.stream.is_none() {
            match UnixStream::connect(self.handle.socket_path()).await {
                Ok(stream) => self.stream = Some(stream),
                Err(err) => {
                    // The worker is unreachable; make sure the pool stops
                    // handing it out.
                    self.handle.mark_defunct();
                    return Err(err.into());
                }
            }
        }
        self.stream.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "session not connected").into()
        })
    }

    /// Encode and forward a CGI-style header frame
    pub async fn send_headers(&mut self, headers: &[(&str, &str)]) -> PoolResult<()> {
        let mut frame = Vec::new();
        for (name, value) in headers {
            frame.extend_from_slice(name.as_bytes());
            frame.push(0);
            frame.extend_from_slice(value.as_bytes());
            frame.push(0);
        }
        self.send_raw(&frame).await
    }

    /// Forward pre-encoded bytes to the worker
    pub async fn send_raw(&mut self, bytes: &[u8]) -> PoolResult<()> {
        let stream = self.stream().await?;
        stream.write_all(bytes).await?;
        Ok(())
    }

    /// Half-close the connection; the worker sees EOF and starts responding
    pub async fn shutdown_writer(&mut self) -> PoolResult<()> {
        let stream = self.stream().await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Read the worker's response until it closes the connection
    pub async fn read_to_end(&mut self) -> PoolResult<Vec<u8>> {
        let stream = self.stream().await?;
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await?;
        Ok(body)
    }

    /// Close the session and release its slot before returning. Dropping the
    /// session releases as well, but asynchronously.
    pub async fn close(self) {
        let Session { guard, stream, .. } = self;
        drop(stream);
        guard.release_now().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pid", &self.handle.pid())
            .field("connected", &self.stream.is_some())
            .finish()
    }
}
