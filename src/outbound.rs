//! Outbound byte buffering.
//!
//! All writes funnel through a [`WriteBuffer`] owned by the connection and
//! mutated only under the connection lock. The flusher task is the sole
//! writer to the socket: it takes the accumulated bytes out of the buffer and
//! writes them without holding the lock.
//!
//! While the connection is reconnecting the buffer switches to *pending*
//! mode: appends land in a separate pending-publish buffer capped at
//! `reconnect_buf_size`. On reconnect the pending bytes are handed to the
//! flusher before any post-reconnect append.

use crate::errors::{Error, Result};

/// Coalescing write buffer with a reconnect-window pending buffer.
#[derive(Debug)]
pub(crate) struct WriteBuffer {
    /// Bytes destined for the socket.
    active: Vec<u8>,
    /// Pending-publish buffer; `Some` only while reconnecting.
    pending: Option<Vec<u8>>,
    /// Cap for the pending buffer, from `Options::reconnect_buf_size`.
    pending_cap: usize,
    /// Monotonic generation stamped on every append; the flusher reports the
    /// generation it has written so `flush`/send-asap callers can wait for
    /// their bytes to reach the socket.
    appended_gen: u64,
}

impl WriteBuffer {
    pub(crate) fn new(pending_cap: usize) -> Self {
        Self {
            active: Vec::new(),
            pending: None,
            pending_cap,
            appended_gen: 0,
        }
    }

    /// Appends to the active buffer, or to the pending buffer while in
    /// pending mode. Returns the generation to wait on for socket delivery.
    ///
    /// A pending-mode append that would exceed the cap fails with
    /// `InsufficientBuffer` and leaves the buffer contents unchanged.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        match &mut self.pending {
            Some(pending) => {
                if pending.len() + bytes.len() > self.pending_cap {
                    return Err(Error::InsufficientBuffer);
                }
                pending.extend_from_slice(bytes);
            }
            None => self.active.extend_from_slice(bytes),
        }
        self.appended_gen += 1;
        Ok(self.appended_gen)
    }

    /// Switches to pending mode at the start of a reconnect window.
    ///
    /// Bytes already accepted but not yet taken by the flusher move into the
    /// pending buffer so their order relative to reconnect-window publishes
    /// is preserved. If they do not fit they are dropped: they were written
    /// by an at-most-once publisher that the disconnect already made
    /// best-effort.
    pub(crate) fn enter_pending(&mut self) {
        if self.pending.is_some() {
            return;
        }
        let carried = std::mem::take(&mut self.active);
        let mut pending = Vec::new();
        if carried.len() <= self.pending_cap {
            pending = carried;
        }
        self.pending = Some(pending);
    }

    /// Leaves pending mode, returning the buffered bytes. The caller must
    /// write them to the new socket before accepting new appends for it.
    pub(crate) fn take_pending(&mut self) -> Vec<u8> {
        self.pending.take().unwrap_or_default()
    }

    pub(crate) fn in_pending_mode(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, Vec::len)
    }

    /// Takes everything queued for the socket, plus the generation watermark
    /// the flusher should publish after a successful write.
    pub(crate) fn take_active(&mut self) -> (Vec<u8>, u64) {
        (std::mem::take(&mut self.active), self.appended_gen)
    }

    pub(crate) fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Generation of the most recent append.
    pub(crate) fn appended_gen(&self) -> u64 {
        self.appended_gen
    }
}
