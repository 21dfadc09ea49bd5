//! Session state machine. Exactly one scan or refine may be active per
//! engine instance; the slot is claimed with an atomic test-and-set, so
//! a losing `start*` race can never observe a stale state.

use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio_util::sync::CancellationToken;

use super::shared_buffer::SearchStatus;

/// Final accounting of a scan or refine pass, retained after every
/// terminal transition and delivered once on the completion channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub status: SearchStatus,
    pub total_found: u64,
    pub total_regions: usize,
    pub elapsed_millis: u64,
}

pub struct SearchSession {
    status: AtomicI32,
    cancel_token: Mutex<Option<CancellationToken>>,
    completion: Mutex<Option<(Sender<SessionSummary>, Receiver<SessionSummary>)>>,
    last_summary: Mutex<Option<SessionSummary>>,
}

impl SearchSession {
    pub fn new() -> Self {
        Self {
            status: AtomicI32::new(SearchStatus::Idle as i32),
            cancel_token: Mutex::new(None),
            completion: Mutex::new(None),
            last_summary: Mutex::new(None),
        }
    }

    /// Claims the single search slot. Returns the fresh cancellation
    /// token on success, `None` if a session is already `Searching`.
    pub fn try_begin(&self) -> Option<CancellationToken> {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if current == SearchStatus::Searching as i32 {
                return None;
            }
            match self.status.compare_exchange(
                current,
                SearchStatus::Searching as i32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let token = CancellationToken::new();
        if let Ok(mut slot) = self.cancel_token.lock() {
            *slot = Some(token.clone());
        }
        if let Ok(mut slot) = self.completion.lock() {
            *slot = Some(bounded(1));
        }
        Some(token)
    }

    /// Records the terminal transition. The summary is stashed before
    /// the status word flips, so a poller that observes a terminal
    /// status always finds the matching summary.
    pub fn finish(&self, summary: SessionSummary) {
        if let Ok(mut slot) = self.last_summary.lock() {
            *slot = Some(summary);
        }
        self.status.store(summary.status as i32, Ordering::Release);
        if let Ok(mut slot) = self.cancel_token.lock() {
            *slot = None;
        }
        if let Ok(slot) = self.completion.lock()
            && let Some((tx, _)) = slot.as_ref()
        {
            let _ = tx.try_send(summary);
        }
    }

    #[inline]
    pub fn status(&self) -> SearchStatus {
        SearchStatus::from_i32(self.status.load(Ordering::Acquire)).unwrap_or(SearchStatus::Idle)
    }

    #[inline]
    pub fn is_searching(&self) -> bool {
        self.status.load(Ordering::Acquire) == SearchStatus::Searching as i32
    }

    /// Cooperative cancel. No-op unless a session is active; the caller
    /// polls for the `Cancelled` transition rather than assuming one.
    pub fn request_cancel(&self) {
        if !self.is_searching() {
            return;
        }
        if let Ok(slot) = self.cancel_token.lock()
            && let Some(token) = slot.as_ref()
        {
            token.cancel();
        }
    }

    /// Receiver for the current session's terminal summary. The message
    /// stays buffered until read, so subscribing after completion still
    /// delivers it.
    pub fn completion_receiver(&self) -> Option<Receiver<SessionSummary>> {
        self.completion
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|(_, rx)| rx.clone()))
    }

    pub fn last_summary(&self) -> Option<SessionSummary> {
        self.last_summary.lock().ok().and_then(|slot| *slot)
    }
}

impl Default for SearchSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(status: SearchStatus, found: u64) -> SessionSummary {
        SessionSummary {
            status,
            total_found: found,
            total_regions: 1,
            elapsed_millis: 10,
        }
    }

    #[test]
    fn test_single_flight_test_and_set() {
        let session = SearchSession::new();
        let token = session.try_begin();
        assert!(token.is_some());
        assert!(session.is_searching());
        // Second claim loses while the first is active.
        assert!(session.try_begin().is_none());

        session.finish(summary(SearchStatus::Completed, 3));
        assert!(!session.is_searching());
        assert_eq!(session.status(), SearchStatus::Completed);
        // Terminal states reset implicitly on the next claim.
        assert!(session.try_begin().is_some());
    }

    #[test]
    fn test_cancel_propagates_to_token() {
        let session = SearchSession::new();
        let token = session.try_begin().unwrap();
        assert!(!token.is_cancelled());
        session.request_cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_is_noop_when_idle() {
        let session = SearchSession::new();
        session.request_cancel();
        assert_eq!(session.status(), SearchStatus::Idle);
    }

    #[test]
    fn test_summary_retained_and_delivered() {
        let session = SearchSession::new();
        session.try_begin().unwrap();
        let rx = session.completion_receiver().unwrap();
        session.finish(summary(SearchStatus::Cancelled, 7));

        let delivered = rx.recv().unwrap();
        assert_eq!(delivered.status, SearchStatus::Cancelled);
        assert_eq!(delivered.total_found, 7);
        assert_eq!(session.last_summary(), Some(delivered));
    }

    #[test]
    fn test_receiver_subscribed_after_finish_still_delivers() {
        let session = SearchSession::new();
        session.try_begin().unwrap();
        session.finish(summary(SearchStatus::Completed, 1));
        let rx = session.completion_receiver().unwrap();
        assert_eq!(rx.recv().unwrap().total_found, 1);
    }
}
