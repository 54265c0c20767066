//! Request multiplexer: maps correlation ids to pending completions.
//!
//! Mutated only by request submission and the transport's read loop. A
//! completion fires on a matching response frame, a typed error frame, a
//! request timeout (the submitter abandons the entry), or transport
//! teardown (`fail_all`).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use lwp_wire::{Frame, Opcode};
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{ClientError, Result};

struct Pending {
    opcode: Opcode,
    submitted_at: Instant,
    tx: oneshot::Sender<Result<Frame>>,
}

#[derive(Default)]
pub(crate) struct Multiplexer {
    inner: Mutex<HashMap<u64, Pending>>,
}

impl Multiplexer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Pending>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a pending completion for `correlation_id`.
    pub(crate) fn register(
        &self,
        correlation_id: u64,
        opcode: Opcode,
    ) -> oneshot::Receiver<Result<Frame>> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            correlation_id,
            Pending {
                opcode,
                submitted_at: Instant::now(),
                tx,
            },
        );
        rx
    }

    /// Route a response frame to its pending completion.
    ///
    /// Returns false when no completion is registered for the id. An
    /// abandoned completion (receiver dropped) still counts as routed; the
    /// late response is discarded.
    pub(crate) fn complete(&self, correlation_id: u64, frame: Frame) -> bool {
        let pending = self.lock().remove(&correlation_id);
        match pending {
            Some(p) => {
                trace!(
                    correlation_id,
                    opcode = ?p.opcode,
                    elapsed_us = p.submitted_at.elapsed().as_micros() as u64,
                    "completing request"
                );
                let _ = p.tx.send(Ok(frame));
                true
            }
            None => false,
        }
    }

    /// Drop the pending entry for an abandoned request.
    pub(crate) fn abandon(&self, correlation_id: u64) {
        self.lock().remove(&correlation_id);
    }

    /// Fail every pending completion, e.g. on transport teardown.
    pub(crate) fn fail_all(&self, make_err: impl Fn() -> ClientError) {
        let drained: Vec<Pending> = self.lock().drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending.tx.send(Err(make_err()));
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_routes_to_registered_receiver() {
        let mux = Multiplexer::new();
        let rx = mux.register(7, Opcode::Fetch);

        assert!(mux.complete(7, Frame::new(Opcode::FetchResp, 7)));
        let frame = rx.await.unwrap().unwrap();
        assert_eq!(frame.correlation_id, 7);
        assert!(mux.is_empty());
    }

    #[test]
    fn unknown_correlation_is_not_routed() {
        let mux = Multiplexer::new();
        assert!(!mux.complete(99, Frame::new(Opcode::Pong, 99)));
    }

    #[test]
    fn abandoned_completion_still_routes() {
        let mux = Multiplexer::new();
        let rx = mux.register(3, Opcode::Ping);
        drop(rx);
        // Late response is drained and discarded, not treated as unknown.
        assert!(mux.complete(3, Frame::new(Opcode::Pong, 3)));
        assert!(mux.is_empty());
    }

    #[tokio::test]
    async fn fail_all_drains_every_pending() {
        let mux = Multiplexer::new();
        let rx1 = mux.register(1, Opcode::Produce);
        let rx2 = mux.register(2, Opcode::Fetch);
        assert_eq!(mux.len(), 2);

        mux.fail_all(|| ClientError::Connection(std::io::Error::other("connection lost")));
        assert!(mux.is_empty());

        let e1 = rx1.await.unwrap().unwrap_err();
        let e2 = rx2.await.unwrap().unwrap_err();
        assert!(e1.is_retryable());
        assert!(e2.is_retryable());
    }

    #[test]
    fn abandon_removes_entry() {
        let mux = Multiplexer::new();
        let _rx = mux.register(5, Opcode::Commit);
        mux.abandon(5);
        assert!(mux.is_empty());
        assert!(!mux.complete(5, Frame::new(Opcode::Commit, 5)));
    }
}
