use std::collections::BTreeMap;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::Asn;
use crate::error::{OverlayError, OverlayResult};

/// Bookkeeping for writes accepted by the engine but not yet durable on the
/// dedicated log.
#[derive(Debug, Default, Clone)]
pub struct ProgressState {
    /// Start -> end of every accepted write still waiting on its dedicated
    /// copy.
    pending: BTreeMap<Asn, Asn>,
    outstanding_bytes: u64,
    /// End of the last accepted write; `None` until the stream has data.
    tail: Option<Asn>,
    /// Lowest ASN whose dedicated write failed permanently.
    failed_at: Option<Asn>,
}

impl ProgressState {
    pub fn outstanding_bytes(&self) -> u64 {
        self.outstanding_bytes
    }

    pub fn tail(&self) -> Option<Asn> {
        self.tail
    }

    pub fn failed_at(&self) -> Option<Asn> {
        self.failed_at
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Highest ASN the shared log may be truncated to: everything below it
    /// is durable on the dedicated log. Never moves past a failed write.
    pub fn safe_point(&self) -> Option<Asn> {
        let tail = self.tail?;
        let mut point = self
            .pending
            .keys()
            .next()
            .copied()
            .map_or(tail, |first: Asn| first.min(tail));
        if let Some(failed) = self.failed_at {
            point = point.min(failed);
        }
        Some(point)
    }

    fn settle(&mut self, asn: Asn) {
        if let Some(end) = self.pending.remove(&asn) {
            self.outstanding_bytes = self
                .outstanding_bytes
                .saturating_sub(end.get().saturating_sub(asn.get()));
        }
    }
}

/// Shared between a [`super::CoalesceEngine`] and its stream: flush
/// completions update it, throttled writers and the shared-log reclaimer
/// wait on it.
#[derive(Debug, Default)]
pub struct FlushProgress {
    state: Mutex<ProgressState>,
    notify: Notify,
}

impl FlushProgress {
    pub fn new(tail: Option<Asn>) -> Self {
        Self {
            state: Mutex::new(ProgressState {
                tail,
                ..ProgressState::default()
            }),
            notify: Notify::new(),
        }
    }

    pub fn snapshot(&self) -> ProgressState {
        self.state.lock().clone()
    }

    pub fn tail(&self) -> Option<Asn> {
        self.state.lock().tail
    }

    pub fn outstanding_bytes(&self) -> u64 {
        self.state.lock().outstanding_bytes
    }

    pub fn failed_at(&self) -> Option<Asn> {
        self.state.lock().failed_at
    }

    pub fn safe_point(&self) -> Option<Asn> {
        self.state.lock().safe_point()
    }

    pub(crate) fn accept(&self, asn: Asn, end: Asn) {
        let mut state = self.state.lock();
        state.settle(asn);
        state.pending.insert(asn, end);
        state.outstanding_bytes += end.get().saturating_sub(asn.get());
        state.tail = Some(state.tail.map_or(end, |tail| tail.max(end)));
    }

    pub(crate) fn persisted(&self, asns: impl IntoIterator<Item = Asn>) {
        {
            let mut state = self.state.lock();
            for asn in asns {
                state.settle(asn);
            }
        }
        self.notify.notify_waiters();
    }

    pub(crate) fn failed(&self, asns: impl IntoIterator<Item = Asn>) {
        {
            let mut state = self.state.lock();
            for asn in asns {
                state.settle(asn);
                state.failed_at = Some(state.failed_at.map_or(asn, |failed| failed.min(asn)));
            }
        }
        self.notify.notify_waiters();
    }

    /// Forget everything at or after `point`; a write straddling it is
    /// shortened to end there.
    pub(crate) fn reset_tail(&self, point: Asn) {
        {
            let mut state = self.state.lock();
            let doomed: Vec<Asn> = state.pending.range(point..).map(|(asn, _)| *asn).collect();
            for asn in doomed {
                state.settle(asn);
            }
            let straddler = state
                .pending
                .range(..point)
                .next_back()
                .map(|(asn, end)| (*asn, *end))
                .filter(|(_, end)| *end > point);
            if let Some((asn, end)) = straddler {
                state.pending.insert(asn, point);
                state.outstanding_bytes = state
                    .outstanding_bytes
                    .saturating_sub(end.get() - point.get());
            }
            if state.tail.is_some_and(|tail| tail > point) {
                state.tail = Some(point);
            }
        }
        self.notify.notify_waiters();
    }

    /// Wake waiters so they re-evaluate their condition (threshold changes).
    pub(crate) fn poke(&self) {
        self.notify.notify_waiters();
    }

    /// Suspend until `ready` holds, or fail with `Closing` on shutdown.
    pub async fn wait_until<F>(&self, shutdown: &CancellationToken, mut ready: F) -> OverlayResult<()>
    where
        F: FnMut(&ProgressState) -> bool,
    {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let satisfied = ready(&*self.state.lock());
            if satisfied {
                return Ok(());
            }
            tokio::select! {
                _ = &mut notified => {},
                _ = shutdown.cancelled() => return Err(OverlayError::Closing),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_point_tracks_first_pending_write() {
        let progress = FlushProgress::new(Some(Asn::new(0)));
        progress.accept(Asn::new(0), Asn::new(10));
        progress.accept(Asn::new(10), Asn::new(25));
        assert_eq!(progress.safe_point(), Some(Asn::new(0)));
        assert_eq!(progress.outstanding_bytes(), 25);

        progress.persisted([Asn::new(0)]);
        assert_eq!(progress.safe_point(), Some(Asn::new(10)));
        progress.persisted([Asn::new(10)]);
        assert_eq!(progress.safe_point(), Some(Asn::new(25)));
        assert_eq!(progress.outstanding_bytes(), 0);
    }

    #[test]
    fn failure_freezes_safe_point() {
        let progress = FlushProgress::new(None);
        progress.accept(Asn::new(0), Asn::new(10));
        progress.accept(Asn::new(10), Asn::new(20));
        progress.failed([Asn::new(0)]);
        progress.persisted([Asn::new(10)]);
        assert_eq!(progress.safe_point(), Some(Asn::new(0)));
        assert_eq!(progress.failed_at(), Some(Asn::new(0)));
        assert_eq!(progress.outstanding_bytes(), 0);
    }

    #[test]
    fn reset_tail_clips_straddling_write() {
        let progress = FlushProgress::new(None);
        progress.accept(Asn::new(0), Asn::new(10));
        progress.accept(Asn::new(10), Asn::new(30));
        progress.accept(Asn::new(30), Asn::new(40));
        progress.reset_tail(Asn::new(15));
        let state = progress.snapshot();
        assert_eq!(state.tail(), Some(Asn::new(15)));
        assert_eq!(state.outstanding_bytes(), 15);
        assert_eq!(state.pending_writes(), 2);
    }

    #[tokio::test]
    async fn waiters_wake_on_progress() {
        let progress = std::sync::Arc::new(FlushProgress::new(None));
        progress.accept(Asn::new(0), Asn::new(100));
        let token = CancellationToken::new();
        let waiter = {
            let progress = progress.clone();
            let token = token.clone();
            tokio::spawn(async move {
                progress
                    .wait_until(&token, |state| state.outstanding_bytes() < 50)
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        progress.persisted([Asn::new(0)]);
        waiter.await.expect("join").expect("woken");
    }
}
