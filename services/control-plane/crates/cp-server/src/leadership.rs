//! Leadership as seen by this replica.
//!
//! Election itself happens elsewhere; this only carries its latest verdict.

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct LeaderSignal {
    rx: watch::Receiver<bool>,
}

impl LeaderSignal {
    /// Signal that never changes.
    #[must_use]
    pub fn fixed(is_leader: bool) -> Self {
        let (_tx, rx) = watch::channel(is_leader);
        Self { rx }
    }

    /// Signal driven by the returned sender, e.g. from an election loop.
    #[must_use]
    pub fn channel(initial: bool) -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(initial);
        (tx, Self { rx })
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        *self.rx.borrow()
    }
}
