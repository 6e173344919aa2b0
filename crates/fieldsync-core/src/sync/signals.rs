//! Connectivity, foreground and session state, as an explicit subscription
//! interface instead of global listener registries.

use std::sync::Arc;

use tokio::sync::watch;

use super::engine::CycleContext;
use super::gateway::Session;

/// Snapshot of the environment the sync engine runs in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalState {
    pub online: bool,
    pub foreground: bool,
    pub session: Option<Session>,
}

impl SignalState {
    /// Inputs for one reconciliation cycle.
    pub fn cycle_context(&self) -> CycleContext {
        CycleContext {
            online: self.online,
            session: self.session.clone(),
        }
    }
}

/// A state transition observed by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalChange {
    pub previous: SignalState,
    pub current: SignalState,
}

impl SignalChange {
    pub const fn came_online(&self) -> bool {
        !self.previous.online && self.current.online
    }

    pub const fn went_foreground(&self) -> bool {
        !self.previous.foreground && self.current.foreground
    }

    pub const fn went_background(&self) -> bool {
        self.previous.foreground && !self.current.foreground
    }

    /// A session appeared or was replaced
    pub fn new_session(&self) -> bool {
        self.current.session.is_some() && self.current.session != self.previous.session
    }
}

/// Publisher of [`SignalState`]. Clones share the same state.
#[derive(Debug, Clone)]
pub struct SyncSignals {
    sender: Arc<watch::Sender<SignalState>>,
}

impl Default for SyncSignals {
    fn default() -> Self {
        Self::new(SignalState::default())
    }
}

impl SyncSignals {
    pub fn new(initial: SignalState) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn snapshot(&self) -> SignalState {
        self.sender.borrow().clone()
    }

    pub fn set_online(&self, online: bool) {
        self.sender.send_if_modified(|state| {
            let changed = state.online != online;
            state.online = online;
            changed
        });
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.sender.send_if_modified(|state| {
            let changed = state.foreground != foreground;
            state.foreground = foreground;
            changed
        });
    }

    pub fn set_session(&self, session: Option<Session>) {
        self.sender.send_if_modified(|state| {
            let changed = state.session != session;
            state.session = session;
            changed
        });
    }

    /// Start observing changes made after this call.
    pub fn subscribe(&self) -> Subscription {
        let receiver = self.sender.subscribe();
        let seen = receiver.borrow().clone();
        Subscription {
            receiver: Some(receiver),
            seen,
        }
    }
}

/// Handle for one subscriber. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    receiver: Option<watch::Receiver<SignalState>>,
    seen: SignalState,
}

impl Subscription {
    /// Wait for the next change. Returns `None` once unsubscribed or when every
    /// publisher is gone.
    pub async fn changed(&mut self) -> Option<SignalChange> {
        let receiver = self.receiver.as_mut()?;
        receiver.changed().await.ok()?;
        let current = receiver.borrow_and_update().clone();
        let previous = std::mem::replace(&mut self.seen, current.clone());
        Some(SignalChange { previous, current })
    }

    pub fn unsubscribe(&mut self) {
        self.receiver = None;
    }

    pub const fn is_active(&self) -> bool {
        self.receiver.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn subscriber_sees_transitions() {
        let signals = SyncSignals::default();
        let mut subscription = signals.subscribe();

        signals.set_online(true);
        let change = subscription.changed().await.unwrap();
        assert!(change.came_online());
        assert!(!change.went_foreground());

        signals.set_session(Some(Session::new("tech", "t1")));
        let change = subscription.changed().await.unwrap();
        assert!(change.new_session());
        assert_eq!(change.current.cycle_context().session.unwrap().user_id, "tech");
    }

    #[tokio::test]
    async fn unchanged_values_do_not_notify() {
        let signals = SyncSignals::default();
        let mut subscription = signals.subscribe();

        signals.set_online(false);
        signals.set_foreground(true);
        let change = subscription.changed().await.unwrap();
        assert!(change.went_foreground());
        assert_eq!(change.previous.online, change.current.online);
    }

    #[tokio::test]
    async fn unsubscribed_handle_stops_receiving() {
        let signals = SyncSignals::default();
        let mut subscription = signals.subscribe();
        subscription.unsubscribe();
        signals.set_online(true);

        assert!(!subscription.is_active());
        assert_eq!(subscription.changed().await, None);
    }
}
