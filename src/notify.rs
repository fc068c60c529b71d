//! Coalescing queue-changed notifier
//!
//! Progress streams can emit many updates per second; observers only need a
//! bounded rate. The notifier is a minimum-interval gate: the first event in a
//! window is delivered immediately, further events inside the window collapse
//! into one trailing delivery, so the final state is never dropped.

use crate::types::Event;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

struct GateState {
    last_sent: Option<Instant>,
    trailing_scheduled: bool,
}

/// Minimum-interval gate in front of the broadcast channel
#[derive(Clone)]
pub(crate) struct QueueNotifier {
    tx: broadcast::Sender<Event>,
    window: Duration,
    state: Arc<Mutex<GateState>>,
}

impl QueueNotifier {
    pub(crate) fn new(tx: broadcast::Sender<Event>, window: Duration) -> Self {
        Self {
            tx,
            window,
            state: Arc::new(Mutex::new(GateState {
                last_sent: None,
                trailing_scheduled: false,
            })),
        }
    }

    /// Announce that the queue changed, coalescing bursts.
    ///
    /// Safe to call from any task; never blocks and never drops the last
    /// update of a burst.
    pub(crate) fn queue_changed(&self) {
        let now = Instant::now();
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let within_window = state
            .last_sent
            .is_some_and(|prev| now.duration_since(prev) < self.window);

        if !within_window {
            state.last_sent = Some(now);
            drop(state);
            self.tx.send(Event::QueueChanged).ok();
            return;
        }

        if state.trailing_scheduled {
            return;
        }
        state.trailing_scheduled = true;
        let remaining = state
            .last_sent
            .map(|prev| self.window.saturating_sub(now.duration_since(prev)))
            .unwrap_or(self.window);
        drop(state);

        let notifier = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            let mut state = match notifier.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.trailing_scheduled = false;
            state.last_sent = Some(Instant::now());
            drop(state);
            notifier.tx.send(Event::QueueChanged).ok();
        });
    }

    /// Send an event immediately, bypassing the gate.
    ///
    /// Used for one-shot signals (installation success, shutdown) that must
    /// not be coalesced with progress noise.
    pub(crate) fn send_now(&self, event: Event) {
        self.tx.send(event).ok();
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut broadcast::Receiver<Event>) -> usize {
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn single_change_is_delivered_immediately() {
        let (tx, mut rx) = broadcast::channel(64);
        let notifier = QueueNotifier::new(tx, Duration::from_millis(100));

        notifier.queue_changed();
        assert_eq!(drain(&mut rx), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_leading_and_trailing_edge() {
        let (tx, mut rx) = broadcast::channel(64);
        let notifier = QueueNotifier::new(tx, Duration::from_millis(100));

        for _ in 0..10 {
            notifier.queue_changed();
        }
        // Leading edge only so far
        assert_eq!(drain(&mut rx), 1);

        // Let the trailing delivery fire
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(drain(&mut rx), 1, "burst must end with exactly one trailing event");
    }

    #[tokio::test(start_paused = true)]
    async fn changes_in_separate_windows_all_deliver() {
        let (tx, mut rx) = broadcast::channel(64);
        let notifier = QueueNotifier::new(tx, Duration::from_millis(100));

        notifier.queue_changed();
        tokio::time::sleep(Duration::from_millis(150)).await;
        notifier.queue_changed();
        tokio::time::sleep(Duration::from_millis(150)).await;
        notifier.queue_changed();

        assert_eq!(drain(&mut rx), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn send_now_bypasses_the_gate() {
        let (tx, mut rx) = broadcast::channel(64);
        let notifier = QueueNotifier::new(tx, Duration::from_millis(100));

        notifier.queue_changed();
        notifier.send_now(Event::InstallationSuccess {
            device: "DEV1".to_string(),
            release_id: "R1".into(),
        });

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Event::InstallationSuccess { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn no_subscriber_is_not_an_error() {
        let (tx, _) = broadcast::channel(64);
        let notifier = QueueNotifier::new(tx, Duration::from_millis(100));
        // All receivers dropped: sends are silently discarded
        notifier.queue_changed();
        notifier.send_now(Event::Shutdown);
    }
}
