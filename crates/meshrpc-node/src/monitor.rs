use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Liveness tracking knobs.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often the monitor scans for stale addresses.
    pub tick: Duration,
    /// An address not refreshed within this window is reported dead.
    pub deadline: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            tick: Duration::from_secs(1),
            deadline: Duration::from_secs(10),
        }
    }
}

enum Event {
    Touch(String),
    Forget(String),
}

/// Liveness monitor: an actor owning `address -> last-seen` state.
///
/// The loop reacts to three things: activity touches (bump last-seen,
/// registering the address if new), unsubscribes, and a periodic tick that
/// drops every address past the deadline and reports it on the `dead`
/// channel. Callers of [`Monitor::touch`]/[`Monitor::forget`] only hand off
/// a message; they never block on the scan itself.
///
/// [`Monitor::close`] stops the loop and awaits it, after which the `dead`
/// receiver observes end-of-stream rather than blocking forever.
pub struct Monitor {
    events: Mutex<Option<mpsc::Sender<Event>>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Monitor {
    /// Spawns the monitor loop; returns the handle and the `dead` output.
    pub fn spawn(config: MonitorConfig) -> (Self, mpsc::Receiver<String>) {
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(64);
        let (dead_tx, dead_rx) = mpsc::channel::<String>(64);

        let handle = tokio::spawn(async move {
            let mut peers: HashMap<String, Instant> = HashMap::new();
            let mut ticker = tokio::time::interval(config.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    event = event_rx.recv() => match event {
                        Some(Event::Touch(addr)) => {
                            peers.insert(addr, Instant::now());
                        }
                        Some(Event::Forget(addr)) => {
                            peers.remove(&addr);
                        }
                        // All senders dropped: monitor closed.
                        None => return,
                    },
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let stale: Vec<String> = peers
                            .iter()
                            .filter(|(_, seen)| now.duration_since(**seen) > config.deadline)
                            .map(|(addr, _)| addr.clone())
                            .collect();
                        for addr in stale {
                            peers.remove(&addr);
                            warn!(%addr, "liveness deadline exceeded");
                            if dead_tx.send(addr).await.is_err() {
                                debug!("dead-report consumer gone, stopping monitor");
                                return;
                            }
                        }
                    }
                }
            }
        });

        (
            Monitor {
                events: Mutex::new(Some(event_tx)),
                handle: Mutex::new(Some(handle)),
            },
            dead_rx,
        )
    }

    /// Records activity for `addr`, registering it if new.
    pub async fn touch(&self, addr: &str) {
        self.send(Event::Touch(addr.to_string())).await;
    }

    /// Stops tracking `addr` without reporting it dead.
    pub async fn forget(&self, addr: &str) {
        self.send(Event::Forget(addr.to_string())).await;
    }

    async fn send(&self, event: Event) {
        let tx = self.events.lock().await.clone();
        if let Some(tx) = tx {
            // A send can only fail once the loop has stopped; there is
            // nothing left to notify then.
            let _ = tx.send(event).await;
        }
    }

    /// Signals the loop to stop and waits for it to acknowledge. The `dead`
    /// channel reaches end-of-stream as a consequence.
    pub async fn close(&self) {
        self.events.lock().await.take();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MonitorConfig {
        MonitorConfig {
            tick: Duration::from_millis(50),
            deadline: Duration::from_millis(120),
        }
    }

    #[tokio::test]
    async fn unrefreshed_address_is_reported_dead() {
        let (monitor, mut dead) = Monitor::spawn(test_config());
        monitor.touch("10.0.0.1:9000").await;

        let reported = tokio::time::timeout(Duration::from_millis(500), dead.recv())
            .await
            .expect("dead report should arrive within a few ticks");
        assert_eq!(reported.as_deref(), Some("10.0.0.1:9000"));

        monitor.close().await;
    }

    #[tokio::test]
    async fn refreshed_address_is_never_evicted() {
        let (monitor, mut dead) = Monitor::spawn(test_config());

        // Refresh every 40ms over a one second window: under the 120ms
        // deadline each time.
        for _ in 0..25 {
            monitor.touch("10.0.0.1:9000").await;
            tokio::time::sleep(Duration::from_millis(40)).await;
        }

        assert!(
            dead.try_recv().is_err(),
            "refreshed address must not be reported dead"
        );
        monitor.close().await;
    }

    #[tokio::test]
    async fn forgotten_address_is_not_reported() {
        let (monitor, mut dead) = Monitor::spawn(test_config());
        monitor.touch("10.0.0.1:9000").await;
        monitor.forget("10.0.0.1:9000").await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(dead.try_recv().is_err());
        monitor.close().await;
    }

    #[tokio::test]
    async fn close_ends_the_dead_stream() {
        let (monitor, mut dead) = Monitor::spawn(test_config());
        monitor.touch("10.0.0.1:9000").await;
        monitor.close().await;

        // End-of-stream, not a hang.
        loop {
            match tokio::time::timeout(Duration::from_millis(500), dead.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => panic!("dead stream should end after close"),
            }
        }
    }
}
