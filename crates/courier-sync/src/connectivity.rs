//! Process-wide connectivity state.
//!
//! One [`ConnectivityPublisher`] writes, any number of [`Connectivity`]
//! handles read.  The state lives in a `tokio::sync::watch` channel so
//! readers always see the latest value and can wait for changes.

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

use courier_shared::{ConnectionQuality, ConnectivityState};

use crate::subscription::Subscription;

/// What the sync core needs from the platform's network monitor.
#[async_trait]
pub trait ConnectivityMonitor: Send + Sync {
    /// Emits the current online flag, then every change of it.
    fn observe_online(&self) -> Subscription<bool>;

    async fn check_connectivity_now(&self) -> bool;
}

/// Create the single writer and a first reader.
pub fn channel(initial: ConnectivityState) -> (ConnectivityPublisher, Connectivity) {
    let (tx, rx) = watch::channel(initial);
    (ConnectivityPublisher { tx }, Connectivity { rx })
}

/// The only writer of connectivity state, owned by the platform monitor.
#[derive(Debug)]
pub struct ConnectivityPublisher {
    tx: watch::Sender<ConnectivityState>,
}

impl ConnectivityPublisher {
    /// Publish a new state.  Returns `true` if it differed from the old one.
    pub fn set(&self, state: ConnectivityState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            if current.online != state.online {
                info!(online = state.online, quality = ?state.quality, "connectivity changed");
            }
            *current = state;
            true
        })
    }

    pub fn go_online(&self, quality: ConnectionQuality) -> bool {
        self.set(ConnectivityState::online(quality))
    }

    pub fn go_offline(&self) -> bool {
        self.set(ConnectivityState::offline())
    }

    pub fn reader(&self) -> Connectivity {
        Connectivity {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read handle over the connectivity state.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct Connectivity {
    rx: watch::Receiver<ConnectivityState>,
}

impl Connectivity {
    pub fn state(&self) -> ConnectivityState {
        *self.rx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.rx.borrow().online
    }

    pub fn quality(&self) -> ConnectionQuality {
        self.rx.borrow().quality
    }
}

#[async_trait]
impl ConnectivityMonitor for Connectivity {
    fn observe_online(&self) -> Subscription<bool> {
        let mut rx = self.rx.clone();
        Subscription::spawn(move |tx| async move {
            let mut last = rx.borrow_and_update().online;
            if tx.send(last).is_err() {
                return;
            }
            while rx.changed().await.is_ok() {
                let online = rx.borrow_and_update().online;
                if online == last {
                    continue;
                }
                last = online;
                if tx.send(online).is_err() {
                    return;
                }
            }
        })
    }

    async fn check_connectivity_now(&self) -> bool {
        self.is_online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn observe_emits_current_then_transitions() {
        let (publisher, connectivity) = channel(ConnectivityState::offline());
        let mut online = connectivity.observe_online();
        assert_eq!(online.recv().await, Some(false));

        assert!(publisher.go_online(ConnectionQuality::Good));
        assert_eq!(online.recv().await, Some(true));

        // A quality change alone is not an online transition.
        assert!(publisher.go_online(ConnectionQuality::Excellent));
        assert!(publisher.go_offline());
        assert_eq!(online.recv().await, Some(false));
        assert!(!connectivity.check_connectivity_now().await);
    }

    #[test]
    fn unchanged_state_is_not_republished() {
        let (publisher, connectivity) = channel(ConnectivityState::online(ConnectionQuality::Good));
        assert!(!publisher.go_online(ConnectionQuality::Good));
        assert!(connectivity.is_online());
        assert_eq!(publisher.reader().quality(), ConnectionQuality::Good);
    }
}
