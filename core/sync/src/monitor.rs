//! Connectivity tracking and network-triggered sync.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Network state as reported by the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkState {
    Online,
    Offline,
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkState::Online => f.write_str("online"),
            NetworkState::Offline => f.write_str("offline"),
        }
    }
}

/// One observed network state. `seq` grows with every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub(crate) state: NetworkState,
    pub(crate) seq: u64,
}

/// Handle through which the environment reports connectivity transitions.
///
/// Cloning yields another handle to the same state. Engines built from it
/// observe every transition.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<Transition>>,
}

impl Connectivity {
    /// Create a handle with the given initial state.
    pub fn new(initial: NetworkState) -> Self {
        let (tx, _) = watch::channel(Transition {
            state: initial,
            seq: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    /// Create a handle that starts online.
    pub fn online() -> Self {
        Self::new(NetworkState::Online)
    }

    /// Create a handle that starts offline.
    pub fn offline() -> Self {
        Self::new(NetworkState::Offline)
    }

    /// Report the current network state. Reporting the state already in
    /// effect is not a transition and is ignored.
    pub fn set(&self, state: NetworkState) {
        let changed = self.tx.send_if_modified(|current| {
            if current.state == state {
                return false;
            }
            current.state = state;
            current.seq += 1;
            true
        });
        if changed {
            debug!("Network is now {}", state);
        }
    }

    pub fn set_online(&self) {
        self.set(NetworkState::Online);
    }

    pub fn set_offline(&self) {
        self.set(NetworkState::Offline);
    }

    /// Current network state.
    pub fn state(&self) -> NetworkState {
        self.tx.borrow().state
    }

    pub fn is_online(&self) -> bool {
        self.state() == NetworkState::Online
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Transition> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::online()
    }
}

/// Outcome of the last connectivity-triggered sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    Synced,
    Unsynced,
}

/// Monitor progress: the last transition handled and its settled status.
/// `status` is `None` while a triggered sync is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StatusSnapshot {
    pub(crate) seq: u64,
    pub(crate) status: Option<SyncStatus>,
}

/// Read side of the sync status.
#[derive(Debug, Clone)]
pub struct SyncStatusHandle {
    network: watch::Receiver<Transition>,
    status: watch::Receiver<StatusSnapshot>,
    tracking: bool,
}

impl SyncStatusHandle {
    pub(crate) fn new(
        network: watch::Receiver<Transition>,
        status: watch::Receiver<StatusSnapshot>,
        tracking: bool,
    ) -> Self {
        Self {
            network,
            status,
            tracking,
        }
    }

    /// Status right now. Unsettled counts as `Unsynced`.
    pub fn current(&self) -> SyncStatus {
        let snapshot = *self.status.borrow();
        if self.tracking && snapshot.seq < self.network.borrow().seq {
            return SyncStatus::Unsynced;
        }
        snapshot.status.unwrap_or(SyncStatus::Unsynced)
    }

    /// Wait until every reported transition was handled and no triggered
    /// sync is in flight, then return the status.
    ///
    /// Returns immediately when auto sync is disabled.
    pub async fn settled(&self) -> SyncStatus {
        if !self.tracking {
            return self.current();
        }

        let mut status = self.status.clone();
        loop {
            let target = self.network.borrow().seq;
            let waited = status
                .wait_for(|s| s.seq >= target && s.status.is_some())
                .await
                .map(|s| s.status);

            match waited {
                Ok(settled) if self.network.borrow().seq == target => {
                    return settled.unwrap_or(SyncStatus::Unsynced);
                }
                Ok(_) => continue,
                // Monitor is gone, nothing will change anymore.
                Err(_) => return self.current(),
            }
        }
    }
}

/// Background loop reacting to connectivity transitions.
///
/// Going online runs `sync` and settles the status to `Synced` once it
/// returns, whatever its outcome. Going offline settles to `Unsynced`.
/// Exits when every [`Connectivity`] handle is dropped.
pub(crate) async fn run_monitor<F, Fut>(
    mut network: watch::Receiver<Transition>,
    status: watch::Sender<StatusSnapshot>,
    sync: F,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    info!("Connectivity monitor started");

    while network.changed().await.is_ok() {
        let transition = *network.borrow_and_update();
        match transition.state {
            NetworkState::Online => {
                status.send_replace(StatusSnapshot {
                    seq: transition.seq,
                    status: None,
                });
                debug!("Back online, triggering sync");
                sync().await;
                status.send_replace(StatusSnapshot {
                    seq: transition.seq,
                    status: Some(SyncStatus::Synced),
                });
            }
            NetworkState::Offline => {
                status.send_replace(StatusSnapshot {
                    seq: transition.seq,
                    status: Some(SyncStatus::Unsynced),
                });
            }
        }
    }

    info!("Connectivity monitor stopped");
}
