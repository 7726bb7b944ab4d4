//! Session supervision: per-role connection state, the recovery grace period
//! and the scan target policy

use super::events::{BluetoothEvent, ConnectionState};
use crate::device::DeviceRole;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The session owner asked for the disconnect
    Requested,
    /// The link dropped on its own
    Unexpected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Grace period started; reconnect attempts should follow
    Recovering,
    Disconnected,
}

#[derive(Debug, Default)]
struct RoleSlot {
    state: ConnectionState,
    device_id: Option<String>,
    recovery: Option<JoinHandle<()>>,
}

impl RoleSlot {
    fn cancel_recovery(&mut self) {
        if let Some(task) = self.recovery.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Default)]
struct SupervisorState {
    session_active: bool,
    slots: HashMap<DeviceRole, RoleSlot>,
    /// Roles the scanner should look for, in priority order
    wanted: BTreeSet<DeviceRole>,
}

impl SupervisorState {
    fn slot(&mut self, role: DeviceRole) -> &mut RoleSlot {
        self.slots.entry(role).or_default()
    }

    fn state(&self, role: DeviceRole) -> ConnectionState {
        self.slots.get(&role).map(|slot| slot.state).unwrap_or_default()
    }

    /// Cancel every grace period and drop the roles still inside one.
    /// Returns the abandoned roles.
    fn abandon_recovery(&mut self) -> Vec<DeviceRole> {
        let mut abandoned = Vec::new();
        for (role, slot) in self.slots.iter_mut() {
            slot.cancel_recovery();
            if slot.state == ConnectionState::Recovering {
                slot.state = ConnectionState::Disconnected;
                slot.device_id = None;
                abandoned.push(*role);
            }
        }
        abandoned.sort();
        abandoned
    }

    fn scan_target(&self) -> Option<DeviceRole> {
        self.wanted
            .iter()
            .copied()
            .find(|role| self.state(*role) != ConnectionState::Connected)
    }
}

/// Shared view of every role's connection state.
///
/// Cloning is cheap; clones observe the same state.
#[derive(Clone)]
pub struct SessionSupervisor {
    state: Arc<Mutex<SupervisorState>>,
    recovery_window: Duration,
    event_sender: mpsc::UnboundedSender<BluetoothEvent>,
}

impl SessionSupervisor {
    pub fn new(recovery_window: Duration, event_sender: mpsc::UnboundedSender<BluetoothEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SupervisorState::default())),
            recovery_window,
            event_sender,
        }
    }

    // ========================================================================
    // Session
    // ========================================================================

    pub async fn begin_session(&self) {
        self.state.lock().await.session_active = true;
        info!("▶️ Session started");
    }

    /// End the session. Roles still inside their grace period are given up.
    pub async fn end_session(&self) {
        let mut state = self.state.lock().await;
        state.session_active = false;
        let abandoned = state.abandon_recovery();
        drop(state);

        for role in abandoned {
            self.emit(BluetoothEvent::ConnectionStatusChanged {
                role,
                connected: false,
            });
        }
        info!("⏹️ Session ended");
    }

    pub async fn is_session_active(&self) -> bool {
        self.state.lock().await.session_active
    }

    // ========================================================================
    // Connection state
    // ========================================================================

    pub async fn state(&self, role: DeviceRole) -> ConnectionState {
        self.state.lock().await.state(role)
    }

    pub async fn device_id(&self, role: DeviceRole) -> Option<String> {
        self.state.lock().await.slots.get(&role).and_then(|slot| slot.device_id.clone())
    }

    /// A recovering role stays `Recovering` while reconnect attempts run
    pub async fn begin_connecting(&self, role: DeviceRole, device_id: &str) {
        let mut state = self.state.lock().await;
        let slot = state.slot(role);
        if slot.state != ConnectionState::Recovering {
            slot.state = ConnectionState::Connecting;
        }
        slot.device_id = Some(device_id.to_string());
    }

    /// Record a live link. Returns the role the scanner should look for next.
    pub async fn mark_connected(&self, role: DeviceRole, device_id: &str) -> Option<DeviceRole> {
        let mut state = self.state.lock().await;
        let slot = state.slot(role);
        let recovered = slot.state == ConnectionState::Recovering;
        slot.cancel_recovery();
        slot.state = ConnectionState::Connected;
        slot.device_id = Some(device_id.to_string());
        state.wanted.remove(&role);
        let next = state.scan_target();
        drop(state);

        if recovered {
            info!("🔁 {} recovered within grace period", role);
        }
        self.emit(BluetoothEvent::ConnectionStatusChanged {
            role,
            connected: true,
        });
        next
    }

    /// A connection attempt failed before the link came up
    pub async fn connection_failed(&self, role: DeviceRole) {
        let mut state = self.state.lock().await;
        let slot = state.slot(role);
        if slot.state == ConnectionState::Connecting {
            slot.state = ConnectionState::Disconnected;
            slot.device_id = None;
            drop(state);
            self.emit(BluetoothEvent::ConnectionStatusChanged {
                role,
                connected: false,
            });
        }
    }

    /// Route a dropped or released link.
    ///
    /// An unexpected drop of a connected role during an active session starts
    /// the grace period. If the role is not connected again before it expires,
    /// the session is terminated exactly once.
    pub async fn handle_disconnect(&self, role: DeviceRole, cause: DisconnectCause) -> DisconnectOutcome {
        let mut state = self.state.lock().await;
        let session_active = state.session_active;
        let slot = state.slot(role);
        let previous = slot.state;

        if cause == DisconnectCause::Unexpected && session_active && previous == ConnectionState::Connected {
            slot.state = ConnectionState::Recovering;
            slot.cancel_recovery();
            slot.recovery = Some(self.spawn_recovery_timer(role));
            state.wanted.insert(role);
            drop(state);

            warn!(
                "⚠️ {} disconnected during session, waiting {:?} for reconnection",
                role, self.recovery_window
            );
            self.emit(BluetoothEvent::RecoveryStarted { role });
            return DisconnectOutcome::Recovering;
        }

        if previous == ConnectionState::Recovering && cause == DisconnectCause::Unexpected {
            // Failed reconnect attempt inside the grace period
            return DisconnectOutcome::Recovering;
        }

        slot.cancel_recovery();
        slot.state = ConnectionState::Disconnected;
        slot.device_id = None;
        if cause == DisconnectCause::Unexpected {
            state.wanted.insert(role);
        }
        drop(state);

        if previous != ConnectionState::Disconnected {
            info!("🔌 {} disconnected ({:?})", role, cause);
            self.emit(BluetoothEvent::ConnectionStatusChanged {
                role,
                connected: false,
            });
        }
        DisconnectOutcome::Disconnected
    }

    fn spawn_recovery_timer(&self, role: DeviceRole) -> JoinHandle<()> {
        let shared = Arc::clone(&self.state);
        let window = self.recovery_window;
        let event_sender = self.event_sender.clone();

        tokio::spawn(async move {
            tokio::time::sleep(window).await;

            let mut state = shared.lock().await;
            let slot = state.slot(role);
            // Own handle, must not be aborted below
            slot.recovery = None;
            if slot.state != ConnectionState::Recovering || !state.session_active {
                return;
            }
            state.session_active = false;
            let abandoned = state.abandon_recovery();
            drop(state);

            warn!("❌ {} not recovered within {:?}, terminating session", role, window);
            for abandoned in abandoned {
                let _ = event_sender.send(BluetoothEvent::ConnectionStatusChanged {
                    role: abandoned,
                    connected: false,
                });
            }
            let _ = event_sender.send(BluetoothEvent::SessionTerminated { role });
        })
    }

    // ========================================================================
    // Scan policy
    // ========================================================================

    /// Register interest in `role`; returns the current scan target
    pub async fn want(&self, role: DeviceRole) -> Option<DeviceRole> {
        let mut state = self.state.lock().await;
        state.wanted.insert(role);
        state.scan_target()
    }

    pub async fn unwant(&self, role: DeviceRole) {
        self.state.lock().await.wanted.remove(&role);
    }

    /// First wanted role that is not connected
    pub async fn scan_target(&self) -> Option<DeviceRole> {
        self.state.lock().await.scan_target()
    }

    fn emit(&self, event: BluetoothEvent) {
        if self.event_sender.send(event).is_err() {
            debug!("Event channel closed");
        }
    }
}
