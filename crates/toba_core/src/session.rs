//! Device session: the engine's view of one physically connected device.
//!
//! A [`DeviceSession`] is a cheap, clonable handle. Clones share the same
//! state and the same exclusivity lock, so two workers holding clones of one
//! session still cannot drive the device at the same time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::constants::{CURRENT_SLOT_VAR, PRODUCT_VAR};
use crate::device::{DeviceMode, Slot};
use crate::error::{SessionError, TransportError};
use crate::transport::{DeviceCommand, Transport};
use crate::utils::parse_partition_table;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub mode: DeviceMode,
    pub slot: Option<Slot>,
    pub partitions: BTreeMap<String, u64>,
    pub model: Option<String>,
}

struct SessionInner {
    serial: String,
    transport: Arc<dyn Transport>,
    state: Mutex<SessionState>,
    exclusive: Arc<AsyncMutex<()>>,
    detached: AtomicBool,
}

#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

/// Proof that the holder has exclusive use of the device. Released on drop.
pub struct SessionGuard {
    serial: String,
    _permit: OwnedMutexGuard<()>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        debug!(serial = %self.serial, "session released");
    }
}

impl DeviceSession {
    /// Creates a session for `serial` and reads its mode, model and slot.
    pub async fn attach(serial: impl Into<String>, transport: Arc<dyn Transport>) -> Result<Self, SessionError> {
        let session = Self::new(serial, transport);
        let mode = session.detect_mode().await?;
        if mode != DeviceMode::Unknown {
            if let Err(e) = session.refresh_model().await {
                warn!(serial = %session.serial(), error = %e, "could not read device model");
            }
            if let Err(e) = session.refresh_slot().await {
                debug!(serial = %session.serial(), error = %e, "no slot information");
            }
        }
        info!(serial = %session.serial(), %mode, model = ?session.model(), "device attached");
        Ok(session)
    }

    /// Creates a session without talking to the device.
    pub fn new(serial: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                serial: serial.into(),
                transport,
                state: Mutex::new(SessionState {
                    mode: DeviceMode::Unknown,
                    slot: None,
                    partitions: BTreeMap::new(),
                    model: None,
                }),
                exclusive: Arc::new(AsyncMutex::new(())),
                detached: AtomicBool::new(false),
            }),
        }
    }

    pub fn serial(&self) -> &str {
        &self.inner.serial
    }

    pub fn current_mode(&self) -> DeviceMode {
        self.state().mode
    }

    pub fn slot(&self) -> Option<Slot> {
        self.state().slot
    }

    pub fn model(&self) -> Option<String> {
        self.state().model.clone()
    }

    pub fn partition_table(&self) -> BTreeMap<String, u64> {
        self.state().partitions.clone()
    }

    pub fn partition_size(&self, name: &str) -> Option<u64> {
        self.state().partitions.get(name).copied()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state().clone()
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::SeqCst)
    }

    /// Ends the session. Every later device operation fails with `Detached`.
    pub fn mark_detached(&self) {
        if !self.inner.detached.swap(true, Ordering::SeqCst) {
            info!(serial = %self.serial(), "device detached");
        }
    }

    /// Takes the exclusivity lock, failing fast if another operation holds it.
    pub fn acquire(&self) -> Result<SessionGuard, SessionError> {
        self.ensure_attached()?;
        let permit = self
            .inner
            .exclusive
            .clone()
            .try_lock_owned()
            .map_err(|_| SessionError::Busy {
                serial: self.serial().to_string(),
            })?;
        debug!(serial = %self.serial(), "session acquired");
        Ok(SessionGuard {
            serial: self.serial().to_string(),
            _permit: permit,
        })
    }

    /// Polls the transport and records the answer as the current mode.
    pub async fn detect_mode(&self) -> Result<DeviceMode, SessionError> {
        self.ensure_attached()?;
        let mode = self.inner.transport.poll_status().await;
        self.record_mode(mode);
        Ok(mode)
    }

    /// Detects the mode and fails with `ModeMismatch` unless it is `expected`.
    pub async fn expect_mode(&self, expected: DeviceMode) -> Result<(), SessionError> {
        let actual = self.detect_mode().await?;
        if actual == expected {
            Ok(())
        } else {
            Err(SessionError::ModeMismatch {
                serial: self.serial().to_string(),
                expected,
                actual,
            })
        }
    }

    pub async fn refresh_partition_table(&self) -> Result<BTreeMap<String, u64>, SessionError> {
        let reply = self.send(DeviceCommand::PartitionTable).await?;
        let table = parse_partition_table(&reply);
        debug!(serial = %self.serial(), partitions = table.len(), "partition table refreshed");
        self.state().partitions = table.clone();
        Ok(table)
    }

    pub async fn refresh_slot(&self) -> Result<Option<Slot>, SessionError> {
        let slot = match self.send(DeviceCommand::GetVar(CURRENT_SLOT_VAR.into())).await {
            Ok(reply) => Slot::parse(&String::from_utf8_lossy(&reply)),
            Err(TransportError::Rejected(_)) | Err(TransportError::Unsupported(_)) => None,
            Err(e) => return Err(e.into()),
        };
        self.state().slot = slot;
        Ok(slot)
    }

    pub async fn refresh_model(&self) -> Result<Option<String>, SessionError> {
        let reply = self.send(DeviceCommand::GetVar(PRODUCT_VAR.into())).await?;
        let model = String::from_utf8_lossy(&reply).trim().to_string();
        let model = (!model.is_empty()).then_some(model);
        self.state().model = model.clone();
        Ok(model)
    }

    /// Model tag, asking the device if it is not known yet.
    pub async fn resolve_model(&self) -> Option<String> {
        if let Some(model) = self.model() {
            return Some(model);
        }
        self.refresh_model().await.ok().flatten()
    }

    pub(crate) fn record_mode(&self, mode: DeviceMode) {
        let previous = std::mem::replace(&mut self.state().mode, mode);
        if previous != mode {
            debug!(serial = %self.serial(), from = %previous, to = %mode, "mode changed");
        }
    }

    pub(crate) fn record_slot(&self, slot: Slot) {
        self.state().slot = Some(slot);
    }

    pub(crate) async fn send(&self, command: DeviceCommand) -> Result<Vec<u8>, TransportError> {
        if self.is_detached() {
            return Err(TransportError::Disconnected);
        }
        self.inner.transport.send(command).await
    }

    fn ensure_attached(&self) -> Result<(), SessionError> {
        if self.is_detached() {
            Err(SessionError::Detached {
                serial: self.serial().to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("serial", &self.inner.serial)
            .field("state", &*self.state())
            .field("detached", &self.is_detached())
            .finish()
    }
}
