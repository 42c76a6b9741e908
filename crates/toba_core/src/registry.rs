//! Session lifecycle driven by device events.
//!
//! A watcher task polls the device listing, turns consecutive listings into
//! [`DeviceEvent`]s and feeds them to [`SessionRegistry::run`], which creates a
//! session on attach, records mode changes and marks sessions detached.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::{ConnectedDevice, DeviceMode};
use crate::error::{SessionError, TransportError};
use crate::session::DeviceSession;
use crate::config::EngineConfig;
use crate::transport::{GuardedTransport, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Attached { serial: String, mode: DeviceMode },
    Detached { serial: String },
    ModeChanged { serial: String, mode: DeviceMode },
}

/// Events that turn listing `previous` into listing `current`.
/// Detaches come first, then attaches and mode changes in serial order.
pub fn diff_devices(previous: &BTreeMap<String, DeviceMode>, current: &[ConnectedDevice]) -> Vec<DeviceEvent> {
    let current: BTreeMap<&str, DeviceMode> = current.iter().map(|d| (d.serial.as_str(), d.mode)).collect();

    let mut events: Vec<DeviceEvent> = previous
        .keys()
        .filter(|serial| !current.contains_key(serial.as_str()))
        .map(|serial| DeviceEvent::Detached {
            serial: serial.clone(),
        })
        .collect();

    for (serial, mode) in &current {
        match previous.get(*serial) {
            None => events.push(DeviceEvent::Attached {
                serial: serial.to_string(),
                mode: *mode,
            }),
            Some(old) if old != mode => events.push(DeviceEvent::ModeChanged {
                serial: serial.to_string(),
                mode: *mode,
            }),
            Some(_) => {}
        }
    }
    events
}

/// Source of device listings for the watcher.
#[async_trait]
pub trait DeviceLister: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<ConnectedDevice>, TransportError>;
}

/// Polls `lister` every `interval` and sends the resulting events until
/// `cancel` fires or the receiver goes away.
pub fn spawn_watcher(
    lister: Arc<dyn DeviceLister>,
    interval: Duration,
    tx: mpsc::Sender<DeviceEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut known = BTreeMap::new();
        loop {
            match lister.list_devices().await {
                Ok(devices) => {
                    for event in diff_devices(&known, &devices) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    known = devices.into_iter().map(|d| (d.serial, d.mode)).collect();
                }
                Err(e) => warn!(error = %e, "device listing failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}

pub type Connector = Arc<dyn Fn(&str) -> Result<Arc<dyn Transport>, TransportError> + Send + Sync>;

/// Wraps every transport `connector` produces in a [`GuardedTransport`] so
/// the queries made on attach get the configured timeouts and retries.
pub fn guarded_connector(connector: Connector, config: &EngineConfig) -> Connector {
    let config = config.clone();
    Arc::new(move |serial: &str| -> Result<Arc<dyn Transport>, TransportError> {
        let inner = connector(serial)?;
        Ok(Arc::new(GuardedTransport::from_config(inner, &config)))
    })
}

/// Live sessions keyed by serial.
pub struct SessionRegistry {
    sessions: DashMap<String, DeviceSession>,
    connector: Connector,
}

impl SessionRegistry {
    pub fn new(connector: Connector) -> Self {
        Self {
            sessions: DashMap::new(),
            connector,
        }
    }

    pub fn get(&self, serial: &str) -> Option<DeviceSession> {
        self.sessions.get(serial).map(|s| s.value().clone())
    }

    pub fn serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        serials.sort();
        serials
    }

    pub async fn handle(&self, event: DeviceEvent) -> Result<(), SessionError> {
        match event {
            DeviceEvent::Attached { serial, mode } => {
                let transport = (self.connector)(&serial)?;
                let session = DeviceSession::attach(serial.clone(), transport).await?;
                if session.current_mode() != mode {
                    debug!(%serial, listed = %mode, detected = %session.current_mode(), "listing and detected mode disagree");
                }
                if let Some(old) = self.sessions.insert(serial, session) {
                    old.mark_detached();
                }
            }
            DeviceEvent::Detached { serial } => {
                if let Some((_, session)) = self.sessions.remove(&serial) {
                    session.mark_detached();
                }
            }
            DeviceEvent::ModeChanged { serial, mode } => match self.get(&serial) {
                Some(session) => session.record_mode(mode),
                None => debug!(%serial, "mode change for unknown device"),
            },
        }
        Ok(())
    }

    /// Consumes events until the channel closes.
    pub async fn run(&self, mut rx: mpsc::Receiver<DeviceEvent>) {
        while let Some(event) = rx.recv().await {
            let label = format!("{:?}", event);
            if let Err(e) = self.handle(event).await {
                warn!(event = %label, error = %e, "device event not applied");
            }
        }
        info!("device event stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedDevice;
    use crate::transport::DeviceCommand;
    use std::sync::Mutex;

    fn listed(serial: &str, mode: DeviceMode) -> ConnectedDevice {
        ConnectedDevice {
            serial: serial.into(),
            mode,
            status: mode.to_string(),
        }
    }

    #[tokio::test]
    async fn test_guarded_connector_retries_queries() {
        let sim = Arc::new(SimulatedDevice::new("lisa", DeviceMode::Fastbootd));
        let raw: Connector = {
            let sim = sim.clone();
            Arc::new(move |_: &str| -> Result<Arc<dyn Transport>, TransportError> { Ok(sim.clone()) })
        };
        let config = EngineConfig {
            retry: crate::config::RetryPolicy {
                max_attempts: 2,
                backoff_ms: 0,
            },
            ..EngineConfig::default()
        };
        let connector = guarded_connector(raw, &config);

        sim.fail_transiently(1);
        let transport = connector("abc123").unwrap();
        let reply = transport.send(DeviceCommand::GetVar("product".into())).await.unwrap();
        assert_eq!(reply, b"lisa");
    }

    #[test]
    fn test_diff_devices() {
        let previous = BTreeMap::from([
            ("a".to_string(), DeviceMode::Adb),
            ("b".to_string(), DeviceMode::Bootloader),
        ]);
        let current = [listed("b", DeviceMode::Fastbootd), listed("c", DeviceMode::Adb)];
        assert_eq!(
            diff_devices(&previous, &current),
            vec![
                DeviceEvent::Detached { serial: "a".into() },
                DeviceEvent::ModeChanged {
                    serial: "b".into(),
                    mode: DeviceMode::Fastbootd
                },
                DeviceEvent::Attached {
                    serial: "c".into(),
                    mode: DeviceMode::Adb
                },
            ]
        );
        assert!(diff_devices(&BTreeMap::new(), &[]).is_empty());
    }

    fn registry_with(sim: Arc<SimulatedDevice>) -> SessionRegistry {
        SessionRegistry::new(Arc::new(
            move |_serial: &str| -> Result<Arc<dyn Transport>, TransportError> { Ok(sim.clone()) },
        ))
    }

    #[tokio::test]
    async fn test_registry_lifecycle() {
        let sim = Arc::new(SimulatedDevice::new("lisa", DeviceMode::Bootloader));
        let registry = registry_with(sim);

        registry
            .handle(DeviceEvent::Attached {
                serial: "abc".into(),
                mode: DeviceMode::Bootloader,
            })
            .await
            .unwrap();
        let session = registry.get("abc").unwrap();
        assert_eq!(session.model().as_deref(), Some("lisa"));

        registry
            .handle(DeviceEvent::ModeChanged {
                serial: "abc".into(),
                mode: DeviceMode::Fastbootd,
            })
            .await
            .unwrap();
        assert_eq!(session.current_mode(), DeviceMode::Fastbootd);

        registry
            .handle(DeviceEvent::Detached { serial: "abc".into() })
            .await
            .unwrap();
        assert!(registry.get("abc").is_none());
        assert!(session.is_detached());
    }

    struct ScriptedLister {
        listings: Mutex<Vec<Vec<ConnectedDevice>>>,
    }

    #[async_trait]
    impl DeviceLister for ScriptedLister {
        async fn list_devices(&self) -> Result<Vec<ConnectedDevice>, TransportError> {
            let mut listings = self.listings.lock().unwrap();
            if listings.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(listings.remove(0))
            }
        }
    }

    #[tokio::test]
    async fn test_watcher_feeds_registry() {
        let lister = Arc::new(ScriptedLister {
            listings: Mutex::new(vec![vec![listed("abc", DeviceMode::Bootloader)]]),
        });
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let watcher = spawn_watcher(lister, Duration::from_millis(5), tx, cancel.clone());

        let sim = Arc::new(SimulatedDevice::new("lisa", DeviceMode::Bootloader));
        let registry = Arc::new(registry_with(sim));
        let runner = tokio::spawn({
            let registry = registry.clone();
            async move { registry.run(rx).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        watcher.await.unwrap();
        runner.await.unwrap();

        // attached on the first listing, detached on the empty second one
        assert!(registry.serials().is_empty());
    }
}
