//! Mode transitions and the permission table behind the mode lock.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TransitionConfig;
use crate::device::DeviceMode;
use crate::error::{TransitionError, TransportError};
use crate::session::DeviceSession;
use crate::transport::{DeviceCommand, RebootTarget};

/// Reboot command that moves a device from `from` to `to`, if that edge exists.
///
/// Sideload only leads back to the bootloader; going from sideload straight
/// to the system is not a supported hop.
pub fn reboot_target_for(from: DeviceMode, to: DeviceMode) -> Option<RebootTarget> {
    use DeviceMode::*;
    match (from, to) {
        (Adb, Bootloader) => Some(RebootTarget::Bootloader),
        (Adb, Fastbootd) => Some(RebootTarget::Fastbootd),
        (Adb, Sideload) => Some(RebootTarget::Sideload),
        (Bootloader, Fastbootd) => Some(RebootTarget::Fastbootd),
        (Bootloader, Adb) => Some(RebootTarget::System),
        (Fastbootd, Bootloader) => Some(RebootTarget::Bootloader),
        (Fastbootd, Adb) => Some(RebootTarget::System),
        (Sideload, Bootloader) => Some(RebootTarget::Bootloader),
        _ => None,
    }
}

/// Staying put is always allowed, except in `Unknown`.
pub fn is_permitted(from: DeviceMode, to: DeviceMode) -> bool {
    (from == to && from != DeviceMode::Unknown) || reboot_target_for(from, to).is_some()
}

pub fn permitted_targets(from: DeviceMode) -> Vec<DeviceMode> {
    DeviceMode::ALL
        .into_iter()
        .filter(|to| *to != from && reboot_target_for(from, *to).is_some())
        .collect()
}

/// Fails with `ModeLocked` unless `mode` is one of `allowed`.
pub fn check_lock(mode: DeviceMode, allowed: &[DeviceMode], operation: &'static str) -> Result<(), TransitionError> {
    if allowed.contains(&mode) {
        Ok(())
    } else {
        Err(TransitionError::ModeLocked { operation, mode })
    }
}

#[derive(Debug, Clone)]
pub struct ModeTransitionController {
    config: TransitionConfig,
}

impl ModeTransitionController {
    pub fn new(config: TransitionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransitionConfig {
        &self.config
    }

    /// Reboots `session` into `target` and waits until the device confirms it.
    ///
    /// Disallowed edges fail with `InvalidTransition` before any command is sent.
    pub async fn request_transition(
        &self,
        session: &DeviceSession,
        target: DeviceMode,
    ) -> Result<DeviceMode, TransitionError> {
        let from = session.detect_mode().await?;
        if from == target && target != DeviceMode::Unknown {
            return Ok(target);
        }
        let reboot = reboot_target_for(from, target).ok_or(TransitionError::InvalidTransition { from, to: target })?;

        info!(serial = %session.serial(), %from, to = %target, "switching mode");
        match session.send(DeviceCommand::Reboot(reboot)).await {
            Ok(_) => {}
            // The link commonly drops while the device goes down.
            Err(e @ (TransportError::Disconnected | TransportError::Timeout(_))) => {
                debug!(serial = %session.serial(), error = %e, "reboot reply lost");
            }
            Err(e) => return Err(e.into()),
        }
        session.record_mode(DeviceMode::Unknown);
        tokio::time::sleep(self.config.settle()).await;
        self.await_mode(session, target, self.config.timeout()).await
    }

    /// Polls until `session` reports `target` or `timeout` elapses.
    pub async fn await_mode(
        &self,
        session: &DeviceSession,
        target: DeviceMode,
        timeout: Duration,
    ) -> Result<DeviceMode, TransitionError> {
        let started = Instant::now();
        loop {
            let mode = session.detect_mode().await?;
            if mode == target {
                debug!(serial = %session.serial(), %mode, waited = ?started.elapsed(), "mode confirmed");
                return Ok(mode);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                warn!(serial = %session.serial(), %target, last = %mode, "mode transition timed out");
                return Err(TransitionError::TransitionTimeout {
                    target,
                    last: mode,
                    waited,
                });
            }
            tokio::time::sleep(self.config.poll_interval().min(timeout - waited)).await;
        }
    }

    /// Transitions only if the device is not already in `target`.
    pub async fn ensure_mode(&self, session: &DeviceSession, target: DeviceMode) -> Result<DeviceMode, TransitionError> {
        if session.current_mode() == target && session.detect_mode().await? == target {
            return Ok(target);
        }
        self.request_transition(session, target).await
    }
}
