use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceMode;

/// Failure reported by a device transport (adb/fastboot tooling, or the simulator).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("device disconnected")]
    Disconnected,

    #[error("device did not answer within {0:?}")]
    Timeout(Duration),

    #[error("device rejected the command: {0}")]
    Rejected(String),

    #[error("write stopped after {written} bytes: {reason}")]
    Interrupted { written: u64, reason: String },

    #[error("command not supported in this mode or by this transport: {0}")]
    Unsupported(String),

    #[error("tool executable not found, expected at: {0}")]
    ToolNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Errors worth retrying on idempotent commands. A rejection is an answer, not a glitch.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected | TransportError::Timeout(_) | TransportError::Io(_)
        )
    }

    /// Byte offset reached before the transport gave up, when it knows it.
    pub fn written(&self) -> Option<u64> {
        match self {
            TransportError::Interrupted { written, .. } => Some(*written),
            _ => None,
        }
    }
}

/// A script line that could not be turned into a plan step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    pub line: usize,
    pub kind: ParseErrorKind,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    #[error("unknown keyword `{0}`")]
    UnknownKeyword(String),

    #[error("`{keyword}` is missing its {what}")]
    MissingArgument {
        keyword: &'static str,
        what: &'static str,
    },

    #[error("unexpected argument `{0}`")]
    UnexpectedArgument(String),

    #[error("unknown device mode `{0}`")]
    InvalidMode(String),

    #[error("invalid slot `{0}`, expected a, b or ab")]
    InvalidSlot(String),

    #[error("invalid size `{0}`")]
    InvalidSize(String),

    #[error("invalid duration `{0}`")]
    InvalidDuration(String),

    #[error("slot for `{0}` is given both as a suffix and as an argument")]
    ConflictingSlot(String),

    #[error("referenced file `{0}` not found")]
    MissingSource(String),

    #[error("device cannot switch from {from} to {to}")]
    UnreachableMode { from: DeviceMode, to: DeviceMode },

    #[error("`{keyword}` cannot run in {mode} mode")]
    ModeLocked {
        keyword: &'static str,
        mode: DeviceMode,
    },

    #[error("VERIFY has no flashed partition to check")]
    VerifyWithoutFlash,

    #[error("REQUIRE must come before the first step")]
    RequireAfterSteps,

    #[error("script contains no steps")]
    EmptyScript,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("device {serial} is busy with another operation")]
    Busy { serial: String },

    #[error("device {serial} was detached")]
    Detached { serial: String },

    #[error("device {serial} is in {actual} mode, expected {expected}")]
    ModeMismatch {
        serial: String,
        expected: DeviceMode,
        actual: DeviceMode,
    },

    #[error("device query failed: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("switching from {from} to {to} is not permitted")]
    InvalidTransition { from: DeviceMode, to: DeviceMode },

    #[error("device did not reach {target} within {waited:?} (last seen in {last})")]
    TransitionTimeout {
        target: DeviceMode,
        last: DeviceMode,
        waited: Duration,
    },

    #[error("{operation} is locked while the device is in {mode} mode")]
    ModeLocked {
        operation: &'static str,
        mode: DeviceMode,
    },

    #[error("reboot command failed: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Runtime failure of a single plan step. Carries the step index so the operator
/// can locate it in the script.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("step {step}: could not reach the required mode: {source}")]
    Transition {
        step: usize,
        #[source]
        source: TransitionError,
    },

    #[error("step {step}: writing `{partition}` failed {}: {source}", describe_offset(.offset))]
    PartitionWrite {
        step: usize,
        partition: String,
        offset: Option<u64>,
        #[source]
        source: TransportError,
    },

    #[error("step {step}: checksum mismatch on `{partition}` (expected {expected}, device has {actual})")]
    ChecksumMismatch {
        step: usize,
        partition: String,
        expected: String,
        actual: String,
    },

    #[error("step {step}: cannot load `{reference}`: {reason}")]
    Source {
        step: usize,
        reference: String,
        reason: String,
    },

    #[error("step {step}: {action} failed: {source}")]
    Command {
        step: usize,
        action: String,
        #[source]
        source: TransportError,
    },

    #[error("step {step}: timed out waiting for {condition}")]
    WaitTimeout { step: usize, condition: String },

    #[error("device model `{actual}` is not one of {expected:?}")]
    DeviceMismatch {
        expected: Vec<String>,
        actual: String,
    },
}

impl StepError {
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(self, StepError::ChecksumMismatch { .. })
    }
}

fn describe_offset(offset: &Option<u64>) -> String {
    match offset {
        Some(written) => format!("at byte {}", written),
        None => "before completion".to_string(),
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("backup store error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("raw partition reads are unavailable in {mode} mode")]
    WrongMode { mode: DeviceMode },

    #[error("partition `{0}` does not exist on this device")]
    UnknownPartition(String),

    #[error("device model is unknown, refusing to create an untagged backup")]
    UnknownModel,

    #[error("reading `{partition}` failed: {source}")]
    Read {
        partition: String,
        #[source]
        source: TransportError,
    },

    #[error("device returned no data for `{0}`")]
    Empty(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("backup of `{partition}` is corrupted (recorded {expected}, data hashes to {actual})")]
    Corrupted {
        partition: String,
        expected: String,
        actual: String,
    },

    #[error("backup was taken from `{expected}` but the attached device is `{actual}`")]
    ModelMismatch { expected: String, actual: String },

    #[error("partition writes are unavailable in {mode} mode")]
    WrongMode { mode: DeviceMode },

    #[error("writing `{partition}` failed {}: {source}", describe_offset(.offset))]
    Write {
        partition: String,
        offset: Option<u64>,
        #[source]
        source: TransportError,
    },

    #[error("read-back of `{partition}` does not match the backup (expected {expected}, got {actual})")]
    VerifyFailed {
        partition: String,
        expected: String,
        actual: String,
    },

    #[error("no backup with checksum {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("script error: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),

    #[error("restore failed: {0}")]
    Restore(#[from] RestoreError),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, FlashError>;
