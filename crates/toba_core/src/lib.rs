pub mod error;
pub mod device;
pub mod constants;
pub mod config;
pub mod utils;

pub mod transport;
pub mod adb;
pub mod fastboot;
pub mod tools;
pub mod sim;

pub mod session;
pub mod registry;
pub mod transition;

pub mod plan;
pub mod source;
pub mod script;
pub mod events;
pub mod executor;
pub mod backup;

pub use error::{
    BackupError, FlashError, ParseError, ParseErrorKind, RestoreError, Result, SessionError, StepError, StoreError,
    TransitionError, TransportError,
};
pub use device::{ConnectedDevice, DeviceMode, Slot, SlotTarget};
pub use config::{EngineConfig, ExecutorOptions, RetryPolicy, TransitionConfig};
pub use transport::{DeviceCommand, GuardedTransport, RebootTarget, Transport};
pub use adb::AdbClient;
pub use fastboot::FastbootClient;
pub use tools::PlatformTools;
pub use sim::SimulatedDevice;
pub use session::{DeviceSession, SessionGuard};
pub use registry::{DeviceEvent, DeviceLister, SessionRegistry};
pub use transition::ModeTransitionController;
pub use plan::{FlashPlan, FlashStep, PlannedStep, WaitCondition};
pub use source::{MemorySources, SourceError, SourceResolver};
pub use script::{CheckReport, ScriptInterpreter};
pub use events::{ChannelSink, EventSink, ExecutionEvent, FanoutSink, NullSink, StepStatus, TracingSink};
pub use executor::{ExecutionResult, FlashPlanExecutor, PlanStatus, StepOutcome};
pub use backup::{BackupManager, BackupStore, BasebandBackup, MemoryBackupStore};
