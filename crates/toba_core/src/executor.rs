//! Runs a validated [`FlashPlan`] against one device session.
//!
//! Steps run strictly in order while the session lock is held. Before a step
//! the device is brought into the mode the step was planned for. A failed
//! destructive step halts the plan; non-destructive steps (`WAIT`, `VERIFY`
//! reads, mode switches) may fail and let the plan continue, depending on
//! [`ExecutorOptions`]. A checksum mismatch always halts. Partition writes are
//! never retried. Cancellation is honoured between steps only, so a write in
//! flight always runs to completion or to a device-reported failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ExecutorOptions;
use crate::constants::WIPE_PARTITIONS;
use crate::device::{DeviceMode, SlotTarget, slot_partitions};
use crate::error::{SessionError, StepError, TransitionError, TransportError};
use crate::events::{EventSink, ExecutionEvent, LogLevel, StepStatus};
use crate::plan::{FlashPlan, FlashStep, PlannedStep, WaitCondition};
use crate::session::DeviceSession;
use crate::source::SourceResolver;
use crate::transition::{ModeTransitionController, check_lock, is_permitted};
use crate::transport::DeviceCommand;
use crate::utils::{parse_checksum_file, prefix_digest, split_slot_suffix};

#[derive(Debug)]
pub enum StepOutcome {
    Success,
    Skipped(String),
    Failed(StepError),
}

impl StepOutcome {
    pub fn status(&self) -> StepStatus {
        match self {
            StepOutcome::Success => StepStatus::Success,
            StepOutcome::Skipped(_) => StepStatus::Skipped,
            StepOutcome::Failed(_) => StepStatus::Failed,
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            StepOutcome::Success => None,
            StepOutcome::Skipped(reason) => Some(reason.clone()),
            StepOutcome::Failed(err) => Some(err.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success)
    }
}

#[derive(Debug)]
pub struct StepRecord {
    /// 1-indexed position in the plan.
    pub index: usize,
    pub line: usize,
    pub description: String,
    pub outcome: StepOutcome,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub enum PlanStatus {
    Succeeded,
    /// At least one step failed. `halted_at` is the step that stopped the
    /// plan, or `None` when only recoverable steps failed and the plan ran
    /// to the end.
    Failed { halted_at: Option<usize> },
    /// Refused before any step ran.
    Rejected(StepError),
    /// `at` is the first step that did not run because of cancellation.
    Cancelled { at: usize },
}

/// Outcome of one `execute` call. Immutable once returned.
#[derive(Debug)]
pub struct ExecutionResult {
    pub steps: Vec<StepRecord>,
    pub log: Vec<String>,
    pub status: PlanStatus,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self.status, PlanStatus::Succeeded)
    }

    pub fn outcome(&self, index: usize) -> Option<&StepOutcome> {
        self.steps.iter().find(|r| r.index == index).map(|r| &r.outcome)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|r| r.outcome.status() == status).count()
    }

    pub fn summary(&self) -> String {
        let counts = format!(
            "{} succeeded, {} skipped, {} failed",
            self.count(StepStatus::Success),
            self.count(StepStatus::Skipped),
            self.count(StepStatus::Failed)
        );
        match &self.status {
            PlanStatus::Succeeded => format!("plan succeeded: {}", counts),
            PlanStatus::Failed { halted_at: Some(step) } => format!("plan halted at step {}: {}", step, counts),
            PlanStatus::Failed { halted_at: None } => format!("plan finished with failures: {}", counts),
            PlanStatus::Rejected(reason) => format!("plan rejected: {}", reason),
            PlanStatus::Cancelled { at } => format!("plan cancelled before step {}: {}", at, counts),
        }
    }
}

/// Bookkeeping for one execution.
struct Run<'a> {
    sink: &'a dyn EventSink,
    records: Vec<StepRecord>,
    log: Vec<String>,
    /// Bytes written per partition in this run; verification hashes only that prefix.
    flashed: HashMap<String, usize>,
}

impl<'a> Run<'a> {
    fn new(sink: &'a dyn EventSink) -> Self {
        Self {
            sink,
            records: Vec::new(),
            log: Vec::new(),
            flashed: HashMap::new(),
        }
    }

    fn info(&mut self, message: String) {
        debug!("{}", message);
        self.push_log(LogLevel::Info, message);
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.push_log(LogLevel::Warn, message);
    }

    fn push_log(&mut self, level: LogLevel, message: String) {
        self.log.push(message.clone());
        self.sink.publish(ExecutionEvent::Log { level, message });
    }

    fn progress(&self, index: usize, partition: &str, done: u64, total: u64) {
        self.sink.publish(ExecutionEvent::Progress {
            index,
            partition: partition.to_string(),
            done,
            total,
        });
    }

    fn record(&mut self, index: usize, planned: &PlannedStep, outcome: StepOutcome, elapsed: Duration) {
        let status = outcome.status();
        let detail = outcome.detail();
        let line = match &detail {
            Some(detail) => format!("step {} ({}): {:?} - {}", index, planned.step, status, detail),
            None => format!("step {} ({}): {:?}", index, planned.step, status),
        };
        self.log.push(line);
        self.sink.publish(ExecutionEvent::StepFinished { index, status, detail });
        self.records.push(StepRecord {
            index,
            line: planned.line,
            description: planned.step.to_string(),
            outcome,
            elapsed,
        });
    }

    fn into_result(self, status: PlanStatus) -> ExecutionResult {
        let result = ExecutionResult {
            steps: self.records,
            log: self.log,
            status,
        };
        self.sink.publish(ExecutionEvent::PlanFinished {
            succeeded: result.is_success(),
            summary: result.summary(),
        });
        result
    }
}

pub struct FlashPlanExecutor {
    controller: ModeTransitionController,
    sources: Arc<dyn SourceResolver>,
    sink: Arc<dyn EventSink>,
    options: ExecutorOptions,
    cancel: CancellationToken,
}

impl FlashPlanExecutor {
    pub fn new(controller: ModeTransitionController, sources: Arc<dyn SourceResolver>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            controller,
            sources,
            sink,
            options: ExecutorOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the plan at the next step boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs `plan` on `session`. Fails only if the session cannot be
    /// acquired; every device-side failure is reported in the result.
    pub async fn execute(&self, plan: &FlashPlan, session: &DeviceSession) -> Result<ExecutionResult, SessionError> {
        let _guard = session.acquire()?;
        let mut run = Run::new(self.sink.as_ref());
        info!(serial = %session.serial(), steps = plan.len(), "executing plan");
        self.sink.publish(ExecutionEvent::PlanStarted {
            serial: session.serial().to_string(),
            steps: plan.len(),
            mode: plan.start_mode(),
        });

        if !plan.devices().is_empty() {
            let model = session.resolve_model().await.unwrap_or_default();
            if !plan.accepts_model(&model) {
                let err = StepError::DeviceMismatch {
                    expected: plan.devices().to_vec(),
                    actual: model,
                };
                run.warn(err.to_string());
                for (i, planned) in plan.steps().iter().enumerate() {
                    run.record(i + 1, planned, StepOutcome::Skipped("device model mismatch".into()), Duration::ZERO);
                }
                return Ok(run.into_result(PlanStatus::Rejected(err)));
            }
        }

        let steps = plan.steps();
        let mut status = PlanStatus::Succeeded;
        let mut stopped: Option<String> = None;
        let mut any_failed = false;

        for (i, planned) in steps.iter().enumerate() {
            let index = i + 1;
            if stopped.is_none() && self.cancel.is_cancelled() {
                run.warn(format!("cancelled before step {}", index));
                status = PlanStatus::Cancelled { at: index };
                stopped = Some("cancelled".into());
            }
            if let Some(reason) = &stopped {
                run.record(index, planned, StepOutcome::Skipped(reason.clone()), Duration::ZERO);
                continue;
            }

            self.sink.publish(ExecutionEvent::StepStarted {
                index,
                line: planned.line,
                description: planned.step.to_string(),
            });
            let started = Instant::now();
            let outcome = match self.dispatch(&mut run, session, index, planned, steps.get(i + 1)).await {
                Ok(outcome) => outcome,
                Err(err) => StepOutcome::Failed(err),
            };

            let halt = match &outcome {
                StepOutcome::Failed(err) => {
                    any_failed = true;
                    err.is_checksum_mismatch()
                        || !planned.step.may_continue_after_failure()
                        || !self.options.continue_on_nondestructive_failure
                }
                _ => false,
            };
            let interrupted = matches!(outcome, StepOutcome::Skipped(_))
                && matches!(planned.step, FlashStep::Wait { .. })
                && self.cancel.is_cancelled();
            run.record(index, planned, outcome, started.elapsed());

            if halt {
                status = PlanStatus::Failed { halted_at: Some(index) };
                stopped = Some(format!("plan halted at step {}", index));
            } else if interrupted {
                status = PlanStatus::Cancelled { at: index };
                stopped = Some("cancelled".into());
            }
        }

        if any_failed && matches!(status, PlanStatus::Succeeded) {
            status = PlanStatus::Failed { halted_at: None };
        }
        Ok(run.into_result(status))
    }

    async fn dispatch(
        &self,
        run: &mut Run<'_>,
        session: &DeviceSession,
        index: usize,
        planned: &PlannedStep,
        next: Option<&PlannedStep>,
    ) -> Result<StepOutcome, StepError> {
        match &planned.step {
            FlashStep::Wait { condition } => self.wait(session, index, condition).await,
            FlashStep::SwitchMode { target } => self.switch_mode(session, index, planned.mode, *target).await,
            FlashStep::FlashPartition {
                partition,
                source,
                slot,
                disable_verity,
            } => {
                self.enter(session, index, planned).await?;
                self.flash(run, session, index, partition, source, *slot, *disable_verity, next)
                    .await
            }
            FlashStep::ErasePartition { partition } => {
                self.enter(session, index, planned).await?;
                self.command(session, index, DeviceCommand::Erase(partition.clone())).await?;
                run.info(format!("erased {}", partition));
                Ok(StepOutcome::Success)
            }
            FlashStep::WipeData => {
                self.enter(session, index, planned).await?;
                self.wipe(run, session, index).await
            }
            FlashStep::CreateLogical { name, size } => {
                self.enter(session, index, planned).await?;
                let command = DeviceCommand::CreateLogical {
                    name: name.clone(),
                    size: *size,
                };
                self.command(session, index, command).await?;
                Ok(StepOutcome::Success)
            }
            FlashStep::DeleteLogical { name } => {
                self.enter(session, index, planned).await?;
                self.delete_logical(run, session, index, name).await
            }
            FlashStep::SetActiveSlot { slot } => {
                self.enter(session, index, planned).await?;
                self.command(session, index, DeviceCommand::SetActive(*slot)).await?;
                session.record_slot(*slot);
                run.info(format!("active slot is now {}", slot));
                Ok(StepOutcome::Success)
            }
            FlashStep::Verify {
                partition,
                slot,
                checksum,
            } => {
                self.enter(session, index, planned).await?;
                self.verify(run, session, index, partition, *slot, checksum).await
            }
        }
    }

    /// Deletes `name` together with its slot copies and their `-cow` snapshots.
    /// Missing targets are skipped; the step is skipped if none existed.
    async fn delete_logical(
        &self,
        run: &mut Run<'_>,
        session: &DeviceSession,
        index: usize,
        name: &str,
    ) -> Result<StepOutcome, StepError> {
        let mut deleted = 0;
        for target in logical_targets(name) {
            match session.send(DeviceCommand::DeleteLogical(target.clone())).await {
                Ok(_) => {
                    run.info(format!("deleted logical partition {}", target));
                    deleted += 1;
                }
                Err(TransportError::Rejected(msg)) if is_missing_partition(&msg) => {
                    debug!(partition = %target, "logical partition not present");
                }
                Err(source) => {
                    return Err(StepError::Command {
                        step: index,
                        action: format!("deleting logical partition {}", target),
                        source,
                    });
                }
            }
        }
        if deleted == 0 {
            return Ok(StepOutcome::Skipped(format!("logical partition {} does not exist", name)));
        }
        Ok(StepOutcome::Success)
    }

    /// Brings the device into the step's planned mode and checks the mode lock.
    async fn enter(&self, session: &DeviceSession, index: usize, planned: &PlannedStep) -> Result<(), StepError> {
        let transition = |source| StepError::Transition { step: index, source };
        let mode = self.controller.ensure_mode(session, planned.mode).await.map_err(transition)?;
        check_lock(mode, planned.step.allowed_modes(), planned.step.keyword()).map_err(transition)
    }

    async fn command(&self, session: &DeviceSession, index: usize, command: DeviceCommand) -> Result<Vec<u8>, StepError> {
        let action = command.to_string();
        session
            .send(command)
            .await
            .map_err(|source| StepError::Command { step: index, action, source })
    }

    async fn switch_mode(
        &self,
        session: &DeviceSession,
        index: usize,
        from: DeviceMode,
        target: DeviceMode,
    ) -> Result<StepOutcome, StepError> {
        let transition = |source| StepError::Transition { step: index, source };
        let current = session
            .detect_mode()
            .await
            .map_err(|e| transition(TransitionError::from(e)))?;
        if current == target {
            return Ok(StepOutcome::Success);
        }
        if !is_permitted(current, target) {
            // Back to where the plan expected the device, then take the planned edge.
            self.controller.ensure_mode(session, from).await.map_err(transition)?;
        }
        self.controller
            .request_transition(session, target)
            .await
            .map_err(transition)?;
        Ok(StepOutcome::Success)
    }

    #[allow(clippy::too_many_arguments)]
    async fn flash(
        &self,
        run: &mut Run<'_>,
        session: &DeviceSession,
        index: usize,
        partition: &str,
        source: &str,
        slot: Option<SlotTarget>,
        disable_verity: bool,
        next: Option<&PlannedStep>,
    ) -> Result<StepOutcome, StepError> {
        let data: Arc<[u8]> = self
            .sources
            .load(source)
            .await
            .map_err(|e| StepError::Source {
                step: index,
                reference: source.to_string(),
                reason: e.to_string(),
            })?
            .into();
        let targets = slot_partitions(partition, slot);

        if self.options.skip_verified_partitions
            && let Some(FlashStep::Verify {
                partition: verified,
                slot: verified_slot,
                checksum,
            }) = next.map(|n| &n.step)
            && verified == partition
            && *verified_slot == slot
            && session.current_mode().exposes_raw_read()
            && self.already_on_device(session, index, &targets, data.len(), checksum).await
        {
            for target in &targets {
                run.flashed.insert(target.clone(), data.len());
            }
            run.info(format!("{} already matches {}, not flashing", partition, checksum));
            return Ok(StepOutcome::Skipped("already verified".into()));
        }

        let total = data.len() as u64;
        for target in &targets {
            run.progress(index, target, 0, total);
            let command = DeviceCommand::Flash {
                partition: target.clone(),
                data: data.clone(),
                disable_verity,
            };
            session.send(command).await.map_err(|source| StepError::PartitionWrite {
                step: index,
                partition: target.clone(),
                offset: source.written(),
                source,
            })?;
            run.progress(index, target, total, total);
            run.flashed.insert(target.clone(), data.len());
            run.info(format!("flashed {} ({} bytes from {})", target, total, source));
        }
        Ok(StepOutcome::Success)
    }

    async fn already_on_device(
        &self,
        session: &DeviceSession,
        index: usize,
        targets: &[String],
        len: usize,
        checksum: &str,
    ) -> bool {
        let Ok(expected) = self.expected_digest(index, checksum).await else {
            return false;
        };
        for target in targets {
            match session.send(DeviceCommand::ReadPartition(target.clone())).await {
                Ok(data) if prefix_digest(&data, Some(len)) == expected => {}
                Ok(_) => return false,
                Err(e) => {
                    debug!(partition = %target, error = %e, "pre-flash read failed");
                    return false;
                }
            }
        }
        true
    }

    async fn verify(
        &self,
        run: &mut Run<'_>,
        session: &DeviceSession,
        index: usize,
        partition: &str,
        slot: Option<SlotTarget>,
        checksum: &str,
    ) -> Result<StepOutcome, StepError> {
        let expected = self.expected_digest(index, checksum).await?;
        for target in slot_partitions(partition, slot) {
            let data = session
                .send(DeviceCommand::ReadPartition(target.clone()))
                .await
                .map_err(|source| StepError::Command {
                    step: index,
                    action: format!("reading back {}", target),
                    source,
                })?;
            let actual = prefix_digest(&data, run.flashed.get(&target).copied());
            if actual != expected {
                return Err(StepError::ChecksumMismatch {
                    step: index,
                    partition: target,
                    expected,
                    actual,
                });
            }
            run.info(format!("{} verified ({})", target, expected));
        }
        Ok(StepOutcome::Success)
    }

    async fn expected_digest(&self, index: usize, checksum: &str) -> Result<String, StepError> {
        if !self.sources.exists(checksum)
            && let Some(digest) = parse_checksum_file(checksum.as_bytes())
        {
            return Ok(digest);
        }
        let source_error = |reason: String| StepError::Source {
            step: index,
            reference: checksum.to_string(),
            reason,
        };
        let contents = self.sources.load(checksum).await.map_err(|e| source_error(e.to_string()))?;
        parse_checksum_file(&contents).ok_or_else(|| source_error("no SHA-256 digest found".into()))
    }

    async fn wipe(&self, run: &mut Run<'_>, session: &DeviceSession, index: usize) -> Result<StepOutcome, StepError> {
        for (i, name) in WIPE_PARTITIONS.iter().enumerate() {
            match session.send(DeviceCommand::Erase(name.to_string())).await {
                Ok(_) => run.info(format!("erased {}", name)),
                // Only userdata is mandatory; older devices have no metadata partition.
                Err(TransportError::Rejected(msg)) if i > 0 => run.warn(format!("{} not erased: {}", name, msg)),
                Err(source) => {
                    return Err(StepError::Command {
                        step: index,
                        action: format!("erasing {}", name),
                        source,
                    });
                }
            }
        }
        Ok(StepOutcome::Success)
    }

    async fn wait(&self, session: &DeviceSession, index: usize, condition: &WaitCondition) -> Result<StepOutcome, StepError> {
        let timeout = self.controller.config().timeout();
        let timed_out = || StepError::WaitTimeout {
            step: index,
            condition: condition.to_string(),
        };
        match condition {
            WaitCondition::Duration { duration } => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Ok(StepOutcome::Skipped("cancelled".into())),
                    _ = tokio::time::sleep(*duration) => Ok(StepOutcome::Success),
                }
            }
            WaitCondition::Mode { mode } => match self.controller.await_mode(session, *mode, timeout).await {
                Ok(_) => Ok(StepOutcome::Success),
                Err(TransitionError::TransitionTimeout { .. }) => Err(timed_out()),
                Err(source) => Err(StepError::Transition { step: index, source }),
            },
            WaitCondition::Device => {
                let started = Instant::now();
                loop {
                    let mode = session
                        .detect_mode()
                        .await
                        .map_err(|e| StepError::Transition {
                            step: index,
                            source: e.into(),
                        })?;
                    if mode != DeviceMode::Unknown {
                        return Ok(StepOutcome::Success);
                    }
                    if started.elapsed() >= timeout {
                        return Err(timed_out());
                    }
                    tokio::time::sleep(self.controller.config().poll_interval()).await;
                }
            }
        }
    }
}

/// `name` plus both slot copies and the virtual A/B snapshots. A name that
/// already carries a slot suffix only expands to itself and its snapshot.
fn logical_targets(name: &str) -> Vec<String> {
    match split_slot_suffix(name) {
        (_, Some(_)) => vec![name.to_string(), format!("{}-cow", name)],
        (_, None) => vec![
            name.to_string(),
            format!("{}_a", name),
            format!("{}_b", name),
            format!("{}_a-cow", name),
            format!("{}_b-cow", name),
        ],
    }
}

fn is_missing_partition(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["not found", "could not find", "does not exist", "no such"]
        .iter()
        .any(|needle| message.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransitionConfig;
    use crate::device::Slot;
    use crate::events::MemorySink;
    use crate::script::ScriptInterpreter;
    use crate::sim::SimulatedDevice;
    use crate::source::MemorySources;
    use crate::utils::sha256_hex;

    const IMAGE: &[u8] = b"ANDROID!boot image payload";

    fn controller() -> ModeTransitionController {
        ModeTransitionController::new(TransitionConfig {
            timeout_secs: 1,
            poll_interval_ms: 5,
            settle_ms: 0,
        })
    }

    fn sources(checksum_of: &[u8]) -> Arc<MemorySources> {
        Arc::new(
            MemorySources::new()
                .with("boot.img", IMAGE.to_vec())
                .with("boot.sha256", format!("{}  boot.img\n", sha256_hex(checksum_of)).into_bytes()),
        )
    }

    fn plan(text: &str, sources: &MemorySources) -> FlashPlan {
        ScriptInterpreter::new().parse(text, sources).unwrap()
    }

    fn device() -> Arc<SimulatedDevice> {
        Arc::new(
            SimulatedDevice::new("lisa", DeviceMode::Bootloader)
                .with_slot(Slot::A)
                .with_partition("boot", 4096)
                .with_partition("boot_a", 4096)
                .with_partition("boot_b", 4096)
                .with_partition("userdata", 4096)
                .with_partition("metadata", 4096),
        )
    }

    async fn session(sim: &Arc<SimulatedDevice>) -> DeviceSession {
        DeviceSession::attach("abc123", sim.clone()).await.unwrap()
    }

    const FLASH_AND_VERIFY: &str = "MODE fastbootd\nFLASH boot boot.img\nVERIFY boot.sha256\n";

    #[tokio::test]
    async fn test_flash_and_verify_succeeds() {
        let sim = device();
        let session = session(&sim).await;
        let sources = sources(IMAGE);
        let plan = plan(FLASH_AND_VERIFY, &sources);
        let sink = Arc::new(MemorySink::new());
        let executor = FlashPlanExecutor::new(controller(), sources, sink.clone());

        let result = executor.execute(&plan, &session).await.unwrap();
        assert!(result.is_success(), "{}", result.summary());
        assert_eq!(result.steps.len(), 3);
        assert!(result.steps.iter().all(|r| r.outcome.is_success()));
        assert_eq!(sim.mode(), DeviceMode::Fastbootd);
        assert_eq!(sim.partition("boot").unwrap(), IMAGE);

        let events = sink.events();
        assert!(matches!(events.first(), Some(ExecutionEvent::PlanStarted { steps: 3, .. })));
        assert!(matches!(events.last(), Some(ExecutionEvent::PlanFinished { succeeded: true, .. })));
        let finished = events
            .iter()
            .filter(|e| matches!(e, ExecutionEvent::StepFinished { .. }))
            .count();
        assert_eq!(finished, 3);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_plan() {
        let sim = device();
        let session = session(&sim).await;
        let sources = sources(b"some other image");
        let plan = plan(FLASH_AND_VERIFY, &sources);
        let executor = FlashPlanExecutor::new(controller(), sources, Arc::new(crate::events::NullSink));

        let result = executor.execute(&plan, &session).await.unwrap();
        assert!(result.outcome(1).unwrap().is_success());
        assert!(result.outcome(2).unwrap().is_success());
        match result.outcome(3).unwrap() {
            StepOutcome::Failed(err) => assert!(err.is_checksum_mismatch()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(result.status, PlanStatus::Failed { halted_at: Some(3) }));
    }

    #[tokio::test]
    async fn test_interrupted_write_halts_with_offset() {
        let sim = device();
        sim.fail_write("boot", 8);
        let session = session(&sim).await;
        let sources = sources(IMAGE);
        let plan = plan(FLASH_AND_VERIFY, &sources);
        let executor = FlashPlanExecutor::new(controller(), sources, Arc::new(crate::events::NullSink));

        let result = executor.execute(&plan, &session).await.unwrap();
        match result.outcome(2).unwrap() {
            StepOutcome::Failed(StepError::PartitionWrite {
                step,
                partition,
                offset,
                ..
            }) => {
                assert_eq!(*step, 2);
                assert_eq!(partition, "boot");
                assert_eq!(*offset, Some(8));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(result.outcome(3), Some(StepOutcome::Skipped(_))));
        assert!(matches!(result.status, PlanStatus::Failed { halted_at: Some(2) }));
        // not retried
        assert_eq!(sim.history().iter().filter(|c| c.starts_with("flash")).count(), 1);
    }

    #[tokio::test]
    async fn test_second_execution_is_busy() {
        let sim = Arc::new(
            SimulatedDevice::new("lisa", DeviceMode::Bootloader)
                .with_partition("boot", 4096)
                .with_reboot_delay(4),
        );
        let session = session(&sim).await;
        let sources = sources(IMAGE);
        let plan = plan(FLASH_AND_VERIFY, &sources);
        let executor = FlashPlanExecutor::new(controller(), sources, Arc::new(crate::events::NullSink));

        let other = session.clone();
        let (first, second) = tokio::join!(executor.execute(&plan, &session), async {
            tokio::time::sleep(Duration::from_millis(2)).await;
            executor.execute(&plan, &other).await
        });
        assert!(first.unwrap().is_success());
        assert!(matches!(second, Err(SessionError::Busy { .. })));
        assert_eq!(sim.write_count("boot"), 1);
    }

    #[tokio::test]
    async fn test_cancellation_at_step_boundary() {
        let sim = device();
        let session = session(&sim).await;
        let sources = sources(IMAGE);
        let plan = plan("FLASH boot boot.img\nWAIT 10s\nERASE boot\n", &sources);
        let cancel = CancellationToken::new();
        let executor = FlashPlanExecutor::new(controller(), sources, Arc::new(crate::events::NullSink))
            .with_cancellation(cancel.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        let result = executor.execute(&plan, &session).await.unwrap();
        assert!(result.outcome(1).unwrap().is_success());
        assert!(matches!(result.outcome(2), Some(StepOutcome::Skipped(_))));
        assert!(matches!(result.outcome(3), Some(StepOutcome::Skipped(_))));
        assert!(matches!(result.status, PlanStatus::Cancelled { at: 2 }));
        assert_eq!(sim.partition("boot").unwrap(), IMAGE);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let sim = device();
        let session = session(&sim).await;
        let sources = sources(IMAGE);
        let plan = plan(FLASH_AND_VERIFY, &sources);
        let executor = FlashPlanExecutor::new(controller(), sources, Arc::new(crate::events::NullSink));
        executor.cancellation_token().cancel();

        let result = executor.execute(&plan, &session).await.unwrap();
        assert_eq!(result.count(StepStatus::Skipped), 3);
        assert!(matches!(result.status, PlanStatus::Cancelled { at: 1 }));
        assert_eq!(sim.mode(), DeviceMode::Bootloader);
    }

    #[tokio::test]
    async fn test_both_slots_flashed_in_order() {
        let sim = device();
        let session = session(&sim).await;
        let sources = sources(IMAGE);
        let plan = plan("FLASH boot boot.img ab\nSLOT set b\n", &sources);
        let executor = FlashPlanExecutor::new(controller(), sources, Arc::new(crate::events::NullSink));

        let result = executor.execute(&plan, &session).await.unwrap();
        assert!(result.is_success());
        let flashes: Vec<String> = sim.history().into_iter().filter(|c| c.starts_with("flash")).collect();
        assert!(flashes[0].starts_with("flash boot_a"));
        assert!(flashes[1].starts_with("flash boot_b"));
        assert_eq!(sim.active_slot(), Some(Slot::B));
        assert_eq!(session.slot(), Some(Slot::B));
    }

    #[tokio::test]
    async fn test_wrong_model_skips_everything() {
        let sim = device();
        let session = session(&sim).await;
        let sources = sources(IMAGE);
        let plan = plan("DEVICE venus\nFLASH boot boot.img\n", &sources);
        let executor = FlashPlanExecutor::new(controller(), sources, Arc::new(crate::events::NullSink));

        let result = executor.execute(&plan, &session).await.unwrap();
        assert!(matches!(
            result.status,
            PlanStatus::Rejected(StepError::DeviceMismatch { .. })
        ));
        assert_eq!(result.count(StepStatus::Skipped), 1);
        assert_eq!(sim.write_count("boot"), 0);
    }

    #[tokio::test]
    async fn test_nondestructive_failures_follow_policy() {
        let digest = sha256_hex(b"modem");
        let text = format!("MODE fastbootd\nVERIFY modem {}\nLOGICAL delete product_b\n", digest);
        let sources = sources(IMAGE);
        let plan = plan(&text, &sources);

        let sim = device();
        let session = session(&sim).await;
        let executor = FlashPlanExecutor::new(controller(), sources.clone(), Arc::new(crate::events::NullSink));
        let result = executor.execute(&plan, &session).await.unwrap();
        assert!(matches!(result.outcome(2), Some(StepOutcome::Failed(StepError::Command { .. }))));
        assert!(matches!(result.outcome(3), Some(StepOutcome::Skipped(_))));
        assert!(matches!(result.status, PlanStatus::Failed { halted_at: None }));

        let sim = device();
        let session = self::session(&sim).await;
        let strict = FlashPlanExecutor::new(controller(), sources, Arc::new(crate::events::NullSink)).with_options(
            ExecutorOptions {
                continue_on_nondestructive_failure: false,
                ..ExecutorOptions::default()
            },
        );
        let result = strict.execute(&plan, &session).await.unwrap();
        assert!(matches!(result.status, PlanStatus::Failed { halted_at: Some(2) }));
    }

    #[tokio::test]
    async fn test_failed_mode_switch_halts_plan() {
        let sources = sources(IMAGE);
        let plan = plan("MODE fastbootd\nWAIT 1ms\nLOGICAL delete product_b\n", &sources);
        let sim = device();
        sim.ignore_reboots();
        let session = session(&sim).await;
        let executor = FlashPlanExecutor::new(controller(), sources, Arc::new(crate::events::NullSink));

        let result = executor.execute(&plan, &session).await.unwrap();
        assert!(matches!(
            result.outcome(1),
            Some(StepOutcome::Failed(StepError::Transition { .. }))
        ));
        assert!(matches!(result.outcome(2), Some(StepOutcome::Skipped(_))));
        assert!(matches!(result.outcome(3), Some(StepOutcome::Skipped(_))));
        assert!(matches!(result.status, PlanStatus::Failed { halted_at: Some(1) }));
        let reboots = sim.history().iter().filter(|c| c.starts_with("reboot")).count();
        assert_eq!(reboots, 1);
    }

    #[tokio::test]
    async fn test_logical_delete_covers_slots_and_snapshots() {
        let sources = sources(IMAGE);
        let plan = plan("MODE fastbootd\nLOGICAL delete product\nLOGICAL delete odm\n", &sources);
        let sim = Arc::new(
            SimulatedDevice::new("lisa", DeviceMode::Bootloader)
                .with_slot(Slot::A)
                .with_partition("product_a", 4096)
                .with_partition("product_b", 4096)
                .with_partition("product_b-cow", 512)
                .with_partition("system_a", 4096),
        );
        let session = session(&sim).await;
        let executor = FlashPlanExecutor::new(controller(), sources, Arc::new(crate::events::NullSink));

        let result = executor.execute(&plan, &session).await.unwrap();
        assert!(result.is_success(), "{}", result.summary());
        assert!(matches!(result.outcome(2), Some(StepOutcome::Success)));
        assert!(matches!(result.outcome(3), Some(StepOutcome::Skipped(_))));
        for gone in ["product_a", "product_b", "product_b-cow"] {
            assert!(!sim.has_partition(gone), "{} still present", gone);
        }
        assert!(sim.has_partition("system_a"));
    }

    #[test]
    fn test_logical_targets() {
        assert_eq!(
            logical_targets("product"),
            vec!["product", "product_a", "product_b", "product_a-cow", "product_b-cow"]
        );
        assert_eq!(logical_targets("product_b"), vec!["product_b", "product_b-cow"]);
    }

    #[tokio::test]
    async fn test_verified_partition_not_reflashed() {
        let sim = Arc::new(SimulatedDevice::new("lisa", DeviceMode::Fastbootd).with_partition_data("boot", IMAGE));
        let session = session(&sim).await;
        let sources = sources(IMAGE);
        let plan = plan("REQUIRE fastbootd\nFLASH boot boot.img\nVERIFY boot.sha256\n", &sources);
        let executor = FlashPlanExecutor::new(controller(), sources, Arc::new(crate::events::NullSink)).with_options(
            ExecutorOptions {
                skip_verified_partitions: true,
                ..ExecutorOptions::default()
            },
        );

        let result = executor.execute(&plan, &session).await.unwrap();
        assert!(result.is_success(), "{}", result.summary());
        assert!(matches!(result.outcome(1), Some(StepOutcome::Skipped(reason)) if reason == "already verified"));
        assert!(result.outcome(2).unwrap().is_success());
        assert_eq!(sim.write_count("boot"), 0);
    }

    #[tokio::test]
    async fn test_device_brought_to_planned_mode() {
        let sim = device();
        sim.set_mode(DeviceMode::Adb);
        let session = session(&sim).await;
        let sources = sources(IMAGE);
        let plan = plan("FLASH boot boot.img\nWIPE\n", &sources);
        let executor = FlashPlanExecutor::new(controller(), sources, Arc::new(crate::events::NullSink));

        let result = executor.execute(&plan, &session).await.unwrap();
        assert!(result.is_success(), "{}", result.summary());
        assert_eq!(sim.mode(), DeviceMode::Bootloader);
        assert_eq!(sim.write_count("boot"), 1);
        assert!(sim.history().contains(&"erase userdata".to_string()));
    }
}
