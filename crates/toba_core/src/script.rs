//! Line-oriented flashing scripts.
//!
//! ```text
//! # Xiaomi 11 Lite 5G NE
//! DEVICE lisa
//! REQUIRE bootloader
//! FLASH boot boot.img ab
//! MODE fastbootd
//! LOGICAL delete product_b
//! FLASH vendor_boot vendor_boot.img
//! VERIFY vendor_boot.sha256
//! ```
//!
//! Every keyword maps to a parser in a registration table; a parser turns the
//! arguments of one line into a [`Directive`]. The interpreter then checks the
//! directive against the mode the device will be in at that point, so a plan
//! that comes out of [`ScriptInterpreter::parse`] never asks for a transition
//! the permission table forbids or a step the mode lock would refuse.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::constants::is_baseband_partition;
use crate::device::{DeviceMode, Slot, SlotTarget};
use crate::error::{ParseError, ParseErrorKind};
use crate::plan::{FlashPlan, FlashStep, PlannedStep, WaitCondition};
use crate::source::SourceResolver;
use crate::transition::is_permitted;
use crate::utils::{parse_checksum_file, parse_duration, parse_size, split_slot_suffix};

/// What one script line contributes to the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Step(FlashStep),
    /// Adds a device model the plan is meant for.
    Device(String),
    /// Declares the mode the plan starts in.
    Require(DeviceMode),
}

/// State a keyword parser may consult while reading its line.
pub struct LineContext<'a> {
    resolver: &'a dyn SourceResolver,
    last_flash: Option<(String, Option<SlotTarget>)>,
    warnings: Vec<String>,
}

impl LineContext<'_> {
    /// Fails with `MissingSource` unless the resolver knows `reference`.
    pub fn require_source(&self, reference: &str) -> Result<(), ParseErrorKind> {
        if self.resolver.exists(reference) {
            Ok(())
        } else {
            Err(ParseErrorKind::MissingSource(reference.to_string()))
        }
    }

    /// Partition (and slot) of the most recent `FLASH` so far.
    pub fn last_flash(&self) -> Option<&(String, Option<SlotTarget>)> {
        self.last_flash.as_ref()
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

pub type KeywordParser = fn(&mut LineContext<'_>, &[&str]) -> Result<Directive, ParseErrorKind>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "line {}: {}: {}", self.line, level, self.message)
    }
}

/// Everything `check` found, errors and warnings alike, in line order.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub diagnostics: Vec<Diagnostic>,
    pub steps: usize,
}

impl CheckReport {
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.severity == Severity::Warning)
    }

    pub fn is_ok(&self) -> bool {
        self.errors().next().is_none()
    }
}

pub struct ScriptInterpreter {
    keywords: BTreeMap<String, KeywordParser>,
}

impl Default for ScriptInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptInterpreter {
    /// An interpreter with the built-in keywords registered.
    pub fn new() -> Self {
        let mut interpreter = Self {
            keywords: BTreeMap::new(),
        };
        interpreter.register("DEVICE", parse_device);
        interpreter.register("REQUIRE", parse_require);
        interpreter.register("MODE", parse_mode);
        interpreter.register("FLASH", parse_flash);
        interpreter.register("ERASE", parse_erase);
        interpreter.register("WIPE", parse_wipe);
        interpreter.register("LOGICAL", parse_logical);
        interpreter.register("SLOT", parse_slot);
        interpreter.register("WAIT", parse_wait);
        interpreter.register("VERIFY", parse_verify);
        interpreter
    }

    /// Adds or replaces a keyword. Keywords are matched case-insensitively.
    pub fn register(&mut self, keyword: &str, parser: KeywordParser) {
        self.keywords.insert(keyword.to_ascii_uppercase(), parser);
    }

    pub fn keywords(&self) -> impl Iterator<Item = &str> + '_ {
        self.keywords.keys().map(String::as_str)
    }

    /// Parses and validates a whole script. Stops at the first error; no
    /// partial plan is ever returned.
    pub fn parse(&self, text: &str, resolver: &dyn SourceResolver) -> Result<FlashPlan, ParseError> {
        let mut builder = PlanBuilder::new(resolver);
        for (line, body) in script_lines(text) {
            builder.feed(self, line, body)?;
        }
        builder.finish()
    }

    /// Runs the same checks as `parse` without stopping at the first error.
    pub fn check(&self, text: &str, resolver: &dyn SourceResolver) -> CheckReport {
        let mut builder = PlanBuilder::new(resolver);
        let mut diagnostics = Vec::new();
        let mut switches_mode = false;

        for (line, body) in script_lines(text) {
            let result = builder.feed(self, line, body);
            for message in builder.ctx.warnings.drain(..) {
                diagnostics.push(Diagnostic {
                    line,
                    severity: Severity::Warning,
                    message,
                });
            }
            if let Err(e) = result {
                diagnostics.push(Diagnostic {
                    line,
                    severity: Severity::Error,
                    message: e.kind.to_string(),
                });
            }
            switches_mode |= builder
                .steps
                .last()
                .is_some_and(|s| s.line == line && matches!(s.step, FlashStep::SwitchMode { .. }));
        }

        let steps = builder.steps.len();
        if steps == 0 {
            diagnostics.push(Diagnostic {
                line: 1,
                severity: Severity::Error,
                message: ParseErrorKind::EmptyScript.to_string(),
            });
        } else if !switches_mode {
            diagnostics.push(Diagnostic {
                line: 1,
                severity: Severity::Warning,
                message: format!("script never switches mode; the device must already be in {}", builder.start_mode),
            });
        }
        diagnostics.sort_by_key(|d| d.line);
        CheckReport { diagnostics, steps }
    }
}

/// Non-blank, non-comment lines with their 1-indexed numbers.
fn script_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim().trim_start_matches('\u{feff}')))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'))
}

struct PlanBuilder<'a> {
    ctx: LineContext<'a>,
    start_mode: DeviceMode,
    mode: DeviceMode,
    devices: Vec<String>,
    steps: Vec<PlannedStep>,
    flashed: BTreeSet<String>,
}

impl<'a> PlanBuilder<'a> {
    fn new(resolver: &'a dyn SourceResolver) -> Self {
        Self {
            ctx: LineContext {
                resolver,
                last_flash: None,
                warnings: Vec::new(),
            },
            start_mode: DeviceMode::Bootloader,
            mode: DeviceMode::Bootloader,
            devices: Vec::new(),
            steps: Vec::new(),
            flashed: BTreeSet::new(),
        }
    }

    fn feed(&mut self, interpreter: &ScriptInterpreter, line: usize, body: &str) -> Result<(), ParseError> {
        let at = |kind| ParseError { line, kind };
        let mut tokens = body.split_whitespace();
        let Some(word) = tokens.next() else {
            return Ok(());
        };
        let args: Vec<&str> = tokens.collect();
        let keyword = word.to_ascii_uppercase();
        let parser = interpreter
            .keywords
            .get(keyword.as_str())
            .ok_or_else(|| at(ParseErrorKind::UnknownKeyword(word.to_string())))?;

        match parser(&mut self.ctx, &args).map_err(at)? {
            Directive::Device(model) => self.devices.push(model),
            Directive::Require(mode) => {
                if !self.steps.is_empty() {
                    return Err(at(ParseErrorKind::RequireAfterSteps));
                }
                self.start_mode = mode;
                self.mode = mode;
            }
            Directive::Step(step) => self.push_step(line, step).map_err(at)?,
        }
        Ok(())
    }

    fn push_step(&mut self, line: usize, step: FlashStep) -> Result<(), ParseErrorKind> {
        let from = self.mode;
        match &step {
            FlashStep::SwitchMode { target }
            | FlashStep::Wait {
                condition: WaitCondition::Mode { mode: target },
            } => {
                self.mode = *target;
                if !is_permitted(from, *target) {
                    return Err(ParseErrorKind::UnreachableMode { from, to: *target });
                }
            }
            other if !other.allowed_modes().contains(&from) => {
                return Err(ParseErrorKind::ModeLocked {
                    keyword: other.keyword(),
                    mode: from,
                });
            }
            _ => {}
        }

        if let FlashStep::FlashPartition { partition, slot, .. } = &step {
            for name in crate::device::slot_partitions(partition, *slot) {
                if !self.flashed.insert(name.clone()) {
                    self.ctx.warn(format!("`{}` is flashed more than once", name));
                }
            }
            self.ctx.last_flash = Some((partition.clone(), *slot));
        }

        self.steps.push(PlannedStep { line, mode: from, step });
        Ok(())
    }

    fn finish(self) -> Result<FlashPlan, ParseError> {
        if self.steps.is_empty() {
            return Err(ParseError {
                line: 1,
                kind: ParseErrorKind::EmptyScript,
            });
        }
        Ok(FlashPlan::new(self.start_mode, self.devices, self.steps))
    }
}

fn exact<'s>(
    args: &[&'s str],
    keyword: &'static str,
    names: &[&'static str],
) -> Result<Vec<&'s str>, ParseErrorKind> {
    if let Some(extra) = args.get(names.len()) {
        return Err(ParseErrorKind::UnexpectedArgument(extra.to_string()));
    }
    names
        .iter()
        .enumerate()
        .map(|(i, what)| {
            args.get(i)
                .copied()
                .ok_or(ParseErrorKind::MissingArgument { keyword, what })
        })
        .collect()
}

fn mode_arg(s: &str) -> Result<DeviceMode, ParseErrorKind> {
    DeviceMode::from_script(s).ok_or_else(|| ParseErrorKind::InvalidMode(s.to_string()))
}

/// Partition name with an optional slot given either as a suffix or as a
/// separate argument, but not both.
fn partition_with_slot(
    partition: &str,
    slot_arg: Option<&str>,
) -> Result<(String, Option<SlotTarget>), ParseErrorKind> {
    let (base, suffix) = split_slot_suffix(partition);
    let explicit = slot_arg
        .map(|s| SlotTarget::parse(s).ok_or_else(|| ParseErrorKind::InvalidSlot(s.to_string())))
        .transpose()?;
    match (suffix, explicit) {
        (Some(_), Some(_)) => Err(ParseErrorKind::ConflictingSlot(partition.to_string())),
        (Some(slot), None) => Ok((base.to_string(), Some(slot))),
        (None, slot) => Ok((partition.to_string(), slot)),
    }
}

fn parse_device(_ctx: &mut LineContext<'_>, args: &[&str]) -> Result<Directive, ParseErrorKind> {
    let args = exact(args, "DEVICE", &["model"])?;
    Ok(Directive::Device(args[0].to_string()))
}

fn parse_require(_ctx: &mut LineContext<'_>, args: &[&str]) -> Result<Directive, ParseErrorKind> {
    let args = exact(args, "REQUIRE", &["mode"])?;
    Ok(Directive::Require(mode_arg(args[0])?))
}

fn parse_mode(_ctx: &mut LineContext<'_>, args: &[&str]) -> Result<Directive, ParseErrorKind> {
    let args = exact(args, "MODE", &["mode"])?;
    Ok(Directive::Step(FlashStep::SwitchMode {
        target: mode_arg(args[0])?,
    }))
}

fn parse_flash(ctx: &mut LineContext<'_>, args: &[&str]) -> Result<Directive, ParseErrorKind> {
    let mut disable_verity = false;
    let mut positional = Vec::new();
    for arg in args {
        match *arg {
            "--disable-verity" => disable_verity = true,
            flag if flag.starts_with("--") => return Err(ParseErrorKind::UnexpectedArgument(flag.to_string())),
            value => positional.push(value),
        }
    }
    let (partition, image, slot_arg) = match positional.as_slice() {
        [] => {
            return Err(ParseErrorKind::MissingArgument {
                keyword: "FLASH",
                what: "partition",
            });
        }
        [_] => {
            return Err(ParseErrorKind::MissingArgument {
                keyword: "FLASH",
                what: "image",
            });
        }
        [partition, image] => (*partition, *image, None),
        [partition, image, slot] => (*partition, *image, Some(*slot)),
        [_, _, _, extra, ..] => return Err(ParseErrorKind::UnexpectedArgument(extra.to_string())),
    };
    let (partition, slot) = partition_with_slot(partition, slot_arg)?;
    ctx.require_source(image)?;
    if disable_verity && !partition.starts_with("vbmeta") {
        ctx.warn(format!("--disable-verity has no effect on `{}`", partition));
    }
    Ok(Directive::Step(FlashStep::FlashPartition {
        partition,
        source: image.to_string(),
        slot,
        disable_verity,
    }))
}

fn parse_erase(ctx: &mut LineContext<'_>, args: &[&str]) -> Result<Directive, ParseErrorKind> {
    let args = exact(args, "ERASE", &["partition"])?;
    if is_baseband_partition(args[0]) {
        ctx.warn(format!("erasing baseband partition `{}`; make sure a backup exists", args[0]));
    }
    Ok(Directive::Step(FlashStep::ErasePartition {
        partition: args[0].to_string(),
    }))
}

fn parse_wipe(_ctx: &mut LineContext<'_>, args: &[&str]) -> Result<Directive, ParseErrorKind> {
    exact(args, "WIPE", &[])?;
    Ok(Directive::Step(FlashStep::WipeData))
}

fn parse_logical(_ctx: &mut LineContext<'_>, args: &[&str]) -> Result<Directive, ParseErrorKind> {
    let action = args.first().ok_or(ParseErrorKind::MissingArgument {
        keyword: "LOGICAL",
        what: "action",
    })?;
    let step = match action.to_ascii_lowercase().as_str() {
        "create" => {
            let args = exact(&args[1..], "LOGICAL", &["name", "size"])?;
            let size = parse_size(args[1]).ok_or_else(|| ParseErrorKind::InvalidSize(args[1].to_string()))?;
            FlashStep::CreateLogical {
                name: args[0].to_string(),
                size,
            }
        }
        "delete" => {
            let args = exact(&args[1..], "LOGICAL", &["name"])?;
            FlashStep::DeleteLogical {
                name: args[0].to_string(),
            }
        }
        other => return Err(ParseErrorKind::UnexpectedArgument(other.to_string())),
    };
    Ok(Directive::Step(step))
}

fn parse_slot(_ctx: &mut LineContext<'_>, args: &[&str]) -> Result<Directive, ParseErrorKind> {
    let args = exact(args, "SLOT", &["action", "slot"])?;
    if !args[0].eq_ignore_ascii_case("set") {
        return Err(ParseErrorKind::UnexpectedArgument(args[0].to_string()));
    }
    let slot = Slot::parse(args[1]).ok_or_else(|| ParseErrorKind::InvalidSlot(args[1].to_string()))?;
    Ok(Directive::Step(FlashStep::SetActiveSlot { slot }))
}

fn parse_wait(_ctx: &mut LineContext<'_>, args: &[&str]) -> Result<Directive, ParseErrorKind> {
    let first = args.first().ok_or(ParseErrorKind::MissingArgument {
        keyword: "WAIT",
        what: "condition",
    })?;
    let condition = match first.to_ascii_lowercase().as_str() {
        "mode" => {
            let args = exact(&args[1..], "WAIT", &["mode"])?;
            WaitCondition::Mode {
                mode: mode_arg(args[0])?,
            }
        }
        "device" => {
            exact(&args[1..], "WAIT", &[])?;
            WaitCondition::Device
        }
        _ => {
            let args = exact(args, "WAIT", &["duration"])?;
            let duration = parse_duration(args[0]).ok_or_else(|| ParseErrorKind::InvalidDuration(args[0].to_string()))?;
            WaitCondition::Duration { duration }
        }
    };
    Ok(Directive::Step(FlashStep::Wait { condition }))
}

fn parse_verify(ctx: &mut LineContext<'_>, args: &[&str]) -> Result<Directive, ParseErrorKind> {
    let (target, checksum) = match args {
        [] => {
            return Err(ParseErrorKind::MissingArgument {
                keyword: "VERIFY",
                what: "checksum",
            });
        }
        [checksum] => (None, *checksum),
        [partition, checksum] => (Some(*partition), *checksum),
        [_, _, extra, ..] => return Err(ParseErrorKind::UnexpectedArgument(extra.to_string())),
    };
    let (partition, slot) = match target {
        Some(name) => match (partition_with_slot(name, None)?, ctx.last_flash()) {
            // A bare name verifies the slots the preceding flash of it wrote.
            ((partition, None), Some((flashed, slot))) if *flashed == partition => (partition, *slot),
            (resolved, _) => resolved,
        },
        None => ctx.last_flash().cloned().ok_or(ParseErrorKind::VerifyWithoutFlash)?,
    };
    // A bare digest is taken literally; anything else names a checksum file.
    if parse_checksum_file(checksum.as_bytes()).is_none() {
        ctx.require_source(checksum)?;
    }
    Ok(Directive::Step(FlashStep::Verify {
        partition,
        slot,
        checksum: checksum.to_string(),
    }))
}
