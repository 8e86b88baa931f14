//! Exhaustive fault sweep.
//!
//! For delay = 0, 1, 2, ... the sweep arms the overlay with the plan
//! `delay:repeat`, runs the workload once, disarms with
//! [`FaultPlan::DISABLED`] and classifies the step from the returned counters,
//! the workload's result and the real table's outstanding bytes. The first
//! step that injects nothing ends the sweep.

use std::sync::Arc;

use memfault_core::{FaultCounters, FaultPlan, MallocSlot, OverlayInstaller, SystemTable};

use crate::error::{HarnessError, WorkloadError};
use crate::report::{StepClass, SweepReport, SweepStep};
use crate::structured_log::{LogEmitter, LogEntry, LogLevel};
use crate::workloads::Workload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepOptions {
    /// Highest delay tried.
    pub max_delay: i64,
    /// Failures injected per step.
    pub repeat: i64,
    /// Reset and record the allocation-site log over the sweep.
    pub record_sites: bool,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            max_delay: 256,
            repeat: 1,
            record_sites: false,
        }
    }
}

pub struct FaultSweep<'a> {
    installer: &'a OverlayInstaller,
    slot: &'a MallocSlot,
    ledger: Arc<SystemTable>,
    options: SweepOptions,
}

/// Classify one step. Leaks take precedence over the workload's result.
#[must_use]
pub fn classify(
    result: &Result<(), WorkloadError>,
    counters: FaultCounters,
    leaked_bytes: i64,
) -> StepClass {
    if leaked_bytes != 0 {
        return StepClass::Leaked;
    }
    match result {
        Err(err) if !err.is_out_of_memory() => StepClass::Failed,
        Err(_) if counters.total_failures == 0 => StepClass::SpuriousOom,
        Err(_) => StepClass::ReportedOom,
        Ok(()) if counters.total_failures == 0 => StepClass::Exhausted,
        Ok(()) if counters.hard_failures() == 0 => StepClass::ToleratedBenign,
        Ok(()) => StepClass::MaskedFailure,
    }
}

impl<'a> FaultSweep<'a> {
    /// `slot` is what the workload allocates from; `ledger` is the real table
    /// behind it, used for leak accounting.
    #[must_use]
    pub fn new(
        installer: &'a OverlayInstaller,
        slot: &'a MallocSlot,
        ledger: Arc<SystemTable>,
        options: SweepOptions,
    ) -> Self {
        Self {
            installer,
            slot,
            ledger,
            options,
        }
    }

    /// Run the sweep, installing the overlay for its duration if needed.
    ///
    /// An overlay installed here is uninstalled and the site log stopped even
    /// when logging fails part way.
    pub fn run(
        &self,
        workload: &mut dyn Workload,
        mut log: Option<&mut LogEmitter>,
    ) -> Result<SweepReport, HarnessError> {
        let installed_here = !self.installer.is_installed();
        if installed_here {
            self.installer.install()?;
        }
        if self.options.record_sites {
            self.installer.site_log().sync();
        }

        let swept = self.sweep_steps(workload, log.as_deref_mut());

        if self.options.record_sites {
            self.installer.site_log().stop();
        }
        let restored = if installed_here {
            self.installer.uninstall()
        } else {
            Ok(())
        };
        let steps = swept?;
        restored?;

        let mut report = SweepReport::new(
            workload.name(),
            self.options.repeat,
            self.options.max_delay,
            steps,
        );
        if self.options.record_sites {
            report = report.with_sites(&self.installer.site_log().dump());
        }
        if let Some(log) = log {
            for record in self.installer.journal().drain() {
                log.emit_entry(LogEntry::from_overlay_record(&record))?;
            }
            log.emit_entry(
                LogEntry::new("", LogLevel::Info, "sweep_end")
                    .with_workload(workload.name())
                    .with_outcome(if report.is_clean() { "clean" } else { "defects" })
                    .with_details(serde_json::json!({
                        "steps": report.summary.steps,
                        "defects": report.summary.defects(),
                    })),
            )?;
            log.flush()?;
        }
        Ok(report)
    }

    fn sweep_steps(
        &self,
        workload: &mut dyn Workload,
        mut log: Option<&mut LogEmitter>,
    ) -> Result<Vec<SweepStep>, HarnessError> {
        let repeat = self.options.repeat;
        if let Some(log) = log.as_deref_mut() {
            log.emit_entry(
                LogEntry::new("", LogLevel::Info, "sweep_start")
                    .with_workload(workload.name())
                    .with_details(serde_json::json!({ "max_delay": self.options.max_delay })),
            )?;
        }

        let mut steps = Vec::new();
        for delay in 0..=self.options.max_delay {
            let before = self.ledger.outstanding_bytes();
            self.installer.apply_plan(FaultPlan::new(delay, repeat));
            let result = workload.run(self.slot);
            let counters = self.installer.apply_plan(FaultPlan::DISABLED);
            let after = self.ledger.outstanding_bytes();
            let leaked_bytes = after as i64 - before as i64;
            let class = classify(&result, counters, leaked_bytes);

            let step = SweepStep {
                delay,
                repeat,
                class,
                total_failures: counters.total_failures,
                benign_failures: counters.benign_failures,
                leaked_bytes,
                error: result.err().map(|e| e.to_string()),
            };
            if let Some(log) = log.as_deref_mut() {
                self.log_step(log, workload.name(), &step)?;
            }
            steps.push(step);
            if class == StepClass::Exhausted {
                break;
            }
        }
        Ok(steps)
    }

    fn log_step(&self, log: &mut LogEmitter, workload: &str, step: &SweepStep) -> std::io::Result<()> {
        let level = if step.class.is_defect() {
            LogLevel::Error
        } else {
            LogLevel::Debug
        };
        let mut entry = LogEntry::new("", level, "sweep_step")
            .with_workload(workload)
            .with_plan(step.delay, step.repeat)
            .with_outcome(step.class.as_str())
            .with_counters(step.total_failures, step.benign_failures)
            .with_pending(self.installer.pending());
        if step.leaked_bytes != 0 || step.error.is_some() {
            entry = entry.with_details(serde_json::json!({
                "leaked_bytes": step.leaked_bytes,
                "error": step.error,
            }));
        }
        log.emit_entry(entry)
    }
}
