//! Machine-readable sweep report.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use memfault_core::SiteRecord;

/// Classification of one sweep step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepClass {
    /// No failure was injected: the workload made fewer calls than the delay.
    Exhausted,
    /// A hard failure was injected and the workload reported it.
    ReportedOom,
    /// Only benign failures were injected and the workload succeeded.
    ToleratedBenign,
    /// A hard failure was injected but the workload reported success.
    MaskedFailure,
    /// The workload reported exhaustion although nothing was injected.
    SpuriousOom,
    /// Real-table outstanding bytes changed across the step.
    Leaked,
    /// The workload failed for a reason other than exhaustion.
    Failed,
}

impl StepClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::ReportedOom => "reported_oom",
            Self::ToleratedBenign => "tolerated_benign",
            Self::MaskedFailure => "masked_failure",
            Self::SpuriousOom => "spurious_oom",
            Self::Leaked => "leaked",
            Self::Failed => "failed",
        }
    }

    /// Whether a step of this class points at a defect in the workload.
    #[must_use]
    pub const fn is_defect(self) -> bool {
        matches!(
            self,
            Self::MaskedFailure | Self::SpuriousOom | Self::Leaked | Self::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStep {
    pub delay: i64,
    pub repeat: i64,
    pub class: StepClass,
    pub total_failures: u64,
    pub benign_failures: u64,
    /// Change in real-table outstanding bytes across the step.
    pub leaked_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub steps: usize,
    pub reported_oom: usize,
    pub tolerated_benign: usize,
    pub masked_failure: usize,
    pub spurious_oom: usize,
    pub leaked: usize,
    pub failed: usize,
}

impl SweepSummary {
    #[must_use]
    pub fn from_steps(steps: &[SweepStep]) -> Self {
        let mut summary = Self {
            steps: steps.len(),
            ..Self::default()
        };
        for step in steps {
            match step.class {
                StepClass::Exhausted => {}
                StepClass::ReportedOom => summary.reported_oom += 1,
                StepClass::ToleratedBenign => summary.tolerated_benign += 1,
                StepClass::MaskedFailure => summary.masked_failure += 1,
                StepClass::SpuriousOom => summary.spurious_oom += 1,
                StepClass::Leaked => summary.leaked += 1,
                StepClass::Failed => summary.failed += 1,
            }
        }
        summary
    }

    #[must_use]
    pub const fn defects(&self) -> usize {
        self.masked_failure + self.spurious_oom + self.leaked + self.failed
    }
}

/// Call-site aggregate as exported in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteEntry {
    pub call_count: u64,
    pub total_bytes: u64,
    /// Non-zero frames, hex formatted.
    pub frames: Vec<String>,
}

impl From<&SiteRecord> for SiteEntry {
    fn from(record: &SiteRecord) -> Self {
        Self {
            call_count: record.call_count,
            total_bytes: record.total_bytes,
            frames: record
                .key
                .frames()
                .iter()
                .take_while(|frame| **frame != 0)
                .map(|frame| format!("{frame:#x}"))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub workload: String,
    pub repeat: i64,
    pub max_delay: i64,
    /// True when a step ran out of injection points before `max_delay`.
    pub completed: bool,
    pub summary: SweepSummary,
    pub steps: Vec<SweepStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sites: Option<Vec<SiteEntry>>,
}

impl SweepReport {
    #[must_use]
    pub fn new(workload: impl Into<String>, repeat: i64, max_delay: i64, steps: Vec<SweepStep>) -> Self {
        let completed = steps.iter().any(|s| s.class == StepClass::Exhausted);
        Self {
            workload: workload.into(),
            repeat,
            max_delay,
            completed,
            summary: SweepSummary::from_steps(&steps),
            steps,
            sites: None,
        }
    }

    #[must_use]
    pub fn with_sites(mut self, sites: &[SiteRecord]) -> Self {
        self.sites = Some(sites.iter().map(SiteEntry::from).collect());
        self
    }

    /// True when the sweep reached exhaustion and found no defects.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.completed && self.summary.defects() == 0
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// SHA-256 of the pretty JSON rendering, hex encoded.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        let json = self.to_json()?;
        let hash = Sha256::digest(json.as_bytes());
        Ok(hash.iter().map(|b| format!("{b:02x}")).collect())
    }
}
