//! Overlay configuration.
//!
//! Settings come from the environment:
//! - `MEMFAULT_FAIL`: initial fault plan, `DELAY[:REPEAT]` or `off` (default).
//!   The overlay is armed with this plan as soon as it is installed.
//! - `MEMFAULT_JOURNAL_CAPACITY`: lifecycle journal ring size (default 256).
//! - `MEMFAULT_SITE_LOG`: start the allocation-site log at install
//!   (`1|on|true|yes`, default off).
//!
//! [`OverlayConfig::from_env`] falls back to the default for any malformed
//! value; [`OverlayConfig::from_env_strict`] reports it instead.

use std::fmt;
use std::sync::Arc;

use crate::error::FaultError;
use crate::journal::DEFAULT_JOURNAL_CAPACITY;
use crate::site_log::{NoStackCapture, StackCapture};

pub const ENV_FAIL: &str = "MEMFAULT_FAIL";
pub const ENV_JOURNAL_CAPACITY: &str = "MEMFAULT_JOURNAL_CAPACITY";
pub const ENV_SITE_LOG: &str = "MEMFAULT_SITE_LOG";

/// A `(delay, repeat)` pair as passed to reconfigure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaultPlan {
    pub delay: i64,
    pub repeat: i64,
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self::DISABLED
    }
}

impl FaultPlan {
    /// Disarmed plan.
    pub const DISABLED: Self = Self {
        delay: -1,
        repeat: 1,
    };

    #[must_use]
    pub const fn new(delay: i64, repeat: i64) -> Self {
        Self { delay, repeat }
    }

    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.delay >= 0
    }

    /// Parse `DELAY[:REPEAT]` (repeat defaults to 1) or `off`.
    pub fn parse(raw: &str) -> Result<Self, FaultError> {
        let trimmed = raw.trim();
        let invalid = || FaultError::InvalidFaultPlan(raw.to_string());
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "off" | "none" | "disabled" => return Ok(Self::DISABLED),
            _ => {}
        }
        let (delay, repeat) = match trimmed.split_once(':') {
            Some((delay, repeat)) => (delay, Some(repeat)),
            None => (trimmed, None),
        };
        let delay = delay.trim().parse::<i64>().map_err(|_| invalid())?;
        let repeat = match repeat {
            Some(repeat) => repeat.trim().parse::<i64>().map_err(|_| invalid())?,
            None => 1,
        };
        Ok(Self { delay, repeat })
    }
}

impl fmt::Display for FaultPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_armed() {
            write!(f, "{}:{}", self.delay, self.repeat)
        } else {
            f.write_str("off")
        }
    }
}

/// Parse a boolean switch (case-insensitive).
#[must_use]
pub fn parse_bool_loose(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" | "enabled" => Some(true),
        "0" | "off" | "false" | "no" | "disabled" | "" => Some(false),
        _ => None,
    }
}

/// Invoked when the slot fails its uninstall integrity check. Never returns.
pub type FatalHandler = fn(&FaultError) -> !;

/// Log the error and abort the process.
pub fn abort_on_fatal(err: &FaultError) -> ! {
    eprintln!("memfault: fatal: {err}");
    std::process::abort()
}

#[derive(Clone)]
pub struct OverlayConfig {
    pub journal_capacity: usize,
    /// Plan applied at install.
    pub initial_plan: FaultPlan,
    pub site_log_autostart: bool,
    pub capture: Arc<dyn StackCapture>,
    pub fatal: FatalHandler,
}

impl fmt::Debug for OverlayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayConfig")
            .field("journal_capacity", &self.journal_capacity)
            .field("initial_plan", &self.initial_plan)
            .field("site_log_autostart", &self.site_log_autostart)
            .finish_non_exhaustive()
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            journal_capacity: DEFAULT_JOURNAL_CAPACITY,
            initial_plan: FaultPlan::DISABLED,
            site_log_autostart: false,
            capture: Arc::new(NoStackCapture),
            fatal: abort_on_fatal,
        }
    }
}

impl OverlayConfig {
    /// Read the environment, using defaults for unset or malformed values.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup_loose(|var| std::env::var(var).ok())
    }

    /// Read the environment, rejecting malformed values.
    pub fn from_env_strict() -> Result<Self, FaultError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source, rejecting malformed values.
    pub fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, FaultError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_FAIL) {
            config.initial_plan = FaultPlan::parse(&raw)?;
        }
        if let Some(raw) = lookup(ENV_JOURNAL_CAPACITY) {
            config.journal_capacity = raw.trim().parse().map_err(|_| FaultError::InvalidEnvValue {
                var: ENV_JOURNAL_CAPACITY,
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup(ENV_SITE_LOG) {
            config.site_log_autostart = parse_bool_loose(&raw).ok_or(FaultError::InvalidEnvValue {
                var: ENV_SITE_LOG,
                value: raw.clone(),
            })?;
        }
        Ok(config)
    }

    /// Build from an arbitrary variable source, skipping malformed values.
    #[must_use]
    pub fn from_lookup_loose(lookup: impl Fn(&'static str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(plan) = lookup(ENV_FAIL).and_then(|raw| FaultPlan::parse(&raw).ok()) {
            config.initial_plan = plan;
        }
        if let Some(capacity) = lookup(ENV_JOURNAL_CAPACITY).and_then(|raw| raw.trim().parse().ok()) {
            config.journal_capacity = capacity;
        }
        if let Some(on) = lookup(ENV_SITE_LOG).and_then(|raw| parse_bool_loose(&raw)) {
            config.site_log_autostart = on;
        }
        config
    }

    #[must_use]
    pub fn with_initial_plan(mut self, plan: FaultPlan) -> Self {
        self.initial_plan = plan;
        self
    }

    #[must_use]
    pub fn with_journal_capacity(mut self, capacity: usize) -> Self {
        self.journal_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_site_log_autostart(mut self, on: bool) -> Self {
        self.site_log_autostart = on;
        self
    }

    #[must_use]
    pub fn with_capture(mut self, capture: impl StackCapture + 'static) -> Self {
        self.capture = Arc::new(capture);
        self
    }

    #[must_use]
    pub fn with_fatal_handler(mut self, fatal: FatalHandler) -> Self {
        self.fatal = fatal;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let map: HashMap<&'static str, String> =
            pairs.iter().map(|(k, v)| (*k, (*v).to_string())).collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn plan_parsing() {
        assert_eq!(FaultPlan::parse("5"), Ok(FaultPlan::new(5, 1)));
        assert_eq!(FaultPlan::parse(" 2:3 "), Ok(FaultPlan::new(2, 3)));
        assert_eq!(FaultPlan::parse("0:-1"), Ok(FaultPlan::new(0, -1)));
        assert_eq!(FaultPlan::parse("OFF"), Ok(FaultPlan::DISABLED));
        assert_eq!(FaultPlan::parse(""), Ok(FaultPlan::DISABLED));
        assert_eq!(
            FaultPlan::parse("soon"),
            Err(FaultError::InvalidFaultPlan("soon".to_string()))
        );
        assert!(FaultPlan::parse("1:x").is_err());
    }

    #[test]
    fn plan_display_round_trips() {
        assert_eq!(FaultPlan::new(4, 2).to_string(), "4:2");
        assert_eq!(FaultPlan::DISABLED.to_string(), "off");
        assert!(!FaultPlan::new(-3, 9).is_armed());
    }

    #[test]
    fn bool_parsing() {
        assert_eq!(parse_bool_loose("YES"), Some(true));
        assert_eq!(parse_bool_loose("0"), Some(false));
        assert_eq!(parse_bool_loose("maybe"), None);
    }

    #[test]
    fn unset_environment_gives_defaults() {
        let config = OverlayConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.initial_plan, FaultPlan::DISABLED);
        assert_eq!(config.journal_capacity, DEFAULT_JOURNAL_CAPACITY);
        assert!(!config.site_log_autostart);
    }

    #[test]
    fn strict_lookup_reads_every_variable() {
        let config = OverlayConfig::from_lookup(lookup(&[
            (ENV_FAIL, "10:2"),
            (ENV_JOURNAL_CAPACITY, "16"),
            (ENV_SITE_LOG, "on"),
        ]))
        .unwrap();
        assert_eq!(config.initial_plan, FaultPlan::new(10, 2));
        assert_eq!(config.journal_capacity, 16);
        assert!(config.site_log_autostart);
    }

    #[test]
    fn strict_lookup_rejects_malformed_values() {
        let err = OverlayConfig::from_lookup(lookup(&[(ENV_JOURNAL_CAPACITY, "lots")])).unwrap_err();
        assert_eq!(
            err,
            FaultError::InvalidEnvValue {
                var: ENV_JOURNAL_CAPACITY,
                value: "lots".to_string()
            }
        );
        assert!(OverlayConfig::from_lookup(lookup(&[(ENV_SITE_LOG, "perhaps")])).is_err());
        assert!(OverlayConfig::from_lookup(lookup(&[(ENV_FAIL, "a:b")])).is_err());
    }

    #[test]
    fn loose_lookup_skips_malformed_values() {
        let config = OverlayConfig::from_lookup_loose(lookup(&[
            (ENV_FAIL, "garbage"),
            (ENV_JOURNAL_CAPACITY, "8"),
            (ENV_SITE_LOG, "perhaps"),
        ]));
        assert_eq!(config.initial_plan, FaultPlan::DISABLED);
        assert_eq!(config.journal_capacity, 8);
        assert!(!config.site_log_autostart);
    }
}
