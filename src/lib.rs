//! Core types for the `check_rpm_last_update` monitoring plugin.
//!
//! The building blocks follow the usual nagios/icinga plugin model: a
//! [`ServiceState`] with the standard exit codes, a [`Metric`] which derives a
//! state from thresholds, and a [`Resource`] which renders the final plugin
//! line including perf data.

use std::cmp::Ordering;
use std::fmt;
use std::process;

pub mod check;
pub mod config_generator;
pub mod exec;
mod runner;

pub use crate::check::{
    classify, days_since, parse_last_update, run_check, CheckConfig, CheckError, ConfigError,
    DEFAULT_CRITICAL_DAYS, DEFAULT_RPM_PATH, DEFAULT_TIMEOUT_SECS, DEFAULT_WARNING_DAYS,
};
pub use crate::runner::{Runner, RunnerResult};

/// A service state as understood by nagios and icinga.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl ServiceState {
    /// Returns the plugin exit code signalling this state.
    pub fn exit_code(self) -> i32 {
        match self {
            ServiceState::Ok => 0,
            ServiceState::Warning => 1,
            ServiceState::Critical => 2,
            ServiceState::Unknown => 3,
        }
    }

    // Ordering rank: higher means worse. Unknown ranks below Ok so that any
    // real measurement wins over "no data".
    fn rank(self) -> u8 {
        match self {
            ServiceState::Unknown => 0,
            ServiceState::Ok => 1,
            ServiceState::Warning => 2,
            ServiceState::Critical => 3,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Ok => "OK",
            ServiceState::Warning => "WARNING",
            ServiceState::Critical => "CRITICAL",
            ServiceState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

impl PartialOrd for ServiceState {
    fn partial_cmp(&self, other: &ServiceState) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceState {
    fn cmp(&self, other: &ServiceState) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Unit of measurement attached to a metric's perf data value.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Unit {
    #[default]
    None,
    Seconds,
    Percentage,
    Bytes,
    Counter,
    Other(String),
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Unit::None => "",
            Unit::Seconds => "s",
            Unit::Percentage => "%",
            Unit::Bytes => "B",
            Unit::Counter => "c",
            Unit::Other(other) => other,
        };
        f.write_str(s)
    }
}

/// A single measured value with optional warning/critical thresholds.
///
/// Thresholds are "higher is worse": a value at or above the critical
/// threshold is [`ServiceState::Critical`], at or above the warning threshold
/// [`ServiceState::Warning`], everything below is [`ServiceState::Ok`]. The
/// boundary value itself belongs to the stricter bucket.
///
/// ```rust
/// use check_rpm_last_update::{Metric, ServiceState};
///
/// let metric = Metric::new("days_since_update", 75).with_thresholds(60, 90);
/// assert_eq!(metric.state(), ServiceState::Warning);
/// assert_eq!(metric.perf_string(), "days_since_update=75;60;90");
/// ```
pub struct Metric<T> {
    name: String,
    value: T,
    warning: Option<T>,
    critical: Option<T>,
    min: Option<T>,
    max: Option<T>,
    unit: Unit,
}

impl<T: PartialOrd + fmt::Display> Metric<T> {
    pub fn new(name: &str, value: T) -> Self {
        Metric {
            name: name.to_owned(),
            value,
            warning: None,
            critical: None,
            min: None,
            max: None,
            unit: Unit::None,
        }
    }

    /// Attaches thresholds. Warning must not exceed critical.
    ///
    /// *In debug builds this panics on inverted thresholds.*
    pub fn with_thresholds(mut self, warning: T, critical: T) -> Self {
        debug_assert!(
            warning <= critical,
            "warning threshold is larger than critical threshold"
        );
        self.warning = Some(warning);
        self.critical = Some(critical);
        self
    }

    /// Attaches the value range reported in the perf data.
    pub fn with_bounds(mut self, min: Option<T>, max: Option<T>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    /// The state this value falls into given the attached thresholds.
    /// Without thresholds the metric is always [`ServiceState::Ok`].
    pub fn state(&self) -> ServiceState {
        if let Some(ref critical) = self.critical {
            if self.value >= *critical {
                return ServiceState::Critical;
            }
        }
        if let Some(ref warning) = self.warning {
            if self.value >= *warning {
                return ServiceState::Warning;
            }
        }
        ServiceState::Ok
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Renders the `label=value[uom];warn;crit;min;max` perf data entry,
    /// trailing empty fields omitted.
    pub fn perf_string(&self) -> String {
        let mut s = format!("{}={}{}", perf_label(&self.name), self.value, self.unit);

        let fields = [&self.warning, &self.critical, &self.min, &self.max];
        for field in fields {
            s.push(';');
            if let Some(value) = field {
                s.push_str(&value.to_string());
            }
        }

        s.trim_end_matches(';').to_owned()
    }
}

// Perf data labels must not contain `=`, and labels with spaces or quotes
// have to be single-quoted with quotes doubled.
fn perf_label(name: &str) -> String {
    let name = name.replace('=', "_");
    if name.contains(' ') || name.contains('\'') {
        format!("'{}'", name.replace('\'', "''"))
    } else {
        name
    }
}

/// The outcome of a check: a state, a message and the collected perf data.
///
/// The state is the worst state of the pushed metrics unless one is set
/// explicitly via [`Resource::with_state`].
pub struct Resource {
    state: Option<ServiceState>,
    description: Option<String>,
    perf_data: Vec<(ServiceState, String)>,
}

impl Resource {
    pub fn new() -> Resource {
        Resource {
            state: None,
            description: None,
            perf_data: Vec::new(),
        }
    }

    /// Sets the message printed after the state. One line, no newlines.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Pins the state, disabling derivation from the pushed metrics.
    pub fn with_state(mut self, state: ServiceState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_metric<T: PartialOrd + fmt::Display>(mut self, metric: Metric<T>) -> Self {
        self.push(metric);
        self
    }

    pub fn push<T: PartialOrd + fmt::Display>(&mut self, metric: Metric<T>) {
        self.perf_data.push((metric.state(), metric.perf_string()));
    }

    /// The effective state: the pinned one if set, otherwise the worst state
    /// over all metrics, [`ServiceState::Unknown`] if there are none.
    pub fn state(&self) -> ServiceState {
        if let Some(state) = self.state {
            return state;
        }
        self.perf_data
            .iter()
            .map(|(state, _)| *state)
            .max()
            .unwrap_or(ServiceState::Unknown)
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Renders the single plugin output line, e.g.
    /// `OK: 45 days since last rpm update | days_since_update=45;60;90;0`.
    pub fn to_plugin_string(&self) -> String {
        let mut s = self.state().to_string();

        if let Some(ref description) = self.description {
            s.push_str(": ");
            s.push_str(description);
        }

        if !self.perf_data.is_empty() {
            s.push_str(" |");
            for (_, perf) in &self.perf_data {
                s.push(' ');
                s.push_str(perf);
            }
        }

        s
    }

    pub fn exit_code(&self) -> i32 {
        self.state().exit_code()
    }

    /// Prints [`Resource::to_plugin_string`] and exits with the matching code.
    pub fn print_and_exit(&self) -> ! {
        println!("{}", self.to_plugin_string());
        process::exit(self.exit_code());
    }
}

impl Default for Resource {
    fn default() -> Self {
        Resource::new()
    }
}
