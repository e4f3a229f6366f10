//! The actual check: query the rpm database for the newest install entry,
//! work out how many days ago that was, and classify it against the
//! configured thresholds.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use tracing::{debug, info};

use crate::exec::{self, ExecError};
use crate::{Metric, Resource, ServiceState, Unit};

pub const DEFAULT_WARNING_DAYS: u32 = 60;
pub const DEFAULT_CRITICAL_DAYS: u32 = 90;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RPM_PATH: &str = "/usr/bin/rpm";

const MAX_THRESHOLD_DAYS: u32 = 3650;
const MAX_TIMEOUT_SECS: u64 = 3600;

/// Rejected configuration values, each naming the offending field and the
/// accepted range.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("warning must be between 1 and 3650 days, got {0}")]
    WarningOutOfRange(u32),
    #[error("critical must be between 1 and 3650 days, got {0}")]
    CriticalOutOfRange(u32),
    #[error("timeout must be between 1 and 3600 seconds, got {0}")]
    TimeoutOutOfRange(u64),
    #[error("warning ({warning} days) cannot be larger than critical ({critical} days)")]
    WarningAboveCritical { warning: u32, critical: u32 },
}

/// Validated check configuration. Constructing one is the only way to get the
/// thresholds past [`CheckConfig::new`], so a held value is always sane.
#[derive(Debug, Clone)]
pub struct CheckConfig {
    warning_days: u32,
    critical_days: u32,
    timeout: Duration,
    rpm_path: PathBuf,
}

impl CheckConfig {
    pub fn new(
        warning_days: u32,
        critical_days: u32,
        timeout_secs: u64,
    ) -> Result<Self, ConfigError> {
        if !(1..=MAX_THRESHOLD_DAYS).contains(&warning_days) {
            return Err(ConfigError::WarningOutOfRange(warning_days));
        }
        if !(1..=MAX_THRESHOLD_DAYS).contains(&critical_days) {
            return Err(ConfigError::CriticalOutOfRange(critical_days));
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&timeout_secs) {
            return Err(ConfigError::TimeoutOutOfRange(timeout_secs));
        }
        if warning_days > critical_days {
            return Err(ConfigError::WarningAboveCritical {
                warning: warning_days,
                critical: critical_days,
            });
        }

        Ok(CheckConfig {
            warning_days,
            critical_days,
            timeout: Duration::from_secs(timeout_secs),
            rpm_path: PathBuf::from(DEFAULT_RPM_PATH),
        })
    }

    /// Points the check at a different rpm binary, mainly for tests and
    /// non-standard installations.
    pub fn with_rpm_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.rpm_path = path.into();
        self
    }

    pub fn warning_days(&self) -> u32 {
        self.warning_days
    }

    pub fn critical_days(&self) -> u32 {
        self.critical_days
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn rpm_path(&self) -> &Path {
        &self.rpm_path
    }
}

/// Everything that can go wrong while checking. [`CheckError::service_state`]
/// decides how each class is reported: only a timeout is CRITICAL, the rest
/// means we simply cannot tell and is UNKNOWN.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{} cannot be found", .path.display())]
    RpmMissing { path: PathBuf },
    #[error("{} is not a file", .path.display())]
    RpmNotAFile { path: PathBuf },
    #[error("{} is not executable", .path.display())]
    RpmNotExecutable { path: PathBuf },
    #[error("rpm query did not finish within {timeout_secs} seconds and was killed")]
    Timeout { timeout_secs: u64 },
    #[error("rpm query failed with exit code {code:?}: {stderr}")]
    QueryFailed { code: Option<i32>, stderr: String },
    #[error("rpm reported no install history, it probably never ran")]
    EmptyHistory,
    #[error("could not parse rpm install timestamp {0:?}")]
    UnparsableTimestamp(String),
    #[error("failed to run rpm: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckError {
    /// The state this error is reported as.
    pub fn service_state(&self) -> ServiceState {
        match self {
            CheckError::Timeout { .. } => ServiceState::Critical,
            _ => ServiceState::Unknown,
        }
    }
}

/// Buckets a day count against the two thresholds. The boundary day already
/// belongs to the stricter bucket: `days == warning` is WARNING, `days ==
/// critical` is CRITICAL.
pub fn classify(days: i64, warning_days: u32, critical_days: u32) -> ServiceState {
    days_metric(days, warning_days, critical_days).state()
}

fn days_metric(days: i64, warning_days: u32, critical_days: u32) -> Metric<i64> {
    Metric::new("days_since_update", days)
        .with_thresholds(i64::from(warning_days), i64::from(critical_days))
        .with_bounds(Some(0), None)
}

/// Parses the newest entry of `rpm -qa --last` output into its timestamp.
///
/// The first non-empty line looks like
/// `zlib-1.2.11-17.el8.x86_64    Tue 14 Jun 2022 10:32:55 AM UTC`; everything
/// after the package name is the timestamp. Older rpm releases print a
/// ctime-style `Tue Jun 14 10:32:55 2022` instead, so both layouts are
/// accepted.
pub fn parse_last_update(stdout: &str) -> Result<NaiveDateTime, CheckError> {
    let line = stdout
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or(CheckError::EmptyHistory)?;

    let mut fields = line.split_whitespace();
    let _package = fields.next();
    let stamp_fields: Vec<&str> = fields.collect();

    if stamp_fields.is_empty() {
        return Err(CheckError::UnparsableTimestamp(line.trim().to_owned()));
    }

    let stamp = stamp_fields.join(" ");

    // The glibc long format carries a trailing zone name chrono cannot parse,
    // so it is dropped before matching. Days-level precision does not care
    // about the zone.
    let without_zone = stamp_fields[..stamp_fields.len() - 1].join(" ");

    NaiveDateTime::parse_from_str(&without_zone, "%a %d %b %Y %I:%M:%S %p")
        .or_else(|_| NaiveDateTime::parse_from_str(&stamp, "%a %b %e %H:%M:%S %Y"))
        .map_err(|_| CheckError::UnparsableTimestamp(stamp))
}

/// Whole days elapsed between the given timestamp and now. A timestamp in the
/// future (clock skew) counts as zero days.
pub fn days_since(last_update: NaiveDateTime) -> i64 {
    Local::now()
        .naive_local()
        .signed_duration_since(last_update)
        .num_days()
        .max(0)
}

fn ensure_rpm_usable(path: &Path) -> Result<(), CheckError> {
    if !path.exists() {
        return Err(CheckError::RpmMissing {
            path: path.to_owned(),
        });
    }
    if !path.is_file() {
        return Err(CheckError::RpmNotAFile {
            path: path.to_owned(),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mode = path.metadata()?.permissions().mode();
        if mode & 0o111 == 0 {
            return Err(CheckError::RpmNotExecutable {
                path: path.to_owned(),
            });
        }
    }

    Ok(())
}

/// Runs `rpm -qa --last` under the configured deadline and returns the
/// timestamp of the newest entry plus how long the query took.
pub fn query_last_update(cfg: &CheckConfig) -> Result<(NaiveDateTime, Duration), CheckError> {
    ensure_rpm_usable(cfg.rpm_path())?;

    let mut cmd = Command::new(cfg.rpm_path());
    cmd.args(["-qa", "--last"]);

    let output = exec::run_with_deadline(cmd, cfg.timeout()).map_err(|err| match err {
        ExecError::TimedOut { .. } => CheckError::Timeout {
            timeout_secs: cfg.timeout().as_secs(),
        },
        ExecError::Io(err) => CheckError::Io(err),
    })?;

    if !output.success() {
        return Err(CheckError::QueryFailed {
            code: output.exit_code,
            stderr: output.stderr.trim().to_owned(),
        });
    }

    let last_update = parse_last_update(&output.stdout)?;
    debug!("newest rpm install entry is from {}", last_update);

    Ok((last_update, output.duration))
}

/// Runs the whole check and produces the final [`Resource`]. Errors are left
/// to the caller (normally the [`Runner`](crate::Runner)) to report.
pub fn run_check(cfg: &CheckConfig) -> Result<Resource, CheckError> {
    let (last_update, query_time) = query_last_update(cfg)?;
    let days = days_since(last_update);

    info!(
        "last rpm update was {} days ago, thresholds {}/{}",
        days,
        cfg.warning_days(),
        cfg.critical_days()
    );

    let message = if days == 1 {
        "1 day since last rpm update".to_owned()
    } else {
        format!("{} days since last rpm update", days)
    };

    let query_secs = query_time.as_millis() as f64 / 1000.0;

    Ok(Resource::new()
        .with_description(message)
        .with_metric(days_metric(days, cfg.warning_days(), cfg.critical_days()))
        .with_metric(Metric::new("query_time", query_secs).with_unit(Unit::Seconds)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_config_defaults_are_valid() {
        let cfg = CheckConfig::new(
            DEFAULT_WARNING_DAYS,
            DEFAULT_CRITICAL_DAYS,
            DEFAULT_TIMEOUT_SECS,
        )
        .unwrap();

        assert_eq!(cfg.warning_days(), 60);
        assert_eq!(cfg.critical_days(), 90);
        assert_eq!(cfg.timeout(), Duration::from_secs(30));
        assert_eq!(cfg.rpm_path(), Path::new(DEFAULT_RPM_PATH));
    }

    #[test]
    fn test_config_rejects_out_of_range_warning() {
        assert_eq!(
            CheckConfig::new(0, 90, 30).unwrap_err(),
            ConfigError::WarningOutOfRange(0)
        );
        assert_eq!(
            CheckConfig::new(4000, 4000, 30).unwrap_err(),
            ConfigError::WarningOutOfRange(4000)
        );
    }

    #[test]
    fn test_config_rejects_out_of_range_critical() {
        assert_eq!(
            CheckConfig::new(60, 0, 30).unwrap_err(),
            ConfigError::CriticalOutOfRange(0)
        );
        assert_eq!(
            CheckConfig::new(60, 9999, 30).unwrap_err(),
            ConfigError::CriticalOutOfRange(9999)
        );
    }

    #[test]
    fn test_config_rejects_out_of_range_timeout() {
        assert_eq!(
            CheckConfig::new(60, 90, 0).unwrap_err(),
            ConfigError::TimeoutOutOfRange(0)
        );
        assert_eq!(
            CheckConfig::new(60, 90, 7200).unwrap_err(),
            ConfigError::TimeoutOutOfRange(7200)
        );
    }

    #[test]
    fn test_config_rejects_warning_above_critical() {
        let err = CheckConfig::new(90, 60, 30).unwrap_err();
        assert_eq!(
            err,
            ConfigError::WarningAboveCritical {
                warning: 90,
                critical: 60
            }
        );
        assert!(err.to_string().contains("cannot be larger than critical"));
    }

    #[test]
    fn test_config_error_names_the_field() {
        assert!(CheckConfig::new(0, 90, 30)
            .unwrap_err()
            .to_string()
            .starts_with("warning"));
        assert!(CheckConfig::new(60, 90, 0)
            .unwrap_err()
            .to_string()
            .starts_with("timeout"));
    }

    #[test]
    fn test_classify_property_table() {
        // Example from the plugin docs: -w 60 -c 90.
        assert_eq!(classify(45, 60, 90), ServiceState::Ok);
        assert_eq!(classify(75, 60, 90), ServiceState::Warning);
        assert_eq!(classify(120, 60, 90), ServiceState::Critical);

        // The exact threshold day counts as the next severity.
        assert_eq!(classify(59, 60, 90), ServiceState::Ok);
        assert_eq!(classify(60, 60, 90), ServiceState::Warning);
        assert_eq!(classify(89, 60, 90), ServiceState::Warning);
        assert_eq!(classify(90, 60, 90), ServiceState::Critical);
    }

    #[test]
    fn test_parse_glibc_long_format() {
        let out = "zlib-1.2.11-17.el8.x86_64                     Tue 14 Jun 2022 10:32:55 AM UTC\n\
                   bash-4.4.20-4.el8_6.x86_64                    Tue 14 Jun 2022 10:32:51 AM UTC\n";
        assert_eq!(
            parse_last_update(out).unwrap(),
            date(2022, 6, 14, 10, 32, 55)
        );
    }

    #[test]
    fn test_parse_glibc_long_format_pm() {
        let out = "kernel-core-4.18.0-372.9.1.el8.x86_64        Wed 15 Jun 2022 09:05:12 PM CEST\n";
        assert_eq!(
            parse_last_update(out).unwrap(),
            date(2022, 6, 15, 21, 5, 12)
        );
    }

    #[test]
    fn test_parse_ctime_format() {
        // 2021-06-14 was a Monday.
        let out = "glibc-2.17-317.el7.x86_64 Mon Jun 14 10:32:55 2021\n";
        assert_eq!(
            parse_last_update(out).unwrap(),
            date(2021, 6, 14, 10, 32, 55)
        );
    }

    #[test]
    fn test_parse_skips_leading_blank_lines() {
        let out = "\n\nzlib-1.2.11-17.el8.x86_64  Tue 14 Jun 2022 10:32:55 AM UTC\n";
        assert!(parse_last_update(out).is_ok());
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(matches!(
            parse_last_update(""),
            Err(CheckError::EmptyHistory)
        ));
        assert!(matches!(
            parse_last_update("\n \n"),
            Err(CheckError::EmptyHistory)
        ));
    }

    #[test]
    fn test_parse_garbage_line() {
        let err = parse_last_update("this is not rpm output").unwrap_err();
        assert!(matches!(err, CheckError::UnparsableTimestamp(_)));

        let err = parse_last_update("lonely-package-1.0").unwrap_err();
        assert!(matches!(err, CheckError::UnparsableTimestamp(_)));
    }

    #[test]
    fn test_days_since() {
        let ten_days_ago = Local::now().naive_local() - chrono::Duration::days(10);
        assert_eq!(days_since(ten_days_ago), 10);
    }

    #[test]
    fn test_days_since_clamps_future_timestamps() {
        let tomorrow = Local::now().naive_local() + chrono::Duration::days(1);
        assert_eq!(days_since(tomorrow), 0);
    }

    #[test]
    fn test_error_states() {
        assert_eq!(
            CheckError::Timeout { timeout_secs: 30 }.service_state(),
            ServiceState::Critical
        );
        assert_eq!(
            CheckError::EmptyHistory.service_state(),
            ServiceState::Unknown
        );
        assert_eq!(
            CheckError::RpmMissing {
                path: PathBuf::from("/usr/bin/rpm")
            }
            .service_state(),
            ServiceState::Unknown
        );
        assert_eq!(
            CheckError::Config(ConfigError::WarningOutOfRange(0)).service_state(),
            ServiceState::Unknown
        );
    }

    #[test]
    fn test_rpm_preflight_missing() {
        let cfg = CheckConfig::new(60, 90, 30)
            .unwrap()
            .with_rpm_path("/nonexistent/rpm");
        assert!(matches!(
            run_check(&cfg),
            Err(CheckError::RpmMissing { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_rpm_preflight_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CheckConfig::new(60, 90, 30)
            .unwrap()
            .with_rpm_path(dir.path());
        assert!(matches!(
            run_check(&cfg),
            Err(CheckError::RpmNotAFile { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_rpm_preflight_not_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpm");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();

        let cfg = CheckConfig::new(60, 90, 30).unwrap().with_rpm_path(&path);
        assert!(matches!(
            run_check(&cfg),
            Err(CheckError::RpmNotExecutable { .. })
        ));
    }
}
