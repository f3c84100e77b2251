//! Prometheus metric definitions and Nakivo reply transformations.
//!
//! [`NakivoMetrics`] holds one `IntGaugeVec` per exported family. The
//! `update_*` methods read a raw JSON reply and set the matching gauges.
//! Missing or malformed fields are recovered as locally as possible: license
//! counters fall back to a documented default, while VM duration and size
//! samples are left out rather than reported as zero.

use crate::client::{exception_message, is_exception, is_truthy};
use crate::error::{NakivoError, Result};
use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, IntGaugeVec, Opts, TextEncoder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, error, warn};

pub const API_ERROR: &str = "nakivo_api_error";
const API_ERROR_HELP: &str = "Nakivo API replied with an exception (1 = error)";

pub const AUTHENTICATION_ERROR: &str = "nakivo_api_authentication_error";
const AUTHENTICATION_ERROR_HELP: &str = "Nakivo API authentication failed (1 = error)";

pub const LICENSE_INSTALLED: &str = "nakivo_license_installed";
const LICENSE_INSTALLED_HELP: &str = "Is the Nakivo instance licensed";

pub const LICENSE_EXPIRATION: &str = "nakivo_license_expiration";
const LICENSE_EXPIRATION_HELP: &str = "When will the license expire (seconds)";

pub const BACKUP_STATE: &str = "nakivo_backup_state";
const BACKUP_STATE_HELP: &str = "Backup okay (0), warnings (1), failed (2)";

pub const BACKUP_DURATION: &str = "nakivo_backup_duration";
const BACKUP_DURATION_HELP: &str = "Backup duration (seconds)";

pub const BACKUP_SIZE: &str = "nakivo_backup_size";
const BACKUP_SIZE_HELP: &str = "Backup size (bytes)";

/// Job status colour of a job that was never scheduled.
pub const INACTIVE_JOB_STATUS: &str = "GRAY";

/// Rendered in place of a missing license client name.
const NO_CLIENT: &str = "None";

const HOST_LABELS: &[&str] = &["host"];
const LICENSE_LABELS: &[&str] = &["host", "client"];
const BACKUP_LABELS: &[&str] = &["host", "object", "job_name"];

/// License usage counters, in exposition order: (metric, help, field in `data`).
const LICENSE_COUNTERS: [(&str, &str, &str); 8] = [
    (
        "nakivo_license_vmcount",
        "How many VMs do we backup",
        "/data/usedVms",
    ),
    (
        "nakivo_license_sockets",
        "How many CPU sockets are used",
        "/data/usedSockets",
    ),
    (
        "nakivo_license_ec2count",
        "How many EC2 instances do we backup",
        "/data/usedEc2Instances",
    ),
    (
        "nakivo_license_physicalservercount",
        "How many physical servers do we backup",
        "/data/usedPhysicalServers",
    ),
    (
        "nakivo_license_physicalworkstationcount",
        "How many physical workstations do we backup",
        "/data/usedPhysicalWorkstations",
    ),
    (
        "nakivo_license_o365count",
        "How many Office 365 users do we backup",
        "/data/usedOffice365Users",
    ),
    (
        "nakivo_license_oraclecount",
        "How many Oracle databases do we backup",
        "/data/usedOracleDatabases",
    ),
    (
        "nakivo_license_monitoredvm",
        "How many VMs are monitored",
        "/data/usedMonitoredVms",
    ),
];

/// Outcome of the last run of a backup object, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackupState {
    Ok = 0,
    Warning = 1,
    Failure = 2,
}

impl BackupState {
    /// Map a VM's `lrState` to a backup state.
    ///
    /// A missing state means the object never ran yet, which is a warning and
    /// not a failure. Unknown states, on the other hand, are failures.
    pub fn classify(lr_state: Option<&str>) -> Self {
        match lr_state {
            Some("SUCCEEDED") => BackupState::Ok,
            Some("RUNNING" | "DEMAND" | "SCHEDULED" | "WAITING" | "SKIPPED") => {
                BackupState::Warning
            }
            Some(_) => BackupState::Failure,
            None => BackupState::Warning,
        }
    }

    pub fn value(self) -> i64 {
        self as i64
    }
}

/// Read a field by JSON pointer, falling back to `default` when the path is
/// absent or holds a value of the wrong type.
pub fn extract<T: DeserializeOwned>(payload: &Value, pointer: &str, default: T) -> T {
    payload
        .pointer(pointer)
        .and_then(|value| T::deserialize(value).ok())
        .unwrap_or(default)
}

/// Milliseconds to whole seconds, ties rounded to even.
pub fn ms_to_seconds(ms: f64) -> i64 {
    (ms / 1000.0).round_ties_even() as i64
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> Result<IntGaugeVec> {
    IntGaugeVec::new(Opts::new(name, help), labels).map_err(|e| NakivoError::Metrics(e.to_string()))
}

/// Nakivo metric families for one scrape.
///
/// Cloning is cheap and clones share the same gauges, so every host task of a
/// scrape writes into one set. Label sets never collide across hosts because
/// each sample carries its `host` label.
#[derive(Clone)]
pub struct NakivoMetrics {
    api_error: IntGaugeVec,
    authentication_error: IntGaugeVec,
    license_installed: IntGaugeVec,
    license_counters: Vec<(IntGaugeVec, &'static str)>,
    license_expiration: IntGaugeVec,
    backup_state: IntGaugeVec,
    backup_duration: IntGaugeVec,
    backup_size: IntGaugeVec,
}

impl NakivoMetrics {
    /// Create an empty set of Nakivo families.
    pub fn new() -> Result<Self> {
        let license_counters = LICENSE_COUNTERS
            .iter()
            .map(|(name, help, pointer)| Ok((gauge_vec(name, help, LICENSE_LABELS)?, *pointer)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            api_error: gauge_vec(API_ERROR, API_ERROR_HELP, HOST_LABELS)?,
            authentication_error: gauge_vec(
                AUTHENTICATION_ERROR,
                AUTHENTICATION_ERROR_HELP,
                HOST_LABELS,
            )?,
            license_installed: gauge_vec(LICENSE_INSTALLED, LICENSE_INSTALLED_HELP, LICENSE_LABELS)?,
            license_counters,
            license_expiration: gauge_vec(
                LICENSE_EXPIRATION,
                LICENSE_EXPIRATION_HELP,
                LICENSE_LABELS,
            )?,
            backup_state: gauge_vec(BACKUP_STATE, BACKUP_STATE_HELP, BACKUP_LABELS)?,
            backup_duration: gauge_vec(BACKUP_DURATION, BACKUP_DURATION_HELP, BACKUP_LABELS)?,
            backup_size: gauge_vec(BACKUP_SIZE, BACKUP_SIZE_HELP, BACKUP_LABELS)?,
        })
    }

    /// Families in exposition order.
    fn families(&self) -> Vec<&IntGaugeVec> {
        let mut families = vec![
            &self.api_error,
            &self.authentication_error,
            &self.license_installed,
        ];
        families.extend(self.license_counters.iter().map(|(gauge, _)| gauge));
        families.extend([
            &self.license_expiration,
            &self.backup_state,
            &self.backup_duration,
            &self.backup_size,
        ]);
        families
    }

    /// Collect the families that hold samples, in exposition order, with
    /// samples sorted by label values.
    pub fn gather(&self) -> Vec<MetricFamily> {
        let mut gathered = Vec::new();
        for family in self.families() {
            for mut mf in family.collect() {
                if mf.get_metric().is_empty() {
                    continue;
                }
                mf.mut_metric().sort_by(|a, b| {
                    a.get_label()
                        .iter()
                        .map(|lp| lp.value())
                        .cmp(b.get_label().iter().map(|lp| lp.value()))
                });
                gathered.push(mf);
            }
        }
        gathered
    }

    /// Encode metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.gather();
        let mut buffer = Vec::with_capacity(4096);

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| NakivoError::Metrics(e.to_string()))?;

        String::from_utf8(buffer).map_err(|e| NakivoError::Metrics(e.to_string()))
    }

    /// Number of samples across all families.
    pub fn sample_count(&self) -> usize {
        self.gather().iter().map(|mf| mf.get_metric().len()).sum()
    }

    /// Look up a single sample by family name and exact label set.
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<i64> {
        self.gather()
            .iter()
            .find(|mf| mf.name() == name)?
            .get_metric()
            .iter()
            .find(|m| {
                let pairs = m.get_label();
                pairs.len() == labels.len()
                    && labels.iter().all(|(key, value)| {
                        pairs
                            .iter()
                            .any(|lp| lp.name() == *key && lp.value() == *value)
                    })
            })
            .map(|m| m.get_gauge().value() as i64)
    }

    /// Set `nakivo_api_authentication_error` for a host.
    pub fn record_authentication(&self, host: &str, failed: bool) {
        self.authentication_error
            .with_label_values(&[host])
            .set(i64::from(failed));
    }

    /// Reported when the license call itself could not be completed.
    pub fn record_license_unavailable(&self, host: &str) {
        self.license_installed
            .with_label_values(&[host, NO_CLIENT])
            .set(0);
    }

    /// Turn an exception envelope into `nakivo_api_error{host} 1`.
    ///
    /// Returns `false` for anything that is not an exception, including
    /// replies without a `type` field.
    pub fn intercept_errors(&self, result: &Value, host: &str) -> bool {
        if !is_exception(result) {
            return false;
        }

        error!("API on {} replied: {}", host, exception_message(result));
        debug!("Full API return: {}", result);

        self.api_error.with_label_values(&[host]).set(1);
        true
    }

    /// Map a `getLicenseInfo` reply to the license families.
    ///
    /// Always sets all ten families; each field that cannot be read gets its
    /// default without affecting the others.
    pub fn update_license(&self, result: &Value, host: &str) {
        if self.intercept_errors(result, host) {
            return;
        }

        let installed = result.pointer("/data/installed").is_some_and(is_truthy);
        let client: Option<String> = extract(result, "/data/client", None);
        let client = client.unwrap_or_else(|| NO_CLIENT.to_string());
        let labels = [host, client.as_str()];
        debug!("Updating license metrics for {} (client {})", host, client);

        self.license_installed
            .with_label_values(&labels)
            .set(i64::from(installed));
        for (gauge, pointer) in &self.license_counters {
            let count: f64 = extract(result, pointer, 0.0);
            gauge.with_label_values(&labels).set(count.round() as i64);
        }
        self.license_expiration
            .with_label_values(&labels)
            .set(ms_to_seconds(extract(result, "/data/expiresIn", 0.0)));
    }

    /// Map a `getJobInfo` reply to per-VM backup families.
    ///
    /// With `filter_active_only`, jobs that were never scheduled are skipped.
    /// When two objects of one job share a name, the worse state wins.
    pub fn update_jobs(&self, result: &Value, host: &str, filter_active_only: bool) {
        if self.intercept_errors(result, host) {
            return;
        }

        let Some(jobs) = result.pointer("/data/children").and_then(Value::as_array) else {
            error!("Job info from {} has no job list", host);
            return;
        };

        let mut seen: HashMap<(&str, &str), BackupState> = HashMap::new();
        for job in jobs {
            let job_name = job.get("name").and_then(Value::as_str);
            let status = job.get("status").and_then(Value::as_str);

            if filter_active_only && status == Some(INACTIVE_JOB_STATUS) {
                debug!(
                    "Skipping inactive job {} on {}",
                    job_name.unwrap_or("<unnamed>"),
                    host
                );
                continue;
            }

            let Some(job_name) = job_name else {
                error!("Skipping job without name on {}", host);
                continue;
            };
            let Some(objects) = job.get("objects").and_then(Value::as_array) else {
                error!("Skipping job {} on {}: no object list", job_name, host);
                continue;
            };

            for vm in objects {
                self.update_vm(&mut seen, host, job_name, vm);
            }
        }
    }

    fn update_vm<'a>(
        &self,
        seen: &mut HashMap<(&'a str, &'a str), BackupState>,
        host: &str,
        job_name: &'a str,
        vm: &'a Value,
    ) {
        let Some(name) = vm.get("sourceName").and_then(Value::as_str) else {
            error!("Skipping object without sourceName in job {} on {}", job_name, host);
            return;
        };
        let labels = [host, name, job_name];
        let lr_state = vm.get("lrState").and_then(Value::as_str);
        let state = BackupState::classify(lr_state);

        if let Some(previous) = seen.get(&(job_name, name)).copied() {
            if state <= previous {
                warn!(
                    "Duplicate object {} in job {} on {}, keeping state {:?}",
                    name, job_name, host, previous
                );
                return;
            }
            warn!(
                "Duplicate object {} in job {} on {}, replacing state {:?} with {:?}",
                name, job_name, host, previous, state
            );
            // Absent samples must not be inherited from the better object.
            let _ = self.backup_duration.remove_label_values(&labels);
            let _ = self.backup_size.remove_label_values(&labels);
        }
        seen.insert((job_name, name), state);

        self.backup_state
            .with_label_values(&labels)
            .set(state.value());

        match extract::<Option<f64>>(vm, "/lrDuration", None) {
            Some(ms) => self
                .backup_duration
                .with_label_values(&labels)
                .set(ms_to_seconds(ms)),
            None => error!(
                "No lrDuration for {} in job {} on {}",
                name, job_name, host
            ),
        }

        match extract::<Option<f64>>(vm, "/lrDataTransferredUncompressed", None) {
            Some(bytes) => self
                .backup_size
                .with_label_values(&labels)
                .set(bytes.round() as i64),
            None => error!(
                "No lrDataTransferredUncompressed for {} in job {} on {}",
                name, job_name, host
            ),
        }
    }
}
