//! Orchestrator configuration.
//!
//! Defaults are usable as-is; `from_env` overlays `SEGFORGE_*` variables and
//! `from_json` loads a full or partial JSON document.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use segforge_core::ProjectName;
use segforge_jobs::DEFAULT_UNFINISHED_RATIO_CAP;

use crate::admission::{StaticAdmissionPolicy, DEFAULT_SUBMIT_JOB_MULTIPLIER};
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidVar { var: &'static str, reason: String },

    #[error("invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::InvalidVar { .. } => "INVALID_CONFIG_VAR",
            ConfigError::Json(_) => "INVALID_CONFIG_DOCUMENT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Delay between the end of one iteration and the start of the next.
    pub interval_secs: u64,
    /// Feed records fetched per batch.
    pub batch_size: usize,
    /// Upper bound on records folded in by one iteration.
    pub max_records_per_iteration: usize,
    /// Delay before an on-demand trigger runs.
    pub on_demand_delay_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            batch_size: 1000,
            max_records_per_iteration: 10_000,
            on_demand_delay_ms: 1000,
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn on_demand_delay(&self) -> Duration {
        Duration::from_millis(self.on_demand_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Retry policy of general store mutations and admission.
    pub transaction_retry: RetryPolicy,
    pub unfinished_ratio_cap: f64,
    pub default_running_job_limit: usize,
    pub project_running_job_limits: BTreeMap<String, usize>,
    pub submit_job_multiplier: usize,
    pub maintenance: MaintenanceConfig,
    /// Projects that get a periodic `LAYOUT_CLEANUP` job.
    pub cron_projects: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            transaction_retry: RetryPolicy::default(),
            unfinished_ratio_cap: DEFAULT_UNFINISHED_RATIO_CAP,
            default_running_job_limit: 20,
            project_running_job_limits: BTreeMap::new(),
            submit_job_multiplier: DEFAULT_SUBMIT_JOB_MULTIPLIER,
            maintenance: MaintenanceConfig::default(),
            cron_projects: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overlaid with `SEGFORGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = parsed(&lookup, "SEGFORGE_TX_MAX_ATTEMPTS")? {
            cfg.transaction_retry.max_attempts = v;
        }
        if let Some(v) = parsed::<u64, _>(&lookup, "SEGFORGE_TX_BASE_DELAY_MS")? {
            cfg.transaction_retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parsed(&lookup, "SEGFORGE_UNFINISHED_RATIO_CAP")? {
            cfg.unfinished_ratio_cap = v;
        }
        if let Some(v) = parsed(&lookup, "SEGFORGE_RUNNING_JOB_LIMIT")? {
            cfg.default_running_job_limit = v;
        }
        if let Some(v) = parsed(&lookup, "SEGFORGE_SUBMIT_JOB_MULTIPLIER")? {
            cfg.submit_job_multiplier = v;
        }
        if let Some(v) = parsed(&lookup, "SEGFORGE_MAINTENANCE_INTERVAL_SECS")? {
            cfg.maintenance.interval_secs = v;
        }
        if let Some(v) = parsed(&lookup, "SEGFORGE_MAINTENANCE_BATCH_SIZE")? {
            cfg.maintenance.batch_size = v;
        }
        if let Some(v) = parsed(&lookup, "SEGFORGE_MAINTENANCE_MAX_RECORDS")? {
            cfg.maintenance.max_records_per_iteration = v;
        }
        if let Some(v) = parsed(&lookup, "SEGFORGE_ON_DEMAND_DELAY_MS")? {
            cfg.maintenance.on_demand_delay_ms = v;
        }
        if let Some(raw) = lookup("SEGFORGE_CRON_PROJECTS") {
            cfg.cron_projects = raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Unfinished jobs must never report a full ratio.
        if !(self.unfinished_ratio_cap > 0.0 && self.unfinished_ratio_cap < 1.0) {
            return Err(ConfigError::InvalidVar {
                var: "SEGFORGE_UNFINISHED_RATIO_CAP",
                reason: format!("{} is outside (0, 1)", self.unfinished_ratio_cap),
            });
        }
        if self.maintenance.batch_size == 0 {
            return Err(ConfigError::InvalidVar {
                var: "SEGFORGE_MAINTENANCE_BATCH_SIZE",
                reason: "must be positive".to_string(),
            });
        }
        for project in &self.cron_projects {
            ProjectName::new(project.clone()).map_err(|e| ConfigError::InvalidVar {
                var: "SEGFORGE_CRON_PROJECTS",
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn admission_policy(&self) -> StaticAdmissionPolicy {
        StaticAdmissionPolicy {
            default_limit: self.default_running_job_limit,
            per_project: self.project_running_job_limits.clone(),
        }
    }

    pub fn cron_project_names(&self) -> Vec<ProjectName> {
        self.cron_projects
            .iter()
            .filter_map(|p| ProjectName::new(p.clone()).ok())
            .collect()
    }
}

fn parsed<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidVar {
                var,
                reason: e.to_string(),
            }),
    }
}
