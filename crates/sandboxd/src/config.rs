use std::time::Duration;

use sandbox_core::ResourceLimits;

use crate::error::{ManagerError, ManagerResult};

pub(crate) const DEFAULT_HOST: &str = "0.0.0.0";
pub(crate) const DEFAULT_PORT: u16 = 8001;
pub(crate) const DEFAULT_IMAGE: &str = "python:3.11-slim";
pub(crate) const DEFAULT_NETWORK: &str = "sandbox-net";
pub(crate) const DEFAULT_MAX_CONTAINERS: usize = 10;
pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 3600;
pub(crate) const DEFAULT_SWEEP_SECS: u64 = 60;
pub(crate) const DEFAULT_GRACE_SECS: u64 = 10;
pub(crate) const DEFAULT_PURGE_GRACE_SECS: u64 = 300;
pub(crate) const DEFAULT_MEMORY_MB: u32 = 512;
pub(crate) const DEFAULT_CPU_MILLI: u32 = 1000;
pub(crate) const DEFAULT_JOB_TIMEOUT_SECS: u64 = 30;

/// Typed service configuration, read from the environment at startup.
///
/// Every recognized option is an explicit field; unknown or malformed
/// values fail startup instead of being silently defaulted at use sites.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Default container image for sandboxes that don't request one.
    pub image: String,
    /// Name of the isolated bridge network sandboxes attach to.
    pub network: String,
    /// Docker binary to drive.
    pub docker_binary: String,

    /// Fleet-wide cap on live sandboxes.
    pub max_containers: usize,
    /// Idle/wall-time limit per sandbox.
    pub sandbox_timeout: Duration,
    /// Reaper sweep period.
    pub sweep_interval: Duration,
    /// Graceful-stop window before force kill.
    pub grace_period: Duration,
    /// How long a Terminated record stays visible before purge.
    pub purge_grace: Duration,
    /// Default per-job execution timeout.
    pub job_timeout: Duration,

    /// Default per-sandbox limits.
    pub default_cpu_milli: u32,
    pub default_memory_mb: u32,
    /// Fleet-wide ceilings, in the same units.
    pub cpu_ceiling_milli: u64,
    pub memory_ceiling_mb: u64,
    /// Optional per-owner cap on live sandboxes.
    pub owner_max: Option<usize>,

    /// Redis URL for registry persistence; in-memory store when unset.
    pub redis_url: Option<String>,
    /// Webhook URL for lifecycle events; log-only sink when unset.
    pub event_webhook: Option<String>,
}

impl Config {
    /// Load from process environment variables.
    pub fn from_env() -> ManagerResult<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable lookup (injectable for tests).
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> ManagerResult<Self> {
        let max_containers =
            parse_or(&var, "MAX_SANDBOX_CONTAINERS", DEFAULT_MAX_CONTAINERS)?;
        if max_containers == 0 {
            return Err(ManagerError::Config(
                "MAX_SANDBOX_CONTAINERS must be at least 1".into(),
            ));
        }

        let timeout_secs: u64 = parse_or(&var, "SANDBOX_TIMEOUT", DEFAULT_TIMEOUT_SECS)?;
        if timeout_secs == 0 {
            return Err(ManagerError::Config("SANDBOX_TIMEOUT must be > 0".into()));
        }

        let network = var("SANDBOX_NETWORK").unwrap_or_else(|| DEFAULT_NETWORK.into());
        if network.trim().is_empty() {
            return Err(ManagerError::Config("SANDBOX_NETWORK must not be empty".into()));
        }

        let cpu_cores: f64 =
            parse_or(&var, "SANDBOX_CPU_LIMIT", f64::from(DEFAULT_CPU_MILLI) / 1000.0)?;
        if cpu_cores <= 0.0 || !cpu_cores.is_finite() {
            return Err(ManagerError::Config("SANDBOX_CPU_LIMIT must be > 0".into()));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let default_cpu_milli = (cpu_cores * 1000.0).round() as u32;

        let default_memory_mb: u32 =
            parse_or(&var, "SANDBOX_MEMORY_LIMIT_MB", DEFAULT_MEMORY_MB)?;
        if default_memory_mb == 0 {
            return Err(ManagerError::Config(
                "SANDBOX_MEMORY_LIMIT_MB must be > 0".into(),
            ));
        }

        // Fleet ceilings default to cap x per-sandbox default.
        let cpu_ceiling_milli = parse_or(
            &var,
            "SANDBOX_CPU_CEILING_MILLI",
            max_containers as u64 * u64::from(default_cpu_milli),
        )?;
        let memory_ceiling_mb = parse_or(
            &var,
            "SANDBOX_MEMORY_CEILING_MB",
            max_containers as u64 * u64::from(default_memory_mb),
        )?;
        if cpu_ceiling_milli < u64::from(default_cpu_milli)
            || memory_ceiling_mb < u64::from(default_memory_mb)
        {
            return Err(ManagerError::Config(
                "fleet ceilings must admit at least one default-sized sandbox".into(),
            ));
        }

        let owner_max = match var("SANDBOX_OWNER_MAX") {
            Some(raw) => {
                let n: usize = raw.parse().map_err(|_| {
                    ManagerError::Config(format!("SANDBOX_OWNER_MAX: invalid value {raw:?}"))
                })?;
                if n == 0 {
                    return Err(ManagerError::Config("SANDBOX_OWNER_MAX must be > 0".into()));
                }
                Some(n)
            }
            None => None,
        };

        Ok(Self {
            host: var("SANDBOX_HOST").unwrap_or_else(|| DEFAULT_HOST.into()),
            port: parse_or(&var, "SANDBOX_PORT", DEFAULT_PORT)?,
            image: var("SANDBOX_IMAGE").unwrap_or_else(|| DEFAULT_IMAGE.into()),
            network,
            docker_binary: var("SANDBOX_DOCKER_BIN").unwrap_or_else(|| "docker".into()),
            max_containers,
            sandbox_timeout: Duration::from_secs(timeout_secs),
            sweep_interval: Duration::from_secs(parse_or(
                &var,
                "SANDBOX_SWEEP_INTERVAL",
                DEFAULT_SWEEP_SECS,
            )?),
            grace_period: Duration::from_secs(parse_or(
                &var,
                "SANDBOX_GRACE_PERIOD",
                DEFAULT_GRACE_SECS,
            )?),
            purge_grace: Duration::from_secs(parse_or(
                &var,
                "SANDBOX_PURGE_GRACE",
                DEFAULT_PURGE_GRACE_SECS,
            )?),
            job_timeout: Duration::from_secs(parse_or(
                &var,
                "SANDBOX_JOB_TIMEOUT",
                DEFAULT_JOB_TIMEOUT_SECS,
            )?),
            default_cpu_milli,
            default_memory_mb,
            cpu_ceiling_milli,
            memory_ceiling_mb,
            owner_max,
            redis_url: var("SANDBOX_REDIS_URL").filter(|s| !s.is_empty()),
            event_webhook: var("SANDBOX_EVENT_WEBHOOK").filter(|s| !s.is_empty()),
        })
    }

    /// Resolve request-level overrides into concrete limits, clamped so a
    /// single request can never exceed the configured defaults' ceilings.
    pub fn resolve_limits(
        &self,
        cpu_milli: Option<u32>,
        memory_mb: Option<u32>,
        timeout_secs: Option<u64>,
    ) -> ResourceLimits {
        ResourceLimits {
            cpu_milli: cpu_milli
                .unwrap_or(self.default_cpu_milli)
                .min(clamp_u64(self.cpu_ceiling_milli)),
            memory_mb: memory_mb
                .unwrap_or(self.default_memory_mb)
                .min(clamp_u64(self.memory_ceiling_mb)),
            wall_time: Duration::from_secs(
                timeout_secs
                    .unwrap_or(self.sandbox_timeout.as_secs())
                    .min(self.sandbox_timeout.as_secs()),
            ),
        }
    }
}

fn clamp_u64(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

fn parse_or<T: std::str::FromStr>(
    var: impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> ManagerResult<T> {
    match var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ManagerError::Config(format!("{key}: invalid value {raw:?}"))),
        None => Ok(default),
    }
}
