//! Instance record: lifecycle states and the pure computations attached to
//! them. Side-effecting lifecycle actions (start/stop/backup/terminate and
//! the provisioning sequence itself) live in [`crate::provision`].
//!
//! States move strictly forward — `draft → provisioning → active →
//! terminated` — except the `active ⇄ suspended` pair, and any
//! pre-terminated state can drop to `error` when the executor fails.

use chrono::{DateTime, Duration, SecondsFormat, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Draft,
    Provisioning,
    Active,
    Suspended,
    Terminated,
    Error,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Draft => "draft",
            InstanceState::Provisioning => "provisioning",
            InstanceState::Active => "active",
            InstanceState::Suspended => "suspended",
            InstanceState::Terminated => "terminated",
            InstanceState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(InstanceState::Draft),
            "provisioning" => Some(InstanceState::Provisioning),
            "active" => Some(InstanceState::Active),
            "suspended" => Some(InstanceState::Suspended),
            "terminated" => Some(InstanceState::Terminated),
            "error" => Some(InstanceState::Error),
            _ => None,
        }
    }

    /// Start is a resume from suspension; starting an already active
    /// instance is a no-op restart of the container.
    pub fn can_start(&self) -> bool {
        matches!(self, InstanceState::Suspended | InstanceState::Active)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, InstanceState::Active)
    }

    pub fn can_backup(&self) -> bool {
        matches!(self, InstanceState::Active)
    }

    pub fn can_terminate(&self) -> bool {
        !matches!(self, InstanceState::Terminated)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupFrequency {
    Daily,
    Weekly,
    Monthly,
}

impl BackupFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupFrequency::Daily => "daily",
            BackupFrequency::Weekly => "weekly",
            BackupFrequency::Monthly => "monthly",
        }
    }

    /// Unknown strings fall back to daily, the schema default.
    pub fn parse_or_daily(s: &str) -> Self {
        match s {
            "weekly" => BackupFrequency::Weekly,
            "monthly" => BackupFrequency::Monthly,
            _ => BackupFrequency::Daily,
        }
    }

    pub fn interval(&self) -> Duration {
        match self {
            BackupFrequency::Daily => Duration::days(1),
            BackupFrequency::Weekly => Duration::weeks(1),
            BackupFrequency::Monthly => Duration::days(30),
        }
    }
}

/// Public URL of an instance: `{scheme}://{subdomain}.{base_domain}`.
pub fn instance_url(subdomain: &str, ssl_enabled: bool, base_domain: &str) -> String {
    let protocol = if ssl_enabled { "https" } else { "http" };
    format!("{protocol}://{subdomain}.{base_domain}")
}

/// Due time of the backup after one taken at `last`, RFC-3339.
pub fn next_backup_after(last: DateTime<Utc>, frequency: BackupFrequency) -> String {
    (last + frequency.interval()).to_rfc3339_opts(SecondsFormat::Micros, true)
}
