//! Core records: configurations, executions, per-script results.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ConfigurationId = i64;
pub type ExecutionId = i64;
pub type ResultId = i64;
pub type ScriptId = i64;
pub type ProjectId = i64;

/// Recurrence interval code as stored in the configuration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Periodicity {
    #[serde(rename = "2min")]
    EveryTwoMinutes,
    #[serde(rename = "2h")]
    EveryTwoHours,
    #[serde(rename = "6h")]
    EverySixHours,
    #[serde(rename = "1j")]
    Daily,
    #[serde(rename = "1s")]
    Weekly,
    #[serde(rename = "1m")]
    Monthly,
}

impl Periodicity {
    pub const ALL: [Periodicity; 6] = [
        Periodicity::EveryTwoMinutes,
        Periodicity::EveryTwoHours,
        Periodicity::EverySixHours,
        Periodicity::Daily,
        Periodicity::Weekly,
        Periodicity::Monthly,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Periodicity::EveryTwoMinutes => "2min",
            Periodicity::EveryTwoHours => "2h",
            Periodicity::EverySixHours => "6h",
            Periodicity::Daily => "1j",
            Periodicity::Weekly => "1s",
            Periodicity::Monthly => "1m",
        }
    }
}

impl fmt::Display for Periodicity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A notification address attached to a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub email: String,
    pub is_active: bool,
}

/// A periodic test campaign.
///
/// The periodicity is kept as the raw stored code: an unknown code is a
/// per-configuration error that the scheduler reports and skips, so it must
/// survive loading.
#[derive(Debug, Clone, Serialize)]
pub struct Configuration {
    pub id: ConfigurationId,
    pub tenant_id: i64,
    pub project_id: ProjectId,
    pub name: String,
    pub periodicity: String,
    pub is_active: bool,
    pub activation_at: Option<DateTime<Utc>>,
    pub deactivation_at: Option<DateTime<Utc>>,
    pub last_execution: Option<DateTime<Utc>>,
    pub script_ids: Vec<ScriptId>,
    pub recipients: Vec<Recipient>,
}

impl Configuration {
    /// True while the active flag is set and `now` falls inside the validity window.
    pub fn in_scope(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.activation_at.map_or(true, |at| now >= at)
            && self.deactivation_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Identifier of the project in the external issue tracker.
    pub tracker_project_id: Option<String>,
    /// Tracker user that new tickets get assigned to.
    pub tracker_assignee_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Script {
    pub id: ScriptId,
    pub name: String,
    /// Path of the executable artifact, relative to the media root unless absolute.
    pub path: String,
    /// 1 (low) to 5 (immediate); forwarded as the ticket priority.
    pub priority: u8,
}

/// Lifecycle of an execution. Transitions only move forward:
/// `Pending -> Running -> {Done | Error}`, or straight to `NonExecuted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Done,
    Error,
    NonExecuted,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Done => "done",
            ExecutionStatus::Error => "error",
            ExecutionStatus::NonExecuted => "non_executed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Done | ExecutionStatus::Error | ExecutionStatus::NonExecuted
        )
    }

    /// Human-readable outcome used in notifications.
    pub fn label(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "Pending",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Done => "Conclusive",
            ExecutionStatus::Error => "Not conclusive",
            ExecutionStatus::NonExecuted => "Not executed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognised status label '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for ExecutionStatus {
    type Err = UnknownStatus;

    /// Accepts the canonical labels plus the legacy spellings found in
    /// historical rows.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "pending" | "en_attente" => Ok(ExecutionStatus::Pending),
            "running" | "en_cours" => Ok(ExecutionStatus::Running),
            "done" | "success" | "succès" | "succes" | "concluant" => Ok(ExecutionStatus::Done),
            "error" | "failure" | "failed" | "échec" | "echec" | "non_concluant" => {
                Ok(ExecutionStatus::Error)
            }
            "non_executed" | "non_exécuté" | "non_execute" => Ok(ExecutionStatus::NonExecuted),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Status of one script inside an execution. Same states as
/// [`ExecutionStatus`] minus `NonExecuted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        ExecutionStatus::from(self).as_str()
    }
}

impl From<ResultStatus> for ExecutionStatus {
    fn from(s: ResultStatus) -> Self {
        match s {
            ResultStatus::Pending => ExecutionStatus::Pending,
            ResultStatus::Running => ExecutionStatus::Running,
            ResultStatus::Done => ExecutionStatus::Done,
            ResultStatus::Error => ExecutionStatus::Error,
        }
    }
}

impl FromStr for ResultStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<ExecutionStatus>()? {
            ExecutionStatus::Pending => Ok(ResultStatus::Pending),
            ExecutionStatus::Running => Ok(ResultStatus::Running),
            ExecutionStatus::Done => Ok(ResultStatus::Done),
            ExecutionStatus::Error => Ok(ResultStatus::Error),
            ExecutionStatus::NonExecuted => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// One scheduled run of a configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub configuration_id: ConfigurationId,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub report: String,
    pub log_path: Option<String>,
    pub ticket_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub id: ResultId,
    pub execution_id: ExecutionId,
    pub script_id: ScriptId,
    pub status: ResultStatus,
    pub log_path: Option<String>,
    pub comment: String,
}
