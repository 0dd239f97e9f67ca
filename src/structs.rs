use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::error::ConfigError;

/// Anonymization profile meaning "no profile".
pub const DEFAULT_PROFILE: i64 = -1;
/// Project used when none is given on the command line.
pub const DEFAULT_PROJECT: &str = "3";

/// AIR login pair. The password never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where the credentials are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// A dotenv-style file defining `AIR_USERNAME` and `AIR_PASSWORD`.
    File(PathBuf),
    /// The `AIR_USERNAME` and `AIR_PASSWORD` environment variables.
    Environment,
}

/// Case-insensitive series description patterns, combined with OR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesFilter {
    patterns: Vec<String>,
}

impl SeriesFilter {
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|pattern| pattern.as_ref().trim().to_lowercase())
            .filter(|pattern| !pattern.is_empty())
            .collect();

        if patterns.is_empty() {
            return Err(ConfigError::InvalidArguments(
                "series inclusion list contains no pattern".to_string(),
            ));
        }
        Ok(Self { patterns })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// True when any pattern occurs in the description, ignoring case.
    pub fn matches(&self, description: &str) -> bool {
        let description = description.to_lowercase();
        self.patterns
            .iter()
            .any(|pattern| description.contains(pattern.as_str()))
    }
}

impl FromStr for SeriesFilter {
    type Err = ConfigError;

    /// Parses a comma-separated list such as `t1,spgr,bravo,mpr`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_patterns(s.split(','))
    }
}

/// What to export. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    accession: String,
    project_id: String,
    anonymization_profile: i64,
    series_inclusion: Option<SeriesFilter>,
}

impl ExportRequest {
    pub fn new(
        accession: impl Into<String>,
        project_id: impl Into<String>,
        anonymization_profile: i64,
        series_inclusion: Option<SeriesFilter>,
    ) -> Result<Self, ConfigError> {
        let accession = accession.into().trim().to_string();
        if accession.is_empty() {
            return Err(ConfigError::InvalidArguments(
                "accession number must not be empty".to_string(),
            ));
        }
        let project_id = project_id.into().trim().to_string();
        if project_id.is_empty() {
            return Err(ConfigError::InvalidArguments(
                "project ID must not be empty".to_string(),
            ));
        }
        Ok(Self {
            accession,
            project_id,
            anonymization_profile,
            series_inclusion,
        })
    }

    pub fn accession(&self) -> &str {
        &self.accession
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn anonymization_profile(&self) -> i64 {
        self.anonymization_profile
    }

    pub fn series_inclusion(&self) -> Option<&SeriesFilter> {
        self.series_inclusion.as_ref()
    }
}

/// Lifecycle of an export job as reported by AIR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Succeeded | JobStatus::Failed => 2,
        }
    }

    /// Maps the `status` string of the download check endpoint.
    ///
    /// AIR answers `started` as soon as the archive stream can be opened, so it
    /// counts as success. Unknown values are treated as work in progress.
    pub(crate) fn from_wire(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "" | "pending" | "queued" | "waiting" => JobStatus::Pending,
            "started" | "completed" | "complete" | "succeeded" | "done" => JobStatus::Succeeded,
            "failed" | "error" | "cancelled" | "canceled" | "aborted" => JobStatus::Failed,
            _ => JobStatus::Running,
        }
    }
}

/// One export job. Created by [crate::submit], advanced only by [crate::poll].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    id: String,
    project_id: String,
    status: JobStatus,
    created_at: DateTime<Utc>,
    failure_reason: Option<String>,
}

impl Job {
    pub(crate) fn new(id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            failure_reason: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Applies a status reported by AIR. Returns whether the job moved.
    ///
    /// Terminal jobs never change and reports that would move the job
    /// backward are ignored.
    pub(crate) fn observe(&mut self, status: JobStatus, reason: Option<String>) -> bool {
        if self.status.is_terminal() || status == self.status {
            return false;
        }
        if status.rank() < self.status.rank() {
            warn!(
                "Ignoring {:?} for job {} already {:?}",
                status, self.id, self.status
            );
            return false;
        }
        self.status = status;
        if status == JobStatus::Failed {
            self.failure_reason = reason;
        }
        true
    }
}

/// Polling cadence for the export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Pause between two status queries.
    pub interval: Duration,
    /// Give up once the job has not finished after this long.
    pub max_wait: Duration,
    /// Consecutive failed status queries tolerated before giving up.
    pub max_transient_retries: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(60 * 60),
            max_transient_retries: 5,
        }
    }
}

impl PollSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::InvalidArguments(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if self.max_wait.is_zero() {
            return Err(ConfigError::InvalidArguments(
                "poll timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Complete,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub output_path: PathBuf,
    pub byte_count: u64,
    pub status: DownloadStatus,
}

/// A project the authenticated user may export under.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Project {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID: {}, Name: {}", self.id, self.name)
    }
}

/// A server-side anonymization preset.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID: {}, Name: {}, Description: {}",
            self.id,
            self.name,
            self.description.as_deref().unwrap_or("")
        )
    }
}

/// Everything a single run needs, fixed before the first network call.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Base URL of the AIR API, e.g. `https://air.example.edu/api/`.
    pub url: String,
    pub credentials: CredentialSource,
    pub request: ExportRequest,
    /// File or directory to write to. Defaults to `./<ACCESSION>.zip`.
    pub output: Option<PathBuf>,
    pub poll: PollSettings,
    pub show_progress: bool,
}

/// AIR hands out identifiers as JSON numbers or strings depending on the endpoint.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Integer(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Integer(number) => number.to_string(),
    })
}
