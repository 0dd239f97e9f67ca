use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::structs::{DownloadResult, DownloadStatus, JobStatus, Profile, Project};

/// Failures while establishing the authenticated session.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("AIR rejected the credentials: {reason}")]
    InvalidCredentials { reason: String },

    #[error("AIR login endpoint is unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    #[error("unexpected login response: {0}")]
    UnexpectedResponse(String),
}

/// Failures while locating the study and submitting the export job.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("accession {accession} does not exist or is not accessible under project {project}")]
    InvalidAccession { accession: String, project: String },

    #[error("project {project} is invalid or missing, available projects: {}", list_choices(.available))]
    InvalidProject {
        project: String,
        available: Vec<Project>,
    },

    #[error("anonymization profile {profile} is invalid or missing, available profiles: {}", list_choices(.available))]
    InvalidProfile {
        profile: i64,
        available: Vec<Profile>,
    },

    #[error("no series matches the inclusion patterns {patterns:?}")]
    NoMatchingSeries { patterns: Vec<String> },

    #[error("export was refused by AIR: {0}")]
    Rejected(String),

    #[error("AIR returned HTTP {status} from {endpoint}")]
    ServerError { endpoint: &'static str, status: u16 },

    #[error("AIR is unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    #[error("unexpected response from {endpoint}: {detail}")]
    UnexpectedResponse {
        endpoint: &'static str,
        detail: String,
    },
}

/// Failures while waiting for the export job to finish.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {job_id} still {last_status:?} after {waited:?}")]
    Timeout {
        job_id: String,
        waited: Duration,
        last_status: JobStatus,
    },

    #[error("job {job_id} failed on the AIR side: {reason}")]
    RemoteFailure { job_id: String, reason: String },

    #[error("lost contact with AIR while polling job {job_id} ({attempts} failed attempts, last: {last_error})")]
    Unreachable {
        job_id: String,
        attempts: u32,
        last_error: String,
    },
}

/// Failures while streaming the archive to disk.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("transfer to {} stopped after {received} of {} bytes: {detail}", .path.display(), expected_len(.expected))]
    IncompleteTransfer {
        path: PathBuf,
        received: u64,
        expected: Option<u64>,
        detail: String,
    },

    #[error("cannot write {} after {received} bytes: {source}", .path.display())]
    WriteError {
        path: PathBuf,
        received: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("AIR refused the archive download with HTTP {status}")]
    ServerRejected { status: u16 },

    #[error("AIR archive endpoint is unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    #[error("AIR did not answer the archive request within {waited:?}")]
    NoResponse { waited: Duration },

    #[error("job {job_id} is {status:?}, not ready for download")]
    JobNotReady { job_id: String, status: JobStatus },
}

impl DownloadError {
    /// The non-complete result left behind by a failed transfer, if a file was opened.
    pub fn result(&self) -> Option<DownloadResult> {
        match self {
            DownloadError::IncompleteTransfer { path, received, .. } => Some(DownloadResult {
                output_path: path.clone(),
                byte_count: *received,
                status: DownloadStatus::Partial,
            }),
            DownloadError::WriteError { path, received, .. } => Some(DownloadResult {
                output_path: path.clone(),
                byte_count: *received,
                status: DownloadStatus::Failed,
            }),
            _ => None,
        }
    }
}

/// Invalid local configuration, detected before any network call.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("AIR credentials not provided: {0}")]
    MissingCredentials(String),

    #[error("cannot read credential file {}: {source}", .path.display())]
    CredentialsFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },

    #[error("{0}")]
    InvalidArguments(String),

    #[error("cannot prepare output location {}: {source}", .path.display())]
    OutputPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Any failure of a run, tagged with the stage it happened in.
#[derive(Debug, Error)]
pub enum AirError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("export request failed: {0}")]
    Request(#[from] RequestError),

    #[error("export job failed: {0}")]
    Job(#[from] JobError),

    #[error("archive download failed: {0}")]
    Download(#[from] DownloadError),
}

impl AirError {
    pub fn stage(&self) -> &'static str {
        match self {
            AirError::Config(_) => "configuration",
            AirError::Auth(_) => "authentication",
            AirError::Request(_) => "export request",
            AirError::Job(_) => "job polling",
            AirError::Download(_) => "archive download",
        }
    }

    /// Process exit code for this failure. Success is always 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            AirError::Config(_) => 2,
            AirError::Auth(_) => 3,
            AirError::Request(_) => 4,
            AirError::Job(_) => 5,
            AirError::Download(_) => 6,
        }
    }
}

fn list_choices<T: std::fmt::Display>(choices: &[T]) -> String {
    if choices.is_empty() {
        return "none reported".to_string();
    }
    choices
        .iter()
        .map(|choice| choice.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn expected_len(expected: &Option<u64>) -> String {
    match expected {
        Some(len) => len.to_string(),
        None => "an unknown number of".to_string(),
    }
}
