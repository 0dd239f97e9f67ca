//! # air_download
//! ## Before you begin
//! This library talks to the Automated Image Retrieval (AIR) portal of a hospital PACS. To use it you need an AIR account and
//! the URL of the AIR API, e.g. `https://air.<domain>.edu/api/`.
//!
//! Credentials are read from a dotenv-style file defining `AIR_USERNAME` and `AIR_PASSWORD`, or from the environment
//! variables of the same names. More details in [CredentialSource].
//!
//! ## Description
//! **air_download** retrieves one radiology study, identified by its accession number, as a (usually anonymized) zip archive
//! of DICOM files. A run goes through four steps, each with its own error type:
//!
//! 1. [authenticate()] logs in and returns a [Session] ([AuthError]).
//! 2. [submit()] locates the study, narrows its series with an optional [SeriesFilter] and starts the export ([RequestError]).
//! 3. [poll()] waits until AIR reports the [Job] as finished ([JobError]).
//! 4. [download()] streams the archive to disk and returns a [DownloadResult] ([DownloadError]).
//!
//! [run()] chains the four steps from a [RunConfig] and turns the outcome into a process exit code. [list_projects()] and
//! [list_available_profiles()] help pick the project and anonymization profile to export with.
//!
//! ## Example
//! ```rust no_run
//! use air_download::{CredentialSource, ExportRequest, PollSettings, RunConfig};
//!
//! #[tokio::main]
//! pub async fn main() {
//!     let config = RunConfig {
//!         url: "https://air.example.edu/api/".to_string(),
//!         credentials: CredentialSource::Environment,
//!         request: ExportRequest::new("E12345678", "3", -1, Some("t1,flair".parse().unwrap())).unwrap(),
//!         output: None,
//!         poll: PollSettings::default(),
//!         show_progress: true,
//!     };
//!
//!     match air_download::try_run(&config).await {
//!         Ok(result) => println!("{} bytes written to {}", result.byte_count, result.output_path.display()),
//!         Err(e) => panic!("Error: {}", e),
//!     }
//! }
//! ```

mod auth;
mod config;
mod error;
mod get;
mod post;
mod structs;

pub use auth::{authenticate, Session};
pub use config::{api_base, load_credentials, resolve_output_path, PASSWORD_KEY, USERNAME_KEY};
pub use error::{AirError, AuthError, ConfigError, DownloadError, JobError, RequestError};
pub use get::{download, poll};
pub use post::{list_profiles, submit};
pub use structs::{
    CredentialSource, Credentials, DownloadResult, DownloadStatus, ExportRequest, Job, JobStatus,
    PollSettings, Profile, Project, RunConfig, SeriesFilter, DEFAULT_PROFILE, DEFAULT_PROJECT,
};

use tracing::{error, info};

/// Runs one export and returns the process exit code: 0 on success, the
/// failing stage's [AirError::exit_code] otherwise.
pub async fn run(config: &RunConfig) -> i32 {
    match try_run(config).await {
        Ok(result) => {
            info!(
                "Accession {} saved to {} ({} bytes).",
                config.request.accession(),
                result.output_path.display(),
                result.byte_count
            );
            0
        }
        Err(e) => {
            error!("{}", e);
            if let AirError::Download(download_error) = &e {
                if let Some(partial) = download_error.result() {
                    error!(
                        "{} is incomplete ({} bytes written).",
                        partial.output_path.display(),
                        partial.byte_count
                    );
                }
            }
            e.exit_code()
        }
    }
}

/// Authenticates, submits, polls and downloads, stopping at the first failure.
///
/// Credentials and arguments are checked before the first network call.
pub async fn try_run(config: &RunConfig) -> Result<DownloadResult, AirError> {
    let credentials = load_credentials(&config.credentials)?;
    let base = api_base(&config.url)?;
    config.poll.validate()?;
    let output_path = resolve_output_path(config.output.as_deref(), config.request.accession())?;

    let session = authenticate(&base, &credentials).await?;
    let job = submit(&session, &config.request).await?;
    let job = poll(&session, job, &config.poll).await?;
    let result = download(&session, &job, &output_path, config.show_progress).await?;

    Ok(result)
}

/// Projects granted to the user, as reported at login.
pub async fn list_projects(url: &str, source: &CredentialSource) -> Result<Vec<Project>, AirError> {
    let session = login(url, source).await?;
    Ok(session.projects().to_vec())
}

/// Anonymization profiles available to the user.
pub async fn list_available_profiles(
    url: &str,
    source: &CredentialSource,
) -> Result<Vec<Profile>, AirError> {
    let session = login(url, source).await?;
    Ok(list_profiles(&session).await?)
}

async fn login(url: &str, source: &CredentialSource) -> Result<Session, AirError> {
    let credentials = load_credentials(source)?;
    let base = api_base(url)?;
    Ok(authenticate(&base, &credentials).await?)
}
