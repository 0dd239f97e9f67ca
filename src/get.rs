use std::{path::Path, time::Duration};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use serde_json::json;
use tokio::{fs::File, io::AsyncWriteExt, time::Instant};
use tracing::{debug, error, info, warn};

use crate::{
    auth::{Session, REQUEST_TIMEOUT},
    error::{DownloadError, JobError},
    post::ARCHIVE_NAME,
    structs::{DownloadResult, DownloadStatus, Job, JobStatus, PollSettings},
};

const CHECK_ENDPOINT: &str = "secure/search/download/check";
const ARCHIVE_ENDPOINT: &str = "secure/search/download/zip";

/// A status query may always take this long, unless `max_wait` runs out first.
const MIN_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize, Debug)]
struct CheckResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

enum CheckFailure {
    /// Worth asking again on the next tick.
    Transient(String),
    Fatal(String),
}

/// Waits for an export job to finish on the AIR side.
///
/// Queries the job status every `settings.interval` until AIR reports a
/// terminal state. The job is taken by value: it can only be polled once.
///
/// # Errors
///
/// * [JobError::RemoteFailure] if AIR reports the job as failed.
/// * [JobError::Timeout] if the job is still running after `settings.max_wait`,
///   including when AIR stops answering status queries.
/// * [JobError::Unreachable] after more than `settings.max_transient_retries`
///   status queries in a row failed on the network or with a 5xx.
pub async fn poll(session: &Session, mut job: Job, settings: &PollSettings) -> Result<Job, JobError> {
    let start = Instant::now();
    let mut failures = 0u32;

    loop {
        let query_timeout = settings
            .interval
            .max(MIN_QUERY_TIMEOUT)
            .min(settings.max_wait.saturating_sub(start.elapsed()));

        match check(session, &job, query_timeout).await {
            Ok((status, reason)) => {
                failures = 0;
                if job.observe(status, reason) {
                    info!("Job {} is now {:?}.", job.id(), job.status());
                }
                match job.status() {
                    JobStatus::Succeeded => {
                        debug!("Time waiting for job {} : {:?}", job.id(), start.elapsed());
                        return Ok(job);
                    }
                    JobStatus::Failed => {
                        return Err(JobError::RemoteFailure {
                            job_id: job.id().to_string(),
                            reason: job
                                .failure_reason()
                                .unwrap_or("no reason given")
                                .to_string(),
                        });
                    }
                    JobStatus::Pending | JobStatus::Running => {}
                }
            }
            Err(CheckFailure::Transient(detail)) => {
                failures += 1;
                if failures > settings.max_transient_retries && start.elapsed() < settings.max_wait {
                    error!("Giving up on job {} after {} failed status queries.", job.id(), failures);
                    return Err(JobError::Unreachable {
                        job_id: job.id().to_string(),
                        attempts: failures,
                        last_error: detail,
                    });
                }
                warn!(
                    "Status query {}/{} for job {} failed: {}",
                    failures,
                    settings.max_transient_retries,
                    job.id(),
                    detail
                );
            }
            Err(CheckFailure::Fatal(reason)) => {
                return Err(JobError::RemoteFailure {
                    job_id: job.id().to_string(),
                    reason,
                });
            }
        }

        if start.elapsed() >= settings.max_wait {
            return Err(JobError::Timeout {
                job_id: job.id().to_string(),
                waited: start.elapsed(),
                last_status: job.status(),
            });
        }
        tokio::time::sleep(settings.interval).await;
    }
}

async fn check(
    session: &Session,
    job: &Job,
    timeout: Duration,
) -> Result<(JobStatus, Option<String>), CheckFailure> {
    let response = session
        .post(CHECK_ENDPOINT)
        .timeout(timeout)
        .json(&json!({"downloadId": job.id(), "projectId": job.project_id()}))
        .send()
        .await
        .map_err(|e| CheckFailure::Transient(e.to_string()))?;

    let status = response.status();
    if status.is_server_error() {
        return Err(CheckFailure::Transient(format!("HTTP {}", status)));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(CheckFailure::Fatal(format!("HTTP {}: {}", status, body.trim())));
    }

    let checked: CheckResponse = response
        .json()
        .await
        .map_err(|e| CheckFailure::Transient(e.to_string()))?;
    debug!("Job {} reported status {:?}", job.id(), checked.status);

    Ok((
        JobStatus::from_wire(&checked.status),
        checked.reason.or(checked.message),
    ))
}

/// Streams the archive of a finished job into `output_path`.
///
/// The body is written chunk by chunk as it arrives. An existing file at
/// `output_path` is overwritten; a failed transfer may leave a truncated file,
/// reported through [DownloadError::result].
///
/// # Errors
///
/// * [DownloadError::IncompleteTransfer] if the connection drops or the body
///   is shorter than its `Content-Length`.
/// * [DownloadError::WriteError] if `output_path` cannot be created or written.
/// * [DownloadError::NoResponse] if AIR does not start answering in time.
pub async fn download(
    session: &Session,
    job: &Job,
    output_path: &Path,
    show_progress: bool,
) -> Result<DownloadResult, DownloadError> {
    if job.status() != JobStatus::Succeeded {
        return Err(DownloadError::JobNotReady {
            job_id: job.id().to_string(),
            status: job.status(),
        });
    }

    let params = json!({
        "downloadId": job.id(),
        "projectId": job.project_id(),
        "name": ARCHIVE_NAME,
    })
    .to_string();

    let start = std::time::Instant::now();

    let request = session
        .post(ARCHIVE_ENDPOINT)
        .header("Upgrade-Insecure-Requests", "1")
        .form(&[("params", params.as_str()), ("jwt", session.jwt().unwrap_or(""))])
        .send();

    // Only the wait for the headers is bounded, the archive itself may take long.
    let response = tokio::time::timeout(REQUEST_TIMEOUT, request)
        .await
        .map_err(|_| {
            error!("No answer from AIR for the archive of job {}", job.id());
            DownloadError::NoResponse {
                waited: REQUEST_TIMEOUT,
            }
        })?
        .map_err(|e| {
            error!("Error while requesting archive of job {}: {}", job.id(), e);
            DownloadError::Unreachable(e)
        })?;

    if !response.status().is_success() {
        error!("Error {} while downloading job {}", response.status(), job.id());
        return Err(DownloadError::ServerRejected {
            status: response.status().as_u16(),
        });
    }

    let expected = response.content_length();
    let path = output_path.to_path_buf();

    let mut file = File::create(output_path)
        .await
        .map_err(|source| write_error(&path, 0, source))?;

    let progress = progress_bar(expected, show_progress);
    progress.set_message(format!("Downloading job {}", job.id()));

    let mut stream = response.bytes_stream();
    let mut received = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                progress.abandon();
                let _ = file.flush().await;
                return Err(DownloadError::IncompleteTransfer {
                    path,
                    received,
                    expected,
                    detail: e.to_string(),
                });
            }
        };
        file.write_all(&chunk)
            .await
            .map_err(|source| write_error(&path, received, source))?;
        received += chunk.len() as u64;
        progress.set_position(received);
    }

    file.flush()
        .await
        .map_err(|source| write_error(&path, received, source))?;
    file.sync_all()
        .await
        .map_err(|source| write_error(&path, received, source))?;

    if let Some(expected) = expected {
        if received < expected {
            progress.abandon();
            return Err(DownloadError::IncompleteTransfer {
                path,
                received,
                expected: Some(expected),
                detail: "stream ended early".to_string(),
            });
        }
    }
    progress.finish_and_clear();

    debug!("Time to download job {} : {:?}", job.id(), start.elapsed());
    info!("Saved {} bytes to {}.", received, output_path.display());

    Ok(DownloadResult {
        output_path: path,
        byte_count: received,
        status: DownloadStatus::Complete,
    })
}

fn write_error(path: &Path, received: u64, source: std::io::Error) -> DownloadError {
    DownloadError::WriteError {
        path: path.to_path_buf(),
        received,
        source,
    }
}

fn progress_bar(expected: Option<u64>, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    match expected {
        Some(total) => {
            let bar = ProgressBar::new(total);
            if let Ok(style) = ProgressStyle::default_bar().template(
                "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            ) {
                bar.set_style(style.progress_chars("=> "));
            }
            bar
        }
        None => {
            let bar = ProgressBar::new_spinner();
            if let Ok(style) =
                ProgressStyle::default_spinner().template("{spinner} {msg} {bytes} ({bytes_per_sec})")
            {
                bar.set_style(style);
            }
            bar
        }
    }
}
