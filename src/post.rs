use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::{
    auth::{Session, REQUEST_TIMEOUT},
    error::RequestError,
    structs::{string_or_number, ExportRequest, Job, Profile, SeriesFilter},
};

const SEARCH_ENDPOINT: &str = "secure/search/query-data-source";
const SERIES_ENDPOINT: &str = "secure/search/series";
const START_ENDPOINT: &str = "secure/search/download/start";
const PROFILES_ENDPOINT: &str = "secure/anonymization/list-profiles";

/// Name AIR gives the archive it assembles.
pub(crate) const ARCHIVE_NAME: &str = "Download.zip";

#[derive(Deserialize, Debug)]
struct SearchResponse {
    #[serde(default)]
    exams: Vec<Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest<'a> {
    decompress: bool,
    name: &'a str,
    profile: i64,
    project_id: &'a str,
    series: &'a [Value],
    study: &'a Value,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    #[serde(default, deserialize_with = "optional_id")]
    download_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

fn optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Id(#[serde(deserialize_with = "string_or_number")] String);

    Ok(Option::<Id>::deserialize(deserializer)?.map(|Id(id)| id))
}

/// Submits the export of one study and returns the freshly created job.
///
/// The study is looked up by accession number, its series are listed and
/// optionally narrowed with the request's inclusion filter, then AIR is asked
/// to build an anonymized archive of what is left.
///
/// # Errors
///
/// * [RequestError::InvalidAccession] if AIR finds no such study.
/// * [RequestError::InvalidProject] / [RequestError::InvalidProfile] if AIR
///   refuses the project or anonymization profile.
/// * [RequestError::ServerError] on any 5xx response.
pub async fn submit(session: &Session, request: &ExportRequest) -> Result<Job, RequestError> {
    let start = std::time::Instant::now();

    let exam = find_exam(session, request).await?;
    let series = list_series(session, request, &exam).await?;
    let series = select_series(series, request.series_inclusion())?;

    let response = post_json(
        session,
        START_ENDPOINT,
        &StartRequest {
            decompress: false,
            name: ARCHIVE_NAME,
            profile: request.anonymization_profile(),
            project_id: request.project_id(),
            series: &series,
            study: &exam,
        },
    )
    .await?;

    let status = response.status();
    let body = response.text().await.map_err(RequestError::Unreachable)?;
    let started: StartResponse = serde_json::from_str(&body).unwrap_or_default();

    match started.download_id {
        Some(id) if status.is_success() => {
            debug!("Time to submit export : {:?}", start.elapsed());
            info!(
                "Export of accession {} submitted as job {} ({} series).",
                request.accession(),
                id,
                series.len()
            );
            Ok(Job::new(id, request.project_id()))
        }
        _ => {
            let reason = started
                .reason
                .unwrap_or_else(|| format!("HTTP {}: {}", status, body.trim()));
            error!("AIR refused export of {}: {}", request.accession(), reason);
            Err(classify_refusal(session, request, reason).await)
        }
    }
}

/// Lists the anonymization profiles the user can apply.
pub async fn list_profiles(session: &Session) -> Result<Vec<Profile>, RequestError> {
    let response = post_json(
        session,
        PROFILES_ENDPOINT,
        &json!({
            "includeGlobal": true,
            "includeCustom": true,
            "includeDefault": false,
            "includeInactiveCustom": false,
            "includeInactiveGlobal": false,
            "includeInactiveShared": false,
            "includeShared": true,
        }),
    )
    .await?;
    let response = reject_client_error(response, PROFILES_ENDPOINT).await?;
    response
        .json()
        .await
        .map_err(|e| unexpected(PROFILES_ENDPOINT, e))
}

async fn find_exam(session: &Session, request: &ExportRequest) -> Result<Value, RequestError> {
    let response = post_json(
        session,
        SEARCH_ENDPOINT,
        &json!({
            "name": "",
            "mrn": "",
            "accNum": request.accession(),
            "dateRange": {"start": "", "end": "", "label": ""},
            "modality": "",
            "sourceId": 1,
        }),
    )
    .await?;

    if is_inaccessible(response.status()) {
        return Err(invalid_accession(request));
    }
    let response = reject_client_error(response, SEARCH_ENDPOINT).await?;
    let search: SearchResponse = response
        .json()
        .await
        .map_err(|e| unexpected(SEARCH_ENDPOINT, e))?;

    pick_exam(search.exams, request.accession()).ok_or_else(|| invalid_accession(request))
}

/// One accession normally maps to one exam. When AIR returns several, the one
/// carrying the exact accession number wins, otherwise the first.
fn pick_exam(mut exams: Vec<Value>, accession: &str) -> Option<Value> {
    if exams.len() > 1 {
        warn!(
            "Found {} exams for accession {}, exporting only one.",
            exams.len(),
            accession
        );
    }
    let position = exams
        .iter()
        .position(|exam| exam["accessionNumber"].as_str() == Some(accession))
        .unwrap_or(0);
    if exams.is_empty() {
        None
    } else {
        Some(exams.swap_remove(position))
    }
}

async fn list_series(
    session: &Session,
    request: &ExportRequest,
    exam: &Value,
) -> Result<Vec<Value>, RequestError> {
    let response = post_json(session, SERIES_ENDPOINT, exam).await?;
    if is_inaccessible(response.status()) {
        return Err(invalid_accession(request));
    }
    let response = reject_client_error(response, SERIES_ENDPOINT).await?;
    response
        .json()
        .await
        .map_err(|e| unexpected(SERIES_ENDPOINT, e))
}

fn series_description(series: &Value) -> Option<&str> {
    series["description"].as_str()
}

fn select_series(
    series: Vec<Value>,
    filter: Option<&SeriesFilter>,
) -> Result<Vec<Value>, RequestError> {
    let filter = match filter {
        Some(filter) => filter,
        None => return Ok(series),
    };

    let original: Vec<&str> = series.iter().filter_map(series_description).collect();
    info!("Original series (n={}): {:?}", original.len(), original);

    let selected: Vec<Value> = series
        .into_iter()
        .filter(|s| series_description(s).map_or(false, |d| filter.matches(d)))
        .collect();

    let kept: Vec<&str> = selected.iter().filter_map(series_description).collect();
    info!("Series after filtering (n={}): {:?}", kept.len(), kept);

    if selected.is_empty() {
        return Err(RequestError::NoMatchingSeries {
            patterns: filter.patterns().to_vec(),
        });
    }
    Ok(selected)
}

async fn classify_refusal(
    session: &Session,
    request: &ExportRequest,
    reason: String,
) -> RequestError {
    let lowered = reason.to_lowercase();
    if lowered.contains("project") {
        RequestError::InvalidProject {
            project: request.project_id().to_string(),
            available: session.projects().to_vec(),
        }
    } else if lowered.contains("profile") {
        let available = match list_profiles(session).await {
            Ok(profiles) => profiles,
            Err(e) => {
                warn!("Could not list anonymization profiles: {}", e);
                Vec::new()
            }
        };
        RequestError::InvalidProfile {
            profile: request.anonymization_profile(),
            available,
        }
    } else {
        RequestError::Rejected(reason)
    }
}

async fn post_json<T: Serialize + ?Sized>(
    session: &Session,
    endpoint: &'static str,
    body: &T,
) -> Result<Response, RequestError> {
    let response = session
        .post(endpoint)
        .timeout(REQUEST_TIMEOUT)
        .json(body)
        .send()
        .await
        .map_err(|e| {
            error!("Error while calling {}: {}", endpoint, e);
            RequestError::Unreachable(e)
        })?;

    let status = response.status();
    if status.is_server_error() {
        error!("Error {} from {}", status, endpoint);
        return Err(RequestError::ServerError {
            endpoint,
            status: status.as_u16(),
        });
    }
    Ok(response)
}

async fn reject_client_error(
    response: Response,
    endpoint: &'static str,
) -> Result<Response, RequestError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RequestError::Rejected(format!(
        "HTTP {} from {}: {}",
        status,
        endpoint,
        body.trim()
    )))
}

/// AIR hides studies outside the user's projects behind 403 or 404.
fn is_inaccessible(status: StatusCode) -> bool {
    matches!(status, StatusCode::NOT_FOUND | StatusCode::FORBIDDEN)
}

fn invalid_accession(request: &ExportRequest) -> RequestError {
    RequestError::InvalidAccession {
        accession: request.accession().to_string(),
        project: request.project_id().to_string(),
    }
}

fn unexpected(endpoint: &'static str, e: reqwest::Error) -> RequestError {
    RequestError::UnexpectedResponse {
        endpoint,
        detail: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::mock_session;
    use crate::structs::{JobStatus, DEFAULT_PROFILE};
    use httpmock::prelude::*;

    fn exam() -> Value {
        json!({"accessionNumber": "E123", "studyInstanceUid": "1.2.3", "mrn": "42"})
    }

    fn series() -> Value {
        json!([
            {"description": "AX T1 SPGR", "seriesUid": "1"},
            {"description": "SAG FLAIR", "seriesUid": "2"},
            {"description": "DWI", "seriesUid": "3"},
            {"description": null, "seriesUid": "4"}
        ])
    }

    async fn mock_search(server: &MockServer) {
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/secure/search/query-data-source")
                    .header("authorization", "Bearer jwt-1")
                    .json_body_includes(r#"{"accNum": "E123", "sourceId": 1}"#);
                then.status(200).json_body(json!({"exams": [exam()]}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/secure/search/series")
                    .json_body(exam());
                then.status(200).json_body(series());
            })
            .await;
    }

    #[tokio::test]
    async fn submit_sends_only_matching_series() {
        let server = MockServer::start_async().await;
        let session = mock_session(&server).await;
        mock_search(&server).await;
        let start = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/secure/search/download/start")
                    .json_body(json!({
                        "decompress": false,
                        "name": "Download.zip",
                        "profile": 12,
                        "projectId": "3",
                        "series": [
                            {"description": "AX T1 SPGR", "seriesUid": "1"},
                            {"description": "SAG FLAIR", "seriesUid": "2"}
                        ],
                        "study": exam(),
                    }));
                then.status(200).json_body(json!({"downloadId": "job-42"}));
            })
            .await;

        let filter: SeriesFilter = "t1,flair".parse().unwrap();
        let request = ExportRequest::new("E123", "3", 12, Some(filter)).unwrap();
        let job = submit(&session, &request).await.unwrap();

        start.assert_async().await;
        assert_eq!(job.id(), "job-42");
        assert_eq!(job.status(), JobStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_accession() {
        let server = MockServer::start_async().await;
        let session = mock_session(&server).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/secure/search/query-data-source");
                then.status(200).json_body(json!({"exams": []}));
            })
            .await;

        let request = ExportRequest::new("NOPE", "3", DEFAULT_PROFILE, None).unwrap();
        let err = submit(&session, &request).await.unwrap_err();
        assert!(matches!(err, RequestError::InvalidAccession { accession, .. } if accession == "NOPE"));
    }

    #[tokio::test]
    async fn hidden_study_is_invalid_accession() {
        for status in [403, 404] {
            let server = MockServer::start_async().await;
            let session = mock_session(&server).await;
            server
                .mock_async(move |when, then| {
                    when.method(POST).path("/api/secure/search/query-data-source");
                    then.status(status).body("Not allowed");
                })
                .await;

            let request = ExportRequest::new("E123", "3", DEFAULT_PROFILE, None).unwrap();
            let err = submit(&session, &request).await.unwrap_err();
            assert!(
                matches!(err, RequestError::InvalidAccession { ref accession, .. } if accession == "E123"),
                "HTTP {} gave {:?}",
                status,
                err
            );
        }
    }

    #[tokio::test]
    async fn series_of_hidden_study_is_invalid_accession() {
        let server = MockServer::start_async().await;
        let session = mock_session(&server).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/secure/search/query-data-source");
                then.status(200).json_body(json!({"exams": [exam()]}));
            })
            .await;
        let start = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/secure/search/download/start");
                then.status(200).json_body(json!({"downloadId": "job-42"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/secure/search/series");
                then.status(403);
            })
            .await;

        let request = ExportRequest::new("E123", "3", DEFAULT_PROFILE, None).unwrap();
        let err = submit(&session, &request).await.unwrap_err();
        assert!(matches!(err, RequestError::InvalidAccession { .. }));
        assert_eq!(start.hits_async().await, 0);
    }

    #[test]
    fn null_download_id_keeps_reason() {
        let started: StartResponse =
            serde_json::from_str(r#"{"downloadId": null, "reason": "Invalid anonymization profile"}"#)
                .unwrap();
        assert_eq!(started.download_id, None);
        assert_eq!(started.reason.as_deref(), Some("Invalid anonymization profile"));

        let started: StartResponse = serde_json::from_str(r#"{"downloadId": 42}"#).unwrap();
        assert_eq!(started.download_id.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn server_error_during_search() {
        let server = MockServer::start_async().await;
        let session = mock_session(&server).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/secure/search/query-data-source");
                then.status(503);
            })
            .await;

        let request = ExportRequest::new("E123", "3", DEFAULT_PROFILE, None).unwrap();
        let err = submit(&session, &request).await.unwrap_err();
        assert!(matches!(err, RequestError::ServerError { status: 503, .. }));
    }

    #[tokio::test]
    async fn filter_matching_nothing_is_refused_before_start() {
        let server = MockServer::start_async().await;
        let session = mock_session(&server).await;
        mock_search(&server).await;
        let start = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/secure/search/download/start");
                then.status(200).json_body(json!({"downloadId": "never"}));
            })
            .await;

        let filter: SeriesFilter = "bravo".parse().unwrap();
        let request = ExportRequest::new("E123", "3", DEFAULT_PROFILE, Some(filter)).unwrap();
        let err = submit(&session, &request).await.unwrap_err();

        assert!(matches!(err, RequestError::NoMatchingSeries { .. }));
        assert_eq!(start.hits_async().await, 0);
    }

    #[tokio::test]
    async fn invalid_project_lists_session_projects() {
        let server = MockServer::start_async().await;
        let session = mock_session(&server).await;
        mock_search(&server).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/secure/search/download/start");
                then.status(200)
                    .json_body(json!({"reason": "User is not a member of project 99"}));
            })
            .await;

        let request = ExportRequest::new("E123", "99", DEFAULT_PROFILE, None).unwrap();
        match submit(&session, &request).await.unwrap_err() {
            RequestError::InvalidProject { project, available } => {
                assert_eq!(project, "99");
                assert_eq!(available.len(), 1);
                assert_eq!(available[0].name, "Research");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalid_profile_lists_profiles() {
        let server = MockServer::start_async().await;
        let session = mock_session(&server).await;
        mock_search(&server).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/secure/search/download/start");
                then.status(400)
                    .json_body(json!({"reason": "Invalid anonymization profile"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/secure/anonymization/list-profiles")
                    .json_body_includes(r#"{"includeGlobal": true}"#);
                then.status(200).json_body(json!([
                    {"id": 12, "name": "Research", "description": "Strip PHI", "extra": 1}
                ]));
            })
            .await;

        let request = ExportRequest::new("E123", "3", 99, None).unwrap();
        match submit(&session, &request).await.unwrap_err() {
            RequestError::InvalidProfile { profile, available } => {
                assert_eq!(profile, 99);
                assert_eq!(available[0].id, "12");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn pick_exam_prefers_exact_accession() {
        let exams = vec![
            json!({"accessionNumber": "E1230"}),
            json!({"accessionNumber": "E123"}),
        ];
        let exam = pick_exam(exams, "E123").unwrap();
        assert_eq!(exam["accessionNumber"], "E123");
        assert!(pick_exam(Vec::new(), "E123").is_none());
    }

    #[test]
    fn no_filter_keeps_every_series() {
        let all: Vec<Value> = serde_json::from_value(series()).unwrap();
        let kept = select_series(all.clone(), None).unwrap();
        assert_eq!(kept, all);
    }
}
