use std::{
    env, fs,
    path::{Path, PathBuf},
};

use reqwest::Url;
use tracing::{debug, warn};

use crate::{
    error::ConfigError,
    structs::{CredentialSource, Credentials},
};

pub const USERNAME_KEY: &str = "AIR_USERNAME";
pub const PASSWORD_KEY: &str = "AIR_PASSWORD";

const ACCESSION_PLACEHOLDER: &str = "<Accession>";

/// Reads the credential pair once from the configured source.
pub fn load_credentials(source: &CredentialSource) -> Result<Credentials, ConfigError> {
    match source {
        CredentialSource::File(path) => credentials_from_file(path),
        CredentialSource::Environment => {
            credentials_from_lookup("environment", |key| env::var(key).ok())
        }
    }
}

fn credentials_from_file(path: &Path) -> Result<Credentials, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::MissingCredentials(format!(
            "credential file {} does not exist",
            path.display()
        )));
    }
    warn_if_exposed(path);

    let entries = dotenvy::from_path_iter(path).map_err(|source| ConfigError::CredentialsFile {
        path: path.to_path_buf(),
        source,
    })?;

    let mut username = None;
    let mut password = None;
    for entry in entries {
        let (key, value) = entry.map_err(|source| ConfigError::CredentialsFile {
            path: path.to_path_buf(),
            source,
        })?;
        match key.as_str() {
            USERNAME_KEY => username = Some(value),
            PASSWORD_KEY => password = Some(value),
            _ => debug!("Ignoring key {} in {}", key, path.display()),
        }
    }

    credential_pair(&path.display().to_string(), username, password)
}

pub(crate) fn credentials_from_lookup<F>(origin: &str, lookup: F) -> Result<Credentials, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    credential_pair(origin, lookup(USERNAME_KEY), lookup(PASSWORD_KEY))
}

fn credential_pair(
    origin: &str,
    username: Option<String>,
    password: Option<String>,
) -> Result<Credentials, ConfigError> {
    let username = username.filter(|value| !value.is_empty());
    let password = password.filter(|value| !value.is_empty());
    match (username, password) {
        (Some(username), Some(password)) => Ok(Credentials::new(username, password)),
        (username, password) => {
            let missing: Vec<&str> = [
                username.is_none().then_some(USERNAME_KEY),
                password.is_none().then_some(PASSWORD_KEY),
            ]
            .into_iter()
            .flatten()
            .collect();
            Err(ConfigError::MissingCredentials(format!(
                "{} does not define {}",
                origin,
                missing.join(" and ")
            )))
        }
    }
}

#[cfg(unix)]
fn warn_if_exposed(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = fs::metadata(path) {
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!(
                "Credential file {} has permissions {:o}, consider restricting it to 600.",
                path.display(),
                mode
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_if_exposed(_path: &Path) {}

/// Parses the AIR base URL. Endpoints are resolved relative to it, so a
/// trailing slash is added when missing.
pub fn api_base(url: &str) -> Result<Url, ConfigError> {
    let mut normalized = url.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    let base = Url::parse(&normalized)
        .map_err(|e| ConfigError::InvalidArguments(format!("invalid AIR URL {}: {}", url, e)))?;
    match base.scheme() {
        "http" | "https" => Ok(base),
        scheme => Err(ConfigError::InvalidArguments(format!(
            "unsupported scheme {} in AIR URL {}",
            scheme, url
        ))),
    }
}

/// Works out where the archive goes.
///
/// * nothing given: `./<ACCESSION>.zip`
/// * a path ending in `.zip`: that file, parents created as needed
/// * anything else: a directory, created as needed, receiving `<ACCESSION>.zip`
///
/// The `<Accession>` token anywhere in the path is replaced by the accession.
pub fn resolve_output_path(output: Option<&Path>, accession: &str) -> Result<PathBuf, ConfigError> {
    let file_name = format!("{}.zip", accession);
    let output = match output {
        Some(output) => PathBuf::from(
            output
                .to_string_lossy()
                .replace(ACCESSION_PLACEHOLDER, accession),
        ),
        None => return Ok(PathBuf::from(".").join(file_name)),
    };

    let is_zip = output
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false);

    if is_zip {
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir(parent)?;
        }
        Ok(output)
    } else {
        create_dir(&output)?;
        Ok(output.join(file_name))
    }
}

fn create_dir(path: &Path) -> Result<(), ConfigError> {
    fs::create_dir_all(path).map_err(|source| ConfigError::OutputPath {
        path: path.to_path_buf(),
        source,
    })
}
