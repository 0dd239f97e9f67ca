use std::{env, path::PathBuf, process, time::Duration};

use air_download::{
    AirError, ConfigError, CredentialSource, ExportRequest, PollSettings, RunConfig, SeriesFilter,
    DEFAULT_PROFILE, DEFAULT_PROJECT,
};
use clap::{Parser, ValueEnum};
use tracing::error;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// URL for the AIR API, e.g. https://air.<domain>.edu/api/
    url: String,
    /// Accession number to download
    #[clap(value_name = "ACCESSION")]
    accession: Option<String>,
    /// Login credentials file. If absent, AIR_USERNAME and AIR_PASSWORD are read from the environment
    #[clap(short = 'c', long = "cred_path", alias = "cred-path")]
    cred_path: Option<PathBuf>,
    /// Anonymization profile (-pf also accepted)
    #[clap(short = 'p', long, default_value_t = DEFAULT_PROFILE, allow_negative_numbers = true)]
    profile: i64,
    /// Project ID (-pj also accepted)
    #[clap(long, default_value = DEFAULT_PROJECT)]
    project: String,
    /// Output .zip file or directory, "<Accession>" is replaced by the accession number [default: ./<ACCESSION>.zip]
    #[clap(short = 'o', long)]
    output: Option<PathBuf>,
    /// Comma-separated series inclusion patterns (case insensitive, 'or' logic), e.g. 't1,spgr,bravo,mpr'
    #[clap(short = 's', long = "series_inclusion", alias = "series-inclusion")]
    series_inclusion: Option<SeriesFilter>,
    /// List available project IDs (-lpj also accepted)
    #[clap(long)]
    list_projects: bool,
    /// List available anonymization profiles (-lpf also accepted)
    #[clap(long)]
    list_profiles: bool,
    /// Seconds between two job status queries
    #[clap(long, default_value_t = 2.0)]
    poll_interval: f64,
    /// Seconds to wait for the export job before giving up
    #[clap(long, default_value_t = 3600)]
    timeout: u64,
    /// Failed job status queries tolerated in a row
    #[clap(long, default_value_t = 5)]
    poll_retries: u32,
    /// Do not draw a progress bar while downloading
    #[clap(long)]
    no_progress: bool,
    /// Set the log level
    #[arg(value_enum)]
    #[clap(short = 'L', long, default_value = "info")]
    log_level: LogLevel,
    /// Display timestamps with log messages
    #[clap(short = 'T', long)]
    timestamp: bool,
}

#[derive(Copy, Clone, ValueEnum, Debug)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Quiet,
}

#[tokio::main]
pub async fn main() {
    let args = Args::parse_from(expand_legacy_flags(env::args()));

    tracing_subscriber_handler(&args);

    let credentials = match &args.cred_path {
        Some(path) => CredentialSource::File(path.clone()),
        None => CredentialSource::Environment,
    };

    if args.list_projects || args.list_profiles {
        process::exit(list(&args, &credentials).await);
    }

    let config = match config_from_args(args, credentials) {
        Ok(config) => config,
        Err(e) => {
            let e = AirError::from(e);
            error!("Error: {}", e);
            process::exit(e.exit_code());
        }
    };

    process::exit(air_download::run(&config).await);
}

/// Rewrites the multi-letter short flags of earlier releases (-pf, -pj, -lpj, -lpf), which clap cannot express.
fn expand_legacy_flags<I: IntoIterator<Item = String>>(args: I) -> Vec<String> {
    args.into_iter()
        .map(|arg| match arg.as_str() {
            "-pf" => "--profile".to_string(),
            "-pj" => "--project".to_string(),
            "-lpj" => "--list-projects".to_string(),
            "-lpf" => "--list-profiles".to_string(),
            _ => arg,
        })
        .collect()
}

fn config_from_args(args: Args, credentials: CredentialSource) -> Result<RunConfig, ConfigError> {
    let accession = args.accession.ok_or_else(|| {
        ConfigError::InvalidArguments(
            "an ACCESSION is required unless listing projects or profiles".to_string(),
        )
    })?;

    let interval = Duration::try_from_secs_f64(args.poll_interval).map_err(|e| {
        ConfigError::InvalidArguments(format!(
            "invalid poll interval {}: {}",
            args.poll_interval, e
        ))
    })?;

    Ok(RunConfig {
        url: args.url,
        credentials,
        request: ExportRequest::new(accession, args.project, args.profile, args.series_inclusion)?,
        output: args.output,
        poll: PollSettings {
            interval,
            max_wait: Duration::from_secs(args.timeout),
            max_transient_retries: args.poll_retries,
        },
        show_progress: !args.no_progress,
    })
}

async fn list(args: &Args, credentials: &CredentialSource) -> i32 {
    if args.list_projects {
        match air_download::list_projects(&args.url, credentials).await {
            Ok(projects) => {
                println!("Available projects:");
                for project in projects {
                    println!("{}", project);
                }
            }
            Err(e) => {
                error!("Error while listing projects: {}", e);
                return e.exit_code();
            }
        }
    }
    if args.list_projects && args.list_profiles {
        println!();
    }
    if args.list_profiles {
        match air_download::list_available_profiles(&args.url, credentials).await {
            Ok(profiles) => {
                println!("Available anonymization profiles:");
                for profile in profiles {
                    println!("{}", profile);
                }
            }
            Err(e) => {
                error!("Error while listing profiles: {}", e);
                return e.exit_code();
            }
        }
    }
    0
}

fn tracing_subscriber_handler(args: &Args) {
    let env_filter = match args.log_level {
        LogLevel::Debug => "air_download=debug",
        LogLevel::Info => "air_download=info",
        LogLevel::Warn => "air_download=warn",
        LogLevel::Error => "air_download=error",
        LogLevel::Quiet => "air_download=off",
    };

    // "if" because the subscriber doesn't yield the same type with or without time wich prevents
    // using a match statement.
    if args.timestamp {
        let sub = tracing_subscriber::fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(sub)
            .expect("Error while setting subscriber for tracing.");
    } else {
        let sub = tracing_subscriber::fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .without_time()
            .finish();
        tracing::subscriber::set_global_default(sub)
            .expect("Error while setting subscriber for tracing.");
    };
}
