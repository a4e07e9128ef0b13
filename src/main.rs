/// CloudStack template uploader
use clap::{Args, Parser, Subcommand};
use cstu::cloudstack::{self, Client, Connector};
use cstu::docker::Docker;
use cstu::download::{self, Download, Selector};
use cstu::publish::{self, Options, Publisher};
use cstu::request::{self, Credentials, PublishRequest};
use cstu::{config, host};
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Upload VM templates to CloudStack, replacing older templates of the same name.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Runtime settings file, merged with the built-in defaults.
    #[arg(long, global = true)]
    settings: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct ApiCredentials {
    /// CloudStack API endpoint, e.g. https://cloud.example.com/client/api
    #[arg(long, env = "CLOUDSTACK_API_URL")]
    api_url: Option<String>,

    #[arg(long, env = "CLOUDSTACK_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "CLOUDSTACK_SECRET_KEY", hide_env_values = true)]
    api_secret: Option<String>,
}

impl From<ApiCredentials> for Credentials {
    fn from(c: ApiCredentials) -> Self {
        Credentials {
            api_url: c.api_url,
            api_key: c.api_key,
            api_secret: c.api_secret,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upload a template to every configured zone.
    Upload {
        /// Template configuration file.
        #[arg(long, default_value = "template.yml")]
        config_file: String,

        /// Remove the image from the web root once it has been published.
        #[arg(long)]
        cleanup: bool,

        /// Serve the image from a web server already running on this host instead of a container.
        #[arg(long)]
        system_service: bool,

        /// Use hostIP from the configuration file instead of the detected outbound address.
        #[arg(long)]
        no_detect_host: bool,

        /// Zone to publish to when the configuration file lists no environments. Repeatable.
        #[arg(long = "zone")]
        zones: Vec<String>,

        #[command(flatten)]
        credentials: ApiCredentials,
    },
    /// Write a blank template configuration file.
    Init {
        #[arg(long, default_value = "template.yml")]
        output: String,
    },
    /// Download an extractable template and write a configuration file for it.
    Dl {
        /// Template name.
        #[arg(long, required_unless_present = "template_id", conflicts_with = "template_id")]
        template: Option<String>,

        #[arg(long)]
        template_id: Option<String>,

        #[arg(long)]
        zone_id: String,

        /// Directory to write the image and template.yml to.
        #[arg(long, default_value = ".")]
        output_dir: String,

        #[command(flatten)]
        credentials: ApiCredentials,
    },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("settings: {0}")]
    Settings(#[from] config::Error),

    #[error("template configuration: {0}")]
    TemplateConfig(#[from] request::FileError),

    #[error("publish: {0}")]
    Publish(#[from] publish::Error),

    #[error("download: {0}")]
    Download(#[from] download::Error),

    #[error("cloudstack: {0}")]
    CloudStack(#[from] cloudstack::Error),

    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("missing {0}, pass it as a flag or set it in the environment")]
    MissingCredential(&'static str),

    #[error("either --template or --template-id is required")]
    MissingTemplate,
}

/// Read settings from disk and merge them with the
/// `default.toml` [built-in settings](../default.toml).
///
/// Without `--settings`, a `cstu.toml` in the working directory is used if present.
fn read_config(args: &Cli) -> Result<config::Settings, Error> {
    const DEFAULT_CONFIG_FILE: &str = "cstu.toml";

    let config_file = match &args.settings {
        None => {
            if std::fs::metadata(DEFAULT_CONFIG_FILE)
                .map(|metadata| metadata.is_file())
                .unwrap_or(false)
            {
                Some(DEFAULT_CONFIG_FILE.to_string())
            } else {
                None
            }
        }
        Some(c) => Some(c.clone()),
    };

    Ok(if let Some(config_file) = config_file {
        config::Settings::default_with_user_config_file(&config_file)?
    } else {
        config::Settings::default()
    })
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(_) => std::process::exit(0),
        Err(err) => {
            error!("fatal: {}", err);
            std::process::exit(1)
        }
    }
}

async fn run() -> Result<(), Error> {
    let args = Cli::parse();

    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let settings = read_config(&args)?;

    match args.command {
        Commands::Upload {
            config_file,
            cleanup,
            system_service,
            no_detect_host,
            zones,
            credentials,
        } => {
            let mut request = PublishRequest::parse_file(&config_file)?;
            request.apply_credentials(&credentials.into(), &zones);
            info!("Publishing template {} from {config_file}", request.name);

            let options = Options {
                cleanup,
                system_service,
                detect_host: !no_detect_host,
            };
            let sidecar = Arc::new(Docker::new(&settings.sidecar)?);
            let publisher = Arc::new(Publisher::new(request, settings, options, Arc::new(Connector), sidecar));

            let report = publisher.run_until_interrupted(interrupt()).await?;
            report.ensure_success()?;
            Ok(())
        }
        Commands::Init { output } => {
            PublishRequest::default().write_file(&output)?;
            info!("Wrote blank template configuration to {output}");
            Ok(())
        }
        Commands::Dl {
            template,
            template_id,
            zone_id,
            output_dir,
            credentials,
        } => {
            let selector = match (template, template_id) {
                (_, Some(id)) => Selector::Id(id),
                (Some(name), None) => Selector::Name(name),
                (None, None) => return Err(Error::MissingTemplate),
            };
            let api_url = credentials.api_url.ok_or(Error::MissingCredential("api url"))?;
            let api_key = credentials.api_key.ok_or(Error::MissingCredential("api key"))?;
            let api_secret = credentials.api_secret.ok_or(Error::MissingCredential("api secret"))?;
            let control_plane = Client::new(&api_url, &api_key, &api_secret)?;

            let download = Download {
                control_plane: &control_plane,
                job: settings.job,
                output_dir: Path::new(&output_dir),
            };
            let downloaded = download.run(&selector, &zone_id, &host::resolve("")).await?;
            info!(
                "Template saved to {}, configuration written to {}",
                downloaded.image.display(),
                downloaded.config.display()
            );
            Ok(())
        }
    }
}

/// Resolves on SIGINT or SIGTERM. If signals cannot be watched, never resolves.
async fn interrupt() {
    match publish::interrupted().await {
        Ok(signal) => warn!("Received {signal}, rolling back"),
        Err(err) => {
            error!("cannot listen for signals: {err}");
            std::future::pending::<()>().await
        }
    }
}
