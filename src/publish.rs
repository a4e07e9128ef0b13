//! The publish run: stage the image, replace the template in every target, and
//! roll back if the process is interrupted.
use log::{error, info, warn};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::cloudstack::Connect;
use crate::config::Settings;
use crate::host;
use crate::replace::{Replace, Replaced, Serving};
use crate::request::{self, Environment, PublishRequest, PublishTarget};
use crate::sidecar::{Sidecar, SidecarSlot};

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid template configuration: {0}")]
    Validation(#[from] request::Error),

    #[error("cannot find {path}: {err}")]
    TemplateFileNotFound { path: String, err: std::io::Error },

    #[error("move {from} to {to}: {err}")]
    Stage {
        from: String,
        to: String,
        err: std::io::Error,
    },

    #[error("checksum of {path}: {err}")]
    Checksum { path: String, err: std::io::Error },

    #[error("{failed} of {total} targets failed")]
    TargetsFailed { failed: usize, total: usize },

    #[error("interrupted, template upload rolled back")]
    Interrupted,

    #[error("publish task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeStatus {
    Succeeded,
    Failed(String),
}

/// Result of publishing to one target.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOutcome {
    pub target: PublishTarget,
    pub new_id: Option<String>,
    pub previous_id: Option<String>,
    pub replaced_existing: bool,
    pub warnings: Vec<String>,
    pub status: OutcomeStatus,
}

impl PublishOutcome {
    fn succeeded(target: PublishTarget, replaced: Replaced) -> Self {
        Self {
            target,
            replaced_existing: replaced.previous_id.is_some(),
            new_id: Some(replaced.new_id),
            previous_id: replaced.previous_id,
            warnings: replaced.warnings,
            status: OutcomeStatus::Succeeded,
        }
    }

    fn failed(target: PublishTarget, reason: String) -> Self {
        Self {
            target,
            new_id: None,
            previous_id: None,
            replaced_existing: false,
            warnings: vec![],
            status: OutcomeStatus::Failed(reason),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    pub outcomes: Vec<PublishOutcome>,
}

impl Report {
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, OutcomeStatus::Failed(_)))
            .count()
    }

    /// Log one line per target and fail if any target failed.
    pub fn ensure_success(&self) -> Result<(), Error> {
        for outcome in &self.outcomes {
            match &outcome.status {
                OutcomeStatus::Succeeded => info!(
                    "{}: template {} ready{}{}",
                    outcome.target,
                    outcome.new_id.as_deref().unwrap_or_default(),
                    outcome
                        .previous_id
                        .as_ref()
                        .map(|id| format!(", replaced {id}"))
                        .unwrap_or_default(),
                    if outcome.warnings.is_empty() {
                        String::new()
                    } else {
                        format!(" with {} warning(s)", outcome.warnings.len())
                    }
                ),
                OutcomeStatus::Failed(reason) => error!("{}: {reason}", outcome.target),
            }
        }
        match self.failed() {
            0 => Ok(()),
            failed => Err(Error::TargetsFailed {
                failed,
                total: self.outcomes.len(),
            }),
        }
    }
}

/// The image moved into the web root, and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Staging {
    pub original: PathBuf,
    pub staged: PathBuf,
}

impl Staging {
    fn new(original: &Path, web_root: &Path, file_name: &str) -> Self {
        Self {
            original: original.to_path_buf(),
            staged: web_root.join(file_name),
        }
    }

    async fn stage(&self) -> Result<(), Error> {
        if self.original == self.staged {
            return Ok(());
        }
        info!("Moving {} to {}", self.original.display(), self.staged.display());
        move_file(&self.original, &self.staged)
            .await
            .map_err(|err| Error::Stage {
                from: self.original.display().to_string(),
                to: self.staged.display().to_string(),
                err,
            })
    }

    /// Undo [`Staging::stage`], including one that was cut short.
    ///
    /// While the original still exists the move never completed, so whatever sits
    /// at the staged path is a partial copy and is removed instead.
    async fn restore(&self) -> std::io::Result<()> {
        if self.original == self.staged || !exists(&self.staged).await {
            return Ok(());
        }
        if exists(&self.original).await {
            return tokio::fs::remove_file(&self.staged).await;
        }
        move_file(&self.staged, &self.original).await
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Rename, falling back to copy and remove when the paths are on different filesystems.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

async fn checksum(path: &Path) -> Result<String, Error> {
    let owned = path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || sha256::try_digest(owned.as_path())).await?;
    digest
        .map(|hex| format!("{{SHA-256}}{hex}"))
        .map_err(|err| Error::Checksum {
            path: path.display().to_string(),
            err,
        })
}

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Remove the staged image from the web root when done.
    pub cleanup: bool,
    /// Serve from an already running system web server when it answers.
    pub system_service: bool,
    /// Prefer the detected outbound address over the configured host ip.
    pub detect_host: bool,
}

pub struct Publisher {
    request: PublishRequest,
    settings: Settings,
    options: Options,
    connector: Arc<dyn Connect>,
    sidecar: Arc<dyn Sidecar>,
    slot: SidecarSlot,
    staging: Mutex<Option<Staging>>,
}

impl Publisher {
    pub fn new(
        request: PublishRequest,
        settings: Settings,
        options: Options,
        connector: Arc<dyn Connect>,
        sidecar: Arc<dyn Sidecar>,
    ) -> Self {
        Self {
            request,
            settings,
            options,
            connector,
            sidecar,
            slot: SidecarSlot::new(),
            staging: Mutex::new(None),
        }
    }

    /// Race the publish run against `interrupt`.
    ///
    /// If `interrupt` finishes first the run is aborted, any sidecar it started is
    /// removed and the image is moved back to where it came from.
    pub async fn run_until_interrupted<F>(self: Arc<Self>, interrupt: F) -> Result<Report, Error>
    where
        F: Future<Output = ()>,
    {
        let publisher = self.clone();
        let mut worker = tokio::spawn(async move { publisher.publish().await });
        tokio::pin!(interrupt);

        tokio::select! {
            joined = &mut worker => joined?,
            _ = &mut interrupt => {
                worker.abort();
                // Wait until the aborted run has stopped touching the slot and staging.
                let _ = (&mut worker).await;

                let publisher = self.clone();
                tokio::spawn(async move { publisher.rollback().await }).await?;
                Err(Error::Interrupted)
            }
        }
    }

    pub async fn publish(&self) -> Result<Report, Error> {
        self.request.required_fields_passed()?;
        let file_name = self.request.staged_file_name()?;

        let source = PathBuf::from(&self.request.template_file);
        tokio::fs::metadata(&source)
            .await
            .map_err(|err| Error::TemplateFileNotFound {
                path: self.request.template_file.clone(),
                err,
            })?;

        // Recorded before the move so an interrupted move is still rolled back.
        let staging = Staging::new(&source, &self.settings.server.web_root, &file_name);
        self.set_staging(Some(staging.clone()));
        if let Err(err) = staging.stage().await {
            self.set_staging(None);
            return Err(err);
        }

        let checksum = if self.settings.registration.checksum {
            Some(checksum(&staging.staged).await?)
        } else {
            None
        };

        let host = if self.options.detect_host {
            host::resolve(&self.request.host_ip)
        } else {
            self.request.host_ip.clone()
        };
        if host != self.request.host_ip {
            info!("Using detected outbound address {host} instead of {}", self.request.host_ip);
        }

        if self.request.environments.is_empty() {
            warn!("No environments configured, nothing to publish");
        }

        let mut report = Report::default();
        for environment in &self.request.environments {
            let outcomes = self
                .publish_environment(environment, &host, &file_name, checksum.as_deref())
                .await;
            report.outcomes.extend(outcomes);
        }

        if self.options.cleanup {
            match report.failed() {
                0 => self.cleanup(&staging).await,
                failed => warn!(
                    "{failed} target(s) failed, keeping {} for another attempt",
                    staging.staged.display()
                ),
            }
        }

        Ok(report)
    }

    async fn publish_environment(
        &self,
        environment: &Environment,
        host: &str,
        file_name: &str,
        checksum: Option<&str>,
    ) -> Vec<PublishOutcome> {
        let targets: Vec<PublishTarget> = environment.targets().collect();
        let fail_all = |targets: Vec<PublishTarget>, reason: String| {
            targets
                .into_iter()
                .map(|t| PublishOutcome::failed(t, reason.clone()))
                .collect::<Vec<_>>()
        };

        let control_plane = match self.connector.connect(environment) {
            Ok(control_plane) => control_plane,
            Err(err) => {
                error!("Connecting to the {} environment: {err}", environment.name);
                return fail_all(targets, err.to_string());
            }
        };

        info!("Getting os id for {} in {}", self.request.os_type, environment.name);
        let os_type_id = match control_plane.os_type_id(&self.request.os_type).await {
            Ok(id) => id,
            Err(err) => {
                error!("{err}");
                return fail_all(targets, err.to_string());
            }
        };

        info!("Zones {} in {}", targets.len(), environment.name);
        let mut outcomes = vec![];
        let mut remaining = targets.into_iter();
        while let Some(target) = remaining.next() {
            info!("Getting zone id for {}", target.zone);
            let zone_id = match control_plane.zone_id(&target.zone).await {
                Ok(id) => id,
                Err(err) => {
                    error!("{err}, skipping the remaining zones of {}", environment.name);
                    outcomes.push(PublishOutcome::failed(target, err.to_string()));
                    outcomes.extend(fail_all(remaining.by_ref().collect(), format!("skipped: {err}")));
                    break;
                }
            };

            let replace = Replace {
                control_plane: control_plane.as_ref(),
                sidecar: self.sidecar.as_ref(),
                slot: &self.slot,
                settings: &self.settings,
                request: &self.request,
                serving: Serving {
                    web_root: &self.settings.server.web_root,
                    host,
                    port: self.settings.server.port,
                    system_service: self.options.system_service,
                    file_name,
                    checksum,
                },
                os_type_id: &os_type_id,
            };

            match replace.run(&target, &zone_id).await {
                Ok(replaced) => outcomes.push(PublishOutcome::succeeded(target, replaced)),
                Err(err) => {
                    error!("Publishing {} to {target} failed: {err}", self.request.name);
                    outcomes.push(PublishOutcome::failed(target, err.to_string()));
                }
            }
        }
        outcomes
    }

    async fn cleanup(&self, staging: &Staging) {
        match tokio::fs::remove_file(&staging.staged).await {
            Ok(()) => {
                self.set_staging(None);
                info!("Removed {} from the web root", staging.staged.display());
            }
            Err(err) => warn!(
                "Could not clean up {}, please remove it manually: {err}",
                staging.staged.display()
            ),
        }
    }

    /// Remove the sidecar and move the image back. Runs once, failures are only logged.
    pub async fn rollback(&self) {
        let state = self.slot.state();
        if let Some(handle) = self.slot.take() {
            info!("Cleaning up file server {} ({state:?})", handle.id);
            if let Err(err) = self.sidecar.stop(&handle).await {
                error!("{err}");
            }
        }

        let staging = self.take_staging();
        if let Some(staging) = staging {
            info!("Moving template back to {}", staging.original.display());
            if let Err(err) = staging.restore().await {
                error!(
                    "Failed moving {} back to {}: {err}",
                    staging.staged.display(),
                    staging.original.display()
                );
            }
        }
    }

    fn set_staging(&self, staging: Option<Staging>) {
        *self.staging.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = staging;
    }

    fn take_staging(&self) -> Option<Staging> {
        self.staging
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Resolves when the process receives SIGINT or SIGTERM; yields the signal name.
pub async fn interrupted() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "interrupt")
    }
}
