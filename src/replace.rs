//! Publish one template into one zone, replacing any template of the same name.
//!
//! The old template is only deleted once the new one is ready, so there is never a
//! moment without a usable template of that name.
use log::{error, info, warn};
use std::path::Path;
use thiserror::Error;

use crate::cloudstack::{self, wait_for_job, ControlPlane, RegisterParams, TemplateRecord};
use crate::config::Settings;
use crate::request::{PublishRequest, PublishTarget};
use crate::sidecar::{self, Sidecar, SidecarHandle, SidecarSlot};
use crate::watcher::{self, Watcher};

#[derive(Error, Debug)]
pub enum Error {
    #[error("look up existing template: {0}")]
    Lookup(cloudstack::Error),

    #[error("file server: {0}")]
    Sidecar(#[from] sidecar::Error),

    #[error("register template: {0}")]
    Register(cloudstack::Error),

    #[error("registration of {0} returned no new template")]
    NoNewTemplate(String),

    #[error("template readiness: {0}")]
    Readiness(#[from] watcher::Error),
}

/// What happened to one target that was published successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct Replaced {
    pub new_id: String,
    pub previous_id: Option<String>,
    /// Problems that need an operator's attention but did not fail the publish.
    pub warnings: Vec<String>,
}

/// Where the staged image lives and how it is served.
pub struct Serving<'a> {
    pub web_root: &'a Path,
    pub host: &'a str,
    pub port: u16,
    /// Try an already running system web server before starting a sidecar.
    pub system_service: bool,
    /// File name of the staged image inside the web root.
    pub file_name: &'a str,
    /// Sent along with the registration when present.
    pub checksum: Option<&'a str>,
}

pub struct Replace<'a> {
    pub control_plane: &'a dyn ControlPlane,
    pub sidecar: &'a dyn Sidecar,
    pub slot: &'a SidecarSlot,
    pub settings: &'a Settings,
    pub request: &'a PublishRequest,
    pub serving: Serving<'a>,
    pub os_type_id: &'a str,
}

impl Replace<'_> {
    pub async fn run(&self, target: &PublishTarget, zone_id: &str) -> Result<Replaced, Error> {
        let name = &self.request.name;
        let mut warnings = vec![];

        info!("Checking if template {name} exists in {target}");
        let existing = self
            .control_plane
            .find_template(name, zone_id)
            .await
            .map_err(Error::Lookup)?;
        if let Some(existing) = &existing {
            info!(
                "Found a template with the same name in {target}, saving id {} for deletion later",
                existing.id
            );
        }
        let existing_id = existing.as_ref().map(|t| t.id.as_str());

        let handle = self.file_server().await?;
        let base_url = handle
            .as_ref()
            .map(SidecarHandle::url)
            .unwrap_or_else(|| format!("http://{}", sidecar::address(self.serving.host, self.serving.port)));

        let params = self.register_params(&base_url, zone_id, existing.as_ref());
        info!("Registering template {name} in {target} at url: {}", params.url);
        let new_id = match self.register(&params, existing_id).await {
            Ok(new_id) => new_id,
            Err(err) => {
                error!("Registration of {name} in {target} failed: {err}");
                self.teardown().await;
                return Err(err);
            }
        };

        info!("Waiting for new template {name} ({new_id}) to be ready");
        let watcher = Watcher::new(self.settings.watch);
        if let Err(err) = watcher.wait_until_ready(self.control_plane, name, &new_id).await {
            error!("Template {name} ({new_id}) in {target} did not become ready: {err}");
            self.teardown().await;
            return Err(err.into());
        }

        if !self.request.resource_tags.is_empty() {
            info!("Creating resource tags for the new template {name} ({new_id})");
            if let Err(err) = self.tag(&new_id).await {
                let warning = format!(
                    "resource tags failed to be applied for {new_id}, please edit them manually: {err}"
                );
                warn!("{warning}");
                warnings.push(warning);
            }
        }

        if let Some(existing_id) = existing_id {
            info!("Deleting old template id {existing_id}");
            match self.delete(existing_id).await {
                Ok(()) => info!("Successfully deleted template id: {existing_id}"),
                Err(err) => {
                    let warning = format!(
                        "error deleting {existing_id}, you may need to manually delete the template from CloudStack: {err}"
                    );
                    warn!("{warning}");
                    warnings.push(warning);
                }
            }
        }

        if let Some(warning) = self.teardown().await {
            warnings.push(warning);
        }

        info!("Your new template {name} with id {new_id} is ready for use in {target}");
        Ok(Replaced {
            new_id,
            previous_id: existing_id.map(str::to_string),
            warnings,
        })
    }

    /// Make the web root reachable. Returns the sidecar handle if one was started.
    async fn file_server(&self) -> Result<Option<SidecarHandle>, Error> {
        if self.serving.system_service {
            let address = sidecar::address(self.serving.host, self.serving.port);
            match self.sidecar.probe_existing(&address).await {
                Ok(()) => {
                    info!("Using the system http service at {address}");
                    return Ok(None);
                }
                Err(err) => {
                    warn!("Error checking host http service: {err}. Trying to start a sidecar container")
                }
            }
        }

        let handle = self
            .sidecar
            .prepare(self.serving.web_root, self.serving.host, self.serving.port);
        self.slot.starting(handle.clone());

        if let Err(err) = self.sidecar.start(&handle).await {
            self.teardown().await;
            return Err(err.into());
        }

        info!("Waiting for file server {} to be active", handle.id);
        if let Err(err) = self
            .sidecar
            .await_ready(&handle, self.settings.sidecar.ready_timeout())
            .await
        {
            self.teardown().await;
            return Err(err.into());
        }
        self.slot.ready();

        Ok(Some(handle))
    }

    /// Stop the sidecar if one is running. Failures are logged and returned as a warning.
    async fn teardown(&self) -> Option<String> {
        let handle = self.slot.take()?;
        info!("Stopping file server {}", handle.id);
        match self.sidecar.stop(&handle).await {
            Ok(()) => None,
            Err(err) => {
                error!("{err}");
                Some(err.to_string())
            }
        }
    }

    fn register_params(&self, base_url: &str, zone_id: &str, existing: Option<&TemplateRecord>) -> RegisterParams {
        let r = self.request;
        // The existing template's tag wins over the configured one.
        let template_tag = existing
            .map(|t| t.tag.clone())
            .filter(|tag| !tag.is_empty())
            .or_else(|| Some(r.template_tag.clone()).filter(|tag| !tag.is_empty()));

        RegisterParams {
            display_text: r.display_text.clone(),
            format: r.format.to_uppercase(),
            hypervisor: r.hypervisor.clone(),
            name: r.name.clone(),
            os_type_id: self.os_type_id.to_string(),
            url: format!("{base_url}/{}", self.serving.file_name),
            zone_id: zone_id.to_string(),
            is_public: r.is_public,
            is_featured: r.is_featured,
            password_enabled: r.password_enabled,
            is_dynamically_scalable: r.is_dynamic,
            is_extractable: r.is_extractable,
            is_routing: r.is_routing,
            requires_hvm: r.requires_hvm,
            ssh_key_enabled: r.ssh_key_enabled,
            project_id: r.project_id.clone().filter(|id| !id.is_empty()),
            template_tag,
            checksum: self.serving.checksum.map(str::to_string),
        }
    }

    async fn register(&self, params: &RegisterParams, existing_id: Option<&str>) -> Result<String, Error> {
        let records = self
            .control_plane
            .register_template(params)
            .await
            .map_err(Error::Register)?;
        info!("Grabbing new template id");
        select_new(&records, &params.name, existing_id)
            .map(|t| t.id.clone())
            .ok_or_else(|| Error::NoNewTemplate(params.name.clone()))
    }

    async fn tag(&self, id: &str) -> Result<(), cloudstack::Error> {
        let job_id = self
            .control_plane
            .create_tags(&[id.to_string()], "Template", &self.request.resource_tags)
            .await?;
        let result = wait_for_job(self.control_plane, &job_id, self.settings.job).await?;
        job_succeeded(&job_id, &result)?;
        info!("Successfully created resource tags for: {id}");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), cloudstack::Error> {
        let job_id = self.control_plane.delete_template(id).await?;
        let result = wait_for_job(self.control_plane, &job_id, self.settings.job).await?;
        job_succeeded(&job_id, &result)
    }
}

/// Pick the newly registered template out of a registration response.
///
/// CloudStack may echo the pre-existing template when names collide, so any record
/// with `existing_id` is skipped.
pub fn select_new<'r>(
    records: &'r [TemplateRecord],
    name: &str,
    existing_id: Option<&str>,
) -> Option<&'r TemplateRecord> {
    records
        .iter()
        .find(|t| t.name == name && Some(t.id.as_str()) != existing_id)
}

fn job_succeeded(job_id: &str, result: &serde_json::Value) -> Result<(), cloudstack::Error> {
    match result.get("success").and_then(|s| s.as_bool()) {
        Some(false) => Err(cloudstack::Error::JobFailed {
            job_id: job_id.to_string(),
            text: result
                .get("displaytext")
                .and_then(|t| t.as_str())
                .unwrap_or("job reported failure")
                .to_string(),
        }),
        _ => Ok(()),
    }
}
