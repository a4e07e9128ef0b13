//! Pull an existing template back out of CloudStack so it can be republished.
use log::info;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::cloudstack::{self, wait_for_job, ControlPlane, TemplateRecord};
use crate::config::Polling;
use crate::request::{self, DiskFormat, FileError, PublishRequest};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    CloudStack(#[from] cloudstack::Error),

    #[error("template {0} is not extractable")]
    NotExtractable(String),

    #[error("extraction job {0} did not return a download url")]
    MissingUrl(String),

    #[error("template {id} has an unusable format: {err}")]
    Format { id: String, err: request::Error },

    #[error("download {url}: {err}")]
    Http { url: String, err: reqwest::Error },

    #[error("write {path}: {err}")]
    Write { path: String, err: std::io::Error },

    #[error("template config: {0}")]
    Config(#[from] FileError),
}

/// Which template to pull.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    Name(String),
    Id(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Downloaded {
    pub image: PathBuf,
    pub config: PathBuf,
    pub request: PublishRequest,
}

pub struct Download<'a> {
    pub control_plane: &'a dyn ControlPlane,
    pub job: Polling,
    pub output_dir: &'a Path,
}

impl Download<'_> {
    pub async fn run(&self, selector: &Selector, zone_id: &str, host_ip: &str) -> Result<Downloaded, Error> {
        let id = match selector {
            Selector::Id(id) => id.clone(),
            Selector::Name(name) => {
                info!("Looking up template {name} in zone {zone_id}");
                self.control_plane.template_id(name, zone_id).await?
            }
        };

        let record = self.control_plane.template(&id).await?;
        if !record.is_extractable {
            return Err(Error::NotExtractable(id));
        }
        let format: DiskFormat = record.format.parse().map_err(|err| Error::Format {
            id: id.clone(),
            err,
        })?;

        info!("Requesting download link for template {} ({id})", record.name);
        let job_id = self.control_plane.extract_template(&id, zone_id).await?;
        let result = wait_for_job(self.control_plane, &job_id, self.job).await?;
        let url = result["template"]["url"]
            .as_str()
            .filter(|url| !url.is_empty())
            .ok_or(Error::MissingUrl(job_id))?;

        let image = self
            .output_dir
            .join(format!("{}.{}", record.name, format.extension()));
        fetch(url, &image).await?;

        let request = republish_request(&record, &image, host_ip);
        let config = self.output_dir.join("template.yml");
        request.write_file(&config.display().to_string())?;
        info!("Wrote {}", config.display());

        Ok(Downloaded { image, config, request })
    }
}

async fn fetch(url: &str, path: &Path) -> Result<(), Error> {
    let http_err = |err| Error::Http {
        url: url.to_string(),
        err,
    };
    let write_err = |err| Error::Write {
        path: path.display().to_string(),
        err,
    };

    info!("Downloading {url} to {}", path.display());
    let mut resp = reqwest::get(url)
        .await
        .and_then(|resp| resp.error_for_status())
        .map_err(http_err)?;

    let mut file = tokio::fs::File::create(path).await.map_err(write_err)?;
    let mut written: u64 = 0;
    while let Some(chunk) = resp.chunk().await.map_err(http_err)? {
        file.write_all(&chunk).await.map_err(write_err)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(write_err)?;
    info!("Downloaded {written} bytes");
    Ok(())
}

/// A template config that registers the downloaded image again under the same settings.
fn republish_request(record: &TemplateRecord, image: &Path, host_ip: &str) -> PublishRequest {
    PublishRequest {
        name: record.name.clone(),
        host_ip: host_ip.to_string(),
        template_file: image.display().to_string(),
        os_type: record.os_type_name.clone(),
        format: record.format.clone(),
        hypervisor: record.hypervisor.clone(),
        display_text: record.display_text.clone(),
        is_public: record.is_public,
        is_featured: record.is_featured,
        password_enabled: record.password_enabled,
        is_dynamic: record.is_dynamically_scalable,
        is_extractable: record.is_extractable,
        ssh_key_enabled: record.ssh_key_enabled,
        project_id: record.project_id.clone(),
        template_tag: record.tag.clone(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudstack::JobStatus;
    use crate::testing::{record, Call, FakeControlPlane};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn extractable() -> TemplateRecord {
        TemplateRecord {
            format: "QCOW2".into(),
            hypervisor: "KVM".into(),
            os_type_name: "Ubuntu 20.04 (64-bit)".into(),
            display_text: "Ubuntu 20.04".into(),
            is_extractable: true,
            is_featured: true,
            tag: "golden".into(),
            ..record("tpl-1", "ubuntu-20")
        }
    }

    fn polling() -> Polling {
        Polling {
            interval_secs: 0,
            attempts: 3,
        }
    }

    #[tokio::test]
    async fn downloads_image_and_writes_template_config() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ubuntu-20.qcow2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"disk bytes".to_vec()))
            .mount(&server)
            .await;

        let cp = FakeControlPlane::new()
            .with_existing(extractable())
            .with_readiness(vec![extractable()])
            .with_job(
                "job-extract",
                JobStatus::Succeeded(json!({"template": {"url": format!("{}/ubuntu-20.qcow2", server.uri())}})),
            );
        let dir = tempfile::tempdir().unwrap();
        let download = Download {
            control_plane: &cp,
            job: polling(),
            output_dir: dir.path(),
        };

        let downloaded = download
            .run(&Selector::Name("ubuntu-20".into()), "zone-a-id", "10.0.0.5")
            .await
            .unwrap();

        assert_eq!(downloaded.image, dir.path().join("ubuntu-20.qcow2"));
        assert_eq!(std::fs::read(&downloaded.image).unwrap(), b"disk bytes");

        let written = PublishRequest::parse_file(downloaded.config.to_str().unwrap()).unwrap();
        assert_eq!(written, downloaded.request);
        assert_eq!(written.os_type, "Ubuntu 20.04 (64-bit)");
        assert_eq!(written.template_tag, "golden");
        assert_eq!(written.host_ip, "10.0.0.5");
        assert!(written.is_featured);
        assert!(written.environments.is_empty());
        assert!(cp.calls().contains(&Call::Extract("tpl-1".into())));
    }

    #[tokio::test]
    async fn refuses_template_that_is_not_extractable() {
        let locked = TemplateRecord {
            is_extractable: false,
            ..extractable()
        };
        let cp = FakeControlPlane::new().with_readiness(vec![locked]);
        let dir = tempfile::tempdir().unwrap();
        let download = Download {
            control_plane: &cp,
            job: polling(),
            output_dir: dir.path(),
        };

        let err = download
            .run(&Selector::Id("tpl-1".into()), "zone-a-id", "10.0.0.5")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotExtractable(id) if id == "tpl-1"));
        assert!(!cp.calls().iter().any(|c| matches!(c, Call::Extract(_))));
    }

    #[tokio::test]
    async fn extraction_without_url() {
        let cp = FakeControlPlane::new()
            .with_readiness(vec![extractable()])
            .with_job("job-extract", JobStatus::Succeeded(json!({"template": {}})));
        let dir = tempfile::tempdir().unwrap();
        let download = Download {
            control_plane: &cp,
            job: polling(),
            output_dir: dir.path(),
        };

        let err = download
            .run(&Selector::Id("tpl-1".into()), "zone-a-id", "10.0.0.5")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingUrl(job) if job == "job-extract"));
    }

    #[tokio::test]
    async fn unknown_template_name() {
        let cp = FakeControlPlane::new();
        let dir = tempfile::tempdir().unwrap();
        let download = Download {
            control_plane: &cp,
            job: polling(),
            output_dir: dir.path(),
        };

        let err = download
            .run(&Selector::Name("missing".into()), "zone-a-id", "10.0.0.5")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CloudStack(cloudstack::Error::TemplateNotFound(_))));
    }
}
