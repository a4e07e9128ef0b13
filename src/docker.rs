use async_trait::async_trait;
use log::{debug, info};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::config;
use crate::sidecar::{address, Error, Sidecar, SidecarHandle};

/// Runs the file server as an httpd container through the `docker` CLI.
pub struct Docker {
    runtime: String,
    image: String,
    container_name: String,
    document_root: String,
    probe_interval: Duration,
    http: reqwest::Client,
}

impl Docker {
    pub fn new(cfg: &config::Sidecar) -> Result<Self, reqwest::Error> {
        Ok(Self {
            runtime: cfg.runtime.clone(),
            image: cfg.image.clone(),
            container_name: cfg.container_name.clone(),
            document_root: cfg.document_root.clone(),
            probe_interval: cfg.probe_interval(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(3))
                .build()?,
        })
    }

    async fn pull(&self) -> Result<ExitStatus, std::io::Error> {
        debug!("Pulling image {}", self.image);
        Command::new(&self.runtime)
            .arg("pull")
            .arg(&self.image)
            .kill_on_drop(true)
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()
            .await
    }

    async fn run(&self, handle: &SidecarHandle, port: &str) -> Result<ExitStatus, std::io::Error> {
        Command::new(&self.runtime)
            .arg("run")
            .arg("--detach")
            .arg("--name")
            .arg(&handle.id)
            .arg("--publish")
            .arg(format!("0.0.0.0:{port}:80"))
            .arg("--volume")
            .arg(format!("{}:{}", handle.serve_path.display(), self.document_root))
            .arg(&self.image)
            // An aborted start must not leave a client behind that creates the
            // container after rollback removed it.
            .kill_on_drop(true)
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()
            .await
    }
}

#[async_trait]
impl Sidecar for Docker {
    fn prepare(&self, serve_path: &Path, host: &str, port: u16) -> SidecarHandle {
        SidecarHandle {
            id: self.container_name.clone(),
            address: address(host, port),
            serve_path: serve_path.to_path_buf(),
        }
    }

    async fn start(&self, handle: &SidecarHandle) -> Result<(), Error> {
        let start_error = |reason: String| Error::Start {
            id: handle.id.clone(),
            reason,
        };

        let status = self.pull().await.map_err(|err| start_error(err.to_string()))?;
        if !status.success() {
            return Err(start_error(format!("docker pull exited with {status}")));
        }

        let port = handle.address.rsplit_once(':').map(|(_, port)| port).unwrap_or("80");
        info!("Creating httpd container {} serving {}", handle.id, handle.serve_path.display());
        let status = self.run(handle, port).await.map_err(|err| start_error(err.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(start_error(format!("docker run exited with {status}")))
        }
    }

    async fn await_ready(&self, handle: &SidecarHandle, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.http.get(handle.url()).send().await {
                Ok(resp) => {
                    debug!("File server at {} answered with {}", handle.address, resp.status());
                    return Ok(());
                }
                Err(err) => debug!("File server at {} not reachable yet: {err}", handle.address),
            }
            if Instant::now() + self.probe_interval >= deadline {
                return Err(Error::NotReady {
                    address: handle.address.clone(),
                    timeout,
                });
            }
            tokio::time::sleep(self.probe_interval).await;
        }
    }

    async fn probe_existing(&self, address: &str) -> Result<(), Error> {
        let probe_error = |reason: String| Error::Probe {
            address: address.to_string(),
            reason,
        };
        let resp = self
            .http
            .get(format!("http://{address}"))
            .send()
            .await
            .map_err(|err| probe_error(err.to_string()))?;
        if resp.status() == reqwest::StatusCode::OK {
            Ok(())
        } else {
            Err(probe_error(format!("answered with {}", resp.status())))
        }
    }

    async fn stop(&self, handle: &SidecarHandle) -> Result<(), Error> {
        debug!("Removing container {}", handle.id);
        Command::new(&self.runtime)
            .arg("rm")
            .arg("--force")
            .arg(&handle.id)
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|err| Error::Stop {
                id: handle.id.clone(),
                reason: err.to_string(),
            })
            .and_then(|exit_status| {
                if exit_status.success() {
                    Ok(())
                } else {
                    Err(Error::Stop {
                        id: handle.id.clone(),
                        reason: format!("docker rm exited with {exit_status}"),
                    })
                }
            })
    }
}
