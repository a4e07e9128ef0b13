use log::info;
use thiserror::Error;

use crate::cloudstack::{self, ControlPlane, TemplateRecord};
use crate::config::Polling;

#[derive(Error, Debug)]
pub enum Error {
    #[error("template {id} is taking longer than expected to upload, gave up after {attempts} checks")]
    Timeout { id: String, attempts: u32 },

    #[error("template {id} failed with status: {status}, please check the url and try again")]
    Status { id: String, status: String },

    #[error("fetch template {id}: {err}")]
    Fetch { id: String, err: cloudstack::Error },
}

/// Where a registered template stands on a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

/// Status texts CloudStack reports while it is still fetching or installing a template.
const TRANSIENT_STATUSES: [&str; 3] = ["", "Installing Template", "Download Complete"];

/// Progress reports such as `"35% Downloaded"`.
const TRANSIENT_MARKER: &str = "Downloaded";

pub fn classify(record: &TemplateRecord) -> Readiness {
    if record.ready {
        Readiness::Ready
    } else if TRANSIENT_STATUSES.contains(&record.status.as_str()) || record.status.contains(TRANSIENT_MARKER) {
        Readiness::Pending
    } else {
        Readiness::Failed(record.status.clone())
    }
}

/// Polls a freshly registered template until it is ready, fails, or the budget runs out.
pub struct Watcher {
    polling: Polling,
}

impl Watcher {
    pub fn new(polling: Polling) -> Self {
        Self { polling }
    }

    pub async fn wait_until_ready(
        &self,
        control_plane: &dyn ControlPlane,
        name: &str,
        id: &str,
    ) -> Result<TemplateRecord, Error> {
        for attempt in 1..=self.polling.attempts {
            let record = control_plane.template(id).await.map_err(|err| Error::Fetch {
                id: id.to_string(),
                err,
            })?;

            info!(
                "Checking if template {name} ({id}) is ready: {} status: {:?}",
                record.ready, record.status
            );

            match classify(&record) {
                Readiness::Ready => return Ok(record),
                Readiness::Failed(status) => {
                    return Err(Error::Status {
                        id: id.to_string(),
                        status,
                    })
                }
                Readiness::Pending if attempt < self.polling.attempts => {
                    tokio::time::sleep(self.polling.interval()).await
                }
                Readiness::Pending => {}
            }
        }

        Err(Error::Timeout {
            id: id.to_string(),
            attempts: self.polling.attempts,
        })
    }
}
