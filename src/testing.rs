//! In-memory control plane and sidecar used by the pipeline tests.
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::cloudstack::{self, Connect, ControlPlane, JobStatus, RegisterParams, TemplateRecord};
use crate::request::Environment;
use crate::sidecar::{self, Sidecar, SidecarHandle};

pub fn record(id: &str, name: &str) -> TemplateRecord {
    TemplateRecord {
        id: id.to_string(),
        name: name.to_string(),
        ..Default::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    OsTypeId(String),
    ZoneId(String),
    FindTemplate { name: String, zone_id: String },
    Register(RegisterParams),
    Template(String),
    Delete(String),
    CreateTags { ids: Vec<String>, tags: BTreeMap<String, String> },
    Extract(String),
    QueryJob(String),
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    os_types: BTreeMap<String, String>,
    missing_zones: HashSet<String>,
    existing: Option<TemplateRecord>,
    registration: Vec<TemplateRecord>,
    register_error: Option<String>,
    readiness: VecDeque<TemplateRecord>,
    last_readiness: Option<TemplateRecord>,
    jobs: HashMap<String, JobStatus>,
}

pub struct FakeControlPlane {
    state: Mutex<State>,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        let mut state = State::default();
        state
            .os_types
            .insert("Ubuntu 20.04 (64-bit)".into(), "os-1".into());
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn with_existing(self, existing: TemplateRecord) -> Self {
        self.state.lock().unwrap().existing = Some(existing);
        self
    }

    pub fn with_registration(self, records: Vec<TemplateRecord>) -> Self {
        self.state.lock().unwrap().registration = records;
        self
    }

    pub fn with_register_error(self, text: &str) -> Self {
        self.state.lock().unwrap().register_error = Some(text.to_string());
        self
    }

    /// Records returned by successive `template` calls; the last one repeats.
    pub fn with_readiness(self, records: Vec<TemplateRecord>) -> Self {
        self.state.lock().unwrap().readiness = records.into();
        self
    }

    pub fn with_job(self, job_id: &str, status: JobStatus) -> Self {
        self.state.lock().unwrap().jobs.insert(job_id.to_string(), status);
        self
    }

    pub fn with_missing_zone(self, zone: &str) -> Self {
        self.state.lock().unwrap().missing_zones.insert(zone.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn template_fetches(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::Template(_))).count()
    }

    pub fn registrations(&self) -> Vec<RegisterParams> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Register(params) => Some(params),
                _ => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Delete(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn record_call(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn os_type_id(&self, description: &str) -> Result<String, cloudstack::Error> {
        self.record_call(Call::OsTypeId(description.to_string()));
        let state = self.state.lock().unwrap();
        state
            .os_types
            .get(description)
            .cloned()
            .ok_or_else(|| cloudstack::Error::UnknownOsType {
                name: description.to_string(),
                available: state.os_types.keys().cloned().collect(),
            })
    }

    async fn zone_id(&self, name: &str) -> Result<String, cloudstack::Error> {
        self.record_call(Call::ZoneId(name.to_string()));
        if self.state.lock().unwrap().missing_zones.contains(name) {
            return Err(cloudstack::Error::ZoneNotFound(name.to_string()));
        }
        Ok(format!("{name}-id"))
    }

    async fn find_template(&self, name: &str, zone_id: &str) -> Result<Option<TemplateRecord>, cloudstack::Error> {
        self.record_call(Call::FindTemplate {
            name: name.to_string(),
            zone_id: zone_id.to_string(),
        });
        Ok(self.state.lock().unwrap().existing.clone())
    }

    async fn register_template(&self, params: &RegisterParams) -> Result<Vec<TemplateRecord>, cloudstack::Error> {
        self.record_call(Call::Register(params.clone()));
        let state = self.state.lock().unwrap();
        match &state.register_error {
            Some(text) => Err(cloudstack::Error::Api {
                command: "registerTemplate".into(),
                code: 530,
                text: text.clone(),
            }),
            None => Ok(state.registration.clone()),
        }
    }

    async fn template(&self, id: &str) -> Result<TemplateRecord, cloudstack::Error> {
        self.record_call(Call::Template(id.to_string()));
        let mut state = self.state.lock().unwrap();
        let next = match state.readiness.pop_front() {
            Some(next) => {
                state.last_readiness = Some(next.clone());
                next
            }
            None => state.last_readiness.clone().unwrap_or(TemplateRecord {
                ready: true,
                ..record(id, "")
            }),
        };
        Ok(TemplateRecord {
            id: id.to_string(),
            ..next
        })
    }

    async fn delete_template(&self, id: &str) -> Result<String, cloudstack::Error> {
        self.record_call(Call::Delete(id.to_string()));
        Ok("job-delete".into())
    }

    async fn create_tags(
        &self,
        resource_ids: &[String],
        _resource_type: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String, cloudstack::Error> {
        self.record_call(Call::CreateTags {
            ids: resource_ids.to_vec(),
            tags: tags.clone(),
        });
        Ok("job-tags".into())
    }

    async fn extract_template(&self, id: &str, _zone_id: &str) -> Result<String, cloudstack::Error> {
        self.record_call(Call::Extract(id.to_string()));
        Ok("job-extract".into())
    }

    async fn query_async_job(&self, job_id: &str) -> Result<JobStatus, cloudstack::Error> {
        self.record_call(Call::QueryJob(job_id.to_string()));
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .get(job_id)
            .cloned()
            .unwrap_or_else(|| JobStatus::Succeeded(serde_json::json!({"success": true}))))
    }
}

/// Hands out the same fake for every environment.
pub struct FakeConnector(pub Arc<FakeControlPlane>);

impl Connect for FakeConnector {
    fn connect(&self, _environment: &Environment) -> Result<Arc<dyn ControlPlane>, cloudstack::Error> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SidecarCall {
    Start(String),
    AwaitReady(String),
    Probe(String),
    Stop(String),
}

#[derive(Default)]
pub struct FakeSidecar {
    calls: Mutex<Vec<SidecarCall>>,
    fail_start: bool,
    fail_stop: bool,
    system_service_up: bool,
    hang_on_ready: bool,
    started: Mutex<Option<oneshot::Sender<()>>>,
}

impl FakeSidecar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_start(self) -> Self {
        Self { fail_start: true, ..self }
    }

    pub fn failing_stop(self) -> Self {
        Self { fail_stop: true, ..self }
    }

    pub fn with_system_service(self) -> Self {
        Self {
            system_service_up: true,
            ..self
        }
    }

    /// Never become ready; the receiver fires once the sidecar has been started.
    pub fn hanging_after_start(self) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let sidecar = Self {
            hang_on_ready: true,
            ..self
        };
        *sidecar.started.lock().unwrap() = Some(tx);
        (sidecar, rx)
    }

    pub fn calls(&self) -> Vec<SidecarCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn starts(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, SidecarCall::Start(_))).count()
    }

    pub fn stops(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, SidecarCall::Stop(_))).count()
    }

    fn record_call(&self, call: SidecarCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Sidecar for FakeSidecar {
    fn prepare(&self, serve_path: &Path, host: &str, port: u16) -> SidecarHandle {
        SidecarHandle {
            id: "templateWeb".into(),
            address: sidecar::address(host, port),
            serve_path: serve_path.to_path_buf(),
        }
    }

    async fn start(&self, handle: &SidecarHandle) -> Result<(), sidecar::Error> {
        self.record_call(SidecarCall::Start(handle.id.clone()));
        if let Some(started) = self.started.lock().unwrap().take() {
            let _ = started.send(());
        }
        if self.fail_start {
            return Err(sidecar::Error::Start {
                id: handle.id.clone(),
                reason: "docker daemon unreachable".into(),
            });
        }
        Ok(())
    }

    async fn await_ready(&self, handle: &SidecarHandle, _timeout: Duration) -> Result<(), sidecar::Error> {
        self.record_call(SidecarCall::AwaitReady(handle.address.clone()));
        if self.hang_on_ready {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn probe_existing(&self, address: &str) -> Result<(), sidecar::Error> {
        self.record_call(SidecarCall::Probe(address.to_string()));
        if self.system_service_up {
            Ok(())
        } else {
            Err(sidecar::Error::Probe {
                address: address.to_string(),
                reason: "connection refused".into(),
            })
        }
    }

    async fn stop(&self, handle: &SidecarHandle) -> Result<(), sidecar::Error> {
        self.record_call(SidecarCall::Stop(handle.id.clone()));
        if self.fail_stop {
            return Err(sidecar::Error::Stop {
                id: handle.id.clone(),
                reason: "no such container".into(),
            });
        }
        Ok(())
    }
}
