//! CloudStack control-plane access.
//!
//! [`ControlPlane`] is the capability the publish pipeline depends on; [`Client`]
//! implements it against the CloudStack query API.
use async_trait::async_trait;
use base64::prelude::*;
use hmac::{Hmac, Mac};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha1::Sha1;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::config::Polling;
use crate::request::Environment;

type HmacSha1 = Hmac<Sha1>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("{command} failed with error code {code}: {text}")]
    Api {
        command: String,
        code: u16,
        text: String,
    },

    #[error("code: {0}, body: {1}")]
    Deserialize(u16, String),

    #[error("unknown os type {name}, available os types are {available:?}")]
    UnknownOsType { name: String, available: Vec<String> },

    #[error("zone {0} not found")]
    ZoneNotFound(String),

    #[error("template {0} not found")]
    TemplateNotFound(String),

    #[error("async job {job_id} failed: {text}")]
    JobFailed { job_id: String, text: String },

    #[error("async job {job_id} did not finish after {attempts} attempts")]
    JobTimeout { job_id: String, attempts: u32 },

    #[error("async job {0} finished without a result")]
    MissingJobResult(String),

    #[error("invalid api secret")]
    Signing,
}

/// A template as CloudStack reports it.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TemplateRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "templatetag", default)]
    pub tag: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "isready", default)]
    pub ready: bool,
    #[serde(rename = "displaytext", default)]
    pub display_text: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub hypervisor: String,
    #[serde(rename = "ostypename", default)]
    pub os_type_name: String,
    #[serde(rename = "zonename", default)]
    pub zone_name: String,
    #[serde(rename = "ispublic", default)]
    pub is_public: bool,
    #[serde(rename = "isfeatured", default)]
    pub is_featured: bool,
    #[serde(rename = "passwordenabled", default)]
    pub password_enabled: bool,
    #[serde(rename = "isdynamicallyscalable", default)]
    pub is_dynamically_scalable: bool,
    #[serde(rename = "isextractable", default)]
    pub is_extractable: bool,
    #[serde(rename = "sshkeyenabled", default)]
    pub ssh_key_enabled: bool,
    #[serde(rename = "projectid", default)]
    pub project_id: Option<String>,
}

/// Parameters of a `registerTemplate` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterParams {
    pub display_text: String,
    /// Upper-case disk format, e.g. `QCOW2`.
    pub format: String,
    pub hypervisor: String,
    pub name: String,
    pub os_type_id: String,
    pub url: String,
    pub zone_id: String,
    pub is_public: bool,
    pub is_featured: bool,
    pub password_enabled: bool,
    pub is_dynamically_scalable: bool,
    pub is_extractable: bool,
    pub is_routing: bool,
    pub requires_hvm: bool,
    pub ssh_key_enabled: bool,
    pub project_id: Option<String>,
    pub template_tag: Option<String>,
    pub checksum: Option<String>,
}

impl RegisterParams {
    fn query(&self) -> Vec<(String, String)> {
        let mut params = vec![
            p("displaytext", &self.display_text),
            p("format", &self.format),
            p("hypervisor", &self.hypervisor),
            p("name", &self.name),
            p("ostypeid", &self.os_type_id),
            p("url", &self.url),
            p("zoneid", &self.zone_id),
            p("ispublic", &self.is_public.to_string()),
            p("isfeatured", &self.is_featured.to_string()),
            p("passwordenabled", &self.password_enabled.to_string()),
            p("isdynamicallyscalable", &self.is_dynamically_scalable.to_string()),
            p("isextractable", &self.is_extractable.to_string()),
            p("isrouting", &self.is_routing.to_string()),
            p("requireshvm", &self.requires_hvm.to_string()),
            p("sshkeyenabled", &self.ssh_key_enabled.to_string()),
        ];
        if let Some(project_id) = &self.project_id {
            params.push(p("projectid", project_id));
        }
        if let Some(tag) = &self.template_tag {
            params.push(p("templatetag", tag));
        }
        if let Some(checksum) = &self.checksum {
            params.push(p("checksum", checksum));
        }
        params
    }
}

/// State of an asynchronous CloudStack job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Succeeded(serde_json::Value),
    Failed(String),
}

/// Everything the publish and download flows need from the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Id of the OS type whose description matches exactly.
    async fn os_type_id(&self, description: &str) -> Result<String, Error>;

    async fn zone_id(&self, name: &str) -> Result<String, Error>;

    /// A template with this name in the zone, if one exists.
    async fn find_template(&self, name: &str, zone_id: &str) -> Result<Option<TemplateRecord>, Error>;

    /// Register a template; returns the records CloudStack echoes back.
    async fn register_template(&self, params: &RegisterParams) -> Result<Vec<TemplateRecord>, Error>;

    async fn template(&self, id: &str) -> Result<TemplateRecord, Error>;

    /// Id of the template with this name in the zone.
    async fn template_id(&self, name: &str, zone_id: &str) -> Result<String, Error> {
        self.find_template(name, zone_id)
            .await?
            .map(|t| t.id)
            .ok_or_else(|| Error::TemplateNotFound(name.to_string()))
    }

    /// Start deleting a template; returns the async job id.
    async fn delete_template(&self, id: &str) -> Result<String, Error>;

    /// Start tagging resources; returns the async job id.
    async fn create_tags(
        &self,
        resource_ids: &[String],
        resource_type: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String, Error>;

    /// Start an `HTTP_DOWNLOAD` extraction; returns the async job id.
    async fn extract_template(&self, id: &str, zone_id: &str) -> Result<String, Error>;

    async fn query_async_job(&self, job_id: &str) -> Result<JobStatus, Error>;
}

/// Poll an async job at a fixed interval until it finishes or the budget runs out.
pub async fn wait_for_job(
    control_plane: &dyn ControlPlane,
    job_id: &str,
    polling: Polling,
) -> Result<serde_json::Value, Error> {
    for attempt in 1..=polling.attempts {
        match control_plane.query_async_job(job_id).await? {
            JobStatus::Succeeded(result) => return Ok(result),
            JobStatus::Failed(text) => {
                return Err(Error::JobFailed {
                    job_id: job_id.to_string(),
                    text,
                })
            }
            JobStatus::Pending => {
                debug!("Async job {job_id} still pending (attempt {attempt}/{})", polling.attempts);
                if attempt < polling.attempts {
                    tokio::time::sleep(polling.interval()).await;
                }
            }
        }
    }
    Err(Error::JobTimeout {
        job_id: job_id.to_string(),
        attempts: polling.attempts,
    })
}

/// Builds a [`ControlPlane`] for one environment.
pub trait Connect: Send + Sync {
    fn connect(&self, environment: &Environment) -> Result<std::sync::Arc<dyn ControlPlane>, Error>;
}

/// Connects to real CloudStack endpoints.
pub struct Connector;

impl Connect for Connector {
    fn connect(&self, environment: &Environment) -> Result<std::sync::Arc<dyn ControlPlane>, Error> {
        Ok(std::sync::Arc::new(Client::new(
            &environment.api_url,
            &environment.api_key,
            &environment.api_secret,
        )?))
    }
}

/// CloudStack API client using signed GET requests.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    secret_key: String,
}

impl Client {
    pub fn new(endpoint: &str, api_key: &str, secret_key: &str) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('?').to_string(),
            api_key: api_key.to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    /// Issue `command` and decode the `<command>response` object.
    async fn call<T: DeserializeOwned>(&self, command: &str, params: Vec<(String, String)>) -> Result<T, Error> {
        let query = sign(command, params, &self.api_key, &self.secret_key)?;
        debug!("CloudStack {command} at {}", self.endpoint);

        let resp = self
            .http
            .get(format!("{}?{}", self.endpoint, query))
            .send()
            .await?;

        let status = resp.status().as_u16();
        let bytes = resp.bytes().await?;

        let deserialize_error = || Error::Deserialize(status, String::from_utf8_lossy(&bytes).to_string());
        let mut body: serde_json::Value = serde_json::from_slice(&bytes).map_err(|_| deserialize_error())?;
        let inner = body
            .get_mut(format!("{}response", command.to_lowercase()))
            .map(serde_json::Value::take)
            .ok_or_else(deserialize_error)?;

        if let Some(text) = inner.get("errortext").and_then(|t| t.as_str()) {
            let code = inner
                .get("errorcode")
                .and_then(|c| c.as_u64())
                .map(|c| c as u16)
                .unwrap_or(status);
            return Err(Error::Api {
                command: command.to_string(),
                code,
                text: text.to_string(),
            });
        }

        serde_json::from_value(inner).map_err(|_| deserialize_error())
    }

    async fn list_templates(&self, params: Vec<(String, String)>) -> Result<Vec<TemplateRecord>, Error> {
        let mut params = params;
        params.push(p("templatefilter", "all"));
        let resp: api::ListTemplates = self.call("listTemplates", params).await?;
        Ok(resp.template)
    }
}

#[async_trait]
impl ControlPlane for Client {
    async fn os_type_id(&self, description: &str) -> Result<String, Error> {
        let resp: api::ListOsTypes = self.call("listOsTypes", vec![p("description", description)]).await?;
        if let Some(os_type) = resp.ostype.iter().find(|o| o.description == description) {
            return Ok(os_type.id.clone());
        }

        let all: api::ListOsTypes = self.call("listOsTypes", vec![]).await?;
        Err(Error::UnknownOsType {
            name: description.to_string(),
            available: all.ostype.into_iter().map(|o| o.description).collect(),
        })
    }

    async fn zone_id(&self, name: &str) -> Result<String, Error> {
        let resp: api::ListZones = self.call("listZones", vec![p("name", name)]).await?;
        resp.zone
            .into_iter()
            .find(|z| z.name == name)
            .map(|z| z.id)
            .ok_or_else(|| Error::ZoneNotFound(name.to_string()))
    }

    async fn find_template(&self, name: &str, zone_id: &str) -> Result<Option<TemplateRecord>, Error> {
        let templates = self
            .list_templates(vec![p("name", name), p("zoneid", zone_id)])
            .await?;
        Ok(templates.into_iter().find(|t| t.name == name))
    }

    async fn register_template(&self, params: &RegisterParams) -> Result<Vec<TemplateRecord>, Error> {
        let resp: api::ListTemplates = self.call("registerTemplate", params.query()).await?;
        Ok(resp.template)
    }

    async fn template(&self, id: &str) -> Result<TemplateRecord, Error> {
        self.list_templates(vec![p("id", id)])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::TemplateNotFound(id.to_string()))
    }

    async fn delete_template(&self, id: &str) -> Result<String, Error> {
        let resp: api::Job = self.call("deleteTemplate", vec![p("id", id)]).await?;
        Ok(resp.jobid)
    }

    async fn create_tags(
        &self,
        resource_ids: &[String],
        resource_type: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String, Error> {
        let mut params = vec![
            p("resourceids", &resource_ids.join(",")),
            p("resourcetype", resource_type),
        ];
        for (i, (key, value)) in tags.iter().enumerate() {
            params.push(p(&format!("tags[{i}].key"), key));
            params.push(p(&format!("tags[{i}].value"), value));
        }
        let resp: api::Job = self.call("createTags", params).await?;
        Ok(resp.jobid)
    }

    async fn extract_template(&self, id: &str, zone_id: &str) -> Result<String, Error> {
        let resp: api::Job = self
            .call(
                "extractTemplate",
                vec![p("id", id), p("mode", "HTTP_DOWNLOAD"), p("zoneid", zone_id)],
            )
            .await?;
        info!("Extraction of template {id} started as job {}", resp.jobid);
        Ok(resp.jobid)
    }

    async fn query_async_job(&self, job_id: &str) -> Result<JobStatus, Error> {
        let resp: api::AsyncJobResult = self
            .call("queryAsyncJobResult", vec![p("jobid", job_id)])
            .await?;
        Ok(match resp.jobstatus {
            0 => JobStatus::Pending,
            1 => JobStatus::Succeeded(resp.jobresult.unwrap_or(serde_json::Value::Null)),
            _ => JobStatus::Failed(
                resp.jobresult
                    .as_ref()
                    .and_then(|r| r.get("errortext"))
                    .and_then(|t| t.as_str())
                    .unwrap_or("no error text")
                    .to_string(),
            ),
        })
    }
}

fn p(key: &str, value: &str) -> (String, String) {
    (key.to_string(), value.to_string())
}

/// Build the signed query string for `command`.
///
/// Parameters are sorted by lowercased key and percent-encoded; the signature is
/// the base64 HMAC-SHA1 of the lowercased query string.
fn sign(command: &str, params: Vec<(String, String)>, api_key: &str, secret_key: &str) -> Result<String, Error> {
    let mut params = params;
    params.push(p("command", command));
    params.push(p("response", "json"));
    params.push(p("apiKey", api_key));
    params.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()));

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let mut mac = HmacSha1::new_from_slice(secret_key.as_bytes()).map_err(|_| Error::Signing)?;
    mac.update(query.to_lowercase().as_bytes());
    let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!("{query}&signature={}", urlencoding::encode(&signature)))
}

mod api {
    use super::TemplateRecord;
    use serde::Deserialize;

    #[derive(Deserialize)]
    pub struct OsType {
        pub id: String,
        #[serde(default)]
        pub description: String,
    }

    #[derive(Deserialize)]
    pub struct ListOsTypes {
        #[serde(default)]
        pub ostype: Vec<OsType>,
    }

    #[derive(Deserialize)]
    pub struct Zone {
        pub id: String,
        #[serde(default)]
        pub name: String,
    }

    #[derive(Deserialize)]
    pub struct ListZones {
        #[serde(default)]
        pub zone: Vec<Zone>,
    }

    #[derive(Deserialize)]
    pub struct ListTemplates {
        #[serde(default)]
        pub template: Vec<TemplateRecord>,
    }

    #[derive(Deserialize)]
    pub struct Job {
        pub jobid: String,
    }

    #[derive(Deserialize)]
    pub struct AsyncJobResult {
        pub jobstatus: u8,
        pub jobresult: Option<serde_json::Value>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> Client {
        Client::new(&format!("{}/client/api", server.uri()), "key", "secret").unwrap()
    }

    async fn respond(server: &MockServer, command: &str, status: u16, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/client/api"))
            .and(query_param("command", command))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(server)
            .await;
    }

    #[test]
    fn signature_does_not_depend_on_parameter_order() {
        let a = sign("listZones", vec![p("name", "zone a"), p("id", "1")], "key", "secret").unwrap();
        let b = sign("listZones", vec![p("id", "1"), p("name", "zone a")], "key", "secret").unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("apiKey=key&command=listZones&id=1&name=zone%20a&response=json&signature="));
    }

    #[test]
    fn signature_depends_on_secret() {
        let a = sign("listZones", vec![], "key", "secret").unwrap();
        let b = sign("listZones", vec![], "key", "other").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn register_params_include_optional_fields_only_when_set() {
        let params = RegisterParams {
            name: "ubuntu-20".into(),
            format: "QCOW2".into(),
            ..Default::default()
        };
        let keys: Vec<_> = params.query().into_iter().map(|(k, _)| k).collect();
        assert!(keys.contains(&"format".to_string()));
        assert!(!keys.contains(&"projectid".to_string()));
        assert!(!keys.contains(&"templatetag".to_string()));

        let params = RegisterParams {
            project_id: Some("p-1".into()),
            template_tag: Some("lineage".into()),
            checksum: Some("{SHA-256}abc".into()),
            ..params
        };
        let keys: Vec<_> = params.query().into_iter().map(|(k, _)| k).collect();
        assert!(keys.contains(&"projectid".to_string()));
        assert!(keys.contains(&"templatetag".to_string()));
        assert!(keys.contains(&"checksum".to_string()));
    }

    #[tokio::test]
    async fn zone_id_by_name() {
        let server = MockServer::start().await;
        respond(
            &server,
            "listZones",
            200,
            json!({"listzonesresponse": {"count": 1, "zone": [{"id": "z-1", "name": "zone-a"}]}}),
        )
        .await;
        assert_eq!(client(&server).await.zone_id("zone-a").await.unwrap(), "z-1");
    }

    #[tokio::test]
    async fn missing_zone() {
        let server = MockServer::start().await;
        respond(&server, "listZones", 200, json!({"listzonesresponse": {}})).await;
        let err = client(&server).await.zone_id("zone-a").await.unwrap_err();
        assert!(matches!(err, Error::ZoneNotFound(zone) if zone == "zone-a"));
    }

    #[tokio::test]
    async fn unknown_os_type_lists_available_types() {
        let server = MockServer::start().await;
        respond(
            &server,
            "listOsTypes",
            200,
            json!({"listostypesresponse": {"count": 2, "ostype": [
                {"id": "1", "description": "Ubuntu 18.04 (64-bit)"},
                {"id": "2", "description": "Ubuntu 20.04 (64-bit)"}
            ]}}),
        )
        .await;
        let client = client(&server).await;
        assert_eq!(client.os_type_id("Ubuntu 20.04 (64-bit)").await.unwrap(), "2");

        match client.os_type_id("Plan 9").await.unwrap_err() {
            Error::UnknownOsType { name, available } => {
                assert_eq!(name, "Plan 9");
                assert_eq!(available.len(), 2);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn register_template_decodes_records() {
        let server = MockServer::start().await;
        respond(
            &server,
            "registerTemplate",
            200,
            json!({"registertemplateresponse": {"count": 1, "template": [
                {"id": "tpl-2", "name": "ubuntu-20", "isready": false, "status": "", "templatetag": "lineage"}
            ]}}),
        )
        .await;
        let records = client(&server)
            .await
            .register_template(&RegisterParams {
                name: "ubuntu-20".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "tpl-2");
        assert_eq!(records[0].tag, "lineage");
        assert!(!records[0].ready);
    }

    #[tokio::test]
    async fn api_errors_carry_error_text() {
        let server = MockServer::start().await;
        respond(
            &server,
            "deleteTemplate",
            431,
            json!({"deletetemplateresponse": {"errorcode": 431, "errortext": "Unable to find template"}}),
        )
        .await;
        match client(&server).await.delete_template("tpl-1").await.unwrap_err() {
            Error::Api { command, code, text } => {
                assert_eq!(command, "deleteTemplate");
                assert_eq!(code, 431);
                assert_eq!(text, "Unable to find template");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn undecodable_body_is_reported_with_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/client/api"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;
        let err = client(&server).await.zone_id("zone-a").await.unwrap_err();
        assert!(matches!(err, Error::Deserialize(502, body) if body == "bad gateway"));
    }

    #[tokio::test]
    async fn async_job_states() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("command", "queryAsyncJobResult"))
            .and(query_param("jobid", "job-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"queryasyncjobresultresponse": {"jobstatus": 1, "jobresult": {"success": true}}}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("command", "queryAsyncJobResult"))
            .and(query_param("jobid", "job-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"queryasyncjobresultresponse": {"jobstatus": 2, "jobresult": {"errortext": "denied"}}}),
            ))
            .mount(&server)
            .await;

        let client = client(&server).await;
        assert_eq!(
            client.query_async_job("job-1").await.unwrap(),
            JobStatus::Succeeded(json!({"success": true}))
        );
        assert_eq!(
            client.query_async_job("job-2").await.unwrap(),
            JobStatus::Failed("denied".into())
        );
    }
}
