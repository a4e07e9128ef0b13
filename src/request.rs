use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use Error::*;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("no zones have been set for the {0} environment, please specify a list of zones")]
    MissingZones(String),

    #[error("api url was not passed for the {0} environment")]
    MissingApiUrl(String),

    #[error("api key was not passed for the {0} environment")]
    MissingApiKey(String),

    #[error("api secret was not passed for the {0} environment")]
    MissingApiSecret(String),

    #[error("template name must be set")]
    MissingName,

    #[error("display text must be set")]
    MissingDisplayText,

    #[error("format must be set")]
    MissingFormat,

    #[error("unsupported format {0}: supported formats are QCOW2, RAW, VHD and OVA")]
    UnsupportedFormat(String),

    #[error("hypervisor must be set")]
    MissingHypervisor,

    #[error("os type must be set")]
    MissingOsType,

    #[error("host ip must be set and must be reachable by cloudstack")]
    MissingHostIp,
}

/// Errors reading or writing a `template.yml` file.
#[derive(Error, Debug)]
pub enum FileError {
    #[error("read {path}: {err}")]
    Read { err: std::io::Error, path: String },

    #[error("write {path}: {err}")]
    Write { err: std::io::Error, path: String },

    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Disk image formats CloudStack accepts for registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vhd,
    Ova,
}

impl DiskFormat {
    /// File extension used for the staged copy of the image.
    pub fn extension(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "img",
            DiskFormat::Vhd => "vhd",
            DiskFormat::Ova => "ova",
        }
    }
}

impl FromStr for DiskFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "QCOW2" => Ok(DiskFormat::Qcow2),
            "RAW" => Ok(DiskFormat::Raw),
            "VHD" => Ok(DiskFormat::Vhd),
            "OVA" => Ok(DiskFormat::Ova),
            "" => Err(MissingFormat),
            _ => Err(UnsupportedFormat(s.to_string())),
        }
    }
}

impl Display for DiskFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DiskFormat::Qcow2 => "QCOW2",
            DiskFormat::Raw => "RAW",
            DiskFormat::Vhd => "VHD",
            DiskFormat::Ova => "OVA",
        })
    }
}

/// One CloudStack installation and the zones to publish into.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Environment {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "apiURL", default)]
    pub api_url: String,
    #[serde(rename = "apiSecret", default)]
    pub api_secret: String,
    #[serde(rename = "apiKey", default)]
    pub api_key: String,
    #[serde(default)]
    pub zones: Vec<String>,
}

impl Environment {
    pub fn targets(&self) -> impl Iterator<Item = PublishTarget> + '_ {
        self.zones.iter().map(|zone| PublishTarget {
            environment: self.name.clone(),
            zone: zone.clone(),
        })
    }
}

/// An (environment, zone) pair being published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub environment: String,
    pub zone: String,
}

impl Display for PublishTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.environment, self.zone)
    }
}

/// A `template.yml` file: what to publish, and where.
#[serde_inline_default]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(rename = "hostIP", default)]
    pub host_ip: String,
    #[serde(default)]
    pub template_file: String,
    #[serde(rename = "templateID", default)]
    pub template_id: String,
    #[serde(default)]
    pub os_type: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub hypervisor: String,
    #[serde(default)]
    pub display_text: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_featured: bool,
    #[serde(default)]
    pub password_enabled: bool,
    #[serde(default)]
    pub is_dynamic: bool,
    #[serde_inline_default(true)]
    pub is_extractable: bool,
    #[serde(default)]
    pub is_routing: bool,
    #[serde(rename = "requiresHVM", default)]
    pub requires_hvm: bool,
    #[serde(default)]
    pub ssh_key_enabled: bool,
    #[serde(rename = "projectID", default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub template_tag: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_tags: BTreeMap<String, String>,
}

impl Default for PublishRequest {
    fn default() -> Self {
        Self {
            name: String::new(),
            environments: vec![],
            host_ip: String::new(),
            template_file: String::new(),
            template_id: String::new(),
            os_type: String::new(),
            format: String::new(),
            hypervisor: String::new(),
            display_text: String::new(),
            is_public: false,
            is_featured: false,
            password_enabled: false,
            is_dynamic: false,
            is_extractable: true,
            is_routing: false,
            requires_hvm: false,
            ssh_key_enabled: false,
            project_id: None,
            template_tag: String::new(),
            resource_tags: BTreeMap::new(),
        }
    }
}

impl PublishRequest {
    pub fn parse(yaml_string: &str) -> Result<Self, FileError> {
        Ok(serde_yaml::from_str(yaml_string)?)
    }

    pub fn parse_file(path: &str) -> Result<Self, FileError> {
        Self::parse(&std::fs::read_to_string(path).map_err(|err| FileError::Read {
            err,
            path: path.to_string(),
        })?)
    }

    pub fn write_file(&self, path: &str) -> Result<(), FileError> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml).map_err(|err| FileError::Write {
            err,
            path: path.to_string(),
        })
    }

    /// Check that every field the publish run depends on is present.
    pub fn required_fields_passed(&self) -> Result<(), Error> {
        for e in &self.environments {
            if e.zones.is_empty() {
                return Err(MissingZones(e.name.clone()));
            }
            if e.api_url.is_empty() {
                return Err(MissingApiUrl(e.name.clone()));
            }
            if e.api_key.is_empty() {
                return Err(MissingApiKey(e.name.clone()));
            }
            if e.api_secret.is_empty() {
                return Err(MissingApiSecret(e.name.clone()));
            }
        }

        if self.name.is_empty() {
            return Err(MissingName);
        }
        if self.display_text.is_empty() {
            return Err(MissingDisplayText);
        }
        self.disk_format()?;
        if self.hypervisor.is_empty() {
            return Err(MissingHypervisor);
        }
        if self.os_type.is_empty() {
            return Err(MissingOsType);
        }
        if self.host_ip.is_empty() {
            return Err(MissingHostIp);
        }

        Ok(())
    }

    pub fn disk_format(&self) -> Result<DiskFormat, Error> {
        self.format.parse()
    }

    /// Name of the image once it is staged in the web root, e.g. `ubuntu-20.qcow2`.
    pub fn staged_file_name(&self) -> Result<String, Error> {
        Ok(format!("{}.{}", self.name, self.disk_format()?.extension()))
    }

    /// Fill in credentials given on the command line or in the environment.
    ///
    /// Environments listed in the file keep any value they already have. If the file
    /// lists no environments, a single `default` environment is created from the
    /// credentials and `zones`, provided an endpoint was given.
    pub fn apply_credentials(&mut self, credentials: &Credentials, zones: &[String]) {
        if self.environments.is_empty() {
            if let Some(api_url) = &credentials.api_url {
                self.environments.push(Environment {
                    name: "default".into(),
                    api_url: api_url.clone(),
                    api_key: credentials.api_key.clone().unwrap_or_default(),
                    api_secret: credentials.api_secret.clone().unwrap_or_default(),
                    zones: zones.to_vec(),
                });
            }
            return;
        }

        for e in self.environments.iter_mut() {
            fill(&mut e.api_url, &credentials.api_url);
            fill(&mut e.api_key, &credentials.api_key);
            fill(&mut e.api_secret, &credentials.api_secret);
            if e.zones.is_empty() {
                e.zones = zones.to_vec();
            }
        }
    }
}

fn fill(field: &mut String, value: &Option<String>) {
    if field.is_empty() {
        if let Some(value) = value {
            *field = value.clone();
        }
    }
}

/// CloudStack credentials from flags or `CLOUDSTACK_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}
