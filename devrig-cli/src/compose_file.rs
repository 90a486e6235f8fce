//! Loader for the docker-compose subset devrig understands: per service an
//! image, environment, published ports and bind mounts. Anything else in
//! the file is ignored rather than rejected, so a stack shared with docker
//! compose itself keeps working.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use devrig_core::error::RigError;
use devrig_core::project::{ComposeProject, ComposeService, PortMapping, Protocol, VolumeMount};

#[derive(Debug, Error)]
pub enum ComposeFileError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Invalid(#[from] RigError),
}

#[derive(Debug, Deserialize)]
struct ComposeFile {
    #[serde(default)]
    name: Option<String>,
    services: BTreeMap<String, ServiceDef>,
}

#[derive(Debug, Deserialize)]
struct ServiceDef {
    image: String,
    #[serde(default)]
    environment: EnvSection,
    #[serde(default)]
    ports: Vec<PortEntry>,
    #[serde(default)]
    volumes: Vec<String>,
}

/// Compose allows both spellings; values in the map form may be any YAML
/// scalar.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EnvSection {
    Map(BTreeMap<String, serde_yaml::Value>),
    List(Vec<String>),
}

impl Default for EnvSection {
    fn default() -> Self {
        EnvSection::List(Vec::new())
    }
}

/// `- 5432` parses as a bare number, `- "8080:80/udp"` as a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortEntry {
    Short(u16),
    Long(String),
}

pub fn load(path: &Path, fallback_name: &str) -> Result<ComposeProject, ComposeFileError> {
    let content = std::fs::read_to_string(path)?;
    parse(&content, fallback_name)
}

pub fn parse(content: &str, fallback_name: &str) -> Result<ComposeProject, ComposeFileError> {
    let file: ComposeFile = serde_yaml::from_str(content)?;
    let name = file.name.unwrap_or_else(|| fallback_name.to_string());

    let mut services = Vec::new();
    for (service_name, def) in file.services {
        services.push(ComposeService {
            name: service_name,
            image: def.image,
            environment: parse_environment(def.environment),
            ports: def
                .ports
                .iter()
                .map(parse_port)
                .collect::<Result<_, _>>()?,
            volumes: def
                .volumes
                .iter()
                .map(|entry| parse_volume(entry))
                .collect::<Result<_, _>>()?,
        });
    }

    Ok(ComposeProject { name, services })
}

fn parse_environment(section: EnvSection) -> Vec<(String, String)> {
    match section {
        EnvSection::Map(map) => map
            .into_iter()
            .map(|(key, value)| (key, scalar_to_string(value)))
            .collect(),
        EnvSection::List(entries) => entries
            .into_iter()
            .filter_map(|entry| match entry.split_once('=') {
                Some((key, value)) => Some((key.to_string(), value.to_string())),
                // Bare key: pass the host value through, compose-style.
                None => std::env::var(&entry).ok().map(|value| (entry, value)),
            })
            .collect(),
    }
}

fn scalar_to_string(value: serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s,
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

fn parse_port(entry: &PortEntry) -> Result<PortMapping, RigError> {
    let raw = match entry {
        PortEntry::Short(port) => {
            return checked_mapping(*port, *port, Protocol::Tcp);
        }
        PortEntry::Long(raw) => raw,
    };

    let (spec, protocol) = match raw.rsplit_once('/') {
        Some((spec, protocol)) => (spec, protocol.parse::<Protocol>()?),
        None => (raw.as_str(), Protocol::Tcp),
    };

    let (published, target) = match spec.split_once(':') {
        Some((published, target)) => (parse_port_number(published)?, parse_port_number(target)?),
        None => {
            let port = parse_port_number(spec)?;
            (port, port)
        }
    };
    checked_mapping(published, target, protocol)
}

fn checked_mapping(published: u16, target: u16, protocol: Protocol) -> Result<PortMapping, RigError> {
    if published == 0 || target == 0 {
        return Err(RigError::InvalidArgument("port 0 is not addressable".into()));
    }
    Ok(PortMapping {
        published,
        target,
        protocol,
    })
}

fn parse_port_number(raw: &str) -> Result<u16, RigError> {
    raw.parse::<u16>()
        .map_err(|_| RigError::InvalidArgument(format!("bad port {raw:?}")))
}

fn parse_volume(entry: &str) -> Result<VolumeMount, RigError> {
    match entry.split_once(':') {
        Some((source, target)) if !source.is_empty() && !target.is_empty() => Ok(VolumeMount {
            source: source.to_string(),
            target: target.to_string(),
        }),
        _ => Err(RigError::InvalidArgument(format!(
            "bad volume {entry:?}, expected source:target"
        ))),
    }
}
