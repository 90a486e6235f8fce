//! In-memory form of a parsed compose document. The CLI loads the file;
//! the core only ever sees this structure.

use std::fmt;
use std::str::FromStr;

use crate::error::RigError;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComposeProject {
    pub name: String,
    pub services: Vec<ComposeService>,
}

impl ComposeProject {
    pub fn service(&self, name: &str) -> Option<&ComposeService> {
        self.services.iter().find(|svc| svc.name == name)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut ComposeService> {
        self.services.iter_mut().find(|svc| svc.name == name)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComposeService {
    pub name: String,
    pub image: String,
    pub environment: Vec<(String, String)>,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeMount>,
}

/// One published host port for a service container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortMapping {
    /// Host side; the conflict resolver may move this.
    pub published: u16,
    /// Container side; never touched.
    pub target: u16,
    pub protocol: Protocol,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(RigError::InvalidProtocol(other.to_string())),
        }
    }
}
