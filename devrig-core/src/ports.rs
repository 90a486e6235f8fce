//! Host-port conflict detection and deterministic remapping for compose
//! projects.
//!
//! Every declared port is probed by briefly binding it on all interfaces. A
//! port the host already holds gets an anonymous claim so its key counts as
//! conflicted even with a single service on it.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{TcpListener, UdpSocket};

use tracing::debug;

use crate::error::{Result, RigError};
use crate::project::{ComposeProject, Protocol};

/// One host-port claim. `service` is `None` for a synthetic claim standing
/// in for a port the host itself already holds.
#[derive(Clone, Debug, PartialEq)]
pub struct PortClaim {
    pub service: Option<String>,
    pub protocol: Protocol,
    pub port: u16,
}

/// Outcome of conflict resolution, pre-formatted for display above the
/// project's log stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PortResolution {
    pub conflicts: Vec<String>,
    pub remaps: Vec<String>,
}

impl PortResolution {
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty() && self.remaps.is_empty()
    }
}

/// Attempts to listen on `port`; failure classifies the port as in use.
pub fn probe_port(port: u16, protocol: Protocol) -> Result<bool> {
    if port == 0 {
        return Err(RigError::InvalidArgument("cannot probe port 0".into()));
    }
    Ok(match protocol {
        Protocol::Tcp => TcpListener::bind(("0.0.0.0", port)).is_ok(),
        Protocol::Udp => UdpSocket::bind(("0.0.0.0", port)).is_ok(),
    })
}

/// Groups the project's port claims by `"port/protocol"`. Services are
/// visited in name order and anonymous claims are inserted ahead of service
/// claims, so each group's order is deterministic.
pub fn collect_claims(project: &ComposeProject) -> Result<BTreeMap<String, Vec<PortClaim>>> {
    let mut services: Vec<_> = project.services.iter().collect();
    services.sort_by(|a, b| a.name.cmp(&b.name));

    let mut claims: BTreeMap<String, Vec<PortClaim>> = BTreeMap::new();
    for service in services {
        for mapping in &service.ports {
            let key = claim_key(mapping.published, mapping.protocol);
            let host_free = probe_port(mapping.published, mapping.protocol)?;
            let group = claims.entry(key).or_default();
            if !host_free && !group.iter().any(|claim| claim.service.is_none()) {
                group.push(PortClaim {
                    service: None,
                    protocol: mapping.protocol,
                    port: mapping.published,
                });
            }
            group.push(PortClaim {
                service: Some(service.name.clone()),
                protocol: mapping.protocol,
                port: mapping.published,
            });
        }
    }
    Ok(claims)
}

/// Rewrites conflicting published ports in place.
///
/// Keys are visited in lexicographic order. Within a conflicted group the
/// first claim keeps its port; each later named claim moves to the first of
/// the next ten consecutive ports that is free on the host and not reserved.
/// The reserved set is seeded with every claimed port so a remap can never
/// land on another group's kept port. A claim with no free candidate keeps
/// its original port.
pub fn resolve_port_conflicts(project: &mut ComposeProject) -> Result<PortResolution> {
    let claims = collect_claims(project)?;
    let mut reserved: BTreeSet<(u16, Protocol)> = claims
        .values()
        .flatten()
        .map(|claim| (claim.port, claim.protocol))
        .collect();

    let mut resolution = PortResolution::default();
    for (key, group) in &claims {
        if group.len() < 2 {
            continue;
        }
        let holders: Vec<&str> = group
            .iter()
            .map(|claim| claim.service.as_deref().unwrap_or("host"))
            .collect();
        resolution
            .conflicts
            .push(format!("port {key} claimed by {}", holders.join(", ")));

        for claim in group.iter().skip(1) {
            let Some(service) = &claim.service else {
                continue;
            };
            let mut chosen = None;
            for offset in 1..=10u16 {
                let Some(candidate) = claim.port.checked_add(offset) else {
                    break;
                };
                if reserved.contains(&(candidate, claim.protocol)) {
                    continue;
                }
                if probe_port(candidate, claim.protocol)? {
                    chosen = Some(candidate);
                    break;
                }
            }
            let Some(new_port) = chosen else {
                debug!(
                    service = %service,
                    port = claim.port,
                    "no free port within ten, claim keeps its port"
                );
                continue;
            };
            reserved.insert((new_port, claim.protocol));
            remap_service_port(project, service, claim.port, claim.protocol, new_port);
            resolution.remaps.push(format!(
                "service {service}: {}/{} remapped to {new_port}/{}",
                claim.port, claim.protocol, claim.protocol
            ));
        }
    }
    Ok(resolution)
}

fn claim_key(port: u16, protocol: Protocol) -> String {
    format!("{port}/{protocol}")
}

fn remap_service_port(
    project: &mut ComposeProject,
    service: &str,
    old_port: u16,
    protocol: Protocol,
    new_port: u16,
) {
    if let Some(svc) = project.service_mut(service) {
        for mapping in &mut svc.ports {
            if mapping.published == old_port && mapping.protocol == protocol {
                mapping.published = new_port;
                return;
            }
        }
    }
}
