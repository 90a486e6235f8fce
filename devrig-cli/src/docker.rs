//! Docker-backed [`ComposeRuntime`] built on bollard.
//!
//! One container per service, named `{project}-{service}-1`, attached to a
//! `{project}_default` network with the service name as DNS alias. Images
//! are pulled on demand; a stale container with our name is force-removed
//! before create. `down` stops and removes everything, then the network.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, NetworkingConfig, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig, PortBinding};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::debug;

use devrig_core::cancel::CancelToken;
use devrig_core::compose::{ComposeRuntime, LogConsumer};
use devrig_core::error::{Result, RigError};
use devrig_core::project::{ComposeProject, ComposeService, PortMapping};

#[derive(Clone)]
pub struct DockerCompose {
    client: Docker,
}

impl DockerCompose {
    /// Connects to the local daemon and verifies it answers a ping.
    pub async fn connect() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|error| compose_err("docker", "connect", &error))?;
        client
            .ping()
            .await
            .map_err(|error| compose_err("docker", "ping", &error))?;
        Ok(Self { client })
    }

    async fn ensure_image(&self, project: &str, image: &str) -> Result<()> {
        if self.client.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        debug!(%image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull = self.client.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            progress.map_err(|error| compose_err(project, &format!("pull {image}"), &error))?;
        }
        Ok(())
    }

    async fn ensure_network(&self, project: &str) -> Result<()> {
        let network = network_name(project);
        if self
            .client
            .inspect_network(&network, None::<InspectNetworkOptions<String>>)
            .await
            .is_ok()
        {
            return Ok(());
        }
        let options = CreateNetworkOptions {
            name: network.clone(),
            ..Default::default()
        };
        self.client
            .create_network(options)
            .await
            .map_err(|error| compose_err(project, &format!("network {network}"), &error))?;
        Ok(())
    }

    async fn up_service(&self, project: &ComposeProject, service: &ComposeService) -> Result<()> {
        self.ensure_image(&project.name, &service.image).await?;

        let container = container_name(&project.name, &service.name);
        // A previous run may have left its container behind.
        self.client
            .remove_container(
                &container,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .ok();

        let env: Vec<String> = service
            .environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for mapping in &service.ports {
            exposed_ports.insert(port_key(mapping), HashMap::new());
            port_bindings.insert(port_key(mapping), Some(vec![host_binding(mapping)]));
        }

        let binds: Vec<String> = service
            .volumes
            .iter()
            .map(|mount| bind_spec(&mount.source, &mount.target))
            .collect();

        let network = network_name(&project.name);
        let mut endpoints_config = HashMap::new();
        endpoints_config.insert(
            network.clone(),
            EndpointSettings {
                aliases: Some(vec![service.name.clone()]),
                ..Default::default()
            },
        );

        let config = Config {
            image: Some(service.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                binds: if binds.is_empty() { None } else { Some(binds) },
                network_mode: Some(network),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig { endpoints_config }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container.clone(),
            platform: None,
        };
        let response = self
            .client
            .create_container(Some(create_options), config)
            .await
            .map_err(|error| compose_err(&project.name, &format!("create {container}"), &error))?;

        self.client
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|error| compose_err(&project.name, &format!("start {container}"), &error))?;

        debug!(%container, "container started");
        Ok(())
    }

    async fn down_service(&self, project: &ComposeProject, service: &ComposeService) -> Result<()> {
        let container = container_name(&project.name, &service.name);
        let stopped = self
            .client
            .stop_container(&container, Some(StopContainerOptions { t: 10 }))
            .await;
        match stopped {
            Ok(()) => {}
            // Never created or already gone; nothing to tear down.
            Err(error) if is_not_found(&error) => return Ok(()),
            Err(error) => {
                return Err(compose_err(
                    &project.name,
                    &format!("stop {container}"),
                    &error,
                ));
            }
        }
        self.client
            .remove_container(
                &container,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .ok();
        debug!(%container, "container removed");
        Ok(())
    }
}

#[async_trait]
impl ComposeRuntime for DockerCompose {
    async fn up(&self, project: &ComposeProject) -> Result<()> {
        self.ensure_network(&project.name).await?;
        for service in &project.services {
            self.up_service(project, service).await?;
        }
        Ok(())
    }

    /// Every service is attempted; the first error is kept and returned
    /// after the rest have had their chance.
    async fn down(&self, project: &ComposeProject) -> Result<()> {
        let mut first_err = None;
        for service in &project.services {
            if let Err(err) = self.down_service(project, service).await {
                first_err.get_or_insert(err);
            }
        }
        let network = network_name(&project.name);
        if let Err(error) = self.client.remove_network(&network).await {
            if !is_not_found(&error) {
                first_err.get_or_insert(compose_err(
                    &project.name,
                    &format!("remove network {network}"),
                    &error,
                ));
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn logs(
        &self,
        project: &ComposeProject,
        consumer: Arc<dyn LogConsumer>,
        cancel: CancelToken,
    ) -> Result<()> {
        let mut tails = Vec::new();
        for service in &project.services {
            let container = container_name(&project.name, &service.name);
            let name = service.name.clone();
            let client = self.client.clone();
            let consumer = Arc::clone(&consumer);
            tails.push(tokio::spawn(async move {
                consumer.register(&name);
                let options = LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                };
                let mut stream = client.logs(&container, Some(options));
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(output) => {
                            let text = output.to_string();
                            for line in text.lines() {
                                consumer.log(&name, line);
                            }
                        }
                        Err(error) => {
                            consumer.status(&name, &format!("log stream error: {error}"));
                            break;
                        }
                    }
                }
            }));
        }

        cancel.cancelled().await;
        for tail in tails {
            tail.abort();
        }
        Ok(())
    }
}

fn compose_err(project: &str, context: &str, error: &impl std::fmt::Display) -> RigError {
    RigError::Compose {
        project: project.to_string(),
        message: format!("{context}: {error}"),
    }
}

fn is_not_found(error: &DockerError) -> bool {
    matches!(
        error,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn container_name(project: &str, service: &str) -> String {
    format!("{project}-{service}-1")
}

fn network_name(project: &str) -> String {
    format!("{project}_default")
}

fn port_key(mapping: &PortMapping) -> String {
    format!("{}/{}", mapping.target, mapping.protocol)
}

fn host_binding(mapping: &PortMapping) -> PortBinding {
    PortBinding {
        host_ip: Some("0.0.0.0".to_string()),
        host_port: Some(mapping.published.to_string()),
    }
}

/// Compose bind-mount semantics: absolute and dot-relative sources are host
/// paths (relative ones resolved against the working directory), anything
/// else is a named volume docker creates on demand.
fn bind_spec(source: &str, target: &str) -> String {
    if source.starts_with('.') {
        let absolute = std::env::current_dir()
            .map(|dir| dir.join(source))
            .unwrap_or_else(|_| source.into());
        format!("{}:{}", absolute.display(), target)
    } else {
        format!("{source}:{target}")
    }
}
