//! `devrig clean` - tears down leftover containers for the configured
//! compose tasks. Useful after a crash left the stack running.

use std::path::Path;

use anyhow::{Context, Result};

use devrig_core::compose::ComposeRuntime;

use crate::compose_file;
use crate::config::{RigConfig, TaskKind};
use crate::docker::DockerCompose;

pub async fn run_clean(config: &RigConfig, base_dir: &Path) -> Result<()> {
    let compose_tasks: Vec<_> = config
        .tasks
        .iter()
        .filter(|task| task.kind == TaskKind::Compose)
        .collect();
    if compose_tasks.is_empty() {
        println!("No compose tasks configured, nothing to clean.");
        return Ok(());
    }

    let runtime = DockerCompose::connect().await?;
    let mut first_err = None;
    for task in compose_tasks {
        let file = task
            .file
            .as_ref()
            .context("compose task without a file survived validation")?;
        let project = compose_file::load(&base_dir.join(file), &task.name)
            .with_context(|| format!("cannot load {}", file.display()))?;
        match runtime.down(&project).await {
            Ok(()) => println!("Cleaned compose project {}", project.name),
            Err(err) => {
                eprintln!("Failed to clean {}: {err}", project.name);
                first_err.get_or_insert(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
