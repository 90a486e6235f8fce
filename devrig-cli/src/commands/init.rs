//! `devrig init` - scaffolds a starter devrig.yml in the current directory.
//!
//! A light scan of the directory seeds the template: a compose file becomes
//! a compose task, a package.json or Cargo.toml becomes a process task.
//! The result is a starting point, not a finished config.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

const CONFIG_NAMES: [&str; 4] = ["devrig.yml", "devrig.yaml", ".devrig.yml", ".devrig.yaml"];
const COMPOSE_NAMES: [&str; 4] = [
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

#[derive(Debug, Default)]
struct Scan {
    project_name: Option<String>,
    compose_file: Option<String>,
    /// Task name plus the program and args that run it.
    process: Option<(String, String, Vec<String>)>,
}

pub fn run_init(force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("cannot determine current directory")?;
    run_init_in(&cwd, force)
}

fn run_init_in(dir: &Path, force: bool) -> Result<()> {
    for name in &CONFIG_NAMES {
        let path = dir.join(name);
        if path.exists() {
            if !force {
                bail!(
                    "config file {} already exists, use --force to overwrite",
                    path.display()
                );
            }
            println!("Overwriting existing config: {}", path.display());
        }
    }

    let scan = scan_directory(dir);
    if let Some(file) = &scan.compose_file {
        println!("Found compose file: {file}");
    }
    if let Some((name, program, args)) = &scan.process {
        println!("Found {name} task: {program} {}", args.join(" "));
    }

    let yaml = generate_yaml(&scan, dir);
    let output = dir.join("devrig.yml");
    fs::write(&output, &yaml).with_context(|| format!("cannot write {}", output.display()))?;

    println!("Created: {}", output.display());
    println!("Next steps:");
    println!("  1. Review and customize devrig.yml");
    println!("  2. Run `devrig run` to bring the workspace up");
    Ok(())
}

fn scan_directory(dir: &Path) -> Scan {
    let mut scan = Scan::default();

    for name in &COMPOSE_NAMES {
        if dir.join(name).exists() {
            scan.compose_file = Some(name.to_string());
            break;
        }
    }

    let package_json = dir.join("package.json");
    if package_json.exists() {
        if let Ok(content) = fs::read_to_string(&package_json) {
            scan.project_name = extract_json_string(&content, "name");
            let script = if content.contains("\"dev\"") {
                "dev"
            } else {
                "start"
            };
            scan.process = Some((
                "app".to_string(),
                "npm".to_string(),
                vec!["run".to_string(), script.to_string()],
            ));
        }
    }

    let cargo_toml = dir.join("Cargo.toml");
    if scan.process.is_none() && cargo_toml.exists() {
        if let Ok(content) = fs::read_to_string(&cargo_toml) {
            scan.project_name = scan
                .project_name
                .or_else(|| extract_toml_package_name(&content));
            scan.process = Some((
                "app".to_string(),
                "cargo".to_string(),
                vec!["run".to_string()],
            ));
        }
    }

    if scan.project_name.is_none() {
        scan.project_name = dir
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.to_string());
    }
    scan
}

fn extract_json_string(content: &str, key: &str) -> Option<String> {
    let pattern = format!("\"{key}\"");
    let idx = content.find(&pattern)?;
    let rest = content[idx + pattern.len()..].trim_start().strip_prefix(':')?;
    let rest = rest.trim_start().strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn extract_toml_package_name(content: &str) -> Option<String> {
    let mut in_package = false;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed == "[package]" {
            in_package = true;
            continue;
        }
        if in_package && trimmed.starts_with('[') {
            break;
        }
        if in_package && trimmed.starts_with("name") {
            let value = trimmed.split('=').nth(1)?.trim();
            return Some(value.trim_matches('"').trim_matches('\'').to_string());
        }
    }
    None
}

fn generate_yaml(scan: &Scan, dir: &Path) -> String {
    let mut yaml = String::new();
    yaml.push_str("# devrig configuration\n");
    yaml.push_str("# Generated by `devrig init`\n\n");
    yaml.push_str("version: \"1\"\n");

    let name = scan.project_name.as_deref().unwrap_or("workspace");
    yaml.push_str(&format!("name: {name}\n\n"));

    yaml.push_str("# Build steps run before start and restart.\n");
    yaml.push_str("build: []\n\n");

    yaml.push_str("tasks:\n");
    let mut wrote_task = false;

    if let Some((task, program, args)) = &scan.process {
        wrote_task = true;
        yaml.push_str(&format!("  - name: {task}\n"));
        yaml.push_str("    kind: process\n");
        yaml.push_str(&format!("    command: {program}\n"));
        let rendered = args
            .iter()
            .map(|arg| format!("\"{arg}\""))
            .collect::<Vec<_>>()
            .join(", ");
        yaml.push_str(&format!("    args: [{rendered}]\n"));
        yaml.push_str("    # init_once:\n");
        yaml.push_str("    #   - npm install\n");
        yaml.push_str("    # init:\n");
        yaml.push_str("    #   - echo started\n");
    }

    if let Some(file) = &scan.compose_file {
        wrote_task = true;
        yaml.push_str("  - name: stack\n");
        yaml.push_str("    kind: compose\n");
        yaml.push_str(&format!("    file: {file}\n"));
    }

    if !wrote_task {
        let dir_name = dir
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("app");
        yaml.push_str(&format!("  - name: {dir_name}\n"));
        yaml.push_str("    kind: process\n");
        yaml.push_str("    command: sh\n");
        yaml.push_str("    args: [\"-c\", \"echo hello from devrig; sleep 3600\"]\n");
    }

    yaml
}
