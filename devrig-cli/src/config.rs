//! devrig.yml loading and validation.
//!
//! Tasks are a list, not a map: declaration order is the shutdown order and
//! the reverse of the start order, so it has to survive parsing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("no config file found, searched: {searched:?}")]
    NotFound { searched: Vec<PathBuf> },
    #[error("config declares no tasks")]
    NoTasks,
    #[error("task '{0}' is declared more than once")]
    DuplicateTask(String),
    #[error("task '{task}': {problem}")]
    InvalidTask { task: String, problem: String },
    #[error("no task named '{0}' in the config")]
    UnknownTask(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// One OS subprocess.
    #[default]
    Process,
    /// A container project described by a compose file.
    Compose,
}

/// One subordinate helper started alongside a process task.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WatchConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// One task entry. Which fields matter depends on `kind`; `validate`
/// enforces the split.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(default)]
    pub kind: TaskKind,

    /// Process tasks: executable to run.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Replaces the subprocess PATH when set and non-empty.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub init_once: Vec<String>,
    #[serde(default)]
    pub init: Vec<String>,
    #[serde(default)]
    pub watch: Vec<WatchConfig>,

    /// Compose tasks: path to the compose file, relative to the config.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Root structure of devrig.yml.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RigConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Shell steps run before tasks on start and restart.
    #[serde(default)]
    pub build: Vec<String>,
    pub tasks: Vec<TaskConfig>,
}

fn default_version() -> String {
    "1".into()
}

impl RigConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: RigConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Searches `start_dir` and its parents for a config file;
    /// `DEVRIG_CONFIG` wins when it points at an existing file.
    pub fn discover(start_dir: &Path) -> Result<(PathBuf, Self), ConfigError> {
        let names = ["devrig.yml", "devrig.yaml", ".devrig.yml", ".devrig.yaml"];
        let mut searched = Vec::new();

        if let Ok(env_path) = std::env::var("DEVRIG_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok((path.clone(), Self::load(&path)?));
            }
            searched.push(path);
        }

        let mut dir = Some(start_dir);
        while let Some(current) = dir {
            for name in &names {
                let path = current.join(name);
                if path.exists() {
                    return Ok((path.clone(), Self::load(&path)?));
                }
                searched.push(path);
            }
            dir = current.parent();
        }

        Err(ConfigError::NotFound { searched })
    }

    pub fn task(&self, name: &str) -> Result<&TaskConfig, ConfigError> {
        self.tasks
            .iter()
            .find(|task| task.name == name)
            .ok_or_else(|| ConfigError::UnknownTask(name.to_string()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tasks.is_empty() {
            return Err(ConfigError::NoTasks);
        }

        let mut seen = BTreeSet::new();
        for task in &self.tasks {
            if task.name.is_empty() {
                return Err(ConfigError::InvalidTask {
                    task: "<unnamed>".into(),
                    problem: "name must not be empty".into(),
                });
            }
            if !seen.insert(task.name.as_str()) {
                return Err(ConfigError::DuplicateTask(task.name.clone()));
            }
            task.validate()?;
        }
        Ok(())
    }
}

impl TaskConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let fail = |problem: &str| {
            Err(ConfigError::InvalidTask {
                task: self.name.clone(),
                problem: problem.into(),
            })
        };
        match self.kind {
            TaskKind::Process => {
                if self.command.as_deref().unwrap_or("").is_empty() {
                    return fail("process task needs a command");
                }
                if self.file.is_some() {
                    return fail("'file' only applies to compose tasks");
                }
                for watch in &self.watch {
                    if watch.name.is_empty() || watch.command.is_empty() {
                        return fail("watch entries need a name and a command");
                    }
                }
            }
            TaskKind::Compose => {
                if self.file.is_none() {
                    return fail("compose task needs a file");
                }
                if self.command.is_some() {
                    return fail("'command' only applies to process tasks");
                }
                if !self.watch.is_empty() {
                    return fail("watch entries only apply to process tasks");
                }
                if !self.init.is_empty() || !self.init_once.is_empty() {
                    return fail("init scripts only apply to process tasks");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_config() {
        let yaml = r#"
version: "1"
name: shop
build:
  - cargo build --workspace
tasks:
  - name: api
    command: cargo
    args: [run, -p, api]
    dir: services/api
    env:
      RUST_LOG: debug
"#;
        let config = RigConfig::parse(yaml).unwrap();
        assert_eq!(config.name.as_deref(), Some("shop"));
        assert_eq!(config.build, vec!["cargo build --workspace"]);
        let task = &config.tasks[0];
        assert_eq!(task.kind, TaskKind::Process);
        assert_eq!(task.command.as_deref(), Some("cargo"));
        assert_eq!(task.env.get("RUST_LOG").map(String::as_str), Some("debug"));
    }

    #[test]
    fn test_task_order_is_preserved() {
        let yaml = r#"
tasks:
  - name: zulu
    command: z
  - name: alpha
    command: a
  - name: mike
    command: m
"#;
        let config = RigConfig::parse(yaml).unwrap();
        let names: Vec<&str> = config.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["zulu", "alpha", "mike"]);
    }

    #[test]
    fn test_duplicate_task_names_are_rejected() {
        let yaml = r#"
tasks:
  - name: api
    command: cargo
  - name: api
    command: node
"#;
        assert!(matches!(
            RigConfig::parse(yaml),
            Err(ConfigError::DuplicateTask(name)) if name == "api"
        ));
    }

    #[test]
    fn test_process_task_without_command_is_rejected() {
        let yaml = r#"
tasks:
  - name: api
"#;
        assert!(matches!(
            RigConfig::parse(yaml),
            Err(ConfigError::InvalidTask { .. })
        ));
    }

    #[test]
    fn test_compose_task_requires_a_file() {
        let yaml = r#"
tasks:
  - name: stack
    kind: compose
"#;
        assert!(matches!(
            RigConfig::parse(yaml),
            Err(ConfigError::InvalidTask { .. })
        ));
    }

    #[test]
    fn test_compose_task_parses() {
        let yaml = r#"
tasks:
  - name: stack
    kind: compose
    file: docker-compose.yml
"#;
        let config = RigConfig::parse(yaml).unwrap();
        assert_eq!(config.tasks[0].kind, TaskKind::Compose);
        assert_eq!(
            config.tasks[0].file.as_deref(),
            Some(Path::new("docker-compose.yml"))
        );
    }

    #[test]
    fn test_watch_subtasks_parse() {
        let yaml = r#"
tasks:
  - name: web
    command: npm
    args: [start]
    watch:
      - name: assets
        command: npm
        args: [run, watch]
"#;
        let config = RigConfig::parse(yaml).unwrap();
        assert_eq!(config.tasks[0].watch.len(), 1);
        assert_eq!(config.tasks[0].watch[0].name, "assets");
    }

    #[test]
    fn test_empty_task_list_is_rejected() {
        assert!(matches!(
            RigConfig::parse("tasks: []"),
            Err(ConfigError::NoTasks)
        ));
    }

    #[test]
    fn test_init_scripts_on_compose_task_are_rejected() {
        let yaml = r#"
tasks:
  - name: stack
    kind: compose
    file: docker-compose.yml
    init:
      - echo nope
"#;
        assert!(matches!(
            RigConfig::parse(yaml),
            Err(ConfigError::InvalidTask { .. })
        ));
    }
}
