//! Workflow loader
//!
//! Load and validate workflow definitions from YAML files, directories or
//! strings.

use std::path::Path;

use super::WorkflowDefinition;
use crate::engine::GraphError;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error in {file}: {error}")]
    Yaml {
        file: String,
        error: serde_yaml::Error,
    },

    #[error("Invalid workflow in {file}: {error}")]
    Invalid { file: String, error: GraphError },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub struct WorkflowLoader;

impl WorkflowLoader {
    /// Load every `.yaml`/`.yml` definition in `dir`, sorted by file name
    pub fn load_directory(dir: &Path) -> Result<Vec<WorkflowDefinition>, LoadError> {
        let mut paths = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }

            let ext = path.extension().and_then(|e| e.to_str());
            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

            // runner.yaml is engine configuration, not a workflow
            if filename == "runner.yaml" || filename == "runner.yml" {
                continue;
            }

            if ext == Some("yaml") || ext == Some("yml") {
                paths.push(path);
            }
        }

        paths.sort();
        paths.iter().map(|path| Self::load_file(path)).collect()
    }

    pub fn load_file(path: &Path) -> Result<WorkflowDefinition, LoadError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, &path.display().to_string())
    }

    pub fn from_yaml(yaml: &str) -> Result<WorkflowDefinition, LoadError> {
        Self::parse(yaml, "<inline>")
    }

    fn parse(content: &str, file: &str) -> Result<WorkflowDefinition, LoadError> {
        let definition: WorkflowDefinition =
            serde_yaml::from_str(content).map_err(|e| LoadError::Yaml {
                file: file.to_string(),
                error: e,
            })?;

        definition.validate().map_err(|error| LoadError::Invalid {
            file: file.to_string(),
            error,
        })?;

        Ok(definition)
    }
}
