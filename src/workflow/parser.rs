//! Workflow Definition Loading
//!
//! Reads workflow definitions from YAML files. JSON documents are accepted
//! too since they are valid YAML.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

use super::model::WorkflowDefinition;

/// Errors raised while loading a workflow definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error(
        "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
        .path.display(),
        .source
    )]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse workflow definition: {0}. Check the file format.")]
    Parse(#[from] serde_yaml::Error),
}

/// Parses a workflow definition from YAML or JSON text.
pub fn parse_definition(text: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let definition: WorkflowDefinition = serde_yaml::from_str(text)?;

    debug!(
        "Parsed workflow '{}' ({} steps, continue_on_error: {})",
        definition.workflow_id,
        definition.steps.len(),
        definition.continue_on_error
    );

    Ok(definition)
}

/// Loads a workflow definition from a file.
///
/// # Example
///
/// ```rust,no_run
/// use waverunner::workflow::load_definition;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_definition("pipeline.yaml")?;
///     println!("Loaded {} steps", definition.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_definition(path: impl AsRef<Path>) -> Result<WorkflowDefinition, DefinitionError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| DefinitionError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    debug!("Definition content loaded ({} bytes)", content.len());

    let definition = parse_definition(&content)?;

    info!(
        "Workflow '{}' loaded: {} steps",
        definition.workflow_id,
        definition.steps.len()
    );

    Ok(definition)
}
