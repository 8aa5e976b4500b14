//! Demo descriptor configuration

mod demo;

pub use demo::{
    CameraConfig, DemoKind, DemoOverrides, DemoSpec, DeployConfig, HealthConfig, RunConfig,
    ScriptSource,
};

use crate::error::ConfigError;
use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Top-level shape of a demo catalog file
#[derive(Debug, Deserialize)]
struct DemoCatalog {
    #[serde(default, rename = "demo")]
    demos: Vec<DemoSpec>,
}

/// Validated set of available demos, keyed by id
#[derive(Debug, Default)]
pub struct DemoRegistry {
    demos: HashMap<String, DemoSpec>,
}

impl DemoRegistry {
    /// Build a registry, validating every spec once at load time.
    pub fn new(specs: Vec<DemoSpec>) -> Result<Self, ConfigError> {
        let mut demos = HashMap::new();
        for spec in specs {
            spec.validate()?;
            if demos.insert(spec.id.clone(), spec).is_some() {
                return Err(ConfigError::Invalid("duplicate demo id".to_string()));
            }
        }
        Ok(Self { demos })
    }

    pub fn get(&self, demo_id: &str) -> Option<&DemoSpec> {
        self.demos.get(demo_id)
    }

    pub fn list(&self) -> Vec<&DemoSpec> {
        self.demos.values().collect()
    }

    pub fn len(&self) -> usize {
        self.demos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.demos.is_empty()
    }
}

/// Load and validate a demo catalog from a TOML file
pub fn load_demos(path: &Path) -> Result<DemoRegistry, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read demo catalog: {}", e)))?;

    let catalog: DemoCatalog = toml::from_str(&content)?;
    DemoRegistry::new(catalog.demos)
}
