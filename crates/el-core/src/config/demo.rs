//! Strongly-typed demo descriptors
//!
//! Every option is a named field with an explicit default resolved here at
//! the boundary; orchestration code never re-derives defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// One installable/runnable demo
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub deploy: DeployConfig,
    pub run: RunConfig,
}

impl DemoSpec {
    /// Validate once at load; orchestrators may assume a valid spec.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::Invalid("demo id must not be empty".into()));
        }
        if self.deploy.remote_dir.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "demo {}: deploy.remote_dir must not be empty",
                self.id
            )));
        }
        match self.run.kind {
            DemoKind::Script => {
                if self.run.payload.is_none() || self.run.interpreter.is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "demo {}: script kind requires run.payload and run.interpreter",
                        self.id
                    )));
                }
            }
            DemoKind::Service => {
                if self.run.binary.is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "demo {}: service kind requires run.binary",
                        self.id
                    )));
                }
            }
        }
        if self.run.health.scheme != "http" && self.run.health.scheme != "https" {
            return Err(ConfigError::Invalid(format!(
                "demo {}: health.scheme must be http or https",
                self.id
            )));
        }
        Ok(())
    }

    /// Install directory for a session, honoring an operator override.
    pub fn remote_dir<'a>(&'a self, overrides: Option<&'a DemoOverrides>) -> &'a str {
        overrides
            .and_then(|o| o.remote_dir.as_deref())
            .unwrap_or(&self.deploy.remote_dir)
    }
}

/// Per-session operator overrides for one demo
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DemoOverrides {
    /// Operator-chosen remote install directory
    #[serde(default)]
    pub remote_dir: Option<String>,
}

/// Where the install script's bytes come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptSource {
    /// Local file on the control host
    Path(PathBuf),
    /// Literal URL; GitHub blob URLs are rewritten to raw-content URLs
    Url(String),
    /// Repository + ref + path triple resolved to a raw-content URL
    Repo {
        repo: String,
        rev: String,
        path: String,
    },
}

impl ScriptSource {
    /// Resolve to a fetchable URL, or `None` for a local path.
    ///
    /// `https://github.com/<owner>/<repo>/blob/<rev>/<path>` becomes
    /// `https://raw.githubusercontent.com/<owner>/<repo>/<rev>/<path>`.
    pub fn resolved_url(&self) -> Option<String> {
        match self {
            Self::Path(_) => None,
            Self::Url(url) => {
                if let Some(rest) = url
                    .strip_prefix("https://github.com/")
                    .or_else(|| url.strip_prefix("http://github.com/"))
                {
                    if let Some((repo, path)) = rest.split_once("/blob/") {
                        return Some(format!(
                            "https://raw.githubusercontent.com/{}/{}",
                            repo, path
                        ));
                    }
                }
                Some(url.clone())
            }
            Self::Repo { repo, rev, path } => Some(format!(
                "https://raw.githubusercontent.com/{}/{}/{}",
                repo, rev, path
            )),
        }
    }
}

/// Deploy-time configuration for one demo
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Target directory on the device
    pub remote_dir: String,
    /// Install script source
    pub script: ScriptSource,
    /// Name the script is uploaded as
    #[serde(default = "default_script_name")]
    pub remote_script_name: String,
    /// Run the install script elevated
    #[serde(default)]
    pub run_as_sudo: bool,
    /// Optional marker file recording `installed_at`/`version`
    #[serde(default)]
    pub marker_path: Option<String>,
    /// Version string recorded in the marker file
    #[serde(default)]
    pub version: Option<String>,
    /// Optional command whose zero exit means "already installed"
    #[serde(default)]
    pub install_check: Option<String>,
}

fn default_script_name() -> String {
    "setup.sh".to_string()
}

/// How a demo's workload is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemoKind {
    /// Upload a payload file and invoke it with a configured interpreter
    Script,
    /// Discover an already-installed executable on the device
    Service,
}

/// Camera parameters passed to script-kind payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub source: String,
    pub usb_index: u32,
    pub width: u32,
    pub height: u32,
    pub flip: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: "usb".to_string(),
            usb_index: 0,
            width: 1280,
            height: 720,
            flip: 0,
        }
    }
}

/// Run-time configuration for one demo
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub kind: DemoKind,
    /// Port the workload is asked to listen on
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    /// Script kind: local payload file uploaded before launch
    #[serde(default)]
    pub payload: Option<PathBuf>,
    /// Script kind: interpreter path relative to the install dir
    #[serde(default)]
    pub interpreter: Option<String>,
    /// Service kind: executable name looked up on the device
    #[serde(default)]
    pub binary: Option<String>,
    /// Service kind: well-known install locations probed before `PATH`
    #[serde(default)]
    pub candidate_paths: Vec<String>,
    /// Extra arguments appended to the launch command
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub camera: CameraConfig,
    /// Model file path relative to the install dir (script kind)
    #[serde(default)]
    pub model: Option<String>,
    /// Pattern for kill-by-pattern fallback; derived from the payload or
    /// binary name when unset
    #[serde(default)]
    pub process_pattern: Option<String>,
    /// How long to wait for a service-kind process to start listening
    #[serde(default = "default_startup_timeout", with = "duration_secs")]
    pub startup_timeout: Duration,
    #[serde(default)]
    pub health: HealthConfig,
}

fn default_remote_port() -> u16 {
    8090
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(30)
}

impl RunConfig {
    /// Identifier used to match or kill the remote process when the pid is
    /// unknown.
    pub fn process_identifier(&self) -> String {
        if let Some(pattern) = &self.process_pattern {
            return pattern.clone();
        }
        if let Some(binary) = &self.binary {
            return binary.clone();
        }
        self.payload
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Health-gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub scheme: String,
    pub path: String,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// Verify TLS certificates for https health checks
    pub verify_tls: bool,
    /// Treat any HTTP response, regardless of status code, as healthy
    pub any_status: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            path: "/health".to_string(),
            timeout: Duration::from_secs(40),
            interval: Duration::from_secs(1),
            verify_tls: true,
            any_status: false,
        }
    }
}

// Helper module for Duration serialization as whole seconds
mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_spec() -> DemoSpec {
        toml::from_str(
            r#"
id = "inference"
name = "Inference server"
[deploy]
remote_dir = "/opt/inference"
script = { path = "install.sh" }
[run]
kind = "service"
binary = "inference-server"
candidate_paths = ["/opt/inference/bin", "/usr/local/bin"]
remote_port = 9000
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_validate_service_kind() {
        service_spec().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_script_without_payload() {
        let mut spec = service_spec();
        spec.run.kind = DemoKind::Script;
        spec.run.payload = None;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_scheme() {
        let mut spec = service_spec();
        spec.run.health.scheme = "ftp".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_remote_dir_override() {
        let spec = service_spec();
        assert_eq!(spec.remote_dir(None), "/opt/inference");

        let overrides = DemoOverrides {
            remote_dir: Some("/data/inference".to_string()),
        };
        assert_eq!(spec.remote_dir(Some(&overrides)), "/data/inference");
    }

    #[test]
    fn test_blob_url_rewrite() {
        let src = ScriptSource::Url(
            "https://github.com/acme/demos/blob/v1.2/scripts/setup.sh".to_string(),
        );
        assert_eq!(
            src.resolved_url().unwrap(),
            "https://raw.githubusercontent.com/acme/demos/v1.2/scripts/setup.sh"
        );
    }

    #[test]
    fn test_plain_url_unchanged() {
        let src = ScriptSource::Url("https://example.com/setup.sh".to_string());
        assert_eq!(src.resolved_url().unwrap(), "https://example.com/setup.sh");
    }

    #[test]
    fn test_repo_source_url() {
        let src = ScriptSource::Repo {
            repo: "acme/demos".to_string(),
            rev: "main".to_string(),
            path: "scripts/setup.sh".to_string(),
        };
        assert_eq!(
            src.resolved_url().unwrap(),
            "https://raw.githubusercontent.com/acme/demos/main/scripts/setup.sh"
        );
    }

    #[test]
    fn test_local_path_has_no_url() {
        assert_eq!(ScriptSource::Path("setup.sh".into()).resolved_url(), None);
    }

    #[test]
    fn test_process_identifier_fallbacks() {
        let mut spec = service_spec();
        assert_eq!(spec.run.process_identifier(), "inference-server");
        spec.run.process_pattern = Some("inference-server --port".to_string());
        assert_eq!(spec.run.process_identifier(), "inference-server --port");
    }
}
