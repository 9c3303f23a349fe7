//! Task configuration
//!
//! Inputs come from three layers, lowest priority first: built-in defaults, an optional YAML
//! file, and the process environment. `config/local.env` only fills environment variables that
//! are not already set.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use action_flow::TimeoutTiers;
use cdp_adapter::CdpConfig;
use clap::ValueEnum;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

/// File consulted when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "config/autopilot.yaml";
/// Environment defaults file
pub const LOCAL_ENV_PATH: &str = "config/local.env";

const MASK: &str = "********";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Which job a run performs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// Click the trigger and wait for the terminal notification
    #[default]
    Update,
    /// Open the document's script project and read its cloud project link
    ProjectLink,
}

/// The job of one run with the inputs only that job needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Update {
        trigger_selector: String,
        terminal_message: String,
    },
    ProjectLink,
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Update { .. } => TaskKind::Update,
            Task::ProjectLink => TaskKind::ProjectLink,
        }
    }
}

/// Sign-in credentials. Never printed in clear.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &MASK)
            .finish()
    }
}

/// Selectors for the parts of the target application the task touches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Selectors {
    pub consent_continue: String,
    pub account_chooser: String,
    pub approve_access: String,
    pub butter_bar: String,
    pub unsupported_banner: String,
    pub password_gate: String,
    pub signed_in_marker: String,
    pub notification_root: String,
    pub tools_menu: String,
    pub script_editor_item: String,
    pub resources_menu: String,
    pub cloud_project_item: String,
    /// Anchor inside the cloud project dialog
    pub project_link: String,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            consent_continue: ".modal-dialog button[name=continue]".into(),
            account_chooser: "[data-email]".into(),
            approve_access: "#submit_approve_access".into(),
            butter_bar: "#docs-butterbar-container .docs-butterbar-message".into(),
            unsupported_banner: "#docs-unsupported-browser-bar".into(),
            password_gate: "#passwordNext".into(),
            signed_in_marker: r#"link[rel=canonical][href="https://apps.google.com/user/hub"]"#
                .into(),
            notification_root: ".apps-toast".into(),
            tools_menu: "#docs-tools-menu".into(),
            script_editor_item: r"#\:hc".into(),
            resources_menu: "#macros-resources-menu".into(),
            cloud_project_item: r"#\:1t".into(),
            project_link: ".script-devconsoleproject-dialog-projectlink a".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Urls {
    pub sign_in: Url,
    /// Documents live under this prefix, addressed by id
    pub document_base: Url,
    pub identity_origin: Url,
    /// Script projects bound to a document open on this origin
    pub script_origin: Url,
}

impl Default for Urls {
    fn default() -> Self {
        Self {
            sign_in: builtin_url("https://apps.google.com/user/hub"),
            document_base: builtin_url("https://docs.google.com/spreadsheets/d/"),
            identity_origin: builtin_url("https://accounts.google.com"),
            script_origin: builtin_url("https://script.google.com"),
        }
    }
}

fn builtin_url(raw: &str) -> Url {
    Url::parse(raw).expect("built-in url is valid")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1600,
            height: 1200,
        }
    }
}

/// YAML overrides for the timeout tiers, written as `100ms`, `2s`, `2m`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutOverrides {
    #[serde(deserialize_with = "human_duration")]
    pub small: Option<Duration>,
    #[serde(deserialize_with = "human_duration")]
    pub medium: Option<Duration>,
    #[serde(deserialize_with = "human_duration")]
    pub large: Option<Duration>,
    #[serde(deserialize_with = "human_duration")]
    pub very_large: Option<Duration>,
}

impl TimeoutOverrides {
    fn apply(&self, mut tiers: TimeoutTiers) -> TimeoutTiers {
        if let Some(small) = self.small {
            tiers.small = small;
        }
        if let Some(medium) = self.medium {
            tiers.medium = medium;
        }
        if let Some(large) = self.large {
            tiers.large = large;
        }
        if let Some(very_large) = self.very_large {
            tiers.very_large = very_large;
        }
        tiers
    }
}

fn human_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|value| humantime::parse_duration(value.trim()).map_err(serde::de::Error::custom))
        .transpose()
}

/// Task values the YAML file may provide when the environment does not
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskOverrides {
    pub kind: Option<TaskKind>,
    pub sheet_id: Option<String>,
    pub trigger_selector: Option<String>,
    pub terminal_message: Option<String>,
}

/// Shape of `config/autopilot.yaml`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub task: TaskOverrides,
    pub headless: Option<bool>,
    pub screenshot_path: Option<PathBuf>,
    pub viewport: Option<Viewport>,
    pub timeouts: TimeoutOverrides,
    pub selectors: Selectors,
    pub urls: Urls,
}

impl FileConfig {
    pub fn from_yaml(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents, path)
    }
}

/// Everything one run needs
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub credentials: Credentials,
    pub sheet_id: String,
    pub task: Task,
    pub headless: bool,
    pub tiers: TimeoutTiers,
    pub selectors: Selectors,
    pub urls: Urls,
    pub viewport: Viewport,
    pub screenshot_path: PathBuf,
    document_url: Url,
}

impl TaskConfig {
    /// Resolve the configuration from the process environment and the YAML file at
    /// `config_path`, or [`DEFAULT_CONFIG_PATH`] when it exists. `kind` wins over `task.kind`
    /// from the file.
    pub fn load(config_path: Option<&Path>, kind: Option<TaskKind>) -> Result<Self, ConfigError> {
        let mut file = match config_path {
            Some(path) => {
                let file = FileConfig::read(path)?;
                info!(path = %path.display(), "loaded configuration file");
                file
            }
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    let file = FileConfig::read(default)?;
                    info!(path = %default.display(), "loaded configuration file");
                    file
                } else {
                    FileConfig::default()
                }
            }
        };
        if kind.is_some() {
            file.task.kind = kind;
        }
        Self::from_sources(|key| env::var(key).ok(), file)
    }

    /// Merge environment values (via `lookup`) over `file`.
    pub fn from_sources<F>(lookup: F, file: FileConfig) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let username = value("GOOGLE_USERNAME").ok_or(ConfigError::Missing("GOOGLE_USERNAME"))?;
        let password = value("GOOGLE_PASSWORD").ok_or(ConfigError::Missing("GOOGLE_PASSWORD"))?;
        let sheet_id = value("SHEET_ID")
            .or(file.task.sheet_id)
            .ok_or(ConfigError::Missing("SHEET_ID"))?;
        let task = match file.task.kind.unwrap_or_default() {
            TaskKind::Update => Task::Update {
                trigger_selector: value("CLICK_ON_SELECTOR")
                    .or(file.task.trigger_selector)
                    .ok_or(ConfigError::Missing("CLICK_ON_SELECTOR"))?,
                terminal_message: value("TOAST_MESSAGE")
                    .or(file.task.terminal_message)
                    .ok_or(ConfigError::Missing("TOAST_MESSAGE"))?,
            },
            TaskKind::ProjectLink => Task::ProjectLink,
        };

        // Only the literal "false" turns headless off.
        let headless = match lookup("HEADLESS") {
            Some(raw) => raw != "false",
            None => file.headless.unwrap_or(true),
        };

        let tiers = file.timeouts.apply(TimeoutTiers::default());
        if [tiers.small, tiers.medium, tiers.large, tiers.very_large]
            .iter()
            .any(Duration::is_zero)
        {
            return Err(ConfigError::Invalid {
                field: "timeouts",
                reason: "timeout tiers must be greater than zero".into(),
            });
        }

        let viewport = file.viewport.unwrap_or_default();
        if viewport.width == 0 || viewport.height == 0 {
            return Err(ConfigError::Invalid {
                field: "viewport",
                reason: format!("{}x{} is not a usable size", viewport.width, viewport.height),
            });
        }

        let document_url = document_url(&file.urls.document_base, &sheet_id)?;

        Ok(Self {
            credentials: Credentials { username, password },
            sheet_id,
            task,
            headless,
            tiers,
            selectors: file.selectors,
            urls: file.urls,
            viewport,
            screenshot_path: file
                .screenshot_path
                .unwrap_or_else(|| PathBuf::from(action_flow::diagnostics::DEFAULT_SCREENSHOT_PATH)),
            document_url,
        })
    }

    /// Address of the target document
    pub fn document_url(&self) -> &Url {
        &self.document_url
    }

    /// Adapter settings for launching the browser
    pub fn cdp_config(&self) -> CdpConfig {
        CdpConfig {
            headless: self.headless,
            ..CdpConfig::default()
        }
    }

    /// Echo the resolved inputs, password masked.
    pub fn log_inputs(&self) {
        info!("GOOGLE_USERNAME: {}", self.credentials.username);
        info!("GOOGLE_PASSWORD: {MASK}");
        info!("SHEET_ID: {}", self.sheet_id);
        match &self.task {
            Task::Update {
                trigger_selector,
                terminal_message,
            } => {
                info!("CLICK_ON_SELECTOR: {trigger_selector}");
                info!("TOAST_MESSAGE: {terminal_message}");
            }
            Task::ProjectLink => info!("TASK: project-link"),
        }
        info!("HEADLESS: {}", self.headless);
    }
}

fn document_url(base: &Url, sheet_id: &str) -> Result<Url, ConfigError> {
    if sheet_id.contains(['/', '?', '#']) {
        return Err(ConfigError::Invalid {
            field: "SHEET_ID",
            reason: format!("'{sheet_id}' is not a document identifier"),
        });
    }

    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(sheet_id).map_err(|err| ConfigError::Invalid {
        field: "SHEET_ID",
        reason: err.to_string(),
    })
}

/// Fill unset environment variables from `path` (`KEY=value` lines, `#` comments).
///
/// Returns how many variables were set.
pub fn load_local_env_overrides(path: &Path) -> usize {
    if !path.exists() {
        return 0;
    }

    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(path = %path.display(), ?err, "failed to read local.env overrides");
            return 0;
        }
    };

    let mut applied = 0;
    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!(line = idx + 1, "invalid local.env entry; skipping");
            continue;
        };
        let key = key.trim();
        if key.is_empty() || env::var_os(key).is_some() {
            continue;
        }
        env::set_var(key, unquote(value.trim()));
        applied += 1;
    }
    info!(path = %path.display(), applied, "loaded environment defaults from local.env");
    applied
}

fn unquote(value: &str) -> String {
    match value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
    {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\n", "\n"),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            ("GOOGLE_USERNAME", "robot@example.com"),
            ("GOOGLE_PASSWORD", "hunter2"),
            ("SHEET_ID", "1AbC_d-9"),
            ("CLICK_ON_SELECTOR", "#update-all"),
            ("TOAST_MESSAGE", "Update all: Done!"),
        ]
    }

    #[test]
    fn resolves_from_environment_with_defaults() {
        let config = TaskConfig::from_sources(env_of(&required()), FileConfig::default()).unwrap();

        assert!(config.headless);
        assert_eq!(config.tiers, TimeoutTiers::default());
        assert_eq!(config.viewport, Viewport::default());
        assert_eq!(config.screenshot_path, PathBuf::from("screenshot.png"));
        assert_eq!(
            config.document_url().as_str(),
            "https://docs.google.com/spreadsheets/d/1AbC_d-9"
        );
    }

    #[test]
    fn missing_values_are_named() {
        let mut vars = required();
        vars.retain(|(k, _)| *k != "TOAST_MESSAGE");
        let err = TaskConfig::from_sources(env_of(&vars), FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("TOAST_MESSAGE")));

        let mut vars = required();
        vars.push(("GOOGLE_PASSWORD", ""));
        vars.remove(1);
        let err = TaskConfig::from_sources(env_of(&vars), FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("GOOGLE_PASSWORD")));
    }

    #[test]
    fn project_link_needs_no_trigger_or_message() {
        let mut vars = required();
        vars.retain(|(k, _)| !matches!(*k, "CLICK_ON_SELECTOR" | "TOAST_MESSAGE"));
        let file = FileConfig::from_yaml("task:\n  kind: project-link\n", Path::new("a.yaml"))
            .unwrap();

        let config = TaskConfig::from_sources(env_of(&vars), file).unwrap();
        assert_eq!(config.task, Task::ProjectLink);
        assert_eq!(config.urls.script_origin.as_str(), "https://script.google.com/");

        let err = TaskConfig::from_sources(env_of(&vars), FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CLICK_ON_SELECTOR")));
    }

    #[test]
    fn only_literal_false_disables_headless() {
        for (raw, expected) in [("false", false), ("False", true), ("0", true), ("true", true)] {
            let mut vars = required();
            vars.push(("HEADLESS", raw));
            let config = TaskConfig::from_sources(env_of(&vars), FileConfig::default()).unwrap();
            assert_eq!(config.headless, expected, "HEADLESS={raw}");
        }
    }

    #[test]
    fn yaml_overrides_defaults_but_not_environment() {
        let yaml = r##"
task:
  trigger_selector: "#from-file"
  terminal_message: "From file"
headless: false
screenshot_path: artifacts/failure.png
viewport: { width: 1280, height: 800 }
timeouts:
  small: 250ms
  very_large: 3m
selectors:
  notification_root: ".toast-root"
urls:
  document_base: "https://sheets.example.test/d"
"##;
        let file = FileConfig::from_yaml(yaml, Path::new("autopilot.yaml")).unwrap();
        let mut vars = required();
        vars.retain(|(k, _)| *k != "TOAST_MESSAGE");
        let config = TaskConfig::from_sources(env_of(&vars), file).unwrap();

        assert_eq!(
            config.task,
            Task::Update {
                trigger_selector: "#update-all".into(),
                terminal_message: "From file".into(),
            }
        );
        assert!(!config.headless);
        assert_eq!(config.viewport.width, 1280);
        assert_eq!(config.tiers.small, Duration::from_millis(250));
        assert_eq!(config.tiers.medium, Duration::from_secs(2));
        assert_eq!(config.tiers.very_large, Duration::from_secs(180));
        assert_eq!(config.selectors.notification_root, ".toast-root");
        assert_eq!(config.selectors.approve_access, "#submit_approve_access");
        assert_eq!(
            config.document_url().as_str(),
            "https://sheets.example.test/d/1AbC_d-9"
        );
    }

    #[test]
    fn bad_durations_and_ids_are_rejected() {
        let err = FileConfig::from_yaml("timeouts:\n  small: soon\n", Path::new("bad.yaml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        let file = FileConfig::from_yaml("timeouts:\n  medium: 0s\n", Path::new("zero.yaml"))
            .unwrap();
        let err = TaskConfig::from_sources(env_of(&required()), file).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "timeouts", .. }));

        let mut vars = required();
        vars.push(("SHEET_ID", "../other"));
        vars.remove(2);
        let err = TaskConfig::from_sources(env_of(&vars), FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "SHEET_ID", .. }));
    }

    #[test]
    fn password_is_redacted_in_debug_output() {
        let config = TaskConfig::from_sources(env_of(&required()), FileConfig::default()).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains(MASK));
    }

    #[test]
    #[serial]
    fn local_env_fills_only_unset_variables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.env");
        fs::write(
            &path,
            "# defaults\nAUTOPILOT_TEST_UNSET=\"from file\"\nAUTOPILOT_TEST_SET=from file\nnot a pair\n",
        )
        .unwrap();
        env::remove_var("AUTOPILOT_TEST_UNSET");
        env::set_var("AUTOPILOT_TEST_SET", "from env");

        let applied = load_local_env_overrides(&path);

        assert_eq!(applied, 1);
        assert_eq!(env::var("AUTOPILOT_TEST_UNSET").unwrap(), "from file");
        assert_eq!(env::var("AUTOPILOT_TEST_SET").unwrap(), "from env");
        env::remove_var("AUTOPILOT_TEST_UNSET");
        env::remove_var("AUTOPILOT_TEST_SET");
    }
}
