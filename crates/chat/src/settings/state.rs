use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use medigraph_triage::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HISTORY, DEFAULT_READ_TIMEOUT, DEFAULT_TRIAGE_ENDPOINT,
    DEFAULT_USER_ID, TriageConfig,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tempfile::NamedTempFile;

use crate::chat::{FALLBACK_MESSAGE, RequestProfile};

pub const SETTINGS_DIRECTORY_NAME: &str = "medigraph";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "MEDIGRAPH_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// Patient history forwarded with every request.
    #[serde(default = "default_history")]
    pub history: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            user_id: default_user_id(),
            history: default_history(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            fallback_message: default_fallback_message(),
        }
    }
}

impl ClientSettings {
    pub fn to_triage_config(&self) -> TriageConfig {
        TriageConfig::new(&self.endpoint)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .with_read_timeout(Duration::from_secs(self.read_timeout_secs))
    }

    pub fn to_request_profile(&self) -> RequestProfile {
        RequestProfile {
            user_id: self.user_id.clone(),
            history: self.history.clone(),
            fallback_message: self.fallback_message.clone(),
        }
    }

    pub fn normalized(mut self) -> Self {
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.user_id = non_blank_or(self.user_id, default_user_id);
        self.history = non_blank_or(self.history, default_history);
        self.fallback_message = non_blank_or(self.fallback_message, default_fallback_message);

        // A zero timeout would fail every request immediately.
        if self.connect_timeout_secs == 0 {
            self.connect_timeout_secs = default_connect_timeout_secs();
        }
        if self.read_timeout_secs == 0 {
            self.read_timeout_secs = default_read_timeout_secs();
        }

        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".medigraph"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, settings: ClientSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Layers defaults, the JSON file (if present) and `MEDIGRAPH_*` variables.
    pub fn extract(path: &Path) -> Result<ClientSettings, SettingsError> {
        let figment = Figment::from(Serialized::defaults(ClientSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        let settings = figment
            .extract::<ClientSettings>()
            .map_err(Box::new)
            .context(ExtractSnafu {
                stage: "extract-settings",
                path: path.to_path_buf(),
            })?;
        Ok(settings.normalized())
    }

    fn load_from_disk(path: &Path) -> ClientSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        match Self::extract(path) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!("{error}. using defaults");
                ClientSettings::default()
            }
        }
    }

    /// Writes `settings` to a sibling temp file and swaps it over the current file.
    fn persist(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        let directory = match self.config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(directory).context(CreateDirSnafu {
            stage: "ensure-medigraph-config-dir",
            path: directory.to_path_buf(),
        })?;

        let encoded = serde_json::to_vec_pretty(settings).context(SerializeConfigSnafu {
            stage: "encode-client-settings",
        })?;

        let mut staged = NamedTempFile::new_in(directory).context(WriteFileSnafu {
            stage: "stage-client-settings",
            path: directory.to_path_buf(),
        })?;
        staged.write_all(&encoded).context(WriteFileSnafu {
            stage: "stage-client-settings",
            path: staged.path().to_path_buf(),
        })?;

        let staged_path = staged.path().to_path_buf();
        staged
            .persist(&self.config_path)
            .map_err(|error| error.error)
            .context(RenameTempFileSnafu {
                stage: "swap-client-settings",
                from: staged_path,
                to: self.config_path.clone(),
            })?;

        tracing::info!(path = %self.config_path.display(), "client settings saved");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("client settings at {path:?} are invalid on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        source: Box<figment::Error>,
    },
    #[snafu(display("cannot create config directory {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode client settings as JSON on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot write staged settings in {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot move staged settings {from:?} over {to:?} on `{stage}`: {source}"))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank_or(value: String, default: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        default()
    } else {
        trimmed.to_string()
    }
}

fn default_endpoint() -> String {
    DEFAULT_TRIAGE_ENDPOINT.to_string()
}

fn default_user_id() -> String {
    DEFAULT_USER_ID.to_string()
}

fn default_history() -> String {
    DEFAULT_HISTORY.to_string()
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_read_timeout_secs() -> u64 {
    DEFAULT_READ_TIMEOUT.as_secs()
}

fn default_fallback_message() -> String {
    FALLBACK_MESSAGE.to_string()
}
