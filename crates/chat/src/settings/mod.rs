pub mod state;

pub use state::{
    ClientSettings, SETTINGS_ENV_PREFIX, SETTINGS_FILE_NAME, SettingsError, SettingsStore,
};
