//! Configuration loading and XDG path helpers.

use std::path::PathBuf;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::services::ProviderKind;

const CONFIG_FILE: &str = "config/settings";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub intake: IntakeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub model: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntakeConfig {
    pub upload_dir: PathBuf,
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let default_uploads = default_upload_path()?;
    let builder = Config::builder()
        .set_default("server.listen_addr", "127.0.0.1:8080")?
        .set_default("provider.kind", ProviderKind::Gemini.as_ref())?
        .set_default("provider.model", "gemini-2.5-flash")?
        .set_default(
            "intake.upload_dir",
            default_uploads.to_string_lossy().to_string(),
        )?
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix("MARKETSNAP").separator("__"));

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "marketsnap", "marketsnap").ok_or(AppConfigError::MissingProjectDirs)
}

fn default_upload_path() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()?.data_dir().join("uploads"))
}
