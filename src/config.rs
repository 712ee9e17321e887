use std::{env, path::PathBuf};

pub const DEFAULT_DATABASE_PATH: &str = "/var/lib/estateai/estateai.db";
pub const DEFAULT_REPORTS_DIR: &str = "/var/lib/estateai/reports";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub reports_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: path_from_env("DATABASE_PATH")
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH)),
            reports_dir: path_from_env("REPORTS_DIR")
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORTS_DIR)),
            scratch_dir: path_from_env("SCRATCH_DIR")
                .unwrap_or_else(|| env::temp_dir().join("appraisal-scratch")),
            port: env::var("PORT")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(8000),
        }
    }
}

fn path_from_env(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}
