use std::path::{Path, PathBuf};

use tracing::{debug, info};

const CONFIG_DIR: &str = "config";
const SECRETS_FILE: &str = ".secrets.env";

/// Deployment profile, picked from `ROCKET_PROFILE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Development,
    Production,
}

impl Profile {
    pub fn from_env() -> Self {
        Self::parse(dotenvy::var("ROCKET_PROFILE").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(name) if name.eq_ignore_ascii_case("production") => Profile::Production,
            Some(name) if name.eq_ignore_ascii_case("release") => Profile::Production,
            _ => Profile::Development,
        }
    }

    fn settings_file(self) -> &'static str {
        match self {
            Profile::Development => "dev.env",
            Profile::Production => "prod.env",
        }
    }
}

/// Env files for `profile`, in the order they are applied. Later files win.
pub fn env_files(profile: Profile) -> Vec<PathBuf> {
    let config_dir = Path::new(CONFIG_DIR);

    vec![
        config_dir.join("common.env"),
        config_dir.join(profile.settings_file()),
        PathBuf::from(SECRETS_FILE),
    ]
}

/// Populates the process environment with the reading tracker's settings
/// before `AppConfig` reads its `LMS_` variables.
pub fn load_environment() -> Result<Profile, dotenvy::Error> {
    let profile = Profile::from_env();
    let mut applied = 0;

    for path in env_files(profile) {
        if apply_env_file(&path)? {
            applied += 1;
        }
    }

    info!(?profile, applied, "Reading tracker environment prepared");
    Ok(profile)
}

/// Returns `false` when there is no file at `path`.
fn apply_env_file(path: &Path) -> Result<bool, dotenvy::Error> {
    if !path.is_file() {
        debug!(path = %path.display(), "No env file, skipping");
        return Ok(false);
    }

    dotenvy::from_path_override(path)?;
    info!(path = %path.display(), "Applied env file");
    Ok(true)
}
