use rocket::figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};

/// Runtime settings injected into Rocket as managed state.
///
/// Values come from `LMS_`-prefixed environment variables (see `env.rs` for
/// the files that populate them) layered over the defaults below. There is
/// deliberately no default for `jwt_secret`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    /// `percent_complete` at or above which a book counts as finished.
    pub completion_threshold: f64,
    /// Average reading time (seconds) reported when no session has closed yet.
    pub fallback_avg_reading_time: i64,
    pub upload_dir: String,
    pub max_upload_mib: u64,
    pub bcrypt_cost: u32,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
}

#[derive(Serialize)]
struct Defaults {
    token_ttl_hours: i64,
    completion_threshold: f64,
    fallback_avg_reading_time: i64,
    upload_dir: &'static str,
    max_upload_mib: u64,
    bcrypt_cost: u32,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            token_ttl_hours: 24,
            completion_threshold: 100.0,
            fallback_avg_reading_time: 25,
            upload_dir: "uploads",
            max_upload_mib: 20,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

impl AppConfig {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Defaults::default())).merge(Env::prefixed("LMS_"))
    }

    pub fn from_env() -> Result<Self, rocket::figment::Error> {
        let config: AppConfig = Self::figment().extract()?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), rocket::figment::Error> {
        if self.jwt_secret.trim().is_empty() {
            return Err(rocket::figment::Error::from(
                "jwt_secret must not be empty".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.completion_threshold) {
            return Err(rocket::figment::Error::from(format!(
                "completion_threshold must be within 0..=100, got {}",
                self.completion_threshold
            )));
        }

        if self.fallback_avg_reading_time < 0 {
            return Err(rocket::figment::Error::from(
                "fallback_avg_reading_time must not be negative".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
impl AppConfig {
    pub fn for_tests() -> Self {
        Self {
            jwt_secret: "test-secret".to_string(),
            token_ttl_hours: 1,
            completion_threshold: 100.0,
            fallback_avg_reading_time: 25,
            upload_dir: std::env::temp_dir()
                .join(format!("reading-tracker-{}", uuid::Uuid::new_v4()))
                .to_string_lossy()
                .into_owned(),
            max_upload_mib: 1,
            bcrypt_cost: 4,
            admin_username: None,
            admin_password: None,
        }
    }
}
