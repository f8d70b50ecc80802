use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    pub jwt_secret: String,
    pub port: u16,
    pub engagement: EngagementConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngagementConfig {
    pub idle_threshold_seconds: i64,
    /// Offset of the single process-wide calendar used for streak and daily rollups.
    pub utc_offset_minutes: i32,
    pub study_time_cache_ttl_seconds: u64,
    pub streak_milestones: Vec<i64>,
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            idle_threshold_seconds: 600,
            utc_offset_minutes: 0,
            study_time_cache_ttl_seconds: 300,
            streak_milestones: vec![7, 30, 100, 365],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub idle_close_cron: String,
    pub quiz_expire_cron: String,
    pub streak_expire_cron: String,
    pub retry_attempts: usize,
    pub retry_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_close_cron: "0 * * * * *".to_string(),
            quiz_expire_cron: "*/15 * * * * *".to_string(),
            streak_expire_cron: "0 0 * * * *".to_string(),
            retry_attempts: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first (two levels up), then local .env
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/*.toml + APP__SECTION__KEY overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", app_env)).required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("engagement.streak_milestones"),
            )
            .build()?;

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "engagement".to_string());

        let jwt_secret = match settings
            .get_string("auth.jwt_secret")
            .or_else(|_| env::var("JWT_SECRET"))
        {
            Ok(secret) => secret,
            Err(_) if app_env == "prod" => {
                return Err(config::ConfigError::Message(
                    "JWT_SECRET must be set in production".to_string(),
                ));
            }
            Err(_) => {
                eprintln!("WARNING: Using default JWT_SECRET (dev mode only!)");
                "dev-secret-only-for-local-testing".to_string()
            }
        };

        let port = match settings.get::<u16>("server.port") {
            Ok(port) => port,
            Err(_) => match env::var("PORT") {
                Ok(raw) => raw.parse::<u16>().map_err(|e| {
                    config::ConfigError::Message(format!("invalid PORT '{}': {}", raw, e))
                })?,
                Err(_) => 8081,
            },
        };

        let defaults = EngagementConfig::default();
        let engagement = EngagementConfig {
            idle_threshold_seconds: settings
                .get("engagement.idle_threshold_seconds")
                .unwrap_or(defaults.idle_threshold_seconds),
            utc_offset_minutes: settings
                .get("engagement.utc_offset_minutes")
                .unwrap_or(defaults.utc_offset_minutes),
            study_time_cache_ttl_seconds: settings
                .get("engagement.study_time_cache_ttl_seconds")
                .unwrap_or(defaults.study_time_cache_ttl_seconds),
            streak_milestones: settings
                .get("engagement.streak_milestones")
                .unwrap_or(defaults.streak_milestones),
        };
        if engagement.idle_threshold_seconds <= 0 {
            return Err(config::ConfigError::Message(format!(
                "engagement.idle_threshold_seconds must be positive, got {}",
                engagement.idle_threshold_seconds
            )));
        }

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            enabled: settings.get("scheduler.enabled").unwrap_or(defaults.enabled),
            idle_close_cron: settings
                .get_string("scheduler.idle_close_cron")
                .unwrap_or(defaults.idle_close_cron),
            quiz_expire_cron: settings
                .get_string("scheduler.quiz_expire_cron")
                .unwrap_or(defaults.quiz_expire_cron),
            streak_expire_cron: settings
                .get_string("scheduler.streak_expire_cron")
                .unwrap_or(defaults.streak_expire_cron),
            retry_attempts: settings
                .get("scheduler.retry_attempts")
                .unwrap_or(defaults.retry_attempts),
            retry_backoff_ms: settings
                .get("scheduler.retry_backoff_ms")
                .unwrap_or(defaults.retry_backoff_ms),
        };

        Ok(Config {
            mongo_uri,
            redis_uri,
            mongo_database,
            jwt_secret,
            port,
            engagement,
            scheduler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "APP_ENV",
        "JWT_SECRET",
        "PORT",
        "MONGO_DATABASE",
        "APP__ENGAGEMENT__IDLE_THRESHOLD_SECONDS",
        "APP__ENGAGEMENT__STREAK_MILESTONES",
        "APP__SCHEDULER__ENABLED",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
        env::set_var("SKIP_ROOT_ENV", "1");
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = Config::load().unwrap();

        assert_eq!(config.port, 8081);
        assert_eq!(config.mongo_database, "engagement");
        assert_eq!(config.engagement.idle_threshold_seconds, 600);
        assert_eq!(config.engagement.streak_milestones, vec![7, 30, 100, 365]);
        assert!(config.scheduler.enabled);
        assert_eq!(config.scheduler.quiz_expire_cron, "*/15 * * * * *");
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        env::set_var("APP__ENGAGEMENT__IDLE_THRESHOLD_SECONDS", "120");
        env::set_var("APP__ENGAGEMENT__STREAK_MILESTONES", "3,10");
        env::set_var("APP__SCHEDULER__ENABLED", "false");
        env::set_var("PORT", "9000");

        let config = Config::load().unwrap();
        clear_env();

        assert_eq!(config.engagement.idle_threshold_seconds, 120);
        assert_eq!(config.engagement.streak_milestones, vec![3, 10]);
        assert!(!config.scheduler.enabled);
        assert_eq!(config.port, 9000);
    }

    #[test]
    #[serial]
    fn test_prod_requires_jwt_secret() {
        clear_env();
        env::set_var("APP_ENV", "prod");

        let result = Config::load();
        clear_env();

        assert!(result.is_err());
    }
}
