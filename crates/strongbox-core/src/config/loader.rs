//! Configuration loading and persistence.

use super::Config;
use crate::env;
use crate::error::ConfigError;
use std::fs;
use std::path::{Path, PathBuf};

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load from `path` when given, otherwise from `STRONGBOX_CONFIG`, falling
    /// back to defaults. Environment overrides are applied and the result is
    /// validated.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = env::get_var(&env::var("CONFIG")).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(p) => Self::load(&p)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::Json5(e.to_string()))
    }

    /// Save configuration to a file path.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_json5()?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write atomically
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Serialize to JSON5 string.
    pub fn to_json5(&self) -> Result<String, ConfigError> {
        // json5 doesn't have a serializer, so we use serde_json with pretty print
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `STRONGBOX_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = env::get_var(&env::var("DATA_DIR")) {
            self.store.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = env::get_var(&env::var("AUDIT_LOG")) {
            self.audit.log_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env::get_var(&env::var("MASTER_KEY_FILE")) {
            self.crypto.master_key_file = Some(PathBuf::from(path));
        }
        if let Some(secs) = env::get_u64(&env::var("GRACE_PERIOD_SECS")) {
            self.rotation.grace_period_secs = secs;
        }
        if let Some(rate) = env::get_f64(&env::var("ERROR_RATE_THRESHOLD")) {
            self.rotation.error_rate_threshold = rate;
        }
        if let Some(capacity) = env::get_usize(&env::var("CACHE_CAPACITY")) {
            self.cache.l1_capacity = capacity;
        }
        if let Some(ms) = env::get_u64(&env::var("CACHE_PROPAGATION_MS")) {
            self.cache.max_propagation_ms = ms;
        }
        if let Some(json) = env::get_bool(&env::var("LOG_JSON")) {
            self.logging.json = json;
        }
    }

    /// Validate the configuration, collecting all errors before returning.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        // 1. Data key ceilings
        if self.crypto.max_ops_per_data_key == 0 {
            errors.push("crypto.max_ops_per_data_key must be greater than 0".to_string());
        }
        if self.crypto.rotate_after_ops > self.crypto.max_ops_per_data_key {
            errors.push(format!(
                "crypto.rotate_after_ops ({}) exceeds max_ops_per_data_key ({})",
                self.crypto.rotate_after_ops, self.crypto.max_ops_per_data_key
            ));
        }
        if self.crypto.kms_timeout_ms == 0 {
            errors.push("crypto.kms_timeout_ms must be greater than 0".to_string());
        }

        // 2. Retry budgets
        for (name, policy) in [
            ("crypto.kms_retry", &self.crypto.kms_retry),
            ("store.backend_retry", &self.store.backend_retry),
            ("audit.write_retry", &self.audit.write_retry),
        ] {
            if policy.max_attempts == 0 {
                errors.push(format!("{name}.max_attempts must be at least 1"));
            }
            if policy.backoff_factor < 1.0 {
                errors.push(format!("{name}.backoff_factor must be >= 1.0"));
            }
        }

        // 3. Retention
        if self.store.default_retention.min_versions == 0 {
            errors.push("store.default_retention.min_versions must be at least 1".to_string());
        }
        if self.store.event_capacity == 0 {
            errors.push("store.event_capacity must be greater than 0".to_string());
        }

        // 4. Rotation
        if !(0.0..=1.0).contains(&self.rotation.error_rate_threshold) {
            errors.push(format!(
                "rotation.error_rate_threshold must be within 0.0-1.0, got {}",
                self.rotation.error_rate_threshold
            ));
        }
        if self.rotation.validation_timeout_ms == 0 {
            errors.push("rotation.validation_timeout_ms must be greater than 0".to_string());
        }
        if self.rotation.generated_bytes < 16 {
            errors.push(format!(
                "rotation.generated_bytes must be at least 16, got {}",
                self.rotation.generated_bytes
            ));
        }
        if self.rotation.interval_secs == Some(0) {
            errors.push("rotation.interval_secs must be greater than 0 when set".to_string());
        }

        // 5. Cache
        if self.cache.l1_capacity == 0 {
            errors.push("cache.l1_capacity must be greater than 0".to_string());
        }
        if self.cache.max_propagation_ms == 0 {
            errors.push("cache.max_propagation_ms must be greater than 0".to_string());
        }

        // 6. Audit
        if self.audit.buffer_capacity == 0 {
            errors.push("audit.buffer_capacity must be greater than 0".to_string());
        }
        if self.audit.write_timeout_ms == 0 {
            errors.push("audit.write_timeout_ms must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }
}
