//! Retention policy re-read from configuration at the start of every pass.

use std::path::PathBuf;
use tracksweep_core::{PolicySource, RetentionPolicy};

use crate::duration::parse_duration;
use crate::system::{CONFIG_PATH_ENV, OLDER_THAN_ENV, load_system_config};

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads `MLFLOW_GC_OLDER_THAN`, then the KDL file's `gc older-than`, and
/// falls back to the policy the service started with.
pub struct ConfigPolicySource {
    lookup: Lookup,
    config_path: Option<PathBuf>,
    fallback: RetentionPolicy,
}

impl ConfigPolicySource {
    pub fn new(
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
        config_path: Option<PathBuf>,
        fallback: RetentionPolicy,
    ) -> Self {
        Self {
            lookup: Box::new(lookup),
            config_path,
            fallback,
        }
    }

    /// Source backed by the process environment.
    pub fn from_env(fallback: RetentionPolicy) -> Self {
        let config_path = std::env::var(CONFIG_PATH_ENV)
            .ok()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        Self::new(|key| std::env::var(key).ok(), config_path, fallback)
    }

    fn env_older_than(&self) -> Option<String> {
        (self.lookup)(OLDER_THAN_ENV)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

impl PolicySource for ConfigPolicySource {
    fn current(&self) -> tracksweep_core::Result<RetentionPolicy> {
        if let Some(value) = self.env_older_than() {
            return Ok(RetentionPolicy::new(parse_duration(OLDER_THAN_ENV, &value)?));
        }

        if let Some(path) = &self.config_path {
            if let Some(value) = load_system_config(path)?.older_than {
                return Ok(RetentionPolicy::new(parse_duration("gc older-than", &value)?));
            }
        }

        Ok(self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn fallback() -> RetentionPolicy {
        RetentionPolicy::new(Duration::from_secs(300))
    }

    #[test]
    fn test_environment_wins() {
        let source = ConfigPolicySource::new(
            |key| (key == OLDER_THAN_ENV).then(|| "1h".to_string()),
            None,
            fallback(),
        );
        assert_eq!(source.current().unwrap().min_age, Duration::from_secs(3600));
    }

    #[test]
    fn test_fallback_when_unset() {
        let source = ConfigPolicySource::new(|_| None, None, fallback());
        assert_eq!(source.current().unwrap(), fallback());
    }

    #[test]
    fn test_file_is_reread_each_time() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"gc older-than="10m""#).unwrap();
        let source =
            ConfigPolicySource::new(|_| None, Some(file.path().to_path_buf()), fallback());
        assert_eq!(source.current().unwrap().min_age, Duration::from_secs(600));

        std::fs::write(file.path(), r#"gc older-than="1d""#).unwrap();
        assert_eq!(source.current().unwrap().min_age, Duration::from_secs(86_400));
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let source = ConfigPolicySource::new(
            |key| (key == OLDER_THAN_ENV).then(|| "later".to_string()),
            None,
            fallback(),
        );
        assert!(matches!(
            source.current(),
            Err(tracksweep_core::Error::InvalidInput(_))
        ));
    }
}
