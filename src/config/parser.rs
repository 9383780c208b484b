use crate::config::types::Config;
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Loads and parses a configuration file from the given path
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Returns
///
/// * `Ok(Config)` - Successfully loaded and validated configuration
/// * `Err(ConfigError)` - Failed to load, parse, or validate the configuration
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parses and validates configuration from TOML text
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

/// Computes a SHA-256 hash of the configuration file content
///
/// Stored with each run in the run ledger so a resumed run can tell whether
/// the configuration changed underneath it.
///
/// # Returns
///
/// * `Ok(String)` - Hex-encoded SHA-256 hash of the file content
/// * `Err(ConfigError)` - Failed to read the file
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Loads a configuration and returns both the config and its hash
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let config = load_config(path)?;
    let hash = compute_config_hash(path)?;
    Ok((config, hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    const MINIMAL: &str = r#"
[target]
base-url = "https://shop.example.com/c/jewelry"

[output]
records-path = "./listings.csv"
checkpoint-path = "./checkpoint.json"
ledger-path = "./harvest.db"
results-path = "./results.json"
"#;

    #[test]
    fn test_load_minimal_config_applies_defaults() {
        let file = create_temp_config(MINIMAL);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.target.page_param, "page");
        assert!(config.target.ref_param.is_none());
        assert_eq!(config.rate_limit.min_delay_ms, 3_000);
        assert_eq!(config.rate_limit.max_delay_ms, 8_000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.session.pool_size, 3);
        assert_eq!(config.session.max_requests, 50);
        assert_eq!(config.detection.block_statuses, vec![403, 503]);
        assert_eq!(config.detection.rate_limit_statuses, vec![429]);
        assert!(config.crawl.tolerate_page_failures);
        assert_eq!(config.crawl.page_cap, None);
    }

    #[test]
    fn test_load_full_config() {
        let content = r#"
[target]
base-url = "https://shop.example.com/c/jewelry"
page-param = "p"
ref-param = "ref"

[crawl]
page-cap = 20
tolerate-page-failures = false
max-consecutive-failures = 5

[rate-limit]
min-delay-ms = 100
max-delay-ms = 200

[retry]
max-attempts = 4
base-delay-ms = 10
backoff-factor = 1.5
jitter = 0.0

[session]
pool-size = 2
max-requests = 10
user-agents = ["AgentA/1.0", "AgentB/2.0"]

[detection]
block-statuses = [403]
challenge-markers = ["captcha"]
valid-page-markers = ["search-results"]

[transport]
timeout-secs = 5
proxy-url = "http://127.0.0.1:8080"

[output]
records-path = "./listings.csv"
checkpoint-path = "./checkpoint.json"
ledger-path = "./harvest.db"
results-path = "./results.json"
"#;
        let file = create_temp_config(content);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.target.page_param, "p");
        assert_eq!(config.target.ref_param.as_deref(), Some("ref"));
        assert_eq!(config.crawl.page_cap, Some(20));
        assert!(!config.crawl.tolerate_page_failures);
        assert_eq!(config.rate_limit.max_delay_ms, 200);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.soft_block_attempts, 3);
        assert_eq!(config.session.user_agents.len(), 2);
        assert_eq!(config.detection.challenge_markers, vec!["captcha"]);
        assert_eq!(
            config.transport.proxy_url.as_deref(),
            Some("http://127.0.0.1:8080")
        );
    }

    #[test]
    fn test_load_config_with_invalid_path() {
        let result = load_config(Path::new("/nonexistent/harvest.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_with_invalid_toml() {
        let file = create_temp_config("this is not valid TOML {{{");
        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_config_with_validation_error() {
        let content = MINIMAL.replace(
            "[output]",
            "[rate-limit]\nmin-delay-ms = 500\nmax-delay-ms = 100\n\n[output]",
        );
        let file = create_temp_config(&content);
        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_compute_config_hash() {
        let file = create_temp_config("test content");

        let hash1 = compute_config_hash(file.path()).unwrap();
        let hash2 = compute_config_hash(file.path()).unwrap();

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_different_content_different_hash() {
        let file1 = create_temp_config("content 1");
        let file2 = create_temp_config("content 2");

        assert_ne!(
            compute_config_hash(file1.path()).unwrap(),
            compute_config_hash(file2.path()).unwrap()
        );
    }
}
