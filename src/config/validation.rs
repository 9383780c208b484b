use crate::config::types::{
    Config, CrawlConfig, DetectionConfig, OutputConfig, RateLimitConfig, RetryConfig,
    SessionConfig, TargetConfig, TransportConfig,
};
use crate::ConfigError;
use url::Url;

const MAX_POOL_SIZE: u32 = 32;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_target_config(&config.target)?;
    validate_crawl_config(&config.crawl)?;
    validate_rate_limit_config(&config.rate_limit)?;
    validate_retry_config(&config.retry)?;
    validate_session_config(&config.session)?;
    validate_detection_config(&config.detection)?;
    validate_transport_config(&config.transport)?;
    validate_output_config(&config.output)?;
    Ok(())
}

/// Validates the crawl target
fn validate_target_config(config: &TargetConfig) -> Result<(), ConfigError> {
    validate_http_url("base_url", &config.base_url)?;

    if config.page_param.is_empty() {
        return Err(ConfigError::Validation(
            "page_param cannot be empty".to_string(),
        ));
    }

    if let Some(ref_param) = &config.ref_param {
        if ref_param.is_empty() || ref_param == &config.page_param {
            return Err(ConfigError::Validation(format!(
                "ref_param must be non-empty and differ from page_param, got '{}'",
                ref_param
            )));
        }
    }

    Ok(())
}

fn validate_crawl_config(config: &CrawlConfig) -> Result<(), ConfigError> {
    if config.page_cap == Some(0) {
        return Err(ConfigError::Validation(
            "page_cap must be >= 1 when present".to_string(),
        ));
    }

    if config.max_consecutive_failures < 1 {
        return Err(ConfigError::Validation(format!(
            "max_consecutive_failures must be >= 1, got {}",
            config.max_consecutive_failures
        )));
    }

    Ok(())
}

fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<(), ConfigError> {
    if config.min_delay_ms > config.max_delay_ms {
        return Err(ConfigError::Validation(format!(
            "rate-limit min_delay_ms ({}) must not exceed max_delay_ms ({})",
            config.min_delay_ms, config.max_delay_ms
        )));
    }
    Ok(())
}

fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    let attempt_caps = [
        ("max_attempts", config.max_attempts),
        ("soft_block_attempts", config.soft_block_attempts),
        ("hard_block_attempts", config.hard_block_attempts),
        ("malformed_attempts", config.malformed_attempts),
    ];
    for (name, value) in attempt_caps {
        if value < 1 {
            return Err(ConfigError::Validation(format!(
                "{} must be >= 1, got {}",
                name, value
            )));
        }
    }

    if !(config.backoff_factor >= 1.0) {
        return Err(ConfigError::Validation(format!(
            "backoff_factor must be >= 1.0, got {}",
            config.backoff_factor
        )));
    }

    if !(0.0..1.0).contains(&config.jitter) {
        return Err(ConfigError::Validation(format!(
            "jitter must be in [0, 1), got {}",
            config.jitter
        )));
    }

    if config.base_delay_ms > config.max_delay_ms {
        return Err(ConfigError::Validation(format!(
            "retry base_delay_ms ({}) must not exceed max_delay_ms ({})",
            config.base_delay_ms, config.max_delay_ms
        )));
    }

    if config.soft_block_cooldown_min_ms > config.soft_block_cooldown_max_ms {
        return Err(ConfigError::Validation(format!(
            "soft_block_cooldown_min_ms ({}) must not exceed soft_block_cooldown_max_ms ({})",
            config.soft_block_cooldown_min_ms, config.soft_block_cooldown_max_ms
        )));
    }

    Ok(())
}

fn validate_session_config(config: &SessionConfig) -> Result<(), ConfigError> {
    if config.pool_size < 1 || config.pool_size > MAX_POOL_SIZE {
        return Err(ConfigError::Validation(format!(
            "pool_size must be between 1 and {}, got {}",
            MAX_POOL_SIZE, config.pool_size
        )));
    }

    if config.max_requests < 1 {
        return Err(ConfigError::Validation(format!(
            "session max_requests must be >= 1, got {}",
            config.max_requests
        )));
    }

    if config.max_age_secs < 1 {
        return Err(ConfigError::Validation(format!(
            "session max_age_secs must be >= 1, got {}",
            config.max_age_secs
        )));
    }

    if config.user_agents.iter().any(|ua| ua.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "user_agents cannot contain empty entries".to_string(),
        ));
    }

    Ok(())
}

fn validate_detection_config(config: &DetectionConfig) -> Result<(), ConfigError> {
    for status in config
        .block_statuses
        .iter()
        .chain(config.rate_limit_statuses.iter())
    {
        if !(100..=599).contains(status) {
            return Err(ConfigError::Validation(format!(
                "HTTP status {} is outside 100..=599",
                status
            )));
        }
    }

    let markers = config
        .challenge_markers
        .iter()
        .chain(config.challenge_headers.iter())
        .chain(config.valid_page_markers.iter());
    for marker in markers {
        if marker.is_empty() {
            return Err(ConfigError::Validation(
                "detection markers cannot be empty strings".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_transport_config(config: &TransportConfig) -> Result<(), ConfigError> {
    if config.timeout_secs < 1 || config.connect_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "transport timeouts must be >= 1 second".to_string(),
        ));
    }

    if let Some(proxy) = &config.proxy_url {
        Url::parse(proxy)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid proxy_url: {}", e)))?;
    }

    Ok(())
}

fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    let paths = [
        ("records_path", &config.records_path),
        ("checkpoint_path", &config.checkpoint_path),
        ("ledger_path", &config.ledger_path),
        ("results_path", &config.results_path),
    ];
    for (name, value) in paths {
        if value.is_empty() {
            return Err(ConfigError::Validation(format!("{} cannot be empty", name)));
        }
    }
    Ok(())
}

/// Checks that a URL parses and uses http or https
fn validate_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid {} '{}': {}", field, value, e)))?;

    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::Validation(format!(
            "{} must use http or https, got '{}'",
            field, other
        ))),
    }
}
