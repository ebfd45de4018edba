//! Configuration validation.

use super::Config;
use crate::error::{DumpError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(DumpError::Config("source.host is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(DumpError::Config("source.user is required".into()));
    }
    if config.source.port == 0 {
        return Err(DumpError::Config("source.port must be non-zero".into()));
    }

    // Dump validation
    let dump = &config.dump;
    if dump.outdir.as_os_str().is_empty() {
        return Err(DumpError::Config("dump.outdir is required".into()));
    }
    if dump.threads == 0 {
        return Err(DumpError::Config("dump.threads must be at least 1".into()));
    }
    if dump.chunksize_mb == 0 {
        return Err(DumpError::Config(
            "dump.chunksize_mb must be at least 1".into(),
        ));
    }
    if dump.stmt_size == 0 {
        return Err(DumpError::Config("dump.stmt_size must be at least 1".into()));
    }
    if dump.interval_ms == 0 {
        return Err(DumpError::Config(
            "dump.interval_ms must be at least 1".into(),
        ));
    }

    // Compiles the pattern, if any
    dump.database_selection()?;

    for (table, columns) in &dump.selects {
        for (column, expr) in columns {
            if expr.trim().is_empty() {
                return Err(DumpError::Config(format!(
                    "dump.selects.{}.{} must not be empty",
                    table, column
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DumpConfig, SourceConfig};
    use std::collections::HashMap;

    fn valid_config() -> Config {
        Config {
            source: SourceConfig {
                host: "localhost".to_string(),
                port: 3306,
                user: "root".to_string(),
                password: "password".to_string(),
                session_vars: Vec::new(),
            },
            dump: DumpConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_user() {
        let mut config = valid_config();
        config.source.user = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_threads() {
        let mut config = valid_config();
        config.dump.threads = 0;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("threads"));
    }

    #[test]
    fn test_zero_chunk_and_statement_size() {
        let mut config = valid_config();
        config.dump.chunksize_mb = 0;
        assert!(validate(&config).is_err());

        let mut config = valid_config();
        config.dump.stmt_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_regexp() {
        let mut config = valid_config();
        config.dump.database_regexp = Some("[unclosed".to_string());
        assert!(matches!(validate(&config), Err(DumpError::Regex(_))));
    }

    #[test]
    fn test_empty_select_expression() {
        let mut config = valid_config();
        config.dump.selects.insert(
            "users".to_string(),
            HashMap::from([("email".to_string(), " ".to_string())]),
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_source_config_debug_redacts_password() {
        let mut config = valid_config();
        config.source.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.source);
        assert!(
            debug_output.contains("[REDACTED]"),
            "Debug output should contain [REDACTED]"
        );
        assert!(
            !debug_output.contains("super_secret_password_123"),
            "Debug output should not contain actual password value"
        );
    }
}
