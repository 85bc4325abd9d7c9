use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}. {hint}")]
    MissingRequired { field: String, hint: String },

    #[error("Invalid value for field '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("File system error: {message}")]
    FileSystemError { message: String },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    /// Create a missing required field error
    pub fn missing_required(field: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingRequired {
            field: field.into(),
            hint: hint.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }

    /// Create a validation failed error
    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }
}

/// Trait for validating configuration values
pub trait ConfigValidator<T: ?Sized> {
    /// Validate a configuration value
    fn validate(&self, value: &T) -> Result<(), ConfigError>;
}

/// Database URL validator
pub struct DatabaseUrlValidator {
    pub schemes: Vec<String>,
}

impl Default for DatabaseUrlValidator {
    fn default() -> Self {
        Self {
            schemes: vec!["postgres".to_string(), "postgresql".to_string()],
        }
    }
}

impl ConfigValidator<str> for DatabaseUrlValidator {
    fn validate(&self, value: &str) -> Result<(), ConfigError> {
        let parsed = url::Url::parse(value).map_err(|e| {
            ConfigError::invalid_value("database_url", redact_url(value), format!("valid URL ({})", e))
        })?;

        if !self.schemes.iter().any(|s| s == parsed.scheme()) {
            return Err(ConfigError::invalid_value(
                "database_url",
                redact_url(value),
                format!("URL with scheme {}", self.schemes.join(" or ")),
            ));
        }

        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(ConfigError::invalid_value(
                "database_url",
                redact_url(value),
                "URL with a host",
            ));
        }

        Ok(())
    }
}

/// Validator for SQL identifiers used as the bookkeeping table name.
///
/// The table name is interpolated into bookkeeping SQL, so only plain
/// identifiers (optionally schema-qualified) are accepted.
pub struct IdentifierValidator;

impl ConfigValidator<str> for IdentifierValidator {
    fn validate(&self, value: &str) -> Result<(), ConfigError> {
        let valid_part = |part: &str| {
            let mut chars = part.chars();
            match chars.next() {
                Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                }
                _ => false,
            }
        };

        let parts: Vec<&str> = value.split('.').collect();
        if value.is_empty() || parts.len() > 2 || !parts.iter().all(|p| valid_part(p)) {
            return Err(ConfigError::invalid_value(
                "state_table",
                value,
                "SQL identifier like 'shale_migrations' or 'ops.shale_migrations'",
            ));
        }
        Ok(())
    }
}

/// Hide the password component of a connection URL for display
pub fn redact_url(value: &str) -> String {
    match url::Url::parse(value) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("****"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<unparseable url>".to_string(),
    }
}
