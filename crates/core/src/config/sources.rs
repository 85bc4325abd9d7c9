use std::fmt;
use std::path::PathBuf;

/// Where an effective configuration value came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Built-in default
    Default,
    /// Environment variable with this name
    EnvVar(String),
    /// YAML configuration file
    File(PathBuf),
    /// Command-line flag
    CommandLine,
}

impl ConfigSource {
    pub fn is_default(&self) -> bool {
        matches!(self, ConfigSource::Default)
    }

    pub fn is_env_var(&self) -> bool {
        matches!(self, ConfigSource::EnvVar(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, ConfigSource::File(_))
    }

    pub fn is_command_line(&self) -> bool {
        matches!(self, ConfigSource::CommandLine)
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::EnvVar(var) => write!(f, "${}", var),
            ConfigSource::File(path) => write!(f, "file {}", path.display()),
            ConfigSource::CommandLine => write!(f, "command line"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_origin() {
        assert_eq!(ConfigSource::Default.to_string(), "default");
        assert_eq!(
            ConfigSource::EnvVar("SHALE_STATE_TABLE".to_string()).to_string(),
            "$SHALE_STATE_TABLE"
        );
        assert_eq!(
            ConfigSource::File(PathBuf::from("shale.yaml")).to_string(),
            "file shale.yaml"
        );
        assert!(ConfigSource::CommandLine.is_command_line());
    }
}
