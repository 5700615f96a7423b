//! TOML parser with helpful error messages

use std::path::Path;

use anyhow::{Context, Result};

use super::schema::ConvoyConfig;

/// Parse convoy.toml with detailed error messages
pub fn parse_convoy_toml(path: &Path) -> Result<ConvoyConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_convoy_toml_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse convoy.toml content from string
pub fn parse_convoy_toml_str(content: &str) -> Result<ConvoyConfig> {
    let config: ConvoyConfig =
        toml::from_str(content).map_err(|e| enhance_toml_error(e, content))?;
    config.validate()?;
    Ok(config)
}

/// Load `path`, or the default configuration when it does not exist.
pub fn load_config(path: &Path) -> Result<ConvoyConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(ConvoyConfig::default());
    }
    parse_convoy_toml(path)
}

/// Enhance TOML parsing errors with the offending lines
fn enhance_toml_error(error: toml::de::Error, content: &str) -> anyhow::Error {
    let error_msg = error.to_string();

    let line_hint = error
        .span()
        .and_then(|span| content.get(..span.start))
        .map(|prefix| prefix.lines().count().max(1));

    match line_hint {
        Some(line_num) => anyhow::anyhow!(
            "TOML parsing error at line {}:\n{}\n\nError: {}",
            line_num,
            get_line_context(content, line_num),
            error_msg
        ),
        None => anyhow::anyhow!("TOML parsing error: {}", error_msg),
    }
}

/// Get context lines around an error
fn get_line_context(content: &str, line_num: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = line_num.saturating_sub(2);
    let end = (line_num + 2).min(lines.len());

    lines[start.min(end)..end]
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let num = start + i + 1;
            let marker = if num == line_num { ">>>" } else { "   " };
            format!("{} {:4} | {}", marker, num, line)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Serialize a configuration to TOML string
pub fn to_toml(config: &ConvoyConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to serialize configuration to TOML")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[intent]
kind = "filesystem"
root = "/var/lib/convoy/intent"

[state]
kind = "git"
path = "/var/lib/convoy/state"
remote = "origin"

[worktrees]
scratch_dir = "/tmp/wt"
[worktrees.repos]
"github.com/acme/app" = "/src/app"
"#;
        let config = parse_convoy_toml_str(toml).expect("parse should succeed");
        assert_eq!(
            config.intent,
            BackendConfig::Filesystem {
                root: PathBuf::from("/var/lib/convoy/intent")
            }
        );
        let BackendConfig::Git { branch, remote, .. } = &config.state else {
            panic!("expected git state backend");
        };
        assert_eq!(branch, "main");
        assert_eq!(remote.as_deref(), Some("origin"));
        let worktrees = config.worktrees.expect("worktrees should be set");
        assert_eq!(worktrees.repos["github.com/acme/app"], PathBuf::from("/src/app"));
    }

    #[test]
    fn test_parse_empty_config() {
        let config = parse_convoy_toml_str("").expect("parse should succeed");
        assert_eq!(config, ConvoyConfig::default());
        assert_eq!(config.state, BackendConfig::Memory);
    }

    #[test]
    fn test_parse_error_points_at_line() {
        let toml = "[state]\nkind = \"git\"\npath = \n";
        let err = parse_convoy_toml_str(toml).expect_err("parse should fail");
        assert!(err.to_string().contains("line 3"), "{}", err);
    }

    #[test]
    fn test_validation_rejects_wrong_scheme() {
        let toml = "[state]\nkind = \"s3\"\nurl = \"https://example.com/bucket\"\n";
        assert!(parse_convoy_toml_str(toml).is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let config = ConvoyConfig {
            intent: BackendConfig::Filesystem {
                root: PathBuf::from("/tmp/intent"),
            },
            ..ConvoyConfig::default()
        };
        let mut file = NamedTempFile::new().expect("tempfile should succeed");
        file.write_all(to_toml(&config).expect("serialize should succeed").as_bytes())
            .expect("write should succeed");
        assert_eq!(load_config(file.path()).expect("load should succeed"), config);
        assert_eq!(
            load_config(Path::new("/nonexistent/convoy.toml")).expect("load should succeed"),
            ConvoyConfig::default()
        );
    }
}
