//! Server configuration: TOML file + CLI overrides.

use ptyd_core::{PtydError, PtydResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            shell: default_shell(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_shell() -> String {
    "/bin/bash".to_string()
}

/// Launch parameters handed to the supervisor for every session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Shell binary, invoked as a login shell.
    pub shell: PathBuf,
    /// Home directory each session starts in, when resolvable.
    pub home: Option<PathBuf>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub session: SessionConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_bind: Option<&str>,
        cli_shell: Option<&str>,
    ) -> PtydResult<Self> {
        // Load base config from file
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| PtydError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile {
                    server: ServerSection::default(),
                    session: SessionSection::default(),
                }
            }
        } else {
            ConfigFile {
                server: ServerSection::default(),
                session: SessionSection::default(),
            }
        };

        // Merge CLI overrides
        let port = cli_port.unwrap_or(file_config.server.port);
        let bind = cli_bind
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.bind);
        let shell = cli_shell
            .map(|s| s.to_string())
            .unwrap_or(file_config.session.shell);

        // Sessions start in the invoking user's home directory; a missing
        // HOME is tolerated and the shell starts wherever the server runs.
        let home = std::env::var_os("HOME").map(PathBuf::from);
        if home.is_none() {
            warn!("HOME is not set; sessions start in the server's working directory");
        }

        Ok(Self {
            bind,
            port,
            session: SessionConfig {
                shell: PathBuf::from(shell),
                home,
            },
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_service() {
        let section = ServerSection::default();
        assert_eq!(section.port, 8080);
        assert_eq!(section.bind, "0.0.0.0");
        assert_eq!(SessionSection::default().shell, "/bin/bash");
    }

    #[test]
    fn file_values_parse_and_cli_overrides_win() {
        let file: ConfigFile = toml::from_str(
            r#"
            [server]
            port = 2222

            [session]
            shell = "/bin/zsh"
            "#,
        )
        .expect("parse failed");
        assert_eq!(file.server.port, 2222);
        assert_eq!(file.session.shell, "/bin/zsh");
        // Omitted keys fall back to defaults.
        assert_eq!(file.server.bind, "0.0.0.0");

        let config = ServerConfig::load(None, Some(9999), None, Some("/bin/sh")).unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.session.shell, PathBuf::from("/bin/sh"));
    }
}
