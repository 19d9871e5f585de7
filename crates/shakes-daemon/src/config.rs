//! CLI flags (§6) layered over the TOML [`shakes_core::Config`].

use std::path::PathBuf;

use clap::Parser;
use shakes_core::Config;

/// `sphubd` - the shakespeer hub/peer daemon.
#[derive(Parser, Debug)]
#[command(name = "sphubd", version)]
pub struct CliArgs {
    /// Working directory holding sphubd.pid, queue2.db, slots2.db, tth/ (§6).
    #[arg(short = 'w', long = "working-dir")]
    pub working_dir: Option<PathBuf>,

    /// Detach and run as a background daemon.
    #[arg(short = 'd', long = "daemonize")]
    pub daemonize: bool,

    /// Stay in the foreground even if daemonize is configured.
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,

    /// Override the configured listen port.
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,
}

impl CliArgs {
    /// Apply CLI overrides on top of the loaded TOML config; flags win.
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(dir) = &self.working_dir {
            config.paths.working_dir = dir.clone();
        }
        config
    }

    pub fn should_daemonize(&self) -> bool {
        self.daemonize && !self.foreground
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_flag_overrides_config() {
        let args = CliArgs { working_dir: None, daemonize: false, foreground: false, port: Some(9999) };
        let config = args.apply(Config::default());
        assert_eq!(config.network.port, 9999);
    }

    #[test]
    fn foreground_wins_over_daemonize() {
        let args = CliArgs { working_dir: None, daemonize: true, foreground: true, port: None };
        assert!(!args.should_daemonize());
    }

    #[test]
    fn working_dir_flag_overrides_config() {
        let args = CliArgs { working_dir: Some(PathBuf::from("/srv/sphubd")), daemonize: false, foreground: false, port: None };
        let config = args.apply(Config::default());
        assert_eq!(config.paths.working_dir, PathBuf::from("/srv/sphubd"));
    }
}
