//! Command-line argument parsing.

use clap::Parser;

/// quantix-backup - Archive VMs and their storage into a borg repository
#[derive(Parser, Debug)]
#[command(name = "quantix-backup")]
#[command(about = "Shut down, archive, and restart VMs into a borg repository")]
#[command(version)]
pub struct Args {
    /// Borg repository (local path or ssh://user@host/path)
    pub repository: String,
    
    /// Back up only this machine (default: every machine not excluded)
    pub machine: Option<String>,
    
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,
    
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
    
    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,
    
    /// Repository passphrase
    #[arg(long, env = "BORG_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,
    
    /// Libvirt connection URI
    #[arg(long)]
    pub libvirt_uri: Option<String>,
    
    /// Skip this machine (repeatable, added to the configured exclusions)
    #[arg(long = "exclude", value_name = "NAME")]
    pub exclude: Vec<String>,
    
    /// Give up on a machine that has not powered off after this many seconds
    #[arg(long, value_name = "SECS")]
    pub shutdown_timeout: Option<u64>,
    
    /// Exit non-zero when any archive or machine failed
    #[arg(long)]
    pub strict: bool,
    
    /// Enable development mode (mock hypervisor, disks, and repository)
    #[arg(long)]
    pub dev: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_positional_arguments() {
        let args = Args::parse_from(["quantix-backup", "/srv/borg", "db1"]);
        assert_eq!(args.repository, "/srv/borg");
        assert_eq!(args.machine.as_deref(), Some("db1"));
        assert!(!args.strict);
    }

    #[test]
    fn test_repeated_exclude() {
        let args = Args::parse_from([
            "quantix-backup", "/srv/borg", "--exclude", "scratch", "--exclude", "ci-runner",
        ]);
        assert!(args.machine.is_none());
        assert_eq!(args.exclude, vec!["scratch", "ci-runner"]);
    }
}
