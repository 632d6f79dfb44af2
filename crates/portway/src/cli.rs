//! Command-line surface.
//!
//! Commands mirror the manager's operations: `start`, `stop`, `restart`,
//! `status`, `test` and `monitor`. A bare `ip,password[,bot_token[,admin…]]`
//! argument may precede the command; only the address and password are
//! consumed here, the trailing fields belong to the external notifier.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

/// Ports used when none are given on the command line.
pub const DEFAULT_PORTS: [u16; 3] = [1080, 1081, 1082];

#[derive(Debug, Parser)]
#[command(name = "portway", version, about = "SOCKS5 proxies served through supervised SSH reverse tunnels")]
pub struct Cli {
    /// TOML config file with fleet defaults
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Start tunnels and keep monitoring them (default)
    Start {
        /// Remote ports to expose (default: 1080 1081 1082)
        ports: Vec<u16>,
        /// Clean up stale state from a previous run without asking
        #[arg(long, short)]
        force: bool,
    },
    /// Stop the tunnels of a previous run
    Stop,
    /// Stop, then start again
    Restart {
        ports: Vec<u16>,
        #[arg(long, short)]
        force: bool,
    },
    /// Show the state left behind by a previous run
    Status {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Test SSH connectivity to the remote host
    Test,
    /// Alias for `start`
    Monitor { ports: Vec<u16> },
}

/// Connection override taken from a bare `ip,password[,…]` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionArg {
    pub host: String,
    pub password: String,
}

impl FromStr for ConnectionArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(',');
        let host = fields.next().unwrap_or_default().trim();
        let password = fields.next().unwrap_or_default().trim();
        if host.is_empty() || password.is_empty() {
            return Err(format!(
                "expected ip,password[,bot_token[,admin_id…]], got '{}'",
                s
            ));
        }
        // Remaining fields (bot token, admin ids) are for the notifier.
        Ok(Self {
            host: host.to_string(),
            password: password.to_string(),
        })
    }
}

/// Split a leading connection argument off argv before clap parsing.
///
/// The connection argument is recognized by its comma; everything else is
/// left for clap untouched.
pub fn split_connection_arg(mut args: Vec<String>) -> (Option<ConnectionArg>, Vec<String>) {
    if args.len() > 1 && args[1].contains(',') {
        let raw = args.remove(1);
        match raw.parse() {
            Ok(conn) => return (Some(conn), args),
            Err(_) => {
                // Not a valid connection argument; let clap report it.
                args.insert(1, raw);
            }
        }
    }
    (None, args)
}

/// Apply the default port list when none were given.
pub fn effective_ports(ports: &[u16]) -> Vec<u16> {
    if ports.is_empty() {
        DEFAULT_PORTS.to_vec()
    } else {
        ports.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_connection_arg_parse() {
        let conn: ConnectionArg = "203.0.113.9,secret".parse().unwrap();
        assert_eq!(conn.host, "203.0.113.9");
        assert_eq!(conn.password, "secret");

        // Notifier fields are accepted and ignored.
        let conn: ConnectionArg = "203.0.113.9,secret,12345:token,42,43".parse().unwrap();
        assert_eq!(conn.host, "203.0.113.9");
        assert_eq!(conn.password, "secret");

        assert!("203.0.113.9".parse::<ConnectionArg>().is_err());
        assert!(",".parse::<ConnectionArg>().is_err());
    }

    #[test]
    fn test_split_connection_arg() {
        let (conn, rest) = split_connection_arg(argv(&["portway", "1.2.3.4,pw", "start", "1080"]));
        assert_eq!(
            conn,
            Some(ConnectionArg {
                host: "1.2.3.4".into(),
                password: "pw".into()
            })
        );
        assert_eq!(rest, argv(&["portway", "start", "1080"]));

        let (conn, rest) = split_connection_arg(argv(&["portway", "start"]));
        assert!(conn.is_none());
        assert_eq!(rest, argv(&["portway", "start"]));
    }

    #[test]
    fn test_effective_ports_default() {
        assert_eq!(effective_ports(&[]), vec![1080, 1081, 1082]);
        assert_eq!(effective_ports(&[1090]), vec![1090]);
    }

    #[test]
    fn test_cli_parses_commands() {
        let cli = Cli::try_parse_from(["portway", "start", "1080", "1081", "--force"]).unwrap();
        match cli.command {
            Some(CliCommand::Start { ports, force }) => {
                assert_eq!(ports, vec![1080, 1081]);
                assert!(force);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from(["portway", "status", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(CliCommand::Status { json: true })
        ));

        let cli = Cli::try_parse_from(["portway"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_config_flag() {
        let cli = Cli::try_parse_from(["portway", "--config", "/etc/portway.toml", "test"]).unwrap();
        assert_eq!(
            cli.config.as_deref(),
            Some(std::path::Path::new("/etc/portway.toml"))
        );
    }
}
