use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::server::{EchoPolicy, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host a conversation tree and relay messages between clients.
    Serve(ServeArgs),
    /// Connect to a server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the server should bind to. Use 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:7777")]
    pub listen: SocketAddr,

    /// Whether new messages are echoed back to the client that sent them.
    #[arg(long, value_enum, default_value_t = EchoPolicy::All)]
    pub echo: EchoPolicy,

    /// Broadcast a system message whenever a client connects.
    #[arg(long)]
    pub announce_joins: bool,

    /// Number of recent message ids advertised in WELCOME.
    #[arg(long, default_value_t = 25)]
    pub recent: usize,

    /// Frames buffered per client before the client is dropped as too slow.
    #[arg(long, default_value_t = 256)]
    pub outbound_queue: usize,

    /// Content of the root message every thread descends from.
    #[arg(long, default_value = "Welcome to arbor")]
    pub root_content: String,

    /// Author name used for the root and for system announcements.
    #[arg(long, default_value = "arbor")]
    pub system_author: String,
}

impl From<&ServeArgs> for ServerConfig {
    fn from(args: &ServeArgs) -> Self {
        Self {
            echo: args.echo,
            announce_joins: args.announce_joins,
            recent_capacity: args.recent,
            outbound_queue: args.outbound_queue,
            system_author: args.system_author.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name shown as the author of messages you send.
    #[arg(long)]
    pub username: String,

    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:7777")]
    pub server: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults_match_server_config() {
        let cli = Cli::try_parse_from(["arbor", "serve"]).unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = ServerConfig::from(&args);
        let defaults = ServerConfig::default();
        assert_eq!(config.echo, defaults.echo);
        assert_eq!(config.recent_capacity, defaults.recent_capacity);
        assert_eq!(config.outbound_queue, defaults.outbound_queue);
        assert_eq!(config.system_author, defaults.system_author);
        assert!(!config.announce_joins);
    }

    #[test]
    fn serve_flags_are_parsed() {
        let cli = Cli::try_parse_from([
            "arbor",
            "serve",
            "--listen",
            "127.0.0.1:0",
            "--echo",
            "exclude-origin",
            "--announce-joins",
            "--recent",
            "5",
        ])
        .unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = ServerConfig::from(&args);
        assert_eq!(config.echo, EchoPolicy::ExcludeOrigin);
        assert!(config.announce_joins);
        assert_eq!(config.recent_capacity, 5);
    }

    #[test]
    fn client_requires_username() {
        assert!(Cli::try_parse_from(["arbor", "client"]).is_err());
        let cli = Cli::try_parse_from(["arbor", "client", "--username", "alice"]).unwrap();
        assert!(matches!(cli.command, Command::Client(args) if args.username == "alice"));
    }
}
