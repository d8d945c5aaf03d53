//! mqtunnel CLI
//!
//! - `start`: serve tunnels that peers open through the control topic
//! - `connect`: open one static tunnel from a local port to a peer's port

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use mqt_core::config::ConfigSource;
use mqtunnel::{connect_tunnel, start_tunnel, STATUS_OK};

#[derive(Parser)]
#[command(name = "mqtunnel")]
#[command(author, version, about = "Tunnel TCP byte streams through an MQTT broker")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve tunnels opened by peers on the control topic
    Start {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Open a static tunnel from a local port to a port on the peer
    Connect {
        #[command(flatten)]
        session: SessionArgs,
        /// Local port to listen on (127.0.0.1)
        #[arg(short, long)]
        local: u16,
        /// Port the peer dials on its side
        #[arg(short, long)]
        remote: u16,
    },
}

#[derive(Args)]
struct SessionArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Control topic (overrides config)
    #[arg(long)]
    control: Option<String>,

    /// Log level: 0=debug, 1=info, 2=warn, 3=error, 6=fatal
    #[arg(long, default_value_t = 1, env = "MQTUNNEL_LOG_LEVEL")]
    log_level: i32,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct SourceArgs {
    /// Path to configuration file
    #[arg(short, long, env = "MQTUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Inline TOML configuration
    #[arg(long)]
    config_toml: Option<String>,
}

impl SourceArgs {
    fn source(self) -> ConfigSource {
        match (self.config, self.config_toml) {
            (_, Some(content)) => ConfigSource::Buffer(content),
            (Some(path), None) => ConfigSource::File(path),
            (None, None) => ConfigSource::Buffer(String::new()),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let status = match cli.command {
        Commands::Start { session } => {
            let source = session.source.source();
            start_tunnel(&source, session.control.as_deref(), session.log_level)
        }
        Commands::Connect {
            session,
            local,
            remote,
        } => {
            let source = session.source.source();
            connect_tunnel(&source, session.control.as_deref(), local, remote, session.log_level)
        }
    };

    if status == STATUS_OK {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
