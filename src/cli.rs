//! Command-line surface: `genkey`, `client`, and `server` subcommands.

use clap::{Args, Parser, Subcommand};

use crate::client::ClientOptions;
use crate::constants::{
    DEFAULT_CLIENT_LISTEN, DEFAULT_DEST_ADDR, DEFAULT_SERVER_LISTEN, DEFAULT_SERVER_PORT,
    DEFAULT_TIMEOUT_SECS,
};
use crate::server::ServerOptions;

#[derive(Parser)]
#[command(name = "rtptun", about = "Tunnels UDP traffic over encrypted fake RTP streams")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Raise logging to debug level.
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generates a fresh base64-encoded key and prints it to stdout.
    Genkey,
    /// Tunnels local UDP traffic to a remote rtptun server.
    Client(ClientArgs),
    /// Accepts tunneled traffic and forwards it to a local destination.
    Server(ServerArgs),
}

#[derive(Args)]
pub struct ClientArgs {
    /// Local address to accept plain UDP traffic on.
    #[arg(short = 'i', long = "listen-addr", default_value = DEFAULT_CLIENT_LISTEN)]
    pub listen_addr: String,

    /// Local port to accept plain UDP traffic on.
    #[arg(short = 'l', long = "listen-port")]
    pub listen_port: u16,

    /// Address of the rtptun server to tunnel to.
    #[arg(short = 'd', long = "dest-addr")]
    pub dest_addr: String,

    /// Port of the rtptun server to tunnel to.
    #[arg(short = 'p', long = "dest-port")]
    pub dest_port: u16,

    /// Base64 key shared with the server, as printed by `genkey`.
    #[arg(short = 'k', long)]
    pub key: String,

    /// Seconds of inactivity before a flow is torn down.
    #[arg(long = "timeout", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,
}

impl From<ClientArgs> for ClientOptions {
    fn from(args: ClientArgs) -> ClientOptions {
        ClientOptions {
            listen_addr: args.listen_addr,
            listen_port: args.listen_port,
            dest_addr: args.dest_addr,
            dest_port: args.dest_port,
            key: args.key,
            timeout_secs: args.timeout_secs,
        }
    }
}

#[derive(Args)]
pub struct ServerArgs {
    /// Local address to accept tunneled traffic on.
    #[arg(short = 'i', long = "listen-addr", default_value = DEFAULT_SERVER_LISTEN)]
    pub listen_addr: String,

    /// Local port to accept tunneled traffic on.
    #[arg(short = 'l', long = "listen-port", default_value_t = DEFAULT_SERVER_PORT)]
    pub listen_port: u16,

    /// Address of the local service to forward decrypted traffic to.
    #[arg(short = 'd', long = "dest-addr", default_value = DEFAULT_DEST_ADDR)]
    pub dest_addr: String,

    /// Port of the local service to forward decrypted traffic to.
    #[arg(short = 'p', long = "dest-port")]
    pub dest_port: u16,

    /// Base64 key shared with clients, as printed by `genkey`.
    #[arg(short = 'k', long)]
    pub key: String,

    /// Seconds of inactivity before a flow is torn down.
    #[arg(long = "timeout", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,
}

impl From<ServerArgs> for ServerOptions {
    fn from(args: ServerArgs) -> ServerOptions {
        ServerOptions {
            listen_addr: args.listen_addr,
            listen_port: args.listen_port,
            dest_addr: args.dest_addr,
            dest_port: args.dest_port,
            key: args.key,
            timeout_secs: args.timeout_secs,
        }
    }
}
