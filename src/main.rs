use clap::Parser;
use log::LevelFilter;

use rtptun::cli::{Cli, Command};
use rtptun::crypto::Cipher;
use rtptun::{client, server};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // clap's own `.exit()` uses code 2 for usage errors; the spec calls for
    // a flat exit 1 on any invalid-argument or fatal-startup condition, so
    // parse manually rather than via `Cli::parse()`.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            err.print().ok();
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    };

    env_logger::Builder::new()
        .filter_level(if cli.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .parse_default_env()
        .init();

    match cli.command {
        Command::Genkey => {
            println!("{}", Cipher::gen_key());
            Ok(())
        }
        Command::Client(args) => client::run(args.into()).await,
        Command::Server(args) => server::run(args.into()).await,
    }
}
