use std::path::PathBuf;

use clap::Parser;
use netloop::reactor::Loop;
use netloop::service::{open_output, setup_tracing, Netlogger};
use netloop::{AppResult, NetloggerConfig};
use tracing::info;

#[derive(Parser)]
#[command(version, about = "Collects netstring log entries from the network")]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: debug, vv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();
    let _guard = setup_tracing(commandline.verbose)?;

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = NetloggerConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let mut lp = Loop::with_config(&config.reactor)?;
    lp.hook_shutdown()?;
    let netlogger = Netlogger::start(&mut lp, &config, open_output(&config.netlog.output)?)?;
    info!("netlogger collecting on {}", netlogger.local_addr());

    lp.dispatch()?;
    info!("netlogger stopped after {} entries", netlogger.entries());
    Ok(())
}
