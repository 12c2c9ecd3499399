//! The binary entrypoint for `kiln`, the content-addressed stage build
//! engine.

use clap::{crate_version, Parser, Subcommand};
use color_eyre::Result;
use tracing::instrument;
use tracing_subscriber::util::SubscriberInitExt;

// Nothing in this binary crate should be `pub`; keeping these modules
// private lets rustc warn correctly about dead code within them.
mod cmd;
mod log;
mod wiring;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "kiln",
    about = "Content-addressed container image stage build engine",
    version = format!("v{} engine {}", crate_version!(), kiln::ENGINE_VERSION),
)]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// When to colorize log output.
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Run the stage conveyor over every image in the project
    Build(cmd::build::Options),

    /// Reclaim stage artifacts the project no longer needs
    Cleanup(cmd::cleanup::Options),

    /// Drop every artifact the project has ever published
    Purge(cmd::purge::Options),

    /// Registry-wide operations that are not tied to a single build
    #[clap(subcommand)]
    Stages(cmd::stages::Command),
}

#[instrument]
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();

    log::make_logger(std::io::stderr, top.color).init();

    match top.command {
        Command::Build(options) => cmd::build::exec(options).await,
        Command::Cleanup(options) => cmd::cleanup::exec(options).await,
        Command::Purge(options) => cmd::purge::exec(options).await,
        Command::Stages(cmd::stages::Command::Cleanup(options)) => cmd::stages::cleanup::exec(options).await,
    }
}
