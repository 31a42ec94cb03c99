mod commands;
mod reporter;

use commands::*;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

#[derive(StructOpt, Debug, Clone)]
#[structopt(
    name = "campaigner",
    setting = structopt::clap::AppSettings::ColoredHelp,
    about = "Apply declarative campaign specs across many repositories"
)]
struct Campaigner {
    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(StructOpt, Debug, Clone)]
enum Command {
    Apply(ApplyCommand),
    Validate(ValidateCommand),
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("CAMPAIGNER_LOG"))
        .with_writer(std::io::stderr)
        .init();

    match Campaigner::from_args().cmd {
        Command::Apply(cmd) => cmd.run().await,
        Command::Validate(cmd) => cmd.run().await,
    }
}
