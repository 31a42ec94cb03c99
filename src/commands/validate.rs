use super::read_spec_file;
use anyhow::Context;
use campaigner::spec::CampaignSpec;
use console::style;
use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone)]
#[structopt(
    name = "validate",
    setting = structopt::clap::AppSettings::ColoredHelp,
    about = "Parse and validate a campaign spec without executing it"
)]
pub struct ValidateCommand {
    #[structopt(
        short = "f",
        long = "file",
        help = "The campaign spec file to read, or - for stdin"
    )]
    file: String,
}

impl ValidateCommand {
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let raw = read_spec_file(&self.file)?;
        let spec = CampaignSpec::parse(&raw).context("validating campaign spec")?;

        println!(
            "{} Campaign spec {:?} is valid ({} steps, {} on entries)",
            style("✔").green(),
            spec.name,
            spec.steps.len(),
            spec.on.len()
        );
        Ok(())
    }
}
