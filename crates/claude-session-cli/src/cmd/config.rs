use std::path::Path;

use clap::Subcommand;

use crate::config::Config;
use crate::output::print_json;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration
    Show,
}

pub fn run(config_path: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(config_path, json),
    }
}

fn show(config_path: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    // Surface routing mistakes here rather than at the next run.
    let registry = config.registry()?;

    if json {
        return print_json(&serde_json::json!({
            "path": config_path,
            "exists": config_path.exists(),
            "config": config,
            "default_scenario": registry.default_scenario(),
        }));
    }

    let origin = if config_path.exists() {
        ""
    } else {
        " (not found; using defaults)"
    };
    println!("# {}{origin}", config_path.display());
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
