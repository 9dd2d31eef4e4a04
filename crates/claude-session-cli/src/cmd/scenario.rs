use std::path::Path;

use anyhow::Context;
use clap::Subcommand;

use crate::config::Config;
use crate::output::{print_json, print_table};

#[derive(Subcommand)]
pub enum ScenarioSubcommand {
    /// List scenarios and prompt routing
    List,

    /// Set the scenario used when no pattern matches
    SetDefault {
        /// Scenario id
        id: String,
    },

    /// Route prompts matching a pattern (case-insensitive regex) to a scenario
    Map {
        pattern: String,
        /// Scenario id
        scenario: String,
    },

    /// Remove a prompt route
    Unmap { pattern: String },

    /// Restore built-in defaults and drop all routes
    Reset,
}

pub fn run(config_path: &Path, subcmd: ScenarioSubcommand, json: bool) -> anyhow::Result<()> {
    let mut config = Config::load(config_path)?;
    let registry = config.registry()?;

    match subcmd {
        ScenarioSubcommand::List => {
            let scenarios = registry.list();
            let mappings = registry.mappings();
            if json {
                let patterns: Vec<_> = mappings
                    .iter()
                    .map(|(pattern, scenario)| {
                        serde_json::json!({"pattern": pattern, "scenario": scenario})
                    })
                    .collect();
                return print_json(&serde_json::json!({
                    "default": registry.default_scenario(),
                    "scenarios": scenarios,
                    "patterns": patterns,
                }));
            }

            let rows = scenarios
                .into_iter()
                .map(|s| {
                    vec![
                        if s.is_default { format!("{} *", s.id) } else { s.id },
                        s.messages.to_string(),
                        format!("{}ms", s.delay_ms),
                        s.description,
                    ]
                })
                .collect();
            print_table(&["ID", "MESSAGES", "DELAY", "DESCRIPTION"], rows);
            if mappings.is_empty() {
                println!("\nPatterns: (none)");
            } else {
                println!("\nPatterns:");
                for (pattern, scenario) in mappings {
                    println!("  {pattern:<20} → {scenario}");
                }
            }
            return Ok(());
        }
        ScenarioSubcommand::SetDefault { id } => {
            registry.set_default(&id)?;
            println!("Default scenario: {id}");
        }
        ScenarioSubcommand::Map { pattern, scenario } => {
            registry
                .map_pattern(&pattern, &scenario)
                .with_context(|| format!("cannot map '{pattern}'"))?;
            println!("Mapped '{pattern}' → {scenario}");
        }
        ScenarioSubcommand::Unmap { pattern } => {
            if registry.remove_mapping(&pattern) {
                println!("Removed '{pattern}'");
            } else {
                println!("No mapping for '{pattern}'");
            }
        }
        ScenarioSubcommand::Reset => {
            registry.reset();
            println!("Scenarios reset to built-in defaults");
        }
    }

    config.store_registry(&registry);
    config.save(config_path)
}
