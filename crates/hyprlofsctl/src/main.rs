// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hyprlofs::{Filesystem, HyprlofsConfig, Mapping, Platform, SimulatedPlatform};
use hyprlofs_logging::CliLoggingArgs;
use serde_json::{Value, json};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Administer hyprlofs mounts and their mappings")]
struct Cli {
    /// hyprlofs mountpoint (e.g. /vfs)
    #[arg(long, env = "HYPRLOFSCTL_MOUNT")]
    mount: PathBuf,

    /// Log every open/ioctl/close on the control descriptor at INFO
    #[arg(long)]
    debug: bool,

    /// TOML configuration file
    #[arg(long, env = "HYPRLOFSCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Run against an in-process simulated kernel instead of the host
    #[arg(long)]
    simulate: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    logging: CliLoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mount hyprlofs read-only at the mountpoint
    Mount,
    /// Unmount the mountpoint
    Unmount,
    /// Add mappings given as PATH:NAME, or from a JSON file of [path, name] pairs
    Add {
        #[arg(value_parser = parse_mapping, required_unless_present = "file")]
        mappings: Vec<Mapping>,
        /// JSON file ('-' for stdin) of the form [["/real/path", "name"], ...]
        #[arg(long, conflicts_with = "mappings")]
        file: Option<PathBuf>,
    },
    /// Remove mappings by name, or from a JSON file of names
    Remove {
        #[arg(required_unless_present = "file")]
        names: Vec<String>,
        /// JSON file ('-' for stdin) of the form ["name", ...]
        #[arg(long, conflicts_with = "names")]
        file: Option<PathBuf>,
    },
    /// Remove every mapping
    Clear,
    /// Print the current mappings
    List,
    /// Print the effective configuration after file and environment layering
    Config,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Mount => "mount",
            Command::Unmount => "unmount",
            Command::Add { .. } => "add",
            Command::Remove { .. } => "remove",
            Command::Clear => "clear",
            Command::List => "list",
            Command::Config => "config",
        }
    }
}

/// Parse `PATH:NAME`. The last `:` separates the two, so paths may contain
/// colons.
fn parse_mapping(arg: &str) -> Result<Mapping, String> {
    match arg.rsplit_once(':') {
        Some((path, name)) if !path.is_empty() && !name.is_empty() => {
            Ok(Mapping::new(path, name))
        }
        _ => Err(format!("expected PATH:NAME, got '{arg}'")),
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let text = if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?
    };
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}

async fn run<P: Platform>(fs: &Filesystem<P>, command: Command, as_json: bool) -> Result<()> {
    let name = command.name();
    let label = fs.label().display().to_string();
    let summary = match command {
        Command::Mount => {
            fs.mount()?.await?;
            format!("MOUNTED {label}")
        }
        Command::Unmount => {
            fs.unmount()?.await?;
            format!("UNMOUNTED {label}")
        }
        Command::Add { mappings, file } => {
            let count = match file {
                Some(file) => {
                    let value = read_json(&file)?;
                    let count = value.as_array().map_or(0, Vec::len);
                    fs.add_mappings_value(&value)?.await?;
                    count
                }
                None => {
                    fs.add_mappings(mappings.iter().map(|m| (m.path.as_str(), m.name.as_str())))?
                        .await?;
                    mappings.len()
                }
            };
            format!("ADDED {count}")
        }
        Command::Remove { names, file } => {
            let count = match file {
                Some(file) => {
                    let value = read_json(&file)?;
                    let count = value.as_array().map_or(0, Vec::len);
                    fs.remove_mappings_value(&value)?.await?;
                    count
                }
                None => {
                    fs.remove_mappings(&names)?.await?;
                    names.len()
                }
            };
            format!("REMOVED {count}")
        }
        Command::Clear => {
            fs.remove_all()?.await?;
            "CLEARED".to_string()
        }
        Command::List => {
            let mappings = fs.list_mappings()?.await?;
            if as_json {
                println!("{}", serde_json::to_string(&mappings)?);
            } else {
                for mapping in &mappings {
                    println!("MAPPING\t{}\t{}", mapping.name, mapping.path);
                }
            }
            info!(
                operation = "list",
                mountpoint = %label,
                count = mappings.len(),
                "Listed mappings"
            );
            return Ok(());
        }
        Command::Config => {
            if as_json {
                println!("{}", serde_json::to_string_pretty(fs.config())?);
            } else {
                print!("{}", fs.config().to_toml()?);
            }
            return Ok(());
        }
    };

    if as_json {
        println!("{}", json!({ "command": name, "mountpoint": label, "status": "ok" }));
    } else {
        println!("{summary}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.logging.init("hyprlofsctl")?;

    let mut config =
        HyprlofsConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    config.debug |= cli.debug;

    if cli.simulate {
        let sim = Arc::new(SimulatedPlatform::new());
        sim.create_dir(&cli.mount);
        let fs = Filesystem::with_platform(sim, &cli.mount, config);
        if !matches!(cli.command, Command::Mount | Command::Config) {
            fs.mount()?.await.context("simulated mount failed")?;
        }
        run(&fs, cli.command, cli.json).await
    } else {
        let fs = Filesystem::new(&cli.mount, config);
        run(&fs, cli.command, cli.json).await
    }
}
