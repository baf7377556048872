//! 🚀 hmx-cli: the front door, the bouncer, the maitre d' of hmx.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary is the thin wrapper that parses args, sets up logging, loads config,
//! and then lets the library do the heavy lifting. Like a manager. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table, presets::UTF8_FULL};
use hmx::render::{Palette, render_file};
use hmx::{RunOutput, RunSummary};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "hmx.toml";

#[derive(Debug, Parser)]
#[command(name = "hmx", version, about = "🗺️ Sample flight-sim terrain into a raw heightmap, one wagon at a time")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the pipeline: probe backends, dispatch partitions, write the heightmap.
    Create {
        /// Config file (TOML). Defaults to ./hmx.toml when it exists; HMX_* env vars always apply.
        config: Option<PathBuf>,
        /// Also render the finished file with this palette. Repeatable.
        #[arg(long = "render")]
        render: Vec<Palette>,
        /// Draw isolines every this many metres on the rendered images.
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
        isostep: Option<u16>,
    },
    /// Become a backend: accept line-protocol clients and answer them with a local engine.
    Serve {
        config: Option<PathBuf>,
    },
    /// Render an existing raw heightmap to PNG.
    Render {
        #[arg(long)]
        input: PathBuf,
        /// Map height in metres.
        #[arg(long)]
        height: u64,
        /// Map width in metres.
        #[arg(long)]
        width: u64,
        #[arg(long, default_value_t = 100)]
        scale: u64,
        /// Palette to render with. Repeatable; all of them when omitted.
        #[arg(long = "palette")]
        palettes: Vec<Palette>,
        /// Draw isolines every this many metres.
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
        isostep: Option<u16>,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
}

/// 🔒 Validate the config file exists before we get too emotionally attached.
/// An explicit path must exist; the default one is optional.
fn resolve_config(path: Option<PathBuf>) -> Result<Option<PathBuf>> {
    match path {
        Some(path) => {
            let exists = path.try_exists().with_context(|| {
                format!("💀 Couldn't check whether the config file exists. Was checking here: '{}'", path.display())
            })?;
            anyhow::ensure!(
                exists,
                "💀 Configuration file '{}' does not exist. If it's a relative path, check your cwd, \
                 or use an absolute path to be absolutely certain.",
                path.display()
            );
            Ok(Some(path))
        }
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            Ok(default.try_exists().unwrap_or(false).then_some(default))
        }
    }
}

fn print_summary(summary: &RunSummary) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["🧾 run summary", ""]);

    let output = match &summary.output {
        RunOutput::File(path) => path.display().to_string(),
        RunOutput::InMemory(bytes) => format!("(in memory, {} bytes)", bytes.len()),
    };
    table.add_row(vec![Cell::new("output"), Cell::new(output)]);
    table.add_row(vec![
        Cell::new("samples written"),
        Cell::new(format!("{} / {}", summary.samples_written, summary.total_samples)),
    ]);
    table.add_row(vec![Cell::new("elapsed"), Cell::new(format!("{:.1?}", summary.elapsed))]);
    table.add_row(vec![Cell::new("backends used"), Cell::new(summary.backends_used.join("\n"))]);
    if !summary.unreachable_backends.is_empty() {
        let unreachable: Vec<String> = summary
            .unreachable_backends
            .iter()
            .map(|backend| format!("{}: {}", backend.backend, backend.reason))
            .collect();
        table.add_row(vec![Cell::new("unreachable"), Cell::new(unreachable.join("\n"))]);
    }
    if !summary.lost_backends.is_empty() {
        table.add_row(vec![Cell::new("lost mid-run"), Cell::new(summary.lost_backends.join("\n"))]);
    }
    if !summary.failed_partitions.is_empty() {
        let gaps: Vec<String> = summary
            .failed_partitions
            .iter()
            .map(|gap| format!("{} on {}: {}", gap.partition, gap.backend, gap.reason))
            .collect();
        table.add_row(vec![Cell::new("gaps"), Cell::new(gaps.join("\n"))]);
    }
    if !summary.unprocessed_partitions.is_empty() {
        let never: Vec<String> = summary.unprocessed_partitions.iter().map(ToString::to_string).collect();
        table.add_row(vec![Cell::new("never dispatched"), Cell::new(never.join(" "))]);
    }
    println!("{table}");
}

async fn create(config: Option<PathBuf>, palettes: Vec<Palette>, isostep: Option<u16>) -> Result<()> {
    let config_file = resolve_config(config)?;
    let app_config = hmx::app_config::load_config(config_file.as_deref())
        .context("💀 Couldn't load the config. Take a look at the file, make sure you didn't forget something obvious.")?;
    let grid = app_config.grid.clone();

    let summary = hmx::run(app_config).await?;
    print_summary(&summary);

    if !palettes.is_empty() {
        match &summary.output {
            RunOutput::File(path) => {
                render_file(path, grid.height, grid.width, grid.scale, &palettes, isostep, None)?;
            }
            RunOutput::InMemory(_) => info!("🎨 nothing to render, the output never touched disk"),
        }
    }
    Ok(())
}

async fn serve(config: Option<PathBuf>) -> Result<()> {
    let config_file = resolve_config(config)?;
    let serve_config = hmx::app_config::load_serve_config(config_file.as_deref())
        .context("💀 Couldn't load the server config.")?;
    hmx::server::serve(serve_config).await
}

struct RenderArgs {
    input: PathBuf,
    height: u64,
    width: u64,
    scale: u64,
    palettes: Vec<Palette>,
    isostep: Option<u16>,
    out_dir: Option<PathBuf>,
}

fn render(args: RenderArgs) -> Result<()> {
    let palettes = if args.palettes.is_empty() { Palette::ALL.to_vec() } else { args.palettes };
    let written = render_file(
        &args.input,
        args.height,
        args.width,
        args.scale,
        &palettes,
        args.isostep,
        args.out_dir.as_deref(),
    )?;
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}

/// 🚀 main(): where it all begins. The "I pressed F5 and held my breath" moment.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Create { config, render, isostep } => create(config, render, isostep).await,
        Command::Serve { config } => serve(config).await,
        Command::Render {
            input,
            height,
            width,
            scale,
            palettes,
            isostep,
            out_dir,
        } => render(RenderArgs {
            input,
            height,
            width,
            scale,
            palettes,
            isostep,
            out_dir,
        }),
    };

    if let Err(err) = result {
        error!("💀 error: {}", err);
        // -- 🧅 peel the onion of sadness, one layer at a time
        let mut the_vibes_are_giving_connection_issues = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            let cause_str = cause.to_string();
            if cause_str.contains("no servers available")
                || cause_str.contains("error sending request")
                || cause_str.contains("onnection refused")
                || cause_str.contains("tcp connect error")
                || cause_str.contains("dns error")
            {
                the_vibes_are_giving_connection_issues = true;
            }
        }
        if err.to_string().contains("no servers available") {
            the_vibes_are_giving_connection_issues = true;
        }

        if the_vibes_are_giving_connection_issues {
            error!(
                "🔧 hint: looks like the game servers aren't reachable. \
                Check that each backend in the config is up and listening, \
                and that nobody else is holding it busy. Even servers need a nudge sometimes. ☕"
            );
        }
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_isostep_reaches_both_render_paths() {
        let cli = Cli::try_parse_from(["hmx", "create", "--render", "jet", "--isostep", "200"]).expect("create parses");
        assert!(matches!(cli.command, Command::Create { isostep: Some(200), .. }));

        let cli = Cli::try_parse_from([
            "hmx", "render", "--input", "kuban.raw", "--height", "1000", "--width", "1000", "--isostep", "50",
        ])
        .expect("render parses");
        assert!(matches!(cli.command, Command::Render { isostep: Some(50), .. }));

        assert!(Cli::try_parse_from(["hmx", "create", "--isostep", "0"]).is_err());
    }
}
