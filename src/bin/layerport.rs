use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::info;

use layerport::archive::{ArchiveAssembler, LayerEncoding};
use layerport::config::{load_config, validate_config, Config};
use layerport::docker_manifest::LayerLayout;
use layerport::export::Exporter;
use layerport::known::KnownDigests;
use layerport::{logging, Error, Result};

#[derive(Parser)]
#[command(name = "layerport", version, about = "Export registry images as docker-load tars, skipping layers the target already has")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download an image and pack it into an archive
    Export(ExportArgs),
    /// Show which layers an export would fetch and which it would skip
    Plan(RunArgs),
    /// Pack an existing working directory into an archive
    Assemble(AssembleArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Image reference, e.g. `ghcr.io/acme/api:1.4`
    #[arg(long)]
    image: String,
    /// YAML or JSON config file
    #[arg(long, env = "LAYERPORT_CONFIG")]
    config: Option<PathBuf>,
    /// File listing digests the target host already has, one per line
    #[arg(long)]
    known_digests: Option<PathBuf>,
    /// Digest the target host already has (repeatable)
    #[arg(long = "known-digest")]
    known_digest: Vec<String>,
    /// Target platform as os/arch[/variant]
    #[arg(long)]
    platform: Option<String>,
    /// Working directory for downloaded blobs
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Parallel layer downloads
    #[arg(long)]
    concurrency: Option<usize>,
}

#[derive(Args)]
struct ExportArgs {
    #[command(flatten)]
    run: RunArgs,
    /// Archive path
    #[arg(long, short)]
    output: Option<PathBuf>,
    /// Gzip the archive
    #[arg(long)]
    gzip: bool,
    #[arg(long, value_enum)]
    layout: Option<LayoutArg>,
    /// Write layers as plain tar instead of the registry's compressed blob
    #[arg(long)]
    uncompressed: bool,
}

#[derive(Args)]
struct AssembleArgs {
    /// Directory holding manifest.json, repositories and blobs
    #[arg(long)]
    dir: PathBuf,
    #[arg(long, short)]
    output: PathBuf,
    #[arg(long)]
    gzip: bool,
    #[arg(long)]
    uncompressed: bool,
    #[arg(long, env = "LAYERPORT_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum LayoutArg {
    Flat,
    Directory,
}

impl From<LayoutArg> for LayerLayout {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::Flat => LayerLayout::Flat,
            LayoutArg::Directory => LayerLayout::Directory,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error [{}]: {}", e.kind(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = match &cli.command {
        Command::Export(args) => args.run.config.clone(),
        Command::Plan(args) => args.config.clone(),
        Command::Assemble(args) => args.config.clone(),
    };
    let mut config = load_config(config_path.as_deref())?;
    let _guard = logging::init(&config.logging)?;

    let work = async move {
        match cli.command {
            Command::Export(args) => {
                apply_run_args(&mut config, &args.run);
                if let Some(output) = args.output {
                    config.archive.output = output;
                }
                if let Some(layout) = args.layout {
                    config.archive.layout = layout.into();
                }
                config.archive.gzip |= args.gzip;
                if args.uncompressed {
                    config.archive.layer_encoding = LayerEncoding::Uncompressed;
                }
                validate_config(&config)?;
                cmd_export(config, &args.run).await
            }
            Command::Plan(args) => {
                apply_run_args(&mut config, &args);
                validate_config(&config)?;
                cmd_plan(config, &args).await
            }
            Command::Assemble(args) => {
                let encoding = if args.uncompressed {
                    LayerEncoding::Uncompressed
                } else {
                    config.archive.layer_encoding
                };
                let gzip = args.gzip || config.archive.gzip;
                cmd_assemble(args.dir, args.output, gzip, encoding).await
            }
        }
    };

    tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, partial downloads kept for resume");
            Err(Error::Cancelled)
        }
    }
}

fn apply_run_args(config: &mut Config, args: &RunArgs) {
    if let Some(platform) = &args.platform {
        config.download.platform = platform.clone();
    }
    if let Some(dir) = &args.output_dir {
        config.download.output_dir = dir.clone();
    }
    if let Some(n) = args.concurrency {
        config.download.concurrency = n;
    }
}

fn known_digests(args: &RunArgs) -> Result<KnownDigests> {
    let mut known = match &args.known_digests {
        Some(path) => KnownDigests::from_file(path)?,
        None => KnownDigests::new(),
    };
    for raw in &args.known_digest {
        known.insert_str(raw)?;
    }
    Ok(known)
}

async fn cmd_export(config: Config, args: &RunArgs) -> Result<()> {
    let known = known_digests(args)?;
    let exporter = Exporter::new(config)?;
    let report = exporter.export(&args.image, &known).await?;

    println!("image: {}", report.image);
    println!("config: {}", report.config_digest);
    println!("layers: {}", report.total_layers);
    println!("fetched: {}", report.fetched);
    println!("reused: {}", report.reused);
    println!("deduplicated: {}", report.deduplicated);
    println!("archive: {}", report.archive.display());
    if !report.missing_from_archive.is_empty() {
        println!(
            "note: {} layer(s) left out of the archive; it only loads on a host that already has them:",
            report.missing_from_archive.len()
        );
        for layer in &report.missing_from_archive {
            println!("  {}", layer);
        }
    }
    Ok(())
}

async fn cmd_plan(config: Config, args: &RunArgs) -> Result<()> {
    let known = known_digests(args)?;
    let exporter = Exporter::new(config)?;
    let planned = exporter.plan(&args.image, &known).await?;

    println!(
        "image: {}/{}:{}",
        planned.reference.registry, planned.reference.repository, planned.reference.reference
    );
    println!("config: {}", planned.config_digest);
    let fetch: std::collections::HashSet<usize> =
        planned.plan.to_fetch().map(|l| l.index).collect();
    for layer in planned.plan.full() {
        let action = if fetch.contains(&layer.index) {
            "fetch"
        } else {
            "skip "
        };
        println!("  [{}] {} {} ({} bytes)", layer.index, action, layer.digest, layer.size);
    }
    println!(
        "{} to fetch, {} already on target",
        planned.plan.fetch_count(),
        planned.plan.deduplicated_count()
    );
    Ok(())
}

async fn cmd_assemble(
    dir: PathBuf,
    output: PathBuf,
    gzip: bool,
    encoding: LayerEncoding,
) -> Result<()> {
    let assembler = ArchiveAssembler::new(dir, encoding);
    let dest = output.clone();
    let report = tokio::task::spawn_blocking(move || assembler.assemble_to_file(&dest, gzip))
        .await
        .map_err(|e| Error::Archive(format!("assembly task failed: {}", e)))??;

    println!("archive: {}", output.display());
    println!("layers: {}", report.layers_written);
    for layer in &report.layers_skipped {
        println!("  skipped {}", layer);
    }
    Ok(())
}
