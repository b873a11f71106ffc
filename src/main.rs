use clap::Parser;
use cladepaint::cli::Cli;
use cladepaint::{ArtifactStore, PipelineOrchestrator, Result, TaxonRegistry, Toolset};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8, quiet: bool) {
    let directive = if quiet {
        "cladepaint=warn"
    } else {
        match verbose {
            0 => "cladepaint=info",
            1 => "cladepaint=debug",
            _ => "cladepaint=trace",
        }
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    let config = Arc::new(cli.into_config()?);

    // Setup errors abort here, before any stage executes.
    let registry = Arc::new(TaxonRegistry::from_manifest(&config.manifest)?);
    registry.validate_reference(&config.reference_taxon)?;
    let tools = Arc::new(Toolset::resolve()?);
    let store = Arc::new(ArtifactStore::new(&config.out_dir)?);

    let orchestrator =
        PipelineOrchestrator::with_default_handlers(config, registry, tools, store.clone());
    let outcome = orchestrator.execute().await?;

    info!(
        "run {} finished; terminal artifacts: {} and {}",
        outcome.run.id,
        store.annotated_genes_path().display(),
        store.blocks_path().display()
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("cladepaint: {e}");
        std::process::exit(1);
    }
}
