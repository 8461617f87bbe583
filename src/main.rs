//! Retrieval benchmark CLI
//!
//! ## Quick Start
//!
//! ```bash
//! # Encode the configured datasets and write dense indexes
//! ./retrieval-bench --config pipeline.toml index
//!
//! # Pairwise significance reports over existing TREC runs
//! ./retrieval-bench --config pipeline.toml significance
//!
//! # Write the built-in defaults as a starting config
//! ./retrieval-bench init-config --output pipeline.toml
//! ```
//!
//! Without a config file the built-in defaults are used. See `config.rs`
//! for every option.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use retrieval_bench::catalog::LocalCatalog;
use retrieval_bench::config::PipelineConfig;
use retrieval_bench::encoders::{
    ComputeDevice, DeviceProbe, EncoderFactory, FastEmbedModel, MistralRsModel,
    ModelFamily,
};
use retrieval_bench::pipeline::{IndexingPipeline, RunSummary, SignificancePipeline};

#[derive(Parser)]
#[command(name = "retrieval-bench")]
#[command(about = "Dense indexing and significance testing for retrieval experiments")]
#[command(version)]
struct Cli {
    /// Path to the pipeline config file (TOML)
    #[arg(short, long, global = true, default_value = "pipeline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode every configured dataset and write its dense index
    Index {
        /// Override the detected compute device: cpu, cuda or metal
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Write a significance report for every configured dataset
    Significance {
        /// Only report these datasets (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        datasets: Option<Vec<String>>,
    },

    /// List available embedding models
    Models,

    /// Validate the config file and print the effective configuration
    CheckConfig,

    /// Write the default configuration to a file
    InitConfig {
        #[arg(short, long, default_value = "pipeline.toml")]
        output: PathBuf,
    },

    /// Load one model and encode a few sample texts
    TestModel {
        /// Model name (e.g., "snowflake-arctic-embed-xs")
        model: String,

        /// Override the detected compute device: cpu, cuda or metal
        #[arg(short, long)]
        device: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Index { device } => {
            let config = PipelineConfig::load_or_default(&cli.config)?;
            let device = resolve_device(device.as_deref())?;
            let summary = run_indexing(&config, device).await;
            finish(&config, "INDEXING", &summary);
        }

        Commands::Significance { datasets } => {
            let config = PipelineConfig::load_or_default(&cli.config)?;
            let datasets = datasets.unwrap_or_else(|| config.significance.datasets.clone());
            let summary = run_significance(&config, &datasets)?;
            finish(&config, "SIGNIFICANCE", &summary);
        }

        Commands::Models => {
            list_models();
        }

        Commands::CheckConfig => {
            let config = PipelineConfig::load(&cli.config)?;
            println!("Config {:?} is valid:\n", cli.config);
            println!("{}", toml::to_string_pretty(&config)?);
        }

        Commands::InitConfig { output } => {
            PipelineConfig::default()
                .save(&output)
                .with_context(|| format!("Failed to write config to {:?}", output))?;
            println!("Default configuration written to {:?}", output);
        }

        Commands::TestModel { model, device } => {
            let device = resolve_device(device.as_deref())?;
            test_single_model(&model, device).await?;
        }
    }

    Ok(())
}

fn resolve_device(requested: Option<&str>) -> Result<ComputeDevice> {
    match requested {
        Some(name) => ComputeDevice::from_str(name)
            .with_context(|| format!("Unknown device '{}' (expected cpu, cuda or metal)", name)),
        None => {
            let device = DeviceProbe::detect();
            tracing::info!("Detected compute device: {}", device.name());
            Ok(device)
        }
    }
}

async fn run_indexing(config: &PipelineConfig, device: ComputeDevice) -> RunSummary {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              COLLECTION INDEXING                             ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    // Progress goes to stderr (line-buffered even when piped)
    eprintln!(
        "  {} jobs, batch size {}, aggregation {}, device {}, budget {:?} - {:?}",
        config.indexing.jobs.len(),
        config.indexing.batch_size,
        config.indexing.aggregation_mode.name(),
        device.name(),
        config.indexing.total_budget(),
        config.indexing.safety_margin()
    );

    let pipeline = IndexingPipeline::new(
        config.indexing.clone(),
        Arc::new(EncoderFactory::new(device)),
        Arc::new(LocalCatalog::new(&config.catalog_dir)),
    );
    pipeline.run().await
}

fn run_significance(config: &PipelineConfig, datasets: &[String]) -> Result<RunSummary> {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              SIGNIFICANCE REPORTS                            ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    eprintln!(
        "  {} datasets x {} models, metrics {:?}, max_p {}",
        datasets.len(),
        config.significance.models.len(),
        config.significance.metrics,
        config.significance.max_p
    );

    let pipeline = SignificancePipeline::from_config(
        config,
        Arc::new(LocalCatalog::new(&config.catalog_dir)),
    )
    .context("Failed to set up the significance pipeline")?;
    Ok(pipeline.run(datasets))
}

/// Print the summary and exit according to the configured policy
fn finish(config: &PipelineConfig, title: &str, summary: &RunSummary) {
    println!("\n{} SUMMARY", title);
    println!("─────────────────────────────────────────────────────────────────");
    print!("{}", summary.format_table());

    let code = summary.exit_code(config.exit_policy);
    if code != 0 {
        std::process::exit(code);
    }
}

fn list_models() {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              AVAILABLE EMBEDDING MODELS                      ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    println!("FASTEMBED (ONNX Runtime / CPU):");
    println!("─────────────────────────────────────────────────────────────────");
    for model in FastEmbedModel::all() {
        println!(
            "  {:30} {:4} dims  {}",
            model.name(),
            model.dimensions(),
            model.model_id()
        );
    }

    println!("\nMISTRALRS (Candle / CPU, CUDA, Metal):");
    println!("─────────────────────────────────────────────────────────────────");
    for model in MistralRsModel::all() {
        println!(
            "  {:30} {:4} dims  ~{:.1}GB  {}",
            model.name(),
            model.dimensions(),
            model.size_gb(),
            model.model_id()
        );
    }

    println!("\nCONFIGURATION:");
    println!("─────────────────────────────────────────────────────────────────");
    println!("  Indexing jobs are configured in pipeline.toml. Example:");
    println!();
    println!("  [[indexing.jobs]]");
    println!("  dataset = \"irds:msmarco-passage\"");
    println!("  model = \"snowflake-arctic-embed-xs\"");
    println!("  embedding_dim = 384");
    println!("  max_id_length = 7");
}

async fn test_single_model(model: &str, device: ComputeDevice) -> Result<()> {
    let family = ModelFamily::resolve(model)?;
    println!(
        "Testing single model: {} (backend: {}, device: {})\n",
        family.name(),
        family.backend(),
        device.name()
    );

    let pair = EncoderFactory::new(device)
        .build(model, family.dimensions())
        .await?;
    println!("  Loaded in {:?}", pair.load_duration());
    let warmup = pair.document.warmup().await?;
    println!("  Warmup: {:?}", warmup);

    let queries = vec![
        "how do vaccines train the immune system".to_string(),
        "capital of australia".to_string(),
    ];
    let passages = vec![
        "Vaccines expose the immune system to a harmless antigen so it can build memory cells."
            .to_string(),
        "Canberra is the capital city of Australia.".to_string(),
    ];

    let q = pair.query.encode(&queries).await?;
    let d = pair.document.encode(&passages).await?;
    println!(
        "  query encoder ({}): {} vectors x {} dims in {:?}",
        pair.query.config().device.name(),
        q.embeddings.len(),
        q.embeddings.first().map(|e| e.len()).unwrap_or(0),
        q.duration
    );
    println!(
        "  document encoder ({}): {} vectors x {} dims in {:?}",
        pair.document.config().device.name(),
        d.embeddings.len(),
        d.embeddings.first().map(|e| e.len()).unwrap_or(0),
        d.duration
    );

    println!("\n  Cosine similarity (query x passage):");
    for (qi, qv) in q.embeddings.iter().enumerate() {
        let sims: Vec<String> = d
            .embeddings
            .iter()
            .map(|dv| format!("{:.3}", cosine_similarity(qv, dv)))
            .collect();
        println!("    q{}: [{}]", qi, sims.join(", "));
    }

    Ok(())
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
