//! chain-reasoning CLI: train models on chain processes and evaluate their
//! layer-wise conditional estimates

use std::path::{Path, PathBuf};

use anyhow::Result;
use chain_reasoning::{
    evaluate, select_device, sweep, train, BatchMode, EvaluationOutcome, ExperimentConfig,
    ReasoningModel,
};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "chain-reasoning")]
#[command(about = "Layer-wise scaffolded estimation on chain-trained transformers")]
#[command(version)]
struct Cli {
    /// Directory holding trained model checkpoints
    #[arg(long, global = true, default_value = "models")]
    models_dir: PathBuf,

    /// Directory holding chain definitions (`chains/chain_{i}.json`)
    #[arg(long, global = true, default_value = "data")]
    data_dir: PathBuf,

    /// Directory for evaluation CSVs
    #[arg(long, global = true, default_value = "data/results")]
    results_dir: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Force CPU mode
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the canonical chains under the data directory
    DefineChains,
    /// Train one sweep entry (or a config file) to criterion
    Train {
        /// Sweep grid index
        #[arg(required_unless_present = "config")]
        index: Option<usize>,
        /// JSON experiment config, used instead of the sweep grid
        #[arg(long)]
        config: Option<PathBuf>,
        /// Stop after this many iterations if not converged
        #[arg(long)]
        max_iterations: Option<usize>,
        /// Override the batch-construction mode
        #[arg(long, value_enum)]
        batch_mode: Option<BatchMode>,
    },
    /// Evaluate one trained sweep entry (or a config file)
    Evaluate {
        /// Sweep grid index
        #[arg(required_unless_present = "config")]
        index: Option<usize>,
        /// JSON experiment config, used instead of the sweep grid
        #[arg(long)]
        config: Option<PathBuf>,
        /// Rollouts per query
        #[arg(long)]
        n_samples: Option<usize>,
    },
    /// Print per-layer read-outs of a saved model for one prompt
    Inspect {
        /// Checkpoint name under the models directory
        model_name: String,
        /// Prompt; `\n` escapes are expanded
        #[arg(short, long, default_value = "#\\nA=1\\nB=")]
        prompt: String,
        /// Tokens shown per layer
        #[arg(short = 'k', long, default_value_t = 3)]
        top_k: usize,
    },
}

impl Cli {
    fn experiment_config(
        &self,
        index: Option<usize>,
        config: Option<&Path>,
    ) -> Result<ExperimentConfig> {
        let mut experiment = match (config, index) {
            (Some(path), _) => ExperimentConfig::from_file(path)?,
            (None, Some(index)) => ExperimentConfig::from_sweep(
                &sweep::select(index)?,
                &self.data_dir,
                &self.models_dir,
                &self.results_dir,
            ),
            (None, None) => anyhow::bail!("Either a sweep index or --config is required"),
        };
        experiment.force_cpu |= self.cpu;
        Ok(experiment)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match &cli.command {
        Commands::DefineChains => {
            for path in sweep::define_chains(&cli.data_dir)? {
                println!("{}", path.display());
            }
        }
        Commands::Train {
            index,
            config,
            max_iterations,
            batch_mode,
        } => {
            let mut experiment = cli.experiment_config(*index, config.as_deref())?;
            if max_iterations.is_some() {
                experiment.max_iterations = *max_iterations;
            }
            if let Some(mode) = batch_mode {
                experiment.batch_mode = *mode;
            }
            let report = train(&experiment)?;
            println!("\n=== Training ===");
            println!("Model:      {}", experiment.trained_model_name());
            println!("Iterations: {}", report.iterations);
            println!(
                "Accuracy:   {:.3} (previous {:.3})",
                report.accuracy, report.last_accuracy
            );
            println!("Converged:  {}", report.converged);
        }
        Commands::Evaluate {
            index,
            config,
            n_samples,
        } => {
            let mut experiment = cli.experiment_config(*index, config.as_deref())?;
            if let Some(n) = n_samples {
                experiment.n_samples = *n;
            }
            match evaluate(&experiment)? {
                EvaluationOutcome::Completed { table, path } => {
                    println!("\n=== Mean absolute error per layer ===");
                    for (layer, mae) in table.mean_absolute_error().iter().enumerate() {
                        println!("Layer {layer:2}: {mae:.4}");
                    }
                    info!("Results saved to {}", path.display());
                }
                EvaluationOutcome::Skipped { model_name, .. } => {
                    println!("model not found: {model_name}");
                }
            }
        }
        Commands::Inspect {
            model_name,
            prompt,
            top_k,
        } => {
            let device = select_device(cli.cpu);
            let model = ReasoningModel::load(&cli.models_dir.join(model_name), &device)?;
            let prompt = prompt.replace("\\n", "\n");
            model.logit_lens(&prompt, *top_k)?.print_summary();
        }
    }

    Ok(())
}
