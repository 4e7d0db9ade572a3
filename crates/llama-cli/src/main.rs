use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use llama_cli::{generate, load_sampling_params, GenerateOptions};
use llama_sampling::SamplingParams;
use tracing_subscriber::EnvFilter;

/// llama.rs decode loop on the reference model
#[derive(Parser)]
#[command(name = "llama-cli")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Generate text from a prompt using the reference model.
    Generate {
        /// Input prompt text.
        #[arg(short, long)]
        prompt: String,

        /// Maximum number of tokens to generate.
        #[arg(short, long, default_value_t = 16)]
        max_tokens: usize,

        /// Sampling seed; overrides the config file.
        #[arg(short, long)]
        seed: Option<u32>,

        /// Sampling temperature (0 = greedy); overrides the config file.
        #[arg(short, long)]
        temp: Option<f32>,

        /// JSON file with sampling parameters.
        #[arg(long)]
        sampling_config: Option<PathBuf>,

        /// Write the session here after generating.
        #[arg(long)]
        save_session: Option<PathBuf>,

        /// Restore this session and reuse its prompt prefix.
        #[arg(long)]
        load_session: Option<PathBuf>,

        /// Worker threads (default: logical processors minus two, at most 8).
        #[arg(long)]
        threads: Option<usize>,

        /// Context size in tokens; 0 uses the model's training context.
        #[arg(long, default_value_t = 512)]
        ctx: usize,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Generate {
            prompt,
            max_tokens,
            seed,
            temp,
            sampling_config,
            save_session,
            load_session,
            threads,
            ctx,
        } => {
            let mut sampling = match sampling_config {
                Some(path) => match load_sampling_params(&path) {
                    Ok(params) => params,
                    Err(e) => {
                        eprintln!("error: {e}");
                        std::process::exit(1);
                    }
                },
                None => SamplingParams::default(),
            };
            if let Some(seed) = seed {
                sampling.seed = seed;
            }
            if let Some(temp) = temp {
                sampling.temp = temp;
            }

            let opts = GenerateOptions {
                prompt,
                max_tokens,
                sampling,
                n_ctx: ctx,
                n_threads: threads,
                load_session,
                save_session,
                ..Default::default()
            };

            let mut stdout = std::io::stdout();
            let result = generate(&opts, |piece| {
                print!("{piece}");
                let _ = stdout.flush();
            });
            match result {
                Ok(_) => println!(),
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
