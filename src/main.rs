use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info};

use pricewise::oracle::OpenAiOracle;
use pricewise::web_server::{self, AppState};
use pricewise::{repl, ChatHandler, PricingEngine, PricingInputs, Settings};

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// JSON settings file (pricing weights, oracle, retry, prompts).
    #[arg(long, global = true, env = "PRICEWISE_CONFIG")]
    config: Option<PathBuf>,

    /// API key for the language model service.
    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model identifier to request.
    #[arg(long, global = true, env = "PRICEWISE_MODEL")]
    model: Option<String>,

    /// Base URL of an OpenAI-compatible API.
    #[arg(long, global = true, env = "PRICEWISE_BASE_URL")]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

// Define the available subcommands
#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Compute a price directly from the six pricing factors.
    #[command(allow_negative_numbers = true)]
    Price {
        #[arg(long, help = "Total cost of materials.")]
        material_cost: f64,
        #[arg(long, help = "Hours spent making the item.")]
        hours: f64,
        #[arg(long, help = "Hourly labor rate.")]
        rate: f64,
        #[arg(long, help = "Uniqueness rating, 1-10.")]
        uniqueness: f64,
        #[arg(long, help = "Market demand rating, 1-10.")]
        demand: f64,
        #[arg(long, help = "Target profit margin as a fraction, e.g. 0.3.")]
        margin: f64,
        #[arg(long, help = "Print the breakdown as JSON.")]
        json: bool,
    },
    /// Talk through your item with the pricing assistant.
    Chat,
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080, help = "Port for the web server.")]
        port: u16,
    },
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        if let Some(model) = &self.model {
            settings.oracle.model = model.clone();
        }
        if let Some(base_url) = &self.base_url {
            settings.oracle.base_url = base_url.clone();
        }
        if let Some(api_key) = &self.api_key {
            settings = settings.with_api_key(api_key.clone());
        }
        settings.validate()?;
        Ok(settings)
    }
}

fn oracle(settings: &Settings) -> Result<Arc<OpenAiOracle>> {
    settings.require_api_key()?;
    let oracle = OpenAiOracle::new(&settings.oracle).context("Failed to set up language model client")?;
    info!(model = %settings.oracle.model, "Language model client initialized");
    Ok(Arc::new(oracle))
}

// The main entry point of the application, using tokio's async runtime
#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for environment variables like API keys)
    dotenvy::dotenv().ok();

    // Reads log level from RUST_LOG environment variable (e.g., RUST_LOG=info,pricewise=debug)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    info!("pricewise starting with command: {:?}", cli.command);

    let settings = cli.settings().context("Invalid configuration")?;

    match cli.command {
        Commands::Price {
            material_cost,
            hours,
            rate,
            uniqueness,
            demand,
            margin,
            json,
        } => {
            let inputs = PricingInputs {
                material_cost,
                hours_worked: hours,
                labor_rate: rate,
                uniqueness,
                demand,
                profit_margin: margin,
            };
            let result = PricingEngine::new(settings.pricing)?.compute(&inputs)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", result);
            }
        }
        Commands::Chat => {
            let oracle = oracle(&settings)?;
            let mut handler = ChatHandler::new(oracle, &settings)?;
            repl::run_chat(&mut handler, BufReader::new(tokio::io::stdin()), tokio::io::stdout())
                .await
                .context("Chat session failed")?;
        }
        Commands::Serve { port } => {
            let oracle = oracle(&settings)?;
            let state = AppState::new(oracle, settings)?;

            let server = web_server::start_web_server(port, state);
            tokio::select! {
                res = server => {
                    if let Err(e) = res {
                        error!("Web server failed: {:?}", e);
                        return Err(e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, shutting down.");
                }
            }
        }
    }

    Ok(())
}
