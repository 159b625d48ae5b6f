use std::path::PathBuf;

use clap::{Parser, Subcommand};
use followup_cli::cli::{load_config, run_classify, run_purge, ActivitySource, ClassifyRequest};
use followup_core::init_tracing;

#[derive(Parser)]
#[command(name = "followup")]
#[command(about = "Sort CRM contacts into follow-up staleness buckets")]
struct Cli {
    /// Path to JSON config file (dataDir, userId, thresholds)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify contacts and print the buckets as JSON
    Classify {
        /// JSON array of contact records
        #[arg(long)]
        contacts: PathBuf,

        /// JSON array of activity records
        #[arg(long, conflicts_with = "remote", required_unless_present = "remote")]
        activities: Option<PathBuf>,

        /// Base URL of the activity backend
        #[arg(long)]
        remote: Option<String>,

        /// API key for the activity backend
        #[arg(long, requires = "remote")]
        api_key: Option<String>,

        /// Only contacts carrying one of these labels (can be specified multiple times)
        #[arg(long, short = 'l')]
        label: Vec<String>,

        /// Ignore cached results and the idle interval
        #[arg(long)]
        force: bool,

        /// Pretty-print JSON output
        #[arg(long, short)]
        pretty: bool,
    },

    /// Remove expired rows from the persisted calculation cache
    PurgeCache,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Classify {
            contacts,
            activities,
            remote,
            api_key,
            label,
            force,
            pretty,
        } => {
            let activities = match (activities, remote) {
                (Some(path), _) => ActivitySource::File(path),
                (None, Some(url)) => ActivitySource::Remote { url, api_key },
                (None, None) => {
                    eprintln!("Either --activities or --remote is required");
                    std::process::exit(2);
                }
            };
            let request = ClassifyRequest {
                contacts,
                activities,
                labels: label,
                force,
            };
            match run_classify(request, config).and_then(|output| output.render(pretty)) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::PurgeCache => match run_purge(&config) {
            Ok(removed) => println!("{}", serde_json::json!({ "removed": removed })),
            Err(e) => {
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
        },
    }
}
