//! Tangle CLI - run workflows locally or host the orchestration server.
//!
//! Reuses the same core services (tangle-core) and server bootstrap
//! (tangle-server) as the HTTP API.

use clap::{Parser, Subcommand};

use tangle_cli::commands::{self, StateOptions};

/// Tangle CLI - Multi-agent workflow orchestration
#[derive(Parser)]
#[command(name = "tangle", version, about = "Tangle CLI - Multi-agent workflow orchestration")]
pub struct Cli {
    /// YAML file with engine settings
    #[arg(long, global = true, env = "TANGLE_CONFIG")]
    config: Option<String>,

    /// SQLite database file (in-memory when omitted)
    #[arg(long, global = true, env = "TANGLE_DB_PATH")]
    db: Option<String>,

    /// Directory for JSONL audit files
    #[arg(long, global = true, env = "TANGLE_AUDIT_DIR")]
    audit_dir: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Tangle HTTP server
    Server {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on
        #[arg(long, default_value_t = 3210)]
        port: u16,
    },

    /// Run or validate workflow definitions
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Run a workflow from a YAML file and wait for it to finish
    Run {
        /// Path to the workflow YAML file
        file: String,
        /// Execution variables as a JSON object
        #[arg(long)]
        input: Option<String>,
        /// User recorded as the actor in the audit trail
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Validate a workflow YAML file without executing it
    Validate {
        /// Path to the workflow YAML file
        file: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tangle_core=warn,tangle_server=info,tangle_cli=info".into()),
        )
        .init();

    let options = StateOptions {
        config_path: cli.config,
        db_path: cli.db,
        audit_dir: cli.audit_dir,
    };

    let result = match cli.command {
        Some(Commands::Server { host, port }) => commands::server::run(host, port, &options).await,

        Some(Commands::Workflow { action }) => match action {
            WorkflowAction::Run {
                file,
                input,
                user_id,
            } => match commands::init_state(&options).await {
                Ok(state) => {
                    let result =
                        commands::workflow::run(&state, &file, input.as_deref(), user_id).await;
                    state.shutdown().await;
                    result
                }
                Err(e) => Err(e),
            },
            WorkflowAction::Validate { file } => commands::workflow::validate(&file),
        },

        None => {
            // No subcommand - show help
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
