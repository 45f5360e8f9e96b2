use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "delegauth",
    version,
    about = "Acquire app-only tokens and manage delegated sign-in for data-retrieval tools"
)]
struct Cli {
    /// Path to a delegauth.json config file
    #[arg(long, global = true, env = "DELEGAUTH_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print an app-only access token
    Token {
        /// Scope to request (repeatable); defaults to the configured app scopes
        #[arg(long = "scope")]
        scopes: Vec<String>,

        /// JSON output with expiry and granted scopes
        #[arg(long)]
        json: bool,
    },

    /// Sign in interactively and store a delegated token
    Login {
        #[arg(long, env = "DELEGAUTH_SUBJECT", default_value = "default")]
        subject: String,

        /// Sign-in timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print the sign-in link without opening a browser
        #[arg(long)]
        no_browser: bool,
    },

    /// Show whether a usable delegated token is stored
    Status {
        #[arg(long, env = "DELEGAUTH_SUBJECT", default_value = "default")]
        subject: String,

        #[arg(long)]
        json: bool,
    },

    /// Delete the stored delegated token
    Logout {
        #[arg(long, env = "DELEGAUTH_SUBJECT", default_value = "default")]
        subject: String,
    },

    /// List upcoming calendar events, signing in first if needed
    Calendar {
        #[arg(long, env = "DELEGAUTH_SUBJECT", default_value = "default")]
        subject: String,

        /// Number of days ahead to include
        #[arg(long, default_value_t = 7)]
        days: u32,

        /// Sign-in timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DELEGAUTH_LOG_LEVEL")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = run(cli).await;
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), delegauth::AuthError> {
    let runtime = delegauth::AuthRuntime::from_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Token { scopes, json } => {
            delegauth::cli::auth::run_token(&runtime, &scopes, json).await
        }
        Commands::Login {
            subject,
            timeout_ms,
            no_browser,
        } => {
            delegauth::cli::auth::run_login(
                &runtime,
                &subject,
                timeout_ms.map(Duration::from_millis),
                !no_browser,
            )
            .await
        }
        Commands::Status { subject, json } => {
            delegauth::cli::auth::run_status(&runtime, &subject, json).await
        }
        Commands::Logout { subject } => delegauth::cli::auth::run_logout(&runtime, &subject).await,
        Commands::Calendar {
            subject,
            days,
            timeout_ms,
            json,
        } => {
            delegauth::cli::calendar::run_calendar(
                &runtime,
                &subject,
                days,
                timeout_ms.map(Duration::from_millis),
                json,
            )
            .await
        }
    }
}
