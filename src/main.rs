mod agent;
mod ai_sdk;
mod client;
mod logging;
mod places;
mod protocol;
mod server;
mod store;
mod ui;
mod updater;

use clap::{Args, Parser, Subcommand};
use client::{ChatSession, ClientConfig};
use logging::TracingConfig;
use server::ServerConfig;
use std::path::PathBuf;
use store::MessageStore;

const DEFAULT_SERVER: &str = "http://127.0.0.1:3000";

#[derive(Parser)]
#[command(name = "trekmate", version, about = "Travel health assistant: places proxy, chat server and terminal chat")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "TREKMATE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (`/nearby`, `/message`, `/health`).
    Serve(ServeArgs),
    /// Chat with a running server from the terminal.
    Chat {
        #[arg(long, env = "TREKMATE_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
        /// Write logs here; the chat screen itself shows none.
        #[arg(long, env = "TREKMATE_LOG_FILE")]
        log_file: Option<PathBuf>,
    },
    /// Print medical places near a location as JSON.
    #[command(allow_negative_numbers = true)]
    Nearby {
        #[arg(long, env = "TREKMATE_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
        latitude: String,
        longitude: String,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "TREKMATE_LISTEN", default_value = "127.0.0.1:3000")]
    listen: String,

    #[arg(long, env = "GOOGLE_PLACES_API_KEY", hide_env_values = true)]
    places_api_key: String,

    #[arg(long, env = "GOOGLE_PLACES_BASE_URL", default_value = places::DEFAULT_PLACES_BASE_URL)]
    places_base_url: String,

    /// Search radius in meters.
    #[arg(long, default_value_t = places::DEFAULT_SEARCH_RADIUS)]
    search_radius: u32,

    /// Places category to search for.
    #[arg(long, default_value = places::DEFAULT_PLACE_TYPE)]
    place_type: String,

    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    anthropic_api_key: String,

    #[arg(long, env = "ANTHROPIC_BASE_URL", default_value = agent::DEFAULT_ANTHROPIC_BASE_URL)]
    anthropic_base_url: String,

    #[arg(long, env = "TREKMATE_MODEL", default_value = agent::DEFAULT_MODEL)]
    model: String,
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            listen: args.listen,
            places_api_key: args.places_api_key,
            places_base_url: args.places_base_url,
            search_radius: args.search_radius,
            place_type: args.place_type,
            anthropic_api_key: args.anthropic_api_key,
            anthropic_base_url: args.anthropic_base_url,
            model: args.model,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => {
            logging::init_tracing(TracingConfig::server(cli.log_json))?;
            server::run(args.into()).await
        }
        Command::Chat { server, log_file } => {
            logging::init_tracing(TracingConfig::chat(cli.log_json, log_file))?;
            let session = ChatSession::new(ClientConfig { base_url: server }, MessageStore::new());
            tracing::info!(server = %session.base_url(), "starting chat");
            ui::run_tui(session)
        }
        Command::Nearby {
            server,
            latitude,
            longitude,
        } => {
            logging::init_tracing(TracingConfig::server(cli.log_json))?;
            let session = ChatSession::new(ClientConfig { base_url: server }, MessageStore::new());
            let places = session.nearby(&latitude, &longitude).await?;
            println!("{}", serde_json::to_string_pretty(&places)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn nearby_accepts_negative_coordinates() {
        let cli = Cli::try_parse_from(["trekmate", "nearby", "19.43", "-99.13"]).unwrap();
        match cli.command {
            Command::Nearby {
                latitude,
                longitude,
                ..
            } => {
                assert_eq!(latitude, "19.43");
                assert_eq!(longitude, "-99.13");
            }
            _ => panic!("expected nearby"),
        }
    }

    #[test]
    fn serve_uses_places_defaults() {
        let cli = Cli::try_parse_from([
            "trekmate",
            "serve",
            "--places-api-key",
            "p",
            "--anthropic-api-key",
            "a",
        ])
        .unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = ServerConfig::from(args);
        assert_eq!(config.search_radius, 5000);
        assert_eq!(config.place_type, "doctor");
        assert_eq!(config.places_base_url, "https://maps.googleapis.com");
    }
}
