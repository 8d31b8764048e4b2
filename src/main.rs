use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;

use urbanvital_client::security::auth::Credentials;
use urbanvital_client::transport::Method;
use urbanvital_client::utils::logging;
use urbanvital_client::{ApiClient, ApiError, ApiRequest, ClientConfig};

#[derive(Parser)]
#[command(name = "urbanvital", version, about = "UrbanVital API client")]
struct AppCli {
    /// Config file path
    #[arg(short, long, default_value = "urbanvital.json", global = true)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and save the session
    Login {
        username: Option<String>,
        #[arg(long, env = "URBANVITAL_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Close the session on the server and forget it locally
    Logout,
    /// Show the logged-in user's profile
    Whoami,
    /// Show whether a session is held and how old it is
    Status,
    /// Renew the access credential now
    Refresh,
    /// GET a path
    Get {
        path: String,
        /// Query parameter as key=value (repeatable)
        #[arg(short, long = "query", value_parser = parse_key_value)]
        query: Vec<(String, String)>,
        /// Serve from / store into the response cache
        #[arg(long)]
        cache: bool,
    },
    /// Send a write request with an optional JSON body
    Send {
        method: Method,
        path: String,
        #[arg(long)]
        body: Option<String>,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{}`", raw))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn surface(err: ApiError) -> anyhow::Error {
    match err.notice() {
        Some(notice) => anyhow::anyhow!("{}", notice),
        None => anyhow::anyhow!("session expired, please log in again ({})", err),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let args = AppCli::parse();
    let config = ClientConfig::load(Some(&args.config))?;
    let client = ApiClient::from_config(&config)?;

    match args.command {
        Commands::Login { username, password } => {
            let (username, password) = match (username, password) {
                (Some(u), Some(p)) => (u, p),
                _ => {
                    let creds = Credentials::from_env()
                        .context("username and password required (args or URBANVITAL_USERNAME/URBANVITAL_PASSWORD)")?;
                    (creds.username, creds.password)
                }
            };
            let user = client.login(&username, &password).await.map_err(surface)?;
            info!(username = %username, "logged in");
            print_json(&serde_json::to_value(user)?)?;
        }
        Commands::Logout => {
            client.logout().await;
            info!("logged out");
        }
        Commands::Whoami => {
            let profile = client.profile().await.map_err(surface)?;
            print_json(&profile)?;
        }
        Commands::Status => {
            let credential = client.credential().await;
            let status = json!({
                "logged_in": credential.is_some(),
                "has_refresh": credential.as_ref().map(|c| c.has_refresh()).unwrap_or(false),
                "issued_at": credential.as_ref().map(|c| c.issued_at.to_rfc3339()),
                "stale": client.is_credential_stale().await,
                "user": client.user().await,
            });
            print_json(&status)?;
        }
        Commands::Refresh => {
            client.refresh_now().await.map_err(surface)?;
            info!("access credential renewed");
        }
        Commands::Get { path, query, cache } => {
            let mut request = ApiRequest::get(path);
            for (key, value) in query {
                request = request.query(key, value);
            }
            if cache {
                request = request.cacheable();
            }
            let value = client.request(request).await.map_err(surface)?;
            print_json(&value)?;
        }
        Commands::Send { method, path, body } => {
            let mut request = ApiRequest::new(method, path);
            if let Some(raw) = body {
                let parsed: Value = serde_json::from_str(&raw).context("parsing --body JSON")?;
                request = request.json(parsed);
            }
            let value = client.request(request).await.map_err(surface)?;
            print_json(&value)?;
        }
    }

    Ok(())
}
