//! Storefront CLI - a command-line shell over the storefront API client.
//!
//! Signs in against the Backend-for-Frontend, keeps the session between
//! runs and sends authenticated requests, printing JSON responses.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use storefront_core::api::Method;
use storefront_core::{
    ApiClient, ApiError, Config, DurableSessionStore, FileBackend, KeyringBackend, LoginRequest,
    RequestOptions, SessionBackendKind, SessionEvent, SessionStore,
};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Directory for daily log files; unset means stderr only
const ENV_LOG_DIR: &str = "STOREFRONT_LOG_DIR";

const USAGE: &str = "\
Usage: storefront <command>

Commands:
  login [email]           Sign in (prompts for the password)
  logout                  Sign out and forget the stored session
  whoami                  Fetch and show the signed-in profile
  status                  Show the locally stored session
  get <path>              GET a BFF path, e.g. /api/orders/my
  delete <path>           DELETE a BFF path
  post <path> <json>      POST a JSON body
  put <path> <json>       PUT a JSON body
  patch <path> <json>     PATCH a JSON body
";

/// Initialize the tracing subscriber for logging.
/// The returned guard flushes the file writer on drop.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "storefront.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn open_store(config: &Config) -> Result<Arc<dyn SessionStore>> {
    let store: Arc<dyn SessionStore> = match config.session_backend {
        SessionBackendKind::File => {
            let dir = config.data_dir()?;
            Arc::new(DurableSessionStore::open(FileBackend::new(dir)))
        }
        SessionBackendKind::Keyring => Arc::new(DurableSessionStore::open(KeyringBackend::new())),
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprint!("{}", USAGE);
        std::process::exit(2);
    };

    let mut config = Config::load().context("Failed to load config")?;
    let client_config = config.client_config();
    debug!(base_url = %client_config.base_url, "Storefront CLI starting");

    let store = open_store(&config)?;
    let api = ApiClient::new(client_config, store)?;

    // The shell owns navigation: an expired session means "log in again"
    let mut events = api.subscribe();

    let result = run(&api, &mut config, command, &args[1..]).await;
    for notice in session_notices(&mut events) {
        eprintln!("{}", notice);
    }

    match result {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<ApiError>() {
            Some(api_err) => {
                eprintln!("Error: {}", api_err.user_message());
                for field in api_err.field_errors() {
                    eprintln!("  {}", field);
                }
                debug!(error = %api_err, "Command failed");
                std::process::exit(1);
            }
            None => Err(e),
        },
    }
}

/// Everything the command left in the event channel that the user must
/// act on. Events are sent before the failing call returns, so draining
/// after `run` sees all of them.
fn session_notices(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<String> {
    let mut notices = Vec::new();
    loop {
        match events.try_recv() {
            Ok(SessionEvent::Expired { reason }) => notices.push(format!(
                "Your session has expired ({}). Run `storefront login` to sign in again.",
                reason
            )),
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    notices
}

async fn run(api: &ApiClient, config: &mut Config, command: &str, rest: &[String]) -> Result<()> {
    match (command, rest) {
        ("login", rest) => login(api, config, rest.first().cloned()).await,
        ("logout", []) => {
            api.logout().await;
            println!("Signed out.");
            Ok(())
        }
        ("whoami", []) => {
            let profile = api.fetch_profile().await?;
            print_json(&serde_json::to_value(&profile)?)
        }
        ("status", []) => {
            status(api);
            Ok(())
        }
        ("get", [path]) => send(api, Method::GET, path, None).await,
        ("delete", [path]) => send(api, Method::DELETE, path, None).await,
        (verb @ ("post" | "put" | "patch"), [path, body]) => {
            let method = match verb {
                "post" => Method::POST,
                "put" => Method::PUT,
                _ => Method::PATCH,
            };
            let body: Value = serde_json::from_str(body).context("Request body is not valid JSON")?;
            send(api, method, path, Some(body)).await
        }
        _ => {
            eprint!("{}", USAGE);
            bail!("Unknown command or wrong arguments: {}", command)
        }
    }
}

async fn send(
    api: &ApiClient,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> Result<()> {
    let response = api.request(method, path, body, RequestOptions::default()).await?;
    print_json(&response)
}

async fn login(api: &ApiClient, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = rpassword::prompt_password("Password: ")?;

    let session = api.login(&LoginRequest::new(email.clone(), password)).await?;

    config.last_email = Some(email);
    if let Err(e) = config.save() {
        tracing::warn!(error = %e, "Failed to save config");
    }

    let name = session
        .user
        .as_ref()
        .map(|u| u.display_name().to_string())
        .unwrap_or_else(|| "customer".to_string());
    info!("Login complete");
    println!("Signed in as {}.", name);
    Ok(())
}

fn status(api: &ApiClient) {
    match api.session().snapshot() {
        Some(session) => {
            let name = session
                .user
                .as_ref()
                .map(|u| u.display_name().to_string())
                .unwrap_or_else(|| "(no profile)".to_string());
            println!("Signed in as {}", name);
            println!("Refresh token stored: {}", session.refresh_token.is_some());
            if let Some(minutes) = session.minutes_since_update() {
                println!("Tokens last updated {}m ago", minutes);
            }
        }
        None => println!("Not signed in."),
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn print_json(value: &Value) -> Result<()> {
    if !value.is_null() {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    Ok(())
}
