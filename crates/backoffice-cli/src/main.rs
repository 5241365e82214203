//! backoffice - command-line shell for the back-office console session.
//!
//! Restores both credential flows at startup, reports authentication state,
//! drives logins and logouts, and sends authenticated requests to the backend.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use backoffice_core::api::{ApiClient, Method};
use backoffice_core::auth::PendingLogin;
use backoffice_core::{AuthGate, Config, SessionManager};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: backoffice <command>

Commands:
  status                          Show backend and identity-provider session state
  whoami                          Print the signed-in operator as JSON
  login                           Store a backend-issued token (read from the prompt)
  logout                          Log out of the backend session
  sso-login                       Sign in through the identity provider
  sso-logout                      End the identity-provider session
  sso-switch                      Sign out of the identity provider and sign in again
  refresh                         Refresh the identity-provider token now
  request <METHOD> <PATH> [JSON]  Send an authenticated request to the backend
  watch                           Keep the identity session fresh until Ctrl-C
";

#[derive(Debug, PartialEq)]
enum Command {
    Status,
    WhoAmI,
    Login,
    Logout,
    SsoLogin,
    SsoLogout,
    SsoSwitch,
    Refresh,
    Request {
        method: String,
        path: String,
        body: Option<String>,
    },
    Watch,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let command = args.get(1).map(String::as_str).unwrap_or("status");
    let cmd = match command {
        "status" => Command::Status,
        "whoami" => Command::WhoAmI,
        "login" => Command::Login,
        "logout" => Command::Logout,
        "sso-login" => Command::SsoLogin,
        "sso-logout" => Command::SsoLogout,
        "sso-switch" => Command::SsoSwitch,
        "refresh" => Command::Refresh,
        "watch" => Command::Watch,
        "request" => {
            let method = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("request needs a METHOD"))?
                .to_ascii_uppercase();
            let path = args
                .get(3)
                .ok_or_else(|| anyhow::anyhow!("request needs a PATH"))?
                .clone();
            Command::Request {
                method,
                path,
                body: args.get(4).cloned(),
            }
        }
        other => anyhow::bail!("Unknown command: {}\n\n{}", other, USAGE),
    };
    Ok(cmd)
}

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` controls the level (default `warn`). With `BACKOFFICE_LOG_DIR`
/// set, logs go to a daily rolling file there instead of stderr.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match std::env::var_os("BACKOFFICE_LOG_DIR").map(PathBuf::from) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "backoffice.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", USAGE);
        return Ok(());
    }
    let command = parse_args(&args)?;

    let _log_guard = init_tracing();
    info!(?command, "backoffice starting");

    let config = Config::load()?;
    let store = config.open_store()?;
    let session = Arc::new(SessionManager::from_config(&config, store)?);
    let api = ApiClient::new(&config.api_base_url)?.with_bearer(session.bearer_source());

    let result = run(command, &config, &session, &api).await;
    session.shutdown();
    result
}

async fn run(command: Command, config: &Config, session: &SessionManager, api: &ApiClient) -> Result<()> {
    match command {
        Command::Status => {
            session.bootstrap().await;
            print_status(session, api).await;
        }
        Command::WhoAmI => {
            session.bootstrap().await;
            let out = serde_json::json!({
                "auth": session.auth(),
                "profile": session.load_profile(api).await,
                "identity": session.provider_user(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Login => {
            let token = rpassword::prompt_password("Backend token: ")
                .context("Failed to read token")?;
            let auth = session.login_custom(token.trim());
            if auth.is_authenticated {
                println!(
                    "Logged in (account {}, role {})",
                    auth.account_id.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
                    auth.role.unwrap_or_else(|| "-".into())
                );
            } else {
                anyhow::bail!("Token rejected: it is malformed or already expired");
            }
        }
        Command::Logout => {
            // The stored token goes to the server as is, even when expired
            session.logout(api).await;
            println!("Logged out");
        }
        Command::SsoLogin => {
            session.bootstrap().await;
            if session.gate() == AuthGate::Authenticated {
                println!("Already signed in");
                return Ok(());
            }
            let pending = session.begin_sso_login(&config.login_redirect_uri())?;
            sso_login(session, pending).await?;
        }
        Command::SsoLogout => {
            session.bootstrap().await;
            session.sso_logout().await;
            println!("Signed out of the identity provider");
        }
        Command::SsoSwitch => {
            session.bootstrap().await;
            let pending = session
                .sso_switch_account(&config.login_redirect_uri())
                .await?;
            println!("Signed out of the identity provider");
            sso_login(session, pending).await?;
        }
        Command::Refresh => {
            session.bootstrap().await;
            let refreshed = session
                .force_refresh()
                .await
                .context("Token refresh failed; the session has been ended")?;
            println!("{}", if refreshed { "Token refreshed" } else { "Token still valid" });
        }
        Command::Request { method, path, body } => {
            session.bootstrap().await;
            let method = method
                .parse::<Method>()
                .map_err(|_| anyhow::anyhow!("Invalid HTTP method: {}", method))?;
            let body = body
                .map(|b| serde_json::from_str::<serde_json::Value>(&b))
                .transpose()
                .context("Request body is not valid JSON")?;
            let value = api.request_json(method, &path, body.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::Watch => {
            session.bootstrap().await;
            watch(session).await?;
        }
    }
    Ok(())
}

async fn print_status(session: &SessionManager, api: &ApiClient) {
    let auth = session.auth();
    println!("Backend session:");
    if auth.is_authenticated {
        let profile = session.load_profile(api).await;
        println!(
            "  authenticated  account={} role={}",
            auth.account_id.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
            auth.role.as_deref().unwrap_or("-")
        );
        if !profile.is_empty() {
            println!("  profile        {}", profile.display_name());
        }
    } else {
        println!("  not authenticated");
    }

    let identity = session.identity();
    println!("Identity provider:");
    println!("  state          {}", identity.state.label());
    if let Some(user) = session.provider_user() {
        println!("  user           {}", user.username.as_deref().unwrap_or("-"));
        if !user.roles.is_empty() {
            println!("  roles          {}", user.roles.join(", "));
        }
    }
}

async fn sso_login(session: &SessionManager, pending: PendingLogin) -> Result<()> {
    println!("Open this URL in a browser and sign in:\n\n  {}\n", pending.url);
    print!("Paste the URL you were redirected to: ");
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read callback URL")?;
    let (code, state) = PendingLogin::parse_callback(line.trim())?;

    session.complete_sso_login(&pending, &code, &state).await?;
    let user = session.provider_user().and_then(|u| u.username);
    println!("Signed in as {}", user.as_deref().unwrap_or("unknown user"));
    Ok(())
}

async fn watch(session: &SessionManager) -> Result<()> {
    if session.gate() != AuthGate::Authenticated {
        anyhow::bail!("No identity session; run `backoffice sso-login` first");
    }

    let mut updates = session.identity_session().subscribe();
    println!("Keeping the session fresh; press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().state;
                println!("identity session: {}", state.label());
                if !session.identity().authenticated {
                    anyhow::bail!("Identity session ended");
                }
            }
        }
    }
    Ok(())
}
