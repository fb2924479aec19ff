use std::process::ExitCode;

use argh::FromArgs;
use reqwest::Method;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use testhub::{ApiError, ApiRequest, ApiResult, ClientConfig, ClientEvent, SessionManager};

#[derive(FromArgs, Debug)]
/// testhub: command-line client for the testhub API.
struct Args {
    /// API base URL (overrides TESTHUB_API_URL)
    #[argh(option)]
    api_url: Option<String>,

    /// directory holding the stored session (overrides TESTHUB_STATE_DIR)
    #[argh(option)]
    state_dir: Option<String>,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Login(LoginCommand),
    Logout(LogoutCommand),
    Whoami(WhoamiCommand),
    Orgs(OrgsCommand),
    SwitchOrg(SwitchOrgCommand),
    Request(RequestCommand),
}

#[derive(FromArgs, Debug)]
/// log in and store the session
#[argh(subcommand, name = "login")]
struct LoginCommand {
    /// account email
    #[argh(positional)]
    email: String,

    /// password (defaults to TESTHUB_PASSWORD)
    #[argh(option)]
    password: Option<String>,
}

#[derive(FromArgs, Debug)]
/// forget the stored session
#[argh(subcommand, name = "logout")]
struct LogoutCommand {}

#[derive(FromArgs, Debug)]
/// show the stored session
#[argh(subcommand, name = "whoami")]
struct WhoamiCommand {}

#[derive(FromArgs, Debug)]
/// list organizations
#[argh(subcommand, name = "orgs")]
struct OrgsCommand {
    /// fetch the list from the server first
    #[argh(switch, short = 'r')]
    refresh: bool,
}

#[derive(FromArgs, Debug)]
/// switch the session to another organization
#[argh(subcommand, name = "switch-org")]
struct SwitchOrgCommand {
    /// organization id
    #[argh(positional)]
    id: i64,
}

#[derive(FromArgs, Debug)]
/// send an authenticated request and print the response body
#[argh(subcommand, name = "request")]
struct RequestCommand {
    /// HTTP method (GET, POST, PUT, PATCH, DELETE)
    #[argh(positional)]
    method: String,

    /// path relative to the API base URL
    #[argh(positional)]
    path: String,

    /// JSON request body
    #[argh(option, short = 'd')]
    data: Option<String>,
}

fn print_json<T: serde::Serialize>(value: &T) -> ApiResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Runs one command. `Ok(false)` means the failure was already reported.
async fn run(manager: &SessionManager, command: Command) -> ApiResult<bool> {
    match command {
        Command::Login(cmd) => {
            let password = match cmd.password.or_else(|| std::env::var("TESTHUB_PASSWORD").ok()) {
                Some(password) => password,
                None => {
                    eprintln!("A password is required (--password or TESTHUB_PASSWORD)");
                    return Ok(false);
                }
            };
            let session = manager.login(&cmd.email, &password).await?;
            println!(
                "Logged in as user {} ({} organizations)",
                session.user_id,
                session.organizations.len()
            );
        }
        Command::Logout(_) => {
            manager.logout()?;
            println!("Logged out");
        }
        Command::Whoami(_) => {
            let session = manager.store().get_session().ok_or(ApiError::NotAuthenticated)?;
            print_json(&serde_json::json!({
                "userId": session.user_id,
                "organizationId": session.organization_id,
                "organizationSlug": session.organization_slug,
                "organizationRole": session.organization_role,
            }))?;
        }
        Command::Orgs(cmd) => {
            let context = manager.organization_context();
            if cmd.refresh {
                context.refresh_organizations().await?;
            }
            let current = context.current_organization().map(|o| o.id);
            for org in context.organizations() {
                let marker = if Some(org.id) == current { "*" } else { " " };
                println!("{} {:>6}  {:<24} {:<8} {}", marker, org.id, org.slug, org.role, org.plan);
            }
        }
        Command::SwitchOrg(cmd) => {
            let context = manager.organization_context();
            if !context.switch_organization(cmd.id).await {
                eprintln!("Could not switch to organization {}", cmd.id);
                return Ok(false);
            }
            if let Some(org) = context.current_organization() {
                println!("Switched to {} ({})", org.name, org.role);
            }
        }
        Command::Request(cmd) => {
            let Ok(method) = Method::from_bytes(cmd.method.to_uppercase().as_bytes()) else {
                eprintln!("Unknown HTTP method: {}", cmd.method);
                return Ok(false);
            };
            let mut request = ApiRequest::new(method, cmd.path);
            if let Some(data) = cmd.data {
                let body: serde_json::Value = serde_json::from_str(&data)?;
                request = request.json(&body)?;
            }
            let response = manager.api().send(request).await?;
            eprintln!("HTTP {}", response.status());
            println!("{}", response.text());
            return Ok(response.is_success());
        }
    }
    Ok(true)
}

fn report_events(rx: &mut broadcast::Receiver<ClientEvent>) {
    while let Ok(event) = rx.try_recv() {
        match event {
            ClientEvent::BillingLimitReached(limit) => eprintln!(
                "Plan limit reached for {}: {}/{}. Upgrade your plan to continue.",
                limit.metric.as_deref().unwrap_or("this feature"),
                limit.current.map(|c| c.to_string()).unwrap_or_else(|| "?".into()),
                limit.limit.map(|l| l.to_string()).unwrap_or_else(|| "?".into()),
            ),
            ClientEvent::SessionInvalidated => {
                eprintln!("Your session has expired. Run `testhub login` again.")
            }
            ClientEvent::LoggedOut => {}
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "testhub=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Args = argh::from_env();

    let mut config = ClientConfig::from_env();
    if let Some(url) = args.api_url {
        config = config.with_base_url(url);
    }
    if let Some(dir) = args.state_dir {
        config = config.with_state_dir(dir);
    }

    let manager = match SessionManager::with_file_storage(config) {
        Ok(manager) => manager,
        Err(e) => {
            tracing::error!("Failed to start client: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut events = manager.events().subscribe();
    let result = run(&manager, args.command).await;
    report_events(&mut events);

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
