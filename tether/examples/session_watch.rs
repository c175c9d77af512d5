use std::{sync::Arc, time::Duration};

use clap::Parser;
use tether::{
    backend::HttpAuthBackend, providers::ProviderList, AuthConfig, ClientId, SessionController,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The client ID registered with the auth service
    #[clap(short, long, env)]
    client_id: ClientId,

    /// The auth service's base URL
    #[clap(short, long, env)]
    auth_url: Option<String>,

    /// This application's base URL
    #[clap(long, env)]
    app_url: Option<String>,

    /// The base URL of the API proxying the session endpoints
    #[clap(long, env)]
    api_url: Option<String>,

    /// Treat a session without an organization as authenticated
    #[clap(long, env)]
    allow_no_org: bool,

    /// How often to report on the session, in seconds
    #[clap(short, long, env, default_value = "5")]
    interval: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let mut config = AuthConfig::new(opts.client_id).with_require_org(!opts.allow_no_org);
    if let Some(auth_url) = opts.auth_url {
        config = config.with_auth_url(auth_url);
    }
    if let Some(app_url) = opts.app_url {
        config = config.with_app_url(app_url);
    }
    if let Some(api_url) = opts.api_url {
        config = config.with_api_url(api_url);
    }

    let backend = Arc::new(HttpAuthBackend::new()?);
    let session = SessionController::builder(config, backend).connect().await?;

    let providers = ProviderList::for_session(&session);
    providers.mount().await;
    let view = providers.view();
    tracing::info!(
        providers = ?view.providers.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
        email_enabled = view.email_enabled,
        error = view.error.as_deref(),
        "sign-in options"
    );

    let mut watcher = session.subscribe();
    tokio::spawn(async move {
        while watcher.changed().await.is_ok() {
            let state = watcher.snapshot();
            tracing::info!(
                authenticated = state.is_authenticated(),
                organization = state.organization().map(|o| o.slug.as_str()),
                role = state.org_role(),
                "session changed"
            );
        }
    });

    let mut interval = time::interval(Duration::from_secs(opts.interval));
    loop {
        interval.tick().await;

        match session.get_access_token().await {
            Some(token) => {
                tracing::debug!(
                    token = format_args!("{:#?}", token),
                    next_refresh_in = ?session.scheduled_refresh_in(),
                    "pulled token"
                )
            }
            None => {
                tracing::warn!(phase = ?session.phase(), "no session, sign in and try again");
            }
        }
    }
}
