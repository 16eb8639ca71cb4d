use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use teloxide::Bot;
use tracing::error;
use tracing_subscriber::EnvFilter;

use stationcast::cache::TtlCache;
use stationcast::config::Config;
use stationcast::dispatch::Dispatcher;
use stationcast::quasar::QuasarClient;
use stationcast::session::SessionStore;
use stationcast::{server, telegram};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    let cache = TtlCache::with_default_ttls();
    let _janitor = cache.spawn_janitor();
    let sessions = SessionStore::new();
    let client = QuasarClient::new(
        &config.yandex_client_id,
        cache.clone(),
        reqwest::Client::new(),
    );
    let dispatcher = Dispatcher::new(sessions, cache, client);

    let ip: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("invalid bind host `{}`", config.host))?;
    let addr = SocketAddr::new(ip, config.port);
    tokio::spawn(async move {
        if let Err(e) = server::serve(addr).await {
            error!(error = %e, "health server stopped unexpectedly");
        }
    });

    let bot = Bot::new(&config.bot_token);
    telegram::run(bot, dispatcher).await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("stationcast=info".parse().expect("valid directive")),
        )
        .init();
}
