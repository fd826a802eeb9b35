use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use slider::api::{self, ApiState};
use slider::auth::Authenticator;
use slider::config::ProxyConfig;
use slider::directory::{BackendDirectory, BackendTarget};
use slider::forwarding::Forwarding;
use slider::proxy::Proxy;
use slider::session::SessionRegistry;

/// Slider: Minecraft proxy that can move players between backend servers
/// without disconnecting them.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let config = ProxyConfig::from_env()?;

    let directory = Arc::new(BackendDirectory::new(config.network.clone()));
    for (name, addr) in &config.servers {
        directory.register(BackendTarget::new(name.clone(), addr.clone()));
    }
    if directory.resolve(&config.default_server).is_err() {
        return Err(format!("DEFAULT_SERVER: '{}' is not in SERVERS", config.default_server).into());
    }

    if config.online_mode && matches!(config.forwarding, Forwarding::None) {
        warn!("Online mode without forwarding: backends will see offline UUIDs");
    }

    let auth = Authenticator::new(config.online_mode)?;
    let registry = Arc::new(SessionRegistry::new());

    if let Some(api_bind) = &config.api_bind {
        let app = api::router(ApiState {
            directory: Arc::clone(&directory),
            registry: Arc::clone(&registry),
        });
        let api_listener = TcpListener::bind(api_bind).await?;
        info!("API listening on {api_bind}");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(api_listener, app).await {
                error!("API server failed: {e}");
            }
        });
    }

    let proxy = Arc::new(Proxy::new(&config, directory, registry, auth));

    let listener = TcpListener::bind(&config.bind).await?;
    info!(
        online_mode = config.online_mode,
        default_server = %config.default_server,
        "Listening on {}",
        config.bind
    );

    proxy.run(listener).await;
    Ok(())
}
