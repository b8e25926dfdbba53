use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    routing::{get, post},
};
use clap::Parser;
use http::StatusCode;
use openssl::x509::X509;
use regex::Regex;
use tower_cookies::CookieManagerLayer;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

mod auth;
mod config;
mod middleware;
pub mod observability;
mod routes;
mod xml;


use auth::{
    AuthenticationSettingsResolver, AuthorizationService, IdentityCache, MarketplaceDirectory,
    MemorySessionStore, SamlResponseExtractor, SessionStore, SignatureFactory, StaticDirectory,
    UserDirectory, keystore,
};

/// How often expired sessions are swept from the store.
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::ServiceConfig>,
    /// Authentication mode and per-tenant SSO settings.
    pub settings: Arc<AuthenticationSettingsResolver>,
    pub marketplaces: Arc<dyn MarketplaceDirectory>,
    pub authorization: Arc<dyn AuthorizationService>,
    pub users: Arc<dyn UserDirectory>,
    pub sessions: Arc<dyn SessionStore>,
    pub signatures: Arc<SignatureFactory>,
    /// Signing keys, loaded on first use.
    pub identities: Arc<IdentityCache>,
    /// Trusted identity provider certificate. Responses are only verified
    /// when one is configured.
    pub idp_certificate: Option<Arc<X509>>,
    pub extractor: SamlResponseExtractor,
    /// Compiled `auth.filter.exclude_url_pattern`.
    pub exclude_url: Regex,
}

impl AppState {
    /// Wire the state from configuration, backed by the configured directory.
    pub fn new(config: config::ServiceConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let exclude_url = config.exclude_url_regex()?;

        let idp_certificate = match &config.auth.verification.idp_certificate {
            Some(path) => {
                let certificate = keystore::load_certificate(path)?;
                tracing::info!(path = %path.display(), "Loaded identity provider certificate");
                Some(Arc::new(certificate))
            }
            None => None,
        };

        let directory = Arc::new(StaticDirectory::from_config(&config));
        let signatures =
            SignatureFactory::new().with_key_value_embedding(config.auth.signing.embed_key_value);

        Ok(Self {
            settings: Arc::new(AuthenticationSettingsResolver::new(
                directory.clone(),
                directory.clone(),
            )),
            marketplaces: directory.clone(),
            authorization: directory.clone(),
            users: directory,
            sessions: Arc::new(MemorySessionStore::new()),
            signatures: Arc::new(signatures),
            identities: Arc::new(IdentityCache::new()),
            idp_certificate,
            extractor: SamlResponseExtractor::new(),
            exclude_url,
            config: Arc::new(config),
        })
    }
}

/// CLI arguments for the marketplace SSO service
#[derive(Parser, Debug)]
#[command(version, about = "Marketplace single sign-on service", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to marketplace-sso.toml if it exists,
    /// otherwise built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the server (default)
    Serve,
    /// Validate the configuration file and exit
    Check,
}

const DEFAULT_CONFIG_FILE: &str = "marketplace-sso.toml";

pub fn build_app(config: &config::ServiceConfig, state: AppState) -> Router {
    let redirects = &config.auth.redirects;

    Router::new()
        .route("/health", get(routes::health_check))
        .route(
            &redirects.saml_sp_redirect_page,
            get(routes::saml::redirect_to_idp),
        )
        .route(
            &redirects.saml_post_include_page,
            get(routes::saml::post_include),
        )
        .route("/saml2/acs", post(routes::saml::acs))
        .route("/slogout.jsf", get(routes::saml::logout))
        .fallback(|| async { StatusCode::NOT_FOUND })
        // Layers run bottom-up: cookies must be parsed before the access filter
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::marketplace_access_middleware,
        ))
        .layer(CookieManagerLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.server.body_limit_bytes))
        .with_state(state)
}

fn load_config(explicit_path: Option<&str>) -> Result<config::ServiceConfig, config::ConfigError> {
    match explicit_path {
        Some(path) => config::ServiceConfig::from_file(path),
        None if std::path::Path::new(DEFAULT_CONFIG_FILE).exists() => {
            config::ServiceConfig::from_file(DEFAULT_CONFIG_FILE)
        }
        None => Ok(config::ServiceConfig::default()),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    match args.command {
        Some(Command::Check) => {
            println!("Configuration OK (auth mode: {})", config.auth.mode.as_setting());
        }
        Some(Command::Serve) | None => run_server(config).await,
    }
}

async fn run_server(config: config::ServiceConfig) {
    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let state = match AppState::new(config.clone()) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize application state");
            std::process::exit(1);
        }
    };

    let cleanup = tokio::spawn(session_cleanup(state.sessions.clone()));
    let app = build_app(&config, state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, address = %bind_addr, "Failed to bind to address");
            std::process::exit(1);
        }
    };

    tracing::info!(
        auth_mode = config.auth.mode.as_setting(),
        "Server listening on http://{}",
        bind_addr
    );

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
    }
    cleanup.abort();
}

async fn session_cleanup(sessions: Arc<dyn SessionStore>) {
    let mut interval = tokio::time::interval(SESSION_CLEANUP_INTERVAL);
    loop {
        interval.tick().await;
        match sessions.cleanup().await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Removed expired sessions"),
            Err(e) => tracing::warn!(error = %e, "Session cleanup failed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
