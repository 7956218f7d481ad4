use std::net::SocketAddr;
use std::sync::Arc;
use tenantbot::api::{self, AppState};
use tenantbot::application::actors::bot_session::SessionSettings;
use tenantbot::application::actors::orchestrator::{Orchestrator, OrchestratorConfig};
use tenantbot::application::actors::payment_reconciler::PaymentReconciler;
use tenantbot::application::services::payment_desk::PaymentDesk;
use tenantbot::config::AppConfig;
use tenantbot::domain::repositories::state_store::StateStore;
use tenantbot::infrastructure::binance_kline_feed::BinanceKlineFeed;
use tenantbot::infrastructure::credential_cipher::CredentialCipher;
use tenantbot::infrastructure::exchange_client_factory::BinanceClientFactory;
use tenantbot::infrastructure::trongrid_ledger::TronGridLedger;
use tenantbot::persistence::{init_database, state_repository::SqliteStateStore};
use tenantbot::secrets::{load_optional_secret, SecretConfig};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to read .env: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenantbot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();
    config.validate()?;
    info!(
        "Starting tenant bot orchestrator (binance testnet: {}, database: {})",
        config.binance_testnet, config.database_url
    );

    let pool = init_database(&config.database_url).await?;
    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::new(pool));

    let secret_config = SecretConfig::default();
    let mut factory = BinanceClientFactory::new(config.binance_testnet);
    match load_optional_secret("CREDENTIALS_ENCRYPTION_KEY", &secret_config)? {
        Some(passphrase) => factory = factory.with_cipher(CredentialCipher::new(passphrase)),
        None => warn!("CREDENTIALS_ENCRYPTION_KEY not set, tenant API keys are read as plaintext"),
    }

    let orchestrator = Orchestrator::spawn(
        OrchestratorConfig {
            rescan_interval: config.orchestrator_rescan_interval(),
            session: SessionSettings {
                cooldown: config.signal_cooldown(),
                history_capacity: config.indicator_history_capacity,
                feed_backoff: config.feed_backoff(),
            },
        },
        store.clone(),
        Arc::new(BinanceKlineFeed::new(config.binance_testnet)),
        Arc::new(factory),
    );

    let api_key = load_optional_secret("TRONGRID_API_KEY", &secret_config)?;
    if api_key.is_none() {
        warn!("TRONGRID_API_KEY not set, ledger requests are unauthenticated");
    }
    let ledger = TronGridLedger::new(
        &config.trongrid_api_url,
        api_key,
        &config.usdt_contract,
        config.trongrid_requests_per_second,
    )?;
    if config.treasury_address.is_none() {
        warn!("No treasury configured, completed payments will not be swept");
    }

    let payments = Arc::new(PaymentDesk::new(
        store.clone(),
        config.payment_amount_usdt,
        chrono::Duration::minutes(config.payment_expiry_minutes as i64),
    ));
    let reconciler = PaymentReconciler::new(config.reconciler_config(), store.clone(), Arc::new(ledger))
        .with_write_lock(payments.write_lock())
        .start();

    let app = api::router(AppState {
        orchestrator: orchestrator.clone(),
        payments,
    });

    let addr: SocketAddr = config.http_bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    let shutdown_signal = async {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!("Server stopped, shutting down actors...");
    reconciler.shutdown().await;
    if let Err(e) = orchestrator.shutdown().await {
        warn!("Orchestrator already gone: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}
