use std::sync::Arc;

use mail_gateway::channels::{ImapListener, SmtpSender};
use mail_gateway::config::GatewayConfig;
use mail_gateway::dispatch::Dispatcher;
use mail_gateway::handler::ActionRegistry;
use mail_gateway::store::{StaticUserStore, UserStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = GatewayConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export GATEWAY_IMAP_HOST=imap.example.com");
        eprintln!("  export GATEWAY_IMAP_USERNAME=bot@example.com");
        eprintln!("  export GATEWAY_IMAP_PASSWORD=...");
        std::process::exit(1);
    });

    let users = StaticUserStore::from_json_file(&config.users_file)?;

    eprintln!("📬 Mail Gateway v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   App: {}", config.app_name);
    eprintln!("   IMAP: {}:{}", config.imap.host, config.imap.port);
    eprintln!("   SMTP: {}:{}", config.smtp.host, config.smtp.port);
    eprintln!(
        "   Users: {} (from {})",
        users.len(),
        config.users_file.display()
    );
    eprintln!(
        "   Poll: every {}s, max {} in flight\n",
        config.poll_interval.as_secs(),
        config.dispatch.max_in_flight
    );

    let GatewayConfig {
        app_name,
        imap,
        smtp,
        poll_interval,
        mail_queue_capacity,
        dispatch,
        ..
    } = config;

    // ── Pipeline ─────────────────────────────────────────────────────────
    let sender = Arc::new(SmtpSender::new(Arc::new(smtp), app_name));
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(users), sender, dispatch));

    let actions = ActionRegistry::with_builtins();
    tracing::info!(actions = actions.count(), "Action registry ready");
    dispatcher.on_message_receive(Arc::new(actions))?;

    let listener = ImapListener::new(Arc::new(imap));
    let mut running = dispatcher.listen(&listener, poll_interval, mail_queue_capacity);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl+C received, shutting down...");
            running.shutdown();
        }
        result = &mut running.dispatch => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Dispatch loop terminated unexpectedly");
            }
        }
    }

    Ok(())
}
