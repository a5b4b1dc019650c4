use relocated::application::{EventDispatcher, RelocatesService};
use relocated::config::Config;
use relocated::domain::relocate::RelocateRegistry;
use relocated::infrastructure::{BroadcastNotifier, InMemoryTelephony, InMemoryUserDirectory};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration, file path from the first argument
    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    // Initialize tracing, RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting relocated");
    info!("Configuration loaded: {:?}", config);

    let telephony = Arc::new(InMemoryTelephony::new(config.telephony.event_buffer));
    let users = Arc::new(InMemoryUserDirectory::new());
    let notifier = Arc::new(BroadcastNotifier::new(config.telephony.event_buffer));
    let registry = Arc::new(RelocateRegistry::new());

    let service = RelocatesService::new(
        telephony.clone(),
        telephony.clone(),
        users,
        registry.clone(),
        notifier.clone(),
        config.relocates.clone(),
    );

    let dispatcher = Arc::new(EventDispatcher::new(registry, telephony.clone()));
    let dispatcher_task = dispatcher.spawn(telephony.as_ref());

    // Log outgoing events until a real bus is attached
    let mut events = notifier.subscribe();
    let events_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(
                    event = event.kind.name(),
                    event_id = %event.event_id,
                    routing_key = event.kind.routing_key(),
                    relocate = %event.relocate.uuid,
                    state = %event.relocate.state,
                    "relocate event"
                ),
                Err(RecvError::Lagged(missed)) => warn!(missed, "relocate events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    telephony.reconnect();
    info!(active = service.active_count(), "relocated ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    dispatcher_task.abort();
    events_task.abort();
    Ok(())
}
