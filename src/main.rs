use anyhow::Result;
use tracing::info;

use wordstat_sessions::utils::logging;
use wordstat_sessions::{secrets, AccountStore, Config, EventSink, SecretAnswerBridge, Selectors, SessionPool};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    logging::init(config.verbose_logging);

    let selectors = Selectors::load(config.selectors_file.as_deref())?;
    let store = AccountStore::open(&config.db_path())?;
    let records = secrets::load(&config.accounts_file)?;

    let (sink, mut events) = EventSink::channel();
    let bridge = SecretAnswerBridge::new();
    let mut pool = SessionPool::new(config, selectors, store, sink, bridge);

    // Without a UI, just log what the pool reports.
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!("event: {:?}", event);
        }
    });

    pool.start_all(&records).await?;
    info!("fleet is up; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    pool.stop_all().await;
    event_task.abort();

    Ok(())
}
