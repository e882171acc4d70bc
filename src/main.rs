use anyhow::Result;
use callbridge::{
    api::HttpCallControl,
    config::{Cli, Config},
    engine::CallEngineBuilder,
    event::Severity,
    media::DetachedMediaSession,
    storage::create_store,
    version,
};
use clap::Parser;
use std::{fs::File, path::Path, sync::Arc};
use tokio::{select, sync::broadcast::error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.conf.as_deref().filter(|conf| Path::new(conf).exists()) {
        Some(conf) => Config::load(conf).expect("Failed to load config"),
        None => Config::default(),
    };

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }
    let _guard = if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file).expect("Failed to create log file");
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        log_fmt.with_writer(non_blocking).try_init().ok();
        Some(guard)
    } else {
        log_fmt.try_init().ok();
        None
    };

    info!("Starting {}", version::get_version_info());

    let api = Arc::new(HttpCallControl::new(&config.api)?);
    let store = create_store(&config.storage)?;
    let token = CancellationToken::new();
    let engine = CallEngineBuilder::new()
        .with_config(config)
        .with_api(api)
        .with_media(Arc::new(DetachedMediaSession::default()))
        .with_store(store)
        .with_cancel_token(token.clone())
        .build()?;

    let mut notifications = engine.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(n) => match n.severity {
                    Severity::Error => error!(title = n.title, "{}", n.message),
                    Severity::Warning => warn!(title = n.title, "{}", n.message),
                    _ => info!(title = n.title, "{}", n.message),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "notifications dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    engine.start().await?;

    if let Some(number) = cli.dial.as_deref() {
        let placed = match cli.bot.as_deref() {
            Some(bot) => engine.place_bot_call(number, bot).await,
            None => engine.place_call(number).await,
        };
        match placed {
            Ok(sip_call_id) => info!(
                number,
                sip_call_id = sip_call_id.as_deref().unwrap_or("-"),
                "call placed"
            ),
            Err(e) => error!(number, "failed to place call: {}", e),
        }
    }

    let mut view = engine.watch_view();
    loop {
        select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                info!(
                    active = current.active_calls.len(),
                    flow_step = ?current.flow_step,
                    phase = ?current.room_phase,
                    "calls updated"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received CTRL+C, shutting down");
                break;
            }
        }
    }

    engine.stop_monitoring();
    token.cancel();
    printer.abort();
    Ok(())
}
