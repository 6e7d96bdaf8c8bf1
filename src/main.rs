use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter};

use odo::config::Settings;
use odo::detector::PageState;
use odo::runtime::SystemClock;
use odo::messaging::Request;
use odo::store::{FileStore, LocalState};
use odo::{Input, Runtime};

/// One stdin line: a message, a position signal, or a full page snapshot.
#[derive(Deserialize)]
#[serde(untagged)]
enum Line {
    Message(Request),
    Progress { progress: u64 },
    TimeUpdate { time_update: f64 },
    Page(Box<PageState>),
}

fn filter_for(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "odo=debug,info" } else { "info" }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("loading settings")?;
    settings.validate().map_err(|e| anyhow!(e))?;

    let path = settings
        .state_path()
        .ok_or_else(|| anyhow!("no state path: set storage.path or HOME"))?;
    let store = LocalState::new(FileStore::open(path.clone()).with_context(|| format!("opening {:?}", path))?)
        .with_history_limit(settings.tracking.history_limit);

    let debug = store.debug_mode().unwrap_or(settings.logging.debug);
    let (filter, filter_handle) = reload::Layer::new(filter_for(debug));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("odo starting, state at {:?}", path);

    let mut runtime = Runtime::new(settings, store, Arc::new(SystemClock))?.with_debug_hook(move |on| {
        if let Err(e) = filter_handle.reload(filter_for(on)) {
            tracing::warn!("Could not change log level: {}", e);
        }
    });
    let handle = runtime.handle();

    if let Some(mut notices) = runtime.take_notices() {
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                match serde_json::to_string(&notice) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!("Unprintable notice: {}", e),
                }
            }
        });
    }

    let driver = tokio::spawn(runtime.run());

    let reader = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let input = match line {
                "unload" => Input::Unload,
                "hidden" => Input::Hidden,
                _ => match serde_json::from_str::<Line>(line) {
                    Ok(Line::Message(request)) => {
                        if let Some(response) = reader.request(request).await {
                            match serde_json::to_string(&response) {
                                Ok(json) => println!("{}", json),
                                Err(e) => tracing::warn!("Unprintable response: {}", e),
                            }
                        }
                        continue;
                    }
                    Ok(Line::Progress { progress }) => Input::Progress(progress),
                    Ok(Line::TimeUpdate { time_update }) => Input::TimeUpdate(time_update),
                    Ok(Line::Page(page)) => Input::Page(page),
                    Err(e) => {
                        tracing::warn!("Ignoring unreadable input line: {}", e);
                        continue;
                    }
                },
            };
            if !reader.send(input).await {
                break;
            }
        }
        tracing::info!("Input closed, shutting down");
        reader.shutdown();
    });

    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.shutdown();
        }
    });

    driver.await.context("runtime task panicked")??;
    Ok(())
}
