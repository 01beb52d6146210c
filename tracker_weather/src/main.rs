use async_trait::async_trait;
use clap::Parser;
use std::sync::Arc;
use tracker_core::{
    start_tracker, CycleReport, Decision, HistoryStore, InMemoryHistory, Notifier,
    TrackerConfig, TrackerInstance,
};

mod cli;
mod openweather;

use cli::Cli;
use openweather::{weather_image, OpenWeatherClient};

/// Logs every outcome of one city's tracker. Partial snapshots are never kept.
struct LogNotifier {
    tracker: String,
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, report: &CycleReport, history: &dyn HistoryStore) -> Decision {
        match report {
            CycleReport::Committed(snapshot) => {
                let snapshot = serde_json::to_string(snapshot).unwrap_or_default();
                tracing::info!(tracker = %self.tracker, %snapshot, "new data");
            }
            CycleReport::Rejected { error, .. } => {
                let last_commit = match history.last().await {
                    Ok(last) => last.and_then(|s| s.end_update),
                    Err(_) => None,
                };
                tracing::warn!(
                    tracker = %self.tracker,
                    error = %error,
                    last_commit = ?last_commit,
                    "augment failed; partial snapshot discarded"
                );
            }
            CycleReport::Fatal(error) => {
                tracing::error!(tracker = %self.tracker, error = %error, "update failed");
            }
        }
        Decision::Discard
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracker_core::o11y::init_global_from_env()?;
    let cli = Cli::parse();
    let config = TrackerConfig::from_env()?;

    let image = weather_image(OpenWeatherClient::new(cli.api_base)?)?;

    let mut handles = Vec::with_capacity(cli.cities.len());
    for city in &cli.cities {
        let name = format!("{city}_weather_tracker");
        let mut inputs = serde_json::Map::new();
        inputs.insert("api_key".to_string(), cli.api_key.clone().into());
        inputs.insert("city_name".to_string(), city.clone().into());

        let handle = start_tracker(
            TrackerInstance::new(name.clone(), image.clone(), inputs),
            Arc::new(InMemoryHistory::new()),
            Arc::new(LogNotifier { tracker: name }),
            config.clone(),
        )?;
        handles.push(handle);
    }
    tracing::info!(trackers = handles.len(), "weather trackers running; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    for handle in &handles {
        handle.stop();
    }
    for handle in handles {
        handle.shutdown().await?;
    }
    Ok(())
}
