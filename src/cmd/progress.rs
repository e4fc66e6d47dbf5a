//! Progress channel commands - `reshard-phase report` and `reshard-phase serve-progress`.

use anyhow::{Context, Result, bail};
use reshard_phase::config::ReshardConfig;
use reshard_phase::progress::{ProgressEvent, ProgressMessage, ProgressServer};
use reshard_phase::ui::StatusMode;
use std::path::Path;

/// POST one progress message to `url`.
pub async fn cmd_report(
    url: &str,
    message: &str,
    units: Option<(u64, u64)>,
    finished: bool,
    error: bool,
) -> Result<()> {
    let mut body = if finished {
        ProgressMessage::finished(message)
    } else if error {
        ProgressMessage::failed(message)
    } else {
        ProgressMessage::info(message)
    };
    if let Some((processed, total)) = units {
        body = body.with_units(processed, total);
    }

    let response = reqwest::Client::new()
        .post(url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        bail!("progress endpoint rejected message ({}): {}", status, text.trim());
    }

    tracing::debug!(url, status = %status, "progress message accepted");
    Ok(())
}

/// Serve progress endpoints until interrupted, showing every message in the status display.
///
/// A fresh endpoint is registered whenever the current one receives a
/// terminal message, so a script can be exercised repeatedly.
pub async fn cmd_serve_progress(
    config_path: &Path,
    bind: Option<String>,
    advertise_host: Option<String>,
    mode: StatusMode,
) -> Result<()> {
    let mut config = ReshardConfig::load_layered(config_path)?;
    if let Some(bind) = bind {
        config.progress.bind = bind;
    }
    if advertise_host.is_some() {
        config.progress.advertise_host = advertise_host;
    }

    let mut server = ProgressServer::start(&config.progress).await?;
    let status = mode.root("progress server");
    status.prop("listening", &server.addr().to_string());

    let mut endpoint = server.hub().register();
    let mut node = status.child();
    node.update(&format!("waiting on {}", endpoint.url()));
    println!("STATUS_URL={}", endpoint.url());

    loop {
        tokio::select! {
            event = endpoint.recv() => {
                let Some(event) = event else { break };
                node.update(&event.describe());
                if let ProgressEvent::Failed { message } = &event {
                    tracing::warn!(token = endpoint.token(), message = %message, "script reported failure");
                }
                if event.is_terminal() {
                    endpoint = server.hub().register();
                    node = status.child();
                    node.update(&format!("waiting on {}", endpoint.url()));
                    println!("STATUS_URL={}", endpoint.url());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, stopping progress server");
                break;
            }
        }
    }

    drop(endpoint);
    status.clear();
    server.stop();
    Ok(())
}
