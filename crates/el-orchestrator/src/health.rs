//! HTTP(S) health gate

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use el_core::config::HealthConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

fn build_client(cfg: &HealthConfig) -> Result<reqwest::Client, String> {
    // Bypass any system proxy so a local socks configuration cannot break
    // loopback health checks.
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .no_proxy()
        .danger_accept_invalid_certs(!cfg.verify_tls)
        .build()
        .map_err(|e| e.to_string())
}

fn health_url(cfg: &HealthConfig, host: &str, port: u16) -> String {
    format!("{}://{}:{}{}", cfg.scheme, host, port, cfg.path)
}

async fn check_once(client: &reqwest::Client, cfg: &HealthConfig, url: &str) -> Result<(), Option<String>> {
    match client.get(url).send().await {
        Ok(response) => {
            if cfg.any_status || response.status().is_success() {
                return Ok(());
            }
            let status = response.status();
            // A JSON error body may carry the real reason in `detail`.
            let detail = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| {
                    body.get("detail")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                });
            Err(Some(detail.unwrap_or_else(|| format!("HTTP {}", status))))
        }
        // Not reachable yet; keep polling without a diagnostic.
        Err(_) => Err(None),
    }
}

/// Poll the health endpoint until it responds, the timeout elapses, or the
/// run is cancelled. On failure the most recent diagnostic is returned.
pub(crate) async fn wait_healthy(
    cfg: &HealthConfig,
    host: &str,
    port: u16,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let client = build_client(cfg)?;
    let url = health_url(cfg, host, port);
    let deadline = tokio::time::Instant::now() + cfg.timeout;
    let mut last_detail: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return Err("run cancelled during health check".to_string());
        }
        match check_once(&client, cfg, &url).await {
            Ok(()) => return Ok(()),
            Err(detail) => {
                if detail.is_some() {
                    last_detail = detail;
                }
            }
        }
        if tokio::time::Instant::now() + cfg.interval > deadline {
            return Err(last_detail
                .unwrap_or_else(|| format!("no healthy response from {} within {:?}", url, cfg.timeout)));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err("run cancelled during health check".to_string()),
            _ = tokio::time::sleep(cfg.interval) => {}
        }
    }
}

/// Single direct probe against the device itself, used as the last resort
/// when no tunnel could be established.
pub(crate) async fn probe_direct(cfg: &HealthConfig, host: &str, port: u16) -> bool {
    let Ok(client) = build_client(cfg) else {
        return false;
    };
    let url = health_url(cfg, host, port);
    matches!(check_once(&client, cfg, &url).await, Ok(()))
}
