//! ngrok tunnel auto-discovery, grounded on `esence/core/node.py`'s
//! `_detect_ngrok_tunnel`/`_start_ngrok` and exercised in the original by
//! `tests/test_tunnel.py`.

use std::time::Duration;

use serde::Deserialize;

const NGROK_API: &str = "http://127.0.0.1:4040/api/tunnels";
const DETECT_TIMEOUT: Duration = Duration::from_secs(2);
const START_POLL_INTERVAL: Duration = Duration::from_millis(500);
const START_POLL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct TunnelsResponse {
    tunnels: Vec<Tunnel>,
}

#[derive(Deserialize)]
struct Tunnel {
    public_url: String,
    config: TunnelConfig,
}

#[derive(Deserialize)]
struct TunnelConfig {
    addr: String,
}

async fn detect_ngrok_tunnel(port: u16) -> Option<String> {
    let client = reqwest::Client::builder().timeout(DETECT_TIMEOUT).build().ok()?;
    let response = client.get(NGROK_API).send().await.ok()?;
    let body: TunnelsResponse = response.json().await.ok()?;
    let wanted_addr = format!("http://localhost:{port}");
    body.tunnels
        .into_iter()
        .find(|t| t.config.addr == wanted_addr)
        .map(|t| t.public_url)
}

/// If a tunnel is already running for `port`, return its public URL.
/// Otherwise, if an `ngrok` binary is on `PATH`, spawn one and poll for up
/// to 10 seconds. Returns `None` if neither is available.
pub async fn discover(port: u16) -> Option<String> {
    if let Some(url) = detect_ngrok_tunnel(port).await {
        return Some(url);
    }

    which_ngrok()?;
    let mut child = tokio::process::Command::new("ngrok")
        .arg("http")
        .arg(port.to_string())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .ok()?;

    let deadline = tokio::time::Instant::now() + START_POLL_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(START_POLL_INTERVAL).await;
        if let Some(url) = detect_ngrok_tunnel(port).await {
            return Some(url);
        }
        if let Ok(Some(_)) = child.try_wait() {
            return None;
        }
    }
    None
}

fn which_ngrok() -> Option<()> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join("ngrok"))
        .find(|candidate| candidate.is_file())
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detect_returns_none_when_nothing_is_listening() {
        // Port 1 is reserved and nothing binds the ngrok API there in tests.
        let result = detect_ngrok_tunnel(65535).await;
        assert!(result.is_none());
    }
}
