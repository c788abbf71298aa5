use std::time::Duration;

use anyhow::anyhow;
use rand::Rng;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handshake outcome the reconnect loop cares about: an explicit rejection
/// is fatal at startup, everything else retries forever.
#[derive(Debug)]
pub enum ConnectError {
    Rejected(u16),
    Transient(anyhow::Error),
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::Rejected(status) => {
                write!(f, "server rejected the handshake with status {status}")
            }
            ConnectError::Transient(err) => write!(f, "connect failed: {err}"),
        }
    }
}

pub async fn connect(ws_url: &str) -> Result<WsStream, ConnectError> {
    match connect_async(ws_url).await {
        Ok((stream, _response)) => Ok(stream),
        Err(WsError::Http(response)) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                Err(ConnectError::Rejected(status))
            } else {
                Err(ConnectError::Transient(anyhow!(
                    "unexpected handshake status {status}"
                )))
            }
        }
        Err(err) => Err(ConnectError::Transient(err.into())),
    }
}

/// Exponential backoff with a cap and a little jitter so a fleet of agents
/// does not reconnect in lockstep.
pub fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let base = Duration::from_millis(500);
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    exp.min(cap) + jitter
}

#[derive(Debug, Deserialize)]
struct FileListResponse {
    paths: Vec<String>,
}

/// Startup file listing, fetched from the server with the same bearer
/// token the session uses.
pub async fn fetch_file_list(
    client: &reqwest::Client,
    files_url: &str,
    token: &str,
) -> anyhow::Result<Vec<String>> {
    let resp = client.get(files_url).bearer_auth(token).send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("file list request returned status {}", resp.status());
    }
    let body: FileListResponse = resp.json().await?;
    Ok(body.paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        let cap = Duration::from_secs(30);
        let first = backoff_delay(0, cap);
        assert!(first >= Duration::from_millis(500));
        assert!(first < Duration::from_millis(800));

        let capped = backoff_delay(20, cap);
        assert!(capped >= cap);
        assert!(capped < cap + Duration::from_millis(300));
    }
}
