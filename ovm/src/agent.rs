//! Guest-agent channel: line-delimited JSON over the VM's vsock.
//!
//! Requests are `{"execute": "<verb>", "arguments": {…}?}` and responses
//! `{"return": …}` or `{"error": {"class", "desc"}}`, one line each. The
//! daemon polls `guest-ping` / `guest-network-get-interfaces` periodically
//! and persists the result as `network-info.json`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_vsock::{VsockAddr, VsockStream};
use tracing::debug;

use crate::store::VmStore;

/// Guest CID the agent listens on.
pub const GUEST_CID: u32 = 3;

/// Vsock port of the guest agent.
pub const AGENT_PORT: u32 = 9001;

/// Timeout for `guest-ping`.
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for `guest-network-get-interfaces`.
pub const INTERFACES_TIMEOUT: Duration = Duration::from_secs(3);

/// Steady-state poll interval.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Offsets of the initial probe attempts after daemon start.
const INITIAL_PROBE_OFFSETS: [u64; 4] = [5, 10, 15, 20];

/// Errors raised by the guest-agent channel.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GuestAgentError {
    /// `connect` has not succeeded yet.
    #[error("guest agent is not connected")]
    NotConnected,

    /// The request did not complete within its deadline.
    #[error("guest agent request timed out")]
    Timeout,

    /// The response line was structurally unexpected.
    #[error("unexpected guest agent response")]
    InvalidResponse,

    /// The agent reported an error.
    #[error("guest agent error: {0}")]
    AgentError(String),

    /// Encoding the request failed.
    #[error("failed to encode request: {0}")]
    EncodingError(serde_json::Error),

    /// Decoding the response failed.
    #[error("failed to decode response: {0}")]
    DecodingError(String),

    /// The connection failed mid-request.
    #[error("guest agent connection failed: {0}")]
    ConnectionError(#[from] std::io::Error),
}

/// Opaque vsock endpoint exposed by the engine for the guest agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct VsockEndpoint {
    /// Guest context id.
    pub cid: u32,
    /// Agent port.
    pub port: u32,
}

impl VsockEndpoint {
    /// The conventional guest-agent endpoint.
    pub const fn guest_agent() -> Self {
        Self {
            cid: GUEST_CID,
            port: AGENT_PORT,
        }
    }
}

/// One guest IP address entry, in agent wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct IpAddress {
    /// `"ipv4"` or `"ipv6"`.
    #[serde(rename = "ip-address-type")]
    pub ip_address_type: String,
    /// Address literal.
    #[serde(rename = "ip-address")]
    pub ip_address: String,
    /// Network prefix length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<u32>,
}

/// One guest network interface, in agent wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct NetworkInterface {
    /// Interface name inside the guest.
    pub name: String,
    /// MAC address, if reported.
    #[serde(
        rename = "hardware-address",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub hardware_address: Option<String>,
    /// Assigned addresses.
    #[serde(rename = "ip-addresses", default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<IpAddress>,
}

/// Last known guest network state, persisted as `network-info.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct NetworkInfo {
    /// Interfaces as reported by the agent.
    pub interfaces: Vec<NetworkInterface>,
    /// When the query completed.
    pub queried_at: DateTime<Utc>,
}

impl NetworkInfo {
    /// First IPv4 address of the first non-loopback interface.
    pub fn primary_ipv4(&self) -> Option<&str> {
        self.interfaces
            .iter()
            .filter(|i| i.name != "lo")
            .find_map(|i| {
                i.ip_addresses
                    .iter()
                    .find(|a| a.ip_address_type == "ipv4" && !a.ip_address.starts_with("127."))
                    .map(|a| a.ip_address.as_str())
            })
    }
}

/// Request line sent to the agent.
#[derive(Serialize)]
struct QgaRequest<'a> {
    /// Verb name.
    execute: &'a str,
    /// Optional verb arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
}

/// Response line received from the agent.
#[derive(Deserialize)]
struct QgaResponse {
    /// Success payload.
    #[serde(rename = "return")]
    ret: Option<Value>,
    /// Error payload.
    error: Option<QgaError>,
}

/// Agent-side error description.
#[derive(Deserialize)]
struct QgaError {
    /// Error class; informational only.
    #[allow(dead_code)]
    class: String,
    /// Human-readable description.
    desc: String,
}

/// Line-delimited request/response client over any byte stream.
#[derive(Debug)]
pub struct QgaClient<S> {
    /// Underlying stream.
    stream: S,
    /// Bytes read past the last newline.
    readbuf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> QgaClient<S> {
    /// Wraps a connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            readbuf: Vec::new(),
        }
    }

    /// Sends one request and awaits one response line, racing the exchange
    /// against `timeout`; the loser is cancelled.
    pub async fn send_command(
        &mut self,
        execute: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, GuestAgentError> {
        let mut line = serde_json::to_string(&QgaRequest { execute, arguments })
            .map_err(GuestAgentError::EncodingError)?;
        line.push('\n');

        let exchange = async {
            self.stream.write_all(line.as_bytes()).await?;
            self.stream.flush().await?;
            self.read_line().await
        };
        let response = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| GuestAgentError::Timeout)??;

        let decoded: QgaResponse = serde_json::from_slice(&response)
            .map_err(|e| GuestAgentError::DecodingError(e.to_string()))?;
        if let Some(err) = decoded.error {
            return Err(GuestAgentError::AgentError(err.desc));
        }
        decoded.ret.ok_or(GuestAgentError::InvalidResponse)
    }

    /// `guest-ping`; any failure (timeout, error reply, decode) is `false`.
    pub async fn ping(&mut self) -> bool {
        self.send_command("guest-ping", None, PING_TIMEOUT)
            .await
            .is_ok()
    }

    /// `guest-network-get-interfaces`.
    pub async fn network_interfaces(
        &mut self,
    ) -> Result<Vec<NetworkInterface>, GuestAgentError> {
        let ret = self
            .send_command("guest-network-get-interfaces", None, INTERFACES_TIMEOUT)
            .await?;
        serde_json::from_value(ret).map_err(|e| GuestAgentError::DecodingError(e.to_string()))
    }

    /// Accumulates bytes until the first `\n`, returning the line without
    /// its terminator.
    async fn read_line(&mut self) -> Result<Vec<u8>, GuestAgentError> {
        loop {
            if let Some(pos) = self.readbuf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.readbuf.drain(..=pos).collect();
                line.pop();
                return Ok(line);
            }
            let mut chunk = [0u8; 1024];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(GuestAgentError::InvalidResponse);
            }
            self.readbuf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Guest-agent connection over the engine's vsock endpoint.
#[derive(Debug)]
pub struct GuestAgent {
    /// Endpoint to connect to.
    endpoint: VsockEndpoint,
    /// Live channel once connected.
    client: Option<QgaClient<VsockStream>>,
}

impl GuestAgent {
    /// Creates a disconnected agent handle.
    pub fn new(endpoint: VsockEndpoint) -> Self {
        Self {
            endpoint,
            client: None,
        }
    }

    /// Connects if not already connected. Idempotent.
    pub async fn connect(&mut self) -> Result<(), GuestAgentError> {
        if self.client.is_some() {
            return Ok(());
        }
        let addr = VsockAddr::new(self.endpoint.cid, self.endpoint.port);
        let stream = VsockStream::connect(addr).await?;
        self.client = Some(QgaClient::new(stream));
        Ok(())
    }

    /// Drops the connection so the next call reconnects.
    pub fn disconnect(&mut self) {
        self.client = None;
    }

    /// `guest-ping` over the live connection.
    pub async fn ping(&mut self) -> Result<bool, GuestAgentError> {
        let client = self.client.as_mut().ok_or(GuestAgentError::NotConnected)?;
        Ok(client.ping().await)
    }

    /// `guest-network-get-interfaces` over the live connection.
    pub async fn network_interfaces(
        &mut self,
    ) -> Result<Vec<NetworkInterface>, GuestAgentError> {
        let client = self.client.as_mut().ok_or(GuestAgentError::NotConnected)?;
        client.network_interfaces().await
    }
}

/// Daemon-owned periodic network query loop.
///
/// Probes at 5/10/15/20 s after start until the first success, persists the
/// result, then re-polls every 60 s until `exit` is set. Every failure is
/// logged at debug and retried silently.
pub async fn run_network_query_loop(
    endpoint: VsockEndpoint,
    store: VmStore,
    name: String,
    exit: Arc<AtomicBool>,
) {
    let mut agent = GuestAgent::new(endpoint);

    let mut elapsed = 0u64;
    for offset in INITIAL_PROBE_OFFSETS {
        if sleep_until_exit(Duration::from_secs(offset - elapsed), &exit).await {
            return;
        }
        elapsed = offset;
        if query_once(&mut agent, &store, &name).await {
            break;
        }
    }

    loop {
        if sleep_until_exit(POLL_INTERVAL, &exit).await {
            return;
        }
        query_once(&mut agent, &store, &name).await;
    }
}

/// One connect + ping + interfaces + persist attempt.
async fn query_once(agent: &mut GuestAgent, store: &VmStore, name: &str) -> bool {
    if let Err(e) = agent.connect().await {
        debug!(error = %e, "guest agent connect failed");
        return false;
    }
    match agent.ping().await {
        Ok(true) => {}
        Ok(false) => {
            debug!("guest agent ping failed");
            // The connection may be wedged; start fresh next round.
            agent.disconnect();
            return false;
        }
        Err(e) => {
            debug!(error = %e, "guest agent ping errored");
            agent.disconnect();
            return false;
        }
    }
    match agent.network_interfaces().await {
        Ok(interfaces) => {
            let info = NetworkInfo {
                interfaces,
                queried_at: Utc::now(),
            };
            if let Err(e) = store.save_network_info(name, &info) {
                debug!(error = %e, "failed to persist network info");
                return false;
            }
            debug!(primary = ?info.primary_ipv4(), "guest network info updated");
            true
        }
        Err(e) => {
            debug!(error = %e, "guest network query failed");
            agent.disconnect();
            false
        }
    }
}

/// Sleeps `total`, waking early (returning `true`) once `exit` is set.
async fn sleep_until_exit(total: Duration, exit: &AtomicBool) -> bool {
    let tick = Duration::from_millis(500);
    let mut remaining = total;
    while !remaining.is_zero() {
        if exit.load(Ordering::SeqCst) {
            return true;
        }
        let step = remaining.min(tick);
        tokio::time::sleep(step).await;
        remaining -= step;
    }
    exit.load(Ordering::SeqCst)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    /// Serves scripted responses for each request line received.
    fn fake_agent(responses: Vec<&'static str>) -> QgaClient<DuplexStream> {
        let (host, guest) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut reader = BufReader::new(guest);
            for resp in responses {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return;
                }
                let inner = reader.get_mut();
                inner.write_all(resp.as_bytes()).await.unwrap();
                inner.write_all(b"\n").await.unwrap();
            }
        });
        QgaClient::new(host)
    }

    #[tokio::test]
    async fn ping_succeeds_on_empty_return() {
        let mut client = fake_agent(vec![r#"{"return": {}}"#]);
        assert!(client.ping().await);
    }

    #[tokio::test]
    async fn ping_is_false_on_agent_error() {
        let mut client = fake_agent(vec![r#"{"error":{"class":"X","desc":"boom"}}"#]);
        assert!(!client.ping().await);
    }

    #[tokio::test]
    async fn interfaces_decode_kebab_case_wire_format() {
        let mut client = fake_agent(vec![
            r#"{"return":[{"name":"lo","ip-addresses":[{"ip-address-type":"ipv4","ip-address":"127.0.0.1","prefix":8}]},{"name":"enp0s1","hardware-address":"02:11:22:33:44:55","ip-addresses":[{"ip-address-type":"ipv6","ip-address":"fe80::1","prefix":64},{"ip-address-type":"ipv4","ip-address":"192.168.64.5","prefix":24}]}]}"#,
        ]);
        let interfaces = client.network_interfaces().await.unwrap();
        assert_eq!(interfaces.len(), 2);
        assert_eq!(
            interfaces[1].hardware_address.as_deref(),
            Some("02:11:22:33:44:55")
        );

        let info = NetworkInfo {
            interfaces,
            queried_at: Utc::now(),
        };
        assert_eq!(info.primary_ipv4(), Some("192.168.64.5"));
    }

    #[tokio::test]
    async fn interfaces_surface_agent_error() {
        let mut client = fake_agent(vec![r#"{"error":{"class":"X","desc":"boom"}}"#]);
        match client.network_interfaces().await {
            Err(GuestAgentError::AgentError(desc)) => assert_eq!(desc, "boom"),
            other => panic!("expected AgentError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_response_is_decoding_error() {
        let mut client = fake_agent(vec!["not json"]);
        assert!(matches!(
            client.send_command("guest-ping", None, PING_TIMEOUT).await,
            Err(GuestAgentError::DecodingError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (host, _guest_held_open) = tokio::io::duplex(4096);
        let mut client = QgaClient::new(host);
        let result = client
            .send_command("guest-ping", None, Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(GuestAgentError::Timeout)));
    }

    #[tokio::test]
    async fn network_info_round_trips_with_kebab_keys() {
        let info = NetworkInfo {
            interfaces: vec![NetworkInterface {
                name: "enp0s1".into(),
                hardware_address: Some("02:aa:bb:cc:dd:ee".into()),
                ip_addresses: vec![IpAddress {
                    ip_address_type: "ipv4".into(),
                    ip_address: "192.168.64.9".into(),
                    prefix: Some(24),
                }],
            }],
            queried_at: Utc::now(),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"hardware-address\""));
        assert!(json.contains("\"ip-addresses\""));
        assert!(json.contains("\"ip-address-type\""));
        let back: NetworkInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }

    #[tokio::test]
    async fn primary_ipv4_skips_loopback() {
        let info = NetworkInfo {
            interfaces: vec![
                NetworkInterface {
                    name: "lo".into(),
                    hardware_address: None,
                    ip_addresses: vec![IpAddress {
                        ip_address_type: "ipv4".into(),
                        ip_address: "127.0.0.1".into(),
                        prefix: Some(8),
                    }],
                },
                NetworkInterface {
                    name: "eth0".into(),
                    hardware_address: None,
                    ip_addresses: vec![],
                },
            ],
            queried_at: Utc::now(),
        };
        assert_eq!(info.primary_ipv4(), None);
    }
}
