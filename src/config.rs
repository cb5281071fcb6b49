use std::time::Duration;

/// Runtime settings for the gateway.
///
/// `main.rs` fills these from command-line flags / environment variables; the
/// defaults match the timings the tag firmware was tuned against.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Backend WebSocket endpoint, e.g. `ws://192.168.0.101:8000/ws/sit/1`.
    pub backend_uri: String,
    /// Id sent in every `RegisterWsClient` envelope.
    pub client_id: String,
    /// How long each `ConnectDevice` scan runs.  Default: 20 s.
    pub scan_timeout: Duration,
    /// Wait between `connect()` and the post-connect link check.  Default: 5 s.
    pub connect_settle: Duration,
    /// Wait between pushing setup frames and starting a session.  Default: 3 s.
    pub session_settle: Duration,
    /// Link poll period of the per-device keepalive task.  Default: 5 s.
    pub keepalive_interval: Duration,
    /// Pause before re-dialling the backend after the socket closes.  Default: 2 s.
    pub reconnect_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backend_uri: "ws://127.0.0.1:8000/ws/sit/1".into(),
            client_id: "PI_Home".into(),
            scan_timeout: Duration::from_secs(20),
            connect_settle: Duration::from_secs(5),
            session_settle: Duration::from_secs(3),
            keepalive_interval: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(2),
        }
    }
}
