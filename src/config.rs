use std::time::Duration;

/// Node configuration.
///
/// Identity persistence is left to the embedding application: pass a stored
/// `secret_key` to keep the same address across restarts.
#[derive(Debug, Clone)]
pub struct Config {
    /// Rendezvous servers tried in order by [`Teonet::connect`](crate::Teonet::connect)
    /// when no hints are given.
    pub auth_servers: Vec<String>,

    /// Act as a rendezvous server: answer handshakes and relay peer connect
    /// requests.
    pub rendezvous_server: bool,

    /// Ed25519 secret key. A fresh one is generated when absent.
    pub secret_key: Option<[u8; 32]>,

    /// Bounds a rendezvous handshake and a whole peer connect. Also the
    /// lifetime of pending connect requests.
    pub connect_timeout: Duration,

    /// Default window of [`Teonet::wait_from`](crate::Teonet::wait_from).
    pub wait_timeout: Duration,

    /// Pause between reconnect attempts.
    pub reconnect_backoff: Duration,

    /// Initial delay before the target peer starts punching, so the relayed
    /// answer reaches the client first.
    pub punch_delay: Duration,

    /// How many times the client sends the direct new-connection packet.
    pub new_connection_retries: u32,

    /// Interval between new-connection packets.
    pub new_connection_interval: Duration,

    /// Offer host interface addresses as local punch candidates.
    pub discover_local_ips: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth_servers: vec![],
            rendezvous_server: false,
            secret_key: None,
            connect_timeout: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(1),
            punch_delay: Duration::from_millis(50),
            new_connection_retries: 3,
            new_connection_interval: Duration::from_millis(300),
            discover_local_ips: true,
        }
    }
}
