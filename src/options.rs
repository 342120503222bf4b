//! Connection options.
//!
//! An [`Options`] value is snapshotted (cloned) by
//! [`crate::Connection::connect`]; mutating the original afterwards never
//! affects a live connection. All fields are public: construct with struct
//! update syntax over [`Options::default`] and the defaults below.
//!
//! Priority for credentials when several are set: NKey/JWT signature >
//! token > user/pass, mirroring what servers expect from existing clients.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::auth;
use crate::errors::{Error, Result};
use crate::message::Message;

// Defaults shared with the reconnect and ping machinery.
pub(crate) const DEFAULT_MAX_RECONNECT: i64 = 60;
pub(crate) const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);
pub(crate) const DEFAULT_MAX_PINGS_OUT: u32 = 2;
pub(crate) const DEFAULT_IO_BUF_SIZE: usize = 32 * 1024;
pub(crate) const DEFAULT_RECONNECT_BUF_SIZE: usize = 8 * 1024 * 1024;
pub(crate) const DEFAULT_PENDING_MSGS: usize = 65_536;
pub(crate) const DEFAULT_PENDING_BYTES: usize = 64 * 1024 * 1024;

/// Address family preference when a hostname resolves to both A and AAAA
/// records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpFamily {
    /// Use resolver order.
    #[default]
    Any,
    /// IPv4 only.
    V4,
    /// IPv6 only.
    V6,
    /// Try every IPv4 address, then IPv6.
    V4ThenV6,
    /// Try every IPv6 address, then IPv4.
    V6ThenV4,
}

/// Message delivery callback. `None` signals a subscription timeout: no
/// message arrived within the subscription's configured interval.
pub type MessageHandler = Arc<dyn Fn(Option<Message>) + Send + Sync>;

/// Connection lifecycle callback (closed / disconnected / reconnected /
/// discovered / connected-after-retry).
pub type ConnectionCallback = Arc<dyn Fn(&crate::Connection) + Send + Sync>;

/// Asynchronous error callback. The first argument is the subject of the
/// subscription the error belongs to, when there is one.
pub type ErrorCallback = Arc<dyn Fn(Option<String>, Error) + Send + Sync>;

/// Supplies the current authentication token before each (re)connect.
pub type TokenProvider = Arc<dyn Fn() -> String + Send + Sync>;

/// Supplies the user JWT before each (re)connect.
pub type JwtProvider = Arc<dyn Fn() -> Result<String> + Send + Sync>;

/// Signs the server nonce. The returned bytes are transmitted as
/// base64-raw-URL in the CONNECT `sig` field.
pub type NonceSigner = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// Everything configurable about a connection.
#[derive(Clone)]
pub struct Options {
    /// Candidate server URLs; comma-separated lists are accepted inside each
    /// entry. Empty means `nats://localhost:4222`.
    pub urls: Vec<String>,
    /// Keep the URL list in the given order instead of shuffling the tail.
    pub no_randomize: bool,
    /// Client name reported in CONNECT.
    pub name: Option<String>,
    /// Ask the server to acknowledge every command with `+OK`.
    pub verbose: bool,
    /// Ask the server to strictly check subjects.
    pub pedantic: bool,
    /// Do not deliver our own publishes back to our subscriptions.
    pub no_echo: bool,

    /// Attempt to reconnect after a lost connection.
    pub allow_reconnect: bool,
    /// Reconnect attempts per endpoint; −1 means unlimited.
    pub max_reconnect: i64,
    /// Minimum delay between attempts on the same endpoint.
    pub reconnect_wait: Duration,
    /// Cap, in bytes, of publishes buffered while reconnecting.
    pub reconnect_buf_size: usize,
    /// Keep retrying (and return from `connect` immediately with
    /// `NotYetConnected`) when the initial connect fails everywhere.
    pub retry_on_failed_connect: bool,

    /// TCP connect + handshake deadline per endpoint.
    pub connect_timeout: Duration,
    /// Interval between client PINGs; zero disables them.
    pub ping_interval: Duration,
    /// PINGs allowed to go unanswered before the connection is stale.
    pub max_pings_out: u32,
    /// Socket read buffer size.
    pub io_buf_size: usize,
    /// Deadline for a single socket write by the flusher; `None` blocks.
    pub write_deadline: Option<Duration>,
    /// Flush after every publish instead of coalescing.
    pub send_asap: bool,
    /// Address family preference for multi-homed hosts.
    pub ip_family: IpFamily,

    /// Default per-subscription pending message limit.
    pub sub_pending_msgs_limit: usize,
    /// Default per-subscription pending byte limit.
    pub sub_pending_bytes_limit: usize,
    /// Deliver through the process-wide worker pool instead of one task per
    /// subscription.
    pub use_shared_delivery_pool: bool,
    /// Issue requests as one-shot subscriptions instead of through the shared
    /// reply inbox, for brokers predating the request multiplexer.
    pub use_old_request_style: bool,

    /// Demand TLS even when the server does not advertise it.
    pub tls_required: bool,
    /// Caller-built TLS configuration; required when TLS is negotiated.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// Hostname to verify the server certificate against, when it differs
    /// from the endpoint host.
    pub tls_hostname: Option<String>,

    /// Static credentials.
    pub user: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    /// Called before each (re)connect to obtain a fresh token.
    pub token_provider: Option<TokenProvider>,
    /// Public NKey sent in CONNECT; requires `signer`.
    pub nkey: Option<String>,
    /// Signs the server nonce for NKey or JWT authentication.
    pub signer: Option<NonceSigner>,
    /// Supplies the user JWT for JWT authentication; requires `signer`.
    pub jwt_provider: Option<JwtProvider>,

    /// Invoked once when the connection is permanently closed.
    pub closed_callback: Option<ConnectionCallback>,
    /// Invoked when the connection to the current server is lost.
    pub disconnected_callback: Option<ConnectionCallback>,
    /// Invoked after a successful reconnect.
    pub reconnected_callback: Option<ConnectionCallback>,
    /// Invoked when an async INFO grows the server pool.
    pub discovered_callback: Option<ConnectionCallback>,
    /// Invoked when a `retry_on_failed_connect` connect finally succeeds.
    pub connected_callback: Option<ConnectionCallback>,
    /// Invoked for asynchronous errors (slow consumers, protocol errors seen
    /// outside a caller's stack).
    pub error_callback: Option<ErrorCallback>,

    /// Runtime to spawn the connection's tasks on. `None` uses the ambient
    /// runtime of the caller.
    pub runtime: Option<tokio::runtime::Handle>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            no_randomize: false,
            name: None,
            verbose: false,
            pedantic: false,
            no_echo: false,
            allow_reconnect: true,
            max_reconnect: DEFAULT_MAX_RECONNECT,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            reconnect_buf_size: DEFAULT_RECONNECT_BUF_SIZE,
            retry_on_failed_connect: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_pings_out: DEFAULT_MAX_PINGS_OUT,
            io_buf_size: DEFAULT_IO_BUF_SIZE,
            write_deadline: None,
            send_asap: false,
            ip_family: IpFamily::Any,
            sub_pending_msgs_limit: DEFAULT_PENDING_MSGS,
            sub_pending_bytes_limit: DEFAULT_PENDING_BYTES,
            use_shared_delivery_pool: false,
            use_old_request_style: false,
            tls_required: false,
            tls_config: None,
            tls_hostname: None,
            user: None,
            password: None,
            token: None,
            token_provider: None,
            nkey: None,
            signer: None,
            jwt_provider: None,
            closed_callback: None,
            disconnected_callback: None,
            reconnected_callback: None,
            discovered_callback: None,
            connected_callback: None,
            error_callback: None,
            runtime: None,
        }
    }
}

impl Options {
    /// Options targeting a single URL (or comma-separated list).
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Self::default()
        }
    }

    /// Loads a credentials file and wires up JWT + nonce-signing
    /// authentication from it.
    ///
    /// The file is re-read before every (re)connect so rotated credentials
    /// are picked up without restarting.
    pub fn user_credentials_from_file(mut self, path: impl AsRef<Path>) -> Self {
        let jwt_path = path.as_ref().to_path_buf();
        let seed_path = jwt_path.clone();
        self.jwt_provider = Some(Arc::new(move || auth::jwt_from_file(&jwt_path)));
        self.signer = Some(Arc::new(move |nonce| {
            auth::sign_nonce_with_seed_file(&seed_path, nonce)
        }));
        self
    }

    /// Checks invariants that cannot be expressed in the type system.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.reconnect_buf_size == 0 {
            return Err(Error::InvalidArg("reconnect_buf_size must be non-zero"));
        }
        if self.nkey.is_some() && self.signer.is_none() {
            return Err(Error::InvalidArg("nkey authentication requires a signer"));
        }
        if self.jwt_provider.is_some() && self.signer.is_none() {
            return Err(Error::InvalidArg("jwt authentication requires a signer"));
        }
        Ok(())
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("urls", &self.urls)
            .field("name", &self.name)
            .field("no_randomize", &self.no_randomize)
            .field("verbose", &self.verbose)
            .field("pedantic", &self.pedantic)
            .field("no_echo", &self.no_echo)
            .field("allow_reconnect", &self.allow_reconnect)
            .field("max_reconnect", &self.max_reconnect)
            .field("reconnect_wait", &self.reconnect_wait)
            .field("reconnect_buf_size", &self.reconnect_buf_size)
            .field("retry_on_failed_connect", &self.retry_on_failed_connect)
            .field("connect_timeout", &self.connect_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("max_pings_out", &self.max_pings_out)
            .field("write_deadline", &self.write_deadline)
            .field("send_asap", &self.send_asap)
            .field("ip_family", &self.ip_family)
            .field("tls_required", &self.tls_required)
            .field("has_tls_config", &self.tls_config.is_some())
            .field("has_user", &self.user.is_some())
            .field("has_token", &(self.token.is_some() || self.token_provider.is_some()))
            .field("has_nkey", &self.nkey.is_some())
            .field("has_jwt", &self.jwt_provider.is_some())
            .finish_non_exhaustive()
    }
}
