//! Connection traffic counters.

/// Snapshot of connection statistics.
///
/// Counters are cumulative for the lifetime of the connection and survive
/// reconnects; `reconnects` itself lets callers detect that a disconnect
/// happened between two observations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Messages delivered to this connection's subscriptions.
    pub in_msgs: u64,
    /// Payload bytes delivered to this connection's subscriptions.
    pub in_bytes: u64,
    /// Messages published by this connection.
    pub out_msgs: u64,
    /// Payload bytes published by this connection.
    pub out_bytes: u64,
    /// Completed reconnects.
    pub reconnects: u64,
}
