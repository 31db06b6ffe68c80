use super::{BusError, ConnectionState};
use crate::dispatch::PoolStats;
use crate::envelope::Protocol;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Core bus connection trait. Implement for any message transport.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Human-readable connection name, unique within the process.
    fn name(&self) -> &str;

    fn protocol(&self) -> Protocol;

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Occupancy of this connection's worker pool.
    fn pool_stats(&self) -> PoolStats;

    /// Connect, consume and reconnect until `shutdown` fires (long-running).
    ///
    /// On shutdown the connection stops consuming, drains its worker pool and
    /// closes the transport before returning `Ok(())`. Returns
    /// [`BusError::Authentication`] when the broker refuses the credentials
    /// on the very first connect.
    async fn run(&self, shutdown: CancellationToken) -> Result<(), BusError>;
}
