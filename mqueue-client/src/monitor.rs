//! Monitor client for queue inspection and failed-message cleanup

use crate::config::ClientConfig;
use crate::connection::Session;
use crate::error::MqClientError;
use crate::Result;
use mqueue::protocol::MAX_IDS_PER_PACKET;
use mqueue::{Packet, QueueCounts, Role};

/// Client for queue management
pub struct MonitorClient {
    session: Session,
}

impl MonitorClient {
    /// Create a new monitor client
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let session = Session::connect(config, Role::Monitor).await?;
        Ok(Self { session })
    }

    /// Current occupancy of the queue
    pub async fn counts(&mut self) -> Result<QueueCounts> {
        match self.session.request(Packet::Count).await? {
            Packet::Counts(counts) => Ok(counts),
            other => Err(self.unexpected("Counts", other).await),
        }
    }

    /// Ids of failed messages, oldest first. The flag is set when more
    /// failed messages exist than were returned.
    pub async fn failed(&mut self, limit: u32) -> Result<(Vec<String>, bool)> {
        match self.session.request(Packet::ListFailed { limit }).await? {
            Packet::Failed { ids, truncated } => Ok((ids, truncated)),
            other => Err(self.unexpected("Failed", other).await),
        }
    }

    /// Drop failed messages. Returns the ids that were actually erased;
    /// ids that are unknown or not failed are skipped.
    pub async fn erase_failed(&mut self, ids: &[String]) -> Result<Vec<String>> {
        let mut erased = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_IDS_PER_PACKET) {
            let packet = Packet::EraseFailed {
                ids: chunk.to_vec(),
            };
            match self.session.request(packet).await? {
                Packet::Erased { ids } => erased.extend(ids),
                other => return Err(self.unexpected("Erased", other).await),
            }
        }
        Ok(erased)
    }

    /// Erase every failed message, page by page
    pub async fn purge_failed(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            let (ids, truncated) = self.failed(MAX_IDS_PER_PACKET as u32).await?;
            if ids.is_empty() {
                return Ok(total);
            }
            let erased = self.erase_failed(&ids).await?.len();
            total += erased;
            if !truncated || erased == 0 {
                return Ok(total);
            }
        }
    }

    /// Close the monitor client
    pub async fn close(&mut self) {
        self.session.reset().await;
    }

    async fn unexpected(&mut self, expected: &str, got: Packet) -> MqClientError {
        self.session.reset().await;
        MqClientError::protocol(format!("expected {}, got {}", expected, got.kind()))
    }
}
