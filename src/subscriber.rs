use crate::darwin_subscriber::SubscriberError;

use async_trait::async_trait;
use tokio::time::Duration;

/// The seam between the ingestion pipeline and a concrete feed
/// connection. The pipeline drives whatever implements this.
#[async_trait]
pub trait Subscriber: Send {
    async fn subscribe(&mut self) -> Result<(), SubscriberError>;
    async fn receive(&mut self) -> Result<Vec<u8>, SubscriberError>;
    fn mark_reconnecting(&self);
    async fn shutdown(&mut self, grace: Duration);
}
