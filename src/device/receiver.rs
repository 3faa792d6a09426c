use crate::error::HubResult;
use crate::hub::DeviceEndpoint;
use std::time::Duration;
use tracing::{debug, info};

/// Waits for a single cloud-to-device command.
pub struct CommandReceiver<E> {
    endpoint: E,
    poll_interval: Duration,
}

impl<E: DeviceEndpoint> CommandReceiver<E> {
    pub fn new(endpoint: E, poll_interval: Duration) -> Self {
        Self {
            endpoint,
            poll_interval,
        }
    }

    /// Polls until a message arrives, acknowledges it and returns its decoded payload.
    ///
    /// There is no cancellation input: the caller drops the future to give up.
    /// Endpoint errors are returned as-is.
    pub async fn receive_one(&self) -> HubResult<String> {
        let mut empty_polls = 0u64;

        loop {
            match self.endpoint.receive_one().await? {
                Some(message) => {
                    let data = message.decode();
                    self.endpoint.acknowledge(&message).await?;
                    info!("Received cloud-to-device message: {}", data);
                    return Ok(data);
                }
                None => {
                    empty_polls += 1;
                    debug!(empty_polls, "No cloud-to-device message pending");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}
