use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("trigger request failed")]
    RequestError(#[from] reqwest::Error),
}

/// Fire and forget side channel. `notify` must return immediately.
pub trait TriggerNotifier: Send + Sync {
    fn notify(&self);
}

pub struct HttpTriggerNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTriggerNotifier {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpTriggerNotifier {
            client,
            endpoint: endpoint.to_owned(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn send(&self) -> Result<(), NotificationError> {
        post_trigger(&self.client, &self.endpoint).await
    }
}

async fn post_trigger(client: &reqwest::Client, endpoint: &str) -> Result<(), NotificationError> {
    client.post(endpoint).send().await?.error_for_status()?;
    Ok(())
}

impl TriggerNotifier for HttpTriggerNotifier {
    fn notify(&self) {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            match post_trigger(&client, &endpoint).await {
                Ok(()) => debug!("Trigger sent to {}", endpoint),
                Err(error) => warn!("Trigger to {} failed: {:?}", endpoint, error),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_posts_to_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock_trigger_api = server
            .mock("POST", "/trigger")
            .with_status(200)
            .create_async()
            .await;
        let notifier = HttpTriggerNotifier::new(
            &format!("{}/trigger", server.url()),
            Duration::from_secs(1),
        )
        .unwrap();

        notifier.send().await.unwrap();

        mock_trigger_api.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/trigger")
            .with_status(500)
            .create_async()
            .await;
        let notifier = HttpTriggerNotifier::new(
            &format!("{}/trigger", server.url()),
            Duration::from_secs(1),
        )
        .unwrap();

        assert!(notifier.send().await.is_err());
    }

    #[tokio::test]
    async fn notify_does_not_wait_for_response() {
        let mut server = mockito::Server::new_async().await;
        let mock_trigger_api = server
            .mock("POST", "/trigger")
            .with_status(200)
            .create_async()
            .await;
        let notifier = HttpTriggerNotifier::new(
            &format!("{}/trigger", server.url()),
            Duration::from_secs(1),
        )
        .unwrap();

        notifier.notify();

        for _ in 0..200 {
            if mock_trigger_api.matched_async().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        mock_trigger_api.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_swallowed() {
        let notifier =
            HttpTriggerNotifier::new("http://127.0.0.1:9/trigger", Duration::from_millis(100))
                .unwrap();
        assert!(notifier.send().await.is_err());
        notifier.notify();
    }
}
