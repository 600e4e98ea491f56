use async_trait::async_trait;
use futures::future::join_all;
use log::info;
use reqwest::Client;

use crate::error::{Error, FanOutError, FanOutFailure, Result};
use crate::models::Video;
use crate::retry::RetryPolicy;

/// Push multicast requests carry at most this many tokens each.
const PUSH_CHUNK: usize = 500;

/// An opaque downstream delivery target.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self) -> Result<()>;
}

/// POSTs a fixed payload (or an empty body) to one URL.
pub struct WebhookSink {
    name: String,
    url: String,
    body: Option<serde_json::Value>,
    http: Client,
}

impl WebhookSink {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        body: Option<serde_json::Value>,
        http: Client,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            body,
            http,
        }
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self) -> Result<()> {
        let req = self.http.post(&self.url);
        let req = match &self.body {
            Some(body) => req.json(body),
            None => req,
        };
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(Error::Upstream { status, message });
        }
        Ok(())
    }
}

/// Deliver to every sink concurrently, each with its own bounded retry.
/// One target's failure never cancels another's attempts; every failure
/// is collected into a single composite error naming each target.
pub async fn deliver_all(sinks: &[Box<dyn Sink>], retry: RetryPolicy) -> Result<(), FanOutError> {
    let results = join_all(sinks.iter().map(|sink| async move {
        retry
            .run(sink.name(), || sink.deliver())
            .await
            .err()
            .map(|e| FanOutFailure {
                target: sink.name().to_string(),
                message: e.to_string(),
            })
    }))
    .await;

    let failures: Vec<FanOutFailure> = results.into_iter().flatten().collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(FanOutError { failures })
    }
}

/// Push-notification multicast client. Token chunks are sent one request
/// at a time; each chunk gets its own retry.
#[derive(Clone)]
pub struct PushClient {
    http: Client,
    endpoint: String,
    auth_token: String,
}

impl PushClient {
    pub fn new(endpoint: String, auth_token: String, http: Client) -> Self {
        Self {
            http,
            endpoint,
            auth_token,
        }
    }

    pub async fn notify(
        &self,
        title: &str,
        video: &Video,
        tokens: &[String],
        retry: RetryPolicy,
    ) -> Result<()> {
        if tokens.is_empty() {
            info!("no push subscribers, skipping multicast");
            return Ok(());
        }

        for chunk in tokens.chunks(PUSH_CHUNK) {
            let payload = serde_json::json!({
                "notification": {
                    "title": title,
                    "body": video.title,
                    "image": video.thumbnail_url,
                },
                "webpush": {
                    "headers": { "Urgency": "high" },
                    "fcm_options": { "link": format!("https://youtu.be/{}", video.id) },
                },
                "tokens": chunk,
            });
            retry
                .run("push multicast", || self.send_once(&payload))
                .await?;
        }
        Ok(())
    }

    async fn send_once(&self, payload: &serde_json::Value) -> Result<()> {
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.auth_token)
            .json(payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(Error::Upstream { status, message });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct MockSink {
        name: String,
        fail_times: AtomicU32,
        calls: Arc<AtomicU32>,
    }

    impl MockSink {
        fn new(name: &str, fail_times: u32) -> Box<Self> {
            Self::with_counter(name, fail_times).0
        }

        fn with_counter(name: &str, fail_times: u32) -> (Box<Self>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let sink = Box::new(Self {
                name: name.to_string(),
                fail_times: AtomicU32::new(fail_times),
                calls: calls.clone(),
            });
            (sink, calls)
        }
    }

    #[async_trait]
    impl Sink for MockSink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn deliver(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Upstream {
                    status: 500,
                    message: "boom".to_string(),
                });
            }
            Ok(())
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(0))
    }

    #[tokio::test]
    async fn all_targets_succeeding_is_ok() {
        let sinks: Vec<Box<dyn Sink>> = vec![MockSink::new("a", 0), MockSink::new("b", 0)];
        assert!(deliver_all(&sinks, retry()).await.is_ok());
    }

    #[tokio::test]
    async fn one_failing_target_does_not_block_the_other() {
        let failing = MockSink::new("failing-target", 99);
        let (healthy, healthy_calls) = MockSink::with_counter("healthy-target", 0);

        let sinks: Vec<Box<dyn Sink>> = vec![failing, healthy];
        let err = deliver_all(&sinks, retry()).await.unwrap_err();

        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].target, "failing-target");
        // The healthy sink was still invoked.
        assert_eq!(healthy_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_per_target() {
        let flaky = MockSink::new("flaky", 2);
        let sinks: Vec<Box<dyn Sink>> = vec![flaky];
        assert!(deliver_all(&sinks, retry()).await.is_ok());
    }

    #[tokio::test]
    async fn every_failed_target_is_reported() {
        let sinks: Vec<Box<dyn Sink>> = vec![
            MockSink::new("one", 99),
            MockSink::new("two", 99),
            MockSink::new("three", 0),
        ];
        let err = deliver_all(&sinks, retry()).await.unwrap_err();
        let targets: Vec<&str> = err.failures.iter().map(|f| f.target.as_str()).collect();
        assert_eq!(targets, vec!["one", "two"]);
    }
}
