use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use log::{info, warn};
use reqwest::{Client, StatusCode};

use crate::config::TaskConfig;
use crate::error::{Error, Result};
use crate::models::{EnsureOutcome, Topic, Video};
use crate::retry::RetryPolicy;

/// Song notifications fire this long before the broadcast starts.
const SONG_LEAD_MINUTES: i64 = 5;

/// Topic notifications fire this long before the broadcast starts.
const TOPIC_LEAD_MINUTES: i64 = 60;

/// The queue refuses schedule times further out than this.
const MAX_SCHEDULE_DAYS: i64 = 30;

/// One time-delayed task-creation request. `task_id` is derived solely
/// from domain keys, so re-issuing the same request collapses on the
/// queue side.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub queue_id: String,
    pub task_id: String,
    pub url: String,
    pub body: serde_json::Value,
    pub schedule_time: DateTime<Utc>,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Create the task, reporting a pre-existing task with the same
    /// identity as `AlreadyExists` rather than an error.
    async fn create(&self, request: &TaskRequest) -> Result<EnsureOutcome>;
}

/// REST client for the external durable task queue.
#[derive(Clone)]
pub struct CloudTasksClient {
    http: Client,
    config: TaskConfig,
}

impl CloudTasksClient {
    pub fn new(config: TaskConfig, http: Client) -> Self {
        Self { http, config }
    }

    fn queue_path(&self, queue_id: &str) -> String {
        format!(
            "projects/{}/locations/{}/queues/{}",
            self.config.project_id, self.config.location_id, queue_id
        )
    }
}

#[async_trait]
impl TaskQueue for CloudTasksClient {
    async fn create(&self, request: &TaskRequest) -> Result<EnsureOutcome> {
        let queue_path = self.queue_path(&request.queue_id);
        let payload = serde_json::json!({
            "task": {
                "name": format!("{queue_path}/tasks/{}", request.task_id),
                "scheduleTime": request
                    .schedule_time
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
                "httpRequest": {
                    "httpMethod": "POST",
                    "url": request.url,
                    "headers": { "Content-Type": "application/json" },
                    "body": BASE64.encode(request.body.to_string()),
                },
            }
        });

        let url = format!("{}/v2/{queue_path}/tasks", self.config.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.config.auth_token)
            .json(&payload)
            .send()
            .await?;

        if resp.status() == StatusCode::CONFLICT {
            warn!("task {} already exists", request.task_id);
            return Ok(EnsureOutcome::AlreadyExists);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(Error::Queue { status, message });
        }

        Ok(EnsureOutcome::Created)
    }
}

/// Converts classified videos into idempotent, time-delayed
/// task-creation requests.
pub struct NotificationScheduler<'a, Q: TaskQueue> {
    queue: &'a Q,
    config: &'a TaskConfig,
    retry: RetryPolicy,
}

impl<'a, Q: TaskQueue> NotificationScheduler<'a, Q> {
    pub fn new(queue: &'a Q, config: &'a TaskConfig, retry: RetryPolicy) -> Self {
        Self {
            queue,
            config,
            retry,
        }
    }

    /// Schedule the song notification for `video`. Returns `None` when
    /// the fire time exceeds the queue's horizon (a platform ceiling,
    /// not an error).
    pub async fn schedule_song(&self, video: &Video) -> Result<Option<EnsureOutcome>> {
        let lead = Duration::minutes(SONG_LEAD_MINUTES);
        let Some(schedule_time) = fire_time(video.scheduled_start_time, lead, Utc::now()) else {
            warn!(
                "song task for {} fires beyond the queue's {MAX_SCHEDULE_DAYS}-day horizon, skipping",
                video.id
            );
            return Ok(None);
        };

        let request = TaskRequest {
            queue_id: self.config.song_queue_id.clone(),
            task_id: format!("song-{}", video.id),
            url: self.config.song_callback_url.clone(),
            body: serde_json::json!({ "id": video.id }),
            schedule_time,
        };
        self.create(video, request).await.map(Some)
    }

    /// Schedule the notification for one matched topic. Each matched
    /// topic gets its own independent request.
    pub async fn schedule_topic(
        &self,
        video: &Video,
        topic: &Topic,
    ) -> Result<Option<EnsureOutcome>> {
        let lead = Duration::minutes(TOPIC_LEAD_MINUTES);
        let Some(schedule_time) = fire_time(video.scheduled_start_time, lead, Utc::now()) else {
            warn!(
                "topic task for {} fires beyond the queue's {MAX_SCHEDULE_DAYS}-day horizon, skipping",
                video.id
            );
            return Ok(None);
        };

        let request = TaskRequest {
            queue_id: self.config.topic_queue_id.clone(),
            task_id: format!("topic-{}-{}", video.id, topic.mention_id),
            url: self.config.topic_callback_url.clone(),
            body: serde_json::json!({ "id": video.id, "name": topic.name }),
            schedule_time,
        };
        self.create(video, request).await.map(Some)
    }

    async fn create(&self, video: &Video, request: TaskRequest) -> Result<EnsureOutcome> {
        info!(
            "scheduling task {} for video {} ({}) at {}",
            request.task_id, video.id, video.title, request.schedule_time
        );
        self.retry
            .run("task create", || self.queue.create(&request))
            .await
    }
}

/// Fire time for a broadcast starting at `start`, `lead` ahead of it.
/// Past or imminent fire times clamp to now; `None` means the time is
/// beyond the queue's acceptance horizon. A missing start time means
/// fire immediately.
fn fire_time(
    start: Option<DateTime<Utc>>,
    lead: Duration,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let Some(start) = start else {
        return Some(now);
    };
    let fire = start - lead;
    if fire - now > Duration::days(MAX_SCHEDULE_DAYS) {
        return None;
    }
    if fire - now > lead {
        Some(fire)
    } else {
        Some(now)
    }
}
