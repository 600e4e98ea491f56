use std::env;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::Duration;
use env_logger::Builder;
use log::{error, info, LevelFilter};
use tokio_cron_scheduler::{Job, JobScheduler};
use url::Url;

use crate::error::Error;
use crate::retry::RetryPolicy;
use crate::services::pipeline::Pipeline;
use crate::services::scheduler::CloudTasksClient;
use crate::services::store::Store;
use crate::services::youtube::YoutubeClient;
use crate::AppState;

/// Everything the components need, read from the environment exactly
/// once at startup. No component reads an environment variable itself.
#[derive(Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub youtube: YoutubeConfig,
    pub tasks: TaskConfig,
    pub fanout: FanoutConfig,
    pub check_schedule: String,
    pub settle_delay: StdDuration,
    pub freshness_window_minutes: i64,
    pub retry: RetryPolicy,
}

#[derive(Clone)]
pub struct YoutubeConfig {
    pub api_key: String,
    pub api_base: String,
    pub feed_base: String,
    pub playlist_fetch_count: u32,
}

#[derive(Clone)]
pub struct TaskConfig {
    pub base_url: String,
    pub project_id: String,
    pub location_id: String,
    pub auth_token: String,
    pub song_queue_id: String,
    pub topic_queue_id: String,
    pub song_callback_url: String,
    pub topic_callback_url: String,
}

#[derive(Clone)]
pub struct FanoutConfig {
    pub consumer_urls: Vec<String>,
    pub review_webhook_url: Option<String>,
    pub song_webhook_url: Option<String>,
    pub push_endpoint: Option<String>,
    pub push_auth_token: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, Error> {
        let retry = RetryPolicy::new(
            parsed_or("RETRY_ATTEMPTS", 3)?,
            StdDuration::from_secs(parsed_or("RETRY_DELAY_SECS", 1)?),
        );

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            youtube: YoutubeConfig {
                api_key: required("YOUTUBE_API_KEY")?,
                api_base: url_or(
                    "YOUTUBE_API_BASE",
                    "https://www.googleapis.com/youtube/v3",
                )?,
                feed_base: url_or(
                    "FEED_BASE_URL",
                    "https://www.youtube.com/feeds/videos.xml",
                )?,
                playlist_fetch_count: parsed_or("PLAYLIST_FETCH_COUNT", 10)?,
            },
            tasks: TaskConfig {
                base_url: url_or("TASKS_BASE_URL", "https://cloudtasks.googleapis.com")?,
                project_id: required("TASKS_PROJECT_ID")?,
                location_id: required("TASKS_LOCATION_ID")?,
                auth_token: required("TASKS_AUTH_TOKEN")?,
                song_queue_id: required("SONG_QUEUE_ID")?,
                topic_queue_id: required("TOPIC_QUEUE_ID")?,
                song_callback_url: required_url("SONG_TASK_URL")?,
                topic_callback_url: required_url("TOPIC_TASK_URL")?,
            },
            fanout: FanoutConfig {
                consumer_urls: url_list("NEW_VIDEO_CONSUMER_URLS")?,
                review_webhook_url: optional_url("REVIEW_WEBHOOK_URL")?,
                song_webhook_url: optional_url("SONG_WEBHOOK_URL")?,
                push_endpoint: optional_url("PUSH_ENDPOINT")?,
                push_auth_token: env::var("PUSH_AUTH_TOKEN").unwrap_or_default(),
            },
            check_schedule: env::var("CHECK_SCHEDULE")
                .unwrap_or_else(|_| "0 */10 * * * *".to_string()),
            settle_delay: StdDuration::from_secs(parsed_or("SETTLE_DELAY_SECS", 10)?),
            freshness_window_minutes: parsed_or("FRESHNESS_WINDOW_MINUTES", 30)?,
            retry,
        })
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::minutes(self.freshness_window_minutes)
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            youtube: YoutubeConfig {
                api_key: "test-key".to_string(),
                api_base: "http://localhost:0".to_string(),
                feed_base: "http://localhost:0".to_string(),
                playlist_fetch_count: 10,
            },
            tasks: TaskConfig {
                base_url: "http://localhost:0".to_string(),
                project_id: "proj".to_string(),
                location_id: "loc".to_string(),
                auth_token: "token".to_string(),
                song_queue_id: "song-queue".to_string(),
                topic_queue_id: "topic-queue".to_string(),
                song_callback_url: "http://localhost:0/notices/song".to_string(),
                topic_callback_url: "http://localhost:0/notices/topic".to_string(),
            },
            fanout: FanoutConfig {
                consumer_urls: Vec::new(),
                review_webhook_url: None,
                song_webhook_url: None,
                push_endpoint: None,
                push_auth_token: String::new(),
            },
            check_schedule: "0 */10 * * * *".to_string(),
            settle_delay: StdDuration::from_secs(0),
            freshness_window_minutes: 30,
            retry: RetryPolicy::new(3, StdDuration::from_millis(0)),
        }
    }
}

fn required(name: &str) -> Result<String, Error> {
    env::var(name).map_err(|_| Error::Config(format!("{name} environment variable must be set")))
}

fn required_url(name: &str) -> Result<String, Error> {
    let value = required(name)?;
    validate_url(name, &value)?;
    Ok(value)
}

fn optional_url(name: &str) -> Result<Option<String>, Error> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => {
            validate_url(name, &value)?;
            Ok(Some(value))
        }
        _ => Ok(None),
    }
}

fn url_or(name: &str, default: &str) -> Result<String, Error> {
    let value = env::var(name).unwrap_or_else(|_| default.to_string());
    validate_url(name, &value)?;
    Ok(value)
}

fn url_list(name: &str) -> Result<Vec<String>, Error> {
    let raw = env::var(name).unwrap_or_default();
    let mut urls = Vec::new();
    for value in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        validate_url(name, value)?;
        urls.push(value.to_string());
    }
    Ok(urls)
}

fn validate_url(name: &str, value: &str) -> Result<(), Error> {
    Url::parse(value).map_err(|e| Error::Config(format!("{name} is not a valid URL: {e}")))?;
    Ok(())
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, Error> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| Error::Config(format!("{name} is not a valid number"))),
        Err(_) => Ok(default),
    }
}

pub fn init_logger() {
    Builder::new().filter_level(LevelFilter::Info).init();
    info!("Starting upload notifier backend...");
}

pub fn load_environment() {
    dotenv::dotenv().ok();
}

pub async fn setup_check_scheduler(
    store: Store,
    youtube: YoutubeClient,
    queue: CloudTasksClient,
    http: reqwest::Client,
    config: AppConfig,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;
    let schedule = config.check_schedule.clone();

    let check_job = Job::new_async(schedule.as_str(), move |_uuid, _l| {
        let store = store.clone();
        let youtube = youtube.clone();
        let queue = queue.clone();
        let http = http.clone();
        let config = config.clone();
        Box::pin(async move {
            let pipeline = Pipeline::new(&store, &youtube, &queue, &http, &config);
            match pipeline.check_new_videos().await {
                Ok(summary) => info!(
                    "check run finished: {} new video(s), {} task(s) created",
                    summary.new_videos, summary.tasks_created
                ),
                Err(e) => error!("check run failed: {e}"),
            }
        })
    })?;

    scheduler.add(check_job).await?;
    scheduler.start().await?;
    info!("Check scheduler started.");

    Ok(scheduler)
}

pub async fn create_app_state() -> Result<AppState> {
    let config = AppConfig::from_env()?;

    let store = Store::connect(&config.database_url).await?;
    store.init_schema().await?;

    let http = reqwest::Client::new();
    let youtube = YoutubeClient::new(config.youtube.clone(), http.clone(), config.retry);
    let queue = CloudTasksClient::new(config.tasks.clone(), http.clone());

    let scheduler = setup_check_scheduler(
        store.clone(),
        youtube.clone(),
        queue.clone(),
        http.clone(),
        config.clone(),
    )
    .await?;

    Ok(AppState {
        store,
        youtube,
        queue,
        http,
        config,
        scheduler: tokio::sync::Mutex::new(scheduler),
    })
}
