use log::{info, warn};

use crate::config::AppConfig;
use crate::error::{Error, FanOutError, FanOutFailure, Result};
use crate::models::{EnsureOutcome, RunSummary, VideoRecord};
use crate::services::classifier;
use crate::services::fanout::{self, Sink, WebhookSink};
use crate::services::reconciler::Reconciler;
use crate::services::scheduler::{NotificationScheduler, TaskQueue};
use crate::services::store::Store;
use crate::services::youtube::{FeedSource, MetadataSource};

/// One upload-check run: reconcile sources, persist, classify, schedule,
/// fan out. Stateless across runs; everything durable lives in the store
/// and the task queue.
pub struct Pipeline<'a, S, Q>
where
    S: MetadataSource + FeedSource,
    Q: TaskQueue,
{
    store: &'a Store,
    source: &'a S,
    queue: &'a Q,
    http: &'a reqwest::Client,
    config: &'a AppConfig,
}

impl<'a, S, Q> Pipeline<'a, S, Q>
where
    S: MetadataSource + FeedSource,
    Q: TaskQueue,
{
    pub fn new(
        store: &'a Store,
        source: &'a S,
        queue: &'a Q,
        http: &'a reqwest::Client,
        config: &'a AppConfig,
    ) -> Self {
        Self {
            store,
            source,
            queue,
            http,
            config,
        }
    }

    pub async fn check_new_videos(&self) -> Result<RunSummary> {
        let retry = self.config.retry;
        let reconciler = Reconciler::new(
            self.source,
            self.store,
            self.config.settle_delay,
            self.config.freshness_window(),
        );
        let outcome = reconciler.run().await?;

        if outcome.new_video_ids.is_empty() {
            retry
                .run("snapshot update", || {
                    self.store.apply_run_update(&outcome.changed, &[])
                })
                .await?;
            info!("no new videos this run");
            return Ok(RunSummary {
                new_videos: 0,
                tasks_created: 0,
            });
        }

        // Log the bare ids first; metadata for some of them may be
        // unavailable below.
        info!("new video ids: {}", outcome.new_video_ids.join(","));

        let videos = self.source.videos(&outcome.new_video_ids).await?;
        if videos.len() != outcome.new_video_ids.len() {
            warn!(
                "metadata returned {} of {} new videos (membership-restricted or deleted entries)",
                videos.len(),
                outcome.new_video_ids.len()
            );
        }
        for video in &videos {
            info!("new video {}: {}", video.id, video.title);
        }

        // Snapshots and video records move together or not at all, so a
        // retried or crashed run can never re-detect what it already
        // recorded.
        let records: Vec<VideoRecord> = videos.iter().map(VideoRecord::from_video).collect();
        retry
            .run("run persistence", || {
                self.store.apply_run_update(&outcome.changed, &records)
            })
            .await?;

        if videos.is_empty() {
            return Ok(RunSummary {
                new_videos: outcome.new_video_ids.len(),
                tasks_created: 0,
            });
        }

        let topics = self.store.topics().await?;
        let matchers = classifier::build_matchers(&topics)?;
        let scheduler = NotificationScheduler::new(self.queue, &self.config.tasks, retry);

        let mut failures: Vec<FanOutFailure> = Vec::new();
        let mut tasks_created = 0usize;
        let mut review = Vec::new();

        for video in &videos {
            let classification = classifier::classify(video, &matchers);

            if classification.song {
                match scheduler.schedule_song(video).await {
                    Ok(Some(EnsureOutcome::Created)) => tasks_created += 1,
                    Ok(_) => {}
                    Err(e) => failures.push(FanOutFailure {
                        target: format!("song-task:{}", video.id),
                        message: e.to_string(),
                    }),
                }
            }

            for topic in &classification.topics {
                match scheduler.schedule_topic(video, topic).await {
                    Ok(Some(EnsureOutcome::Created)) => tasks_created += 1,
                    Ok(_) => {}
                    Err(e) => failures.push(FanOutFailure {
                        target: format!("topic-task:{}:{}", video.id, topic.name),
                        message: e.to_string(),
                    }),
                }
            }

            if classification.needs_review {
                review.push(video);
            }
        }

        let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
        let joined = outcome.new_video_ids.join(",");
        for url in &self.config.fanout.consumer_urls {
            sinks.push(Box::new(WebhookSink::new(
                url.clone(),
                format!("{url}?v={joined}"),
                None,
                self.http.clone(),
            )));
        }
        if let Some(review_url) = &self.config.fanout.review_webhook_url {
            for video in &review {
                sinks.push(Box::new(WebhookSink::new(
                    format!("review:{}", video.id),
                    review_url.clone(),
                    Some(serde_json::json!({
                        "content": format!("https://www.youtube.com/watch?v={}", video.id),
                    })),
                    self.http.clone(),
                )));
            }
        }
        if let Err(e) = fanout::deliver_all(&sinks, retry).await {
            failures.extend(e.failures);
        }

        if failures.is_empty() {
            Ok(RunSummary {
                new_videos: outcome.new_video_ids.len(),
                tasks_created,
            })
        } else {
            Err(Error::FanOut(FanOutError { failures }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    use crate::models::{BroadcastState, Channel, FeedEntry, PlaylistSummary, Topic, Video};
    use crate::services::scheduler::TaskRequest;

    #[derive(Default)]
    struct MockSource {
        summaries: HashMap<String, PlaylistSummary>,
        items: HashMap<String, Vec<String>>,
        feeds: HashMap<String, Vec<FeedEntry>>,
        videos: HashMap<String, Video>,
    }

    #[async_trait]
    impl MetadataSource for MockSource {
        async fn playlists(
            &self,
            playlist_ids: &[String],
        ) -> Result<HashMap<String, PlaylistSummary>> {
            Ok(playlist_ids
                .iter()
                .filter_map(|pid| self.summaries.get(pid).map(|s| (pid.clone(), s.clone())))
                .collect())
        }

        async fn playlist_items(&self, playlist_id: &str) -> Result<Vec<String>> {
            Ok(self.items.get(playlist_id).cloned().unwrap_or_default())
        }

        async fn videos(&self, video_ids: &[String]) -> Result<Vec<Video>> {
            Ok(video_ids
                .iter()
                .filter_map(|id| self.videos.get(id).cloned())
                .collect())
        }
    }

    #[async_trait]
    impl FeedSource for MockSource {
        async fn recent_uploads(&self, playlist_id: &str) -> Result<Vec<FeedEntry>> {
            Ok(self.feeds.get(playlist_id).cloned().unwrap_or_default())
        }
    }

    struct MockQueue {
        names: Mutex<HashSet<String>>,
        requests: Mutex<Vec<TaskRequest>>,
        always_fail: bool,
    }

    impl MockQueue {
        fn new() -> Self {
            Self {
                names: Mutex::new(HashSet::new()),
                requests: Mutex::new(Vec::new()),
                always_fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                always_fail: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl TaskQueue for MockQueue {
        async fn create(&self, request: &TaskRequest) -> Result<EnsureOutcome> {
            if self.always_fail {
                return Err(Error::Queue {
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            self.requests.lock().unwrap().push(request.clone());
            if self.names.lock().unwrap().insert(request.task_id.clone()) {
                Ok(EnsureOutcome::Created)
            } else {
                Ok(EnsureOutcome::AlreadyExists)
            }
        }
    }

    async fn seeded_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.init_schema().await.unwrap();
        store
            .seed_channel(&Channel {
                id: "UCchan".to_string(),
                name: "chan".to_string(),
                item_count: 3,
                latest_item_url: "old".to_string(),
            })
            .await
            .unwrap();
        store
    }

    fn song_video(id: &str) -> Video {
        Video {
            id: id.to_string(),
            title: "Original Song - premiere".to_string(),
            duration: "PT4M".to_string(),
            broadcast: BroadcastState::Upcoming,
            scheduled_start_time: Some(Utc::now() + Duration::hours(3)),
            thumbnail_url: String::new(),
            channel_id: "UCchan".to_string(),
        }
    }

    fn source_with_new_video(video: Video) -> MockSource {
        let mut source = MockSource::default();
        source
            .summaries
            .insert("UUchan".to_string(), PlaylistSummary {
                item_count: 4,
                latest_url: "new".to_string(),
            });
        source
            .items
            .insert("UUchan".to_string(), vec![video.id.clone()]);
        source.videos.insert(video.id.clone(), video);
        source
    }

    #[tokio::test]
    async fn full_run_persists_and_schedules() {
        let store = seeded_store().await;
        let source = source_with_new_video(song_video("vid00000001"));
        let queue = MockQueue::new();
        let http = reqwest::Client::new();
        let config = AppConfig::for_tests();

        let pipeline = Pipeline::new(&store, &source, &queue, &http, &config);
        let summary = pipeline.check_new_videos().await.unwrap();

        assert_eq!(summary.new_videos, 1);
        assert_eq!(summary.tasks_created, 1);
        assert_eq!(
            queue.requests.lock().unwrap()[0].task_id,
            "song-vid00000001"
        );
        // Snapshot advanced together with the video record.
        let channels = store.channels().await.unwrap();
        assert_eq!(channels[0].item_count, 4);
        assert!(store
            .filter_unseen(&["vid00000001".to_string()])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn rerunning_the_same_detection_is_idempotent() {
        let store = seeded_store().await;
        let source = source_with_new_video(song_video("vid00000001"));
        let queue = MockQueue::new();
        let http = reqwest::Client::new();
        let config = AppConfig::for_tests();

        let pipeline = Pipeline::new(&store, &source, &queue, &http, &config);
        pipeline.check_new_videos().await.unwrap();
        // Second run with identical upstream state: the video is now
        // persisted and the snapshot advanced, so nothing fires.
        let summary = pipeline.check_new_videos().await.unwrap();

        assert_eq!(summary.new_videos, 0);
        assert_eq!(summary.tasks_created, 0);
        assert_eq!(queue.names.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn topic_match_schedules_one_task_per_topic() {
        let store = seeded_store().await;
        store
            .seed_topic(&Topic {
                name: "3d-debut".to_string(),
                mention_id: "42".to_string(),
                webhook_url: "https://example.com/hook".to_string(),
                include: vec!["3D".to_string()],
                exclude: vec![],
            })
            .await
            .unwrap();

        let mut video = song_video("vid00000002");
        video.title = "3D debut stream".to_string();
        let source = source_with_new_video(video);
        let queue = MockQueue::new();
        let http = reqwest::Client::new();
        let config = AppConfig::for_tests();

        let pipeline = Pipeline::new(&store, &source, &queue, &http, &config);
        let summary = pipeline.check_new_videos().await.unwrap();

        assert_eq!(summary.tasks_created, 1);
        let requests = queue.requests.lock().unwrap();
        assert_eq!(requests[0].task_id, "topic-vid00000002-42");
    }

    #[tokio::test]
    async fn restricted_videos_still_advance_the_snapshot() {
        let store = seeded_store().await;
        let mut source = source_with_new_video(song_video("vid00000003"));
        // Detected by id, but the metadata source refuses to describe it.
        source.videos.clear();
        let queue = MockQueue::new();
        let http = reqwest::Client::new();
        let config = AppConfig::for_tests();

        let pipeline = Pipeline::new(&store, &source, &queue, &http, &config);
        let summary = pipeline.check_new_videos().await.unwrap();

        assert_eq!(summary.new_videos, 1);
        assert_eq!(summary.tasks_created, 0);
        assert_eq!(store.channels().await.unwrap()[0].item_count, 4);
    }

    #[tokio::test]
    async fn scheduling_failures_are_aggregated_not_fatal_mid_run() {
        let store = seeded_store().await;
        let source = source_with_new_video(song_video("vid00000004"));
        let queue = MockQueue::failing();
        let http = reqwest::Client::new();
        let config = AppConfig::for_tests();

        let pipeline = Pipeline::new(&store, &source, &queue, &http, &config);
        let err = pipeline.check_new_videos().await.unwrap_err();

        let Error::FanOut(composite) = err else {
            panic!("expected composite error");
        };
        assert_eq!(composite.failures.len(), 1);
        assert!(composite.failures[0].target.contains("song-task"));
        // Persistence happened before scheduling, so the video is not
        // re-detected next run.
        assert!(store
            .filter_unseen(&["vid00000004".to_string()])
            .await
            .unwrap()
            .is_empty());
    }
}
