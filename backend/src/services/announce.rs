use log::{info, warn};

use crate::config::AppConfig;
use crate::error::Result;
use crate::models::Video;
use crate::services::fanout::{PushClient, Sink, WebhookSink};
use crate::services::store::Store;
use crate::services::youtube::MetadataSource;

/// Fire-time handler for a scheduled song task: re-check the video still
/// exists, then push-notify subscribers and post the announce webhook.
pub async fn announce_song<S: MetadataSource>(
    source: &S,
    store: &Store,
    http: &reqwest::Client,
    config: &AppConfig,
    video_id: &str,
) -> Result<()> {
    let Some(video) = lookup_video(source, video_id).await? else {
        return Ok(());
    };

    info!("announcing song video {} ({})", video.id, video.title);

    if let Some(url) = &config.fanout.song_webhook_url {
        let sink = WebhookSink::new(
            "song-webhook",
            url.clone(),
            Some(serde_json::json!({
                "content": format!("https://www.youtube.com/watch?v={}", video.id),
            })),
            http.clone(),
        );
        config
            .retry
            .run("song announce webhook", || sink.deliver())
            .await?;
    }

    if let Some(endpoint) = &config.fanout.push_endpoint {
        let tokens = store.song_tokens().await?;
        let push = PushClient::new(
            endpoint.clone(),
            config.fanout.push_auth_token.clone(),
            http.clone(),
        );
        push.notify("Premieres in 5 minutes", &video, &tokens, config.retry)
            .await?;
    }

    Ok(())
}

/// Fire-time handler for a scheduled topic task: deliver the mention
/// message to the topic's webhook target.
pub async fn announce_topic<S: MetadataSource>(
    source: &S,
    store: &Store,
    http: &reqwest::Client,
    config: &AppConfig,
    video_id: &str,
    topic_name: &str,
) -> Result<()> {
    let Some(video) = lookup_video(source, video_id).await? else {
        return Ok(());
    };

    let topics = store.topics().await?;
    let Some(topic) = topics.into_iter().find(|t| t.name == topic_name) else {
        warn!("topic {topic_name} is no longer registered, skipping announcement");
        return Ok(());
    };

    info!(
        "announcing topic {} for video {} ({})",
        topic.name, video.id, video.title
    );

    let sink = WebhookSink::new(
        format!("topic:{}", topic.name),
        topic.webhook_url.clone(),
        Some(serde_json::json!({
            "content": format!(
                "<@&{}>\nhttps://www.youtube.com/watch?v={}",
                topic.mention_id, video.id
            ),
        })),
        http.clone(),
    );
    config
        .retry
        .run("topic announce webhook", || sink.deliver())
        .await?;

    Ok(())
}

/// The video may have been deleted between scheduling and fire time;
/// that ends the announcement quietly instead of failing the task.
async fn lookup_video<S: MetadataSource>(source: &S, video_id: &str) -> Result<Option<Video>> {
    let videos = source.videos(&[video_id.to_string()]).await?;
    match videos.into_iter().next() {
        Some(video) => Ok(Some(video)),
        None => {
            warn!("video {video_id} is gone, skipping announcement");
            Ok(None)
        }
    }
}
