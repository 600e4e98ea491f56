use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use reqwest::Client;
use serde::Deserialize;

use crate::config::YoutubeConfig;
use crate::error::{Error, Result};
use crate::models::{BroadcastState, FeedEntry, PlaylistSummary, Video};
use crate::retry::RetryPolicy;

/// The metadata endpoints accept at most this many ids per call.
const BATCH_LIMIT: usize = 50;

/// Batched lookups against the upstream metadata source.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Current item count and latest-item fingerprint per playlist.
    async fn playlists(&self, playlist_ids: &[String]) -> Result<HashMap<String, PlaylistSummary>>;

    /// Most recent video ids of one playlist.
    async fn playlist_items(&self, playlist_id: &str) -> Result<Vec<String>>;

    /// Full metadata for the given video ids. Videos the source refuses
    /// to describe (deleted, membership-restricted) are simply absent
    /// from the result.
    async fn videos(&self, video_ids: &[String]) -> Result<Vec<Video>>;
}

/// Per-channel chronological upload feed.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn recent_uploads(&self, playlist_id: &str) -> Result<Vec<FeedEntry>>;
}

#[derive(Clone)]
pub struct YoutubeClient {
    http: Client,
    config: YoutubeConfig,
    retry: RetryPolicy,
}

impl YoutubeClient {
    pub fn new(config: YoutubeConfig, http: Client, retry: RetryPolicy) -> Self {
        Self {
            http,
            config,
            retry,
        }
    }

    async fn fetch_feed_once(&self, playlist_id: &str) -> Result<reqwest::Response> {
        let resp = self
            .http
            .get(&self.config.feed_base)
            .query(&[("playlist_id", playlist_id)])
            .send()
            .await?;

        if resp.status().is_server_error() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(Error::Upstream { status, message });
        }

        Ok(resp)
    }
}

#[async_trait]
impl MetadataSource for YoutubeClient {
    async fn playlists(&self, playlist_ids: &[String]) -> Result<HashMap<String, PlaylistSummary>> {
        let mut playlists = HashMap::with_capacity(playlist_ids.len());

        for chunk in playlist_ids.chunks(BATCH_LIMIT) {
            let url = format!("{}/playlists", self.config.api_base);
            let ids = chunk.join(",");
            let resp: PlaylistListResponse = self
                .http
                .get(&url)
                .query(&[
                    ("part", "snippet,contentDetails"),
                    ("maxResults", "50"),
                    ("id", ids.as_str()),
                    ("key", self.config.api_key.as_str()),
                ])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            for item in resp.items {
                let latest_url = item
                    .snippet
                    .and_then(|s| s.thumbnails.high)
                    .map(|t| t.url)
                    .unwrap_or_default();
                playlists.insert(
                    item.id,
                    PlaylistSummary {
                        item_count: item.content_details.item_count,
                        latest_url,
                    },
                );
            }
        }

        Ok(playlists)
    }

    async fn playlist_items(&self, playlist_id: &str) -> Result<Vec<String>> {
        // https://developers.google.com/youtube/v3/docs/playlistItems
        let url = format!("{}/playlistItems", self.config.api_base);
        let max_results = self.config.playlist_fetch_count.to_string();
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("part", "snippet"),
                ("playlistId", playlist_id),
                ("maxResults", max_results.as_str()),
                ("key", self.config.api_key.as_str()),
            ])
            .send()
            .await?;

        // A playlist can briefly 404 right after its channel changes
        // visibility; that is not worth failing the whole run over.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            warn!("playlist {playlist_id} returned 404, skipping");
            return Ok(Vec::new());
        }

        let resp: PlaylistItemsResponse = resp.error_for_status()?.json().await?;
        Ok(resp
            .items
            .into_iter()
            .map(|item| item.snippet.resource_id.video_id)
            .collect())
    }

    async fn videos(&self, video_ids: &[String]) -> Result<Vec<Video>> {
        let mut videos = Vec::with_capacity(video_ids.len());

        for chunk in video_ids.chunks(BATCH_LIMIT) {
            // https://developers.google.com/youtube/v3/docs/videos
            let url = format!("{}/videos", self.config.api_base);
            let ids = chunk.join(",");
            let resp: VideoListResponse = self
                .http
                .get(&url)
                .query(&[
                    ("part", "snippet,contentDetails,liveStreamingDetails"),
                    ("maxResults", "50"),
                    ("id", ids.as_str()),
                    ("key", self.config.api_key.as_str()),
                ])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            for item in resp.items {
                videos.push(video_from_item(item)?);
            }
        }

        Ok(videos)
    }
}

#[async_trait]
impl FeedSource for YoutubeClient {
    async fn recent_uploads(&self, playlist_id: &str) -> Result<Vec<FeedEntry>> {
        let resp = self
            .retry
            .run_if("feed fetch", Error::is_transient, || {
                self.fetch_feed_once(playlist_id)
            })
            .await?;

        if !resp.status().is_success() {
            warn!(
                "feed for playlist {playlist_id} returned {}, skipping channel",
                resp.status()
            );
            return Ok(Vec::new());
        }

        let body = resp.text().await?;
        parse_feed(playlist_id, &body)
    }
}

fn video_from_item(item: VideoItem) -> Result<Video> {
    let scheduled_start_time = match item
        .live_streaming_details
        .as_ref()
        .and_then(|d| d.scheduled_start_time.as_deref())
    {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|e| Error::Malformed(format!("scheduledStartTime {raw:?}: {e}")))?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    Ok(Video {
        id: item.id,
        title: item.snippet.title,
        duration: item.content_details.duration,
        broadcast: BroadcastState::parse(&item.snippet.live_broadcast_content),
        scheduled_start_time,
        thumbnail_url: item
            .snippet
            .thumbnails
            .high
            .map(|t| t.url)
            .unwrap_or_default(),
        channel_id: item.snippet.channel_id,
    })
}

fn parse_feed(playlist_id: &str, body: &str) -> Result<Vec<FeedEntry>> {
    let feed: Feed = quick_xml::de::from_str(body).map_err(|e| Error::MalformedFeed {
        playlist_id: playlist_id.to_string(),
        message: e.to_string(),
    })?;

    let mut entries = Vec::with_capacity(feed.entries.len());
    for entry in feed.entries {
        let published = DateTime::parse_from_rfc3339(&entry.published)
            .map_err(|e| Error::MalformedFeed {
                playlist_id: playlist_id.to_string(),
                message: format!("published {:?}: {e}", entry.published),
            })?
            .with_timezone(&Utc);
        entries.push(FeedEntry {
            video_id: entry.video_id,
            title: entry.title,
            published,
        });
    }

    Ok(entries)
}

#[derive(Debug, Deserialize)]
struct PlaylistListResponse {
    #[serde(default)]
    items: Vec<PlaylistItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    id: String,
    snippet: Option<PlaylistSnippet>,
    content_details: PlaylistContentDetails,
}

#[derive(Debug, Deserialize)]
struct PlaylistSnippet {
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistContentDetails {
    item_count: i64,
}

#[derive(Debug, Deserialize)]
struct PlaylistItemsResponse {
    #[serde(default)]
    items: Vec<PlaylistItemEntry>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItemEntry {
    snippet: PlaylistItemSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemSnippet {
    resource_id: ResourceId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceId {
    video_id: String,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    id: String,
    snippet: VideoSnippet,
    content_details: VideoContentDetails,
    live_streaming_details: Option<LiveStreamingDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    title: String,
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    live_broadcast_content: String,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoContentDetails {
    duration: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveStreamingDetails {
    scheduled_start_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Thumbnails {
    high: Option<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Debug, Deserialize)]
struct Feed {
    #[serde(rename = "entry", default)]
    entries: Vec<XmlEntry>,
}

#[derive(Debug, Deserialize)]
struct XmlEntry {
    #[serde(rename = "videoId")]
    video_id: String,
    title: String,
    published: String,
}
