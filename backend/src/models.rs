use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ISO-8601 duration the metadata source reports for broadcasts with no
/// fixed length (ongoing or indefinite live streams).
pub const ZERO_DURATION: &str = "P0D";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastState {
    None,
    Upcoming,
    Live,
}

impl BroadcastState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastState::None => "none",
            BroadcastState::Upcoming => "upcoming",
            BroadcastState::Live => "live",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "upcoming" => BroadcastState::Upcoming,
            "live" => BroadcastState::Live,
            _ => BroadcastState::None,
        }
    }
}

/// A watched channel together with its last-known playlist snapshot
/// (item count + latest-item fingerprint). Rows are created at
/// onboarding; this service only advances the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub item_count: i64,
    pub latest_item_url: String,
}

impl Channel {
    /// The uploads playlist id is derived from the channel id by the
    /// platform's fixed convention: a leading `UC` becomes `UU`.
    pub fn playlist_id(&self) -> String {
        self.id.replacen("UC", "UU", 1)
    }
}

/// Current playlist state as reported by the metadata source.
#[derive(Debug, Clone, Default)]
pub struct PlaylistSummary {
    pub item_count: i64,
    pub latest_url: String,
}

/// Full video metadata as reported by the metadata source.
#[derive(Debug, Clone)]
pub struct Video {
    pub id: String,
    pub title: String,
    pub duration: String,
    pub broadcast: BroadcastState,
    pub scheduled_start_time: Option<DateTime<Utc>>,
    pub thumbnail_url: String,
    pub channel_id: String,
}

/// Persisted, append-only record of a video we have seen. Once a row
/// exists it is never updated; re-inserts are ignored.
#[derive(Debug, Clone)]
pub struct VideoRecord {
    pub id: String,
    pub title: String,
    pub duration: String,
    pub broadcast: BroadcastState,
    pub scheduled_start_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl VideoRecord {
    pub fn from_video(video: &Video) -> Self {
        Self {
            id: video.id.clone(),
            title: video.title.clone(),
            duration: video.duration.clone(),
            broadcast: video.broadcast,
            scheduled_start_time: video.scheduled_start_time,
            created_at: Utc::now(),
        }
    }
}

/// A registered interest rule. Owned by an external registry; read-only
/// here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub mention_id: String,
    pub webhook_url: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// One entry of a channel's chronological upload feed.
#[derive(Debug, Clone)]
pub struct FeedEntry {
    pub video_id: String,
    pub title: String,
    pub published: DateTime<Utc>,
}

/// Result of an idempotent create: both the task queue and the video
/// store report a duplicate as success, not as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    AlreadyExists,
}

/// Body of a scheduled song task; POSTed back to us at fire time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SongTaskBody {
    pub id: String,
}

/// Body of a scheduled topic task; POSTed back to us at fire time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicTaskBody {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub new_videos: usize,
    pub tasks_created: usize,
}
