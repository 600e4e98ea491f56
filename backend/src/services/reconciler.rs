use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use futures::future::join_all;
use log::{info, warn};

use crate::error::Result;
use crate::models::{Channel, PlaylistSummary};
use crate::services::store::Store;
use crate::services::youtube::{FeedSource, MetadataSource};

/// Result of one reconciliation pass: video ids never seen before, and
/// the channels whose playlist snapshot moved.
#[derive(Debug)]
pub struct ReconcileOutcome {
    pub new_video_ids: Vec<String>,
    pub changed: Vec<Channel>,
}

/// Reconciles the playlist-diff signal and the feed signal into one
/// deduplicated new-video set.
pub struct Reconciler<'a, S: MetadataSource + FeedSource> {
    source: &'a S,
    store: &'a Store,
    settle_delay: StdDuration,
    freshness_window: Duration,
}

impl<'a, S: MetadataSource + FeedSource> Reconciler<'a, S> {
    pub fn new(
        source: &'a S,
        store: &'a Store,
        settle_delay: StdDuration,
        freshness_window: Duration,
    ) -> Self {
        Self {
            source,
            store,
            settle_delay,
            freshness_window,
        }
    }

    pub async fn run(&self) -> Result<ReconcileOutcome> {
        let channels = self.store.channels().await?;
        let playlist_ids: Vec<String> = channels.iter().map(|c| c.playlist_id()).collect();
        let summaries = self.source.playlists(&playlist_ids).await?;

        let changed = changed_channels(&channels, &summaries);

        let mut candidates = Vec::new();
        if !changed.is_empty() {
            // The item-listing endpoint lags behind the count/metadata
            // endpoint; give it a moment before listing.
            tokio::time::sleep(self.settle_delay).await;
            for channel in &changed {
                let ids = self.source.playlist_items(&channel.playlist_id()).await?;
                candidates.extend(ids);
            }
        }

        // The feed catches videos the playlist path can miss (visibility
        // restrictions, replication lag), so every channel's feed is
        // consulted, not just the changed ones.
        let cutoff = Utc::now() - self.freshness_window;
        let feeds = join_all(
            playlist_ids
                .iter()
                .map(|pid| self.source.recent_uploads(pid)),
        )
        .await;
        for feed in feeds {
            candidates.extend(
                feed?
                    .into_iter()
                    .filter(|entry| entry.published >= cutoff)
                    .map(|entry| entry.video_id),
            );
        }

        candidates.sort();
        candidates.dedup();

        let new_video_ids = self.store.filter_unseen(&candidates).await?;
        Ok(ReconcileOutcome {
            new_video_ids,
            changed,
        })
    }
}

fn changed_channels(
    channels: &[Channel],
    current: &HashMap<String, PlaylistSummary>,
) -> Vec<Channel> {
    let mut changed = Vec::new();
    for channel in channels {
        let playlist_id = channel.playlist_id();
        let Some(summary) = current.get(&playlist_id) else {
            warn!("playlist {playlist_id} missing from metadata response, skipping");
            continue;
        };

        // Count equal AND fingerprint equal means nothing moved. The
        // fingerprint alone catches a same-count replacement (one video
        // deleted, another uploaded in the same window).
        if summary.item_count == channel.item_count
            && summary.latest_url == channel.latest_item_url
        {
            continue;
        }

        info!(
            "playlist {playlist_id} changed: items {} -> {}, latest {} -> {}",
            channel.item_count, summary.item_count, channel.latest_item_url, summary.latest_url
        );
        if summary.item_count < channel.item_count {
            // An upload may still have landed in the same window, so the
            // channel is not skipped.
            warn!("playlist {playlist_id} item count decreased, videos may have been deleted");
        }

        changed.push(Channel {
            id: channel.id.clone(),
            name: channel.name.clone(),
            item_count: summary.item_count,
            latest_item_url: summary.latest_url.clone(),
        });
    }
    changed
}
