use log::warn;
use regex::{Regex, RegexBuilder};

use crate::error::{Error, Result};
use crate::models::{BroadcastState, Topic, Video, ZERO_DURATION};

/// Titles of song uploads (covers, originals, music videos) almost
/// always carry one of these.
const SONG_KEYWORDS: &[&str] = &[
    "cover",
    "歌って",
    "歌わせて",
    "Original Song",
    "オリジナル曲",
    "オリジナル楽曲",
    "オリジナルソング",
    "MV",
    "Music Video",
];

/// Titles that disqualify a video from song handling outright: clip
/// compilations, radio shows, and one channel whose title format
/// false-positives on the list above.
const IGNORE_KEYWORDS: &[&str] = &["切り抜き", "ラジオ", "くろなん"];

/// What one video should trigger. `topics` borrows from the matcher set
/// passed to [`classify`].
#[derive(Debug)]
pub struct Classification<'a> {
    pub song: bool,
    pub needs_review: bool,
    pub topics: Vec<&'a Topic>,
}

/// A topic rule with its keyword alternations compiled once per run.
pub struct TopicMatcher<'a> {
    pub topic: &'a Topic,
    include: Regex,
    exclude: Option<Regex>,
}

impl<'a> TopicMatcher<'a> {
    fn new(topic: &'a Topic) -> Result<Option<Self>> {
        if topic.include.is_empty() {
            warn!("topic {} has no include keywords, it can never match", topic.name);
            return Ok(None);
        }
        let include = keyword_alternation(&topic.include)?;
        let exclude = if topic.exclude.is_empty() {
            None
        } else {
            Some(keyword_alternation(&topic.exclude)?)
        };
        Ok(Some(Self {
            topic,
            include,
            exclude,
        }))
    }

    fn matches(&self, title: &str) -> bool {
        if !self.include.is_match(title) {
            return false;
        }
        // An exclude hit vetoes the include hit.
        !self
            .exclude
            .as_ref()
            .is_some_and(|exclude| exclude.is_match(title))
    }
}

/// Compile every registered topic rule. Rules that can never match are
/// dropped with a warning rather than failing the run.
pub fn build_matchers(topics: &[Topic]) -> Result<Vec<TopicMatcher<'_>>> {
    let mut matchers = Vec::with_capacity(topics.len());
    for topic in topics {
        if let Some(matcher) = TopicMatcher::new(topic)? {
            matchers.push(matcher);
        }
    }
    Ok(matchers)
}

/// Map one video's metadata to the purposes it should trigger. Pure; no
/// I/O.
pub fn classify<'a>(video: &Video, matchers: &'a [TopicMatcher<'_>]) -> Classification<'a> {
    let has_keyword = contains_any(&video.title, SONG_KEYWORDS);
    let ignored = contains_any(&video.title, IGNORE_KEYWORDS);

    // Song handling only applies to live/premiere uploads with a real
    // runtime; a zero-duration entry is an open-ended live broadcast.
    let live_shape = video.scheduled_start_time.is_some()
        && video.duration != ZERO_DURATION
        && video.broadcast != BroadcastState::None;

    let song = live_shape && has_keyword && !ignored;

    // Upcoming premieres that look like a song but miss every keyword
    // go to manual review instead of being dropped silently.
    let needs_review = !has_keyword
        && !ignored
        && video.scheduled_start_time.is_some()
        && video.broadcast == BroadcastState::Upcoming
        && video.duration != ZERO_DURATION;

    let topics = matchers
        .iter()
        .filter(|m| m.matches(&video.title))
        .map(|m| m.topic)
        .collect();

    Classification {
        song,
        needs_review,
        topics,
    }
}

fn contains_any(title: &str, keywords: &[&str]) -> bool {
    let title = title.to_lowercase();
    keywords
        .iter()
        .any(|keyword| title.contains(&keyword.to_lowercase()))
}

fn keyword_alternation(keywords: &[String]) -> Result<Regex> {
    let pattern = keywords
        .iter()
        .map(|keyword| regex::escape(keyword))
        .collect::<Vec<_>>()
        .join("|");
    RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| Error::Malformed(format!("keyword pattern: {e}")))
}
