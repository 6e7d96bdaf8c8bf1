use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use super::ids::{hash_string, minute_bucket_id, query_param};
use super::page::PageSource;
use crate::kernel::event::{MediaState, Observation, TrackSnapshot, UNKNOWN_ARTIST, UNKNOWN_TRACK};

/// Host-page specifics. Defaults target the YouTube Music player bar.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub title_selectors: Vec<String>,
    pub artist_selectors: Vec<String>,
    pub play_button_selectors: Vec<String>,
    pub player_bar_selector: String,
    /// Attribute on the player bar holding `{"videoId": ...}`.
    pub player_data_attribute: String,
    /// Matched case-insensitively against the play/pause button label. A
    /// match means the button offers "pause", i.e. media is playing.
    pub pause_label_pattern: String,
    /// Trailing document-title segment naming the site.
    pub title_suffix: String,
    /// Separator between artist and extra info in the subtitle line.
    pub artist_separator: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        let strings = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            title_selectors: strings(&[
                ".title.ytmusic-player-bar",
                "yt-formatted-string.title",
                ".content-info-wrapper .title",
                "ytmusic-player-bar .title",
                "span.title",
                ".metadata .title",
            ]),
            artist_selectors: strings(&[
                ".subtitle.ytmusic-player-bar",
                "yt-formatted-string.subtitle",
                ".content-info-wrapper .subtitle",
                "ytmusic-player-bar .subtitle",
                "span.subtitle",
                ".metadata .subtitle",
            ]),
            play_button_selectors: strings(&["tp-yt-paper-icon-button.play-pause-button", ".play-pause-button"]),
            player_bar_selector: "ytmusic-player-bar".to_string(),
            player_data_attribute: "data-current-video".to_string(),
            pause_label_pattern: "pause|일시중지|일시 중지|정지".to_string(),
            title_suffix: "YouTube Music".to_string(),
            artist_separator: "•".to_string(),
        }
    }
}

/// Which source produced title and artist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionSource {
    MediaSession,
    DocumentTitle,
    DomSelectors,
    Fallback,
}

/// What `logDOMState` prints.
#[derive(Debug, Clone)]
pub struct PageReport {
    pub player_bar: bool,
    pub title_hits: Vec<Option<String>>,
    pub artist_hits: Vec<Option<String>>,
    pub document_title: String,
    pub media_session: Option<(String, String)>,
    pub play_button_label: Option<String>,
    pub media_playing: Option<bool>,
    pub url: String,
    pub url_video_id: Option<String>,
}

pub struct TrackDetector {
    config: DetectorConfig,
    pause_label: Regex,
    list_param: Regex,
    media_src_id: Regex,
}

impl TrackDetector {
    pub fn new(config: DetectorConfig) -> Result<Self, regex::Error> {
        let pause_label = Regex::new(&format!("(?i){}", config.pause_label_pattern))?;
        Ok(Self {
            config,
            pause_label,
            list_param: Regex::new(r"[?&]list=([^&#]+)")?,
            media_src_id: Regex::new(r"/([a-zA-Z0-9_-]{11})/")?,
        })
    }

    /// Everything a check cycle needs from the page.
    pub fn observe(&self, page: &dyn PageSource, now: DateTime<Utc>) -> Observation {
        Observation {
            snapshot: self.detect(page, now),
            is_playing: self.is_playing(page),
            media: self.media_state(page),
            url: page.url().to_string(),
        }
    }

    pub fn detect(&self, page: &dyn PageSource, now: DateTime<Utc>) -> TrackSnapshot {
        let (title, artist, source) = self.title_and_artist(page);
        debug!("Track info via {:?}: {} / {}", source, title, artist);
        TrackSnapshot {
            title,
            artist,
            external_id: self.external_id(page, now),
            playlist_id: self.playlist_id(page),
        }
    }

    /// First source yielding both title and artist wins. A title found
    /// without an artist is kept, paired with the unknown-artist sentinel.
    pub fn title_and_artist(&self, page: &dyn PageSource) -> (String, String, DetectionSource) {
        let mut partial_title: Option<String> = None;

        if let Some(meta) = page.media_metadata() {
            let title = meta.title.trim().to_string();
            let artist = meta.artist.trim().to_string();
            if !title.is_empty() && !artist.is_empty() {
                return (title, artist, DetectionSource::MediaSession);
            }
            if !title.is_empty() {
                partial_title = Some(title);
            }
        }

        if let Some((title, artist)) = self.parse_document_title(page.document_title()) {
            let title = partial_title.unwrap_or(title);
            return (title, artist, DetectionSource::DocumentTitle);
        }

        let dom_title = self.first_text(page, &self.config.title_selectors);
        let dom_artist = self
            .first_text(page, &self.config.artist_selectors)
            .map(|text| self.strip_artist_extras(&text))
            .filter(|a| !a.is_empty());

        match (partial_title.or(dom_title), dom_artist) {
            (Some(title), Some(artist)) => (title, artist, DetectionSource::DomSelectors),
            (Some(title), None) => (title, UNKNOWN_ARTIST.to_string(), DetectionSource::Fallback),
            (None, _) => (UNKNOWN_TRACK.to_string(), UNKNOWN_ARTIST.to_string(), DetectionSource::Fallback),
        }
    }

    /// `"<title> - <artist> - <suffix>"`, or `"<title> - <artist>"`.
    pub fn parse_document_title(&self, doc_title: &str) -> Option<(String, String)> {
        if !doc_title.contains(" - ") {
            return None;
        }
        let parts: Vec<&str> = doc_title.split(" - ").collect();
        let title = parts.first()?.trim();
        let artist = parts.get(1)?.trim();
        if title.is_empty() || artist.is_empty() || artist.contains(self.config.title_suffix.as_str()) {
            return None;
        }
        Some((title.to_string(), artist.to_string()))
    }

    /// Fallback chain: URL `v` parameter, media source path, player data
    /// attribute, hash of media-session title+artist, hash of the document
    /// title, then a per-minute placeholder.
    pub fn external_id(&self, page: &dyn PageSource, now: DateTime<Utc>) -> String {
        if let Some(id) = query_param(page.url(), "v") {
            return id;
        }

        if let Some(src) = page.media_element().and_then(|m| m.src) {
            if let Some(caps) = self.media_src_id.captures(&src) {
                return caps[1].to_string();
            }
        }

        if let Some(raw) = page.attribute(&self.config.player_bar_selector, &self.config.player_data_attribute) {
            match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(data) => {
                    if let Some(id) = data.get("videoId").and_then(|v| v.as_str()).filter(|v| !v.is_empty()) {
                        return id.to_string();
                    }
                }
                Err(e) => debug!("Unreadable player data attribute: {}", e),
            }
        }

        if let Some(meta) = page.media_metadata() {
            if !meta.title.is_empty() && !meta.artist.is_empty() {
                return format!("song-{}", hash_string(&format!("{}-{}", meta.title, meta.artist)));
            }
        }

        let doc_title = page.document_title();
        if doc_title.contains(" - ") {
            return format!("title-{}", hash_string(doc_title));
        }

        minute_bucket_id(now)
    }

    pub fn playlist_id(&self, page: &dyn PageSource) -> Option<String> {
        if let Some(id) = query_param(page.url(), "list") {
            return Some(id);
        }
        page.anchor_hrefs()
            .iter()
            .find_map(|href| self.list_param.captures(href).map(|c| c[1].to_string()))
    }

    /// Play/pause button label first; the media element's paused flag only
    /// when no button is on the page.
    pub fn is_playing(&self, page: &dyn PageSource) -> bool {
        if let Some(selector) = self.play_button(page) {
            let label = page
                .attribute(selector, "title")
                .or_else(|| page.attribute(selector, "aria-label"))
                .unwrap_or_default();
            return self.pause_label.is_match(&label.to_lowercase());
        }
        page.media_element().map(|m| !m.paused).unwrap_or(false)
    }

    pub fn media_state(&self, page: &dyn PageSource) -> Option<MediaState> {
        page.media_element().map(|m| m.state())
    }

    pub fn report(&self, page: &dyn PageSource) -> PageReport {
        let button = self.play_button(page);
        PageReport {
            player_bar: page.element_exists(&self.config.player_bar_selector),
            title_hits: self.config.title_selectors.iter().map(|s| page.text_content(s)).collect(),
            artist_hits: self.config.artist_selectors.iter().map(|s| page.text_content(s)).collect(),
            document_title: page.document_title().to_string(),
            media_session: page.media_metadata().map(|m| (m.title, m.artist)),
            play_button_label: button.and_then(|s| page.attribute(s, "title")),
            media_playing: page.media_element().map(|m| !m.paused),
            url: page.url().to_string(),
            url_video_id: query_param(page.url(), "v"),
        }
    }

    fn play_button<'a>(&'a self, page: &dyn PageSource) -> Option<&'a str> {
        self.config
            .play_button_selectors
            .iter()
            .find(|s| page.element_exists(s))
            .map(String::as_str)
    }

    fn first_text(&self, page: &dyn PageSource, selectors: &[String]) -> Option<String> {
        selectors.iter().find_map(|s| page.text_content(s))
    }

    fn strip_artist_extras(&self, text: &str) -> String {
        text.split(self.config.artist_separator.as_str())
            .next()
            .unwrap_or_default()
            .trim()
            .to_string()
    }
}
