use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::kernel::event::MediaState;

/// Metadata published by the page through the platform media-session API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MediaMetadata {
    pub title: String,
    #[serde(default)]
    pub artist: String,
}

/// The page's `<video>`/`<audio>` element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MediaElement {
    pub current_time: f64,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub src: Option<String>,
}

impl MediaElement {
    pub fn state(&self) -> MediaState {
        MediaState {
            current_time: self.current_time,
            duration: self.duration,
            paused: self.paused,
        }
    }
}

/// Read-only view of the host page. Everything host-specific the detector
/// needs goes through here, so the tracker can run against synthetic pages.
pub trait PageSource: Send {
    fn url(&self) -> &str;
    fn document_title(&self) -> &str;
    fn media_metadata(&self) -> Option<MediaMetadata>;
    fn element_exists(&self, selector: &str) -> bool;
    /// Trimmed text content of the first element matching `selector`.
    fn text_content(&self, selector: &str) -> Option<String>;
    fn attribute(&self, selector: &str, name: &str) -> Option<String>;
    /// `href` of every anchor on the page, in document order.
    fn anchor_hrefs(&self) -> Vec<String>;
    fn media_element(&self) -> Option<MediaElement>;
}

/// Serializable page snapshot. Used by the stdin bridge and by tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub media_session: Option<MediaMetadata>,
    /// selector -> text content
    pub texts: HashMap<String, String>,
    /// selector -> attribute name -> value
    pub attributes: HashMap<String, HashMap<String, String>>,
    pub anchors: Vec<String>,
    pub media: Option<MediaElement>,
}

impl PageState {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn with_media_session(mut self, title: &str, artist: &str) -> Self {
        self.media_session = Some(MediaMetadata {
            title: title.to_string(),
            artist: artist.to_string(),
        });
        self
    }

    pub fn with_text(mut self, selector: &str, text: &str) -> Self {
        self.texts.insert(selector.to_string(), text.to_string());
        self
    }

    pub fn with_attribute(mut self, selector: &str, name: &str, value: &str) -> Self {
        self.attributes
            .entry(selector.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_anchor(mut self, href: &str) -> Self {
        self.anchors.push(href.to_string());
        self
    }

    pub fn with_media(mut self, media: MediaElement) -> Self {
        self.media = Some(media);
        self
    }
}

impl PageSource for PageState {
    fn url(&self) -> &str {
        &self.url
    }

    fn document_title(&self) -> &str {
        &self.title
    }

    fn media_metadata(&self) -> Option<MediaMetadata> {
        self.media_session.clone()
    }

    fn element_exists(&self, selector: &str) -> bool {
        self.texts.contains_key(selector) || self.attributes.contains_key(selector)
    }

    fn text_content(&self, selector: &str) -> Option<String> {
        self.texts
            .get(selector)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    fn attribute(&self, selector: &str, name: &str) -> Option<String> {
        self.attributes.get(selector)?.get(name).cloned()
    }

    fn anchor_hrefs(&self) -> Vec<String> {
        self.anchors.clone()
    }

    fn media_element(&self) -> Option<MediaElement> {
        self.media.clone()
    }
}
