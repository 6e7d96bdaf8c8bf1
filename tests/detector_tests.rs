use chrono::{TimeZone, Utc};
use odo::detector::{hash_string, minute_bucket_id, DetectionSource, DetectorConfig, MediaElement, PageState, TrackDetector};
use odo::kernel::event::{UNKNOWN_ARTIST, UNKNOWN_TRACK};

fn detector() -> TrackDetector {
    TrackDetector::new(DetectorConfig::default()).unwrap()
}

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
}

const PLAYER: &str = "https://music.youtube.com/";
const BUTTON: &str = "tp-yt-paper-icon-button.play-pause-button";

#[test]
fn test_media_session_wins() {
    let page = PageState::new("https://music.youtube.com/watch?v=abcdefghijk")
        .with_media_session("Session Title", "Session Artist")
        .with_title("Doc Title - Doc Artist - YouTube Music")
        .with_text(".title.ytmusic-player-bar", "Dom Title");

    let (title, artist, source) = detector().title_and_artist(&page);
    assert_eq!(title, "Session Title");
    assert_eq!(artist, "Session Artist");
    assert_eq!(source, DetectionSource::MediaSession);
}

#[test]
fn test_document_title_pattern() {
    let d = detector();
    let page = PageState::new(PLAYER).with_title("Dynamite - BTS - YouTube Music");
    let (title, artist, source) = d.title_and_artist(&page);
    assert_eq!((title.as_str(), artist.as_str()), ("Dynamite", "BTS"));
    assert_eq!(source, DetectionSource::DocumentTitle);

    assert_eq!(
        d.parse_document_title("Song - Artist"),
        Some(("Song".to_string(), "Artist".to_string()))
    );
    assert_eq!(d.parse_document_title("YouTube Music"), None);
    assert_eq!(d.parse_document_title("Home - YouTube Music"), None);
}

#[test]
fn test_dom_selectors_strip_subtitle_extras() {
    let page = PageState::new(PLAYER)
        .with_title("YouTube Music")
        .with_text("yt-formatted-string.title", "  Spring Day ")
        .with_text(".subtitle.ytmusic-player-bar", "BTS • You Never Walk Alone • 2017");

    let (title, artist, source) = detector().title_and_artist(&page);
    assert_eq!(title, "Spring Day");
    assert_eq!(artist, "BTS");
    assert_eq!(source, DetectionSource::DomSelectors);
}

#[test]
fn test_title_without_artist_keeps_title() {
    let page = PageState::new(PLAYER).with_text("span.title", "Lonely Title");
    let (title, artist, source) = detector().title_and_artist(&page);
    assert_eq!(title, "Lonely Title");
    assert_eq!(artist, UNKNOWN_ARTIST);
    assert_eq!(source, DetectionSource::Fallback);
}

#[test]
fn test_nothing_found_yields_sentinels() {
    let snapshot = detector().detect(&PageState::new(PLAYER), now());
    assert_eq!(snapshot.title, UNKNOWN_TRACK);
    assert_eq!(snapshot.artist, UNKNOWN_ARTIST);
    assert!(!snapshot.has_title());
}

#[test]
fn test_external_id_fallback_chain() {
    let d = detector();

    let page = PageState::new("https://music.youtube.com/watch?v=dQw4w9WgXcQ&list=PL1");
    assert_eq!(d.external_id(&page, now()), "dQw4w9WgXcQ");

    let page = PageState::new(PLAYER).with_media(MediaElement {
        src: Some("https://rr1.googlevideo.com/videoplayback/abcdefghijk/x".to_string()),
        ..MediaElement::default()
    });
    assert_eq!(d.external_id(&page, now()), "abcdefghijk");

    let page = PageState::new(PLAYER).with_attribute("ytmusic-player-bar", "data-current-video", r#"{"videoId":"fromPlayer1"}"#);
    assert_eq!(d.external_id(&page, now()), "fromPlayer1");

    let page = PageState::new(PLAYER).with_media_session("Song", "Artist");
    assert_eq!(d.external_id(&page, now()), format!("song-{}", hash_string("Song-Artist")));

    let page = PageState::new(PLAYER).with_title("Song - Artist - YouTube Music");
    assert_eq!(
        d.external_id(&page, now()),
        format!("title-{}", hash_string("Song - Artist - YouTube Music"))
    );

    let page = PageState::new(PLAYER);
    assert_eq!(d.external_id(&page, now()), minute_bucket_id(now()));
}

#[test]
fn test_unreadable_player_data_falls_through() {
    let page = PageState::new(PLAYER)
        .with_attribute("ytmusic-player-bar", "data-current-video", "not json")
        .with_media_session("Song", "Artist");
    assert!(detector().external_id(&page, now()).starts_with("song-"));
}

#[test]
fn test_placeholder_id_is_stable_within_a_minute() {
    let d = detector();
    let page = PageState::new(PLAYER);
    let a = d.external_id(&page, now());
    let b = d.external_id(&page, now() + chrono::Duration::seconds(45));
    assert_eq!(a, b);
}

#[test]
fn test_playlist_id_from_url_or_anchor() {
    let d = detector();
    let page = PageState::new("https://music.youtube.com/watch?v=x&list=PLurl");
    assert_eq!(d.playlist_id(&page).as_deref(), Some("PLurl"));

    let page = PageState::new(PLAYER)
        .with_anchor("/channel/UC123")
        .with_anchor("/playlist?list=PLanchor&feature=share");
    assert_eq!(d.playlist_id(&page).as_deref(), Some("PLanchor"));

    assert_eq!(d.playlist_id(&PageState::new(PLAYER)), None);
}

#[test]
fn test_is_playing_from_button_label() {
    let d = detector();
    let playing = PageState::new(PLAYER).with_attribute(BUTTON, "title", "Pause");
    assert!(d.is_playing(&playing));

    let paused = PageState::new(PLAYER).with_attribute(BUTTON, "title", "Play");
    assert!(!d.is_playing(&paused));

    let korean = PageState::new(PLAYER).with_attribute(BUTTON, "aria-label", "일시중지");
    assert!(d.is_playing(&korean));

    // The button outranks the media element.
    let conflicting = PageState::new(PLAYER)
        .with_attribute(BUTTON, "title", "Play")
        .with_media(MediaElement {
            paused: false,
            ..MediaElement::default()
        });
    assert!(!d.is_playing(&conflicting));
}

#[test]
fn test_is_playing_from_media_element_without_button() {
    let d = detector();
    let page = PageState::new(PLAYER).with_media(MediaElement {
        current_time: 12.0,
        duration: Some(180.0),
        paused: false,
        src: None,
    });
    assert!(d.is_playing(&page));
    assert!(!d.is_playing(&PageState::new(PLAYER)));
}

#[test]
fn test_observe_collects_everything() {
    let page = PageState::new("https://music.youtube.com/watch?v=abcdefghijk&list=PL9")
        .with_media_session("Song", "Artist")
        .with_attribute(BUTTON, "title", "Pause")
        .with_media(MediaElement {
            current_time: 61.5,
            duration: Some(200.0),
            paused: false,
            src: None,
        });

    let obs = detector().observe(&page, now());
    assert_eq!(obs.snapshot.external_id, "abcdefghijk");
    assert_eq!(obs.snapshot.playlist_id.as_deref(), Some("PL9"));
    assert!(obs.is_playing);
    let media = obs.media.unwrap();
    assert_eq!(media.position_secs(), 61);
    assert_eq!(media.duration_secs(), Some(200));
}

#[test]
fn test_page_state_reads_from_json() {
    let json = r#"{
        "url": "https://music.youtube.com/watch?v=abcdefghijk",
        "title": "Song - Artist - YouTube Music",
        "attributes": {"tp-yt-paper-icon-button.play-pause-button": {"title": "Pause"}}
    }"#;
    let page: PageState = serde_json::from_str(json).unwrap();
    let d = detector();
    let obs = d.observe(&page, now());
    assert_eq!(obs.snapshot.title, "Song");
    assert!(obs.is_playing);

    let report = d.report(&page);
    assert!(!report.player_bar);
    assert_eq!(report.play_button_label.as_deref(), Some("Pause"));
    assert_eq!(report.url_video_id.as_deref(), Some("abcdefghijk"));
}

#[test]
fn test_invalid_pause_pattern_is_rejected() {
    let config = DetectorConfig {
        pause_label_pattern: "(unclosed".to_string(),
        ..DetectorConfig::default()
    };
    assert!(TrackDetector::new(config).is_err());
}
