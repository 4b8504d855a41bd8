//! Decision engine.
//!
//! Inspects probed stream metadata and decides which streams must be
//! re-encoded for the output to play on the target device, and which audio
//! and subtitle tracks to keep. Everything here is a pure function of
//! ([`StreamInfo`], [`Config`]).

use crate::config::{Config, Container};
use crate::probe::{StreamDescriptor, StreamInfo, StreamKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest H.264 level the target devices decode (4.1).
const MAX_H264_LEVEL: i32 = 41;

/// H.264 profiles the target devices cannot decode.
const UNSUPPORTED_H264_PROFILES: [&str; 5] =
    ["high 10", "high10", "high 4:2:2", "high 4:4:4", "high 4:4:4 predictive"];

/// Error type for decision making.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecisionError {
    /// The input has nothing to convert.
    #[error("no video stream found")]
    NoVideoStream,
}

/// A chosen audio or subtitle stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackSelection {
    /// Absolute stream index in the container.
    pub index: usize,
    /// Position among streams of the same kind (0-based).
    pub position: usize,
    pub language: Option<String>,
}

/// What must happen to each stream kind of one input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub needs_video_transcode: bool,
    pub needs_audio_transcode: bool,
    pub selected_audio: Option<TrackSelection>,
    /// `None` means every subtitle stream is passed through (unless disabled).
    pub selected_subtitle: Option<TrackSelection>,
    /// Generate a silent stereo AAC track because the input has no audio.
    pub add_silence: bool,
    pub video_reason: String,
    pub audio_reason: String,
    pub subtitle_reason: String,
    pub video_copy: bool,
    pub audio_copy: bool,
    pub subtitle_copy: bool,
}

impl Decision {
    /// True when the output would be a plain remux and the config allows skipping it.
    pub fn is_compatible(&self) -> bool {
        !self.needs_video_transcode && !self.needs_audio_transcode && !self.add_silence
    }

    /// True when an audio encoder runs, either to transcode or to generate silence.
    pub fn encodes_audio(&self) -> bool {
        self.needs_audio_transcode || self.add_silence
    }
}

/// Parse bit depth from a pixel format name; 8 when unknown.
pub fn bit_depth(pixel_format: Option<&str>) -> u8 {
    let pix = pixel_format.unwrap_or("").to_lowercase();
    if pix.contains("12le") || pix.contains("12be") {
        12
    } else if pix.contains("10le") || pix.contains("10be") || pix.contains("p010") {
        10
    } else {
        8
    }
}

/// Returns true for titles marking an audio description track.
pub fn is_audio_description(title: Option<&str>) -> bool {
    let t = format!(" {}", title.unwrap_or("").to_lowercase());
    [
        "audio description",
        "audio-description",
        "audiodescription",
        "visual impaired",
        "visually impaired",
        " v.i",
    ]
    .iter()
    .any(|marker| t.contains(marker))
        || t.split(|c: char| !c.is_alphanumeric()).any(|word| word == "ad")
}

fn is_sdh(stream: &StreamDescriptor) -> bool {
    stream.hearing_impaired
        || stream
            .title
            .as_deref()
            .map(|t| t.to_lowercase().contains("sdh"))
            .unwrap_or(false)
}

fn language_matches(stream: &StreamDescriptor, wanted: &str) -> bool {
    let wanted = wanted.trim().to_lowercase();
    if wanted.is_empty() {
        return false;
    }
    match stream.language.as_deref() {
        Some(lang) => lang == wanted || lang.starts_with(&wanted),
        None => false,
    }
}

fn select(streams: &[&StreamDescriptor], position: usize) -> TrackSelection {
    let stream = streams[position];
    TrackSelection {
        index: stream.index,
        position,
        language: stream.language.clone(),
    }
}

/// Pick the audio track: explicit position, then language priority, then the first track.
pub fn select_audio_track(info: &StreamInfo, cfg: &Config) -> Option<TrackSelection> {
    let audio: Vec<&StreamDescriptor> = info.streams_of(StreamKind::Audio).collect();
    if audio.is_empty() {
        return None;
    }

    if let Some(position) = cfg.tracks.audio_track {
        if position < audio.len() {
            return Some(select(&audio, position));
        }
    }

    for lang in &cfg.tracks.audio_lang {
        let preferred = audio.iter().position(|s| {
            language_matches(s, lang) && !is_audio_description(s.title.as_deref())
        });
        if let Some(position) = preferred.or_else(|| audio.iter().position(|s| language_matches(s, lang))) {
            return Some(select(&audio, position));
        }
    }

    Some(select(&audio, 0))
}

fn same_language(a: &str, b: &str) -> bool {
    a == b
        || (a.chars().count() >= 2
            && b.chars().count() >= 2
            && a.chars().take(2).eq(b.chars().take(2)))
}

/// Pick a subtitle track, or `None` to pass every subtitle through.
pub fn select_subtitle_track(
    info: &StreamInfo,
    audio_language: Option<&str>,
    cfg: &Config,
) -> Option<TrackSelection> {
    if cfg.tracks.no_subtitles {
        return None;
    }
    let subs: Vec<&StreamDescriptor> = info.streams_of(StreamKind::Subtitle).collect();
    if subs.is_empty() {
        return None;
    }

    if let Some(position) = cfg.tracks.subtitle_track {
        if position < subs.len() {
            return Some(select(&subs, position));
        }
    }

    if cfg.tracks.prefer_forced_subs {
        if let Some(audio_lang) = audio_language {
            let forced = subs.iter().position(|s| {
                s.forced
                    && s.language
                        .as_deref()
                        .map(|l| same_language(l, audio_lang))
                        .unwrap_or(false)
            });
            if let Some(position) = forced {
                return Some(select(&subs, position));
            }
        }
    }

    for lang in &cfg.tracks.subtitle_lang {
        let found = subs
            .iter()
            .position(|s| language_matches(s, lang) && s.forced)
            .or_else(|| subs.iter().position(|s| language_matches(s, lang) && !is_sdh(s)))
            .or_else(|| subs.iter().position(|s| language_matches(s, lang)));
        if let Some(position) = found {
            return Some(select(&subs, position));
        }
    }

    None
}

/// Returns why an H.264 stream cannot be copied, or `None` when it can.
fn h264_incompatibility(video: &StreamDescriptor) -> Option<String> {
    let depth = bit_depth(video.pixel_format.as_deref());
    if depth > 8 {
        return Some(format!("h264 {}-bit", depth));
    }
    if let Some(pix) = video.pixel_format.as_deref() {
        let pix = pix.to_lowercase();
        if pix != "yuv420p" && pix != "yuvj420p" {
            return Some(format!("h264 pixel format {}", pix));
        }
    }
    if video.hdr {
        return Some("h264 HDR".to_string());
    }
    if let Some(profile) = video.profile.as_deref() {
        let profile = profile.to_lowercase();
        if UNSUPPORTED_H264_PROFILES.contains(&profile.as_str()) {
            return Some(format!("h264 profile {}", profile));
        }
    }
    let level = video.level.unwrap_or(0);
    if level > MAX_H264_LEVEL {
        return Some(format!("h264 level {} above 4.1", level));
    }
    None
}

fn decide_video(video: &StreamDescriptor, cfg: &Config) -> (bool, String) {
    if cfg.codec.force_h264 {
        return (true, "h264 forced by configuration".to_string());
    }
    match video.codec.as_str() {
        "h264" => match h264_incompatibility(video) {
            Some(reason) => (true, reason),
            None => (false, "h264 8-bit SDR within level 4.1".to_string()),
        },
        "hevc" | "h265" => {
            let main10 = video
                .profile
                .as_deref()
                .map(|p| p.to_lowercase().contains("main 10"))
                .unwrap_or(false);
            if !cfg.codec.allow_hevc {
                (true, "hevc not allowed".to_string())
            } else if bit_depth(video.pixel_format.as_deref()) > 8 || main10 {
                (true, "hevc 10-bit".to_string())
            } else if video.hdr {
                (true, "hevc HDR".to_string())
            } else {
                (false, "hevc 8-bit SDR allowed".to_string())
            }
        }
        "" => (true, "unknown video codec".to_string()),
        other => (true, format!("video codec {} not supported", other)),
    }
}

fn decide_audio(stream: &StreamDescriptor, cfg: &Config) -> (bool, String) {
    if cfg.codec.force_aac {
        return (true, "aac forced by configuration".to_string());
    }
    let copyable = match stream.codec.as_str() {
        "aac" => true,
        "ac3" | "eac3" => cfg.codec.keep_surround,
        _ => false,
    };
    if copyable {
        (false, format!("{} supported", stream.codec))
    } else {
        (true, format!("audio codec {} not supported", stream.codec))
    }
}

/// Decide what must be transcoded for one input.
///
/// # Arguments
/// * `info` - Probed stream metadata
/// * `cfg` - Resolved configuration
///
/// # Returns
/// * `Ok(Decision)` - identical inputs always give equal decisions
/// * `Err(DecisionError::NoVideoStream)` - the input has no video stream
pub fn decide(info: &StreamInfo, cfg: &Config) -> Result<Decision, DecisionError> {
    let video = info
        .streams_of(StreamKind::Video)
        .next()
        .ok_or(DecisionError::NoVideoStream)?;

    let (needs_video_transcode, video_reason) = decide_video(video, cfg);

    let selected_audio = select_audio_track(info, cfg);
    let selected_stream = selected_audio
        .as_ref()
        .and_then(|selection| info.streams_of(StreamKind::Audio).nth(selection.position));
    let (needs_audio_transcode, audio_reason, add_silence) = match selected_stream {
        Some(stream) => {
            let (transcode, reason) = decide_audio(stream, cfg);
            (transcode, reason, false)
        }
        None if cfg.codec.add_silence_if_no_audio => {
            (false, "no audio, adding silent track".to_string(), true)
        }
        None => (false, "no audio stream".to_string(), false),
    };

    let selected_subtitle = select_subtitle_track(
        info,
        selected_audio.as_ref().and_then(|a| a.language.as_deref()),
        cfg,
    );
    let has_subtitles = info.streams_of(StreamKind::Subtitle).next().is_some();
    // MP4 only carries mov_text, so subtitles are converted there.
    let subtitle_copy = !cfg.tracks.no_subtitles && has_subtitles && cfg.output.container == Container::Mkv;
    let subtitle_reason = if cfg.tracks.no_subtitles {
        "subtitles disabled".to_string()
    } else if let Some(sub) = &selected_subtitle {
        format!(
            "subtitle track {} ({})",
            sub.position,
            sub.language.as_deref().unwrap_or("und")
        )
    } else if has_subtitles {
        "all subtitles kept".to_string()
    } else {
        "no subtitle stream".to_string()
    };
    let subtitle_reason = if has_subtitles && !cfg.tracks.no_subtitles && !subtitle_copy {
        format!("{}, converted to mov_text", subtitle_reason)
    } else {
        subtitle_reason
    };

    Ok(Decision {
        needs_video_transcode,
        needs_audio_transcode,
        audio_copy: selected_audio.is_some() && !needs_audio_transcode,
        subtitle_copy,
        video_copy: !needs_video_transcode,
        selected_audio,
        selected_subtitle,
        add_silence,
        video_reason,
        audio_reason,
        subtitle_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn video(codec: &str) -> StreamDescriptor {
        StreamDescriptor {
            index: 0,
            kind: StreamKind::Video,
            codec: codec.to_string(),
            profile: Some("High".to_string()),
            level: Some(41),
            pixel_format: Some("yuv420p".to_string()),
            ..StreamDescriptor::default()
        }
    }

    fn audio(index: usize, codec: &str, lang: Option<&str>, title: Option<&str>) -> StreamDescriptor {
        StreamDescriptor {
            index,
            kind: StreamKind::Audio,
            codec: codec.to_string(),
            language: lang.map(str::to_string),
            title: title.map(str::to_string),
            channels: Some(2),
            ..StreamDescriptor::default()
        }
    }

    fn subtitle(index: usize, lang: &str, forced: bool, sdh: bool) -> StreamDescriptor {
        StreamDescriptor {
            index,
            kind: StreamKind::Subtitle,
            codec: "subrip".to_string(),
            language: Some(lang.to_string()),
            forced,
            hearing_impaired: sdh,
            ..StreamDescriptor::default()
        }
    }

    fn info(streams: Vec<StreamDescriptor>) -> StreamInfo {
        StreamInfo {
            duration_ms: Some(60_000),
            format_name: "matroska,webm".to_string(),
            size_bytes: 10_000_000,
            streams,
        }
    }

    #[test]
    fn test_compatible_h264_aac_is_copied() {
        let input = info(vec![video("h264"), audio(1, "aac", Some("eng"), None)]);
        let decision = decide(&input, &Config::default()).unwrap();

        assert!(!decision.needs_video_transcode);
        assert!(!decision.needs_audio_transcode);
        assert!(decision.video_copy);
        assert!(decision.audio_copy);
        assert!(decision.is_compatible());
    }

    #[test]
    fn test_no_video_stream_is_error() {
        let input = info(vec![audio(0, "aac", None, None)]);
        assert_eq!(
            decide(&input, &Config::default()),
            Err(DecisionError::NoVideoStream)
        );
    }

    #[test]
    fn test_force_h264_transcodes() {
        let mut cfg = Config::default();
        cfg.codec.force_h264 = true;
        let decision = decide(&info(vec![video("h264")]), &cfg).unwrap();
        assert!(decision.needs_video_transcode);
        assert!(decision.video_reason.contains("forced"));
    }

    #[test]
    fn test_h264_constraints() {
        let cfg = Config::default();

        let mut ten_bit = video("h264");
        ten_bit.pixel_format = Some("yuv420p10le".to_string());
        let d = decide(&info(vec![ten_bit]), &cfg).unwrap();
        assert!(d.needs_video_transcode);
        assert!(d.video_reason.contains("10-bit"));

        let mut high_level = video("h264");
        high_level.level = Some(51);
        let d = decide(&info(vec![high_level]), &cfg).unwrap();
        assert!(d.needs_video_transcode);
        assert!(d.video_reason.contains("level"));

        let mut hdr = video("h264");
        hdr.hdr = true;
        assert!(decide(&info(vec![hdr]), &cfg).unwrap().needs_video_transcode);

        let mut yuv444 = video("h264");
        yuv444.pixel_format = Some("yuv444p".to_string());
        assert!(decide(&info(vec![yuv444]), &cfg).unwrap().needs_video_transcode);

        let mut unknown = video("h264");
        unknown.pixel_format = None;
        unknown.level = None;
        unknown.profile = None;
        assert!(!decide(&info(vec![unknown]), &cfg).unwrap().needs_video_transcode);
    }

    #[test]
    fn test_hevc_requires_allow_flag() {
        let mut hevc = video("hevc");
        hevc.profile = Some("Main".to_string());

        let d = decide(&info(vec![hevc.clone()]), &Config::default()).unwrap();
        assert!(d.needs_video_transcode);

        let mut cfg = Config::default();
        cfg.codec.allow_hevc = true;
        let d = decide(&info(vec![hevc.clone()]), &cfg).unwrap();
        assert!(!d.needs_video_transcode);

        hevc.profile = Some("Main 10".to_string());
        let d = decide(&info(vec![hevc]), &cfg).unwrap();
        assert!(d.needs_video_transcode);
    }

    #[test]
    fn test_av1_transcodes() {
        let d = decide(&info(vec![video("av1")]), &Config::default()).unwrap();
        assert!(d.needs_video_transcode);
        assert!(d.video_reason.contains("av1"));
    }

    #[test]
    fn test_surround_codecs_need_keep_surround() {
        let input = info(vec![video("h264"), audio(1, "eac3", Some("eng"), None)]);

        let d = decide(&input, &Config::default()).unwrap();
        assert!(d.needs_audio_transcode);

        let mut cfg = Config::default();
        cfg.codec.keep_surround = true;
        let d = decide(&input, &cfg).unwrap();
        assert!(!d.needs_audio_transcode);
    }

    #[test]
    fn test_force_aac() {
        let mut cfg = Config::default();
        cfg.codec.force_aac = true;
        let input = info(vec![video("h264"), audio(1, "aac", None, None)]);
        assert!(decide(&input, &cfg).unwrap().needs_audio_transcode);
    }

    #[test]
    fn test_no_audio_without_silence() {
        let d = decide(&info(vec![video("h264")]), &Config::default()).unwrap();
        assert!(!d.needs_audio_transcode);
        assert!(d.selected_audio.is_none());
        assert!(!d.add_silence);
    }

    #[test]
    fn test_no_audio_with_silence() {
        let mut cfg = Config::default();
        cfg.codec.add_silence_if_no_audio = true;
        let d = decide(&info(vec![video("h264")]), &cfg).unwrap();
        assert!(!d.needs_audio_transcode);
        assert!(d.add_silence);
        assert!(d.encodes_audio());
        assert!(!d.is_compatible());
    }

    #[test]
    fn test_audio_language_priority_skips_audio_description() {
        let input = info(vec![
            video("h264"),
            audio(1, "aac", Some("eng"), None),
            audio(2, "aac", Some("fre"), Some("Audio Description")),
            audio(3, "ac3", Some("fre"), Some("VFF 5.1")),
        ]);
        let mut cfg = Config::default();
        cfg.tracks.audio_lang = vec!["fr".to_string(), "eng".to_string()];

        let d = decide(&input, &cfg).unwrap();
        let selected = d.selected_audio.unwrap();
        assert_eq!(selected.index, 3);
        assert_eq!(selected.position, 2);
        assert_eq!(selected.language.as_deref(), Some("fre"));
    }

    #[test]
    fn test_audio_language_falls_back_to_description_track() {
        let input = info(vec![
            video("h264"),
            audio(1, "aac", Some("eng"), None),
            audio(2, "aac", Some("fre"), Some("French AD")),
        ]);
        let mut cfg = Config::default();
        cfg.tracks.audio_lang = vec!["fre".to_string()];

        let d = decide(&input, &cfg).unwrap();
        assert_eq!(d.selected_audio.unwrap().index, 2);
    }

    #[test]
    fn test_explicit_audio_track_wins_over_language() {
        let input = info(vec![
            video("h264"),
            audio(1, "aac", Some("eng"), None),
            audio(2, "aac", Some("fre"), None),
        ]);
        let mut cfg = Config::default();
        cfg.tracks.audio_track = Some(0);
        cfg.tracks.audio_lang = vec!["fre".to_string()];

        assert_eq!(decide(&input, &cfg).unwrap().selected_audio.unwrap().index, 1);
    }

    #[test]
    fn test_out_of_range_audio_track_falls_back() {
        let input = info(vec![video("h264"), audio(1, "aac", Some("eng"), None)]);
        let mut cfg = Config::default();
        cfg.tracks.audio_track = Some(5);
        assert_eq!(decide(&input, &cfg).unwrap().selected_audio.unwrap().index, 1);
    }

    #[test]
    fn test_forced_subtitle_in_audio_language_preferred() {
        let input = info(vec![
            video("h264"),
            audio(1, "aac", Some("fre"), None),
            subtitle(2, "eng", false, false),
            subtitle(3, "fra", true, false),
        ]);
        let d = decide(&input, &Config::default()).unwrap();
        assert_eq!(d.selected_subtitle.unwrap().index, 3);
    }

    #[test]
    fn test_subtitle_language_prefers_non_sdh() {
        let input = info(vec![
            video("h264"),
            subtitle(1, "eng", false, true),
            subtitle(2, "eng", false, false),
        ]);
        let mut cfg = Config::default();
        cfg.tracks.subtitle_lang = vec!["eng".to_string()];
        let d = decide(&input, &cfg).unwrap();
        assert_eq!(d.selected_subtitle.unwrap().index, 2);
    }

    #[test]
    fn test_subtitles_pass_through_without_selection() {
        let input = info(vec![video("h264"), subtitle(1, "eng", false, false)]);
        let d = decide(&input, &Config::default()).unwrap();
        assert!(d.selected_subtitle.is_none());
        assert!(d.subtitle_copy);

        let mut cfg = Config::default();
        cfg.tracks.no_subtitles = true;
        let d = decide(&input, &cfg).unwrap();
        assert!(d.selected_subtitle.is_none());
        assert!(!d.subtitle_copy);
    }

    #[test]
    fn test_mp4_subtitles_are_converted() {
        let input = info(vec![video("h264"), subtitle(1, "eng", false, false)]);
        let mut cfg = Config::default();
        cfg.output.container = Container::Mp4;
        let d = decide(&input, &cfg).unwrap();
        assert!(!d.subtitle_copy);
        assert!(d.subtitle_reason.ends_with("converted to mov_text"), "{}", d.subtitle_reason);
    }

    #[test]
    fn test_is_audio_description() {
        assert!(is_audio_description(Some("Audio Description")));
        assert!(is_audio_description(Some("audiodescription")));
        assert!(is_audio_description(Some("Visual Impaired")));
        assert!(is_audio_description(Some("English AD")));
        assert!(is_audio_description(Some("Track V.I")));
        assert!(!is_audio_description(Some("French Stereo")));
        assert!(!is_audio_description(Some("Dolby Surround")));
        assert!(!is_audio_description(Some("Commentary with Adam")));
        assert!(!is_audio_description(None));
    }

    #[test]
    fn test_bit_depth() {
        assert_eq!(bit_depth(Some("yuv420p")), 8);
        assert_eq!(bit_depth(Some("yuv420p10le")), 10);
        assert_eq!(bit_depth(Some("p010le")), 10);
        assert_eq!(bit_depth(Some("yuv422p12le")), 12);
        assert_eq!(bit_depth(None), 8);
    }

    fn arb_stream() -> impl Strategy<Value = StreamDescriptor> {
        (
            prop_oneof![
                Just(StreamKind::Video),
                Just(StreamKind::Audio),
                Just(StreamKind::Subtitle)
            ],
            prop_oneof![Just("h264"), Just("hevc"), Just("aac"), Just("ac3"), Just("av1")],
            proptest::option::of(prop_oneof![Just("eng"), Just("fre"), Just("jpn")]),
            proptest::bool::ANY,
            proptest::bool::ANY,
            proptest::option::of(0i32..60),
        )
            .prop_map(|(kind, codec, lang, forced, hdr, level)| StreamDescriptor {
                kind,
                codec: codec.to_string(),
                language: lang.map(str::to_string),
                forced,
                hdr,
                level,
                ..StreamDescriptor::default()
            })
    }

    // Property: decide() is deterministic for any stream layout and flags.
    // Property: an h264 SDR 8-bit stream within limits is never transcoded without forcing.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_decide_is_deterministic(
            mut streams in proptest::collection::vec(arb_stream(), 0..8),
            force_h264 in proptest::bool::ANY,
            keep_surround in proptest::bool::ANY,
            prefer_forced in proptest::bool::ANY,
        ) {
            for (i, s) in streams.iter_mut().enumerate() {
                s.index = i;
            }
            let input = info(streams);
            let mut cfg = Config::default();
            cfg.codec.force_h264 = force_h264;
            cfg.codec.keep_surround = keep_surround;
            cfg.tracks.prefer_forced_subs = prefer_forced;
            cfg.tracks.audio_lang = vec!["jpn".to_string()];

            prop_assert_eq!(decide(&input, &cfg), decide(&input, &cfg));
        }

        #[test]
        fn prop_plain_h264_is_copied(level in 0i32..=41, audio_count in 0usize..3) {
            let mut v = video("h264");
            v.level = Some(level);
            let mut streams = vec![v];
            for i in 0..audio_count {
                streams.push(audio(i + 1, "aac", None, None));
            }
            let d = decide(&info(streams), &Config::default()).unwrap();
            prop_assert!(!d.needs_video_transcode);
        }
    }
}
