//! Command builder for ffmpeg transcodes.
//!
//! Turns a [`Decision`], a [`Backend`] and the quality settings into the
//! ffmpeg argument vector and the stage label shown while it runs. Also owns
//! output naming: `<stem><tags><suffix>.<ext>` with a temp sibling
//! `<stem><tags><suffix>.tmp-<job id>.<ext>` in the same directory.

use crate::backend::Backend;
use crate::config::{Config, Container, QualityProfile};
use crate::decision::Decision;
use crate::progress::Stage;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Silent stereo source used when the input has no audio.
const SILENCE_SOURCE: &str = "anullsrc=channel_layout=stereo:sample_rate=48000";

/// Resolved encoder quality knobs for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualitySettings {
    /// x264 preset
    pub preset: String,
    pub crf: u8,
    /// NVENC preset, p1 (fastest) to p7
    pub nvenc_preset: String,
    pub nvenc_cq: u8,
    pub qsv_quality: u8,
    pub vaapi_qp: u8,
    pub amf_qp: u8,
}

impl QualitySettings {
    /// Preset values for a named profile.
    pub fn for_profile(profile: QualityProfile) -> Self {
        let (preset, crf, nvenc_preset, hw_quality) = match profile {
            QualityProfile::Fast => ("veryfast", 23, "p2", 26),
            QualityProfile::Balanced => ("slow", 20, "p4", 23),
            QualityProfile::Quality => ("slower", 18, "p6", 20),
        };
        Self {
            preset: preset.to_string(),
            crf,
            nvenc_preset: nvenc_preset.to_string(),
            nvenc_cq: hw_quality,
            qsv_quality: hw_quality,
            vaapi_qp: hw_quality,
            amf_qp: hw_quality,
        }
    }

    /// Profile values with explicit `[encoding]` overrides applied.
    pub fn resolve(cfg: &Config) -> Self {
        let enc = &cfg.encoding;
        let mut settings = Self::for_profile(enc.profile);

        if let Some(preset) = &enc.preset {
            settings.preset = preset.clone();
            settings.nvenc_preset = nvenc_preset_for(preset).to_string();
        }
        if let Some(crf) = enc.crf {
            settings.crf = crf;
        }
        if let Some(cq) = enc.nvenc_cq {
            settings.nvenc_cq = cq;
        }
        if let Some(q) = enc.qsv_quality {
            settings.qsv_quality = q;
        }
        if let Some(qp) = enc.vaapi_qp {
            settings.vaapi_qp = qp;
        }
        if let Some(qp) = enc.amf_qp {
            settings.amf_qp = qp;
        }
        settings
    }
}

/// Map an x264 preset name onto the NVENC p1..p7 scale.
fn nvenc_preset_for(preset: &str) -> &'static str {
    match preset {
        "ultrafast" => "p1",
        "superfast" => "p2",
        "veryfast" => "p3",
        "faster" | "fast" => "p4",
        "medium" => "p5",
        "slow" => "p6",
        "slower" | "veryslow" => "p7",
        _ => "p4",
    }
}

/// A ready-to-run transcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeCommand {
    /// Full argument vector, program first.
    pub argv: Vec<String>,
    pub stage: Stage,
}

impl TranscodeCommand {
    /// Shell-style rendering for logs and dry runs.
    pub fn display(&self) -> String {
        self.argv
            .iter()
            .map(|arg| {
                if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '\'') {
                    format!("'{}'", arg.replace('\'', r"'\''"))
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Stage label for a decision.
pub fn stage_for(decision: &Decision) -> Stage {
    if decision.needs_video_transcode {
        Stage::Transcode
    } else if decision.encodes_audio() {
        Stage::Audio
    } else {
        Stage::Remux
    }
}

/// Filename tag describing what was re-encoded, e.g. `.h264.aac` or `.remux`.
pub fn output_tag(decision: &Decision) -> String {
    let mut tag = String::new();
    if decision.needs_video_transcode {
        tag.push_str(".h264");
    }
    if decision.encodes_audio() {
        tag.push_str(".aac");
    }
    if tag.is_empty() {
        tag.push_str(".remux");
    }
    tag
}

/// Final output path for an input.
///
/// # Arguments
/// * `input` - Source file
/// * `decision` - Decision for the source, used for the filename tag
/// * `cfg` - Supplies suffix and container
/// * `output_dir` - Destination directory; the input's directory when `None`
pub fn output_path(input: &Path, decision: &Decision, cfg: &Config, output_dir: Option<&Path>) -> PathBuf {
    let dir = output_dir
        .map(Path::to_path_buf)
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    let stem = input.file_stem().map(OsString::from).unwrap_or_default();

    let mut name = stem;
    name.push(output_tag(decision));
    name.push(&cfg.output.suffix);
    name.push(".");
    name.push(cfg.output.container.extension());
    dir.join(name)
}

/// Temp path next to `final_path`: `.tmp-<job id>` inserted before the extension.
///
/// Keyed by job so concurrent runs over the same directory never share a
/// temp file.
pub fn temp_path(final_path: &Path, job_id: Uuid) -> PathBuf {
    let stem = final_path.file_stem().map(OsString::from).unwrap_or_default();
    let mut name = stem;
    name.push(format!(".tmp-{}", job_id.simple()));
    if let Some(ext) = final_path.extension() {
        name.push(".");
        name.push(ext);
    }
    final_path.with_file_name(name)
}

fn push_all(argv: &mut Vec<String>, args: &[&str]) {
    argv.extend(args.iter().map(|s| s.to_string()));
}

/// Backend-specific video encoder arguments.
pub fn video_args(backend: Backend, quality: &QualitySettings, cfg: &Config) -> Vec<String> {
    let mut args = Vec::new();
    match backend {
        Backend::Nvenc => {
            push_all(&mut args, &["-c:v", "h264_nvenc", "-preset"]);
            args.push(quality.nvenc_preset.clone());
            args.push("-cq".to_string());
            args.push(quality.nvenc_cq.to_string());
            push_all(&mut args, &["-rc", "vbr", "-b:v", "0"]);
        }
        Backend::Amf => {
            push_all(&mut args, &["-c:v", "h264_amf", "-rc", "cqp", "-qp_i"]);
            args.push(quality.amf_qp.to_string());
            args.push("-qp_p".to_string());
            args.push(quality.amf_qp.to_string());
        }
        Backend::Qsv => {
            push_all(&mut args, &["-vf", "format=nv12", "-c:v", "h264_qsv", "-global_quality"]);
            args.push(quality.qsv_quality.to_string());
        }
        Backend::Vaapi => {
            args.push("-vaapi_device".to_string());
            args.push(cfg.encoding.vaapi_device.display().to_string());
            push_all(&mut args, &["-vf", "format=nv12,hwupload", "-c:v", "h264_vaapi", "-qp"]);
            args.push(quality.vaapi_qp.to_string());
        }
        Backend::Cpu => {
            push_all(&mut args, &["-c:v", "libx264", "-preset"]);
            args.push(quality.preset.clone());
            args.push("-crf".to_string());
            args.push(quality.crf.to_string());
            push_all(&mut args, &["-pix_fmt", "yuv420p"]);
        }
    }
    push_all(&mut args, &["-profile:v", "high", "-level", "4.1"]);
    args
}

/// Build the ffmpeg command for one job.
///
/// Pure and deterministic: the same arguments always yield the same argv,
/// and nothing on disk is touched.
///
/// # Arguments
/// * `input` - Source file
/// * `decision` - What to re-encode and which tracks to keep
/// * `backend` - Video encoder family
/// * `output_tmp` - Temp path the encoder writes to
/// * `cfg` - Resolved configuration
pub fn build(
    input: &Path,
    decision: &Decision,
    backend: Backend,
    output_tmp: &Path,
    cfg: &Config,
) -> TranscodeCommand {
    let container = cfg.output.container;
    let mut argv = vec![cfg.encoding.ffmpeg_path.display().to_string()];
    push_all(&mut argv, &["-hide_banner", "-nostdin", "-y", "-stats"]);

    argv.push("-i".to_string());
    argv.push(input.display().to_string());
    if decision.add_silence {
        push_all(&mut argv, &["-f", "lavfi", "-i", SILENCE_SOURCE]);
    }

    // Stream maps
    push_all(&mut argv, &["-map", "0:v:0"]);
    if decision.add_silence {
        push_all(&mut argv, &["-map", "1:a:0", "-shortest"]);
    } else if let Some(audio) = &decision.selected_audio {
        argv.push("-map".to_string());
        argv.push(format!("0:{}", audio.index));
    }
    if !cfg.tracks.no_subtitles {
        argv.push("-map".to_string());
        match &decision.selected_subtitle {
            Some(sub) => argv.push(format!("0:{}", sub.index)),
            None => argv.push("0:s?".to_string()),
        }
    }
    let attachments = cfg.output.preserve_attachments && container == Container::Mkv;
    if attachments {
        push_all(&mut argv, &["-map", "0:t?"]);
    }

    // Codecs
    if decision.needs_video_transcode {
        argv.extend(video_args(backend, &QualitySettings::resolve(cfg), cfg));
    } else {
        push_all(&mut argv, &["-c:v", "copy"]);
    }

    if decision.add_silence {
        push_all(&mut argv, &["-c:a", "aac", "-b:a"]);
        argv.push(cfg.encoding.audio_bitrate.clone());
        push_all(&mut argv, &["-ac", "2"]);
    } else if decision.selected_audio.is_some() {
        if decision.needs_audio_transcode {
            push_all(&mut argv, &["-c:a", "aac", "-b:a"]);
            argv.push(cfg.encoding.audio_bitrate.clone());
            if !cfg.codec.keep_surround {
                push_all(&mut argv, &["-ac", "2"]);
            }
        } else {
            push_all(&mut argv, &["-c:a", "copy"]);
        }
    }

    if !cfg.tracks.no_subtitles {
        match container {
            Container::Mkv => push_all(&mut argv, &["-c:s", "copy"]),
            Container::Mp4 => push_all(&mut argv, &["-c:s", "mov_text"]),
        }
    }
    if attachments {
        push_all(&mut argv, &["-c:t", "copy"]);
    }

    // Metadata
    let metadata = if cfg.output.preserve_metadata { "0" } else { "-1" };
    let chapters = if cfg.output.preserve_chapters { "0" } else { "-1" };
    push_all(&mut argv, &["-map_metadata", metadata, "-map_chapters", chapters]);
    push_all(&mut argv, &["-max_muxing_queue_size", "2048"]);

    if cfg.disk_guard.enabled {
        if let Some(quota) = cfg.disk_guard.max_output_bytes {
            argv.push("-fs".to_string());
            argv.push(quota.to_string());
        }
    }

    // Muxer
    match container {
        Container::Mkv => push_all(&mut argv, &["-f", "matroska"]),
        Container::Mp4 => push_all(&mut argv, &["-f", "mp4", "-movflags", "+faststart"]),
    }
    argv.push(output_tmp.display().to_string());

    TranscodeCommand {
        argv,
        stage: stage_for(decision),
    }
}

/// Arguments for a full decode of the first video stream, used by deep integrity checks.
pub fn deep_check_args(input: &Path, cfg: &Config) -> Vec<String> {
    let mut argv = vec![cfg.encoding.ffmpeg_path.display().to_string()];
    push_all(&mut argv, &["-hide_banner", "-nostdin", "-loglevel", "error", "-i"]);
    argv.push(input.display().to_string());
    push_all(&mut argv, &["-map", "0:v:0", "-f", "null", "-"]);
    argv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::TrackSelection;
    use proptest::prelude::*;

    fn decision(video: bool, audio: bool) -> Decision {
        Decision {
            needs_video_transcode: video,
            needs_audio_transcode: audio,
            selected_audio: Some(TrackSelection {
                index: 1,
                position: 0,
                language: Some("eng".to_string()),
            }),
            selected_subtitle: None,
            add_silence: false,
            video_reason: String::new(),
            audio_reason: String::new(),
            subtitle_reason: String::new(),
            video_copy: !video,
            audio_copy: !audio,
            subtitle_copy: true,
        }
    }

    /// Helper returning the value following `flag` in argv.
    fn arg_after<'a>(argv: &'a [String], flag: &str) -> Option<&'a str> {
        argv.iter()
            .position(|a| a == flag)
            .and_then(|i| argv.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_output_path_tags() {
        let cfg = Config::default();
        let input = Path::new("/media/movie.mkv");

        assert_eq!(
            output_path(input, &decision(true, true), &cfg, None),
            PathBuf::from("/media/movie.h264.aac.cast.mkv")
        );
        assert_eq!(
            output_path(input, &decision(true, false), &cfg, None),
            PathBuf::from("/media/movie.h264.cast.mkv")
        );
        assert_eq!(
            output_path(input, &decision(false, false), &cfg, Some(Path::new("/out"))),
            PathBuf::from("/out/movie.remux.cast.mkv")
        );
    }

    #[test]
    fn test_output_path_mp4_container() {
        let mut cfg = Config::default();
        cfg.output.container = Container::Mp4;
        cfg.output.suffix = ".tv".to_string();
        assert_eq!(
            output_path(Path::new("show.s01e01.mkv"), &decision(false, true), &cfg, None),
            PathBuf::from("show.s01e01.aac.tv.mp4")
        );
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let id = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        let tmp = temp_path(Path::new("/media/movie.h264.aac.cast.mkv"), id);
        assert_eq!(
            tmp,
            PathBuf::from("/media/movie.h264.aac.cast.tmp-67e5504410b1426f9247bb680e5fe0c8.mkv")
        );
    }

    #[test]
    fn test_temp_paths_differ_per_job() {
        let final_path = Path::new("/media/movie.h264.aac.cast.mkv");
        assert_ne!(
            temp_path(final_path, Uuid::new_v4()),
            temp_path(final_path, Uuid::new_v4())
        );
    }

    #[test]
    fn test_stage_labels() {
        assert_eq!(stage_for(&decision(true, true)), Stage::Transcode);
        assert_eq!(stage_for(&decision(true, false)), Stage::Transcode);
        assert_eq!(stage_for(&decision(false, true)), Stage::Audio);
        assert_eq!(stage_for(&decision(false, false)), Stage::Remux);
    }

    #[test]
    fn test_cpu_build() {
        let cfg = Config::default();
        let cmd = build(
            Path::new("in.mkv"),
            &decision(true, true),
            Backend::Cpu,
            Path::new("out.tmp.mkv"),
            &cfg,
        );
        let argv = &cmd.argv;

        assert_eq!(argv[0], "ffmpeg");
        assert_eq!(arg_after(argv, "-i"), Some("in.mkv"));
        assert_eq!(arg_after(argv, "-c:v"), Some("libx264"));
        assert_eq!(arg_after(argv, "-preset"), Some("slow"));
        assert_eq!(arg_after(argv, "-crf"), Some("20"));
        assert_eq!(arg_after(argv, "-profile:v"), Some("high"));
        assert_eq!(arg_after(argv, "-level"), Some("4.1"));
        assert_eq!(arg_after(argv, "-c:a"), Some("aac"));
        assert_eq!(arg_after(argv, "-b:a"), Some("192k"));
        assert_eq!(arg_after(argv, "-ac"), Some("2"));
        assert_eq!(arg_after(argv, "-c:s"), Some("copy"));
        assert_eq!(arg_after(argv, "-map_metadata"), Some("0"));
        assert!(argv.windows(2).any(|w| w[0] == "-map" && w[1] == "0:1"));
        assert!(argv.windows(2).any(|w| w[0] == "-map" && w[1] == "0:s?"));
        assert!(!argv.contains(&"-fs".to_string()));
        assert_eq!(argv.last().map(String::as_str), Some("out.tmp.mkv"));
        assert_eq!(cmd.stage, Stage::Transcode);
    }

    #[test]
    fn test_hardware_backends() {
        let cfg = Config::default();
        let input = Path::new("in.mkv");
        let out = Path::new("out.tmp.mkv");
        let d = decision(true, false);

        let nvenc = build(input, &d, Backend::Nvenc, out, &cfg).argv;
        assert_eq!(arg_after(&nvenc, "-c:v"), Some("h264_nvenc"));
        assert_eq!(arg_after(&nvenc, "-preset"), Some("p4"));
        assert_eq!(arg_after(&nvenc, "-cq"), Some("23"));

        let amf = build(input, &d, Backend::Amf, out, &cfg).argv;
        assert_eq!(arg_after(&amf, "-c:v"), Some("h264_amf"));
        assert_eq!(arg_after(&amf, "-rc"), Some("cqp"));
        assert_eq!(arg_after(&amf, "-qp_p"), Some("23"));

        let qsv = build(input, &d, Backend::Qsv, out, &cfg).argv;
        assert_eq!(arg_after(&qsv, "-global_quality"), Some("23"));

        let vaapi = build(input, &d, Backend::Vaapi, out, &cfg).argv;
        assert_eq!(arg_after(&vaapi, "-vaapi_device"), Some("/dev/dri/renderD128"));
        assert_eq!(arg_after(&vaapi, "-vf"), Some("format=nv12,hwupload"));
        assert_eq!(arg_after(&vaapi, "-c:a"), Some("copy"));
    }

    #[test]
    fn test_explicit_overrides_beat_profile() {
        let mut cfg = Config::default();
        cfg.encoding.profile = QualityProfile::Fast;
        cfg.encoding.crf = Some(17);
        cfg.encoding.preset = Some("medium".to_string());

        let settings = QualitySettings::resolve(&cfg);
        assert_eq!(settings.crf, 17);
        assert_eq!(settings.preset, "medium");
        assert_eq!(settings.nvenc_preset, "p5");
        assert_eq!(settings.nvenc_cq, 26);
    }

    #[test]
    fn test_copy_remux_mp4() {
        let mut cfg = Config::default();
        cfg.output.container = Container::Mp4;
        cfg.output.preserve_chapters = false;
        let cmd = build(
            Path::new("in.mkv"),
            &decision(false, false),
            Backend::Cpu,
            Path::new("out.tmp.mp4"),
            &cfg,
        );
        let argv = &cmd.argv;

        assert_eq!(arg_after(argv, "-c:v"), Some("copy"));
        assert_eq!(arg_after(argv, "-c:a"), Some("copy"));
        assert_eq!(arg_after(argv, "-c:s"), Some("mov_text"));
        assert_eq!(arg_after(argv, "-map_chapters"), Some("-1"));
        assert_eq!(arg_after(argv, "-movflags"), Some("+faststart"));
        assert_eq!(cmd.stage, Stage::Remux);
    }

    #[test]
    fn test_silence_and_quota() {
        let mut cfg = Config::default();
        cfg.disk_guard.max_output_bytes = Some(5_000_000);
        cfg.tracks.no_subtitles = true;
        let mut d = decision(false, false);
        d.selected_audio = None;
        d.add_silence = true;

        let cmd = build(Path::new("in.mkv"), &d, Backend::Cpu, Path::new("o.tmp.mkv"), &cfg);
        let argv = &cmd.argv;

        assert!(argv.contains(&SILENCE_SOURCE.to_string()));
        assert!(argv.windows(2).any(|w| w[0] == "-map" && w[1] == "1:a:0"));
        assert!(!argv.iter().any(|a| a == "0:s?"));
        assert!(!argv.iter().any(|a| a == "-c:s"));
        assert_eq!(arg_after(argv, "-fs"), Some("5000000"));
        assert_eq!(cmd.stage, Stage::Audio);
    }

    #[test]
    fn test_selected_subtitle_and_attachments() {
        let mut cfg = Config::default();
        cfg.output.preserve_attachments = true;
        let mut d = decision(false, false);
        d.selected_subtitle = Some(TrackSelection {
            index: 4,
            position: 1,
            language: None,
        });
        let argv = build(Path::new("in.mkv"), &d, Backend::Cpu, Path::new("o.tmp.mkv"), &cfg).argv;

        assert!(argv.windows(2).any(|w| w[0] == "-map" && w[1] == "0:4"));
        assert!(argv.windows(2).any(|w| w[0] == "-map" && w[1] == "0:t?"));
        assert_eq!(arg_after(&argv, "-c:t"), Some("copy"));
    }

    #[test]
    fn test_display_quotes_spaces() {
        let cmd = TranscodeCommand {
            argv: vec!["ffmpeg".into(), "-i".into(), "My Movie.mkv".into()],
            stage: Stage::Remux,
        };
        assert_eq!(cmd.display(), "ffmpeg -i 'My Movie.mkv'");
    }

    // Property: build() is deterministic and always ends with the temp path.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_build_deterministic(
            video in proptest::bool::ANY,
            audio in proptest::bool::ANY,
            backend in prop_oneof![
                Just(Backend::Nvenc),
                Just(Backend::Amf),
                Just(Backend::Qsv),
                Just(Backend::Vaapi),
                Just(Backend::Cpu)
            ],
            name in "[a-z]{1,12}",
        ) {
            let cfg = Config::default();
            let input = PathBuf::from(format!("/in/{}.mkv", name));
            let d = decision(video, audio);
            let final_path = output_path(&input, &d, &cfg, None);
            let tmp = temp_path(&final_path, Uuid::new_v4());

            let a = build(&input, &d, backend, &tmp, &cfg);
            let b = build(&input, &d, backend, &tmp, &cfg);
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.argv.last().cloned(), Some(tmp.display().to_string()));
            prop_assert_eq!(tmp.parent(), final_path.parent());
        }
    }
}
