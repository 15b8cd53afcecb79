pub mod error;
pub mod udp;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::config::{MediaLayout, ShiftcastConfig};
use crate::models::{
    AudioMode, ChannelBundle, InputType, JobPurpose, OutputProfile, OutputTarget, VideoMode,
    DEFAULT_AUDIO_CODEC, DEFAULT_VIDEO_CODEC, MAX_DELAY_SECONDS,
};
use crate::recording::{record_directory, segment_pattern, PlaylistWindowBuilder, SegmentInventory};

pub use error::{BuildError, BuildResult};
pub use udp::resolve_url;

const DEFAULT_GOP_SIZE: u32 = 50;
const DEFAULT_AUDIO_BITRATE_K: u32 = 128;
const MULTICAST_INPUT_TUNING: &str = "fifo_size=1000000&overrun_nonfatal=1";

/// A fully resolved media engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl JobCommand {
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.to_string_lossy().into_owned());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl fmt::Display for JobCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.argv().iter().map(|arg| shell_quote(arg)).collect();
        f.write_str(&rendered.join(" "))
    }
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Turns channel configuration into ffmpeg invocations.
///
/// Building is pure apart from two filesystem effects: a record command
/// creates its output directory, and a delayed playback command rewrites the
/// channel's concat playlist.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    ffmpeg: PathBuf,
    layout: MediaLayout,
    playlists: PlaylistWindowBuilder,
}

impl CommandBuilder {
    pub fn new(ffmpeg: impl Into<PathBuf>, layout: MediaLayout, window_seconds: u64) -> Self {
        let playlists =
            PlaylistWindowBuilder::new(SegmentInventory::new(layout.clone()), window_seconds);
        Self {
            ffmpeg: ffmpeg.into(),
            layout,
            playlists,
        }
    }

    pub fn from_config(config: &ShiftcastConfig) -> Self {
        Self::new(
            config.ffmpeg.binary.clone(),
            config.media_layout(),
            config.playback.playlist_window_seconds,
        )
    }

    pub fn layout(&self) -> &MediaLayout {
        &self.layout
    }

    pub fn build(
        &self,
        bundle: &ChannelBundle,
        purpose: JobPurpose,
        target: Option<&OutputTarget>,
        now: NaiveDateTime,
    ) -> BuildResult<JobCommand> {
        bundle
            .profile
            .validate()
            .map_err(BuildError::Configuration)?;

        let mut args = header_args();
        match purpose {
            JobPurpose::Record => self.record_args(bundle, now, &mut args)?,
            JobPurpose::Playback => {
                let target = target.ok_or_else(|| {
                    BuildError::Configuration(format!(
                        "playback for channel {:?} requires an output target",
                        bundle.channel.name
                    ))
                })?;
                self.playback_args(bundle, target, now, &mut args)?;
            }
        }

        Ok(JobCommand {
            program: self.ffmpeg.clone(),
            args,
        })
    }

    fn record_args(
        &self,
        bundle: &ChannelBundle,
        now: NaiveDateTime,
        args: &mut Vec<String>,
    ) -> BuildResult<()> {
        let channel = &bundle.channel;
        args.extend(self.input_args(bundle)?);
        apply_av_modes(args, &bundle.profile, is_generator(bundle));

        let dir = record_directory(&self.layout, channel, now);
        fs::create_dir_all(&dir).map_err(|err| BuildError::io(&dir, err))?;

        push(args, ["-f", "segment", "-segment_time"]);
        args.push(channel.segment_seconds().to_string());
        push(args, ["-reset_timestamps", "1", "-strftime", "1"]);
        args.push(path_arg(&segment_pattern(&dir, channel)));
        Ok(())
    }

    fn playback_args(
        &self,
        bundle: &ChannelBundle,
        target: &OutputTarget,
        now: NaiveDateTime,
        args: &mut Vec<String>,
    ) -> BuildResult<()> {
        let delay = resolve_delay(bundle)?;
        let destination = resolve_url(&bundle.profile, target)?;

        if delay == 0 {
            args.extend(self.input_args(bundle)?);
            let generator = is_generator(bundle);
            apply_video_mode(args, &bundle.profile, generator);
            if generator {
                push(args, ["-c:a", DEFAULT_AUDIO_CODEC, "-b:a", "128k", "-ac", "2"]);
            } else {
                apply_audio_mode(args, &bundle.profile, false);
            }
        } else {
            let playlist = self.playlists.build_window(&bundle.channel, delay, now)?;
            push(args, ["-re", "-f", "concat", "-safe", "0", "-i"]);
            args.push(path_arg(&playlist));
            // raw read of the already-encoded segments
            push(args, ["-c:v", "copy", "-c:a", "copy"]);
            apply_av_modes(args, &bundle.profile, false);
        }

        push(
            args,
            [
                "-f",
                "mpegts",
                "-mpegts_flags",
                "+resend_headers",
                "-muxdelay",
                "0",
                "-muxpreload",
                "0",
            ],
        );
        args.push(destination);
        Ok(())
    }

    fn input_args(&self, bundle: &ChannelBundle) -> BuildResult<Vec<String>> {
        let channel = &bundle.channel;
        let url = channel.input_url.trim();
        let mut args = Vec::new();

        if channel.input_type == InputType::InternalGenerator {
            push(
                &mut args,
                [
                    "-re",
                    "-f",
                    "lavfi",
                    "-i",
                    "testsrc2=size=1280x720:rate=25",
                    "-f",
                    "lavfi",
                    "-i",
                    "sine=frequency=1000:sample_rate=48000",
                    "-shortest",
                    "-map",
                    "0:v:0",
                    "-map",
                    "1:a:0",
                ],
            );
            return Ok(args);
        }

        if url.is_empty() {
            return Err(BuildError::Configuration(format!(
                "channel {:?} has no input url",
                channel.name
            )));
        }

        match channel.input_type {
            InputType::File => {
                let path = self.layout.resolve(url);
                if bundle.profile.realtime_input {
                    args.push("-re".into());
                }
                if bundle.profile.loop_input {
                    push(&mut args, ["-stream_loop", "-1"]);
                }
                args.push("-i".into());
                args.push(path_arg(&path));
            }
            InputType::MulticastUdp => {
                let mut input = url.to_string();
                if !input.contains("fifo_size=") {
                    input.push(if input.contains('?') { '&' } else { '?' });
                    input.push_str(MULTICAST_INPUT_TUNING);
                }
                args.push("-i".into());
                args.push(input);
            }
            InputType::Rtsp | InputType::Rtmp | InputType::InternalGenerator => {
                args.push("-i".into());
                args.push(url.to_string());
            }
        }
        Ok(args)
    }
}

/// Playback delay for a channel, in seconds.
///
/// An attached time-shift profile wins; otherwise the legacy per-channel
/// delay applies.
pub fn resolve_delay(bundle: &ChannelBundle) -> BuildResult<u32> {
    let delay = match bundle.timeshift {
        Some(profile) => {
            if profile.delay_seconds > 0 && !profile.enabled {
                return Err(BuildError::Configuration(format!(
                    "time-shift profile of channel {:?} is disabled but has a {}s delay",
                    bundle.channel.name, profile.delay_seconds
                )));
            }
            profile.delay_seconds
        }
        None => bundle.channel.timeshift_delay_seconds.unwrap_or(0),
    };
    if delay > MAX_DELAY_SECONDS {
        return Err(BuildError::Configuration(format!(
            "delay of channel {:?} is {delay}s, the maximum is {MAX_DELAY_SECONDS}s",
            bundle.channel.name
        )));
    }
    Ok(delay)
}

/// Codec stage shared by record, live playback and delayed playback.
///
/// A synthetic source cannot be stream-copied, so `internal_generator`
/// forces both streams through the encoders.
pub fn apply_av_modes(args: &mut Vec<String>, profile: &OutputProfile, internal_generator: bool) {
    apply_video_mode(args, profile, internal_generator);
    apply_audio_mode(args, profile, internal_generator);
}

fn apply_video_mode(args: &mut Vec<String>, profile: &OutputProfile, internal_generator: bool) {
    if !internal_generator && profile.video_mode == VideoMode::Copy {
        push(args, ["-c:v", "copy"]);
        return;
    }

    let codec = profile.video_codec();
    push(args, ["-c:v", codec]);

    let mut filters = Vec::new();
    if let (Some(width), Some(height)) = (profile.scale_width, profile.scale_height) {
        filters.push(format!("scale={width}:{height}"));
    }
    if let Some(fps) = profile.fps_limit {
        filters.push(format!("fps={fps}"));
    }
    if !filters.is_empty() {
        args.push("-vf".into());
        args.push(filters.join(","));
    }

    if codec == DEFAULT_VIDEO_CODEC {
        push(args, ["-preset", non_empty(&profile.x264_preset, "veryfast")]);
        push(args, ["-tune", non_empty(&profile.x264_tune, "zerolatency")]);
        push(args, ["-pix_fmt", "yuv420p", "-g"]);
        args.push(profile.gop_size.unwrap_or(DEFAULT_GOP_SIZE).to_string());
        push(args, ["-x264-params", "repeat-headers=1"]);
    }

    for (flag, value) in [
        ("-b:v", profile.video_bitrate_k),
        ("-maxrate", profile.video_maxrate_k),
        ("-bufsize", profile.video_bufsize_k),
    ] {
        if let Some(kbps) = value {
            args.push(flag.into());
            args.push(format!("{kbps}k"));
        }
    }
}

fn apply_audio_mode(args: &mut Vec<String>, profile: &OutputProfile, internal_generator: bool) {
    if !internal_generator && profile.audio_mode == AudioMode::Copy {
        push(args, ["-c:a", "copy"]);
        return;
    }
    if profile.audio_mode == AudioMode::Disable {
        args.push("-an".into());
        return;
    }

    let codec = profile.audio_codec();
    push(args, ["-c:a", codec]);
    if codec == DEFAULT_AUDIO_CODEC {
        let bitrate = profile.audio_bitrate_k.unwrap_or(DEFAULT_AUDIO_BITRATE_K);
        args.push("-b:a".into());
        args.push(format!("{bitrate}k"));
        push(args, ["-ac", "2"]);
    }
}

fn header_args() -> Vec<String> {
    ["-y", "-hide_banner", "-loglevel", "warning"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn is_generator(bundle: &ChannelBundle) -> bool {
    bundle.channel.input_type == InputType::InternalGenerator
}

fn push<const N: usize>(args: &mut Vec<String>, values: [&str; N]) {
    args.extend(values.into_iter().map(String::from));
}

fn non_empty<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value.trim()
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, TimeShiftProfile};
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap()
    }

    fn builder(root: &Path) -> CommandBuilder {
        CommandBuilder::new("ffmpeg", MediaLayout::new(root), 3600)
    }

    fn bundle(input_type: InputType, url: &str) -> ChannelBundle {
        let mut channel = Channel::new(7, "news");
        channel.input_type = input_type;
        channel.input_url = url.to_string();
        ChannelBundle::new(channel, OutputProfile::default_copy())
            .with_target(OutputTarget::new(70, 7, "udp://10.0.0.9:6000"))
    }

    fn joined(command: &JobCommand) -> String {
        command.args.join(" ")
    }

    #[test]
    fn live_copy_playback_uses_stream_copy_and_low_latency_mux() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = bundle(InputType::MulticastUdp, "udp://@239.1.1.1:5000");
        let command = builder(dir.path())
            .build(&bundle, JobPurpose::Playback, bundle.targets.first(), now())
            .unwrap();
        assert_eq!(
            joined(&command),
            "-y -hide_banner -loglevel warning \
             -i udp://@239.1.1.1:5000?fifo_size=1000000&overrun_nonfatal=1 \
             -c:v copy -c:a copy \
             -f mpegts -mpegts_flags +resend_headers -muxdelay 0 -muxpreload 0 \
             udp://10.0.0.9:6000?overrun_nonfatal=1&pkt_size=1316"
        );
        assert_eq!(command.program, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn multicast_input_keeps_explicit_fifo_size() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = bundle(InputType::MulticastUdp, "udp://@239.1.1.1:5000?fifo_size=42");
        let command = builder(dir.path())
            .build(&bundle, JobPurpose::Playback, bundle.targets.first(), now())
            .unwrap();
        assert!(command.args.contains(&"udp://@239.1.1.1:5000?fifo_size=42".to_string()));
    }

    #[test]
    fn playback_without_target_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = bundle(InputType::Rtsp, "rtsp://cam/1");
        let err = builder(dir.path())
            .build(&bundle, JobPurpose::Playback, None, now())
            .unwrap_err();
        assert!(matches!(err, BuildError::Configuration(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn record_writes_strftime_segments_under_template_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut bundle = bundle(InputType::Rtmp, "rtmp://origin/live");
        bundle.channel.recording_segment_minutes = 5;
        let command = builder(dir.path())
            .build(&bundle, JobPurpose::Record, None, now())
            .unwrap();
        let record_dir = dir.path().join("recordings/news/20240501/");
        assert!(record_dir.is_dir());
        let tail: Vec<&str> = command.args[command.args.len() - 9..]
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(
            tail[..8],
            ["-f", "segment", "-segment_time", "300", "-reset_timestamps", "1", "-strftime", "1"]
        );
        assert_eq!(
            PathBuf::from(tail[8]),
            record_dir.join("news_%Y%m%d-%H%M%S.ts")
        );
        assert!(joined(&command).contains("-i rtmp://origin/live -c:v copy -c:a copy"));
    }

    #[test]
    fn file_input_resolves_under_media_root_with_pacing_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut bundle = bundle(InputType::File, "clips/loop.ts");
        bundle.profile.realtime_input = true;
        bundle.profile.loop_input = true;
        let command = builder(dir.path())
            .build(&bundle, JobPurpose::Playback, bundle.targets.first(), now())
            .unwrap();
        let expected = format!(
            "-re -stream_loop -1 -i {}",
            dir.path().join("clips/loop.ts").display()
        );
        assert!(joined(&command).contains(&expected));
    }

    #[test]
    fn internal_generator_is_always_encoded() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = bundle(InputType::InternalGenerator, "");
        let command = builder(dir.path())
            .build(&bundle, JobPurpose::Playback, bundle.targets.first(), now())
            .unwrap();
        let args = joined(&command);
        assert!(args.contains("-f lavfi -i testsrc2=size=1280x720:rate=25"));
        assert!(args.contains(
            "-c:v libx264 -preset veryfast -tune zerolatency -pix_fmt yuv420p -g 50 -x264-params repeat-headers=1"
        ));
        assert!(args.contains("-c:a aac -b:a 128k -ac 2 -f mpegts"));
    }

    #[test]
    fn encode_profile_emits_filters_and_rate_control() {
        let mut profile = OutputProfile::new(3, "hd");
        profile.video_mode = VideoMode::Encode;
        profile.audio_mode = AudioMode::Disable;
        profile.scale_width = Some(1280);
        profile.scale_height = Some(720);
        profile.fps_limit = Some(25);
        profile.gop_size = Some(25);
        profile.video_bitrate_k = Some(3000);
        profile.video_maxrate_k = Some(3500);
        let mut args = Vec::new();
        apply_av_modes(&mut args, &profile, false);
        assert_eq!(
            args.join(" "),
            "-c:v libx264 -vf scale=1280:720,fps=25 -preset veryfast -tune zerolatency \
             -pix_fmt yuv420p -g 25 -x264-params repeat-headers=1 -b:v 3000k -maxrate 3500k -an"
        );
    }

    #[test]
    fn non_default_codecs_skip_x264_and_aac_tuning() {
        let mut profile = OutputProfile::new(3, "hevc");
        profile.video_mode = VideoMode::Encode;
        profile.video_codec = "libx265".into();
        profile.audio_mode = AudioMode::Encode;
        profile.audio_codec = "libopus".into();
        let mut args = Vec::new();
        apply_av_modes(&mut args, &profile, false);
        assert_eq!(args.join(" "), "-c:v libx265 -c:a libopus");
    }

    #[test]
    fn delayed_playback_reads_concat_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let day = dir.path().join("recordings/news/20240501");
        fs::create_dir_all(&day).unwrap();
        fs::write(day.join("news_20240501-114000.ts"), b"x").unwrap();
        let bundle = bundle(InputType::MulticastUdp, "udp://@239.1.1.1:5000").with_timeshift(600);
        let builder = builder(dir.path());
        let command = builder
            .build(&bundle, JobPurpose::Playback, bundle.targets.first(), now())
            .unwrap();
        let playlist = builder.layout().playlist_path(7);
        let expected = format!(
            "-y -hide_banner -loglevel warning -re -f concat -safe 0 -i {} \
             -c:v copy -c:a copy -c:v copy -c:a copy -f mpegts",
            playlist.display()
        );
        assert!(joined(&command).starts_with(&expected));
        assert!(playlist.is_file());
    }

    #[test]
    fn delayed_playback_without_segments_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = bundle(InputType::MulticastUdp, "udp://@239.1.1.1:5000").with_timeshift(600);
        let err = builder(dir.path())
            .build(&bundle, JobPurpose::Playback, bundle.targets.first(), now())
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn delay_resolution_rules() {
        let mut bundle = bundle(InputType::Rtsp, "rtsp://cam/1");
        assert_eq!(resolve_delay(&bundle).unwrap(), 0);

        bundle.channel.timeshift_delay_seconds = Some(90);
        assert_eq!(resolve_delay(&bundle).unwrap(), 90);

        bundle.timeshift = Some(TimeShiftProfile {
            channel_id: 7,
            enabled: false,
            delay_seconds: 0,
        });
        assert_eq!(resolve_delay(&bundle).unwrap(), 0);

        bundle.timeshift = Some(TimeShiftProfile {
            channel_id: 7,
            enabled: false,
            delay_seconds: 30,
        });
        assert!(matches!(resolve_delay(&bundle), Err(BuildError::Configuration(_))));

        bundle.timeshift = Some(TimeShiftProfile {
            channel_id: 7,
            enabled: true,
            delay_seconds: MAX_DELAY_SECONDS + 1,
        });
        assert!(matches!(resolve_delay(&bundle), Err(BuildError::Configuration(_))));
    }

    #[test]
    fn invalid_profile_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut bundle = bundle(InputType::Rtsp, "rtsp://cam/1");
        bundle.profile.scale_height = Some(720);
        let err = builder(dir.path())
            .build(&bundle, JobPurpose::Record, None, now())
            .unwrap_err();
        assert!(matches!(err, BuildError::Configuration(_)));
    }

    #[test]
    fn display_quotes_unsafe_arguments() {
        let command = JobCommand {
            program: PathBuf::from("ffmpeg"),
            args: vec!["-i".into(), "/m/a b.ts".into(), "udp://1.2.3.4:5?x=1&y=2".into()],
        };
        assert_eq!(
            command.to_string(),
            "ffmpeg -i '/m/a b.ts' 'udp://1.2.3.4:5?x=1&y=2'"
        );
    }
}
