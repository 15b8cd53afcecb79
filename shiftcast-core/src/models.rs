use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

pub const MAX_DELAY_SECONDS: u32 = 24 * 60 * 60;
pub const DEFAULT_VIDEO_CODEC: &str = "libx264";
pub const DEFAULT_AUDIO_CODEC: &str = "aac";
pub const DEFAULT_COPY_PROFILE_NAME: &str = "Default (Copy)";

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    #[serde(rename = "udp_multicast")]
    MulticastUdp,
    Rtsp,
    Rtmp,
    File,
    #[serde(rename = "internal_gen")]
    InternalGenerator,
}

string_enum!(InputType {
    MulticastUdp => "udp_multicast",
    Rtsp => "rtsp",
    Rtmp => "rtmp",
    File => "file",
    InternalGenerator => "internal_gen",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoMode {
    #[default]
    Copy,
    Encode,
}

string_enum!(VideoMode {
    Copy => "copy",
    Encode => "encode",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioMode {
    #[default]
    Copy,
    Encode,
    Disable,
}

string_enum!(AudioMode {
    Copy => "copy",
    Encode => "encode",
    Disable => "disable",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPurpose {
    Record,
    Playback,
}

string_enum!(JobPurpose {
    Record => "record",
    Playback => "playback",
});

/// Identity of one supervised unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct JobKey {
    pub purpose: JobPurpose,
    pub channel_id: i64,
    pub target_id: Option<i64>,
}

impl JobKey {
    pub fn record(channel_id: i64) -> Self {
        Self {
            purpose: JobPurpose::Record,
            channel_id,
            target_id: None,
        }
    }

    pub fn playback(channel_id: i64, target_id: i64) -> Self {
        Self {
            purpose: JobPurpose::Playback,
            channel_id,
            target_id: Some(target_id),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target_id {
            Some(target) => write!(f, "ch{}/{}/t{}", self.channel_id, self.purpose, target),
            None => write!(f, "ch{}/{}", self.channel_id, self.purpose),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weekdays {
    pub monday: bool,
    pub tuesday: bool,
    pub wednesday: bool,
    pub thursday: bool,
    pub friday: bool,
    pub saturday: bool,
    pub sunday: bool,
}

impl Weekdays {
    pub const ALL: Weekdays = Weekdays {
        monday: true,
        tuesday: true,
        wednesday: true,
        thursday: true,
        friday: true,
        saturday: true,
        sunday: true,
    };

    pub fn includes(&self, day: Weekday) -> bool {
        match day {
            Weekday::Mon => self.monday,
            Weekday::Tue => self.tuesday,
            Weekday::Wed => self.wednesday,
            Weekday::Thu => self.thursday,
            Weekday::Fri => self.friday,
            Weekday::Sat => self.saturday,
            Weekday::Sun => self.sunday,
        }
    }

    pub fn includes_date(&self, date: NaiveDate) -> bool {
        self.includes(date.weekday())
    }

    pub fn labels(&self) -> Vec<&'static str> {
        [
            (self.monday, "Mon"),
            (self.tuesday, "Tue"),
            (self.wednesday, "Wed"),
            (self.thursday, "Thu"),
            (self.friday, "Fri"),
            (self.saturday, "Sat"),
            (self.sunday, "Sun"),
        ]
        .into_iter()
        .filter_map(|(on, label)| on.then_some(label))
        .collect()
    }
}

impl Default for Weekdays {
    fn default() -> Self {
        Self::ALL
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WeeklySchedule {
    pub days: Weekdays,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl WeeklySchedule {
    pub fn summary(&self) -> String {
        let days = self.days.labels();
        let days = if days.is_empty() {
            "-".to_string()
        } else {
            days.join(",")
        };
        let window = match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => {
                format!("{}–{}", start.format("%H:%M"), end.format("%H:%M"))
            }
            _ => "Full day".to_string(),
        };
        let from = self
            .date_from
            .map(|date| date.to_string())
            .unwrap_or_else(|| "any".to_string());
        let to = self
            .date_to
            .map(|date| date.to_string())
            .unwrap_or_else(|| "any".to_string());
        format!("{days} {window} [{from} → {to}]")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub enabled: bool,
    pub keep_last_segments: Option<u32>,
    pub max_age_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub input_type: InputType,
    pub input_url: String,
    pub output_profile_id: Option<i64>,
    pub recording_path_template: String,
    pub recording_segment_minutes: u32,
    pub retention: RetentionPolicy,
    pub schedule: WeeklySchedule,
    pub playback_tail_enabled: bool,
    /// Legacy delay, consulted only when the channel has no time-shift profile.
    pub timeshift_delay_seconds: Option<u32>,
}

impl Channel {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            enabled: true,
            input_type: InputType::MulticastUdp,
            input_url: "udp://@239.0.0.1:5000".to_string(),
            output_profile_id: None,
            recording_path_template: "recordings/{channel}/{date}/".to_string(),
            recording_segment_minutes: 60,
            retention: RetentionPolicy::default(),
            schedule: WeeklySchedule::default(),
            playback_tail_enabled: false,
            timeshift_delay_seconds: None,
        }
    }

    pub fn segment_seconds(&self) -> u64 {
        u64::from(self.recording_segment_minutes) * 60
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let input_type: String = row.get("input_type")?;
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            enabled: row.get("enabled")?,
            input_type: parse_column("input_type", &input_type)?,
            input_url: row.get("input_url")?,
            output_profile_id: row.get("output_profile_id")?,
            recording_path_template: row.get("recording_path_template")?,
            recording_segment_minutes: row.get("recording_segment_minutes")?,
            retention: RetentionPolicy {
                enabled: row.get("auto_delete_enabled")?,
                keep_last_segments: row.get("auto_delete_after_segments")?,
                max_age_days: row.get("auto_delete_after_days")?,
            },
            schedule: WeeklySchedule {
                days: Weekdays {
                    monday: row.get("monday")?,
                    tuesday: row.get("tuesday")?,
                    wednesday: row.get("wednesday")?,
                    thursday: row.get("thursday")?,
                    friday: row.get("friday")?,
                    saturday: row.get("saturday")?,
                    sunday: row.get("sunday")?,
                },
                start_time: row.get("start_time")?,
                end_time: row.get("end_time")?,
                date_from: row.get("date_from")?,
                date_to: row.get("date_to")?,
            },
            playback_tail_enabled: row.get("playback_tail_enabled")?,
            timeshift_delay_seconds: row.get("timeshift_delay_seconds")?,
        })
    }
}

/// How a channel's stream is produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputProfile {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
    pub video_mode: VideoMode,
    pub video_codec: String,
    pub audio_mode: AudioMode,
    pub audio_codec: String,
    pub realtime_input: bool,
    pub loop_input: bool,
    pub video_bitrate_k: Option<u32>,
    pub video_maxrate_k: Option<u32>,
    pub video_bufsize_k: Option<u32>,
    pub x264_preset: String,
    pub x264_tune: String,
    pub gop_size: Option<u32>,
    pub scale_width: Option<u32>,
    pub scale_height: Option<u32>,
    pub fps_limit: Option<u32>,
    pub audio_bitrate_k: Option<u32>,
    pub default_pkt_size: Option<u32>,
    pub default_overrun_nonfatal: bool,
    pub default_ttl: Option<u32>,
}

impl OutputProfile {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            is_active: true,
            video_mode: VideoMode::Copy,
            video_codec: DEFAULT_VIDEO_CODEC.to_string(),
            audio_mode: AudioMode::Copy,
            audio_codec: DEFAULT_AUDIO_CODEC.to_string(),
            realtime_input: false,
            loop_input: false,
            video_bitrate_k: None,
            video_maxrate_k: None,
            video_bufsize_k: None,
            x264_preset: "veryfast".to_string(),
            x264_tune: "zerolatency".to_string(),
            gop_size: None,
            scale_width: None,
            scale_height: None,
            fps_limit: None,
            audio_bitrate_k: None,
            default_pkt_size: None,
            default_overrun_nonfatal: true,
            default_ttl: None,
        }
    }

    /// The stream-copy profile used by channels without an explicit profile.
    pub fn default_copy() -> Self {
        Self {
            default_pkt_size: Some(1316),
            ..Self::new(0, DEFAULT_COPY_PROFILE_NAME)
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.scale_width.is_some() != self.scale_height.is_some() {
            return Err(format!(
                "profile {:?}: scale_width and scale_height must be set together",
                self.name
            ));
        }
        if self.default_ttl.is_some_and(|ttl| ttl > 255) {
            return Err(format!("profile {:?}: default_ttl exceeds 255", self.name));
        }
        Ok(())
    }

    pub fn video_codec(&self) -> &str {
        non_empty_or(&self.video_codec, DEFAULT_VIDEO_CODEC)
    }

    pub fn audio_codec(&self) -> &str {
        non_empty_or(&self.audio_codec, DEFAULT_AUDIO_CODEC)
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let video_mode: String = row.get("video_mode")?;
        let audio_mode: String = row.get("audio_mode")?;
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            is_active: row.get("is_active")?,
            video_mode: parse_column("video_mode", &video_mode)?,
            video_codec: row.get("video_codec")?,
            audio_mode: parse_column("audio_mode", &audio_mode)?,
            audio_codec: row.get("audio_codec")?,
            realtime_input: row.get("realtime_input")?,
            loop_input: row.get("loop_input")?,
            video_bitrate_k: row.get("video_bitrate_k")?,
            video_maxrate_k: row.get("video_maxrate_k")?,
            video_bufsize_k: row.get("video_bufsize_k")?,
            x264_preset: row.get("x264_preset")?,
            x264_tune: row.get("x264_tune")?,
            gop_size: row.get("gop_size")?,
            scale_width: row.get("scale_width")?,
            scale_height: row.get("scale_height")?,
            fps_limit: row.get("fps_limit")?,
            audio_bitrate_k: row.get("audio_bitrate_k")?,
            default_pkt_size: row.get("default_pkt_size")?,
            default_overrun_nonfatal: row.get("default_overrun_nonfatal")?,
            default_ttl: row.get("default_ttl")?,
        })
    }
}

/// Where a channel's stream is sent. `None` overrides inherit the profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTarget {
    pub id: i64,
    pub channel_id: i64,
    pub name: String,
    pub enabled: bool,
    pub protocol: String,
    pub target_url: String,
    pub pkt_size: Option<u32>,
    pub overrun_nonfatal: Option<bool>,
    pub fifo_size: Option<u32>,
    pub buffer_size: Option<u32>,
    pub ttl: Option<u32>,
}

impl OutputTarget {
    pub fn new(id: i64, channel_id: i64, target_url: impl Into<String>) -> Self {
        Self {
            id,
            channel_id,
            name: "Target".to_string(),
            enabled: true,
            protocol: "udp_mpegts".to_string(),
            target_url: target_url.into(),
            pkt_size: None,
            overrun_nonfatal: None,
            fifo_size: None,
            buffer_size: None,
            ttl: None,
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            channel_id: row.get("channel_id")?,
            name: row.get("name")?,
            enabled: row.get("enabled")?,
            protocol: row.get("protocol")?,
            target_url: row.get("target_url")?,
            pkt_size: row.get("pkt_size")?,
            overrun_nonfatal: row.get("overrun_nonfatal")?,
            fifo_size: row.get("fifo_size")?,
            buffer_size: row.get("buffer_size")?,
            ttl: row.get("ttl")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeShiftProfile {
    pub channel_id: i64,
    pub enabled: bool,
    pub delay_seconds: u32,
}

impl TimeShiftProfile {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            channel_id: row.get("channel_id")?,
            enabled: row.get("enabled")?,
            delay_seconds: row.get("delay_seconds")?,
        })
    }
}

/// A channel together with everything needed to run it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelBundle {
    pub channel: Channel,
    pub profile: OutputProfile,
    pub timeshift: Option<TimeShiftProfile>,
    pub targets: Vec<OutputTarget>,
}

impl ChannelBundle {
    pub fn new(channel: Channel, profile: OutputProfile) -> Self {
        Self {
            channel,
            profile,
            timeshift: None,
            targets: Vec::new(),
        }
    }

    pub fn with_timeshift(mut self, delay_seconds: u32) -> Self {
        self.timeshift = Some(TimeShiftProfile {
            channel_id: self.channel.id,
            enabled: true,
            delay_seconds,
        });
        self
    }

    pub fn with_target(mut self, target: OutputTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn enabled_targets(&self) -> impl Iterator<Item = &OutputTarget> {
        self.targets.iter().filter(|target| target.enabled)
    }

    pub fn target(&self, target_id: i64) -> Option<&OutputTarget> {
        self.targets.iter().find(|target| target.id == target_id)
    }

    /// Delay of an enabled time-shift profile, `None` when the channel runs live.
    pub fn active_delay(&self) -> Option<u32> {
        self.timeshift
            .filter(|profile| profile.enabled && profile.delay_seconds > 0)
            .map(|profile| profile.delay_seconds)
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback
    } else {
        trimmed
    }
}

fn parse_column<T>(column: &str, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    raw.parse().map_err(|err: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("{column}: {err}").into(),
        )
    })
}
