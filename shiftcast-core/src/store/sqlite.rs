use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use rusqlite::{named_params, Connection, OpenFlags, OptionalExtension, Row, Statement};
use tracing::{info, warn};

use crate::models::{
    Channel, ChannelBundle, OutputProfile, OutputTarget, TimeShiftProfile,
    DEFAULT_COPY_PROFILE_NAME,
};

use super::{ChannelRepository, StoreError, StoreResult};

const CHANNEL_SCHEMA: &str = include_str!("../../../sql/channels.sql");

pub fn configure_connection(conn: &Connection, read_only: bool) -> rusqlite::Result<()> {
    if !read_only {
        conn.execute_batch("PRAGMA journal_mode = WAL;\nPRAGMA synchronous = NORMAL;\n")?;
    }
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}

#[derive(Debug, Clone)]
pub struct SqliteChannelStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteChannelStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteChannelStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteChannelStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        Ok(SqliteChannelStore {
            path,
            flags,
            read_only: self.read_only,
        })
    }
}

/// Channel configuration kept in SQLite.
#[derive(Debug, Clone)]
pub struct SqliteChannelStore {
    path: PathBuf,
    flags: OpenFlags,
    read_only: bool,
}

impl SqliteChannelStore {
    pub fn builder() -> SqliteChannelStoreBuilder {
        SqliteChannelStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteChannelStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn, self.read_only).map_err(|source| StoreError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(CHANNEL_SCHEMA)?;
        Ok(())
    }

    pub fn upsert_profile(&self, profile: &OutputProfile) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO output_profiles (
                id, name, is_active, video_mode, video_codec, audio_mode, audio_codec,
                realtime_input, loop_input, video_bitrate_k, video_maxrate_k, video_bufsize_k,
                x264_preset, x264_tune, gop_size, scale_width, scale_height, fps_limit,
                audio_bitrate_k, default_pkt_size, default_overrun_nonfatal, default_ttl
            ) VALUES (
                :id, :name, :is_active, :video_mode, :video_codec, :audio_mode, :audio_codec,
                :realtime_input, :loop_input, :video_bitrate_k, :video_maxrate_k, :video_bufsize_k,
                :x264_preset, :x264_tune, :gop_size, :scale_width, :scale_height, :fps_limit,
                :audio_bitrate_k, :default_pkt_size, :default_overrun_nonfatal, :default_ttl
            )
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                is_active = excluded.is_active,
                video_mode = excluded.video_mode,
                video_codec = excluded.video_codec,
                audio_mode = excluded.audio_mode,
                audio_codec = excluded.audio_codec,
                realtime_input = excluded.realtime_input,
                loop_input = excluded.loop_input,
                video_bitrate_k = excluded.video_bitrate_k,
                video_maxrate_k = excluded.video_maxrate_k,
                video_bufsize_k = excluded.video_bufsize_k,
                x264_preset = excluded.x264_preset,
                x264_tune = excluded.x264_tune,
                gop_size = excluded.gop_size,
                scale_width = excluded.scale_width,
                scale_height = excluded.scale_height,
                fps_limit = excluded.fps_limit,
                audio_bitrate_k = excluded.audio_bitrate_k,
                default_pkt_size = excluded.default_pkt_size,
                default_overrun_nonfatal = excluded.default_overrun_nonfatal,
                default_ttl = excluded.default_ttl",
            named_params! {
                ":id": profile.id,
                ":name": profile.name,
                ":is_active": profile.is_active,
                ":video_mode": profile.video_mode.as_str(),
                ":video_codec": profile.video_codec,
                ":audio_mode": profile.audio_mode.as_str(),
                ":audio_codec": profile.audio_codec,
                ":realtime_input": profile.realtime_input,
                ":loop_input": profile.loop_input,
                ":video_bitrate_k": profile.video_bitrate_k,
                ":video_maxrate_k": profile.video_maxrate_k,
                ":video_bufsize_k": profile.video_bufsize_k,
                ":x264_preset": profile.x264_preset,
                ":x264_tune": profile.x264_tune,
                ":gop_size": profile.gop_size,
                ":scale_width": profile.scale_width,
                ":scale_height": profile.scale_height,
                ":fps_limit": profile.fps_limit,
                ":audio_bitrate_k": profile.audio_bitrate_k,
                ":default_pkt_size": profile.default_pkt_size,
                ":default_overrun_nonfatal": profile.default_overrun_nonfatal,
                ":default_ttl": profile.default_ttl,
            },
        )?;
        Ok(())
    }

    pub fn upsert_channel(&self, channel: &Channel) -> StoreResult<()> {
        let conn = self.open()?;
        let days = &channel.schedule.days;
        conn.execute(
            "INSERT INTO channels (
                id, name, enabled, input_type, input_url, output_profile_id,
                recording_path_template, recording_segment_minutes, auto_delete_enabled,
                auto_delete_after_segments, auto_delete_after_days, monday, tuesday, wednesday,
                thursday, friday, saturday, sunday, start_time, end_time, date_from, date_to,
                playback_tail_enabled, timeshift_delay_seconds
            ) VALUES (
                :id, :name, :enabled, :input_type, :input_url, :output_profile_id,
                :recording_path_template, :recording_segment_minutes, :auto_delete_enabled,
                :auto_delete_after_segments, :auto_delete_after_days, :monday, :tuesday, :wednesday,
                :thursday, :friday, :saturday, :sunday, :start_time, :end_time, :date_from, :date_to,
                :playback_tail_enabled, :timeshift_delay_seconds
            )
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                enabled = excluded.enabled,
                input_type = excluded.input_type,
                input_url = excluded.input_url,
                output_profile_id = excluded.output_profile_id,
                recording_path_template = excluded.recording_path_template,
                recording_segment_minutes = excluded.recording_segment_minutes,
                auto_delete_enabled = excluded.auto_delete_enabled,
                auto_delete_after_segments = excluded.auto_delete_after_segments,
                auto_delete_after_days = excluded.auto_delete_after_days,
                monday = excluded.monday,
                tuesday = excluded.tuesday,
                wednesday = excluded.wednesday,
                thursday = excluded.thursday,
                friday = excluded.friday,
                saturday = excluded.saturday,
                sunday = excluded.sunday,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                date_from = excluded.date_from,
                date_to = excluded.date_to,
                playback_tail_enabled = excluded.playback_tail_enabled,
                timeshift_delay_seconds = excluded.timeshift_delay_seconds",
            named_params! {
                ":id": channel.id,
                ":name": channel.name,
                ":enabled": channel.enabled,
                ":input_type": channel.input_type.as_str(),
                ":input_url": channel.input_url,
                ":output_profile_id": channel.output_profile_id,
                ":recording_path_template": channel.recording_path_template,
                ":recording_segment_minutes": channel.recording_segment_minutes,
                ":auto_delete_enabled": channel.retention.enabled,
                ":auto_delete_after_segments": channel.retention.keep_last_segments,
                ":auto_delete_after_days": channel.retention.max_age_days,
                ":monday": days.monday,
                ":tuesday": days.tuesday,
                ":wednesday": days.wednesday,
                ":thursday": days.thursday,
                ":friday": days.friday,
                ":saturday": days.saturday,
                ":sunday": days.sunday,
                ":start_time": channel.schedule.start_time,
                ":end_time": channel.schedule.end_time,
                ":date_from": channel.schedule.date_from,
                ":date_to": channel.schedule.date_to,
                ":playback_tail_enabled": channel.playback_tail_enabled,
                ":timeshift_delay_seconds": channel.timeshift_delay_seconds,
            },
        )?;
        Ok(())
    }

    pub fn upsert_timeshift(&self, profile: &TimeShiftProfile) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO timeshift_profiles (channel_id, enabled, delay_seconds)
             VALUES (:channel_id, :enabled, :delay_seconds)
             ON CONFLICT(channel_id) DO UPDATE SET
                enabled = excluded.enabled,
                delay_seconds = excluded.delay_seconds",
            named_params! {
                ":channel_id": profile.channel_id,
                ":enabled": profile.enabled,
                ":delay_seconds": profile.delay_seconds,
            },
        )?;
        Ok(())
    }

    pub fn upsert_target(&self, target: &OutputTarget) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO output_targets (
                id, channel_id, name, enabled, protocol, target_url, pkt_size,
                overrun_nonfatal, fifo_size, buffer_size, ttl
            ) VALUES (
                :id, :channel_id, :name, :enabled, :protocol, :target_url, :pkt_size,
                :overrun_nonfatal, :fifo_size, :buffer_size, :ttl
            )
            ON CONFLICT(id) DO UPDATE SET
                channel_id = excluded.channel_id,
                name = excluded.name,
                enabled = excluded.enabled,
                protocol = excluded.protocol,
                target_url = excluded.target_url,
                pkt_size = excluded.pkt_size,
                overrun_nonfatal = excluded.overrun_nonfatal,
                fifo_size = excluded.fifo_size,
                buffer_size = excluded.buffer_size,
                ttl = excluded.ttl",
            named_params! {
                ":id": target.id,
                ":channel_id": target.channel_id,
                ":name": target.name,
                ":enabled": target.enabled,
                ":protocol": target.protocol,
                ":target_url": target.target_url,
                ":pkt_size": target.pkt_size,
                ":overrun_nonfatal": target.overrun_nonfatal,
                ":fifo_size": target.fifo_size,
                ":buffer_size": target.buffer_size,
                ":ttl": target.ttl,
            },
        )?;
        Ok(())
    }

    /// Stores a whole bundle: profile, channel, time-shift and targets.
    pub fn save_bundle(&self, bundle: &ChannelBundle) -> StoreResult<()> {
        self.upsert_profile(&bundle.profile)?;
        let mut channel = bundle.channel.clone();
        channel.output_profile_id = Some(bundle.profile.id);
        self.upsert_channel(&channel)?;
        if let Some(timeshift) = &bundle.timeshift {
            self.upsert_timeshift(timeshift)?;
        }
        for target in &bundle.targets {
            self.upsert_target(target)?;
        }
        Ok(())
    }

    /// The stream-copy profile given to channels that name none.
    ///
    /// Prefers the oldest active copy profile; otherwise creates one by name,
    /// or synthesizes it when the store is read-only.
    pub fn default_copy_profile(&self) -> StoreResult<OutputProfile> {
        let conn = self.open()?;
        self.default_copy_profile_with(&conn)
    }

    fn default_copy_profile_with(&self, conn: &Connection) -> StoreResult<OutputProfile> {
        let existing = conn
            .query_row(
                "SELECT * FROM output_profiles
                 WHERE is_active = 1 AND video_mode = 'copy'
                 ORDER BY id LIMIT 1",
                [],
                OutputProfile::from_row,
            )
            .optional()?;
        if let Some(profile) = existing {
            return Ok(profile);
        }
        if self.read_only {
            return Ok(OutputProfile::default_copy());
        }

        let template = OutputProfile::default_copy();
        conn.execute(
            "INSERT INTO output_profiles (
                name, is_active, video_mode, video_codec, audio_mode, audio_codec,
                default_pkt_size, default_overrun_nonfatal
            ) VALUES (:name, 1, 'copy', :video_codec, 'copy', :audio_codec, :pkt_size, 1)
            ON CONFLICT(name) DO NOTHING",
            named_params! {
                ":name": DEFAULT_COPY_PROFILE_NAME,
                ":video_codec": template.video_codec,
                ":audio_codec": template.audio_codec,
                ":pkt_size": template.default_pkt_size,
            },
        )?;
        let profile = conn.query_row(
            "SELECT * FROM output_profiles WHERE name = ?1",
            [DEFAULT_COPY_PROFILE_NAME],
            OutputProfile::from_row,
        )?;
        info!(profile_id = profile.id, "default copy profile created");
        Ok(profile)
    }
}

impl ChannelRepository for SqliteChannelStore {
    /// Rows that fail to decode are logged and skipped; a channel whose profile or
    /// time-shift row is unreadable is skipped with them.
    fn load_channels(&self) -> StoreResult<Vec<ChannelBundle>> {
        let conn = self.open()?;

        let mut stmt = conn.prepare("SELECT * FROM output_profiles ORDER BY id")?;
        let (rows, broken_profiles) =
            decode_rows(&mut stmt, "output_profile", "id", OutputProfile::from_row)?;
        let profiles: HashMap<i64, OutputProfile> =
            rows.into_iter().map(|profile| (profile.id, profile)).collect();

        let mut stmt = conn.prepare("SELECT * FROM timeshift_profiles")?;
        let (rows, broken_timeshifts) =
            decode_rows(&mut stmt, "timeshift_profile", "channel_id", TimeShiftProfile::from_row)?;
        let timeshifts: HashMap<i64, TimeShiftProfile> =
            rows.into_iter().map(|profile| (profile.channel_id, profile)).collect();

        let mut stmt = conn.prepare("SELECT * FROM output_targets ORDER BY channel_id, id")?;
        let (rows, _) = decode_rows(&mut stmt, "output_target", "id", OutputTarget::from_row)?;
        let mut targets: HashMap<i64, Vec<OutputTarget>> = HashMap::new();
        for target in rows {
            targets.entry(target.channel_id).or_default().push(target);
        }

        let mut stmt = conn.prepare("SELECT * FROM channels ORDER BY name")?;
        let (channels, _) = decode_rows(&mut stmt, "channel", "id", Channel::from_row)?;

        let mut fallback: Option<OutputProfile> = None;
        let mut bundles = Vec::with_capacity(channels.len());
        for channel in channels {
            if channel
                .output_profile_id
                .is_some_and(|id| broken_profiles.contains(&id))
            {
                warn!(
                    channel_id = channel.id,
                    "skipping channel, its output profile is unreadable"
                );
                continue;
            }
            if broken_timeshifts.contains(&channel.id) {
                warn!(
                    channel_id = channel.id,
                    "skipping channel, its time-shift profile is unreadable"
                );
                continue;
            }
            let profile = match channel
                .output_profile_id
                .and_then(|id| profiles.get(&id))
            {
                Some(profile) => profile.clone(),
                None => match &fallback {
                    Some(profile) => profile.clone(),
                    None => {
                        let profile = self.default_copy_profile_with(&conn)?;
                        fallback = Some(profile.clone());
                        profile
                    }
                },
            };
            bundles.push(ChannelBundle {
                timeshift: timeshifts.get(&channel.id).copied(),
                targets: targets.remove(&channel.id).unwrap_or_default(),
                profile,
                channel,
            });
        }
        Ok(bundles)
    }
}

/// Column values the row types cannot represent, as opposed to store failures.
fn is_decode_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
    )
}

/// Decodes every row of `stmt`, returning the decoded values and the `key_column`
/// values of rows that could not be decoded.
fn decode_rows<T, F>(
    stmt: &mut Statement<'_>,
    table: &'static str,
    key_column: &str,
    mut decode: F,
) -> StoreResult<(Vec<T>, HashSet<i64>)>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let rows = stmt.query_map([], |row| {
        let key: Option<i64> = row.get(key_column).ok();
        Ok((key, decode(row)))
    })?;

    let mut decoded = Vec::new();
    let mut broken = HashSet::new();
    for row in rows {
        let (key, result) = row?;
        match result {
            Ok(value) => decoded.push(value),
            Err(err) if is_decode_error(&err) => {
                warn!(table, row_id = key, error = %err, "skipping unreadable row");
                broken.extend(key);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok((decoded, broken))
}
