use chrono::{NaiveDateTime, NaiveTime};

use crate::models::{Channel, WeeklySchedule};

/// Whether `channel` should be on air at local time `now`.
pub fn is_active(channel: &Channel, now: NaiveDateTime) -> bool {
    channel.enabled && schedule_covers(&channel.schedule, now)
}

pub fn schedule_covers(schedule: &WeeklySchedule, now: NaiveDateTime) -> bool {
    let today = now.date();
    if schedule.date_from.is_some_and(|from| today < from) {
        return false;
    }
    if schedule.date_to.is_some_and(|to| today > to) {
        return false;
    }
    if !schedule.days.includes_date(today) {
        return false;
    }

    let start = schedule.start_time.unwrap_or(NaiveTime::MIN);
    let end = schedule.end_time.unwrap_or(NaiveTime::MIN);
    let time = now.time();

    if start == end {
        true
    } else if start < end {
        start <= time && time < end
    } else {
        // overnight window
        time >= start || time < end
    }
}
