use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};

use crate::models::{ChannelBundle, JobKey, OutputTarget};
use crate::schedule::is_active;

/// A job that should be running this tick, with the data needed to build it.
#[derive(Debug, Clone)]
pub struct DesiredJob {
    pub key: JobKey,
    pub bundle: Arc<ChannelBundle>,
    pub target: Option<OutputTarget>,
}

impl DesiredJob {
    pub fn target(&self) -> Option<&OutputTarget> {
        self.target.as_ref()
    }
}

pub type DesiredState = BTreeMap<JobKey, DesiredJob>;

/// Jobs every channel should be running at `now`.
///
/// Live channels get one playback job per enabled target. Time-shifted
/// channels additionally get a record job feeding the delayed playback.
/// A channel without enabled targets contributes nothing, recording included.
pub fn compute_desired<I>(bundles: I, now: NaiveDateTime) -> DesiredState
where
    I: IntoIterator<Item = ChannelBundle>,
{
    let mut desired = DesiredState::new();

    for bundle in bundles {
        let channel = &bundle.channel;
        if !channel.enabled || bundle.enabled_targets().next().is_none() {
            continue;
        }

        let delay = bundle.active_delay();
        let on_air = is_active(channel, now);
        let in_tail = !on_air
            && channel.playback_tail_enabled
            && delay.is_some_and(|delay| {
                is_active(channel, now - Duration::seconds(i64::from(delay)))
            });
        if !on_air && !in_tail {
            continue;
        }

        let bundle = Arc::new(bundle);
        if on_air && delay.is_some() {
            let key = JobKey::record(bundle.channel.id);
            desired.insert(
                key,
                DesiredJob {
                    key,
                    bundle: Arc::clone(&bundle),
                    target: None,
                },
            );
        }
        for target in bundle.enabled_targets() {
            let key = JobKey::playback(bundle.channel.id, target.id);
            desired.insert(
                key,
                DesiredJob {
                    key,
                    bundle: Arc::clone(&bundle),
                    target: Some(target.clone()),
                },
            );
        }
    }

    desired
}
