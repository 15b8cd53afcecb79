pub mod error;
pub mod sqlite;

use std::sync::{Mutex, PoisonError};

use crate::models::ChannelBundle;

pub use error::{StoreError, StoreResult};
pub use sqlite::{SqliteChannelStore, SqliteChannelStoreBuilder};

/// Read side of the channel configuration, as consumed by the enforcer.
pub trait ChannelRepository: Send + Sync {
    /// Every channel with its resolved profile, time-shift and all targets, ordered by name.
    fn load_channels(&self) -> StoreResult<Vec<ChannelBundle>>;

    fn load_channel(&self, channel_id: i64) -> StoreResult<Option<ChannelBundle>> {
        Ok(self
            .load_channels()?
            .into_iter()
            .find(|bundle| bundle.channel.id == channel_id))
    }
}

/// In-memory channel list for embedders and tests.
#[derive(Debug, Default)]
pub struct StaticChannelRepository {
    bundles: Mutex<Vec<ChannelBundle>>,
}

impl StaticChannelRepository {
    pub fn new(bundles: Vec<ChannelBundle>) -> Self {
        Self {
            bundles: Mutex::new(bundles),
        }
    }

    pub fn replace(&self, bundles: Vec<ChannelBundle>) {
        *self.bundles.lock().unwrap_or_else(PoisonError::into_inner) = bundles;
    }

    pub fn update<F>(&self, edit: F)
    where
        F: FnOnce(&mut Vec<ChannelBundle>),
    {
        edit(&mut self.bundles.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl ChannelRepository for StaticChannelRepository {
    fn load_channels(&self) -> StoreResult<Vec<ChannelBundle>> {
        let mut bundles = self
            .bundles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        bundles.sort_by(|a, b| a.channel.name.cmp(&b.channel.name));
        Ok(bundles)
    }
}
