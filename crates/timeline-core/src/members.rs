use std::{cell::OnceCell, collections::HashMap};

use crate::{state_store::StateStore, types::MemberProfile};

/// Lazily built `user_id -> profile` cache over the current membership state.
///
/// Holds no state of its own: dropping the cache and rebuilding it from the
/// [`StateStore`] always gives the same answer.
#[derive(Debug, Clone, Default)]
pub struct MemberRegistry {
    cache: OnceCell<HashMap<String, MemberProfile>>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop cached profiles. Called whenever membership state changes.
    pub fn invalidate(&mut self) {
        self.cache.take();
    }

    pub fn is_cached(&self) -> bool {
        self.cache.get().is_some()
    }

    pub fn get(&self, state: &StateStore, user_id: &str) -> Option<&MemberProfile> {
        self.profiles(state).get(user_id)
    }

    /// All members with membership state, keyed by user ID.
    pub fn profiles(&self, state: &StateStore) -> &HashMap<String, MemberProfile> {
        self.cache.get_or_init(|| {
            state
                .members()
                .map(|(user_id, event)| {
                    (
                        user_id.to_owned(),
                        MemberProfile::from_content(user_id, &event.content),
                    )
                })
                .collect()
        })
    }
}
