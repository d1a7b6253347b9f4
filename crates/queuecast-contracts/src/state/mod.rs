mod preferences;
mod snapshot;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use preferences::{GroupSettings, ResponseStyle, UserPreferences};
pub use snapshot::StateSnapshot;

use crate::history::HistoryStore;

/// Who sent a request and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub user_id: String,
    pub display_name: String,
    /// `None` for direct messages.
    pub group_id: Option<String>,
    pub channel_id: String,
    /// Group administrator; only meaningful inside a group.
    pub is_admin: bool,
}

impl Requester {
    pub fn direct(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            channel_id: format!("dm-{user_id}"),
            user_id,
            display_name: display_name.into(),
            group_id: None,
            is_admin: false,
        }
    }

    pub fn in_group(mut self, group_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self.channel_id = channel_id.into();
        self
    }

    pub fn as_admin(mut self) -> Self {
        self.is_admin = true;
        self
    }
}

/// Process-wide state: histories plus every per-user and per-group map.
///
/// All maps sit behind their own mutex; `save` writes a consistent snapshot of
/// each of them.
#[derive(Debug, Default)]
pub struct BotState {
    path: Option<PathBuf>,
    history: HistoryStore,
    preferences: Mutex<BTreeMap<String, UserPreferences>>,
    groups: Mutex<BTreeMap<String, GroupSettings>>,
    instructions: Mutex<BTreeMap<String, String>>,
    blocklist: Mutex<BTreeMap<String, BTreeSet<String>>>,
    respond_all: Mutex<BTreeSet<String>>,
    always_respond: Mutex<BTreeMap<String, BTreeSet<String>>>,
    save_lock: Mutex<()>,
}

impl BotState {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads `path`; a missing or unreadable file starts from empty state.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let snapshot = match snapshot::read_snapshot(&path) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => StateSnapshot::default(),
            Err(err) => {
                tracing::warn!(path = %path.display(), "starting with empty state: {err:#}");
                StateSnapshot::default()
            }
        };
        let state = Self {
            path: Some(path),
            ..Self::default()
        };
        state.restore(snapshot);
        state
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let _writer = lock(&self.save_lock);
        snapshot::write_snapshot(path, &self.snapshot())
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            chat_histories: self.history.snapshot(),
            user_preferences: lock(&self.preferences).clone(),
            group_settings: lock(&self.groups).clone(),
            custom_instructions: lock(&self.instructions).clone(),
            blocklist: lock(&self.blocklist).clone(),
            respond_all_channels: lock(&self.respond_all).clone(),
            always_respond_users: lock(&self.always_respond).clone(),
        }
    }

    fn restore(&self, snapshot: StateSnapshot) {
        self.history.restore(snapshot.chat_histories);
        *lock(&self.preferences) = snapshot.user_preferences;
        *lock(&self.groups) = snapshot.group_settings;
        *lock(&self.instructions) = snapshot.custom_instructions;
        *lock(&self.blocklist) = snapshot.blocklist;
        *lock(&self.respond_all) = snapshot.respond_all_channels;
        *lock(&self.always_respond) = snapshot.always_respond_users;
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Group id when the group shares one history, otherwise the user id.
    pub fn history_key(&self, requester: &Requester) -> String {
        match requester.group_id.as_deref() {
            Some(group) if self.group_settings(group).group_history => group.to_string(),
            _ => requester.user_id.clone(),
        }
    }

    pub fn preferences(&self, user_id: &str) -> UserPreferences {
        lock(&self.preferences)
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn update_preferences(
        &self,
        user_id: &str,
        update: impl FnOnce(&mut UserPreferences),
    ) -> UserPreferences {
        let mut all = lock(&self.preferences);
        let prefs = all.entry(user_id.to_string()).or_default();
        update(prefs);
        prefs.clone()
    }

    pub fn group_settings(&self, group_id: &str) -> GroupSettings {
        lock(&self.groups).get(group_id).cloned().unwrap_or_default()
    }

    pub fn update_group(
        &self,
        group_id: &str,
        update: impl FnOnce(&mut GroupSettings),
    ) -> GroupSettings {
        let mut all = lock(&self.groups);
        let settings = all.entry(group_id.to_string()).or_default();
        update(settings);
        settings.clone()
    }

    /// Group override when the group enforces one, otherwise the user's choice.
    pub fn response_style(&self, requester: &Requester) -> ResponseStyle {
        if let Some(group) = requester.group_id.as_deref() {
            let settings = self.group_settings(group);
            if settings.group_response_preference {
                return settings.response_style;
            }
        }
        self.preferences(&requester.user_id).response_style
    }

    /// Group instructions when the group personality is on and the group has
    /// some, otherwise the user's own.
    pub fn instructions_for(&self, requester: &Requester) -> Option<String> {
        let instructions = lock(&self.instructions);
        let lookup = |key: &str| {
            instructions
                .get(key)
                .filter(|text| !text.trim().is_empty())
                .cloned()
        };
        requester
            .group_id
            .as_deref()
            .filter(|group| self.group_settings(group).custom_group_personality)
            .and_then(lookup)
            .or_else(|| lookup(&requester.user_id))
    }

    pub fn set_instructions(&self, key: &str, text: &str) {
        lock(&self.instructions).insert(key.to_string(), text.trim().to_string());
    }

    pub fn remove_instructions(&self, key: &str) -> bool {
        lock(&self.instructions).remove(key).is_some()
    }

    pub fn is_blocked(&self, requester: &Requester) -> bool {
        let Some(group) = requester.group_id.as_deref() else {
            return false;
        };
        lock(&self.blocklist)
            .get(group)
            .is_some_and(|users| users.contains(&requester.user_id))
    }

    /// Returns false when the user was already blocked.
    pub fn block(&self, group_id: &str, user_id: &str) -> bool {
        lock(&self.blocklist)
            .entry(group_id.to_string())
            .or_default()
            .insert(user_id.to_string())
    }

    pub fn unblock(&self, group_id: &str, user_id: &str) -> bool {
        lock(&self.blocklist)
            .get_mut(group_id)
            .is_some_and(|users| users.remove(user_id))
    }

    /// Whether an ordinary message from `requester` should be answered.
    ///
    /// Direct messages always are. In a group the bot answers when mentioned,
    /// in channels switched to respond-to-all, and for users who turned on
    /// always-respond in that channel.
    pub fn should_respond(&self, requester: &Requester, mentioned: bool) -> bool {
        if requester.group_id.is_none() || mentioned {
            return true;
        }
        if lock(&self.respond_all).contains(&requester.channel_id) {
            return true;
        }
        lock(&self.always_respond)
            .get(&requester.channel_id)
            .is_some_and(|users| users.contains(&requester.user_id))
    }

    /// Flips respond-to-all for `channel_id`; returns the new value.
    pub fn toggle_respond_all(&self, channel_id: &str) -> bool {
        let mut channels = lock(&self.respond_all);
        if channels.remove(channel_id) {
            return false;
        }
        channels.insert(channel_id.to_string());
        true
    }

    /// Flips always-respond for one user in one channel; returns the new value.
    pub fn toggle_always_respond(&self, channel_id: &str, user_id: &str) -> bool {
        let mut channels = lock(&self.always_respond);
        let users = channels.entry(channel_id.to_string()).or_default();
        if users.remove(user_id) {
            if users.is_empty() {
                channels.remove(channel_id);
            }
            return false;
        }
        users.insert(user_id.to_string());
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use crate::catalog::Resolution;

    use super::{BotState, Requester, ResponseStyle};

    fn member(user: &str) -> Requester {
        Requester::direct(user, user).in_group("g-1", "c-1")
    }

    #[test]
    fn state_round_trips_through_disk() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("state.json");
        let state = BotState::load(&path);
        state.history().append("u-1", "hi", "hello");
        state.update_preferences("u-1", |prefs| {
            prefs.image_backend = "Kandinsky".to_string();
            prefs.resolution = Resolution::Wide;
        });
        state.update_group("g-1", |group| group.group_history = true);
        state.set_instructions("u-1", "  answer like a pirate ");
        state.block("g-1", "u-9");
        state.toggle_respond_all("c-1");
        state.toggle_always_respond("c-2", "u-1");
        state.save()?;

        let reloaded = BotState::load(&path);
        assert_eq!(reloaded.snapshot(), state.snapshot());
        assert_eq!(reloaded.history().len("u-1"), 2);
        assert_eq!(reloaded.preferences("u-1").resolution, Resolution::Wide);
        assert!(reloaded.is_blocked(&member("u-9")));
        assert!(reloaded.should_respond(&member("u-7"), false));
        assert!(reloaded.should_respond(&member("u-1").in_group("g-1", "c-2"), false));
        Ok(())
    }

    #[test]
    fn corrupt_state_file_starts_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("state.json");
        std::fs::write(&path, "[1, 2")?;
        let state = BotState::load(&path);
        assert_eq!(state.snapshot(), Default::default());
        state.save()?;
        assert!(std::fs::read_to_string(&path)?.contains("chat_histories"));
        Ok(())
    }

    #[test]
    fn history_key_switches_with_group_history() {
        let state = BotState::in_memory();
        let requester = member("u-1");
        assert_eq!(state.history_key(&requester), "u-1");
        state.update_group("g-1", |group| group.group_history = true);
        assert_eq!(state.history_key(&requester), "g-1");
        assert_eq!(state.history_key(&Requester::direct("u-1", "ada")), "u-1");
    }

    #[test]
    fn group_response_preference_overrides_user_style() {
        let state = BotState::in_memory();
        let requester = member("u-1");
        state.update_preferences("u-1", |prefs| prefs.response_style = ResponseStyle::Plain);
        assert_eq!(state.response_style(&requester), ResponseStyle::Plain);
        state.update_group("g-1", |group| group.group_response_preference = true);
        assert_eq!(state.response_style(&requester), ResponseStyle::Embedded);
    }

    #[test]
    fn instructions_follow_group_personality() {
        let state = BotState::in_memory();
        let requester = member("u-1");
        state.set_instructions("u-1", "personal");
        state.set_instructions("g-1", "shared");
        assert_eq!(state.instructions_for(&requester).as_deref(), Some("personal"));
        state.update_group("g-1", |group| group.custom_group_personality = true);
        assert_eq!(state.instructions_for(&requester).as_deref(), Some("shared"));
        assert!(state.remove_instructions("g-1"));
        assert_eq!(state.instructions_for(&requester).as_deref(), Some("personal"));
        assert!(state.remove_instructions("u-1"));
        assert!(state.instructions_for(&requester).is_none());
    }

    #[test]
    fn group_personality_without_text_keeps_user_instructions() {
        let state = BotState::in_memory();
        let requester = member("u-1");
        state.set_instructions("u-1", "talk like a pirate");
        state.update_group("g-1", |group| group.custom_group_personality = true);
        assert_eq!(
            state.instructions_for(&requester).as_deref(),
            Some("talk like a pirate")
        );
        state.set_instructions("g-1", "   ");
        assert_eq!(
            state.instructions_for(&requester).as_deref(),
            Some("talk like a pirate")
        );
    }

    #[test]
    fn group_messages_need_mention_or_opt_in() {
        let state = BotState::in_memory();
        let ada = member("u-1");
        let bob = member("u-2");
        assert!(state.should_respond(&Requester::direct("u-1", "ada"), false));
        assert!(!state.should_respond(&ada, false));
        assert!(state.should_respond(&ada, true));

        assert!(state.toggle_always_respond("c-1", "u-1"));
        assert!(state.should_respond(&ada, false));
        assert!(!state.should_respond(&bob, false));
        assert!(!state.should_respond(&ada.clone().in_group("g-1", "c-2"), false));
        assert!(!state.toggle_always_respond("c-1", "u-1"));
        assert!(!state.should_respond(&ada, false));

        assert!(state.toggle_respond_all("c-1"));
        assert!(state.should_respond(&bob, false));
        assert!(!state.toggle_respond_all("c-1"));
        assert!(!state.should_respond(&bob, false));
    }

    #[test]
    fn block_and_unblock_are_idempotent() {
        let state = BotState::in_memory();
        assert!(state.block("g-1", "u-2"));
        assert!(!state.block("g-1", "u-2"));
        assert!(state.is_blocked(&member("u-2")));
        assert!(!state.is_blocked(&Requester::direct("u-2", "bob")));
        assert!(state.unblock("g-1", "u-2"));
        assert!(!state.unblock("g-1", "u-2"));
    }
}
