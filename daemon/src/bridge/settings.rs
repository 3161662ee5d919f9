// Focus settings shared with the browser extension
// Kept in memory for the daemon's lifetime; defaults are both enabled

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Whether the extension may raise the IDE window, and whether it should
/// do so when a task finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusSettings {
    pub enabled: bool,
    pub focus_on_done: bool,
}

impl Default for FocusSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            focus_on_done: true,
        }
    }
}

/// Partial update; absent fields keep their current value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FocusSettingsPatch {
    pub enabled: Option<bool>,
    pub focus_on_done: Option<bool>,
}

#[derive(Debug, Default)]
pub struct SettingsStore {
    focus: RwLock<FocusSettings>,
}

impl SettingsStore {
    pub fn new(initial: FocusSettings) -> Self {
        Self {
            focus: RwLock::new(initial),
        }
    }

    pub async fn get(&self) -> FocusSettings {
        *self.focus.read().await
    }

    /// Apply a patch and return the resulting settings
    pub async fn update(&self, patch: FocusSettingsPatch) -> FocusSettings {
        let mut focus = self.focus.write().await;
        if let Some(enabled) = patch.enabled {
            focus.enabled = enabled;
        }
        if let Some(focus_on_done) = patch.focus_on_done {
            focus.focus_on_done = focus_on_done;
        }
        *focus
    }
}
