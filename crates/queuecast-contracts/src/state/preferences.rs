use serde::{Deserialize, Serialize};

use crate::catalog::{BackendKind, Resolution};

/// How conversational replies are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStyle {
    Plain,
    #[default]
    Embedded,
}

impl ResponseStyle {
    /// Longest reply shown inline before it is delivered as a file instead.
    pub fn overflow_threshold(self) -> usize {
        match self {
            Self::Plain => 1900,
            Self::Embedded => 3900,
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::Plain => Self::Embedded,
            Self::Embedded => Self::Plain,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "Normal",
            Self::Embedded => "Embedded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    pub image_backend: String,
    pub resolution: Resolution,
    pub speech_backend: String,
    pub url_reading: bool,
    pub response_style: ResponseStyle,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            image_backend: BackendKind::SdxlTcd.name().to_string(),
            resolution: Resolution::Square,
            speech_backend: BackendKind::MeloTts.name().to_string(),
            url_reading: true,
            response_style: ResponseStyle::Embedded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSettings {
    pub group_history: bool,
    pub settings_save_button: bool,
    pub custom_group_personality: bool,
    pub group_response_preference: bool,
    pub response_style: ResponseStyle,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            group_history: false,
            settings_save_button: true,
            custom_group_personality: false,
            group_response_preference: false,
            response_style: ResponseStyle::Embedded,
        }
    }
}
