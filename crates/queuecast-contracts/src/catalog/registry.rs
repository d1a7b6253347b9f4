use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::resolution::{Dimensions, ResolutionTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Image,
    Speech,
    Music,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Speech => "speech",
            Self::Music => "music",
            Self::Video => "video",
        }
    }

    /// File name used when the result is attached to a chat message.
    pub fn attachment_name(self) -> &'static str {
        match self {
            Self::Image => "generated-image.png",
            Self::Speech => "speech.wav",
            Self::Music => "music.mp4",
            Self::Video => "video.mp4",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    EventStream,
    DuplexSocket,
}

/// Every external queue this crate knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    SdxlTcd,
    SdxlLightning,
    Kandinsky,
    DalleXl,
    Animagine,
    StableCascade,
    MeloTts,
    AnimateDiff,
    MusicGen,
}

impl BackendKind {
    pub const ALL: [BackendKind; 9] = [
        BackendKind::SdxlTcd,
        BackendKind::SdxlLightning,
        BackendKind::Kandinsky,
        BackendKind::DalleXl,
        BackendKind::Animagine,
        BackendKind::StableCascade,
        BackendKind::MeloTts,
        BackendKind::AnimateDiff,
        BackendKind::MusicGen,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::SdxlTcd => "SD-XL-Alt2",
            Self::SdxlLightning => "SD-XL-Alt",
            Self::Kandinsky => "Kandinsky",
            Self::DalleXl => "DallE-XL",
            Self::Animagine => "Anime",
            Self::StableCascade => "Stable-Cascade",
            Self::MeloTts => "MeloTTS",
            Self::AnimateDiff => "AnimateDiff",
            Self::MusicGen => "MusicGen",
        }
    }

    pub fn media(self) -> MediaKind {
        match self {
            Self::SdxlTcd
            | Self::SdxlLightning
            | Self::Kandinsky
            | Self::DalleXl
            | Self::Animagine
            | Self::StableCascade => MediaKind::Image,
            Self::MeloTts => MediaKind::Speech,
            Self::AnimateDiff => MediaKind::Video,
            Self::MusicGen => MediaKind::Music,
        }
    }

    pub fn protocol(self) -> Protocol {
        match self {
            Self::MusicGen => Protocol::DuplexSocket,
            _ => Protocol::EventStream,
        }
    }

    pub fn resolutions(self) -> ResolutionTable {
        const SQUARE: Dimensions = Dimensions::new(1024, 1024);
        match self {
            Self::Kandinsky | Self::DalleXl | Self::StableCascade => ResolutionTable::full(
                SQUARE,
                Dimensions::new(1280, 768),
                Dimensions::new(768, 1280),
            ),
            Self::Animagine => ResolutionTable::full(
                SQUARE,
                Dimensions::new(1152, 896),
                Dimensions::new(896, 1152),
            ),
            _ => ResolutionTable::square_only(SQUARE),
        }
    }

    pub fn from_name(raw: &str) -> Option<Self> {
        let wanted = raw.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(wanted))
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub kind: BackendKind,
    pub name: String,
    pub media: MediaKind,
    pub protocol: Protocol,
    pub resolutions: ResolutionTable,
}

impl BackendSpec {
    pub fn from_kind(kind: BackendKind) -> Self {
        Self {
            kind,
            name: kind.name().to_string(),
            media: kind.media(),
            protocol: kind.protocol(),
            resolutions: kind.resolutions(),
        }
    }

    pub fn serves(&self, media: MediaKind) -> bool {
        self.media == media
    }
}

/// Ordered catalog of backends; the first entry per media kind is its default.
#[derive(Debug, Clone)]
pub struct BackendCatalog {
    backends: IndexMap<String, BackendSpec>,
}

impl BackendCatalog {
    pub fn new(backends: Option<IndexMap<String, BackendSpec>>) -> Self {
        Self {
            backends: backends.unwrap_or_else(default_backends),
        }
    }

    pub fn get(&self, name: &str) -> Option<&BackendSpec> {
        self.backends.get(name).or_else(|| {
            self.backends
                .values()
                .find(|spec| spec.name.eq_ignore_ascii_case(name.trim()))
        })
    }

    pub fn list(&self) -> impl Iterator<Item = &BackendSpec> {
        self.backends.values()
    }

    pub fn by_media(&self, media: MediaKind) -> Vec<BackendSpec> {
        self.backends
            .values()
            .filter(|spec| spec.serves(media))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, media: MediaKind) -> Option<BackendSpec> {
        let spec = self.get(name)?;
        if spec.serves(media) {
            return Some(spec.clone());
        }
        None
    }
}

impl Default for BackendCatalog {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_backends() -> IndexMap<String, BackendSpec> {
    BackendKind::ALL
        .into_iter()
        .map(|kind| (kind.name().to_string(), BackendSpec::from_kind(kind)))
        .collect()
}
