use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[default]
    Square,
    Wide,
    Portrait,
}

impl Resolution {
    pub const ALL: [Resolution; 3] = [Resolution::Square, Resolution::Portrait, Resolution::Wide];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Square => "Square",
            Self::Wide => "Wide",
            Self::Portrait => "Portrait",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "square" => Some(Self::Square),
            "wide" | "landscape" => Some(Self::Wide),
            "portrait" | "tall" => Some(Self::Portrait),
            _ => None,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// `"W x H"`, the form some queues expect for their size dropdown.
    pub fn label(&self) -> String {
        format!("{} x {}", self.width, self.height)
    }
}

/// Pixel pairs a backend declares for each logical resolution.
///
/// Square is always present; a backend without wide or portrait output is
/// pinned to Square whatever the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionTable {
    square: Dimensions,
    wide: Option<Dimensions>,
    portrait: Option<Dimensions>,
}

impl ResolutionTable {
    pub const fn square_only(square: Dimensions) -> Self {
        Self {
            square,
            wide: None,
            portrait: None,
        }
    }

    pub const fn full(square: Dimensions, wide: Dimensions, portrait: Dimensions) -> Self {
        Self {
            square,
            wide: Some(wide),
            portrait: Some(portrait),
        }
    }

    pub fn supports(&self, resolution: Resolution) -> bool {
        match resolution {
            Resolution::Square => true,
            Resolution::Wide => self.wide.is_some(),
            Resolution::Portrait => self.portrait.is_some(),
        }
    }

    pub fn supported(&self) -> Vec<Resolution> {
        Resolution::ALL
            .into_iter()
            .filter(|resolution| self.supports(*resolution))
            .collect()
    }

    pub fn pin(&self, requested: Resolution) -> Resolution {
        if self.supports(requested) {
            requested
        } else {
            Resolution::Square
        }
    }

    pub fn dimensions(&self, requested: Resolution) -> (Resolution, Dimensions) {
        let effective = self.pin(requested);
        let dims = match effective {
            Resolution::Square => self.square,
            Resolution::Wide => self.wide.unwrap_or(self.square),
            Resolution::Portrait => self.portrait.unwrap_or(self.square),
        };
        (effective, dims)
    }
}

#[cfg(test)]
mod tests {
    use super::{Dimensions, Resolution, ResolutionTable};

    const FULL: ResolutionTable = ResolutionTable::full(
        Dimensions::new(1024, 1024),
        Dimensions::new(1280, 768),
        Dimensions::new(768, 1280),
    );

    #[test]
    fn square_only_backend_pins_wide_to_square() {
        let table = ResolutionTable::square_only(Dimensions::new(1024, 1024));
        assert_eq!(
            table.dimensions(Resolution::Wide),
            (Resolution::Square, Dimensions::new(1024, 1024))
        );
        assert_eq!(table.supported(), vec![Resolution::Square]);
    }

    #[test]
    fn portrait_yields_declared_pair() {
        assert_eq!(
            FULL.dimensions(Resolution::Portrait),
            (Resolution::Portrait, Dimensions::new(768, 1280))
        );
        assert_eq!(FULL.dimensions(Resolution::Wide).1.label(), "1280 x 768");
    }

    #[test]
    fn parse_accepts_names_case_insensitively() {
        assert_eq!(Resolution::parse(" wide "), Some(Resolution::Wide));
        assert_eq!(Resolution::parse("PORTRAIT"), Some(Resolution::Portrait));
        assert_eq!(Resolution::parse("panorama"), None);
    }
}
