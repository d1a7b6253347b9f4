use super::registry::{BackendCatalog, BackendSpec, MediaKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSelection {
    pub backend: BackendSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BackendSelector {
    pub catalog: BackendCatalog,
}

impl BackendSelector {
    pub fn new(catalog: Option<BackendCatalog>) -> Self {
        Self {
            catalog: catalog.unwrap_or_default(),
        }
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        media: MediaKind,
    ) -> Result<BackendSelection, String> {
        let requested = requested.map(str::trim).filter(|value| !value.is_empty());
        let (fallback_reason, requested_text) = if let Some(requested_value) = requested {
            if let Some(backend) = self.catalog.ensure(requested_value, media) {
                return Ok(BackendSelection {
                    backend,
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            (
                Some(format!(
                    "Requested backend '{requested_value}' unavailable for {media} generation."
                )),
                Some(requested_value.to_string()),
            )
        } else {
            (Some("No backend specified; using default.".to_string()), None)
        };

        let candidates = self.catalog.by_media(media);
        let Some(backend) = candidates.first().cloned() else {
            return Err(format!("No backends available for {media} generation."));
        };
        Ok(BackendSelection {
            backend,
            requested: requested_text,
            fallback_reason,
        })
    }

    /// Like `select`, but an unusable request lands on `preferred` before the
    /// catalog default.
    pub fn select_preferring(
        &self,
        requested: Option<&str>,
        preferred: Option<&str>,
        media: MediaKind,
    ) -> Result<BackendSelection, String> {
        let selection = self.select(requested.or(preferred), media)?;
        if selection.fallback_reason.is_none() || requested.is_none() {
            return Ok(selection);
        }
        match preferred.and_then(|name| self.catalog.ensure(name, media)) {
            Some(backend) => Ok(BackendSelection {
                backend,
                ..selection
            }),
            None => Ok(selection),
        }
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::BackendSelector;
    use crate::catalog::{BackendCatalog, BackendKind, BackendSpec, MediaKind};

    #[test]
    fn selector_honours_known_request() {
        let selection = BackendSelector::default()
            .select(Some("Kandinsky"), MediaKind::Image)
            .unwrap();
        assert_eq!(selection.backend.kind, BackendKind::Kandinsky);
        assert!(selection.fallback_reason.is_none());
    }

    #[test]
    fn selector_falls_back_when_media_does_not_match() {
        let selection = BackendSelector::default()
            .select(Some("MusicGen"), MediaKind::Image)
            .unwrap();
        assert_eq!(selection.backend.kind, BackendKind::SdxlTcd);
        assert_eq!(selection.requested.as_deref(), Some("MusicGen"));
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Requested backend 'MusicGen' unavailable for image generation.")
        );
    }

    #[test]
    fn selector_no_request_uses_default_with_explanation() {
        let selection = BackendSelector::default()
            .select(None, MediaKind::Video)
            .unwrap();
        assert_eq!(selection.backend.kind, BackendKind::AnimateDiff);
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("No backend specified; using default.")
        );
    }

    #[test]
    fn unusable_request_lands_on_preference() {
        let selector = BackendSelector::default();
        let selection = selector
            .select_preferring(Some("Imaginary"), Some("Kandinsky"), MediaKind::Image)
            .unwrap();
        assert_eq!(selection.backend.kind, BackendKind::Kandinsky);
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Requested backend 'Imaginary' unavailable for image generation.")
        );

        let selection = selector
            .select_preferring(Some("Anime"), Some("Kandinsky"), MediaKind::Image)
            .unwrap();
        assert_eq!(selection.backend.kind, BackendKind::Animagine);
        assert!(selection.fallback_reason.is_none());

        let selection = selector
            .select_preferring(None, Some("Kandinsky"), MediaKind::Image)
            .unwrap();
        assert_eq!(selection.backend.kind, BackendKind::Kandinsky);

        let selection = selector
            .select_preferring(Some("Imaginary"), Some("MeloTTS"), MediaKind::Image)
            .unwrap();
        assert_eq!(selection.backend.kind, BackendKind::SdxlTcd);
    }

    #[test]
    fn selector_errors_when_catalog_has_nothing_for_media() {
        let mut backends = IndexMap::new();
        backends.insert(
            "MeloTTS".to_string(),
            BackendSpec::from_kind(BackendKind::MeloTts),
        );
        let err = BackendSelector::new(Some(BackendCatalog::new(Some(backends))))
            .select(Some("Anime"), MediaKind::Image)
            .err()
            .unwrap_or_default();
        assert_eq!(err, "No backends available for image generation.");
    }
}
