use queuecast_contracts::catalog::{BackendKind, Dimensions};
use queuecast_contracts::jobs::JobParams;
use serde_json::{json, Value};

pub const DEFAULT_NEGATIVE_PROMPT: &str = "(deformed, distorted, disfigured:1.3), poorly drawn, bad anatomy, wrong anatomy, extra limb, missing limb, floating limbs, (mutated hands and fingers:1.4), disconnected limbs, mutation, mutated, ugly, disgusting, blurry, amputation, (NSFW:1.25)";

const MUSICGEN_BANNER: &str = include_str!("../../resources/musicgen_banner.txt");

/// One hop into a completion payload's `output.data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathStep {
    Index(usize),
    Key(&'static str),
}

use PathStep::{Index, Key};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Warmup {
    pub fn_index: u32,
    pub trigger_id: u32,
}

/// Static queue coordinates for one hosted backend.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueProfile {
    pub base_url: &'static str,
    pub fn_index: u32,
    pub trigger_id: u32,
    /// Socket backends answer `send_hash` with this index.
    pub hash_fn_index: u32,
    pub result_path: &'static [PathStep],
    pub warmup: Option<Warmup>,
}

fn queue(
    base_url: &'static str,
    fn_index: u32,
    trigger_id: u32,
    result_path: &'static [PathStep],
) -> QueueProfile {
    QueueProfile {
        base_url,
        fn_index,
        trigger_id,
        hash_fn_index: 0,
        result_path,
        warmup: None,
    }
}

pub(crate) fn profile(kind: BackendKind) -> QueueProfile {
    match kind {
        BackendKind::SdxlLightning => {
            queue("https://ap123-sdxl-lightning.hf.space", 1, 7, &[Index(0), Key("url")])
        }
        BackendKind::SdxlTcd => queue("https://h1t-tcd.hf.space", 2, 17, &[Index(0), Key("url")]),
        BackendKind::Kandinsky => queue(
            "https://ehristoforu-kandinsky-api.hf.space",
            0,
            4,
            &[Index(0), Index(0), Key("image"), Key("url")],
        ),
        BackendKind::DalleXl => queue(
            "https://ehristoforu-dalle-3-xl-lora-v2.hf.space",
            3,
            6,
            &[Index(0), Index(0), Key("image"), Key("url")],
        ),
        BackendKind::Animagine => queue(
            "https://cagliostrolab-animagine-xl-3-1.hf.space",
            5,
            49,
            &[Index(0), Index(0), Key("image"), Key("url")],
        ),
        BackendKind::StableCascade => QueueProfile {
            warmup: Some(Warmup {
                fn_index: 2,
                trigger_id: 6,
            }),
            ..queue(
                "https://multimodalart-stable-cascade.hf.space",
                3,
                6,
                &[Index(0), Key("url")],
            )
        },
        BackendKind::MeloTts => {
            queue("https://mrfakename-melotts.hf.space", 1, 8, &[Index(0), Key("url")])
        }
        BackendKind::AnimateDiff => queue(
            "https://bytedance-animatediff-lightning.hf.space",
            1,
            10,
            &[Index(0), Key("video"), Key("url")],
        ),
        BackendKind::MusicGen => queue(
            "https://surn-unlimitedmusicgen.hf.space",
            5,
            0,
            &[Index(0), Index(0), Key("name")],
        ),
    }
}

/// Positional `data` array for a queue join.
pub(crate) fn build_data(
    kind: BackendKind,
    prompt: &str,
    params: &JobParams,
    dims: Dimensions,
    seed: u64,
) -> Value {
    let negative = params
        .negative_prompt
        .as_deref()
        .unwrap_or(DEFAULT_NEGATIVE_PROMPT);
    match kind {
        BackendKind::SdxlLightning => json!([prompt, "8-Step"]),
        BackendKind::SdxlTcd => json!([prompt, 10, -1, 0.5]),
        BackendKind::Kandinsky => {
            json!([prompt, dims.width.to_string(), dims.height.to_string()])
        }
        BackendKind::DalleXl => {
            json!([prompt, negative, true, seed, dims.width, dims.height, 6, true])
        }
        BackendKind::Animagine => json!([
            prompt,
            format!("(rating_explicit:1.2), {negative}"),
            seed,
            1024,
            1024,
            7,
            28,
            "Euler a",
            dims.label(),
            "(None)",
            "Standard v3.1",
            false,
            0.55,
            1.5,
            true
        ]),
        BackendKind::StableCascade => {
            json!([prompt, negative, seed, dims.width, dims.height, 30, 4, 12, 0, 1])
        }
        BackendKind::MeloTts => {
            let (language, speaker) = melo_language(params.language.as_deref());
            json!([speaker, prompt, 1, language])
        }
        BackendKind::AnimateDiff => json!([prompt, "epiCRealism", "", 8]),
        BackendKind::MusicGen => json!([
            "large",
            prompt,
            null,
            30,
            2,
            280,
            1150,
            0.7,
            8.5,
            MUSICGEN_BANNER.trim(),
            "MusicGen",
            "./assets/arial.ttf",
            "#fff",
            -1,
            2,
            0,
            true,
            false,
            "No"
        ]),
    }
}

pub(crate) fn warmup_data() -> Value {
    json!([0, true])
}

/// `(language, speaker)` codes; anything unrecognised speaks English.
pub(crate) fn melo_language(language: Option<&str>) -> (&'static str, &'static str) {
    match language.map(str::trim).unwrap_or_default().to_ascii_lowercase().as_str() {
        "spanish" | "es" => ("ES", "ES"),
        "french" | "fr" => ("FR", "FR"),
        "chinese" | "zh" => ("ZH", "ZH"),
        "korean" | "kr" => ("KR", "KR"),
        "japanese" | "jp" => ("JP", "JP"),
        _ => ("EN", "EN-US"),
    }
}

/// Walks `path` from a completion event's `output.data`.
pub(crate) fn extract_locator(event: &Value, path: &[PathStep]) -> Option<String> {
    let mut cursor = event.get("output")?.get("data")?;
    for step in path {
        cursor = match step {
            PathStep::Index(index) => cursor.get(*index)?,
            PathStep::Key(key) => cursor.get(*key)?,
        };
    }
    cursor
        .as_str()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use queuecast_contracts::catalog::{BackendKind, Dimensions, Resolution};
    use queuecast_contracts::jobs::JobParams;
    use serde_json::json;

    use super::*;

    #[test]
    fn dalle_payload_carries_dimensions_and_seed() {
        let data = build_data(
            BackendKind::DalleXl,
            "a red fox",
            &JobParams::default().with_resolution(Resolution::Wide),
            Dimensions::new(1280, 768),
            123_456_789,
        );
        assert_eq!(
            data,
            json!(["a red fox", DEFAULT_NEGATIVE_PROMPT, true, 123_456_789u64, 1280, 768, 6, true])
        );
    }

    #[test]
    fn kandinsky_sends_dimensions_as_strings() {
        let data = build_data(
            BackendKind::Kandinsky,
            "x",
            &JobParams::default(),
            Dimensions::new(768, 1280),
            1,
        );
        assert_eq!(data, json!(["x", "768", "1280"]));
    }

    #[test]
    fn animagine_uses_size_label_and_prefixed_negative() {
        let data = build_data(
            BackendKind::Animagine,
            "x",
            &JobParams::default(),
            Dimensions::new(1152, 896),
            5,
        );
        assert_eq!(data[8], json!("1152 x 896"));
        assert!(data[1]
            .as_str()
            .unwrap()
            .starts_with("(rating_explicit:1.2), (deformed"));
    }

    #[test]
    fn melo_maps_languages() {
        assert_eq!(melo_language(Some("English")), ("EN", "EN-US"));
        assert_eq!(melo_language(Some("spanish")), ("ES", "ES"));
        assert_eq!(melo_language(Some("Klingon")), ("EN", "EN-US"));
        assert_eq!(melo_language(None), ("EN", "EN-US"));
        let data = build_data(
            BackendKind::MeloTts,
            "bonjour",
            &JobParams::default().with_language("French"),
            Dimensions::new(1024, 1024),
            1,
        );
        assert_eq!(data, json!(["FR", "bonjour", 1, "FR"]));
    }

    #[test]
    fn musicgen_payload_embeds_banner() {
        let data = build_data(
            BackendKind::MusicGen,
            "lofi",
            &JobParams::default(),
            Dimensions::new(1024, 1024),
            1,
        );
        assert_eq!(data.as_array().map(Vec::len), Some(19));
        assert!(data[9].as_str().unwrap().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn locator_paths_match_backend_shapes() {
        let flat = json!({"output": {"data": [{"url": "https://x/img.png"}]}});
        assert_eq!(
            extract_locator(&flat, profile(BackendKind::SdxlTcd).result_path).as_deref(),
            Some("https://x/img.png")
        );

        let gallery = json!({"output": {"data": [[{"image": {"url": "https://x/g.png"}}]]}});
        assert_eq!(
            extract_locator(&gallery, profile(BackendKind::Kandinsky).result_path).as_deref(),
            Some("https://x/g.png")
        );

        let video = json!({"output": {"data": [{"video": {"url": "https://x/v.mp4"}}]}});
        assert_eq!(
            extract_locator(&video, profile(BackendKind::AnimateDiff).result_path).as_deref(),
            Some("https://x/v.mp4")
        );

        let missing = json!({"output": {"data": [{}]}});
        assert!(extract_locator(&missing, profile(BackendKind::SdxlTcd).result_path).is_none());
        assert!(extract_locator(&json!({}), profile(BackendKind::SdxlTcd).result_path).is_none());
    }
}
