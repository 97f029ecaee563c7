//! Platform presets — named egress encoding profiles.
//!
//! A preset fixes the whole encoder option group for a well-known streaming
//! platform. Callers pass a preset name, explicit options, or both; explicit
//! options override the matching preset fields. An empty string in any field
//! means "omit that encoder flag group" (stream copy for codecs, source
//! geometry for resolution/framerate).

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Encoder options for an egress leg.
///
/// All fields optional; unset fields inherit from the preset (if any) or are
/// omitted from the encoder argument vector entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EncoderOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    /// "WIDTHxHEIGHT", e.g. "1920x1080".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framerate: Option<String>,
    /// e.g. "4500k".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
    /// Degrees, stored as display-matrix metadata on the output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<String>,
}

impl EncoderOptions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overlay `self` on top of `base`: any field set here wins.
    pub fn merged_over(&self, base: &EncoderOptions) -> EncoderOptions {
        EncoderOptions {
            video_codec: self.video_codec.clone().or_else(|| base.video_codec.clone()),
            audio_codec: self.audio_codec.clone().or_else(|| base.audio_codec.clone()),
            resolution: self.resolution.clone().or_else(|| base.resolution.clone()),
            framerate: self.framerate.clone().or_else(|| base.framerate.clone()),
            bitrate: self.bitrate.clone().or_else(|| base.bitrate.clone()),
            rotation: self.rotation.clone().or_else(|| base.rotation.clone()),
        }
    }
}

/// A platform preset: concrete values per flag group, empty string = omit.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PlatformPreset {
    pub video_codec: &'static str,
    pub audio_codec: &'static str,
    pub resolution: &'static str,
    pub framerate: &'static str,
    pub bitrate: &'static str,
    pub rotation: &'static str,
}

impl PlatformPreset {
    fn as_options(&self) -> EncoderOptions {
        fn opt(s: &str) -> Option<String> {
            (!s.is_empty()).then(|| s.to_string())
        }
        EncoderOptions {
            video_codec: opt(self.video_codec),
            audio_codec: opt(self.audio_codec),
            resolution: opt(self.resolution),
            framerate: opt(self.framerate),
            bitrate: opt(self.bitrate),
            rotation: opt(self.rotation),
        }
    }
}

/// The static preset table. Extend at build time; names are lowercase.
static PRESETS: Lazy<BTreeMap<&'static str, PlatformPreset>> = Lazy::new(|| {
    BTreeMap::from([
        (
            "youtube",
            PlatformPreset {
                video_codec: "libx264",
                audio_codec: "aac",
                resolution: "1920x1080",
                framerate: "30",
                bitrate: "4500k",
                rotation: "",
            },
        ),
        (
            "twitch",
            PlatformPreset {
                video_codec: "libx264",
                audio_codec: "aac",
                resolution: "1280x720",
                framerate: "30",
                bitrate: "3000k",
                rotation: "",
            },
        ),
        (
            "facebook",
            PlatformPreset {
                video_codec: "libx264",
                audio_codec: "aac",
                resolution: "1280x720",
                framerate: "30",
                bitrate: "2500k",
                rotation: "",
            },
        ),
        (
            "instagram",
            PlatformPreset {
                video_codec: "libx264",
                audio_codec: "aac",
                resolution: "720x1280",
                framerate: "30",
                bitrate: "2000k",
                rotation: "90",
            },
        ),
        // Pure remux — every flag group omitted, codecs copied.
        (
            "copy",
            PlatformPreset {
                video_codec: "",
                audio_codec: "",
                resolution: "",
                framerate: "",
                bitrate: "",
                rotation: "",
            },
        ),
    ])
});

#[derive(Debug, thiserror::Error)]
pub enum PresetError {
    #[error("unknown platform preset \"{0}\"")]
    Unknown(String),
}

/// The full preset table, for `GET /api/relay/presets`.
pub fn all() -> &'static BTreeMap<&'static str, PlatformPreset> {
    &PRESETS
}

/// Resolve a preset name + explicit options into the effective option set.
///
/// Explicit options override preset fields; with no preset the explicit
/// options stand alone; with neither, the result is empty (stream copy).
pub fn resolve(
    preset: Option<&str>,
    options: Option<&EncoderOptions>,
) -> Result<EncoderOptions, PresetError> {
    let base = match preset.filter(|p| !p.is_empty()) {
        Some(name) => PRESETS
            .get(name.to_ascii_lowercase().as_str())
            .ok_or_else(|| PresetError::Unknown(name.to_string()))?
            .as_options(),
        None => EncoderOptions::default(),
    };
    Ok(match options {
        Some(opts) => opts.merged_over(&base),
        None => base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_table_contains_known_platforms() {
        for name in ["youtube", "twitch", "facebook", "instagram", "copy"] {
            assert!(all().contains_key(name), "missing preset {name}");
        }
    }

    #[test]
    fn resolve_plain_preset() {
        let opts = resolve(Some("youtube"), None).unwrap();
        assert_eq!(opts.video_codec.as_deref(), Some("libx264"));
        assert_eq!(opts.bitrate.as_deref(), Some("4500k"));
        assert_eq!(opts.rotation, None);
    }

    #[test]
    fn resolve_is_case_insensitive() {
        let opts = resolve(Some("Twitch"), None).unwrap();
        assert_eq!(opts.resolution.as_deref(), Some("1280x720"));
    }

    #[test]
    fn explicit_options_override_preset_fields() {
        let explicit = EncoderOptions {
            bitrate: Some("6000k".into()),
            ..Default::default()
        };
        let opts = resolve(Some("youtube"), Some(&explicit)).unwrap();
        assert_eq!(opts.bitrate.as_deref(), Some("6000k"));
        // Untouched fields still come from the preset.
        assert_eq!(opts.video_codec.as_deref(), Some("libx264"));
    }

    #[test]
    fn copy_preset_is_empty() {
        let opts = resolve(Some("copy"), None).unwrap();
        assert!(opts.is_empty());
    }

    #[test]
    fn unknown_preset_is_an_error() {
        assert!(matches!(
            resolve(Some("myspace"), None),
            Err(PresetError::Unknown(_))
        ));
    }

    #[test]
    fn no_preset_no_options_is_empty() {
        assert!(resolve(None, None).unwrap().is_empty());
    }
}
