//! Source and target format vocabulary.
//!
//! Sources are classified into three readiness classes. Anything the parser
//! does not recognise is unsupported; nothing is inferred from file content.

use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Readiness class of an uploaded source format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FormatClass {
    /// Can be served to AR viewers without conversion.
    ArReady,
    /// Must be converted before it can be served.
    Convertible,
    Unsupported,
}

/// Source formats accepted at upload.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SourceFormat {
    Glb,
    Gltf,
    Usdz,
    Fbx,
    Obj,
    Stl,
    #[serde(rename = "3ds")]
    #[strum(serialize = "3ds")]
    ThreeDs,
    Step,
    Stp,
}

impl SourceFormat {
    pub fn class(self) -> FormatClass {
        match self {
            SourceFormat::Glb | SourceFormat::Gltf | SourceFormat::Usdz => FormatClass::ArReady,
            _ => FormatClass::Convertible,
        }
    }

    pub fn is_gltf_family(self) -> bool {
        matches!(self, SourceFormat::Glb | SourceFormat::Gltf)
    }

    /// Interchange formats whose exporters conventionally write Z-up scenes.
    pub fn is_z_up(self) -> bool {
        matches!(
            self,
            SourceFormat::Fbx
                | SourceFormat::Obj
                | SourceFormat::ThreeDs
                | SourceFormat::Step
                | SourceFormat::Stp
                | SourceFormat::Stl
        )
    }
}

/// Parse a raw extension such as `".GLB"` or `"fbx"`.
pub fn parse_extension(ext: &str) -> Option<SourceFormat> {
    ext.trim().trim_start_matches('.').parse().ok()
}

/// Classify a raw extension. Unknown or empty extensions are unsupported.
pub fn classify_extension(ext: &str) -> FormatClass {
    parse_extension(ext)
        .map(SourceFormat::class)
        .unwrap_or(FormatClass::Unsupported)
}

/// Lower-cased extension of a file name, or an empty string if it has none.
pub fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Map an upload `Content-Type` onto a source format.
///
/// Parameters after `;` are ignored. Generic types such as
/// `application/octet-stream` yield `None` so that the caller falls back to
/// the file extension.
pub fn from_mime(mime: &str) -> Option<SourceFormat> {
    let essence = mime
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "model/gltf-binary" => Some(SourceFormat::Glb),
        "model/gltf+json" => Some(SourceFormat::Gltf),
        "model/vnd.usdz+zip" | "model/vnd.pixar.usd" | "model/usd" => Some(SourceFormat::Usdz),
        "model/obj" | "text/prs.wavefront-obj" => Some(SourceFormat::Obj),
        "model/stl" | "model/x.stl-binary" | "model/x.stl-ascii" | "application/sla" => {
            Some(SourceFormat::Stl)
        }
        "model/step" | "model/step+zip" | "application/step" => Some(SourceFormat::Step),
        "application/x-3ds" | "image/x-3ds" => Some(SourceFormat::ThreeDs),
        "application/vnd.autodesk.fbx" | "model/vnd.fbx" => Some(SourceFormat::Fbx),
        _ => None,
    }
}

/// Output formats the conversion stages can produce.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TargetFormat {
    Gltf,
    Glb,
    /// Draco-compressed GLB.
    Draco,
    Usdz,
}

impl TargetFormat {
    pub fn extension(self) -> &'static str {
        match self {
            TargetFormat::Gltf => "gltf",
            TargetFormat::Glb | TargetFormat::Draco => "glb",
            TargetFormat::Usdz => "usdz",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            TargetFormat::Gltf => "model/gltf+json",
            TargetFormat::Glb | TargetFormat::Draco => "model/gltf-binary",
            TargetFormat::Usdz => "model/vnd.usdz+zip",
        }
    }

    /// The source format an artifact of this target reads back as.
    pub fn as_source(self) -> SourceFormat {
        match self {
            TargetFormat::Gltf => SourceFormat::Gltf,
            TargetFormat::Glb | TargetFormat::Draco => SourceFormat::Glb,
            TargetFormat::Usdz => SourceFormat::Usdz,
        }
    }
}
