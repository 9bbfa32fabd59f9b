use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;
use serde::{Serialize, Serializer};
use std::fmt;

pub const DEFAULT_CHART_FORMAT: Format = Format::Png;
pub const DEFAULT_DIAGRAM_FORMAT: Format = Format::Svg;
pub const DEFAULT_WIDTH: f64 = 700.0;
pub const DEFAULT_HEIGHT: f64 = 500.0;
pub const DEFAULT_SCALE: f64 = 1.0;

/// Pixel ratio handed to WebGL traces unless the host overrides it.
pub const PLOT_GL_PIXEL_RATIO: f64 = 2.5;

/// Time allowed for the print surface to load the intermediate image.
pub const PDF_LOAD_TIMEOUT_MS: u64 = 20_000;

/// Chart engines older than this cannot export at all.
pub const MIN_CHART_ENGINE_VERSION: Version = Version::new(1, 11, 0);
/// First chart engine release able to dump the full figure as JSON.
pub const STRUCTURED_EXPORT_VERSION: Version = Version::new(1, 53, 0);
/// First chart engine release whose export call handles data-URI stripping itself.
pub const DIRECT_EXPORT_VERSION: Version = Version::new(1, 30, 0);

pub const BASE64_PREFIX: &str = ";base64,";
pub const SVG_URI_PREFIX: &str = "data:image/svg+xml,";

pub(crate) static RASTER_URI_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^data:image/\w+;base64,").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Png,
    Jpeg,
    Webp,
    Svg,
    Pdf,
    Eps,
    Emf,
    Json,
}

impl Format {
    pub const ALL: [Format; 8] = [
        Format::Png,
        Format::Jpeg,
        Format::Webp,
        Format::Svg,
        Format::Pdf,
        Format::Eps,
        Format::Emf,
        Format::Json,
    ];

    /// Looks up a registry entry. Matching ignores ASCII case and accepts `jpg`.
    pub fn from_name(name: &str) -> Option<Self> {
        let lowered = name.trim().to_ascii_lowercase();
        let name = if lowered == "jpg" { "jpeg" } else { lowered.as_str() };
        Self::ALL.into_iter().find(|format| format.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Format::Png => "png",
            Format::Jpeg => "jpeg",
            Format::Webp => "webp",
            Format::Svg => "svg",
            Format::Pdf => "pdf",
            Format::Eps => "eps",
            Format::Emf => "emf",
            Format::Json => "json",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Format::Png => "image/png",
            Format::Jpeg => "image/jpeg",
            Format::Webp => "image/webp",
            Format::Svg => "image/svg+xml",
            Format::Pdf => "application/pdf",
            Format::Eps => "application/postscript",
            Format::Emf => "image/emf",
            Format::Json => "application/json",
        }
    }

    /// Formats the host prints from a loaded page rather than from bytes.
    pub fn is_print(self) -> bool {
        matches!(self, Format::Pdf | Format::Eps)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    Malformed,
    NotAcceptable,
    RendererError,
    RendererTooOld,
    RendererLacksFeature,
    ConversionError,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::Success => 0,
            StatusCode::Malformed => 400,
            StatusCode::NotAcceptable => 406,
            StatusCode::RendererError => 525,
            StatusCode::RendererTooOld => 526,
            StatusCode::RendererLacksFeature => 527,
            StatusCode::ConversionError => 530,
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            0 => StatusCode::Success,
            400 => StatusCode::Malformed,
            406 => StatusCode::NotAcceptable,
            525 => StatusCode::RendererError,
            526 => StatusCode::RendererTooOld,
            527 => StatusCode::RendererLacksFeature,
            530 => StatusCode::ConversionError,
            _ => return None,
        })
    }

    /// Canned text for failure codes; success carries no message.
    pub fn message(self) -> Option<&'static str> {
        match self {
            StatusCode::Success => None,
            StatusCode::Malformed => Some("invalid or malformed request syntax"),
            StatusCode::NotAcceptable => Some("requested format is not acceptable"),
            StatusCode::RendererError => Some("rendering engine error"),
            StatusCode::RendererTooOld => Some("rendering engine version 1.11.0 or up required"),
            StatusCode::RendererLacksFeature => {
                Some("rendering engine lacks a feature required by the requested format")
            }
            StatusCode::ConversionError => Some("image conversion error"),
        }
    }

    pub fn is_success(self) -> bool {
        self == StatusCode::Success
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_format() {
        let table: Vec<(&str, &str)> = Format::ALL
            .iter()
            .map(|format| (format.as_str(), format.mime_type()))
            .collect();
        assert_eq!(
            table,
            vec![
                ("png", "image/png"),
                ("jpeg", "image/jpeg"),
                ("webp", "image/webp"),
                ("svg", "image/svg+xml"),
                ("pdf", "application/pdf"),
                ("eps", "application/postscript"),
                ("emf", "image/emf"),
                ("json", "application/json"),
            ]
        );
    }

    #[test]
    fn format_names_are_case_insensitive_with_jpg_alias() {
        assert_eq!(Format::from_name("PNG"), Some(Format::Png));
        assert_eq!(Format::from_name("jpg"), Some(Format::Jpeg));
        assert_eq!(Format::from_name("gif"), None);
        assert_eq!(Format::from_name(""), None);
    }

    #[test]
    fn status_codes_round_trip_through_numbers() {
        for code in [0, 400, 406, 525, 526, 527, 530] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(status.as_u16(), code);
        }
        assert!(StatusCode::from_u16(500).is_none());
        assert!(StatusCode::Success.message().is_none());
        assert_eq!(
            StatusCode::Malformed.message(),
            Some("invalid or malformed request syntax")
        );
    }

    #[test]
    fn raster_prefix_matches_any_image_subtype() {
        assert!(RASTER_URI_PREFIX.is_match("data:image/webp;base64,AAAA"));
        assert!(!RASTER_URI_PREFIX.is_match("data:image/svg+xml,%3Csvg"));
    }
}
