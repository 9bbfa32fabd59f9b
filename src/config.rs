use crate::format::{PDF_LOAD_TIMEOUT_MS, PLOT_GL_PIXEL_RATIO};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Top-level keys the diagram engine accepts in its configuration object.
pub const DIAGRAM_CONFIG_KEYS: &[&str] = &[
    "theme",
    "themeVariables",
    "themeCSS",
    "fontFamily",
    "fontSize",
    "altFontFamily",
    "logLevel",
    "securityLevel",
    "startOnLoad",
    "arrowMarkerAbsolute",
    "secure",
    "legacyMathML",
    "forceLegacyMathML",
    "deterministicIds",
    "deterministicIDSeed",
    "maxTextSize",
    "maxEdges",
    "darkMode",
    "htmlLabels",
    "wrap",
    "markdownAutoWrap",
    "suppressErrorRendering",
    "look",
    "handDrawnSeed",
    "layout",
    "elk",
    "dompurifyConfig",
    "flowchart",
    "sequence",
    "gantt",
    "journey",
    "timeline",
    "class",
    "state",
    "er",
    "pie",
    "quadrantChart",
    "xyChart",
    "requirement",
    "architecture",
    "mindmap",
    "kanban",
    "gitGraph",
    "c4",
    "sankey",
    "packet",
    "block",
    "radar",
];

/// Options the host hands to the exporter, independent of any single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExporterOptions {
    /// Run the hang-prevention estimator on chart requests.
    pub safe_mode: bool,
    pub mapbox_access_token: Option<String>,
    #[serde(rename = "topojsonURL")]
    pub topojson_url: Option<String>,
    pub plot_gl_pixel_ratio: Option<f64>,
    pub pdf_load_timeout_ms: u64,
    /// Upper bound on a single renderer call; unbounded when absent.
    pub render_timeout_ms: Option<u64>,
    pub diagram_config_keys: BTreeSet<String>,
}

impl Default for ExporterOptions {
    fn default() -> Self {
        Self {
            safe_mode: false,
            mapbox_access_token: None,
            topojson_url: None,
            plot_gl_pixel_ratio: None,
            pdf_load_timeout_ms: PDF_LOAD_TIMEOUT_MS,
            render_timeout_ms: None,
            diagram_config_keys: DIAGRAM_CONFIG_KEYS.iter().map(|key| key.to_string()).collect(),
        }
    }
}

impl ExporterOptions {
    pub fn pixel_ratio(&self) -> f64 {
        self.plot_gl_pixel_ratio
            .filter(|ratio| ratio.is_finite() && *ratio > 0.0)
            .unwrap_or(PLOT_GL_PIXEL_RATIO)
    }

    pub fn pdf_load_timeout(&self) -> Duration {
        Duration::from_millis(self.pdf_load_timeout_ms)
    }

    pub fn render_timeout(&self) -> Option<Duration> {
        self.render_timeout_ms.map(Duration::from_millis)
    }

    /// Empty strings count as unset, matching how the host passes blank flags.
    pub fn mapbox_token(&self) -> Option<&str> {
        self.mapbox_access_token.as_deref().filter(|token| !token.is_empty())
    }

    pub fn topojson(&self) -> Option<&str> {
        self.topojson_url.as_deref().filter(|url| !url.is_empty())
    }
}

pub fn load_options(path: Option<&Path>) -> anyhow::Result<ExporterOptions> {
    let Some(path) = path else {
        return Ok(ExporterOptions::default());
    };

    let contents = std::fs::read_to_string(path)?;
    let options: ExporterOptions = serde_json::from_str(&contents)?;
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_registry() {
        let options = ExporterOptions::default();
        assert!(!options.safe_mode);
        assert_eq!(options.pixel_ratio(), 2.5);
        assert_eq!(options.pdf_load_timeout(), Duration::from_millis(20_000));
        assert!(options.render_timeout().is_none());
        assert!(options.diagram_config_keys.contains("themeVariables"));
    }

    #[test]
    fn blank_tokens_are_unset() {
        let options = ExporterOptions {
            mapbox_access_token: Some(String::new()),
            topojson_url: Some("https://tiles.example/topo".to_string()),
            ..Default::default()
        };
        assert!(options.mapbox_token().is_none());
        assert_eq!(options.topojson(), Some("https://tiles.example/topo"));
    }

    #[test]
    fn loads_partial_json_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"safeMode": true, "topojsonURL": "file:///topo", "plotGlPixelRatio": 4}}"#
        )
        .unwrap();
        let options = load_options(Some(file.path())).unwrap();
        assert!(options.safe_mode);
        assert_eq!(options.topojson(), Some("file:///topo"));
        assert_eq!(options.pixel_ratio(), 4.0);
        assert_eq!(options.pdf_load_timeout_ms, PDF_LOAD_TIMEOUT_MS);
    }

    #[test]
    fn missing_path_yields_defaults() {
        assert_eq!(load_options(None).unwrap(), ExporterOptions::default());
    }
}
