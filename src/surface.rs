//! Request-scoped display surfaces.
//!
//! A PDF or EPS export loads the intermediate SVG onto a fresh surface sized to
//! the output page. Loading is bounded by a timeout; the loaded page is handed
//! to the host for printing.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use once_cell::sync::Lazy;
use resvg::tiny_skia::{Pixmap, Transform};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

static FONTS: Lazy<Arc<usvg::fontdb::Database>> = Lazy::new(|| {
    let mut db = usvg::fontdb::Database::new();
    db.load_system_fonts();
    Arc::new(db)
});

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("too long to load image")]
    Timeout,
    #[error("{0}")]
    Load(String),
    #[error("invalid surface size {width}x{height}")]
    Size { width: u32, height: u32 },
    #[error("failed to encode image: {0}")]
    Encode(String),
    #[error("surface task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A page ready to be printed by the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintPage {
    /// CSS applied to the print document.
    pub style: String,
    pub width: u32,
    pub height: u32,
    pub background: String,
    /// The vector image as loaded.
    pub markup: String,
}

impl PrintPage {
    /// A standalone print document: the page style plus the image, ready for
    /// an HTML-to-PDF converter.
    pub fn to_html(&self) -> String {
        format!(
            "<!DOCTYPE html><html><head><style>{}</style></head><body><img src=\"data:image/svg+xml;base64,{}\" width=\"{}\" height=\"{}\"/></body></html>",
            self.style,
            STANDARD.encode(&self.markup),
            self.width,
            self.height
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplaySurface {
    width: u32,
    height: u32,
    background: String,
}

impl DisplaySurface {
    /// A surface of `width*scale x height*scale` pixels.
    pub fn new(width: f64, height: f64, scale: f64, background: impl Into<String>) -> Self {
        Self {
            width: pixel_extent(width * scale),
            height: pixel_extent(height * scale),
            background: background.into(),
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn page_style(&self) -> String {
        format!(
            "@page {{ size: {}px {}px; }} body {{ margin: 0; padding: 0; background-color: {}; }}",
            self.width, self.height, self.background
        )
    }

    /// Loads `image` onto the surface, failing with [`SurfaceError::Timeout`]
    /// when it takes longer than `timeout`.
    pub async fn load(self, image: String, timeout: Duration) -> Result<PrintPage, SurfaceError> {
        let parse = tokio::task::spawn_blocking(move || {
            parse_tree(&image).map(|_| image)
        });
        let markup = match tokio::time::timeout(timeout, parse).await {
            Ok(joined) => joined??,
            Err(_) => return Err(SurfaceError::Timeout),
        };
        debug!(width = self.width, height = self.height, "print surface loaded");
        Ok(PrintPage {
            style: self.page_style(),
            width: self.width,
            height: self.height,
            background: self.background,
            markup,
        })
    }
}

fn pixel_extent(value: f64) -> u32 {
    value.round().clamp(1.0, f64::from(u32::MAX)) as u32
}

fn parse_tree(svg: &str) -> Result<usvg::Tree, SurfaceError> {
    let mut opt = usvg::Options::default();
    opt.font_family = "Inter".to_string();
    opt.fontdb = FONTS.clone();
    usvg::Tree::from_str(svg, &opt).map_err(|err| SurfaceError::Load(err.to_string()))
}

/// Rasterizes SVG markup into PNG bytes of `width*scale x height*scale`
/// pixels, stretching the drawing to fill the target.
pub fn rasterize_svg(svg: &str, width: f64, height: f64, scale: f64) -> Result<Vec<u8>, SurfaceError> {
    let tree = parse_tree(svg)?;
    let target_w = pixel_extent(width * scale);
    let target_h = pixel_extent(height * scale);
    let mut pixmap = Pixmap::new(target_w, target_h).ok_or(SurfaceError::Size {
        width: target_w,
        height: target_h,
    })?;

    let size = tree.size();
    let transform = Transform::from_scale(
        target_w as f32 / size.width(),
        target_h as f32 / size.height(),
    );
    let mut pixmap_mut = pixmap.as_mut();
    resvg::render(&tree, transform, &mut pixmap_mut);
    pixmap
        .encode_png()
        .map_err(|err| SurfaceError::Encode(err.to_string()))
}
