//! EMF preparation of the renderer's intermediate SVG.
//!
//! EMF has no alpha channel, so everything transparent is either removed or
//! flattened onto the figure background before the host converts the markup.

pub mod color;
pub mod composite;
pub mod svg;

use crate::request::Payload;
use color::{Rgb, parse_color};
use futures::future::try_join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use svg::{Document, Element, SvgError};
use thiserror::Error;
use tracing::debug;

pub use composite::composite_png;

const SHAPES: &[&str] = &[
    "rect", "path", "circle", "ellipse", "line", "polyline", "polygon",
];

static GRADIENT_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"url\(\s*['"]?#([^'")\s]+)['"]?\s*\)"#).unwrap());

#[derive(Debug, Error)]
pub enum PostProcessError {
    #[error(transparent)]
    Svg(#[from] SvgError),
    #[error("failed to decode embedded image: {0}")]
    Decode(String),
    #[error("failed to encode embedded image: {0}")]
    Encode(String),
    #[error("image compositing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Background the vector output is flattened onto: the figure's own color,
/// then the template's, then white.
pub fn resolve_background(payload: &Payload) -> Rgb {
    payload
        .background()
        .and_then(Rgb::parse)
        .unwrap_or(Rgb::WHITE)
}

/// Runs every cleanup rule over `markup` and serializes the result.
pub async fn clean_vector(markup: &str, background: Rgb) -> Result<String, PostProcessError> {
    let document = Document::parse(markup)?;
    let document = prune_invisible(document);
    let document = fill_transparent_rects(document, background);
    let document = drop_overlays(document);
    let document = fix_colorbar_gradients(document);
    let document = flatten_rgba_paths(document);
    let document = composite_images(document, background).await?;
    Ok(document.to_markup())
}

fn is_zero(value: Option<String>) -> bool {
    value
        .and_then(|raw| {
            raw.trim()
                .trim_end_matches("px")
                .trim_end_matches('%')
                .parse::<f64>()
                .ok()
        })
        .is_some_and(|v| v == 0.0)
}

fn is_shape(element: &Element) -> bool {
    SHAPES.contains(&element.name.as_str())
}

fn is_overlay(element: &Element) -> bool {
    element.name == "rect"
        && (element.has_class("legendtoggle")
            || (element.has_class("cbbg") && is_zero(element.paint("fill-opacity"))))
}

/// Drops shapes with `fill-opacity: 0` plus `stroke-opacity: 0`, or `opacity: 0`.
pub fn prune_invisible(document: Document) -> Document {
    document.rebuild(|element| {
        if !is_shape(&element) {
            return Some(element);
        }
        let hidden = is_zero(element.paint("opacity"))
            || (is_zero(element.paint("fill-opacity")) && is_zero(element.paint("stroke-opacity")));
        (!hidden).then_some(element)
    })
}

/// Rects left with an invisible fill take the background as an opaque fill,
/// whether or not they carry a border.
pub fn fill_transparent_rects(document: Document, background: Rgb) -> Document {
    let fill = background.to_string();
    document.rebuild(|mut element| {
        if element.name == "rect" && !is_overlay(&element) && is_zero(element.paint("fill-opacity")) {
            element.set_paint("fill", &fill);
            element.set_paint("fill-opacity", "1");
        }
        Some(element)
    })
}

/// Removes legend toggles and transparent colorbar backgrounds.
pub fn drop_overlays(document: Document) -> Document {
    document.rebuild(|element| (!is_overlay(&element)).then_some(element))
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

fn number_attr(element: &Element, key: &str) -> Option<f64> {
    element
        .attr(key)
        .and_then(|raw| raw.trim().trim_end_matches("px").parse::<f64>().ok())
}

/// Fraction of the bounding box, accepting `0.5` and `50%`.
fn fraction_attr(element: &Element, key: &str, default: f64) -> f64 {
    let Some(raw) = element.attr(key).map(str::trim) else {
        return default;
    };
    match raw.strip_suffix('%') {
        Some(percent) => percent.parse::<f64>().map(|v| v / 100.0).unwrap_or(default),
        None => raw.parse::<f64>().unwrap_or(default),
    }
}

fn format_coord(value: f64) -> String {
    let rounded = (value * 1000.0).round() / 1000.0;
    if rounded.fract() == 0.0 {
        format!("{}", rounded as i64)
    } else {
        format!("{rounded}")
    }
}

/// Moves colorbar gradients from bounding-box units into the fill rect's own
/// user space, so the second stop ends at the rect's height.
pub fn fix_colorbar_gradients(document: Document) -> Document {
    let mut targets: HashMap<String, Bounds> = HashMap::new();
    document.root.walk(&mut |element| {
        if element.name != "rect" || !element.has_class("cbfill") {
            return;
        }
        let Some(fill) = element.paint("fill") else {
            return;
        };
        let Some(id) = GRADIENT_REF_RE.captures(&fill).map(|caps| caps[1].to_string()) else {
            return;
        };
        let bounds = Bounds {
            x: number_attr(element, "x").unwrap_or(0.0),
            y: number_attr(element, "y").unwrap_or(0.0),
            width: number_attr(element, "width").unwrap_or(0.0),
            height: number_attr(element, "height").unwrap_or(0.0),
        };
        targets.insert(id, bounds);
    });

    if targets.is_empty() {
        return document;
    }
    debug!(gradients = targets.len(), "anchoring colorbar gradients");

    document.rebuild(|mut element| {
        if element.name != "linearGradient" {
            return Some(element);
        }
        let Some(bounds) = element.attr("id").and_then(|id| targets.get(id)).copied() else {
            return Some(element);
        };
        if element.attr("gradientUnits") == Some("userSpaceOnUse") {
            return Some(element);
        }
        let x1 = bounds.x + fraction_attr(&element, "x1", 0.0) * bounds.width;
        let y1 = bounds.y + fraction_attr(&element, "y1", 0.0) * bounds.height;
        let x2 = bounds.x + fraction_attr(&element, "x2", 1.0) * bounds.width;
        let y2 = bounds.y + fraction_attr(&element, "y2", 0.0) * bounds.height;
        element.set_attr("gradientUnits", "userSpaceOnUse");
        element.set_attr("x1", format_coord(x1));
        element.set_attr("y1", format_coord(y1));
        element.set_attr("x2", format_coord(x2));
        element.set_attr("y2", format_coord(y2));
        Some(element)
    })
}

/// Paths filled with `rgba()` lose their alpha; fully transparent ones go away.
pub fn flatten_rgba_paths(document: Document) -> Document {
    document.rebuild(|mut element| {
        if element.name != "path" {
            return Some(element);
        }
        let Some(fill) = element.paint("fill") else {
            return Some(element);
        };
        if !fill.trim_start().to_ascii_lowercase().starts_with("rgba(") {
            return Some(element);
        }
        let Some(color) = parse_color(&fill) else {
            return Some(element);
        };
        if color.is_transparent() {
            return None;
        }
        element.set_paint("fill", &color.rgb.to_string());
        Some(element)
    })
}

fn image_href(element: &Element) -> Option<&str> {
    if element.name != "image" {
        return None;
    }
    element
        .attr("xlink:href")
        .or_else(|| element.attr("href"))
        .filter(|href| href.starts_with(composite::PNG_URI_PREFIX))
}

/// Flattens every embedded base64 PNG onto the background. Each image is
/// decoded on the blocking pool; the document is rebuilt once all finish.
pub async fn composite_images(
    document: Document,
    background: Rgb,
) -> Result<Document, PostProcessError> {
    let mut hrefs: Vec<String> = Vec::new();
    document.root.walk(&mut |element| {
        if let Some(href) = image_href(element) {
            hrefs.push(href.to_string());
        }
    });
    if hrefs.is_empty() {
        return Ok(document);
    }
    debug!(images = hrefs.len(), "compositing embedded images");

    let tasks = hrefs.into_iter().map(|href| {
        tokio::task::spawn_blocking(move || composite::composite_data_uri(&href, background))
    });
    let mut flattened = try_join_all(tasks)
        .await?
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?
        .into_iter();

    Ok(document.rebuild(|mut element| {
        if image_href(&element).is_none() {
            return Some(element);
        }
        if let Some(href) = flattened.next() {
            let key = if element.attr("xlink:href").is_some() {
                "xlink:href"
            } else {
                "href"
            };
            element.set_attr(key, href);
        }
        Some(element)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Figure;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use resvg::tiny_skia::{Color, Pixmap};
    use serde_json::{Map, json};

    fn doc(markup: &str) -> Document {
        Document::parse(markup).unwrap()
    }

    #[test]
    fn removes_fully_transparent_shapes() {
        let out = prune_invisible(doc(
            r#"<svg><rect style="fill-opacity: 0; stroke-opacity: 0"/><path style="opacity:0"/><rect style="fill-opacity: 0; stroke-opacity: 1"/><g style="opacity: 0"/></svg>"#,
        ));
        assert_eq!(
            out.to_markup(),
            r#"<svg><rect style="fill-opacity: 0; stroke-opacity: 1"/><g style="opacity: 0"/></svg>"#
        );
    }

    #[test]
    fn bordered_transparent_rects_take_background_fill() {
        let out = fill_transparent_rects(
            doc(r#"<svg><rect class="bg" style="fill: rgb(0, 0, 0); fill-opacity: 0; stroke: rgb(68, 68, 68); stroke-opacity: 1; stroke-width: 1px"/></svg>"#),
            Rgb::new(255, 0, 0),
        );
        let rect = out.root.child_elements().next().unwrap();
        assert_eq!(rect.paint("fill").as_deref(), Some("rgb(255, 0, 0)"));
        assert_eq!(rect.paint("fill-opacity").as_deref(), Some("1"));
    }

    #[test]
    fn strokeless_transparent_rects_take_background_fill() {
        let out = fill_transparent_rects(
            doc(r#"<svg><rect class="bg" style="fill: rgb(0, 0, 0); fill-opacity: 0; stroke-width: 0;"/><rect class="legendtoggle" style="fill-opacity: 0"/></svg>"#),
            Rgb::new(255, 0, 0),
        );
        let mut rects = out.root.child_elements();
        let bg = rects.next().unwrap();
        assert_eq!(bg.paint("fill").as_deref(), Some("rgb(255, 0, 0)"));
        assert_eq!(bg.paint("fill-opacity").as_deref(), Some("1"));
        let toggle = rects.next().unwrap();
        assert_eq!(toggle.paint("fill-opacity").as_deref(), Some("0"));
    }

    #[test]
    fn drops_legend_toggles_and_transparent_colorbar_backgrounds() {
        let out = drop_overlays(doc(
            r#"<svg><rect class="legendtoggle" style="fill-opacity: 0"/><rect class="cbbg" style="fill-opacity: 0; stroke: #444"/><rect class="cbbg" style="fill: red; fill-opacity: 1"/></svg>"#,
        ));
        assert_eq!(
            out.to_markup(),
            r#"<svg><rect class="cbbg" style="fill: red; fill-opacity: 1"/></svg>"#
        );
    }

    #[test]
    fn colorbar_gradient_is_anchored_to_fill_rect() {
        let out = fix_colorbar_gradients(doc(
            r#"<svg><defs><linearGradient id="g1" x1="0" x2="0" y1="1" y2="0"><stop offset="0%"/><stop offset="100%"/></linearGradient></defs><rect class="cbfill" x="0" y="10" width="30" height="200" style="fill: url('#g1')"/></svg>"#,
        ));
        let mut gradient = None;
        out.root.walk(&mut |element| {
            if element.name == "linearGradient" {
                gradient = Some(element.clone());
            }
        });
        let gradient = gradient.unwrap();
        assert_eq!(gradient.attr("gradientUnits"), Some("userSpaceOnUse"));
        assert_eq!(gradient.attr("x1"), Some("0"));
        assert_eq!(gradient.attr("y1"), Some("210"));
        assert_eq!(gradient.attr("x2"), Some("0"));
        assert_eq!(gradient.attr("y2"), Some("10"));
    }

    #[test]
    fn unreferenced_gradients_are_untouched() {
        let markup = r#"<svg><linearGradient id="other" x1="0"/><rect class="cbfill" style="fill: url(#g1)"/></svg>"#;
        assert_eq!(fix_colorbar_gradients(doc(markup)).to_markup(), markup);
    }

    #[test]
    fn rgba_path_fills_lose_alpha() {
        let out = flatten_rgba_paths(doc(
            r#"<svg><path style="fill: rgba(10, 20, 30, 0.5)"/><path fill="rgba(1,2,3,0)"/><path style="fill: rgb(1, 1, 1)"/></svg>"#,
        ));
        assert_eq!(
            out.to_markup(),
            r#"<svg><path style="fill: rgb(10, 20, 30);"/><path style="fill: rgb(1, 1, 1)"/></svg>"#
        );
    }

    #[test]
    fn background_resolution_order() {
        let mut layout = Map::new();
        let figure = |layout: &Map<String, serde_json::Value>| {
            Payload::Figure(Figure {
                data: Vec::new(),
                layout: layout.clone(),
            })
        };
        assert_eq!(resolve_background(&figure(&layout)), Rgb::WHITE);
        layout.insert("template".into(), json!({"layout": {"paper_bgcolor": "#000"}}));
        assert_eq!(resolve_background(&figure(&layout)), Rgb::new(0, 0, 0));
        layout.insert("paper_bgcolor".into(), json!("red"));
        assert_eq!(resolve_background(&figure(&layout)), Rgb::new(255, 0, 0));
    }

    #[tokio::test]
    async fn embedded_images_are_composited() {
        let mut pixmap = Pixmap::new(1, 1).unwrap();
        pixmap.fill(Color::TRANSPARENT);
        let png = pixmap.encode_png().unwrap();
        let href = format!("{}{}", composite::PNG_URI_PREFIX, STANDARD.encode(&png));
        let markup = format!(
            r#"<svg><image xlink:href="{href}"/><image href="{href}"/><image href="http://x/y.png"/></svg>"#
        );

        let out = composite_images(doc(&markup), Rgb::new(0, 255, 0)).await.unwrap();
        let mut hrefs = Vec::new();
        out.root.walk(&mut |element| {
            if let Some(href) = image_href(element) {
                hrefs.push(href.to_string());
            }
        });
        assert_eq!(hrefs.len(), 2);
        for href in hrefs {
            let bytes = STANDARD
                .decode(&href[composite::PNG_URI_PREFIX.len()..])
                .unwrap();
            let pixmap = Pixmap::decode_png(&bytes).unwrap();
            let px = pixmap.pixels()[0];
            assert_eq!((px.red(), px.green(), px.blue(), px.alpha()), (0, 255, 0, 255));
        }
    }

    #[tokio::test]
    async fn clean_vector_runs_every_rule() {
        let markup = r#"<svg xmlns="http://www.w3.org/2000/svg"><rect class="bg" style="fill: rgb(0, 0, 0); fill-opacity: 0; stroke: #444; stroke-opacity: 1; stroke-width: 1px"/><rect style="fill-opacity: 0; stroke-opacity: 0"/><rect class="legendtoggle" style="fill-opacity: 0"/><path style="fill: rgba(0, 0, 0, 0)"/></svg>"#;
        let out = clean_vector(markup, Rgb::new(255, 0, 0)).await.unwrap();
        assert!(!out.contains("stroke-opacity: 0"));
        assert!(!out.contains("legendtoggle"));
        assert!(!out.contains("<path"));
        assert!(out.contains("fill: rgb(255, 0, 0)"));
    }

    #[tokio::test]
    async fn clean_vector_reports_malformed_markup() {
        let err = clean_vector("<svg><g></svg>", Rgb::WHITE).await.unwrap_err();
        assert!(matches!(err, PostProcessError::Svg(_)));
    }
}
