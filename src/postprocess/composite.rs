use super::PostProcessError;
use super::color::Rgb;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use resvg::tiny_skia::{Pixmap, PremultipliedColorU8};

pub const PNG_URI_PREFIX: &str = "data:image/png;base64,";

/// `out = src * alpha + bg * (1 - alpha)` for one channel. `premultiplied`
/// already holds `src * alpha`.
fn blend_channel(premultiplied: u8, alpha: u8, background: u8) -> u8 {
    let rest = f64::from(255 - alpha) / 255.0;
    (f64::from(premultiplied) + f64::from(background) * rest)
        .round()
        .clamp(0.0, 255.0) as u8
}

/// Flattens every pixel of `pixmap` onto `background` and makes it opaque.
pub fn flatten_pixmap(pixmap: &mut Pixmap, background: Rgb) {
    for pixel in pixmap.pixels_mut() {
        let alpha = pixel.alpha();
        if alpha == 255 {
            continue;
        }
        let r = blend_channel(pixel.red(), alpha, background.r);
        let g = blend_channel(pixel.green(), alpha, background.g);
        let b = blend_channel(pixel.blue(), alpha, background.b);
        if let Some(opaque) = PremultipliedColorU8::from_rgba(r, g, b, 255) {
            *pixel = opaque;
        }
    }
}

/// Decodes a PNG, composites it against `background` and re-encodes it.
pub fn composite_png(png: &[u8], background: Rgb) -> Result<Vec<u8>, PostProcessError> {
    let mut pixmap =
        Pixmap::decode_png(png).map_err(|err| PostProcessError::Decode(err.to_string()))?;
    flatten_pixmap(&mut pixmap, background);
    pixmap
        .encode_png()
        .map_err(|err| PostProcessError::Encode(err.to_string()))
}

/// Same as [`composite_png`] for a `data:image/png;base64,` href.
pub fn composite_data_uri(href: &str, background: Rgb) -> Result<String, PostProcessError> {
    let encoded = href
        .strip_prefix(PNG_URI_PREFIX)
        .ok_or_else(|| PostProcessError::Decode("not a base64 png data uri".to_string()))?;
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|err| PostProcessError::Decode(err.to_string()))?;
    let flattened = composite_png(&bytes, background)?;
    Ok(format!("{PNG_URI_PREFIX}{}", STANDARD.encode(flattened)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use resvg::tiny_skia::Color;

    fn png_filled(color: Color) -> Vec<u8> {
        let mut pixmap = Pixmap::new(2, 2).unwrap();
        pixmap.fill(color);
        pixmap.encode_png().unwrap()
    }

    fn first_pixel(png: &[u8]) -> (u8, u8, u8, u8) {
        let pixmap = Pixmap::decode_png(png).unwrap();
        let px = pixmap.pixels()[0].demultiply();
        (px.red(), px.green(), px.blue(), px.alpha())
    }

    #[test]
    fn blend_follows_alpha_formula() {
        // 50% black over white
        assert_eq!(blend_channel(0, 128, 255), 127);
        // fully transparent takes the background
        assert_eq!(blend_channel(0, 0, 200), 200);
        // opaque keeps the source
        assert_eq!(blend_channel(90, 255, 10), 90);
    }

    #[test]
    fn transparent_pixels_become_background() {
        let png = png_filled(Color::TRANSPARENT);
        let out = composite_png(&png, Rgb::new(255, 0, 0)).unwrap();
        assert_eq!(first_pixel(&out), (255, 0, 0, 255));
    }

    #[test]
    fn translucent_pixels_are_blended_and_opaque() {
        let png = png_filled(Color::from_rgba8(0, 0, 255, 128));
        let (r, g, b, a) = first_pixel(&composite_png(&png, Rgb::WHITE).unwrap());
        assert_eq!(a, 255);
        assert!((126..=128).contains(&r));
        assert!((126..=128).contains(&g));
        assert_eq!(b, 255);
    }

    #[test]
    fn data_uri_round_trip_keeps_prefix() {
        let png = png_filled(Color::from_rgba8(10, 20, 30, 255));
        let href = format!("{PNG_URI_PREFIX}{}", STANDARD.encode(&png));
        let out = composite_data_uri(&href, Rgb::WHITE).unwrap();
        assert!(out.starts_with(PNG_URI_PREFIX));
        let bytes = STANDARD.decode(&out[PNG_URI_PREFIX.len()..]).unwrap();
        assert_eq!(first_pixel(&bytes), (10, 20, 30, 255));
    }

    #[test]
    fn rejects_non_png_payloads() {
        assert!(composite_data_uri("data:image/jpeg;base64,AAAA", Rgb::WHITE).is_err());
        let bogus = format!("{PNG_URI_PREFIX}{}", STANDARD.encode(b"not a png"));
        assert!(matches!(
            composite_data_uri(&bogus, Rgb::WHITE),
            Err(PostProcessError::Decode(_))
        ));
    }
}
