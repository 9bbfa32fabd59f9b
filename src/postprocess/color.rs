use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Opaque part of a CSS color; alpha is dropped.
    pub fn parse(input: &str) -> Option<Self> {
        parse_color(input).map(|color| color.rgb)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rgb({}, {}, {})", self.r, self.g, self.b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgba {
    pub rgb: Rgb,
    pub alpha: f64,
}

impl Rgba {
    pub fn is_transparent(&self) -> bool {
        self.alpha <= 0.0
    }
}

/// Any CSS color the browser would accept: hex, `rgb()`/`rgba()` in comma or
/// space syntax, `hsl()`/`hwb()`, `transparent` and named colors.
pub fn parse_color(input: &str) -> Option<Rgba> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let color = csscolorparser::parse(trimmed).ok()?;
    let channel = |value: f32| (f64::from(value) * 255.0).round().clamp(0.0, 255.0) as u8;
    Some(Rgba {
        rgb: Rgb::new(channel(color.r), channel(color.g), channel(color.b)),
        alpha: f64::from(color.a).clamp(0.0, 1.0),
    })
}
