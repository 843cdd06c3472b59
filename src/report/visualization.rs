use std::io::Cursor;

use base64::{Engine, engine::general_purpose::STANDARD};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::Array2;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorScheme {
    /// Blue through cyan, green and yellow to red.
    HeatMap,
    Turbo,
    Inferno,
    Plasma,
}

const INFERNO: [(f32, f32, f32); 5] = [
    (0.0, 0.0, 4.0),
    (87.0, 16.0, 110.0),
    (188.0, 55.0, 84.0),
    (249.0, 142.0, 9.0),
    (252.0, 255.0, 164.0),
];

const PLASMA: [(f32, f32, f32); 5] = [
    (13.0, 8.0, 135.0),
    (126.0, 3.0, 168.0),
    (204.0, 71.0, 120.0),
    (248.0, 149.0, 64.0),
    (240.0, 249.0, 33.0),
];

/// Renders normalized signal maps as colored PNGs.
#[derive(Debug, Clone, Copy)]
pub struct Visualizer {
    color_scheme: ColorScheme,
}

impl Visualizer {
    pub fn new() -> Self {
        Self::with_scheme(ColorScheme::HeatMap)
    }

    pub fn with_scheme(color_scheme: ColorScheme) -> Self {
        Self { color_scheme }
    }

    /// Colorizes a map whose values are already in [0, 1].
    pub fn create_heatmap(&self, map: &Array2<f64>) -> RgbImage {
        let (height, width) = map.dim();
        let mut heatmap = RgbImage::new(width as u32, height as u32);

        for ((y, x), &value) in map.indexed_iter() {
            let intensity = if value.is_finite() { value as f32 } else { 0.0 };
            heatmap.put_pixel(x as u32, y as u32, self.intensity_to_color(intensity));
        }

        heatmap
    }

    fn intensity_to_color(&self, intensity: f32) -> Rgb<u8> {
        let intensity = intensity.clamp(0.0, 1.0);

        match self.color_scheme {
            ColorScheme::HeatMap => {
                let (r, g, b) = if intensity < 0.25 {
                    (0.0, intensity / 0.25, 1.0)
                } else if intensity < 0.5 {
                    (0.0, 1.0, 1.0 - (intensity - 0.25) / 0.25)
                } else if intensity < 0.75 {
                    ((intensity - 0.5) / 0.25, 1.0, 0.0)
                } else {
                    (1.0, 1.0 - (intensity - 0.75) / 0.25, 0.0)
                };
                Rgb([(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8])
            }
            ColorScheme::Turbo => {
                let (r, g, b) = Self::turbo_color(intensity);
                Rgb([(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8])
            }
            ColorScheme::Inferno => Self::interpolate_anchors(&INFERNO, intensity),
            ColorScheme::Plasma => Self::interpolate_anchors(&PLASMA, intensity),
        }
    }

    fn turbo_color(t: f32) -> (f32, f32, f32) {
        let r = 0.13572138
            + t * (4.6153926 + t * (-42.660324 + t * (132.13108 + t * (-152.9424 + t * 59.28638))));
        let g = 0.09140261
            + t * (2.1941884 + t * (4.8429666 + t * (-14.185033 + t * (4.2772985 + t * 2.829566))));
        let b = 0.1066733
            + t * (12.641946 + t * (-60.582047 + t * (110.36277 + t * (-89.90311 + t * 27.34825))));
        (r.clamp(0.0, 1.0), g.clamp(0.0, 1.0), b.clamp(0.0, 1.0))
    }

    fn interpolate_anchors(anchors: &[(f32, f32, f32)], t: f32) -> Rgb<u8> {
        let segments = (anchors.len() - 1) as f32;
        let pos = t * segments;
        let lower = (pos.floor() as usize).min(anchors.len() - 2);
        let frac = pos - lower as f32;
        let (r0, g0, b0) = anchors[lower];
        let (r1, g1, b1) = anchors[lower + 1];
        Rgb([
            (r0 + (r1 - r0) * frac) as u8,
            (g0 + (g1 - g0) * frac) as u8,
            (b0 + (b1 - b0) * frac) as u8,
        ])
    }

    pub fn encode_png_base64(&self, map: &Array2<f64>) -> Result<String> {
        let heatmap = self.create_heatmap(map);
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(heatmap).write_to(&mut buffer, ImageFormat::Png)?;
        Ok(STANDARD.encode(buffer.into_inner()))
    }
}

impl Default for Visualizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heatmap_endpoints_are_blue_and_red() {
        let vis = Visualizer::new();
        assert_eq!(vis.intensity_to_color(0.0), Rgb([0, 0, 255]));
        assert_eq!(vis.intensity_to_color(1.0), Rgb([255, 0, 0]));
    }

    #[test]
    fn anchor_schemes_hit_their_endpoints() {
        let inferno = Visualizer::with_scheme(ColorScheme::Inferno);
        assert_eq!(inferno.intensity_to_color(0.0), Rgb([0, 0, 4]));
        assert_eq!(inferno.intensity_to_color(1.0), Rgb([252, 255, 164]));
    }

    #[test]
    fn png_encoding_produces_base64_payload() {
        let vis = Visualizer::with_scheme(ColorScheme::Plasma);
        let map = Array2::from_shape_fn((8, 8), |(y, x)| (x + y) as f64 / 14.0);
        let encoded = vis.encode_png_base64(&map).unwrap();
        let bytes = STANDARD.decode(encoded).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
    }
}
