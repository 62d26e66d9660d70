//! Vertex colors

use crate::error::{MapError, MapResult};

/// Parse `#rrggbb` (or `rrggbb`) into linear 0..1 RGB components
pub fn parse_hex_color(text: &str) -> MapResult<[f32; 3]> {
    let hex = text.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(MapError::Configuration(format!(
            "invalid color '{}', expected #rrggbb",
            text
        )));
    }
    let channel = |i: usize| -> MapResult<f32> {
        u8::from_str_radix(&hex[i..i + 2], 16)
            .map(|v| v as f32 / 255.0)
            .map_err(|e| MapError::Configuration(format!("invalid color '{}': {}", text, e)))
    };
    Ok([channel(0)?, channel(2)?, channel(4)?])
}

/// Convert HSL (all components in 0..1) to RGB
pub fn hsl_to_rgb(hue: f32, saturation: f32, lightness: f32) -> [f32; 3] {
    if saturation <= 0.0 {
        return [lightness; 3];
    }
    let q = if lightness < 0.5 {
        lightness * (1.0 + saturation)
    } else {
        lightness + saturation - lightness * saturation
    };
    let p = 2.0 * lightness - q;
    let channel = |t: f32| {
        let t = t.rem_euclid(1.0);
        if t < 1.0 / 6.0 {
            p + (q - p) * 6.0 * t
        } else if t < 0.5 {
            q
        } else if t < 2.0 / 3.0 {
            p + (q - p) * (2.0 / 3.0 - t) * 6.0
        } else {
            p
        }
    };
    [
        channel(hue + 1.0 / 3.0),
        channel(hue),
        channel(hue - 1.0 / 3.0),
    ]
}

/// Terrain color for a normalized elevation: green lowlands through yellow to red peaks
pub fn elevation_color(normalized: f64) -> [f32; 3] {
    let t = if normalized.is_finite() {
        normalized.clamp(0.0, 1.0) as f32
    } else {
        0.0
    };
    hsl_to_rgb(0.33 * (1.0 - t), 0.55, 0.35 + 0.15 * t)
}

/// Darken a color by a factor in 0..1
pub fn shade(color: [f32; 3], factor: f32) -> [f32; 3] {
    color.map(|c| c * factor)
}
