//! Scaling filter selection.
//!
//! Every encoder family scales into the requested bounding box while keeping
//! the source aspect ratio; the family only decides which hardware path does
//! the scaling.

use std::fmt;

/// Arguments that keep audio in sync with the filtered video stream.
pub const SYNC_ARGS: [&str; 4] = ["-async", "1", "-metadata:s:v:0", "start_time=0"];

/// Target bounding box of an encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimension {
    pub width: u32,
    pub height: u32,
}

impl Dimension {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Hardware-acceleration family of an encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderFamily {
    /// VA-API encoders (`*_vaapi`).
    Vaapi,
    /// NVENC encoders (`*_nvenc`).
    Nvenc,
    /// Everything else is scaled in software.
    Software,
}

impl EncoderFamily {
    pub fn of(encoder: &str) -> Self {
        let encoder = encoder.to_ascii_lowercase();
        if encoder.ends_with("_vaapi") {
            EncoderFamily::Vaapi
        } else if encoder.ends_with("_nvenc") {
            EncoderFamily::Nvenc
        } else {
            EncoderFamily::Software
        }
    }
}

/// A video filter expression applied to the encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFilter {
    expression: String,
}

impl VideoFilter {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl fmt::Display for VideoFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Width and height expressions fitting the source into `w x h`.
///
/// Wider sources are pinned to the box width, taller ones to the box height;
/// the other side follows the source aspect ratio `a`.
fn bounding_box(w: u32, h: u32) -> String {
    format!(r"w='if(gt(a\,{w}/{h})\,{w}\,oh*a)':h='if(gt(a\,{w}/{h})\,ow/a\,{h})'")
}

/// Select the scaling filter for an encoder and target dimension.
pub fn select_filter(dimension: Dimension, encoder: &str) -> VideoFilter {
    let Dimension { width, height } = dimension;

    match EncoderFamily::of(encoder) {
        EncoderFamily::Vaapi => {
            VideoFilter::new(format!("scale_vaapi={}", bounding_box(width, height)))
        }
        EncoderFamily::Nvenc => VideoFilter::new(format!(
            "scale_npp={}:interp_algo=super",
            bounding_box(width, height)
        )),
        EncoderFamily::Software => VideoFilter::new(format!(
            "scale=w={}:h={}:force_original_aspect_ratio=decrease",
            width, height
        )),
    }
}
