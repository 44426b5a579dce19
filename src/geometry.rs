//! Video surface geometry.
//!
//! Maps a decoded frame (full plane, visible crop and sample aspect ratio)
//! onto the area the host gives the video surface. The result is two sizes:
//! the inner video surface, which covers the whole decoded plane including
//! any crop margin, and the outer clipping container, which only ever holds
//! the visible part.

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SampleAspectRatio {
    /// No density information; pixels are treated as square.
    #[default]
    Square,
    Ratio { num: u32, den: u32 },
}

impl SampleAspectRatio {
    /// Builds the ratio from the raw numerator/denominator pair reported by
    /// the engine. Equal parts mean "unknown", and a zero on either side
    /// carries no usable information either.
    pub fn from_parts(num: u32, den: u32) -> Self {
        if num == den || num == 0 || den == 0 {
            SampleAspectRatio::Square
        } else {
            SampleAspectRatio::Ratio { num, den }
        }
    }

    pub fn is_square(self) -> bool {
        matches!(self, SampleAspectRatio::Square)
    }

    /// Visible width once the pixel shape is taken into account.
    fn effective_width(self, visible_width: f64) -> f64 {
        match self {
            SampleAspectRatio::Square => visible_width,
            SampleAspectRatio::Ratio { num, den } => {
                visible_width * f64::from(num) / f64::from(den)
            }
        }
    }
}

impl fmt::Display for SampleAspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleAspectRatio::Square => write!(f, "1:1"),
            SampleAspectRatio::Ratio { num, den } => write!(f, "{num}:{den}"),
        }
    }
}

/// Snapshot of the decoded stream geometry, replaced wholesale on every
/// engine layout notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub visible_width: u32,
    pub visible_height: u32,
    pub sar: SampleAspectRatio,
}

impl FrameGeometry {
    /// Mirrors the engine callback arguments one to one.
    pub fn from_raw(
        width: u32,
        height: u32,
        visible_width: u32,
        visible_height: u32,
        sar_num: u32,
        sar_den: u32,
    ) -> Self {
        Self {
            width,
            height,
            visible_width,
            visible_height,
            sar: SampleAspectRatio::from_parts(sar_num, sar_den),
        }
    }

    /// True once both the full plane and the visible region have an area.
    pub fn is_sized(&self) -> bool {
        u64::from(self.width) * u64::from(self.height) > 0
            && u64::from(self.visible_width) * u64::from(self.visible_height) > 0
    }
}

/// Space available to the video surface, as measured by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayArea {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub portrait: bool,
}

impl DisplayArea {
    pub fn new(width: u32, height: u32, portrait: bool) -> Self {
        Self {
            width,
            height,
            portrait,
        }
    }

    /// Width and height reconciled with the orientation flag.
    ///
    /// A landscape-shaped measurement while flagged portrait (or the reverse)
    /// is swapped. The host can report bounds and orientation out of step
    /// around a rotation; this heuristic matches how the engine reports its
    /// window and must not be "fixed" without checking that convention.
    pub fn oriented(&self) -> (f64, f64) {
        let (width, height) = (f64::from(self.width), f64::from(self.height));
        let landscape_shaped = self.width > self.height;
        let portrait_shaped = self.width < self.height;
        if (landscape_shaped && self.portrait) || (portrait_shaped && !self.portrait) {
            (height, width)
        } else {
            (width, height)
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum FitPolicy {
    /// Fit inside the area, keep the aspect ratio, maximise the area.
    #[default]
    BestFit,
    /// Width is authoritative.
    FitHorizontal,
    /// Height is authoritative.
    FitVertical,
    /// Stretch to the whole area.
    Fill,
    #[serde(rename = "force-16x9")]
    #[value(name = "force-16x9")]
    Force16x9,
    #[serde(rename = "force-4x3")]
    #[value(name = "force-4x3")]
    Force4x3,
    /// Unscaled visible size.
    Original,
}

impl FitPolicy {
    pub const ALL: [FitPolicy; 7] = [
        FitPolicy::BestFit,
        FitPolicy::FitHorizontal,
        FitPolicy::FitVertical,
        FitPolicy::Fill,
        FitPolicy::Force16x9,
        FitPolicy::Force4x3,
        FitPolicy::Original,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FitPolicy::BestFit => "best-fit",
            FitPolicy::FitHorizontal => "fit-horizontal",
            FitPolicy::FitVertical => "fit-vertical",
            FitPolicy::Fill => "fill",
            FitPolicy::Force16x9 => "force-16x9",
            FitPolicy::Force4x3 => "force-4x3",
            FitPolicy::Original => "original",
        }
    }

    /// Aspect ratio the policy imposes regardless of the source, if any.
    pub fn forced_aspect(self) -> Option<f64> {
        match self {
            FitPolicy::Force16x9 => Some(16.0 / 9.0),
            FitPolicy::Force4x3 => Some(4.0 / 3.0),
            _ => None,
        }
    }
}

impl fmt::Display for FitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for PixelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Resolved sizes: `video` goes to the video and subtitle surfaces, `frame`
/// to the clipping container around them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SurfaceLayout {
    pub video: PixelSize,
    pub frame: PixelSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GeometryError {
    #[error("display area {width}x{height} has no usable surface")]
    EmptyDisplayArea { width: u32, height: u32 },
}

/// Resolves the surface layout for `frame` inside `display` under `policy`.
///
/// Returns `Ok(None)` while the frame has no area yet; there is nothing to
/// size. An empty display area is an error the caller treats as transient.
///
/// The inner size is rounded up and the container size rounded down, so
/// the video never leaves a gap inside its container and the container
/// never claims more than the computed space.
pub fn resolve(
    frame: &FrameGeometry,
    display: &DisplayArea,
    policy: FitPolicy,
) -> Result<Option<SurfaceLayout>, GeometryError> {
    if !frame.is_sized() {
        return Ok(None);
    }

    let (mut dw, mut dh) = display.oriented();
    if dw * dh == 0.0 {
        return Err(GeometryError::EmptyDisplayArea {
            width: display.width,
            height: display.height,
        });
    }

    let visible_width = f64::from(frame.visible_width);
    let visible_height = f64::from(frame.visible_height);
    let effective_width = frame.sar.effective_width(visible_width);
    let source_aspect = effective_width / visible_height;
    let display_aspect = dw / dh;

    match policy {
        FitPolicy::BestFit => fit_inside(&mut dw, &mut dh, display_aspect, source_aspect),
        FitPolicy::FitHorizontal => dh = dw / source_aspect,
        FitPolicy::FitVertical => dw = dh * source_aspect,
        FitPolicy::Fill => {}
        FitPolicy::Force16x9 | FitPolicy::Force4x3 => {
            let forced = policy.forced_aspect().unwrap_or(source_aspect);
            fit_inside(&mut dw, &mut dh, display_aspect, forced);
        }
        FitPolicy::Original => {
            dh = visible_height;
            dw = effective_width;
        }
    }

    let video = PixelSize {
        width: to_pixels((dw * f64::from(frame.width) / visible_width).ceil()),
        height: to_pixels((dh * f64::from(frame.height) / visible_height).ceil()),
    };
    let container = PixelSize {
        width: to_pixels(dw.floor()),
        height: to_pixels(dh.floor()),
    };

    Ok(Some(SurfaceLayout {
        video,
        frame: container,
    }))
}

fn fit_inside(dw: &mut f64, dh: &mut f64, display_aspect: f64, aspect: f64) {
    if display_aspect < aspect {
        *dh = *dw / aspect;
    } else {
        *dw = *dh * aspect;
    }
}

fn to_pixels(value: f64) -> u32 {
    if value.is_finite() && value > 0.0 {
        value.min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}
