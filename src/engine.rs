//! Contract with the native playback engine.
//!
//! Decoding, demuxing and audio live behind this trait. The coordinator
//! only needs to start rendering into a surface set, stop, release, and pass
//! along window size and scaling preferences.

use serde::Serialize;
use thiserror::Error;

use crate::geometry::FitPolicy;
use crate::surface::SurfaceSet;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine instance could not be allocated: {0}")]
    CreateFailed(String),
    #[error("rendering could not begin on the surface set: {0}")]
    StartFailed(String),
}

pub trait PlaybackEngine: Send {
    fn start(&mut self, surfaces: &SurfaceSet) -> Result<(), EngineError>;

    /// Idempotent. Must return only once the engine no longer renders.
    fn stop(&mut self);

    /// Releases the engine instance. Idempotent.
    fn destroy(&mut self);

    fn set_window_size(&mut self, _width: u32, _height: u32) {}

    fn set_scaling(&mut self, _hint: ScalingHint) {}
}

/// Engine-side rendering preference derived from the fit policy.
///
/// `aspect` forces a display aspect ratio, `scale` of `0.0` lets the engine
/// fit to the window and `1.0` renders unscaled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScalingHint {
    pub aspect: Option<&'static str>,
    pub scale: f32,
}

impl From<FitPolicy> for ScalingHint {
    fn from(policy: FitPolicy) -> Self {
        match policy {
            FitPolicy::Force16x9 => ScalingHint {
                aspect: Some("16:9"),
                scale: 0.0,
            },
            FitPolicy::Force4x3 => ScalingHint {
                aspect: Some("4:3"),
                scale: 0.0,
            },
            FitPolicy::Original => ScalingHint {
                aspect: None,
                scale: 1.0,
            },
            FitPolicy::BestFit
            | FitPolicy::FitHorizontal
            | FitPolicy::FitVertical
            | FitPolicy::Fill => ScalingHint {
                aspect: None,
                scale: 0.0,
            },
        }
    }
}
