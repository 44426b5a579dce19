use std::fmt;
use std::sync::Arc;

use crate::geometry::{PixelSize, SurfaceLayout};

/// Opaque drawable owned by the host windowing system.
pub trait Surface: Send + Sync {
    fn name(&self) -> &str;

    fn set_size(&self, size: PixelSize);

    /// Requests a redraw after a size change.
    fn invalidate(&self) {}
}

/// The drawables bound to one playback session.
///
/// The video surface and its clipping container are required. The subtitle
/// overlay always tracks the video surface size. The UI surface is carried
/// along for the engine but never resized here.
#[derive(Clone)]
pub struct SurfaceSet {
    video: Arc<dyn Surface>,
    container: Arc<dyn Surface>,
    subtitles: Option<Arc<dyn Surface>>,
    ui: Option<Arc<dyn Surface>>,
}

impl SurfaceSet {
    pub fn new(video: Arc<dyn Surface>, container: Arc<dyn Surface>) -> Self {
        Self {
            video,
            container,
            subtitles: None,
            ui: None,
        }
    }

    pub fn with_subtitles(mut self, subtitles: Arc<dyn Surface>) -> Self {
        self.subtitles = Some(subtitles);
        self
    }

    pub fn with_ui(mut self, ui: Arc<dyn Surface>) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn without_subtitles(mut self) -> Self {
        self.subtitles = None;
        self
    }

    pub fn video(&self) -> &Arc<dyn Surface> {
        &self.video
    }

    pub fn container(&self) -> &Arc<dyn Surface> {
        &self.container
    }

    pub fn subtitles(&self) -> Option<&Arc<dyn Surface>> {
        self.subtitles.as_ref()
    }

    pub fn ui(&self) -> Option<&Arc<dyn Surface>> {
        self.ui.as_ref()
    }

    /// Writes a resolved layout to the managed surfaces.
    pub fn apply(&self, layout: &SurfaceLayout) {
        self.video.set_size(layout.video);
        if let Some(subtitles) = &self.subtitles {
            subtitles.set_size(layout.video);
        }
        self.container.set_size(layout.frame);

        self.video.invalidate();
        if let Some(subtitles) = &self.subtitles {
            subtitles.invalidate();
        }
    }
}

impl fmt::Debug for SurfaceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceSet")
            .field("video", &self.video.name())
            .field("container", &self.container.name())
            .field("subtitles", &self.subtitles.as_ref().map(|s| s.name()))
            .field("ui", &self.ui.as_ref().map(|s| s.name()))
            .finish()
    }
}
