pub mod coordinator;
pub mod debounce;
pub mod engine;
pub mod geometry;
pub mod observability;
pub mod script;
pub mod sim;
pub mod surface;
pub mod validation;

pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorError, EngineRunState, SessionHost};
pub use engine::{EngineError, PlaybackEngine, ScalingHint};
pub use geometry::{
    DisplayArea, FitPolicy, FrameGeometry, GeometryError, PixelSize, SampleAspectRatio,
    SurfaceLayout, resolve,
};
pub use script::SessionScript;
pub use surface::{Surface, SurfaceSet};
