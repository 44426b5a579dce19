//! Surface lifecycle coordinator.
//!
//! Two event sources drive a session: the host toolkit (layout passes, views
//! attached and detached) and the native engine (frame geometry changes,
//! surfaces becoming usable or unusable), each on its own thread. All of
//! them funnel into one [`Session`] behind a re-entrant lock, so a surface
//! teardown can never interleave with a layout being written to it.
//!
//! The engine is started at most once per attach and is always stopped
//! before the call that reports the surfaces gone returns.
//!
//! Calls made from inside an engine or surface callback on the thread that
//! already holds the session are queued and run before the outer call
//! returns.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::debounce::LayoutDebouncer;
use crate::engine::{EngineError, PlaybackEngine, ScalingHint};
use crate::geometry::{DisplayArea, FitPolicy, FrameGeometry, resolve};
use crate::observability::{Counter, MetricsCollector};
use crate::surface::SurfaceSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineRunState {
    Created,
    Started,
    Stopped,
    Destroyed,
}

impl fmt::Display for EngineRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineRunState::Created => "created",
            EngineRunState::Started => "started",
            EngineRunState::Stopped => "stopped",
            EngineRunState::Destroyed => "destroyed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("failed to create playback engine: {0}")]
    EngineCreate(EngineError),
    #[error("failed to start playback engine: {0}")]
    EngineStart(EngineError),
    #[error("coordinator has been destroyed")]
    Destroyed,
    #[error("no surfaces are attached")]
    SurfacesMissing,
    #[error("surface teardown queued behind the call in progress; surfaces are still in use")]
    Deferred,
    #[error("failed to spawn layout worker: {0}")]
    LayoutWorker(#[from] std::io::Error),
}

impl CoordinatorError {
    /// Fatal errors end the hosting session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordinatorError::EngineCreate(_) | CoordinatorError::EngineStart(_)
        )
    }
}

/// The hosting session, told when the engine turns out to be unusable.
pub trait SessionHost: Send + Sync {
    /// Surface the failure to the user and end the session.
    fn abort(&self, error: &CoordinatorError);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Quiet window before a layout change is resolved. `0` resolves on the
    /// calling thread.
    pub layout_debounce_ms: u64,
    pub fit_policy: FitPolicy,
    pub subtitles: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            layout_debounce_ms: 16,
            fit_policy: FitPolicy::BestFit,
            subtitles: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn synchronous() -> Self {
        Self {
            layout_debounce_ms: 0,
            ..Self::default()
        }
    }

    pub fn debounce_window(&self) -> Option<Duration> {
        (self.layout_debounce_ms > 0).then(|| Duration::from_millis(self.layout_debounce_ms))
    }
}

#[derive(Debug)]
enum Event {
    AttachSurfaces(SurfaceSet),
    DetachSurfaces,
    DisplayArea(DisplayArea),
    SettleLayout,
    FrameGeometry(FrameGeometry),
    FitPolicy(FitPolicy),
    ApplyGeometry,
    SurfacesCreated,
    SurfacesDestroyed,
    Destroy,
}

impl Event {
    /// Events whose caller frees the views once the call returns.
    fn releases_surfaces(&self) -> bool {
        matches!(self, Event::DetachSurfaces | Event::SurfacesDestroyed)
    }

    fn name(&self) -> &'static str {
        match self {
            Event::AttachSurfaces(_) => "attach_surfaces",
            Event::DetachSurfaces => "detach_surfaces",
            Event::DisplayArea(_) => "display_area_changed",
            Event::SettleLayout => "settle_layout",
            Event::FrameGeometry(_) => "frame_geometry_changed",
            Event::FitPolicy(_) => "fit_policy",
            Event::ApplyGeometry => "apply_geometry",
            Event::SurfacesCreated => "surfaces_created",
            Event::SurfacesDestroyed => "surfaces_destroyed",
            Event::Destroy => "destroy",
        }
    }
}

/// Read-only copy of the session, refreshed after every operation.
#[derive(Debug, Clone, Copy)]
struct SessionView {
    state: EngineRunState,
    policy: FitPolicy,
    display: Option<DisplayArea>,
    frame: Option<FrameGeometry>,
    surfaces_attached: bool,
}

struct Session<E: PlaybackEngine> {
    state: EngineRunState,
    engine: Option<E>,
    surfaces: Option<SurfaceSet>,
    frame: Option<FrameGeometry>,
    display: Option<DisplayArea>,
    pending_display: Option<DisplayArea>,
    policy: FitPolicy,
    subtitles: bool,
    synchronous_layout: bool,
    metrics: MetricsCollector,
}

impl<E: PlaybackEngine> Session<E> {
    fn view(&self) -> SessionView {
        SessionView {
            state: self.state,
            policy: self.policy,
            display: self.display,
            frame: self.frame,
            surfaces_attached: self.surfaces.is_some(),
        }
    }

    fn handle(&mut self, event: Event) -> Result<(), CoordinatorError> {
        if self.state == EngineRunState::Destroyed {
            return match event {
                Event::Destroy
                | Event::SettleLayout
                | Event::SurfacesDestroyed
                | Event::DisplayArea(_)
                | Event::FrameGeometry(_) => {
                    debug!(event = event.name(), "Ignoring event after destroy");
                    Ok(())
                }
                _ => Err(CoordinatorError::Destroyed),
            };
        }

        match event {
            Event::AttachSurfaces(surfaces) => {
                let surfaces = if self.subtitles {
                    surfaces
                } else {
                    surfaces.without_subtitles()
                };
                info!(surfaces = ?surfaces, "Surfaces attached");
                self.surfaces = Some(surfaces);
                self.apply();
                Ok(())
            }
            Event::DetachSurfaces => {
                if self.state == EngineRunState::Started {
                    self.stop_engine();
                }
                if let Some(area) = self.pending_display.take() {
                    self.display = Some(area);
                }
                if self.surfaces.take().is_some() {
                    info!("Surfaces detached");
                }
                Ok(())
            }
            Event::DisplayArea(area) => {
                if self.pending_display.or(self.display) == Some(area) {
                    debug!(?area, "Display area unchanged");
                    return Ok(());
                }
                if self.pending_display.replace(area).is_some() {
                    self.metrics.increment(Counter::LayoutCoalesced);
                }
                if self.synchronous_layout {
                    self.settle_layout();
                }
                Ok(())
            }
            Event::SettleLayout => {
                self.settle_layout();
                Ok(())
            }
            Event::FrameGeometry(frame) => {
                debug!(?frame, "Frame geometry changed");
                self.frame = Some(frame);
                self.apply();
                Ok(())
            }
            Event::FitPolicy(policy) => {
                if policy != self.policy {
                    info!(from = %self.policy, to = %policy, "Fit policy changed");
                    self.policy = policy;
                    if let Some(engine) = self.engine.as_mut() {
                        engine.set_scaling(ScalingHint::from(policy));
                    }
                    self.apply();
                }
                Ok(())
            }
            Event::ApplyGeometry => {
                self.apply();
                Ok(())
            }
            Event::SurfacesCreated => match self.state {
                EngineRunState::Started => {
                    debug!("Engine already started, ignoring surfaces-created");
                    Ok(())
                }
                _ => self.start_engine(),
            },
            Event::SurfacesDestroyed => {
                if self.state == EngineRunState::Started {
                    self.stop_engine();
                } else {
                    debug!(state = %self.state, "Engine not running, ignoring surfaces-destroyed");
                }
                Ok(())
            }
            Event::Destroy => {
                self.teardown();
                Ok(())
            }
        }
    }

    fn settle_layout(&mut self) {
        if let Some(area) = self.pending_display.take() {
            debug!(?area, "Display area settled");
            self.display = Some(area);
            self.apply();
        }
    }

    fn apply(&mut self) {
        let Some(surfaces) = self.surfaces.as_ref() else {
            return;
        };
        let (Some(display), Some(frame)) = (self.display, self.frame) else {
            return;
        };
        if !frame.is_sized() {
            self.metrics.increment(Counter::SkippedUnsizedFrame);
            debug!(?frame, "Frame geometry has no area yet");
            return;
        }

        if let Some(engine) = self.engine.as_mut() {
            engine.set_window_size(display.width, display.height);
        }

        self.metrics.increment(Counter::Resolve);
        match resolve(&frame, &display, self.policy) {
            Ok(Some(layout)) => {
                surfaces.apply(&layout);
                self.metrics.increment(Counter::Apply);
                debug!(
                    video = %layout.video,
                    frame = %layout.frame,
                    policy = %self.policy,
                    "Surface layout applied"
                );
            }
            Ok(None) => {
                self.metrics.increment(Counter::SkippedUnsizedFrame);
            }
            Err(err) => {
                self.metrics.increment(Counter::SkippedEmptyDisplay);
                warn!(error = %err, "Invalid surface size, keeping previous layout");
            }
        }
    }

    /// A start failure tears the session down; the caller reports it to the
    /// host once the session lock is released.
    fn start_engine(&mut self) -> Result<(), CoordinatorError> {
        let Some(surfaces) = self.surfaces.as_ref() else {
            warn!("Surfaces reported created before any were attached");
            return Err(CoordinatorError::SurfacesMissing);
        };
        let Some(engine) = self.engine.as_mut() else {
            return Err(CoordinatorError::Destroyed);
        };

        engine.set_scaling(ScalingHint::from(self.policy));
        if let Err(err) = engine.start(surfaces) {
            let failure = CoordinatorError::EngineStart(err);
            error!(error = %failure, "Couldn't start playback engine");
            self.metrics.increment(Counter::FatalError);
            self.teardown();
            return Err(failure);
        }

        self.state = EngineRunState::Started;
        self.metrics.increment(Counter::EngineStart);
        info!("Playback engine started");
        Ok(())
    }

    fn stop_engine(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.stop();
        }
        self.state = EngineRunState::Stopped;
        self.metrics.increment(Counter::EngineStop);
        info!("Playback engine stopped");
    }

    fn teardown(&mut self) {
        if self.state == EngineRunState::Started {
            self.stop_engine();
        }
        if let Some(mut engine) = self.engine.take() {
            engine.destroy();
        }
        self.surfaces = None;
        self.pending_display = None;
        self.state = EngineRunState::Destroyed;
        info!("Coordinator destroyed");
    }
}

struct Guarded<E: PlaybackEngine> {
    session: RefCell<Session<E>>,
    deferred: RefCell<VecDeque<Event>>,
    view: Cell<SessionView>,
}

struct Shared<E: PlaybackEngine> {
    guarded: ReentrantMutex<Guarded<E>>,
    host: Arc<dyn SessionHost>,
    metrics: MetricsCollector,
    debouncer: Mutex<Option<LayoutDebouncer>>,
}

impl<E: PlaybackEngine> Shared<E> {
    /// Runs `event` and everything queued behind it. Fatal failures reach
    /// the host only after the session lock is released, so the host may
    /// destroy the coordinator from `abort`.
    fn dispatch(&self, event: Event) -> Result<(), CoordinatorError> {
        let mut fatal = Vec::new();
        let result = {
            let guarded = self.guarded.lock();
            let Ok(mut session) = guarded.session.try_borrow_mut() else {
                debug!(event = event.name(), "Deferring re-entrant event");
                let releases = event.releases_surfaces();
                guarded.deferred.borrow_mut().push_back(event);
                return if releases {
                    Err(CoordinatorError::Deferred)
                } else {
                    Ok(())
                };
            };

            let result = {
                let _timer = session.metrics.start_operation(event.name());
                session.handle(event)
            };
            loop {
                let next = guarded.deferred.borrow_mut().pop_front();
                let Some(next) = next else {
                    break;
                };
                let name = next.name();
                let _timer = session.metrics.start_operation(name);
                match session.handle(next) {
                    Err(err) if err.is_fatal() => fatal.push(err),
                    Err(err) => warn!(event = name, error = %err, "Deferred event failed"),
                    Ok(()) => {}
                }
            }
            guarded.view.set(session.view());
            result
        };

        if let Err(err) = &result
            && err.is_fatal()
        {
            self.host.abort(err);
        }
        for err in &fatal {
            self.host.abort(err);
        }
        result
    }

    fn view(&self) -> SessionView {
        self.guarded.lock().view.get()
    }

    fn notify_layout(&self) {
        if let Some(debouncer) = self.debouncer.lock().as_ref() {
            debouncer.notify();
        }
    }

    fn stop_layout_worker(&self) {
        // The worker may be blocked on the session lock this thread holds.
        if self.guarded.is_owned_by_current_thread() {
            if let Some(debouncer) = self.debouncer.lock().as_ref() {
                debouncer.cancel();
            }
            return;
        }
        let debouncer = self.debouncer.lock().take();
        if let Some(mut debouncer) = debouncer {
            debouncer.shutdown();
        }
    }
}

impl<E: PlaybackEngine> Drop for Shared<E> {
    fn drop(&mut self) {
        let session = self.guarded.get_mut().session.get_mut();
        if session.state != EngineRunState::Destroyed {
            session.teardown();
        }
        if let Some(mut debouncer) = self.debouncer.get_mut().take() {
            debouncer.shutdown();
        }
    }
}

/// Handle to one playback session. Cheap to clone; clones share the session
/// and may be handed to engine callback threads.
pub struct Coordinator<E: PlaybackEngine> {
    shared: Arc<Shared<E>>,
}

impl<E: PlaybackEngine> Clone for Coordinator<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<E: PlaybackEngine + 'static> Coordinator<E> {
    /// Creates the engine and the session around it.
    ///
    /// An engine that cannot be allocated is fatal: the host is told to end
    /// the session and no coordinator is returned.
    pub fn create<F>(
        factory: F,
        host: Arc<dyn SessionHost>,
        config: CoordinatorConfig,
    ) -> Result<Self, CoordinatorError>
    where
        F: FnOnce() -> Result<E, EngineError>,
    {
        let metrics = MetricsCollector::new();
        let engine = match factory() {
            Ok(engine) => engine,
            Err(err) => {
                let failure = CoordinatorError::EngineCreate(err);
                error!(error = %failure, "Couldn't create playback engine");
                metrics.increment(Counter::FatalError);
                host.abort(&failure);
                return Err(failure);
            }
        };

        let window = config.debounce_window();
        let session = Session {
            state: EngineRunState::Created,
            engine: Some(engine),
            surfaces: None,
            frame: None,
            display: None,
            pending_display: None,
            policy: config.fit_policy,
            subtitles: config.subtitles,
            synchronous_layout: window.is_none(),
            metrics: metrics.clone(),
        };
        let view = session.view();
        let shared = Arc::new(Shared {
            guarded: ReentrantMutex::new(Guarded {
                session: RefCell::new(session),
                deferred: RefCell::new(VecDeque::new()),
                view: Cell::new(view),
            }),
            host,
            metrics,
            debouncer: Mutex::new(None),
        });

        if let Some(window) = window {
            let weak = Arc::downgrade(&shared);
            let debouncer = LayoutDebouncer::spawn(window, move || match weak.upgrade() {
                Some(shared) => {
                    if let Err(err) = shared.dispatch(Event::SettleLayout) {
                        warn!(error = %err, "Debounced layout failed");
                    }
                    true
                }
                None => false,
            })?;
            *shared.debouncer.lock() = Some(debouncer);
        }

        info!(
            policy = %config.fit_policy,
            debounce_ms = config.layout_debounce_ms,
            subtitles = config.subtitles,
            "Coordinator created"
        );
        Ok(Self { shared })
    }

    pub fn state(&self) -> EngineRunState {
        self.shared.view().state
    }

    pub fn fit_policy(&self) -> FitPolicy {
        self.shared.view().policy
    }

    /// Last settled display area; pending debounced changes are not visible.
    pub fn display_area(&self) -> Option<DisplayArea> {
        self.shared.view().display
    }

    pub fn frame_geometry(&self) -> Option<FrameGeometry> {
        self.shared.view().frame
    }

    pub fn surfaces_attached(&self) -> bool {
        self.shared.view().surfaces_attached
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.shared.metrics.clone()
    }

    /// Binds the host views. Layout is applied right away if the frame and
    /// display geometry are already known.
    pub fn attach_surfaces(&self, surfaces: SurfaceSet) -> Result<(), CoordinatorError> {
        self.shared.dispatch(Event::AttachSurfaces(surfaces))
    }

    /// Host views are going away: stops the engine if it runs, drops any
    /// pending layout and releases the handles. The caller may free the
    /// views once this returns `Ok`; a re-entrant call returns
    /// `CoordinatorError::Deferred` as for [`Self::on_surfaces_destroyed`].
    pub fn detach_surfaces(&self) -> Result<(), CoordinatorError> {
        self.shared.dispatch(Event::DetachSurfaces)
    }

    pub fn on_display_area_changed(&self, area: DisplayArea) -> Result<(), CoordinatorError> {
        self.shared.dispatch(Event::DisplayArea(area))?;
        self.shared.notify_layout();
        Ok(())
    }

    /// Resolves a pending display area now instead of waiting for the
    /// debounce window.
    pub fn flush_layout(&self) -> Result<(), CoordinatorError> {
        self.shared.dispatch(Event::SettleLayout)
    }

    pub fn on_frame_geometry_changed(&self, frame: FrameGeometry) -> Result<(), CoordinatorError> {
        self.shared.dispatch(Event::FrameGeometry(frame))
    }

    pub fn set_fit_policy(&self, policy: FitPolicy) -> Result<(), CoordinatorError> {
        self.shared.dispatch(Event::FitPolicy(policy))
    }

    pub fn apply_geometry(&self) -> Result<(), CoordinatorError> {
        self.shared.dispatch(Event::ApplyGeometry)
    }

    pub fn on_surfaces_created(&self) -> Result<(), CoordinatorError> {
        self.shared.dispatch(Event::SurfacesCreated)
    }

    /// Stops the engine if it runs. Returns only after the engine stopped.
    ///
    /// From inside an engine or surface callback the stop is queued behind
    /// the call in progress and `CoordinatorError::Deferred` is returned; the
    /// views must stay alive until that outer call returns.
    pub fn on_surfaces_destroyed(&self) -> Result<(), CoordinatorError> {
        self.shared.dispatch(Event::SurfacesDestroyed)
    }

    /// Final teardown: stops a running engine, releases it, cancels any
    /// pending layout. Every later operation is rejected or ignored.
    ///
    /// Called from inside an engine or surface callback, teardown runs once
    /// the outer call returns.
    pub fn destroy(&self) {
        if let Err(err) = self.shared.dispatch(Event::Destroy) {
            warn!(error = %err, "Destroy failed");
        }
        self.shared.stop_layout_worker();
    }
}
