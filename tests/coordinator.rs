use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use surface_sync::coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorError, EngineRunState, SessionHost,
};
use surface_sync::engine::{EngineError, PlaybackEngine, ScalingHint};
use surface_sync::geometry::{DisplayArea, FitPolicy, FrameGeometry, PixelSize};
use surface_sync::sim::{
    EngineBehavior, Journal, JournalEntry, RecordingEngine, RecordingHost, RecordingViews,
};
use surface_sync::surface::SurfaceSet;

struct Harness {
    journal: Journal,
    views: RecordingViews,
    host: Arc<RecordingHost>,
    coordinator: Coordinator<RecordingEngine>,
}

fn harness(config: CoordinatorConfig, behavior: EngineBehavior) -> Harness {
    let journal = Journal::new();
    let views = RecordingViews::new(&journal);
    let host = RecordingHost::new(journal.clone());
    let coordinator = Coordinator::create(
        RecordingEngine::factory(journal.clone(), behavior, false),
        host.clone(),
        config,
    )
    .expect("engine allocates");
    Harness {
        journal,
        views,
        host,
        coordinator,
    }
}

fn sync_harness() -> Harness {
    harness(CoordinatorConfig::synchronous(), EngineBehavior::default())
}

fn hd_frame() -> FrameGeometry {
    FrameGeometry::from_raw(1920, 1080, 1920, 1080, 1, 1)
}

fn is_engine_start(entry: &JournalEntry) -> bool {
    matches!(entry, JournalEntry::EngineStart { .. })
}

fn resizes_of(journal: &Journal, name: &str) -> usize {
    journal.count(|entry| matches!(entry, JournalEntry::Resize { surface, .. } if surface == name))
}

#[test]
fn surfaces_created_twice_starts_engine_once() {
    let h = sync_harness();
    h.coordinator.attach_surfaces(h.views.surface_set()).unwrap();

    h.coordinator.on_surfaces_created().unwrap();
    h.coordinator.on_surfaces_created().unwrap();

    assert_eq!(h.coordinator.state(), EngineRunState::Started);
    assert_eq!(h.journal.count(is_engine_start), 1);
}

#[test]
fn surfaces_destroyed_stops_once() {
    let h = sync_harness();
    h.coordinator.attach_surfaces(h.views.surface_set()).unwrap();
    h.coordinator.on_surfaces_destroyed().unwrap();
    assert_eq!(h.coordinator.state(), EngineRunState::Created);

    h.coordinator.on_surfaces_created().unwrap();
    h.coordinator.on_surfaces_destroyed().unwrap();
    h.coordinator.on_surfaces_destroyed().unwrap();

    assert_eq!(h.coordinator.state(), EngineRunState::Stopped);
    assert_eq!(h.journal.count(|e| *e == JournalEntry::EngineStop), 1);

    h.coordinator.on_surfaces_created().unwrap();
    assert_eq!(h.coordinator.state(), EngineRunState::Started);
    assert_eq!(h.journal.count(is_engine_start), 2);
}

#[test]
fn layout_sizes_video_subtitles_and_container() {
    let h = sync_harness();
    h.coordinator.attach_surfaces(h.views.surface_set()).unwrap();
    h.coordinator
        .on_display_area_changed(DisplayArea::new(1000, 1000, false))
        .unwrap();
    assert_eq!(h.views.video.size(), None);

    h.coordinator.on_frame_geometry_changed(hd_frame()).unwrap();

    assert_eq!(h.views.video.size(), Some(PixelSize::new(1000, 563)));
    assert_eq!(h.views.subtitles.size(), Some(PixelSize::new(1000, 563)));
    assert_eq!(h.views.container.size(), Some(PixelSize::new(1000, 562)));
    assert_eq!(h.views.ui.size(), None);
    assert_eq!(
        h.journal.count(|e| matches!(e, JournalEntry::Invalidate { .. })),
        2
    );
    assert!(h.journal.entries().contains(&JournalEntry::WindowSize {
        width: 1000,
        height: 1000
    }));
}

#[test]
fn subtitles_can_be_disabled() {
    let config = CoordinatorConfig {
        subtitles: false,
        ..CoordinatorConfig::synchronous()
    };
    let h = harness(config, EngineBehavior::default());
    h.coordinator.attach_surfaces(h.views.surface_set()).unwrap();
    h.coordinator
        .on_display_area_changed(DisplayArea::new(1280, 720, false))
        .unwrap();
    h.coordinator.on_frame_geometry_changed(hd_frame()).unwrap();

    assert_eq!(h.views.video.size(), Some(PixelSize::new(1280, 720)));
    assert_eq!(h.views.subtitles.size(), None);
}

#[test]
fn empty_display_area_keeps_previous_layout() {
    let h = sync_harness();
    h.coordinator.attach_surfaces(h.views.surface_set()).unwrap();
    h.coordinator.on_frame_geometry_changed(hd_frame()).unwrap();
    h.coordinator
        .on_display_area_changed(DisplayArea::new(1280, 720, false))
        .unwrap();
    let before = h.journal.len();

    h.coordinator
        .on_display_area_changed(DisplayArea::new(0, 720, false))
        .unwrap();

    assert_eq!(h.views.video.size(), Some(PixelSize::new(1280, 720)));
    assert_eq!(resizes_of(&h.journal, "video"), 1);
    assert!(h.journal.len() > before, "window size is still reported");
    assert_eq!(h.coordinator.metrics().snapshot().skipped_empty_display, 1);
}

#[test]
fn unsized_frame_is_skipped() {
    let h = sync_harness();
    h.coordinator.attach_surfaces(h.views.surface_set()).unwrap();
    h.coordinator
        .on_display_area_changed(DisplayArea::new(1280, 720, false))
        .unwrap();
    h.coordinator
        .on_frame_geometry_changed(FrameGeometry::from_raw(1920, 1080, 0, 0, 1, 1))
        .unwrap();

    assert_eq!(h.views.video.size(), None);
    assert_eq!(h.coordinator.metrics().snapshot().skipped_unsized_frame, 1);
}

#[test]
fn policy_change_reapplies_and_hints_engine() {
    let h = sync_harness();
    h.coordinator.attach_surfaces(h.views.surface_set()).unwrap();
    h.coordinator
        .on_display_area_changed(DisplayArea::new(1000, 1000, false))
        .unwrap();
    h.coordinator.on_frame_geometry_changed(hd_frame()).unwrap();

    h.coordinator.set_fit_policy(FitPolicy::Fill).unwrap();
    assert_eq!(h.views.container.size(), Some(PixelSize::new(1000, 1000)));
    assert_eq!(h.coordinator.fit_policy(), FitPolicy::Fill);

    h.coordinator.set_fit_policy(FitPolicy::Force16x9).unwrap();
    assert!(h.journal.entries().contains(&JournalEntry::Scaling {
        hint: ScalingHint {
            aspect: Some("16:9"),
            scale: 0.0
        }
    }));

    let resizes = resizes_of(&h.journal, "frame");
    h.coordinator.set_fit_policy(FitPolicy::Force16x9).unwrap();
    assert_eq!(resizes_of(&h.journal, "frame"), resizes);
}

#[test]
fn detach_stops_engine_before_returning() {
    let h = sync_harness();
    h.coordinator.attach_surfaces(h.views.surface_set()).unwrap();
    h.coordinator.on_surfaces_created().unwrap();

    h.coordinator.detach_surfaces().unwrap();
    assert_eq!(h.journal.entries().last(), Some(&JournalEntry::EngineStop));
    assert!(!h.coordinator.surfaces_attached());

    h.views.release();
    h.coordinator.on_frame_geometry_changed(hd_frame()).unwrap();
    h.coordinator
        .on_display_area_changed(DisplayArea::new(640, 480, false))
        .unwrap();
    assert!(h.journal.violations().is_empty(), "{:?}", h.journal.violations());
}

#[test]
fn surfaces_created_without_attach_is_rejected() {
    let h = sync_harness();
    let err = h.coordinator.on_surfaces_created().unwrap_err();
    assert!(matches!(err, CoordinatorError::SurfacesMissing));
    assert!(!err.is_fatal());
    assert_eq!(h.coordinator.state(), EngineRunState::Created);
    assert!(!h.host.aborted());
}

#[test]
fn start_failure_aborts_session() {
    let h = harness(
        CoordinatorConfig::synchronous(),
        EngineBehavior { fail_start: true },
    );
    h.coordinator.attach_surfaces(h.views.surface_set()).unwrap();

    let err = h.coordinator.on_surfaces_created().unwrap_err();
    assert!(matches!(err, CoordinatorError::EngineStart(_)));
    assert!(err.is_fatal());
    assert!(h.host.aborted());
    assert_eq!(h.coordinator.state(), EngineRunState::Destroyed);
    assert_eq!(h.journal.count(|e| *e == JournalEntry::EngineDestroy), 1);

    h.coordinator
        .on_display_area_changed(DisplayArea::new(800, 600, false))
        .unwrap();
    h.coordinator.on_frame_geometry_changed(hd_frame()).unwrap();
    assert_eq!(h.views.video.size(), None);
}

#[test]
fn create_failure_reports_to_host() {
    let journal = Journal::new();
    let host = RecordingHost::new(journal.clone());
    let result = Coordinator::create(
        RecordingEngine::factory(journal.clone(), EngineBehavior::default(), true),
        host.clone(),
        CoordinatorConfig::default(),
    );

    assert!(matches!(result, Err(CoordinatorError::EngineCreate(_))));
    assert!(host.aborted());
    assert!(matches!(
        journal.entries().as_slice(),
        [JournalEntry::Abort { .. }]
    ));
}

#[test]
fn destroy_is_terminal() {
    let h = sync_harness();
    h.coordinator.attach_surfaces(h.views.surface_set()).unwrap();
    h.coordinator.on_surfaces_created().unwrap();

    h.coordinator.destroy();
    h.coordinator.destroy();

    assert_eq!(h.coordinator.state(), EngineRunState::Destroyed);
    let entries = h.journal.entries();
    let stop = entries.iter().position(|e| *e == JournalEntry::EngineStop);
    let destroy = entries.iter().position(|e| *e == JournalEntry::EngineDestroy);
    assert!(stop.is_some() && stop < destroy);
    assert_eq!(h.journal.count(|e| *e == JournalEntry::EngineDestroy), 1);

    assert!(matches!(
        h.coordinator.attach_surfaces(h.views.surface_set()),
        Err(CoordinatorError::Destroyed)
    ));
    assert!(matches!(
        h.coordinator.on_surfaces_created(),
        Err(CoordinatorError::Destroyed)
    ));
    assert!(matches!(
        h.coordinator.apply_geometry(),
        Err(CoordinatorError::Destroyed)
    ));
    h.coordinator.on_surfaces_destroyed().unwrap();
    h.coordinator.on_frame_geometry_changed(hd_frame()).unwrap();
    assert_eq!(h.journal.entries().len(), entries.len());
}

#[test]
fn debounced_burst_applies_latest_area_once() {
    let config = CoordinatorConfig {
        layout_debounce_ms: 50,
        ..CoordinatorConfig::default()
    };
    let h = harness(config, EngineBehavior::default());
    h.coordinator.attach_surfaces(h.views.surface_set()).unwrap();
    h.coordinator.on_frame_geometry_changed(hd_frame()).unwrap();

    for width in [800, 900, 1000, 1100, 1280] {
        h.coordinator
            .on_display_area_changed(DisplayArea::new(width, 720, false))
            .unwrap();
    }
    assert_eq!(h.views.container.size(), None);

    thread::sleep(Duration::from_millis(400));

    assert_eq!(resizes_of(&h.journal, "frame"), 1);
    assert_eq!(h.views.container.size(), Some(PixelSize::new(1280, 720)));
    assert_eq!(
        h.coordinator.display_area(),
        Some(DisplayArea::new(1280, 720, false))
    );
    assert_eq!(h.coordinator.metrics().snapshot().layouts_coalesced, 4);
    h.coordinator.destroy();
}

#[test]
fn flush_layout_settles_without_waiting() {
    let config = CoordinatorConfig {
        layout_debounce_ms: 10_000,
        ..CoordinatorConfig::default()
    };
    let h = harness(config, EngineBehavior::default());
    h.coordinator.attach_surfaces(h.views.surface_set()).unwrap();
    h.coordinator.on_frame_geometry_changed(hd_frame()).unwrap();
    h.coordinator
        .on_display_area_changed(DisplayArea::new(1280, 720, false))
        .unwrap();

    h.coordinator.flush_layout().unwrap();

    assert_eq!(h.views.container.size(), Some(PixelSize::new(1280, 720)));
    h.coordinator.destroy();
}

#[test]
fn destroy_cancels_pending_layout() {
    let config = CoordinatorConfig {
        layout_debounce_ms: 100,
        ..CoordinatorConfig::default()
    };
    let h = harness(config, EngineBehavior::default());
    h.coordinator.attach_surfaces(h.views.surface_set()).unwrap();
    h.coordinator.on_frame_geometry_changed(hd_frame()).unwrap();
    h.coordinator
        .on_display_area_changed(DisplayArea::new(1280, 720, false))
        .unwrap();

    h.coordinator.destroy();
    h.views.release();
    thread::sleep(Duration::from_millis(300));

    assert_eq!(resizes_of(&h.journal, "video"), 0);
    assert!(h.journal.violations().is_empty(), "{:?}", h.journal.violations());
}

#[test]
fn dropping_last_handle_tears_down() {
    let h = sync_harness();
    h.coordinator.attach_surfaces(h.views.surface_set()).unwrap();
    h.coordinator.on_surfaces_created().unwrap();
    let journal = h.journal.clone();

    drop(h);

    let entries = journal.entries();
    assert_eq!(
        &entries[entries.len() - 2..],
        &[JournalEntry::EngineStop, JournalEntry::EngineDestroy]
    );
}

/// Engine that reports its first frame geometry synchronously from `start`.
struct EagerEngine {
    inner: RecordingEngine,
    handle: Arc<Mutex<Option<Coordinator<EagerEngine>>>>,
}

impl PlaybackEngine for EagerEngine {
    fn start(&mut self, surfaces: &SurfaceSet) -> Result<(), EngineError> {
        self.inner.start(surfaces)?;
        let handle = self.handle.lock().clone();
        if let Some(coordinator) = handle {
            coordinator
                .on_frame_geometry_changed(FrameGeometry::from_raw(1920, 1080, 1920, 1080, 1, 1))
                .expect("re-entrant call is queued");
            assert_eq!(coordinator.frame_geometry(), None);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.inner.stop();
    }

    fn destroy(&mut self) {
        self.inner.destroy();
    }

    fn set_window_size(&mut self, width: u32, height: u32) {
        self.inner.set_window_size(width, height);
    }
}

#[test]
fn reentrant_engine_callback_is_deferred() {
    let journal = Journal::new();
    let views = RecordingViews::new(&journal);
    let host = RecordingHost::new(journal.clone());
    let handle = Arc::new(Mutex::new(None));
    let engine_handle = handle.clone();
    let engine_journal = journal.clone();

    let coordinator = Coordinator::create(
        move || {
            Ok(EagerEngine {
                inner: RecordingEngine::new(engine_journal, EngineBehavior::default()),
                handle: engine_handle,
            })
        },
        host,
        CoordinatorConfig::synchronous(),
    )
    .unwrap();
    *handle.lock() = Some(coordinator.clone());

    coordinator.attach_surfaces(views.surface_set()).unwrap();
    coordinator
        .on_display_area_changed(DisplayArea::new(1280, 720, false))
        .unwrap();
    coordinator.on_surfaces_created().unwrap();

    assert_eq!(coordinator.state(), EngineRunState::Started);
    assert_eq!(views.container.size(), Some(PixelSize::new(1280, 720)));
    let entries = journal.entries();
    let start = entries.iter().position(is_engine_start).unwrap();
    let resize = entries
        .iter()
        .position(|e| matches!(e, JournalEntry::Resize { .. }))
        .unwrap();
    assert!(start < resize);

    coordinator.destroy();
    handle.lock().take();
}

#[test]
fn detach_keeps_latest_reported_area_for_reattach() {
    let config = CoordinatorConfig {
        layout_debounce_ms: 10_000,
        ..CoordinatorConfig::default()
    };
    let h = harness(config, EngineBehavior::default());
    h.coordinator.attach_surfaces(h.views.surface_set()).unwrap();
    h.coordinator.on_frame_geometry_changed(hd_frame()).unwrap();
    h.coordinator
        .on_display_area_changed(DisplayArea::new(800, 600, false))
        .unwrap();
    h.coordinator.flush_layout().unwrap();
    h.coordinator
        .on_display_area_changed(DisplayArea::new(1280, 720, false))
        .unwrap();

    h.coordinator.detach_surfaces().unwrap();
    assert_eq!(h.views.container.size(), Some(PixelSize::new(800, 450)));
    h.coordinator.attach_surfaces(h.views.surface_set()).unwrap();

    assert_eq!(
        h.coordinator.display_area(),
        Some(DisplayArea::new(1280, 720, false))
    );
    assert_eq!(h.views.container.size(), Some(PixelSize::new(1280, 720)));
    h.coordinator.destroy();
}

/// Engine that blocks in `start` long enough for a debounced layout to
/// queue up on the session lock, then optionally fails or destroys the
/// session from inside the call.
struct SlowEngine {
    inner: RecordingEngine,
    fail: bool,
    destroy_from_start: bool,
    handle: Arc<Mutex<Option<Coordinator<SlowEngine>>>>,
}

impl PlaybackEngine for SlowEngine {
    fn start(&mut self, surfaces: &SurfaceSet) -> Result<(), EngineError> {
        thread::sleep(Duration::from_millis(100));
        if self.destroy_from_start {
            let handle = self.handle.lock().clone();
            if let Some(coordinator) = handle {
                coordinator.destroy();
            }
        }
        if self.fail {
            return Err(EngineError::StartFailed("device lost".into()));
        }
        self.inner.start(surfaces)
    }

    fn stop(&mut self) {
        self.inner.stop();
    }

    fn destroy(&mut self) {
        self.inner.destroy();
    }
}

/// Host that ends its session by destroying the coordinator from `abort`.
#[derive(Default)]
struct DestroyingHost {
    handle: Mutex<Option<Coordinator<SlowEngine>>>,
    aborted: AtomicBool,
}

impl SessionHost for DestroyingHost {
    fn abort(&self, _error: &CoordinatorError) {
        self.aborted.store(true, Ordering::SeqCst);
        let handle = self.handle.lock().clone();
        if let Some(coordinator) = handle {
            coordinator.destroy();
        }
    }
}

fn slow_session(
    fail: bool,
    destroy_from_start: bool,
) -> (
    Coordinator<SlowEngine>,
    Arc<DestroyingHost>,
    Arc<Mutex<Option<Coordinator<SlowEngine>>>>,
    Journal,
    RecordingViews,
) {
    let journal = Journal::new();
    let views = RecordingViews::new(&journal);
    let host = Arc::new(DestroyingHost::default());
    let handle = Arc::new(Mutex::new(None));
    let engine_handle = handle.clone();
    let engine_journal = journal.clone();
    let config = CoordinatorConfig {
        layout_debounce_ms: 10,
        ..CoordinatorConfig::default()
    };

    let coordinator = Coordinator::create(
        move || {
            Ok(SlowEngine {
                inner: RecordingEngine::new(engine_journal, EngineBehavior::default()),
                fail,
                destroy_from_start,
                handle: engine_handle,
            })
        },
        host.clone(),
        config,
    )
    .unwrap();
    *host.handle.lock() = Some(coordinator.clone());
    *handle.lock() = Some(coordinator.clone());
    (coordinator, host, handle, journal, views)
}

fn run_with_timeout(coordinator: Coordinator<SlowEngine>) -> bool {
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let _ = coordinator.on_surfaces_created();
        let _ = done_tx.send(());
    });
    done_rx.recv_timeout(Duration::from_secs(5)).is_ok()
}

#[test]
fn host_may_destroy_from_abort_while_layout_is_pending() {
    let (coordinator, host, handle, journal, views) = slow_session(true, false);
    coordinator.attach_surfaces(views.surface_set()).unwrap();
    coordinator.on_frame_geometry_changed(hd_frame()).unwrap();
    coordinator
        .on_display_area_changed(DisplayArea::new(1280, 720, false))
        .unwrap();

    assert!(run_with_timeout(coordinator.clone()), "start failure path blocked");
    assert!(host.aborted.load(Ordering::SeqCst));
    assert_eq!(coordinator.state(), EngineRunState::Destroyed);
    assert_eq!(resizes_of(&journal, "video"), 0);

    host.handle.lock().take();
    handle.lock().take();
}

#[test]
fn engine_may_destroy_from_inside_start() {
    let (coordinator, host, handle, journal, views) = slow_session(false, true);
    coordinator.attach_surfaces(views.surface_set()).unwrap();
    coordinator.on_frame_geometry_changed(hd_frame()).unwrap();
    coordinator
        .on_display_area_changed(DisplayArea::new(1280, 720, false))
        .unwrap();

    assert!(run_with_timeout(coordinator.clone()), "re-entrant destroy blocked");
    assert!(!host.aborted.load(Ordering::SeqCst));
    assert_eq!(coordinator.state(), EngineRunState::Destroyed);
    let entries = journal.entries();
    assert_eq!(
        &entries[entries.len() - 2..],
        &[JournalEntry::EngineStop, JournalEntry::EngineDestroy]
    );
    assert_eq!(resizes_of(&journal, "video"), 0);

    host.handle.lock().take();
    handle.lock().take();
}

/// Engine whose surfaces are reported gone while `start` is still running.
struct FlakyEngine {
    inner: RecordingEngine,
    handle: Arc<Mutex<Option<Coordinator<FlakyEngine>>>>,
    teardown: Arc<Mutex<Option<Result<(), CoordinatorError>>>>,
}

impl PlaybackEngine for FlakyEngine {
    fn start(&mut self, surfaces: &SurfaceSet) -> Result<(), EngineError> {
        self.inner.start(surfaces)?;
        let handle = self.handle.lock().clone();
        if let Some(coordinator) = handle {
            *self.teardown.lock() = Some(coordinator.on_surfaces_destroyed());
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.inner.stop();
    }

    fn destroy(&mut self) {
        self.inner.destroy();
    }
}

#[test]
fn reentrant_surfaces_destroyed_reports_deferred_stop() {
    let journal = Journal::new();
    let views = RecordingViews::new(&journal);
    let host = RecordingHost::new(journal.clone());
    let handle = Arc::new(Mutex::new(None));
    let teardown = Arc::new(Mutex::new(None));
    let (engine_handle, engine_teardown) = (handle.clone(), teardown.clone());
    let engine_journal = journal.clone();

    let coordinator = Coordinator::create(
        move || {
            Ok(FlakyEngine {
                inner: RecordingEngine::new(engine_journal, EngineBehavior::default()),
                handle: engine_handle,
                teardown: engine_teardown,
            })
        },
        host,
        CoordinatorConfig::synchronous(),
    )
    .unwrap();
    *handle.lock() = Some(coordinator.clone());

    coordinator.attach_surfaces(views.surface_set()).unwrap();
    coordinator.on_surfaces_created().unwrap();

    assert!(matches!(
        teardown.lock().take(),
        Some(Err(CoordinatorError::Deferred))
    ));
    assert_eq!(coordinator.state(), EngineRunState::Stopped);
    let entries = journal.entries();
    let start = entries.iter().position(is_engine_start).unwrap();
    let stop = entries
        .iter()
        .position(|e| *e == JournalEntry::EngineStop)
        .unwrap();
    assert!(start < stop);

    views.release();
    assert!(journal.violations().is_empty(), "{:?}", journal.violations());

    coordinator.destroy();
    handle.lock().take();
}
