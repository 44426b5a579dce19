//! Randomized host/engine interleavings against one coordinator.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use surface_sync::coordinator::{Coordinator, CoordinatorConfig};
use surface_sync::geometry::{DisplayArea, FitPolicy, FrameGeometry};
use surface_sync::sim::{
    EngineBehavior, Journal, JournalEntry, RecordingEngine, RecordingHost, RecordingViews,
};

const STEPS: usize = 300;

fn run_session(seed: u64, config: CoordinatorConfig) {
    let journal = Journal::new();
    let views = RecordingViews::new(&journal);
    let host = RecordingHost::new(journal.clone());
    let coordinator = Coordinator::create(
        RecordingEngine::factory(journal.clone(), EngineBehavior::default(), false),
        host,
        config,
    )
    .expect("engine allocates");
    let destroyed = Arc::new(AtomicBool::new(false));

    let host_thread = {
        let coordinator = coordinator.clone();
        let views = views.clone();
        let destroyed = destroyed.clone();
        thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut attached = false;
            for _ in 0..STEPS {
                if destroyed.load(Ordering::SeqCst) {
                    break;
                }
                match rng.gen_range(0..10) {
                    0 | 1 if !attached => {
                        views.recreate();
                        attached = coordinator.attach_surfaces(views.surface_set()).is_ok();
                    }
                    2 if attached => {
                        let _ = coordinator.detach_surfaces();
                        views.release();
                        attached = false;
                    }
                    3 => {
                        let policy = FitPolicy::ALL[rng.gen_range(0..FitPolicy::ALL.len())];
                        let _ = coordinator.set_fit_policy(policy);
                    }
                    4 => {
                        let _ = coordinator.flush_layout();
                    }
                    _ => {
                        let area = DisplayArea::new(
                            rng.gen_range(0..2000),
                            rng.gen_range(0..2000),
                            rng.gen_bool(0.3),
                        );
                        let _ = coordinator.on_display_area_changed(area);
                    }
                }
            }
            if attached && !destroyed.load(Ordering::SeqCst) {
                let _ = coordinator.detach_surfaces();
                views.release();
            }
        })
    };

    let engine_thread = {
        let coordinator = coordinator.clone();
        let destroyed = destroyed.clone();
        thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_mul(31).wrapping_add(7));
            for _ in 0..STEPS {
                if destroyed.load(Ordering::SeqCst) {
                    break;
                }
                match rng.gen_range(0..6) {
                    0 | 1 => {
                        let _ = coordinator.on_surfaces_created();
                    }
                    2 => {
                        let _ = coordinator.on_surfaces_destroyed();
                    }
                    _ => {
                        let visible_width = rng.gen_range(0..1920);
                        let visible_height = rng.gen_range(0..1080);
                        let frame = FrameGeometry::from_raw(
                            visible_width + 16,
                            visible_height + 8,
                            visible_width,
                            visible_height,
                            rng.gen_range(0..4),
                            rng.gen_range(0..4),
                        );
                        let _ = coordinator.on_frame_geometry_changed(frame);
                    }
                }
            }
        })
    };

    let mut rng = StdRng::seed_from_u64(seed ^ 0xdead_beef);
    for _ in 0..rng.gen_range(50..400) {
        thread::yield_now();
    }
    coordinator.destroy();
    destroyed.store(true, Ordering::SeqCst);
    let at_destroy = journal.len();

    host_thread.join().expect("host thread");
    engine_thread.join().expect("engine thread");

    let entries = journal.entries();
    let destroy_index = entries
        .iter()
        .position(|entry| *entry == JournalEntry::EngineDestroy)
        .expect("engine released on destroy");
    assert!(destroy_index < at_destroy);
    for (idx, entry) in entries.iter().enumerate().skip(destroy_index + 1) {
        assert!(
            matches!(
                entry,
                JournalEntry::Released { .. } | JournalEntry::Recreated { .. }
            ),
            "seed {seed}: #{idx} {entry:?} after the engine was released"
        );
    }

    let violations = journal.violations();
    assert!(violations.is_empty(), "seed {seed}: {violations:?}");
}

#[test]
fn synchronous_layout_never_renders_into_released_surfaces() {
    for seed in 0..24 {
        run_session(seed, CoordinatorConfig::synchronous());
    }
}

#[test]
fn debounced_layout_never_renders_into_released_surfaces() {
    for seed in 100..116 {
        let config = CoordinatorConfig {
            layout_debounce_ms: 1,
            ..CoordinatorConfig::default()
        };
        run_session(seed, config);
    }
}
