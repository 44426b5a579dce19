//! Recording collaborators.
//!
//! Stand-ins for the engine, the host views and the hosting session that
//! write every call they receive into a shared [`Journal`]. Session replays
//! run against them, and the journal can be checked for lifecycle
//! violations afterwards.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::coordinator::{CoordinatorError, SessionHost};
use crate::engine::{EngineError, PlaybackEngine, ScalingHint};
use crate::geometry::PixelSize;
use crate::surface::{Surface, SurfaceSet};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "call", rename_all = "kebab-case")]
pub enum JournalEntry {
    EngineStart { video: String },
    EngineStartFailed,
    EngineStop,
    EngineDestroy,
    WindowSize { width: u32, height: u32 },
    Scaling { hint: ScalingHint },
    Resize { surface: String, size: PixelSize },
    Invalidate { surface: String },
    Released { surface: String },
    Recreated { surface: String },
    Abort { reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: JournalEntry) {
        self.entries.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn count(&self, predicate: impl Fn(&JournalEntry) -> bool) -> usize {
        self.entries.lock().iter().filter(|entry| predicate(entry)).count()
    }

    /// Lifecycle violations found in the recorded calls:
    /// a surface released while the engine was rendering, a surface touched
    /// after release, or an engine started twice or into a released surface.
    pub fn violations(&self) -> Vec<String> {
        let entries = self.entries.lock();
        let mut violations = Vec::new();
        let mut rendering = false;
        let mut released: Vec<&str> = Vec::new();

        for (idx, entry) in entries.iter().enumerate() {
            match entry {
                JournalEntry::EngineStart { video } => {
                    if rendering {
                        violations.push(format!("#{idx}: engine started while already running"));
                    }
                    if released.contains(&video.as_str()) {
                        violations.push(format!(
                            "#{idx}: engine started on released surface '{video}'"
                        ));
                    }
                    rendering = true;
                }
                JournalEntry::EngineStop | JournalEntry::EngineDestroy => rendering = false,
                JournalEntry::Released { surface } => {
                    if rendering {
                        violations.push(format!(
                            "#{idx}: surface '{surface}' released while the engine was rendering"
                        ));
                    }
                    released.push(surface.as_str());
                }
                JournalEntry::Recreated { surface } => {
                    released.retain(|name| *name != surface.as_str());
                }
                JournalEntry::Resize { surface, .. } | JournalEntry::Invalidate { surface } => {
                    if released.contains(&surface.as_str()) {
                        violations.push(format!(
                            "#{idx}: surface '{surface}' touched after release"
                        ));
                    }
                }
                _ => {}
            }
        }
        violations
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineBehavior {
    pub fail_start: bool,
}

pub struct RecordingEngine {
    journal: Journal,
    behavior: EngineBehavior,
}

impl RecordingEngine {
    pub fn new(journal: Journal, behavior: EngineBehavior) -> Self {
        Self { journal, behavior }
    }

    /// Factory for `Coordinator::create`; `fail` simulates an engine that
    /// cannot be allocated.
    pub fn factory(
        journal: Journal,
        behavior: EngineBehavior,
        fail: bool,
    ) -> impl FnOnce() -> Result<RecordingEngine, EngineError> {
        move || {
            if fail {
                Err(EngineError::CreateFailed("simulated allocation failure".into()))
            } else {
                Ok(RecordingEngine::new(journal, behavior))
            }
        }
    }
}

impl PlaybackEngine for RecordingEngine {
    fn start(&mut self, surfaces: &SurfaceSet) -> Result<(), EngineError> {
        if self.behavior.fail_start {
            self.journal.push(JournalEntry::EngineStartFailed);
            return Err(EngineError::StartFailed("simulated start failure".into()));
        }
        self.journal.push(JournalEntry::EngineStart {
            video: surfaces.video().name().to_string(),
        });
        Ok(())
    }

    fn stop(&mut self) {
        self.journal.push(JournalEntry::EngineStop);
    }

    fn destroy(&mut self) {
        self.journal.push(JournalEntry::EngineDestroy);
    }

    fn set_window_size(&mut self, width: u32, height: u32) {
        self.journal.push(JournalEntry::WindowSize { width, height });
    }

    fn set_scaling(&mut self, hint: ScalingHint) {
        self.journal.push(JournalEntry::Scaling { hint });
    }
}

pub struct RecordingSurface {
    name: String,
    journal: Journal,
    size: Mutex<Option<PixelSize>>,
    released: AtomicBool,
}

impl RecordingSurface {
    pub fn new(name: impl Into<String>, journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            journal,
            size: Mutex::new(None),
            released: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> Option<PixelSize> {
        *self.size.lock()
    }

    /// The host frees the drawable.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.journal.push(JournalEntry::Released {
                surface: self.name.clone(),
            });
        }
    }

    /// A new drawable comes up under the same name.
    pub fn recreate(&self) {
        if self.released.swap(false, Ordering::SeqCst) {
            self.journal.push(JournalEntry::Recreated {
                surface: self.name.clone(),
            });
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Surface for RecordingSurface {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_size(&self, size: PixelSize) {
        *self.size.lock() = Some(size);
        self.journal.push(JournalEntry::Resize {
            surface: self.name.clone(),
            size,
        });
    }

    fn invalidate(&self) {
        self.journal.push(JournalEntry::Invalidate {
            surface: self.name.clone(),
        });
    }
}

/// The views of one host window, in recording form.
#[derive(Clone)]
pub struct RecordingViews {
    pub video: Arc<RecordingSurface>,
    pub container: Arc<RecordingSurface>,
    pub subtitles: Arc<RecordingSurface>,
    pub ui: Arc<RecordingSurface>,
}

impl RecordingViews {
    pub fn new(journal: &Journal) -> Self {
        Self {
            video: RecordingSurface::new("video", journal.clone()),
            container: RecordingSurface::new("frame", journal.clone()),
            subtitles: RecordingSurface::new("subtitles", journal.clone()),
            ui: RecordingSurface::new("ui", journal.clone()),
        }
    }

    pub fn surface_set(&self) -> SurfaceSet {
        SurfaceSet::new(self.video.clone(), self.container.clone())
            .with_subtitles(self.subtitles.clone())
            .with_ui(self.ui.clone())
    }

    pub fn release(&self) {
        for surface in self.all() {
            surface.release();
        }
    }

    pub fn recreate(&self) {
        for surface in self.all() {
            surface.recreate();
        }
    }

    fn all(&self) -> [&Arc<RecordingSurface>; 4] {
        [&self.video, &self.container, &self.subtitles, &self.ui]
    }
}

#[derive(Debug, Default)]
pub struct RecordingHost {
    journal: Journal,
    aborted: AtomicBool,
}

impl RecordingHost {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            aborted: AtomicBool::new(false),
        })
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

impl SessionHost for RecordingHost {
    fn abort(&self, error: &CoordinatorError) {
        self.aborted.store(true, Ordering::SeqCst);
        self.journal.push(JournalEntry::Abort {
            reason: error.to_string(),
        });
    }
}
