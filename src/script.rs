//! Declarative session scripts.
//!
//! A script lists host and engine events in the order they arrive and is
//! replayed against the recording collaborators in [`crate::sim`]. Layout
//! policy, debounce window and engine failure modes come from the script
//! itself so a scenario is fully described by one YAML file.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use glob::glob;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, CoordinatorConfig, CoordinatorError, EngineRunState};
use crate::geometry::{DisplayArea, FitPolicy, FrameGeometry};
use crate::observability::MetricsSnapshot;
use crate::sim::{EngineBehavior, Journal, JournalEntry, RecordingEngine, RecordingHost, RecordingViews};

#[derive(Debug, Clone, Deserialize)]
pub struct SessionScript {
    pub version: u32,
    #[serde(default)]
    pub config: CoordinatorConfig,
    #[serde(default)]
    pub engine: EngineSpec,
    pub events: Vec<ScriptEvent>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct EngineSpec {
    #[serde(default)]
    pub fail_create: bool,
    #[serde(default)]
    pub fail_start: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptEvent {
    AttachSurfaces,
    DetachSurfaces,
    DisplayArea(DisplayArea),
    FrameGeometry(FrameSpec),
    FitPolicy(FitPolicy),
    ApplyGeometry,
    FlushLayout,
    SurfacesCreated,
    SurfacesDestroyed,
    ReleaseSurfaces,
    RecreateSurfaces,
    WaitMs(u64),
    Destroy,
}

impl ScriptEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ScriptEvent::AttachSurfaces => "attach-surfaces",
            ScriptEvent::DetachSurfaces => "detach-surfaces",
            ScriptEvent::DisplayArea(_) => "display-area",
            ScriptEvent::FrameGeometry(_) => "frame-geometry",
            ScriptEvent::FitPolicy(_) => "fit-policy",
            ScriptEvent::ApplyGeometry => "apply-geometry",
            ScriptEvent::FlushLayout => "flush-layout",
            ScriptEvent::SurfacesCreated => "surfaces-created",
            ScriptEvent::SurfacesDestroyed => "surfaces-destroyed",
            ScriptEvent::ReleaseSurfaces => "release-surfaces",
            ScriptEvent::RecreateSurfaces => "recreate-surfaces",
            ScriptEvent::WaitMs(_) => "wait-ms",
            ScriptEvent::Destroy => "destroy",
        }
    }
}

/// Raw engine layout callback arguments.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct FrameSpec {
    pub width: u32,
    pub height: u32,
    pub visible_width: u32,
    pub visible_height: u32,
    #[serde(default = "default_sar_part")]
    pub sar_num: u32,
    #[serde(default = "default_sar_part")]
    pub sar_den: u32,
}

fn default_sar_part() -> u32 {
    1
}

impl From<FrameSpec> for FrameGeometry {
    fn from(spec: FrameSpec) -> Self {
        FrameGeometry::from_raw(
            spec.width,
            spec.height,
            spec.visible_width,
            spec.visible_height,
            spec.sar_num,
            spec.sar_den,
        )
    }
}

impl SessionScript {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read session script: {}", path.display()))?;
        let script: SessionScript = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse session script YAML: {}", path.display()))?;
        Ok(script)
    }
}

/// Expands glob patterns into script paths, failing on a pattern that
/// matches nothing.
pub fn expand_patterns(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut resolved = Vec::new();
    for pattern in patterns {
        let matches =
            glob(pattern).with_context(|| format!("Invalid glob pattern: {pattern}"))?;
        let mut found = false;
        for entry in matches {
            let path = entry?;
            if path.is_file() {
                resolved.push(path);
                found = true;
            }
        }
        if !found {
            anyhow::bail!("No session scripts matched pattern: {pattern}");
        }
    }
    Ok(resolved)
}

#[derive(Debug, Clone, Serialize)]
pub struct EventOutcome {
    pub index: usize,
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub generated_at: DateTime<Utc>,
    pub final_state: Option<EngineRunState>,
    pub aborted: bool,
    pub outcomes: Vec<EventOutcome>,
    pub journal: Vec<JournalEntry>,
    pub violations: Vec<String>,
    pub metrics: MetricsSnapshot,
}

impl ReplayReport {
    pub fn failures(&self) -> impl Iterator<Item = &EventOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.error.is_some())
    }
}

/// Replays `script` against recording collaborators.
///
/// The session is dropped before the journal is collected, so teardown of a
/// session the script never destroyed shows up at the end of the journal.
pub fn replay(script: &SessionScript) -> Result<ReplayReport> {
    let journal = Journal::new();
    let host = RecordingHost::new(journal.clone());
    let views = RecordingViews::new(&journal);
    let behavior = EngineBehavior {
        fail_start: script.engine.fail_start,
    };

    let coordinator = match Coordinator::create(
        RecordingEngine::factory(journal.clone(), behavior, script.engine.fail_create),
        host.clone(),
        script.config.clone(),
    ) {
        Ok(coordinator) => Some(coordinator),
        Err(err) if err.is_fatal() => {
            warn!(error = %err, "Session could not be created");
            None
        }
        Err(err) => return Err(err).context("Failed to create coordinator"),
    };

    let mut outcomes = Vec::with_capacity(script.events.len());
    for (index, event) in script.events.iter().enumerate() {
        let error = match &coordinator {
            Some(coordinator) => apply_event(coordinator, &views, event)
                .err()
                .map(|err| err.to_string()),
            None => Some("no session: engine creation failed".to_string()),
        };
        debug!(index, event = event.name(), error = ?error, "Replayed event");
        outcomes.push(EventOutcome {
            index,
            event: event.name(),
            error,
        });
    }

    let final_state = coordinator.as_ref().map(|c| c.state());
    let collector = coordinator.as_ref().map(|c| c.metrics());
    drop(coordinator);
    let metrics = collector.map(|c| c.snapshot()).unwrap_or_default();

    let violations = journal.violations();
    info!(
        events = outcomes.len(),
        journal = journal.len(),
        violations = violations.len(),
        "Session replay finished"
    );

    Ok(ReplayReport {
        generated_at: Utc::now(),
        final_state,
        aborted: host.aborted(),
        outcomes,
        journal: journal.entries(),
        violations,
        metrics,
    })
}

fn apply_event(
    coordinator: &Coordinator<RecordingEngine>,
    views: &RecordingViews,
    event: &ScriptEvent,
) -> Result<(), CoordinatorError> {
    match event {
        ScriptEvent::AttachSurfaces => coordinator.attach_surfaces(views.surface_set()),
        ScriptEvent::DetachSurfaces => coordinator.detach_surfaces(),
        ScriptEvent::DisplayArea(area) => coordinator.on_display_area_changed(*area),
        ScriptEvent::FrameGeometry(spec) => coordinator.on_frame_geometry_changed((*spec).into()),
        ScriptEvent::FitPolicy(policy) => coordinator.set_fit_policy(*policy),
        ScriptEvent::ApplyGeometry => coordinator.apply_geometry(),
        ScriptEvent::FlushLayout => coordinator.flush_layout(),
        ScriptEvent::SurfacesCreated => coordinator.on_surfaces_created(),
        ScriptEvent::SurfacesDestroyed => coordinator.on_surfaces_destroyed(),
        ScriptEvent::ReleaseSurfaces => {
            views.release();
            Ok(())
        }
        ScriptEvent::RecreateSurfaces => {
            views.recreate();
            Ok(())
        }
        ScriptEvent::WaitMs(ms) => {
            thread::sleep(Duration::from_millis(*ms));
            Ok(())
        }
        ScriptEvent::Destroy => {
            coordinator.destroy();
            Ok(())
        }
    }
}
