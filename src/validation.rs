use serde::Serialize;

use crate::script::{ScriptEvent, SessionScript};

const LONG_WAIT_MS: u64 = 10_000;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Static checks over a session script.
///
/// Errors are scripts that drive the host into releasing surfaces the
/// engine may still render into; warnings are events the coordinator will
/// reject or ignore at replay time.
pub fn validate_script(script: &SessionScript) -> ValidationReport {
    let mut report = ValidationReport::default();

    if script.version != 1 {
        report
            .errors
            .push(format!("Unsupported session script version: {}", script.version));
    }

    if script.events.is_empty() {
        report
            .errors
            .push("Session script must contain at least one event".into());
    }

    if script.engine.fail_create && !script.events.is_empty() {
        report.warnings.push(
            "Engine creation is set to fail; no event will reach a session".into(),
        );
    }

    report.merge(validate_sequence(&script.events));
    report
}

fn validate_sequence(events: &[ScriptEvent]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut attached = false;
    let mut running = false;
    let mut released = false;
    let mut destroyed_at: Option<usize> = None;

    for (idx, event) in events.iter().enumerate() {
        let position = idx + 1;
        if let Some(destroyed) = destroyed_at {
            if !matches!(
                event,
                ScriptEvent::ReleaseSurfaces | ScriptEvent::RecreateSurfaces | ScriptEvent::WaitMs(_)
            ) {
                report.warnings.push(format!(
                    "Event {position} ('{}') follows destroy at event {} and will be ignored or rejected",
                    event.name(),
                    destroyed + 1
                ));
            }
            continue;
        }

        match event {
            ScriptEvent::AttachSurfaces => {
                if released {
                    report.warnings.push(format!(
                        "Event {position} attaches surfaces that were released and not recreated"
                    ));
                }
                attached = true;
            }
            ScriptEvent::DetachSurfaces => {
                attached = false;
                running = false;
            }
            ScriptEvent::DisplayArea(area) => {
                if u64::from(area.width) * u64::from(area.height) == 0 {
                    report.warnings.push(format!(
                        "Event {position} reports an empty display area {}x{}; the previous layout is kept",
                        area.width, area.height
                    ));
                }
            }
            ScriptEvent::FrameGeometry(frame) => {
                if u64::from(frame.visible_width) * u64::from(frame.visible_height) == 0
                    || u64::from(frame.width) * u64::from(frame.height) == 0
                {
                    report.warnings.push(format!(
                        "Event {position} reports a frame without area; no layout will be applied"
                    ));
                }
                if frame.sar_num == 0 || frame.sar_den == 0 {
                    report.warnings.push(format!(
                        "Event {position} has a zero sample aspect component ({}:{}); square pixels are assumed",
                        frame.sar_num, frame.sar_den
                    ));
                }
            }
            ScriptEvent::SurfacesCreated => {
                if attached {
                    running = true;
                } else {
                    report.warnings.push(format!(
                        "Event {position} reports surfaces created before any were attached"
                    ));
                }
            }
            ScriptEvent::SurfacesDestroyed => running = false,
            ScriptEvent::ReleaseSurfaces => {
                if running {
                    report.errors.push(format!(
                        "Event {position} releases surfaces while the engine may be rendering; \
                         surfaces-destroyed or detach-surfaces must come first"
                    ));
                } else if attached {
                    report.warnings.push(format!(
                        "Event {position} releases surfaces that are still attached; \
                         a later layout would touch them"
                    ));
                }
                released = true;
            }
            ScriptEvent::RecreateSurfaces => released = false,
            ScriptEvent::WaitMs(ms) => {
                if *ms > LONG_WAIT_MS {
                    report
                        .warnings
                        .push(format!("Event {position} waits {ms} ms"));
                }
            }
            ScriptEvent::Destroy => destroyed_at = Some(idx),
            ScriptEvent::FitPolicy(_) | ScriptEvent::ApplyGeometry | ScriptEvent::FlushLayout => {}
        }
    }

    report
}
