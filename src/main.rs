use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::to_writer_pretty;
use surface_sync::geometry::{DisplayArea, FitPolicy, FrameGeometry, SurfaceLayout, resolve};
use surface_sync::observability::log_snapshot;
use surface_sync::script::{SessionScript, expand_patterns, replay};
use surface_sync::validation::validate_script;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let otlp_endpoint_for_tracing = match &cli.command {
        Commands::Replay { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result = match cli.command {
        Commands::Resolve {
            width,
            height,
            visible_width,
            visible_height,
            sar,
            display,
            portrait,
            policy,
            json,
        } => {
            let frame =
                FrameGeometry::from_raw(width, height, visible_width, visible_height, sar.0, sar.1);
            let display = DisplayArea::new(display.0, display.1, portrait);
            resolve_command(frame, display, policy, json)
        }
        Commands::Replay {
            script,
            journal_json,
            print_metrics,
            metrics_prometheus,
            ..
        } => replay_command(script, journal_json, print_metrics, metrics_prometheus),
        Commands::Validate { scripts } => validate_command(&scripts),
        Commands::Policies => {
            list_policies();
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

/// Logs go to stderr so `resolve --json` and the replay journal keep stdout
/// machine-readable.
fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    #[cfg(feature = "otel")]
    if let Some(endpoint) = otlp_endpoint {
        let tracer = otlp_tracer(endpoint)?;
        return registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()));
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{endpoint}' ignored; rebuild with --features otel to export traces."
        );
    }

    registry.try_init().map_err(|err| anyhow!(err.to_string()))
}

#[cfg(feature = "otel")]
fn otlp_tracer(endpoint: &str) -> Result<sdktrace::Tracer> {
    let resource = Resource::new(vec![KeyValue::new("service.name", "surface-sync")]);
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(sdktrace::Config::default().with_resource(resource))
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .install_simple()
        .with_context(|| format!("Failed to install OTLP exporter for {endpoint}"))?;
    Ok(tracer)
}

#[derive(Serialize)]
struct ResolveOutput {
    policy: FitPolicy,
    frame: FrameGeometry,
    display: DisplayArea,
    layout: Option<SurfaceLayout>,
}

fn resolve_command(
    frame: FrameGeometry,
    display: DisplayArea,
    policy: FitPolicy,
    json: bool,
) -> Result<()> {
    let display_area = &display;
    debug!(?frame, display = ?display_area, %policy, "Resolving layout");
    let layout = resolve(&frame, &display, policy)
        .with_context(|| format!("Cannot lay out {}x{}", display.width, display.height))?;

    if json {
        let output = ResolveOutput {
            policy,
            frame,
            display,
            layout,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    match layout {
        Some(layout) => {
            println!("policy: {policy}");
            println!("video:  {}", layout.video);
            println!("frame:  {}", layout.frame);
        }
        None => println!("frame geometry has no area yet; nothing to lay out"),
    }
    Ok(())
}

fn replay_command(
    script_path: PathBuf,
    journal_json: Option<PathBuf>,
    print_metrics: bool,
    metrics_prometheus: Option<PathBuf>,
) -> Result<()> {
    let script = SessionScript::load(&script_path)?;
    let checks = validate_script(&script);
    for message in checks.errors.iter().chain(&checks.warnings) {
        warn!(file = %script_path.display(), "{message}");
    }

    let report = replay(&script)?;

    for (idx, entry) in report.journal.iter().enumerate() {
        println!("{idx:>4}  {}", serde_json::to_string(entry)?);
    }
    for outcome in report.failures() {
        if let Some(message) = &outcome.error {
            warn!(event = outcome.event, index = outcome.index, "{message}");
        }
    }
    match report.final_state {
        Some(state) => info!(state = %state, aborted = report.aborted, "Replay complete"),
        None => info!(aborted = report.aborted, "Replay complete without a session"),
    }

    if let Some(path) = journal_json {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create journal directory: {}", parent.display())
            })?;
        }
        let file = File::create(&path)
            .with_context(|| format!("Failed to create journal file: {}", path.display()))?;
        to_writer_pretty(file, &report)
            .with_context(|| format!("Failed to write journal JSON: {}", path.display()))?;
        info!(journal = %path.display(), "Replay journal written");
    }

    if print_metrics {
        log_snapshot(&report.metrics);
    }
    if let Some(path) = metrics_prometheus {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create metrics directory: {}", parent.display())
            })?;
        }
        std::fs::write(&path, report.metrics.to_prometheus()).with_context(|| {
            format!("Failed to write Prometheus metrics: {}", path.display())
        })?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }

    if !report.violations.is_empty() {
        for violation in &report.violations {
            error!(file = %script_path.display(), "{violation}");
        }
        bail!(
            "Replay recorded {} surface lifecycle violation(s)",
            report.violations.len()
        );
    }
    Ok(())
}

fn validate_command(patterns: &[String]) -> Result<()> {
    let paths = expand_patterns(patterns)?;
    let mut failed = 0usize;

    for path in &paths {
        let script = SessionScript::load(path)?;
        let report = validate_script(&script);

        for warning in &report.warnings {
            warn!(file = %path.display(), "{warning}");
        }
        if report.is_ok() {
            info!(file = %path.display(), "Session script validation passed");
        } else {
            for error_msg in &report.errors {
                error!(file = %path.display(), "{error_msg}");
            }
            failed += 1;
        }
    }

    if failed > 0 {
        Err(anyhow!(
            "{failed} of {} session script(s) failed validation",
            paths.len()
        ))
    } else {
        Ok(())
    }
}

fn list_policies() {
    for policy in FitPolicy::ALL {
        let description = match policy {
            FitPolicy::BestFit => "fit inside the display area, keep aspect ratio",
            FitPolicy::FitHorizontal => "match the display width, keep aspect ratio",
            FitPolicy::FitVertical => "match the display height, keep aspect ratio",
            FitPolicy::Fill => "stretch to the whole display area",
            FitPolicy::Force16x9 => "fit inside with a forced 16:9 aspect ratio",
            FitPolicy::Force4x3 => "fit inside with a forced 4:3 aspect ratio",
            FitPolicy::Original => "visible size, unscaled",
        };
        println!("{:<16} {description}", policy.name());
    }
}

fn parse_pair(value: &str, separators: &[char]) -> Result<(u32, u32), String> {
    let (left, right) = value
        .split_once(|c| separators.contains(&c))
        .ok_or_else(|| format!("expected two numbers separated by one of {separators:?}"))?;
    let left = left
        .trim()
        .parse::<u32>()
        .map_err(|err| format!("invalid number '{left}': {err}"))?;
    let right = right
        .trim()
        .parse::<u32>()
        .map_err(|err| format!("invalid number '{right}': {err}"))?;
    Ok((left, right))
}

fn parse_sar(value: &str) -> Result<(u32, u32), String> {
    parse_pair(value, &[':', '/'])
}

fn parse_display(value: &str) -> Result<(u32, u32), String> {
    parse_pair(value, &['x', 'X'])
}

#[derive(Parser)]
#[command(
    name = "surface-sync",
    version,
    about = "Video surface geometry and lifecycle coordination toolkit"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the video and container sizes for one frame and display area
    Resolve {
        #[arg(long)]
        width: u32,
        #[arg(long)]
        height: u32,
        #[arg(long = "visible-width")]
        visible_width: u32,
        #[arg(long = "visible-height")]
        visible_height: u32,
        #[arg(long, value_parser = parse_sar, default_value = "1:1")]
        sar: (u32, u32),
        #[arg(long, value_parser = parse_display, value_name = "WxH")]
        display: (u32, u32),
        #[arg(long)]
        portrait: bool,
        #[arg(long, value_enum, default_value_t = FitPolicy::BestFit)]
        policy: FitPolicy,
        #[arg(long)]
        json: bool,
    },
    /// Replay a session script against recording collaborators
    Replay {
        script: PathBuf,
        #[arg(long = "journal-json")]
        journal_json: Option<PathBuf>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    /// Validate one or more session scripts (glob patterns accepted)
    Validate {
        #[arg(required = true)]
        scripts: Vec<String>,
    },
    /// List the available fit policies
    Policies,
}
