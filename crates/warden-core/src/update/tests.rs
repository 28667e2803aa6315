use super::*;
use crate::config::WardenConfig;
use crate::error::WardenError;
use crate::fetch::SourceFetcher;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use tempfile::tempdir;

const MARKER: &str = "# warden-agent";

fn source_with_version(version: &str) -> String {
    format!("#!/bin/sh\n{MARKER}\nVERSION=\"{version}\"\necho serving\n")
}

fn sample_config(dir: &Path) -> Arc<WardenConfig> {
    let mut config = WardenConfig::default();
    config.agent.artifact_path = dir.join("agent.sh");
    config.agent.required_marker = MARKER.to_string();
    config.update.source_url = "https://example.invalid/agent.sh".to_string();
    config.update.restart_delay_ms = 0;
    Arc::new(config)
}

#[derive(Clone)]
struct StubFetcher {
    body: Arc<Mutex<String>>,
    fetches: Arc<AtomicU32>,
    /// Hold every fetch until the barrier releases, to widen race windows.
    gate: Option<Arc<Barrier>>,
}

impl StubFetcher {
    fn new(body: &str) -> Self {
        Self {
            body: Arc::new(Mutex::new(body.to_string())),
            fetches: Arc::new(AtomicU32::new(0)),
            gate: None,
        }
    }

    fn gated(body: &str, gate: Arc<Barrier>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(body)
        }
    }
}

impl SourceFetcher for StubFetcher {
    fn fetch(&self) -> WardenResult<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        Ok(self.body.lock().unwrap().clone())
    }
}

#[derive(Clone)]
struct FailingFetcher;

impl SourceFetcher for FailingFetcher {
    fn fetch(&self) -> WardenResult<String> {
        Err(WardenError::Fetch("connection refused".into()))
    }
}

/// Mover that pretends elevation always works; writes land directly.
#[derive(Clone, Default)]
struct PlainMover;

impl ElevatedMover for PlainMover {
    fn move_into_place(&self, temp: &Path, target: &Path) -> WardenResult<()> {
        std::fs::rename(temp, target)?;
        Ok(())
    }

    fn repair_ownership(&self, _target: &Path, _user: &str) -> WardenResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct CountingRestarter {
    restarts: AtomicU32,
    units: Mutex<Vec<String>>,
}

impl ServiceRestarter for CountingRestarter {
    fn restart(&self, unit: &str) -> WardenResult<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.units.lock().unwrap().push(unit.to_string());
        Ok(())
    }
}

fn controller_with(
    config: Arc<WardenConfig>,
    fetcher: StubFetcher,
    restarter: Arc<CountingRestarter>,
) -> UpdateController<StubFetcher, PlainMover> {
    UpdateController::with_parts(
        config,
        fetcher,
        AtomicWriter::with_mover(PlainMover::default()),
        restarter,
    )
}

fn wait_for_restarts(restarter: &CountingRestarter, expected: u32) {
    for _ in 0..200 {
        if restarter.restarts.load(Ordering::SeqCst) >= expected {
            return;
        }
        thread::sleep(std::time::Duration::from_millis(10));
    }
    panic!(
        "restarter never reached {expected} calls (saw {})",
        restarter.restarts.load(Ordering::SeqCst)
    );
}

#[test]
fn check_reports_available_for_newer_remote() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("agent.sh"), source_with_version("1.0")).unwrap();
    let config = sample_config(dir.path());
    let controller = controller_with(
        config,
        StubFetcher::new(&source_with_version("2.0")),
        Arc::new(CountingRestarter::default()),
    );

    assert_eq!(controller.current_version(), "1.0");
    let outcome = controller.check_for_update().unwrap();
    assert!(outcome.available);
    assert_eq!(outcome.remote_version.as_deref(), Some("2.0"));
}

#[test]
fn check_is_not_available_for_same_version() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("agent.sh"), source_with_version("1.0")).unwrap();
    let config = sample_config(dir.path());
    let controller = controller_with(
        config,
        StubFetcher::new(&source_with_version("1.0")),
        Arc::new(CountingRestarter::default()),
    );

    let outcome = controller.check_for_update().unwrap();
    assert!(!outcome.available);
    assert_eq!(outcome.verdict, Verdict::SameVersion);
}

#[test]
fn check_never_writes_anything() {
    let dir = tempdir().unwrap();
    let artifact = dir.path().join("agent.sh");
    std::fs::write(&artifact, source_with_version("1.0")).unwrap();
    let config = sample_config(dir.path());
    let controller = controller_with(
        config,
        StubFetcher::new(&source_with_version("2.0")),
        Arc::new(CountingRestarter::default()),
    );

    controller.check_for_update().unwrap();
    assert_eq!(
        std::fs::read_to_string(&artifact).unwrap(),
        source_with_version("1.0")
    );
}

#[test]
fn apply_replaces_artifact_and_schedules_one_restart() {
    let dir = tempdir().unwrap();
    let artifact = dir.path().join("agent.sh");
    std::fs::write(&artifact, source_with_version("1.0")).unwrap();
    let config = sample_config(dir.path());
    let restarter = Arc::new(CountingRestarter::default());
    let remote = source_with_version("2.0");
    let controller = controller_with(
        config.clone(),
        StubFetcher::new(&remote),
        restarter.clone(),
    );

    let outcome = controller.apply_update().unwrap();
    assert_eq!(
        outcome,
        ApplyOutcome::Applied {
            version: "2.0".into()
        }
    );
    assert_eq!(std::fs::read_to_string(&artifact).unwrap(), remote);
    assert_eq!(controller.current_version(), "2.0");
    assert_eq!(controller.phase(), UpdatePhase::RestartScheduled);

    wait_for_restarts(&restarter, 1);
    assert_eq!(restarter.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(
        restarter.units.lock().unwrap().as_slice(),
        &[config.agent.service_unit.clone()]
    );
}

#[test]
fn apply_same_version_is_a_noop() {
    let dir = tempdir().unwrap();
    let artifact = dir.path().join("agent.sh");
    std::fs::write(&artifact, source_with_version("1.0")).unwrap();
    let config = sample_config(dir.path());
    let restarter = Arc::new(CountingRestarter::default());
    let controller = controller_with(
        config,
        StubFetcher::new(&source_with_version("1.0")),
        restarter.clone(),
    );

    let outcome = controller.apply_update().unwrap();
    assert_eq!(outcome, ApplyOutcome::AlreadyCurrent);
    assert_eq!(controller.phase(), UpdatePhase::Idle);
    assert_eq!(restarter.restarts.load(Ordering::SeqCst), 0);
    assert_eq!(
        std::fs::read_to_string(&artifact).unwrap(),
        source_with_version("1.0")
    );
}

#[test]
fn apply_rejects_candidate_without_marker() {
    let dir = tempdir().unwrap();
    let artifact = dir.path().join("agent.sh");
    std::fs::write(&artifact, source_with_version("1.0")).unwrap();
    let config = sample_config(dir.path());
    let restarter = Arc::new(CountingRestarter::default());
    let controller = controller_with(
        config,
        StubFetcher::new("#!/bin/sh\nVERSION=\"9.9\"\necho rogue\n"),
        restarter.clone(),
    );

    let err = controller.apply_update().unwrap_err();
    assert!(matches!(err, WardenError::InvalidContent(_)));
    assert_eq!(controller.phase(), UpdatePhase::Idle);
    assert_eq!(controller.current_version(), "1.0");
    // The writer must never have been reached.
    assert_eq!(
        std::fs::read_to_string(&artifact).unwrap(),
        source_with_version("1.0")
    );
    assert_eq!(restarter.restarts.load(Ordering::SeqCst), 0);
}

#[test]
fn apply_rejects_broken_syntax_with_line() {
    let dir = tempdir().unwrap();
    let artifact = dir.path().join("agent.sh");
    std::fs::write(&artifact, source_with_version("1.0")).unwrap();
    let config = sample_config(dir.path());
    let controller = controller_with(
        config,
        StubFetcher::new(&format!("{MARKER}\nVERSION=\"2.0\"\nif then fi (\n")),
        Arc::new(CountingRestarter::default()),
    );

    let err = controller.apply_update().unwrap_err();
    match err {
        WardenError::InvalidSyntax { line, .. } => assert!(line.is_some()),
        other => panic!("expected syntax rejection, got {other:?}"),
    }
    assert_eq!(
        std::fs::read_to_string(&artifact).unwrap(),
        source_with_version("1.0")
    );
}

#[test]
fn fetch_failure_propagates_and_resets_phase() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("agent.sh"), source_with_version("1.0")).unwrap();
    let config = sample_config(dir.path());
    let controller = UpdateController::with_parts(
        config,
        FailingFetcher,
        AtomicWriter::with_mover(PlainMover::default()),
        Arc::new(CountingRestarter::default()),
    );

    let err = controller.apply_update().unwrap_err();
    assert!(matches!(err, WardenError::Fetch(_)));
    assert_eq!(controller.phase(), UpdatePhase::Idle);
}

#[test]
fn concurrent_applies_admit_exactly_one_writer() {
    let dir = tempdir().unwrap();
    let artifact = dir.path().join("agent.sh");
    std::fs::write(&artifact, source_with_version("1.0")).unwrap();
    let config = sample_config(dir.path());
    let restarter = Arc::new(CountingRestarter::default());

    // Both threads rendezvous inside fetch only if both enter the pipeline;
    // the gate admits the test thread plus at most one fetcher.
    let gate = Arc::new(Barrier::new(2));
    let fetcher = StubFetcher::gated(&source_with_version("2.0"), gate.clone());
    let controller = Arc::new(controller_with(config, fetcher.clone(), restarter.clone()));

    let first = {
        let controller = controller.clone();
        thread::spawn(move || controller.apply_update())
    };
    // Give the first apply time to take the flight lock and block in fetch.
    thread::sleep(std::time::Duration::from_millis(100));
    let second = controller.apply_update();
    assert!(matches!(second, Err(WardenError::UpdateBusy)));

    gate.wait();
    let outcome = first.join().unwrap().unwrap();
    assert_eq!(
        outcome,
        ApplyOutcome::Applied {
            version: "2.0".into()
        }
    );
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    wait_for_restarts(&restarter, 1);
    assert_eq!(restarter.restarts.load(Ordering::SeqCst), 1);
}

#[test]
fn pending_restart_rejects_further_applies() {
    let dir = tempdir().unwrap();
    let artifact = dir.path().join("agent.sh");
    std::fs::write(&artifact, source_with_version("1.0")).unwrap();

    let mut config = WardenConfig::default();
    config.agent.artifact_path = artifact.clone();
    config.agent.required_marker = MARKER.to_string();
    config.update.source_url = "https://example.invalid/agent.sh".to_string();
    // Long delay keeps the restart pending for the whole test.
    config.update.restart_delay_ms = 60_000;

    let restarter = Arc::new(CountingRestarter::default());
    let fetcher = StubFetcher::new(&source_with_version("2.0"));
    let controller = controller_with(Arc::new(config), fetcher.clone(), restarter.clone());

    let outcome = controller.apply_update().unwrap();
    assert_eq!(
        outcome,
        ApplyOutcome::Applied {
            version: "2.0".into()
        }
    );
    assert_eq!(controller.phase(), UpdatePhase::RestartScheduled);

    // A different candidate showing up mid-window must not be admitted.
    *fetcher.body.lock().unwrap() = source_with_version("3.0");
    let second = controller.apply_update();
    assert!(matches!(second, Err(WardenError::UpdateBusy)));
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(
        std::fs::read_to_string(&artifact).unwrap(),
        source_with_version("2.0")
    );
    assert_eq!(restarter.restarts.load(Ordering::SeqCst), 0);
}

#[test]
fn rescue_snapshot_embeds_installed_artifact() {
    let dir = tempdir().unwrap();
    let artifact = dir.path().join("agent.sh");
    std::fs::write(&artifact, source_with_version("1.0")).unwrap();
    let config = sample_config(dir.path());
    let controller = controller_with(
        config,
        StubFetcher::new(&source_with_version("2.0")),
        Arc::new(CountingRestarter::default()),
    );

    let path = controller.generate_rescue().unwrap();
    assert_eq!(path, dir.path().join(RESCUE_FILE_NAME));
    let script = std::fs::read_to_string(&path).unwrap();
    assert!(script.contains("reset-credential"));
}

#[test]
fn rescue_generation_fails_without_installed_artifact() {
    let dir = tempdir().unwrap();
    let config = sample_config(dir.path());
    let controller = controller_with(
        config,
        StubFetcher::new(&source_with_version("2.0")),
        Arc::new(CountingRestarter::default()),
    );

    let err = controller.generate_rescue().unwrap_err();
    assert!(matches!(err, WardenError::InvalidContent(_)));
}
