use quickproc::{cli::main_with_args, RunReport, RunStatus};
use tempfile::tempdir;

mod common;
use common::make_layout;

#[test]
fn missing_input_fails_before_any_stage() {
    let tmp_dir = tempdir().unwrap();
    let layout = make_layout(tmp_dir.path());
    let missing = tmp_dir.path().join("obs").join("nothing_here.ms");

    #[rustfmt::skip]
    let args = vec![
        "quickproc",
        missing.to_str().unwrap(),
        layout.gain_table.to_str().unwrap(),
        "--runtime", "/nonexistent/stubman",
        "--target-radec", "10", "10",
        "--no-draw-progress",
    ];
    assert_eq!(main_with_args(&args), 1);

    let report = RunReport::read(&tmp_dir.path().join("obs").join("proc_run_report.json")).unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed_stage.as_deref(), Some("preflight"));
    assert!(report.error.unwrap().contains("raw measurement set not found"));
    assert!(report.artifacts.is_empty());
}

#[test]
fn missing_runtime_is_a_preflight_failure() {
    let tmp_dir = tempdir().unwrap();
    let layout = make_layout(tmp_dir.path());

    #[rustfmt::skip]
    let args = vec![
        "quickproc",
        layout.raw_ms.to_str().unwrap(),
        layout.gain_table.to_str().unwrap(),
        "sun",
        "--runtime", "/nonexistent/stubman",
        "--no-draw-progress",
    ];
    assert_eq!(main_with_args(&args), 1);

    let report_path = tmp_dir.path().join("obs").join("sun_run_report.json");
    let report = RunReport::read(&report_path).unwrap();
    assert_eq!(report.failed_stage.as_deref(), Some("preflight"));
    assert_eq!(report.container_runtime, "/nonexistent/stubman");
    assert!(tmp_dir.path().join("obs").join("sun_pipeline.log").exists());
}

#[test]
fn dry_run_writes_nothing() {
    let tmp_dir = tempdir().unwrap();
    let layout = make_layout(tmp_dir.path());
    let workdir = tmp_dir.path().join("products");

    #[rustfmt::skip]
    let args = vec![
        "quickproc",
        layout.raw_ms.to_str().unwrap(),
        layout.gain_table.to_str().unwrap(),
        "--workdir", workdir.to_str().unwrap(),
        "--dry-run",
    ];
    assert_eq!(main_with_args(&args), 0);
    assert!(!workdir.exists());
}

#[cfg(unix)]
#[test]
fn failing_bandpass_stops_the_run() {
    let tmp_dir = tempdir().unwrap();
    let layout = make_layout(tmp_dir.path());
    let runtime = common::failing_runtime(tmp_dir.path(), "SEVERE: applycal: table not found");
    let workdir = tmp_dir.path().join("products");

    #[rustfmt::skip]
    let args = vec![
        "quickproc",
        layout.raw_ms.to_str().unwrap(),
        layout.gain_table.to_str().unwrap(),
        "--workdir", workdir.to_str().unwrap(),
        "--runtime", runtime.to_str().unwrap(),
        "--rounds", "1",
        "--no-draw-progress",
    ];
    assert_eq!(main_with_args(&args), 1);

    let report = RunReport::read(&workdir.join("proc_run_report.json")).unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed_stage.as_deref(), Some("bandpass"));
    let stages: Vec<_> = report.stages.iter().map(|s| s.stage_name.as_str()).collect();
    assert_eq!(stages, ["bandpass"]);
    assert!(report.error.unwrap().contains("table not found"));
    // only the inputs were registered
    assert_eq!(report.artifacts.len(), 2);
    // the transient CASA script is gone
    let leftovers: Vec<_> = std::fs::read_dir(&workdir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".py"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}
