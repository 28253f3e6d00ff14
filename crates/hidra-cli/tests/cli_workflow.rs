use hidra_core::domain::MotorLog;
use hidra_core::geometry::{CalibrationCorrection, GeometryModel, InstrumentGeometryEngine};
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

const ROWS: usize = 4;
const COLUMNS: usize = 400;
const ARM_ANGLE: f64 = 60.0;
const PEAK_CENTER: f64 = 60.3;
const PEAK_SIGMA: f64 = 0.2;
const PEAK_HEIGHT: f64 = 300.0;
const BACKGROUND: f64 = 10.0;
const WAVELENGTH: f64 = 1.5406;

fn geometry() -> GeometryModel {
    GeometryModel::new(ROWS, COLUMNS, 0.0002, 0.0005, 0.5, false)
}

fn peak_counts() -> Vec<f64> {
    InstrumentGeometryEngine::new(geometry())
        .build_for_motor_log(
            &MotorLog::new(ARM_ANGLE, None),
            &CalibrationCorrection::identity(),
        )
        .expect("geometry")
        .scattering_angles()
        .iter()
        .map(|angle| {
            let offset = angle - PEAK_CENTER;
            BACKGROUND + PEAK_HEIGHT * (-offset * offset / (2.0 * PEAK_SIGMA * PEAK_SIGMA)).exp()
        })
        .collect()
}

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent directory should be created");
    }
    fs::write(path, content).expect("file should be written");
}

fn write_json(path: &Path, value: &Value) {
    write_file(
        path,
        &serde_json::to_string_pretty(value).expect("json should render"),
    );
}

fn read_json(path: &Path) -> Value {
    let source = fs::read_to_string(path).expect("output should exist");
    serde_json::from_str(&source).expect("output should be valid JSON")
}

struct Inputs {
    config: std::path::PathBuf,
    data: std::path::PathBuf,
    peaks: std::path::PathBuf,
}

fn write_inputs(root: &Path, sub_run_ids: [u32; 2]) -> Inputs {
    let pixel_count = ROWS * COLUMNS;
    let inputs = Inputs {
        config: root.join("reduction.json"),
        data: root.join("sub_runs.json"),
        peaks: root.join("peaks.json"),
    };

    write_json(
        &inputs.config,
        &json!({
            "geometry": {
                "rows": ROWS,
                "columns": COLUMNS,
                "pixelSizeX": 0.0002,
                "pixelSizeY": 0.0005,
                "nominalDistance": 0.5
            },
            "bins": { "min": 56.0, "max": 64.0, "count": 160 },
            "binAngle": "center",
            "wavelength": WAVELENGTH
        }),
    );
    write_json(
        &inputs.data,
        &json!({
            "subRuns": [
                { "subRun": sub_run_ids[0], "twoTheta": ARM_ANGLE, "counts": peak_counts() },
                {
                    "subRun": sub_run_ids[1],
                    "twoTheta": ARM_ANGLE,
                    "counts": vec![BACKGROUND; pixel_count]
                }
            ],
            "vanadium": vec![1.0; pixel_count]
        }),
    );
    write_json(
        &inputs.peaks,
        &json!({
            "peaks": [{
                "tag": "Fe 211",
                "center": 60.2,
                "left": 59.3,
                "right": 61.3,
                "peakShape": "Gaussian",
                "backgroundShape": "Linear",
                "referenceDSpacing": 1.53
            }]
        }),
    );
    inputs
}

fn run_cli(args: &[&str]) -> Output {
    let binary_path = env!("CARGO_BIN_EXE_hidra-rs");
    Command::new(binary_path)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("binary should launch")
}

fn path_arg(path: &Path) -> &str {
    path.to_str().expect("temp paths are UTF-8")
}

#[test]
fn run_command_reports_every_sub_run_and_nulls_failed_fits() {
    let temp = TempDir::new().expect("tempdir should be created");
    let inputs = write_inputs(temp.path(), [1, 2]);
    let report_path = temp.path().join("out/report.json");
    let reduced_path = temp.path().join("out/reduced.json");

    let output = run_cli(&[
        "run",
        "--config",
        path_arg(&inputs.config),
        "--data",
        path_arg(&inputs.data),
        "--peaks",
        path_arg(&inputs.peaks),
        "--reduced-output",
        path_arg(&reduced_path),
        "--output",
        path_arg(&report_path),
    ]);
    assert!(
        output.status.success(),
        "run should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("peak fit failed"),
        "failed sub-run should be logged as a warning, stderr: {stderr}"
    );

    let reduced = read_json(&reduced_path);
    assert_eq!(reduced["subRuns"].as_array().expect("sub-runs").len(), 2);
    assert_eq!(
        reduced["subRuns"][0]["pattern"]["angles"]
            .as_array()
            .expect("angles")
            .len(),
        160
    );

    let report = read_json(&report_path);
    let peak = &report["peaks"][0];
    assert_eq!(peak["tag"], "Fe 211");
    assert_eq!(peak["converged"], 1);
    assert_eq!(peak["effectiveParameterNames"][2], "FWHM");
    assert_eq!(
        peak["nativeParameterNames"],
        json!(["Height", "PeakCentre", "Sigma", "A0", "A1"])
    );

    let rows = peak["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 2);

    let fitted = &rows[0];
    assert_eq!(fitted["subRun"], 1);
    assert_eq!(fitted["status"], "Converged");
    assert!(fitted["failure"].is_null());
    let center = fitted["effective"]["values"][0].as_f64().expect("center");
    assert!((center - PEAK_CENTER).abs() < 0.01, "center {center}");

    let d_spacing = fitted["dSpacing"]["value"].as_f64().expect("d-spacing");
    let expected_d = WAVELENGTH / (2.0 * (0.5 * center.to_radians()).sin());
    assert!((d_spacing - expected_d).abs() < 1.0e-9);
    let strain = fitted["strain"]["value"].as_f64().expect("strain");
    assert!((strain - (d_spacing - 1.53) / 1.53).abs() < 1.0e-9);

    let failed = &rows[1];
    assert_eq!(failed["subRun"], 2);
    assert_eq!(failed["status"], "Failed");
    assert_eq!(failed["failure"], "NoPeakSignal");
    for field in ["chiSquared", "native", "effective", "dSpacing", "strain"] {
        assert!(failed[field].is_null(), "{field} should be null");
    }
}

#[test]
fn reduce_then_fit_matches_single_pass_run() {
    let temp = TempDir::new().expect("tempdir should be created");
    let inputs = write_inputs(temp.path(), [3, 7]);
    let reduced_path = temp.path().join("reduced.json");
    let fit_path = temp.path().join("fit.json");
    let run_path = temp.path().join("run.json");

    let reduce = run_cli(&[
        "reduce",
        "--config",
        path_arg(&inputs.config),
        "--data",
        path_arg(&inputs.data),
        "--output",
        path_arg(&reduced_path),
    ]);
    assert!(
        reduce.status.success(),
        "reduce should succeed, stderr: {}",
        String::from_utf8_lossy(&reduce.stderr)
    );
    assert_eq!(read_json(&reduced_path)["wavelength"], WAVELENGTH);

    let fit = run_cli(&[
        "fit",
        "--input",
        path_arg(&reduced_path),
        "--peaks",
        path_arg(&inputs.peaks),
        "--output",
        path_arg(&fit_path),
    ]);
    assert!(
        fit.status.success(),
        "fit should succeed, stderr: {}",
        String::from_utf8_lossy(&fit.stderr)
    );

    let run = run_cli(&[
        "run",
        "--config",
        path_arg(&inputs.config),
        "--data",
        path_arg(&inputs.data),
        "--peaks",
        path_arg(&inputs.peaks),
        "--output",
        path_arg(&run_path),
    ]);
    assert!(run.status.success());

    let staged = read_json(&fit_path);
    let single_pass = read_json(&run_path);
    let staged_rows = staged["peaks"][0]["rows"].as_array().expect("staged rows");
    let single_rows = single_pass["peaks"][0]["rows"].as_array().expect("run rows");
    assert_eq!(staged_rows.len(), 2);
    assert_eq!(staged_rows[0]["subRun"], 3);
    assert_eq!(staged_rows[1]["subRun"], 7);

    for (staged_row, single_row) in staged_rows.iter().zip(single_rows) {
        assert_eq!(staged_row["subRun"], single_row["subRun"]);
        assert_eq!(staged_row["status"], single_row["status"]);
        assert_eq!(staged_row["failure"], single_row["failure"]);
    }
    let staged_center = staged_rows[0]["effective"]["values"][0]
        .as_f64()
        .expect("staged center");
    let single_center = single_rows[0]["effective"]["values"][0]
        .as_f64()
        .expect("run center");
    assert!((staged_center - single_center).abs() < 1.0e-9);
}

#[test]
fn descending_sub_runs_exit_with_invalid_range_code() {
    let temp = TempDir::new().expect("tempdir should be created");
    let inputs = write_inputs(temp.path(), [5, 4]);
    let output = run_cli(&[
        "reduce",
        "--config",
        path_arg(&inputs.config),
        "--data",
        path_arg(&inputs.data),
        "--output",
        path_arg(&temp.path().join("reduced.json")),
    ]);

    assert_eq!(
        output.status.code(),
        Some(5),
        "descending sub-runs should be rejected, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("ERROR: [PIPELINE.SUB_RUNS]"),
        "stderr should carry the diagnostic line, stderr: {stderr}"
    );
    assert!(!temp.path().join("reduced.json").exists());
}

#[test]
fn counts_length_mismatch_exits_with_dimension_code() {
    let temp = TempDir::new().expect("tempdir should be created");
    let inputs = write_inputs(temp.path(), [1, 2]);
    write_json(
        &inputs.data,
        &json!({ "subRuns": [{ "subRun": 1, "twoTheta": ARM_ANGLE, "counts": [1.0, 2.0] }] }),
    );

    let output = run_cli(&[
        "reduce",
        "--config",
        path_arg(&inputs.config),
        "--data",
        path_arg(&inputs.data),
        "--output",
        path_arg(&temp.path().join("reduced.json")),
    ]);
    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("ERROR: [REDUCE.PIXEL_COUNT]"));
}

#[test]
fn missing_input_file_exits_with_io_code() {
    let temp = TempDir::new().expect("tempdir should be created");
    let inputs = write_inputs(temp.path(), [1, 2]);
    let output = run_cli(&[
        "fit",
        "--input",
        path_arg(&temp.path().join("absent.json")),
        "--peaks",
        path_arg(&inputs.peaks),
        "--output",
        path_arg(&temp.path().join("fit.json")),
    ]);

    assert_eq!(output.status.code(), Some(6));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ERROR: [IO.CLI]"), "stderr: {stderr}");
    assert!(stderr.contains("reduced patterns"), "stderr: {stderr}");
}

#[test]
fn unknown_subcommand_exits_with_usage_code() {
    let output = run_cli(&["calibrate"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("ERROR: [INPUT.CLI_USAGE]"));
}
