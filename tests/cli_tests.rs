// Command-line tests for the transcoder binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn transcoder() -> Command {
    let mut cmd = Command::cargo_bin("transcoder").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("TRANSCODEX_CONFIG")
        .env_remove("TRANSCODEX_LOG_LEVEL")
        .env_remove("TRANSCODEX_STALL_TIMEOUT_MS");
    cmd
}

#[test]
fn test_help_lists_commands() {
    transcoder()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("presets"))
        .stdout(predicate::str::contains("simulate"));
}

#[test]
fn test_presets_listing() {
    transcoder()
        .arg("presets")
        .assert()
        .success()
        .stdout(predicate::str::contains("vbr-1080p30"))
        .stdout(predicate::str::contains("keep-webm    webm"));
}

#[test]
fn test_presets_json() {
    let output = transcoder().args(["presets", "--json"]).output().unwrap();
    assert!(output.status.success());
    let presets: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(presets.as_array().map_or(false, |p| p.len() > 10));
}

#[test]
fn test_plan_downscales_to_target_height() {
    transcoder()
        .args(["plan", "--width", "1920", "--height", "1080", "--target-height", "720"])
        .args(["--input", "holiday.mov"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Geometry:      1280x720"))
        .stdout(predicate::str::contains("VBR 5.0 Mbps"))
        .stdout(predicate::str::contains("holiday_5.0Mbps.mp4"));
}

#[test]
fn test_plan_rejects_conflicting_rate_controls() {
    transcoder()
        .args(["plan", "--width", "640", "--height", "360", "--bitrate", "2000000", "--quantizer", "20"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_plan_reads_output_defaults_from_config() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("transcodex.toml");
    std::fs::write(
        &config,
        "[output.rate_control]\nmode = \"constant\"\nvalue = 2000000\n",
    )
    .unwrap();

    transcoder()
        .arg("--config")
        .arg(&config)
        .args(["plan", "--width", "1280", "--height", "720", "--silent"])
        .assert()
        .success()
        .stdout(predicate::str::contains("CBR 2.0 Mbps"))
        .stdout(predicate::str::contains("Audio:         none"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("bad.toml");
    std::fs::write(&config, "[pipeline]\nstall_timeout_ms = 0\n").unwrap();

    transcoder()
        .arg("--config")
        .arg(&config)
        .arg("presets")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn test_simulate_writes_output_file() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("simulated.mp4");

    transcoder()
        .args(["--quiet", "simulate", "--frames", "60", "--audio", "-o"])
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("State:         done"))
        .stdout(predicate::str::contains("Video chunks:  60"));

    let bytes = std::fs::read(&output).unwrap();
    assert!(bytes.starts_with(b"TXSIM1"));
    // No staging files left behind
    let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftovers, 1);
}

#[test]
fn test_simulate_refuses_existing_output() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("exists.mp4");
    std::fs::write(&output, b"keep me").unwrap();

    transcoder()
        .args(["--quiet", "simulate", "--frames", "10", "-o"])
        .arg(&output)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--overwrite"));
    assert_eq!(std::fs::read(&output).unwrap(), b"keep me");
}

#[test]
fn test_simulate_json_report() {
    let output = transcoder()
        .args(["--quiet", "simulate", "--frames", "30", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["final_state"], "done");
    assert_eq!(report["counters"]["chunks_muxed"][0], 30);
    assert_eq!(report["audio_enabled"], false);
}
