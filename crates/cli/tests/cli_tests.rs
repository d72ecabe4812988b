use anyhow::Result;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn genoload(args: &[&str]) -> Result<Output> {
    Ok(Command::new(env!("CARGO_BIN_EXE_genoload")).args(args).output()?)
}

fn write_config(dir: &TempDir, body: &str) -> Result<String> {
    let path = dir.path().join("run.yaml");
    std::fs::write(&path, body)?;
    Ok(path.to_string_lossy().to_string())
}

fn sampler_config(output_dir: &Path) -> String {
    format!(
        r#"
ops: [train, validate]
output_dir: {}
lr: 0.01
batch_size: 4
sampler:
  kind: synthetic
  sequence_length: 16
  n_targets: 3
loader:
  batch_size: 4
  num_workers: 2
train_model:
  max_steps: 6
  report_stats_every_n_steps: 3
  n_validation_samples: 8
"#,
        output_dir.display()
    )
}

#[test]
fn validate_accepts_good_config_and_prints_json() -> Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(&dir, &sampler_config(dir.path()))?;

    let output = genoload(&["validate", &config])?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("YAML parsing: SUCCESS"));

    let output = genoload(&["validate", &config, "--to-json"])?;
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(json["loader"]["num_workers"], 2);
    Ok(())
}

#[test]
fn validate_rejects_train_without_lr() -> Result<()> {
    let dir = TempDir::new()?;
    let body = sampler_config(dir.path()).replace("lr: 0.01\n", "");
    let config = write_config(&dir, &body)?;
    let output = genoload(&["validate", &config])?;
    assert!(!output.status.success());
    Ok(())
}

#[test]
fn train_runs_with_sampler_source_and_lr_override() -> Result<()> {
    let dir = TempDir::new()?;
    let body = sampler_config(dir.path()).replace("lr: 0.01\n", "");
    let config = write_config(&dir, &body)?;

    let output = genoload(&["train", &config, "--lr", "0.05"])?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("=== Train ==="));
    assert!(stdout.contains("=== Validate ==="));
    Ok(())
}

#[test]
fn train_distributed_checks_rank() -> Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(&dir, &sampler_config(dir.path()))?;
    let output = genoload(&["train-distributed", &config, "--rank", "2", "--world-size", "2"])?;
    assert!(!output.status.success());

    let output = genoload(&["train-distributed", &config, "--rank", "1", "--world-size", "2", "--gpu", "0"])?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    Ok(())
}

#[test]
fn write_h5_argument_errors() -> Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(&dir, &sampler_config(dir.path()))?;

    let bad_mode = genoload(&["write-h5", &config, "training", "2", "1", "true"])?;
    assert!(!bad_mode.status.success());

    let bad_flag = genoload(&["write-h5", &config, "train", "2", "1", "maybe"])?;
    assert!(!bad_flag.status.success());
    Ok(())
}

#[test]
fn write_h5_creates_named_file() -> Result<()> {
    if std::env::var("SKIP_HDF5_TESTS").is_ok() {
        return Ok(());
    }
    let dir = TempDir::new()?;
    let config = write_config(&dir, &sampler_config(dir.path()))?;

    let output = genoload(&["write-h5", &config, "validate", "3", "42", "true"])?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(dir.path().join("validate_seed=42_N=12.h5").exists());
    Ok(())
}
