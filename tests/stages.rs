//! Demo Stage Program Tests
//!
//! Runs the shipped stage scripts through the command invoker. Skipped when
//! `jq` is not installed.

use serde_json::json;
use std::path::Path;

use trainflow::adapters::CommandInvoker;
use trainflow::StageInvoker;

fn jq_available() -> bool {
    std::process::Command::new("jq")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn stage_script(name: &str) -> CommandInvoker {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("stages").join(name);
    CommandInvoker::new(path.display().to_string())
}

#[tokio::test]
async fn test_dataset_stage_forwards_run_input() {
    if !jq_available() {
        eprintln!("jq not installed, skipping");
        return;
    }

    let output = stage_script("dataset.sh")
        .invoke(&json!({
            "bucket": "card-data",
            "prefix": "credit",
            "key": "card.xls",
            "job_prefix": "card"
        }))
        .await
        .unwrap();

    assert_eq!(output["bucket"], "card-data");
    assert_eq!(output["prefix"], "credit");
    assert_eq!(output["key"], "card.xls");
    assert_eq!(output["stage"], "dataset");
    assert!(output["job_name"].as_str().unwrap().starts_with("card-"));
    assert_eq!(output["endpoint_name"], output["job_name"]);
}

#[tokio::test]
async fn test_dataset_stage_defaults_bucket_and_prefix() {
    if !jq_available() {
        eprintln!("jq not installed, skipping");
        return;
    }

    let output = stage_script("dataset.sh")
        .invoke(&json!({"key": "card.xls"}))
        .await
        .unwrap();

    assert_eq!(output["bucket"], "trainflow-demo");
    assert_eq!(output["prefix"], "xgboost_credit_risk");
    assert_eq!(output["key"], "card.xls");
    assert!(output["job_name"].as_str().unwrap().starts_with("trainflow-"));
}
