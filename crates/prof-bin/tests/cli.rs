//! The binary end to end: a measurement document in, a database out.

use std::process::Command;

fn measurement() -> serde_json::Value {
    serde_json::json!({
        "attributes": {"name": "cli-demo", "job": 1},
        "metrics": [
            {"name": "CYCLES", "scopes": ["point", "function", "execution"]}
        ],
        "modules": ["/bin/app"],
        "threads": [{
            "idtuple": [{"kind": 2, "physical": 0}, {"kind": 3, "physical": 0}],
            "samples": [
                {"stack": [[0, 256]], "values": {"CYCLES": 1.0}},
                {"stack": [[0, 256], [0, 320]], "values": {"CYCLES": 2.0}}
            ]
        }]
    })
}

#[test]
fn emits_a_database() {
    let dir = tempfile::tempdir().unwrap();
    let meas = dir.path().join("app.prof.json");
    std::fs::write(&meas, measurement().to_string()).unwrap();
    let out = dir.path().join("db");

    let status = Command::new(env!("CARGO_BIN_EXE_profusion"))
        .arg(&meas)
        .arg("-o")
        .arg(&out)
        .arg("-j")
        .arg("2")
        .current_dir(dir.path())
        .status()
        .unwrap();
    assert!(status.success());

    assert!(out.join("meta.db").is_file());
    assert!(out.join("profile.db").is_file());
    assert!(out.join("metrics/default.yaml").is_file());
}

#[test]
fn unreadable_inputs_are_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_profusion"))
        .arg(dir.path().join("missing.prof.json"))
        .current_dir(dir.path())
        .status()
        .unwrap();
    assert!(!status.success());
}
