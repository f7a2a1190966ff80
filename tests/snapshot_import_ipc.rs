use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gymd");
    let mut child = Command::new(exe)
        .env_remove("GYMD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gymd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );
    value.get("result").cloned().unwrap_or_default()
}

fn error_code(resp: &serde_json::Value) -> Option<&str> {
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

fn select(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) {
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
}

fn count(result: &serde_json::Value, key: &str) -> u64 {
    result
        .get("counts")
        .and_then(|c| c.get(key))
        .and_then(|v| v.as_u64())
        .unwrap_or(u64::MAX)
}

#[test]
fn versioned_backup_imports_and_reports_skips() {
    let workspace = temp_dir("gym-import-versioned");
    let backup = workspace.join("in.json");
    std::fs::write(
        &backup,
        json!({
            "metadata": { "version": "4.0", "gymName": "Old Gym" },
            "data": {
                "members": [
                    { "id": "m1", "name": "Sara", "membershipStatus": "ACTIVE", "sessionsRemaining": "7.9" },
                    { "id": "m2", "name": "   " },
                    { "name": "No Id", "phone": "0555" }
                ],
                "payments": [
                    { "id": "p1", "memberId": "m1", "amount": "1500" },
                    { "id": "p2", "memberId": "m1" }
                ],
                "activities": [
                    { "id": "a1", "memberId": "m1", "activityType": "check-in" },
                    { "id": "a2" }
                ]
            },
            "settings": {
                "pricing": { "monthly": 1500 },
                "user": "{\"theme\":\"dark\"}",
                "notifications": null
            }
        })
        .to_string(),
    )
    .expect("write backup");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select(&mut stdin, &mut reader, &workspace);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "backup.importSnapshot",
        json!({ "inPath": backup.to_string_lossy() }),
    );
    assert_eq!(result.get("format").and_then(|v| v.as_str()), Some("versioned"));
    assert_eq!(count(&result, "members"), 2);
    assert_eq!(count(&result, "payments"), 1);
    assert_eq!(count(&result, "activities"), 1);
    assert_eq!(result.get("activitiesSkipped").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(result.get("errorsCount").and_then(|v| v.as_u64()), Some(2));
    let errors = result.get("errors").and_then(|v| v.as_array()).expect("errors");
    assert_eq!(errors[0].get("kind").and_then(|v| v.as_str()), Some("member"));
    assert_eq!(errors[0].get("index").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(errors[1].get("kind").and_then(|v| v.as_str()), Some("payment"));
    assert_eq!(
        result.get("settingsRestored"),
        Some(&json!(["pricing", "user"]))
    );
    assert_eq!(
        result.get("changed"),
        Some(&json!(["members", "payments", "activities", "settings"]))
    );

    let members = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "records.list",
        json!({ "kind": "members" }),
    );
    let rows = members.get("records").and_then(|v| v.as_array()).expect("rows");
    let sara = rows
        .iter()
        .find(|m| m.get("id").and_then(|v| v.as_str()) == Some("m1"))
        .expect("m1");
    assert_eq!(sara.get("membershipStatus").and_then(|v| v.as_str()), Some("pending"));
    assert_eq!(sara.get("sessionsRemaining").and_then(|v| v.as_u64()), Some(7));
    let synthesized = rows
        .iter()
        .find(|m| m.get("name").and_then(|v| v.as_str()) == Some("No Id"))
        .expect("synthesized member");
    let id = synthesized.get("id").and_then(|v| v.as_str()).expect("id");
    assert!(id.starts_with("imported_member_"), "{}", id);
    assert_eq!(synthesized.get("phoneNumber").and_then(|v| v.as_str()), Some("0555"));

    let pricing = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "settings.get",
        json!({ "key": "pricing" }),
    );
    assert_eq!(pricing.get("value"), Some(&json!({ "monthly": 1500 })));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn flat_array_backup_is_classified_per_item() {
    let workspace = temp_dir("gym-import-flat");
    let backup = workspace.join("flat.json");
    std::fs::write(
        &backup,
        json!([
            { "name": "Omar" },
            { "amount": 800, "memberId": "x" },
            { "activityType": "payment", "memberId": "x" },
            { "other": 1 }
        ])
        .to_string(),
    )
    .expect("write backup");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select(&mut stdin, &mut reader, &workspace);
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "backup.importSnapshot",
        json!({ "inPath": backup.to_string_lossy() }),
    );
    assert_eq!(result.get("format").and_then(|v| v.as_str()), Some("flat-array"));
    assert_eq!(count(&result, "members"), 1);
    assert_eq!(count(&result, "payments"), 1);
    assert_eq!(count(&result, "activities"), 1);
    assert_eq!(result.get("errorsCount").and_then(|v| v.as_u64()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn preflight_rejections_carry_stable_codes() {
    let workspace = temp_dir("gym-import-preflight");
    let empty = workspace.join("empty.json");
    let broken = workspace.join("broken.json");
    let nothing = workspace.join("nothing.json");
    std::fs::write(&empty, "  \n ").expect("write empty");
    std::fs::write(&broken, "{\"data\": [").expect("write broken");
    std::fs::write(&nothing, json!({ "data": { "members": [] }, "members": "x" }).to_string())
        .expect("write nothing");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select(&mut stdin, &mut reader, &workspace);

    let cases = [
        (&empty, "empty_file"),
        (&broken, "invalid_json"),
        (&nothing, "no_data"),
        (&workspace.join("missing.json"), "io_failed"),
    ];
    for (i, (path, code)) in cases.iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("p{}", i),
            "backup.importSnapshot",
            json!({ "inPath": path.to_string_lossy() }),
        );
        assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
        assert_eq!(error_code(&resp), Some(*code), "{}", resp);
    }

    let health = request_ok(&mut stdin, &mut reader, "h", "health", json!({}));
    assert_eq!(health.get("revision").and_then(|v| v.as_u64()), Some(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn oversized_backup_is_rejected_before_reading() {
    let workspace = temp_dir("gym-import-oversized");
    let backup = workspace.join("big.json");
    let members: Vec<serde_json::Value> = (0..20)
        .map(|i| json!({ "id": format!("m{}", i), "name": "Padding Member" }))
        .collect();
    std::fs::write(&backup, json!({ "members": members }).to_string()).expect("write backup");

    let exe = env!("CARGO_BIN_EXE_gymd");
    let mut child = Command::new(exe)
        .env("GYMD_WORKSPACE", &workspace)
        .env("GYMD_MAX_IMPORT_BYTES", "256")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gymd");
    let mut stdin = child.stdin.take().expect("child stdin");
    let mut reader = BufReader::new(child.stdout.take().expect("child stdout"));

    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "backup.importSnapshot",
        json!({ "inPath": backup.to_string_lossy() }),
    );
    assert_eq!(error_code(&resp), Some("file_too_large"), "{}", resp);

    let members = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "records.list",
        json!({ "kind": "members" }),
    );
    assert_eq!(members.get("count").and_then(|v| v.as_u64()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
