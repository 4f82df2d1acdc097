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
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .env_remove("GRADEBOOKD_WORKSPACE")
        .env_remove("GRADEBOOKD_CACHE_TTL_MS")
        .env_remove("GRADEBOOKD_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn row<'a>(view: &'a serde_json::Value, student_id: &str) -> &'a serde_json::Value {
    view["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .find(|r| r["studentId"] == json!(student_id))
        .expect("row for student")
}

fn cell<'a>(view: &'a serde_json::Value, student_id: &str, slot: u64) -> &'a serde_json::Value {
    row(view, student_id)["cells"]
        .as_array()
        .expect("cells")
        .iter()
        .find(|c| c["slot"] == json!(slot))
        .expect("cell for slot")
}

fn open_params(stage: u8) -> serde_json::Value {
    json!({
        "subjectId": "mat",
        "courseId": "3B",
        "stage": stage,
        "academicYear": 2026,
        "enrollmentId": "mc-3B-mat"
    })
}

#[test]
fn edits_save_as_creates_then_updates() {
    let workspace = temp_dir("gradebook-edit-save");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "roster.import",
        json!({ "courseId": "3B", "students": ["Ana Paz", "Beto Gil", "Carla Ruiz"] }),
    );
    let ids: Vec<String> = imported["studentIds"]
        .as_array()
        .expect("studentIds")
        .iter()
        .map(|v| v.as_str().expect("id").to_string())
        .collect();
    let (ana, beto) = (ids[0].as_str(), ids[1].as_str());

    let view = request_ok(&mut stdin, &mut reader, "3", "grades.open", open_params(1));
    assert_eq!(view["rows"].as_array().map(|r| r.len()), Some(3));
    assert_eq!(view["emptyColumns"], json!([1, 2, 3, 4]));
    assert_eq!(row(&view, ana)["average"], json!("-"));
    assert_eq!(cell(&view, ana, 1)["locked"], json!(false));

    let set = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.setCell",
        json!({ "studentId": ana, "slot": 1, "value": "8" }),
    );
    assert_eq!(set["accepted"], json!(true));
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.setCell",
        json!({ "studentId": ana, "slot": 2, "value": 6 }),
    );
    let rejected = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.setCell",
        json!({ "studentId": ana, "slot": 2, "value": "11" }),
    );
    assert_eq!(rejected["accepted"], json!(false));
    assert_eq!(rejected["value"], json!("6"));
    assert_eq!(rejected["average"], json!("7.00"));

    // A cleared cell on another row produces no batch.
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grades.setCell",
        json!({ "studentId": beto, "slot": 3, "value": "" }),
    );

    let payloads = request_ok(&mut stdin, &mut reader, "8", "grades.payloads", json!({}));
    let batches = payloads["batches"].as_array().expect("batches");
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0]["studentId"], json!(ana));
    let first = &batches[0]["payloads"][0];
    assert_eq!(first["alumnoId"], json!(ana));
    assert_eq!(first["materiaId"], json!("mat"));
    assert_eq!(first["materiaCursoId"], json!("mc-3B-mat"));
    assert_eq!(first["nota"], json!(8.0));
    assert_eq!(first["etapa"], json!(1));
    assert_eq!(first["numeroNota"], json!(1));
    let fecha = first["fecha"].as_str().expect("fecha");
    assert_eq!(fecha.len(), 10);
    assert_eq!(&fecha[4..5], "-");
    assert!(first.get("califId").is_none());

    let saved = request_ok(&mut stdin, &mut reader, "9", "grades.saveAll", json!({}));
    assert_eq!(saved["saved"], json!(1));
    assert_eq!(saved["failed"], json!(0));
    let view = &saved["view"];
    assert_eq!(view["emptyColumns"], json!([3, 4]));
    assert_eq!(cell(view, ana, 1)["value"], json!("8"));
    assert_eq!(cell(view, ana, 1)["edited"], json!(false));
    assert_eq!(row(view, ana)["savedAverage"], json!("7.00"));
    // The cleared cell on beto's row was not a write; it survives the reload.
    assert_eq!(row(view, beto)["pending"], json!(true));
    let record_id = cell(view, ana, 1)["recordId"]
        .as_str()
        .expect("recordId")
        .to_string();

    // Column 1 now has a persisted value: locked until edit mode + unlock.
    let locked = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "grades.setCell",
        json!({ "studentId": ana, "slot": 1, "value": "9" }),
    );
    assert_eq!(locked["accepted"], json!(false));
    assert_eq!(locked["locked"], json!(true));

    request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grades.setEditMode",
        json!({ "enabled": true }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "grades.unlockCell",
        json!({ "studentId": ana, "slot": 1 }),
    );
    let edited = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "grades.setCell",
        json!({ "studentId": ana, "slot": 1, "value": "9" }),
    );
    assert_eq!(edited["accepted"], json!(true));
    assert_eq!(edited["average"], json!("7.50"));

    let payloads = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "grades.payloads",
        json!({ "studentId": ana }),
    );
    let update = &payloads["batches"][0]["payloads"][0];
    assert_eq!(update["califId"], json!(record_id));
    assert_eq!(update["nota"], json!(9.0));
    assert!(update.get("numeroNota").is_none());

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "grades.save",
        json!({ "studentId": ana }),
    );
    assert_eq!(saved["saved"], json!(1));
    assert_eq!(cell(&saved["view"], ana, 1)["value"], json!("9"));
    assert_eq!(cell(&saved["view"], ana, 1)["recordId"], json!(record_id));

    // Second stage grades feed the general average.
    request_ok(&mut stdin, &mut reader, "16", "grades.open", open_params(2));
    request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "grades.setCell",
        json!({ "studentId": ana, "slot": 1, "value": "10" }),
    );
    request_ok(&mut stdin, &mut reader, "18", "grades.saveAll", json!({}));
    let pg = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "grades.generalAverages",
        json!({}),
    );
    let students = pg["students"].as_array().expect("students");
    let ana_pg = students
        .iter()
        .find(|s| s["studentId"] == json!(ana))
        .expect("ana");
    // (9 + 6 + 10) / 3
    assert_eq!(ana_pg["generalAverage"], json!("8.33"));
    let beto_pg = students
        .iter()
        .find(|s| s["studentId"] == json!(beto))
        .expect("beto");
    assert_eq!(beto_pg["generalAverage"], json!("-"));
}

#[test]
fn partial_save_failure_keeps_failed_rows_pending() {
    let workspace = temp_dir("gradebook-partial-save");
    let (_a_child, mut a_in, mut a_out) = spawn_sidecar();
    let (_b_child, mut b_in, mut b_out) = spawn_sidecar();

    for (stdin, reader) in [(&mut a_in, &mut a_out), (&mut b_in, &mut b_out)] {
        request_ok(
            stdin,
            reader,
            "ws",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
    }
    let imported = request_ok(
        &mut a_in,
        &mut a_out,
        "1",
        "roster.import",
        json!({ "courseId": "3B", "students": ["Ana Paz", "Beto Gil"] }),
    );
    let ana = imported["studentIds"][0].as_str().expect("ana").to_string();
    let beto = imported["studentIds"][1].as_str().expect("beto").to_string();

    request_ok(&mut a_in, &mut a_out, "2", "grades.open", open_params(1));
    request_ok(&mut b_in, &mut b_out, "2", "grades.open", open_params(1));

    // Sidecar B edits the same empty slot sidecar A is about to save.
    request_ok(
        &mut b_in,
        &mut b_out,
        "3",
        "grades.setCell",
        json!({ "studentId": ana, "slot": 1, "value": "7" }),
    );
    request_ok(
        &mut b_in,
        &mut b_out,
        "4",
        "grades.setCell",
        json!({ "studentId": beto, "slot": 1, "value": "5" }),
    );

    request_ok(
        &mut a_in,
        &mut a_out,
        "3",
        "grades.setCell",
        json!({ "studentId": ana, "slot": 1, "value": "8" }),
    );
    let a_saved = request_ok(&mut a_in, &mut a_out, "4", "grades.saveAll", json!({}));
    assert_eq!(a_saved["saved"], json!(1));

    let b_saved = request_ok(&mut b_in, &mut b_out, "5", "grades.saveAll", json!({}));
    assert_eq!(b_saved["saved"], json!(1));
    assert_eq!(b_saved["failed"], json!(1));
    let results = b_saved["results"].as_array().expect("results");
    let ana_result = results
        .iter()
        .find(|r| r["studentId"] == json!(ana))
        .expect("ana result");
    assert_eq!(ana_result["ok"], json!(false));
    assert!(ana_result["error"]
        .as_str()
        .unwrap_or("")
        .contains("already graded"));

    // The reload brought in A's record; B's edit stays pending and is now an update.
    let view = &b_saved["view"];
    let ana_row = view["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .find(|r| r["studentId"] == json!(ana))
        .expect("ana row");
    assert_eq!(ana_row["pending"], json!(true));
    assert_eq!(ana_row["cells"][0]["value"], json!("7"));
    assert_eq!(ana_row["savedAverage"], json!("8.00"));

    let payloads = request_ok(
        &mut b_in,
        &mut b_out,
        "6",
        "grades.payloads",
        json!({ "studentId": ana }),
    );
    assert!(payloads["batches"][0]["payloads"][0]["califId"].is_string());
}
