use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use serde_json::Value;

const CONTRIBUTION_QUESTION: &str = "Kolika je stopa doprinosa za mirovinsko osiguranje u Hrvatskoj?";

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_ck<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ck"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ck binary: {err}"))
}

fn stdout_of(output: &Output) -> String {
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!("ck command failed (status={}):\nstdout:\n{}\nstderr:\n{}", output.status, stdout, stderr);
    }
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let stdout = stdout_of(&run_ck(args));
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse JSON file {}: {err}", path.display()))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let schema_json = read_json_file(&schema_path);
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}\ninstance: {instance}", schema_file, errors.join("\n"));
    }
}

fn corpus_fixture() -> PathBuf {
    repo_root().join("contracts/v1/fixtures/corpus-hr.json")
}

fn events_of(response: &Value) -> Vec<Value> {
    response
        .get("events")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_else(|| panic!("missing events in payload: {response}"))
}

#[test]
fn db_commands_cover_schema_migrate_and_import() {
    let sandbox = unique_temp_dir("compliance-kernel-cli-db");
    let db = sandbox.join("ck.sqlite3");

    let before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&before, "current_version"), 0);
    assert_eq!(as_str(&before, "contract_version"), "cli.v1");

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(
        dry_run
            .get("would_apply_versions")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or_default(),
        2
    );
    let after_dry_run = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&after_dry_run, "current_version"), 0);

    let migrate = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 2);

    let imported = run_json(["--db", path_str(&db), "db", "import", "--in", path_str(&corpus_fixture())]);
    assert_eq!(as_i64(&imported["summary"], "imported_rules"), 2);
    assert_eq!(as_i64(&imported["totals"], "concepts"), 2);

    let again = run_json(["--db", path_str(&db), "db", "import", "--in", path_str(&corpus_fixture())]);
    assert_eq!(as_i64(&again["summary"], "imported_rules"), 0);
    assert_eq!(as_i64(&again["summary"], "skipped_existing_rules"), 2);

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn ask_emits_schema_valid_events_and_replays_them() {
    let sandbox = unique_temp_dir("compliance-kernel-cli-ask");
    let db = sandbox.join("ck.sqlite3");
    let _ = run_json(["--db", path_str(&db), "db", "import", "--in", path_str(&corpus_fixture())]);

    let response = run_json([
        "--db",
        path_str(&db),
        "query",
        "ask",
        "--text",
        CONTRIBUTION_QUESTION,
        "--legal-form",
        "d.o.o.",
        "--as-of",
        "2025-03-01",
    ]);
    assert_eq!(as_str(&response["terminal"], "outcome"), "ANSWER");
    validate_schema("terminal-payload.schema.json", &response["terminal"]);

    let events = events_of(&response);
    assert!(events.len() >= 2);
    for (index, event) in events.iter().enumerate() {
        validate_schema("reasoning-event.schema.json", event);
        assert_eq!(as_i64(event, "sequence"), i64::try_from(index).unwrap_or(i64::MAX));
    }
    assert_eq!(as_str(&events[events.len() - 1], "stage"), "answer");

    let request_id = as_str(&response, "request_id");
    let replay = run_json(["--db", path_str(&db), "query", "events", "--request-id", request_id]);
    let replayed = events_of(&replay);
    assert_eq!(replayed.len(), events.len());
    assert_eq!(replayed[0]["id"], events[0]["id"]);

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn refusals_are_successful_commands_with_valid_payloads() {
    let sandbox = unique_temp_dir("compliance-kernel-cli-refusal");
    let db = sandbox.join("ck.sqlite3");
    let _ = run_json(["--db", path_str(&db), "db", "import", "--in", path_str(&corpus_fixture())]);

    let missing_client = run_json(["--db", path_str(&db), "query", "ask", "--text", CONTRIBUTION_QUESTION]);
    let terminal = &missing_client["terminal"];
    validate_schema("terminal-payload.schema.json", terminal);
    assert_eq!(as_str(terminal, "outcome"), "REFUSAL");
    assert_eq!(as_str(terminal, "reason"), "MISSING_CLIENT_DATA");

    let marketing = run_json([
        "--db",
        path_str(&db),
        "query",
        "ask",
        "--text",
        CONTRIBUTION_QUESTION,
        "--legal-form",
        "d.o.o.",
        "--surface",
        "marketing",
    ]);
    assert_eq!(as_str(&marketing["terminal"], "reason"), "MISSING_CLIENT_DATA");

    let empty = run_json(["--db", path_str(&db), "query", "ask", "--text", "   "]);
    validate_schema("terminal-payload.schema.json", &empty["terminal"]);
    assert_eq!(as_str(&empty["terminal"], "outcome"), "ERROR");
    assert_eq!(as_str(&empty["terminal"], "code"), "VALIDATION_FAILED");

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn stream_mode_prints_one_event_per_line() {
    let sandbox = unique_temp_dir("compliance-kernel-cli-stream");
    let db = sandbox.join("ck.sqlite3");
    let _ = run_json(["--db", path_str(&db), "db", "import", "--in", path_str(&corpus_fixture())]);

    let stdout = stdout_of(&run_ck([
        "--db",
        path_str(&db),
        "query",
        "ask",
        "--text",
        "Koja je stopa PDV-a u Hrvatskoj?",
        "--stream",
    ]));
    let lines = stdout
        .lines()
        .map(|line| {
            serde_json::from_str::<Value>(line)
                .unwrap_or_else(|err| panic!("line is not valid JSON: {err}\nline: {line}"))
        })
        .collect::<Vec<_>>();
    assert!(lines.len() >= 3);

    let (summary, events) = lines.split_last().unwrap_or_else(|| panic!("stream output was empty"));
    for event in events {
        assert_eq!(as_str(event, "contract_version"), "cli.v1");
        let mut bare = event.clone();
        if let Some(object) = bare.as_object_mut() {
            object.remove("contract_version");
        }
        validate_schema("reasoning-event.schema.json", &bare);
    }
    validate_schema("terminal-payload.schema.json", &summary["terminal"]);
    let terminal_events = events.iter().filter(|event| {
        matches!(as_str(event, "stage"), "answer" | "conditional_answer" | "refusal" | "error")
    });
    assert_eq!(terminal_events.count(), 1);

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn rollout_bucket_is_stable_and_config_driven() {
    let sandbox = unique_temp_dir("compliance-kernel-cli-rollout");
    let db = sandbox.join("ck.sqlite3");
    let config = sandbox.join("ck.yaml");
    fs::write(&config, "rollout:\n  hybrid_percent: 100\n")
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));

    let first = run_json(["--db", path_str(&db), "rollout", "bucket", "--key", "company-42"]);
    let second = run_json(["--db", path_str(&db), "rollout", "bucket", "--key", "company-42"]);
    assert_eq!(first["bucket"], second["bucket"]);
    assert!(as_i64(&first, "bucket") < 10_000);
    assert_eq!(as_str(&first, "variant"), "control");

    let all_hybrid = run_json([
        "--db",
        path_str(&db),
        "--config",
        path_str(&config),
        "rollout",
        "bucket",
        "--key",
        "company-42",
    ]);
    assert_eq!(as_str(&all_hybrid, "variant"), "hybrid");

    fs::write(&config, "rollout:\n  hybrid_percent: 250\n")
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));
    let rejected = run_ck(["--db", path_str(&db), "--config", path_str(&config), "rollout", "bucket", "--key", "x"]);
    assert!(!rejected.status.success());

    let _ = fs::remove_dir_all(&sandbox);
}
