//! Drives the compiled `bb7` binary over its real stdio protocol: feed it a
//! line-delimited JSON session on stdin, parse the line-delimited JSON it
//! writes back to stdout.

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

fn run_session(project_root: &std::path::Path, input_lines: &[&str]) -> Vec<Value> {
    let mut input = input_lines.join("\n");
    input.push('\n');
    let output = Command::cargo_bin("bb7")
        .unwrap()
        .arg("--project-root")
        .arg(project_root)
        .write_stdin(input)
        .output()
        .unwrap();
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("each stdout line is one JSON frame"))
        .collect()
}

#[test]
fn ping_then_shutdown_round_trips_over_real_stdio() {
    let dir = TempDir::new().unwrap();
    let frames = run_session(
        dir.path(),
        &[
            r#"{"request_id":"1","action":"ping"}"#,
            r#"{"request_id":"2","action":"shutdown"}"#,
        ],
    );
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["type"], "pong");
    assert_eq!(frames[1]["type"], "ok");
}

#[test]
fn bb7_init_then_chat_new_then_chat_list() {
    let dir = TempDir::new().unwrap();
    let frames = run_session(
        dir.path(),
        &[
            r#"{"request_id":"1","action":"bb7_init"}"#,
            r#"{"request_id":"2","action":"chat_new","name":"first chat"}"#,
            r#"{"request_id":"3","action":"chat_list"}"#,
            r#"{"request_id":"4","action":"shutdown"}"#,
        ],
    );
    assert_eq!(frames[0]["type"], "bb7_init");
    assert_eq!(frames[1]["type"], "chat_new");
    let chat_id = frames[1]["chat"]["id"].as_str().unwrap().to_string();
    assert_eq!(frames[2]["type"], "chat_list");
    let chats = frames[2]["chats"].as_array().unwrap();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0]["id"], chat_id);
    assert!(dir.path().join(".bb7/chats/index.json").exists());
}

#[test]
fn unrecognised_action_is_an_error_frame_with_matching_request_id() {
    let dir = TempDir::new().unwrap();
    let frames = run_session(
        dir.path(),
        &[
            r#"{"request_id":"1","action":"not_a_real_action"}"#,
            r#"{"request_id":"2","action":"shutdown"}"#,
        ],
    );
    assert_eq!(frames[0]["type"], "error");
    assert_eq!(frames[0]["request_id"], "1");
    assert!(frames[0]["message"].as_str().unwrap().contains("unrecognised action"));
}

#[test]
fn context_add_outside_project_root_is_rejected_by_the_sandbox() {
    let dir = TempDir::new().unwrap();
    let frames = run_session(
        dir.path(),
        &[
            r#"{"request_id":"1","action":"bb7_init"}"#,
            r#"{"request_id":"2","action":"chat_new"}"#,
            r#"{"request_id":"3","action":"chat_select","id":"__placeholder__"}"#,
            r#"{"request_id":"4","action":"shutdown"}"#,
        ],
    );
    let chat_id = frames[1]["chat"]["id"].as_str().unwrap();
    // Replay with the real chat id now that we know it (the placeholder
    // select above only exercises the not-found path for that id).
    let frames = run_session(
        dir.path(),
        &[
            &format!(r#"{{"request_id":"1","action":"chat_select","id":"{chat_id}"}}"#),
            r#"{"request_id":"2","action":"context_add","path":"../../etc/passwd","content":"x","readonly":false}"#,
            r#"{"request_id":"3","action":"shutdown"}"#,
        ],
    );
    assert_eq!(frames[0]["type"], "chat_select");
    assert_eq!(frames[1]["type"], "error");
    assert!(frames[1]["message"].as_str().unwrap().contains("escapes"));
}
