use std::{
    net::TcpListener,
    process::{Command, Output},
};

fn stampede(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stampede"))
        .args(args)
        .env("STAMPEDE_LOG", "off")
        .output()
        .expect("failed to run stampede")
}

#[test]
fn bad_role_exits_with_config_error() {
    let output = stampede(&["--role", "leader", "-u", "1", "-r", "1"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unrecognized role `leader`"), "{stderr}");
}

#[test]
fn missing_users_exits_with_config_error() {
    let output = stampede(&["-r", "1"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn short_run_against_closed_port_reports_failures() {
    // reserve a port and free it again so nothing answers
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").expect("bind");
        probe.local_addr().expect("addr").port()
    };
    let host = format!("http://127.0.0.1:{port}");
    let output = stampede(&[
        "--host",
        &host,
        "-u",
        "2",
        "-r",
        "2",
        "-t",
        "1",
        "--stop-timeout",
        "1",
        "--seed",
        "11",
        "--json",
    ]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json report");
    assert_eq!(report["meta"]["mode"], "standalone");
    assert_eq!(report["meta"]["peak_users"], 2);
    let requests = report["total"]["requests"].as_u64().expect("request count");
    assert!(requests >= 2, "requests {requests}");
    assert_eq!(report["total"]["failures"].as_u64(), Some(requests));
    assert_eq!(report["error_rate"].as_f64(), Some(1.0));
}
