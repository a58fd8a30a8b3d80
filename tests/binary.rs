//! Exit status of the plugin binary.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use hemmer_provider_puppetca::types::{MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE};

const BIN: &str = env!("CARGO_BIN_EXE_hemmer-provider-puppetca");

#[tokio::test]
async fn test_exits_non_zero_when_not_launched_by_host() {
    let output = Command::new(BIN)
        .env_remove(MAGIC_COOKIE_KEY)
        .env("RUST_LOG", "error")
        .output()
        .await
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty(), "no handshake may be printed");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("plugin"), "stderr was: {stderr}");
}

#[cfg(unix)]
#[tokio::test]
async fn test_exits_zero_after_sigterm() {
    let mut child = Command::new(BIN)
        .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
        .env("RUST_LOG", "error")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let stdout = child.stdout.take().unwrap();
    let mut line = String::new();
    tokio::time::timeout(
        Duration::from_secs(10),
        BufReader::new(stdout).read_line(&mut line),
    )
    .await
    .expect("no handshake within 10s")
    .unwrap();
    assert!(
        line.trim_end().starts_with("HEMMER_PROVIDER|1|127.0.0.1:"),
        "unexpected handshake: {line}"
    );

    let pid = child.id().unwrap().to_string();
    let kill = Command::new("kill")
        .args(["-TERM", &pid])
        .status()
        .await
        .unwrap();
    assert!(kill.success());

    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("binary did not exit after SIGTERM")
        .unwrap();
    assert_eq!(status.code(), Some(0));
}
