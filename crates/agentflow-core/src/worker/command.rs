//! Subprocess-backed worker.
//!
//! The request goes to the child's stdin as one JSON document. The child
//! writes JSON lines to stdout, each tagged with `type`:
//!
//! ```text
//! {"type":"heartbeat","progress":0.4}
//! {"type":"response","confidence":0.9,"success":true,"payload":{...}}
//! ```
//!
//! Other stdout lines are ignored. The child is killed on cancellation and
//! when the invocation future is dropped.

use std::process::Stdio;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::ContextPackage;
use crate::worker::{HeartbeatSender, SpecialistWorker, WorkerRequest, WorkerResponse};

#[derive(Serialize)]
struct WireRequest<'a> {
    instance_id: &'a str,
    task_id: &'a str,
    specialist_id: &'a str,
    attempt: u32,
    deadline: DateTime<Utc>,
    context_package: &'a ContextPackage,
    package_ref: &'a str,
    forbidden_callees: &'a [String],
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireLine {
    Heartbeat {
        #[serde(default)]
        progress: f64,
    },
    Response(WorkerResponse),
}

/// Runs `argv[0] argv[1..]` once per instance.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    argv: Vec<String>,
}

impl CommandWorker {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl SpecialistWorker for CommandWorker {
    async fn invoke(
        &self,
        request: WorkerRequest,
        heartbeat: HeartbeatSender,
        cancel: CancellationToken,
    ) -> anyhow::Result<WorkerResponse> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("empty worker command for {}", request.specialist_id))?;

        let mut child = Command::new(program)
            .args(args)
            .env("AGENTFLOW_INSTANCE_ID", &request.instance_id)
            .env("AGENTFLOW_SPECIALIST_ID", &request.specialist_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn worker {program}"))?;

        let wire = WireRequest {
            instance_id: &request.instance_id,
            task_id: &request.task_id,
            specialist_id: &request.specialist_id,
            attempt: request.attempt,
            deadline: request.deadline,
            context_package: &request.context_package,
            package_ref: &request.package_ref,
            forbidden_callees: &request.forbidden_callees,
        };
        let mut body = serde_json::to_vec(&wire)?;
        body.push(b'\n');

        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits without reading stdin is not an error here.
            if let Err(e) = stdin.write_all(&body).await {
                debug!(error = %e, "worker closed stdin early");
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("worker stdout unavailable"))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut response = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, instance_id = %request.instance_id, "failed to kill cancelled worker");
                    }
                    bail!("worker cancelled");
                }
                line = lines.next_line() => {
                    let Some(line) = line.context("reading worker stdout")? else {
                        break;
                    };
                    match serde_json::from_str::<WireLine>(&line) {
                        Ok(WireLine::Heartbeat { progress }) => heartbeat.beat(progress),
                        Ok(WireLine::Response(r)) => {
                            response = Some(r);
                            break;
                        }
                        Err(_) => debug!(line = %line, "ignoring non-protocol worker output"),
                    }
                }
            }
        }

        let status = child.wait().await.context("waiting for worker exit")?;
        match response {
            Some(r) => Ok(r),
            None => bail!("worker exited ({status}) without a response"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::worker::testing::request_for;

    fn sh(script: &str) -> CommandWorker {
        CommandWorker::new(vec!["sh".into(), "-c".into(), script.into()])
    }

    #[tokio::test]
    async fn test_reads_heartbeats_and_response() {
        let w = sh(r#"cat >/dev/null; echo 'noise'; echo '{"type":"heartbeat","progress":0.5}'; echo '{"type":"response","confidence":0.75,"success":true,"payload":{"n":1}}'"#);
        let (hb, rx) = HeartbeatSender::channel("i");
        let resp = w.invoke(request_for("ext"), hb, CancellationToken::new()).await.unwrap();
        assert_eq!(resp.confidence, 0.75);
        assert_eq!(resp.payload["n"], 1);
        assert_eq!(rx.borrow().seq, 1);
    }

    #[tokio::test]
    async fn test_missing_response_is_error() {
        let w = sh("cat >/dev/null; exit 3");
        let (hb, _rx) = HeartbeatSender::channel("i");
        let err = w.invoke(request_for("ext"), hb, CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("without a response"), "got {err}");
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let w = sh("sleep 30");
        let (hb, _rx) = HeartbeatSender::channel("i");
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            c.cancel();
        });
        let started = std::time::Instant::now();
        let err = w.invoke(request_for("ext"), hb, cancel).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
