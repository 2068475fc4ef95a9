//! Child process execution shared by the reference adapters.

use std::io::ErrorKind;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{AdapterError, Invocation, RawOutput};

/// Run `invocation` to completion or until `cancel` fires.
///
/// On cancellation the process group receives SIGTERM, then SIGKILL once
/// `invocation.grace` has elapsed. Members of the group still alive after the
/// tool exits are killed as well. A non-zero exit with nothing on stdout is
/// reported as [`AdapterError::Exited`]; otherwise output is returned for the
/// adapter to parse.
pub async fn run(
    invocation: &Invocation,
    cancel: CancellationToken,
) -> Result<RawOutput, AdapterError> {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group so termination reaches helpers the tool forks.
    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().map_err(|err| match err.kind() {
        ErrorKind::NotFound => AdapterError::ToolNotFound(invocation.program.clone()),
        ErrorKind::PermissionDenied => AdapterError::PermissionDenied(invocation.program.clone()),
        _ => AdapterError::Io(err),
    })?;

    // Captured before waiting: the child forgets its pid once reaped.
    let pid = child.id();
    tracing::debug!(
        target: "scan::adapter",
        pid = ?pid,
        command = %invocation.command_line(),
        "tool process spawned"
    );

    let stdout = tokio::spawn(drain(child.stdout.take()));
    let stderr = tokio::spawn(drain(child.stderr.take()));

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            terminate(&mut child, pid, invocation).await;
            stdout.abort();
            stderr.abort();
            return Err(AdapterError::Cancelled);
        }
    };

    // Helpers left behind by the tool would hold the pipes open.
    signal_group(pid, Signal::Kill);

    let stdout = stdout.await.unwrap_or_default();
    let stderr = stderr.await.unwrap_or_default();

    if !status.success() && stdout.trim().is_empty() {
        return Err(AdapterError::Exited {
            code: status.code(),
            stderr,
        });
    }

    Ok(RawOutput {
        stdout,
        stderr,
        exit_code: status.code(),
    })
}

async fn drain<R>(pipe: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe
        && let Err(err) = pipe.read_to_end(&mut buf).await
    {
        tracing::trace!(target: "scan::adapter", "pipe read ended early: {err}");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Send `signal` to the process group led by `pid`. Returns false when no
/// group member was signalled.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) -> bool {
    let Some(pid) = pid else {
        return false;
    };
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Negative pid addresses the whole group created by setsid.
    unsafe { libc::kill(-(pid as libc::pid_t), signo) == 0 }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) -> bool {
    false
}

async fn terminate(
    child: &mut tokio::process::Child,
    pid: Option<u32>,
    invocation: &Invocation,
) {
    signal_group(pid, Signal::Term);

    match tokio::time::timeout(invocation.grace, child.wait()).await {
        Ok(_) => {
            tracing::debug!(target: "scan::adapter", program = %invocation.program, "tool exited after SIGTERM");
            signal_group(pid, Signal::Kill);
        }
        Err(_) => {
            tracing::warn!(
                target: "scan::adapter",
                program = %invocation.program,
                grace_ms = invocation.grace.as_millis() as u64,
                "tool ignored SIGTERM, killing process group"
            );
            if !signal_group(pid, Signal::Kill)
                && let Err(err) = child.start_kill()
            {
                tracing::warn!(target: "scan::adapter", "kill failed: {err}");
            }
            let _ = child.wait().await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn invocation(program: &str, args: &[&str]) -> Invocation {
        Invocation {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            target: "localhost".into(),
            grace: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn captures_stdout() {
        let out = run(&invocation("sh", &["-c", "echo hello"]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn missing_binary_is_tool_not_found() {
        let err = run(
            &invocation("vigil-definitely-not-installed", &[]),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdapterError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn silent_failure_is_exited() {
        let err = run(
            &invocation("sh", &["-c", "echo boom >&2; exit 3"]),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            AdapterError::Exited { code, stderr } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_stops_the_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let err = run(&invocation("sleep", &["30"]), cancel).await.unwrap_err();
        assert!(matches!(err, AdapterError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    fn alive(pid: libc::pid_t) -> bool {
        if unsafe { libc::kill(pid, 0) } != 0 {
            return false;
        }
        // Zombies still accept signal 0.
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
                .unwrap_or(true),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn cancellation_kills_helpers_that_ignore_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("helper.pid");
        let script = format!(
            "trap '' TERM; sleep 30 & echo $! > {}; wait",
            pid_file.display()
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let watched = pid_file.clone();
        tokio::spawn(async move {
            while !watched.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = run(&invocation("sh", &["-c", &script]), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));

        let helper: libc::pid_t = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(3);
        while alive(helper) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive(helper), "helper {helper} survived cancellation");
    }
}
