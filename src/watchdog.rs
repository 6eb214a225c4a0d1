/// Wall-clock deadline for the synthesizer process.
///
/// The child runs in its own process group. The deadline covers everything the
/// caller waits on (the exit and the output pipes reaching EOF). A background
/// helper that inherited our pipes keeps them open after FloPoCo exits, so on
/// expiry the whole group gets SIGKILL, not just the child, and the child is
/// reaped before control returns.
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;

/// Run `work` to completion, or give up once `deadline` passes. `None` means no limit.
pub async fn within_deadline<F: Future>(deadline: Option<Duration>, work: F) -> Option<F::Output> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, work).await.ok(),
        None => Some(work.await),
    }
}

/// SIGKILL process group `pgid`, then wait for `child`.
///
/// `pgid` is the pid captured at spawn (the child leads its group via
/// `process_group(0)`). It stays valid after the leader exits, as long as any
/// member is left, which is exactly the case where the pipes are still open.
pub async fn kill_and_reap(child: &mut Child, pgid: Option<u32>) -> std::io::Result<ExitStatus> {
    if let Some(pgid) = pgid {
        match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
            Ok(()) => tracing::warn!(pgid, "deadline exceeded, killed process group"),
            Err(e) => tracing::debug!(pgid, error = %e, "killpg failed (group already gone)"),
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "direct kill failed (child likely already gone)");
    }
    let status = child.wait().await?;
    tracing::debug!(?status, "killed child reaped");
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Instant;
    use tokio::io::AsyncReadExt;
    use tokio::process::Command;

    fn spawn_sh(script: &str) -> Child {
        Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_work_finishing_before_deadline() {
        let mut child = spawn_sh("exit 3");
        let status = within_deadline(Some(Duration::from_secs(10)), child.wait())
            .await
            .expect("finished before deadline")
            .unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_no_deadline_waits_for_work() {
        let mut child = spawn_sh("sleep 0.1; exit 0");
        let status = within_deadline(None, child.wait()).await.unwrap().unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let start = Instant::now();
        let mut child = spawn_sh("sleep 30");
        let pgid = child.id();
        let waited = within_deadline(Some(Duration::from_millis(200)), child.wait()).await;
        assert!(waited.is_none());

        let status = kill_and_reap(&mut child, pgid).await.unwrap();
        assert!(!status.success());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_kill_reaches_group_after_leader_exit() {
        // The leader exits at once; its background sleep keeps stdout open.
        let mut child = spawn_sh("sleep 30 & exit 0");
        let pgid = child.id();
        let mut stdout = child.stdout.take().unwrap();
        assert!(child.wait().await.unwrap().success());

        let status = kill_and_reap(&mut child, pgid).await.unwrap();
        assert!(status.success());

        let mut buf = Vec::new();
        let eof = tokio::time::timeout(Duration::from_secs(5), stdout.read_to_end(&mut buf)).await;
        assert!(eof.is_ok(), "pipe still held open after group kill");
    }
}
