use relay_core::{Error, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Captured result of one agent subprocess.
#[derive(Debug)]
pub struct ExecOutput {
    pub stdout: String,
    pub exit_code: Option<i32>,
}

/// Run a command string under `bash -lc` with a wall-clock timeout and an
/// output-buffer cap. Inputs travel through environment variables; stderr is
/// discarded unless the command itself redirects it.
pub async fn run(
    command: &str,
    envs: &[(String, String)],
    cwd: Option<&Path>,
    timeout_ms: u64,
    max_buffer: usize,
) -> Result<ExecOutput> {
    let mut cmd = Command::new("bash");
    cmd.arg("-lc")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::MissingBinary("bash".to_string())
        } else {
            Error::Io(e)
        }
    })?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Other("child stdout was not captured".to_string()))?;

    enum Read {
        Done(Vec<u8>, Option<i32>),
        Overflow,
    }

    let capped = async {
        let mut buf = Vec::new();
        let mut limited = (&mut stdout).take(max_buffer as u64 + 1);
        limited.read_to_end(&mut buf).await?;
        if buf.len() > max_buffer {
            return Ok::<_, std::io::Error>(Read::Overflow);
        }
        let status = child.wait().await?;
        Ok(Read::Done(buf, status.code()))
    };

    match timeout(Duration::from_millis(timeout_ms), capped).await {
        Err(_) => Err(Error::Timeout(format!("killed after {} ms", timeout_ms))),
        Ok(Err(e)) => Err(Error::Io(e)),
        Ok(Ok(Read::Overflow)) => Err(Error::MaxBuffer(format!(
            "stdout exceeded {} bytes",
            max_buffer
        ))),
        Ok(Ok(Read::Done(buf, exit_code))) => Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&buf).to_string(),
            exit_code,
        }),
    }
}
