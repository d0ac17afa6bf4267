use crate::error::{Error, Result};
use std::io::Read;
use std::os::fd::{AsFd, BorrowedFd};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};

/// Runs the user's command with its stdout captured through a pipe, feeding
/// the event loop one readiness-sized chunk at a time. stdin and stderr stay
/// inherited so the wrapped program behaves transparently to its caller.
pub struct Supervisor {
    child: Child,
    stdout: ChildStdout,
    pending: Vec<u8>,
    eof: bool,
}

impl Supervisor {
    /// Spawn the command. Failure here is fatal and happens before any
    /// counter is opened.
    pub fn spawn(argv: &[String]) -> Result<Self> {
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]).stdout(Stdio::piped());

        let mut child = command.spawn().map_err(|e| Error::Spawn {
            command: argv[0].clone(),
            source: e,
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::Spawn {
            command: argv[0].clone(),
            source: std::io::Error::other("child stdout was not captured"),
        })?;

        Ok(Self {
            child,
            stdout,
            pending: Vec::new(),
            eof: false,
        })
    }

    /// The pipe's read end, for the event loop's poll set.
    pub fn stdout_fd(&self) -> BorrowedFd<'_> {
        self.stdout.as_fd()
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// One read from the pipe (sized by poll readiness, so it does not
    /// block), returning the complete lines now available. At EOF a final
    /// unterminated line is delivered as-is.
    pub fn read_lines(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut lines = Vec::new();
        let mut buf = [0u8; 4096];
        match self.stdout.read(&mut buf) {
            Ok(0) => {
                self.eof = true;
                if !self.pending.is_empty() {
                    lines.push(std::mem::take(&mut self.pending));
                }
            }
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                    lines.push(self.pending.drain(..=pos).collect());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::ChildRead(e)),
        }
        Ok(lines)
    }

    /// Block until the child has fully terminated. Called exactly once, after
    /// its output is exhausted.
    pub fn reap(&mut self) -> Result<ExitStatus> {
        self.child.wait().map_err(Error::Reap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Supervisor {
        Supervisor::spawn(&[
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ])
        .unwrap()
    }

    fn drain(sup: &mut Supervisor) -> Vec<Vec<u8>> {
        let mut all = Vec::new();
        while !sup.is_eof() {
            all.extend(sup.read_lines().unwrap());
        }
        all
    }

    #[test]
    fn spawn_failure_is_reported() {
        let err = Supervisor::spawn(&["definitely-not-a-command-xyzzy".to_string()]);
        assert!(matches!(err, Err(Error::Spawn { .. })));
    }

    #[test]
    fn lines_arrive_in_order_and_terminated() {
        let mut sup = sh("printf 'one\\ntwo\\nthree\\n'");
        let lines = drain(&mut sup);
        assert_eq!(lines, vec![b"one\n".to_vec(), b"two\n".to_vec(), b"three\n".to_vec()]);
        assert!(sup.reap().unwrap().success());
    }

    #[test]
    fn final_unterminated_line_is_delivered() {
        let mut sup = sh("printf 'partial'");
        let lines = drain(&mut sup);
        assert_eq!(lines, vec![b"partial".to_vec()]);
        sup.reap().unwrap();
    }

    #[test]
    fn exit_status_is_propagated() {
        let mut sup = sh("exit 7");
        drain(&mut sup);
        let status = sup.reap().unwrap();
        assert_eq!(status.code(), Some(7));
    }
}
