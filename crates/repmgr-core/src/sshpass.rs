//! SSH execution with password authentication.
//!
//! Some deployments mandate password-authenticated SSH between nodes.
//! The command runs as a child attached to a pseudo-terminal; a small
//! state machine watches the terminal output for the password prompt,
//! the unknown-host-key prompt and the changed-host-key warning, and
//! either supplies the stored password or returns a distinctive exit
//! code. The child's stdout rides a separate pipe so command output is
//! captured unmixed with terminal chatter.

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::poll::{poll, PollFd, PollFlags};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, fork, pipe, read, setsid, write, ForkResult, Pid};
use tracing::{debug, warn};

use repmgr_proto::{RepmgrError, RepmgrResult};

/// Distinctive exit conditions of a password-authenticated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshpassStatus {
    /// The command ran; its own exit code is reported alongside.
    Completed,
    IncorrectPassword,
    HostKeyUnknown,
    HostKeyChanged,
    RuntimeError,
}

/// Outcome of a password-authenticated SSH run.
#[derive(Debug, Clone)]
pub struct SshpassOutcome {
    pub status: SshpassStatus,
    pub exit_code: i32,
    pub stdout: String,
}

/// Prompts recognised on the terminal stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptEvent {
    PasswordPrompt,
    RepeatedPasswordPrompt,
    HostKeyUnknown,
    HostKeyChanged,
}

// Match without anchoring: "assword" covers both "Password:" and
// "password:". The changed-key warning itself goes to stderr, but ssh
// exits immediately in that case; the tty carries this companion line.
const PASSWORD_PROMPT: &[u8] = b"assword";
const HOST_KEY_UNKNOWN: &[u8] = b"The authenticity of host ";
const HOST_KEY_CHANGED: &[u8] = b"differs from the key for the IP address";

/// Advance a substring-match state over a chunk of terminal output.
fn match_advance(reference: &[u8], buffer: &[u8], mut state: usize) -> usize {
    for &byte in buffer {
        if state == reference.len() {
            break;
        }
        if reference[state] == byte {
            state += 1;
        } else {
            state = 0;
            if reference[state] == byte {
                state += 1;
            }
        }
    }
    state
}

/// Incremental recogniser for the three interesting prompts.
#[derive(Debug, Default)]
struct PromptMatcher {
    password_state: usize,
    unknown_state: usize,
    changed_state: usize,
    password_supplied: bool,
}

impl PromptMatcher {
    fn feed(&mut self, buffer: &[u8]) -> Option<PromptEvent> {
        self.password_state = match_advance(PASSWORD_PROMPT, buffer, self.password_state);
        if self.password_state == PASSWORD_PROMPT.len() {
            self.password_state = 0;
            if self.password_supplied {
                return Some(PromptEvent::RepeatedPasswordPrompt);
            }
            self.password_supplied = true;
            return Some(PromptEvent::PasswordPrompt);
        }

        self.unknown_state = match_advance(HOST_KEY_UNKNOWN, buffer, self.unknown_state);
        if self.unknown_state == HOST_KEY_UNKNOWN.len() {
            return Some(PromptEvent::HostKeyUnknown);
        }

        self.changed_state = match_advance(HOST_KEY_CHANGED, buffer, self.changed_state);
        if self.changed_state == HOST_KEY_CHANGED.len() {
            return Some(PromptEvent::HostKeyChanged);
        }

        None
    }
}

/// Run `ssh <options> <command>` with password authentication.
pub async fn run_ssh_with_password(
    ssh_options: &str,
    command: &str,
    password: &str,
) -> RepmgrResult<SshpassOutcome> {
    let ssh_options = ssh_options.to_string();
    let command = command.to_string();
    let password = password.to_string();

    tokio::task::spawn_blocking(move || run_blocking(&ssh_options, &command, &password))
        .await
        .map_err(|e| RepmgrError::Command(format!("sshpass task failed: {}", e)))?
}

fn run_blocking(ssh_options: &str, command: &str, password: &str) -> RepmgrResult<SshpassOutcome> {
    let mut argv: Vec<std::ffi::CString> = vec![std::ffi::CString::new("ssh").unwrap()];
    for word in ssh_options.split_whitespace() {
        argv.push(std::ffi::CString::new(word).map_err(|e| {
            RepmgrError::Command(format!("invalid ssh option \"{}\": {}", word, e))
        })?);
    }
    argv.push(
        std::ffi::CString::new(command)
            .map_err(|e| RepmgrError::Command(format!("invalid command: {}", e)))?,
    );

    let master = posix_openpt(nix::fcntl::OFlag::O_RDWR)
        .map_err(|e| RepmgrError::Command(format!("failed to get a pseudo terminal: {}", e)))?;
    grantpt(&master).map_err(|e| {
        RepmgrError::Command(format!("failed to change pseudo terminal permission: {}", e))
    })?;
    unlockpt(&master)
        .map_err(|e| RepmgrError::Command(format!("failed to unlock pseudo terminal: {}", e)))?;
    let slave_name = ptsname_r(&master)
        .map_err(|e| RepmgrError::Command(format!("failed to name pseudo terminal: {}", e)))?;

    let (stdout_read, stdout_write): (RawFd, RawFd) = pipe()
        .map_err(|e| RepmgrError::Command(format!("failed to create stdout pipe: {}", e)))?;

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // New session so the slave end becomes our controlling TTY.
            let _ = setsid();

            let slave = match nix::fcntl::open(
                slave_name.as_str(),
                nix::fcntl::OFlag::O_RDWR,
                nix::sys::stat::Mode::empty(),
            ) {
                Ok(fd) => fd,
                Err(_) => std::process::exit(125),
            };

            unsafe {
                if nix::libc::ioctl(slave, nix::libc::TIOCSCTTY, 0) == -1 {
                    std::process::exit(125);
                }
            }

            let _ = dup2(stdout_write, nix::libc::STDOUT_FILENO);
            let _ = close(slave);
            let _ = close(stdout_read);
            let _ = close(stdout_write);
            drop(master);

            let _ = nix::unistd::execvp(&argv[0], &argv);
            std::process::exit(125);
        }
        Ok(ForkResult::Parent { child }) => {
            let _ = close(stdout_write);
            parent_loop(master, stdout_read, child, password)
        }
        Err(e) => Err(RepmgrError::Command(format!(
            "failed to create child process: {}",
            e
        ))),
    }
}

fn parent_loop(
    master: impl AsRawFd,
    stdout_read: RawFd,
    child: Pid,
    password: &str,
) -> RepmgrResult<SshpassOutcome> {
    let master_fd = master.as_raw_fd();
    let stdout_fd = stdout_read;
    // fds stay open for the life of this loop; borrows are sound
    let master_borrowed = unsafe { BorrowedFd::borrow_raw(master_fd) };
    let stdout_borrowed = unsafe { BorrowedFd::borrow_raw(stdout_fd) };

    let mut matcher = PromptMatcher::default();
    let mut stdout_buf: Vec<u8> = Vec::new();
    let mut status = SshpassStatus::Completed;
    let mut terminated = false;

    let exit_code = loop {
        if !terminated {
            let mut fds = [
                PollFd::new(&master_borrowed, PollFlags::POLLIN),
                PollFd::new(&stdout_borrowed, PollFlags::POLLIN),
            ];
            let _ = poll(&mut fds, 100);

            let mut chunk = [0u8; 256];

            if fds[0]
                .revents()
                .map(|r| r.contains(PollFlags::POLLIN))
                .unwrap_or(false)
            {
                if let Ok(n) = read(master_fd, &mut chunk) {
                    match matcher.feed(&chunk[..n]) {
                        Some(PromptEvent::PasswordPrompt) => {
                            debug!("password prompt detected, supplying password");
                            let _ = write(master_fd, password.as_bytes());
                            let _ = write(master_fd, b"\n");
                        }
                        Some(PromptEvent::RepeatedPasswordPrompt) => {
                            warn!("password prompt repeated, password is incorrect");
                            status = SshpassStatus::IncorrectPassword;
                            terminated = true;
                        }
                        Some(PromptEvent::HostKeyUnknown) => {
                            warn!("remote host key is unknown");
                            status = SshpassStatus::HostKeyUnknown;
                            terminated = true;
                        }
                        Some(PromptEvent::HostKeyChanged) => {
                            warn!("remote host key has changed");
                            status = SshpassStatus::HostKeyChanged;
                            terminated = true;
                        }
                        None => {}
                    }
                }
            }

            if fds[1]
                .revents()
                .map(|r| r.contains(PollFlags::POLLIN))
                .unwrap_or(false)
            {
                if let Ok(n) = read(stdout_fd, &mut chunk) {
                    stdout_buf.extend_from_slice(&chunk[..n]);
                }
            }

            if terminated {
                // a recognised failure prompt: stop the child and collect
                // its status without spinning on WNOHANG
                let _ = nix::sys::signal::kill(child, nix::sys::signal::Signal::SIGTERM);
                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, code)) => break code,
                    _ => break 255,
                }
            }
        }

        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => break code,
            Ok(WaitStatus::Signaled(_, _, _)) => break 255,
            Ok(_) => {}
            Err(e) => {
                return Err(RepmgrError::Command(format!(
                    "waitpid on ssh child failed: {}",
                    e
                )))
            }
        }
    };

    // drain any output written between the last poll and exit
    let mut chunk = [0u8; 256];
    while let Ok(n) = read(stdout_fd, &mut chunk) {
        if n == 0 {
            break;
        }
        stdout_buf.extend_from_slice(&chunk[..n]);
    }

    Ok(SshpassOutcome {
        status,
        exit_code,
        stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_advance_across_chunks() {
        // the prompt arrives split over two reads
        let state = match_advance(PASSWORD_PROMPT, b"node1's pass", 0);
        assert!(state > 0);
        let state = match_advance(PASSWORD_PROMPT, b"word: ", state);
        assert_eq!(state, PASSWORD_PROMPT.len());
    }

    #[test]
    fn test_match_resets_on_mismatch() {
        let state = match_advance(PASSWORD_PROMPT, b"assw-assword", 0);
        assert_eq!(state, PASSWORD_PROMPT.len());

        let state = match_advance(PASSWORD_PROMPT, b"no prompt here", 0);
        assert!(state < PASSWORD_PROMPT.len());
    }

    #[test]
    fn test_matcher_password_then_repeat() {
        let mut matcher = PromptMatcher::default();
        assert_eq!(
            matcher.feed(b"node1's password: "),
            Some(PromptEvent::PasswordPrompt)
        );
        // the same prompt again means the password was wrong
        assert_eq!(
            matcher.feed(b"node1's password: "),
            Some(PromptEvent::RepeatedPasswordPrompt)
        );
    }

    #[test]
    fn test_matcher_host_key_prompts() {
        let mut matcher = PromptMatcher::default();
        assert_eq!(
            matcher.feed(b"The authenticity of host 'node2 (192.0.2.2)' can't be established."),
            Some(PromptEvent::HostKeyUnknown)
        );

        let mut matcher = PromptMatcher::default();
        assert_eq!(
            matcher.feed(b"Warning: the ECDSA host key for 'node2' differs from the key for the IP address '192.0.2.2'"),
            Some(PromptEvent::HostKeyChanged)
        );
    }

    #[test]
    fn test_matcher_ignores_ordinary_output() {
        let mut matcher = PromptMatcher::default();
        assert_eq!(matcher.feed(b"Last login: Tue Jan  2 03:04:05"), None);
        assert_eq!(matcher.feed(b"--state=SHUTDOWN"), None);
    }
}
