//! Starting and stopping the sshd and relay processes inside the sandbox.

use tracing::debug;

use super::ports::PortPair;
use super::sshd::RemoteLayout;
use super::{BridgeError, Remote};

/// Polls of `kill -0` after SIGTERM before giving up on a process.
const STOP_POLLS: u32 = 10;
/// Listener probes before a start is considered failed (0.25s apart).
const READY_POLLS: u32 = 40;

/// A background process tracked through a PID file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemoteProcess {
    name: &'static str,
    pid_file: String,
    elevated: bool,
}

impl RemoteProcess {
    /// sshd may have been started through sudo, so stopping it may need sudo too.
    pub fn sshd(layout: &RemoteLayout) -> Self {
        Self {
            name: "sshd",
            pid_file: layout.sshd_pid(),
            elevated: true,
        }
    }

    pub fn relay(layout: &RemoteLayout) -> Self {
        Self {
            name: "relay",
            pid_file: layout.relay_pid(),
            elevated: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Sends SIGTERM and waits briefly for exit. A missing PID file is a no-op.
    pub fn terminate_command(&self) -> String {
        let signal = if self.elevated {
            "kill -TERM \"$PID\" 2>/dev/null || sudo -n kill -TERM \"$PID\" 2>/dev/null || true"
        } else {
            "kill -TERM \"$PID\" 2>/dev/null || true"
        };
        let polls = (1..=STOP_POLLS)
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "PIDFILE={}; [ -f \"$PIDFILE\" ] || exit 0; \
             PID=$(cat \"$PIDFILE\" 2>/dev/null); [ -n \"$PID\" ] || exit 0; \
             {signal}; \
             for _ in {polls}; do kill -0 \"$PID\" 2>/dev/null || exit 0; sleep 0.2; done; exit 0",
            shell_words::quote(&self.pid_file)
        )
    }

    pub async fn terminate(&self, remote: &Remote<'_>) -> Result<(), BridgeError> {
        debug!("Stopping {} on {}", self.name, remote.id());
        remote.run("stop-process", &self.terminate_command()).await?;
        Ok(())
    }
}

/// Starts sshd with the session config; sshd daemonizes and writes its PID file.
///
/// sshd refuses to start without its privilege separation directory, so it is
/// created first (via sudo when needed). When not running as root, sshd is
/// started through `sudo -n` if available and directly otherwise.
pub(crate) fn sshd_start_command(layout: &RemoteLayout) -> String {
    let config = shell_words::quote(&layout.sshd_config()).into_owned();
    let log = shell_words::quote(&layout.sshd_log()).into_owned();
    format!(
        "SSHD=$(command -v sshd || echo /usr/sbin/sshd); \
         SUDO=''; if [ \"$(id -u)\" != 0 ] && sudo -n true 2>/dev/null; then SUDO='sudo -n'; fi; \
         [ -d /run/sshd ] || $SUDO mkdir -p /run/sshd 2>/dev/null || true; \
         $SUDO \"$SSHD\" -f {config} -E {log}"
    )
}

/// Starts websockify in the background bridging `relay` to sshd on loopback.
pub(crate) fn relay_start_command(layout: &RemoteLayout, ports: PortPair) -> String {
    format!(
        "nohup websockify 0.0.0.0:{} 127.0.0.1:{} > {} 2>&1 < /dev/null & echo $! > {}",
        ports.relay,
        ports.server,
        shell_words::quote(&layout.relay_log()),
        shell_words::quote(&layout.relay_pid())
    )
}

/// Waits until something accepts connections on every port, failing with the
/// tail of `log` when a port never comes up.
pub(crate) fn wait_for_listener_command(ports: &[u16], log: &str) -> String {
    let ports = ports
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    let script = format!(
        "for p in {ports}; do ok=0; for _ in $(seq {READY_POLLS}); do \
         if (exec 3<>/dev/tcp/127.0.0.1/$p) 2>/dev/null; then ok=1; break; fi; sleep 0.25; done; \
         if [ $ok -ne 1 ]; then echo \"port $p did not start listening\" >&2; tail -n 20 {} >&2 2>/dev/null; exit 1; fi; done",
        shell_words::quote(log)
    );
    format!("bash -c {}", shell_words::quote(&script))
}
