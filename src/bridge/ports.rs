//! Per-session port pair selection.
//!
//! Each session needs two adjacent ports inside the sandbox: one for sshd and
//! one for the WebSocket relay. Candidates are walked deterministically from a
//! seed derived from the session id so concurrent sessions spread out over the
//! range, and each candidate is probed before it is used.

use std::collections::HashMap;
use tracing::debug;

use super::{BridgeError, Remote};

/// Candidate pairs probed per remote round-trip.
const PROBE_BATCH: usize = 8;

/// Odd, so it is coprime with the power-of-two slot count.
const STRIDE: u32 = 7919;

/// The two ports a session listens on inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PortPair {
    /// Port sshd listens on.
    pub server: u16,
    /// Externally exposed port for the WebSocket relay.
    pub relay: u16,
}

/// The block of ports sessions may use, split into `size / 2` pair slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PortRange {
    start: u16,
    size: u32,
}

impl PortRange {
    /// Creates a range starting at `start`.
    ///
    /// `size` is clamped to the ports available above `start` and rounded
    /// down to a power of two (at least 2).
    pub fn new(start: u16, size: u16) -> Self {
        let start = start.clamp(1024, u16::MAX - 1);
        let available = u32::from(u16::MAX) - u32::from(start) + 1;
        let wanted = u32::from(size).clamp(2, available);
        let size = 1 << (31 - wanted.leading_zeros());
        Self {
            start,
            size: size.max(2),
        }
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    /// Last port in the range.
    pub fn end(&self) -> u16 {
        // start + size - 1 never exceeds u16::MAX by construction
        u16::try_from(u32::from(self.start) + self.size - 1).unwrap_or(u16::MAX)
    }

    fn slots(&self) -> u32 {
        self.size / 2
    }

    fn pair(&self, slot: u32) -> PortPair {
        let server = u32::from(self.start) + slot * 2;
        PortPair {
            server: u16::try_from(server).unwrap_or(u16::MAX - 1),
            relay: u16::try_from(server + 1).unwrap_or(u16::MAX),
        }
    }

    /// Up to `attempts` distinct candidate pairs in probe order.
    ///
    /// The walk `seed + i * STRIDE (mod slots)` is a permutation of the slots,
    /// so no pair repeats; attempts beyond the slot count are dropped.
    pub fn candidates(&self, seed: u32, attempts: u32) -> Vec<PortPair> {
        let slots = self.slots();
        let mask = slots - 1;
        (0..attempts.min(slots))
            .map(|i| self.pair(seed.wrapping_add(i.wrapping_mul(STRIDE)) & mask))
            .collect()
    }
}

/// 32-bit FNV-1a hash.
pub(crate) fn fnv1a(input: &str) -> u32 {
    input.bytes().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    })
}

/// Bash command reporting `free <port>` or `busy <port>` for every port.
///
/// A port counts as busy when a TCP connect to it on loopback succeeds.
pub(crate) fn probe_command(pairs: &[PortPair]) -> String {
    let ports: Vec<String> = pairs
        .iter()
        .flat_map(|p| [p.server, p.relay])
        .map(|p| p.to_string())
        .collect();
    let script = format!(
        "for p in {}; do if (exec 3<>/dev/tcp/127.0.0.1/$p) 2>/dev/null; then echo \"busy $p\"; else echo \"free $p\"; fi; done",
        ports.join(" ")
    );
    format!("bash -c {}", shell_words::quote(&script))
}

fn parse_probe(stdout: &str) -> HashMap<u16, bool> {
    stdout
        .lines()
        .filter_map(|line| {
            let (state, port) = line.trim().split_once(' ')?;
            let port = port.trim().parse().ok()?;
            match state {
                "free" => Some((port, true)),
                "busy" => Some((port, false)),
                _ => None,
            }
        })
        .collect()
}

/// Finds a pair where both ports are free.
///
/// Ports missing from the probe output are treated as busy.
pub(crate) async fn allocate(
    remote: &Remote<'_>,
    session_id: &str,
    range: PortRange,
    attempts: u32,
) -> Result<PortPair, BridgeError> {
    let candidates = range.candidates(fnv1a(session_id), attempts);

    for batch in candidates.chunks(PROBE_BATCH) {
        let output = remote.run("probe-ports", &probe_command(batch)).await?;
        let states = parse_probe(&output.stdout);
        let is_free = |port: u16| states.get(&port).copied().unwrap_or(false);

        if let Some(pair) = batch.iter().find(|p| is_free(p.server) && is_free(p.relay)) {
            debug!(
                "Allocated ports {} (sshd) and {} (relay) on {}",
                pair.server,
                pair.relay,
                remote.id()
            );
            return Ok(*pair);
        }
    }

    Err(BridgeError::PortsExhausted {
        sandbox: remote.id().to_string(),
        attempts: u32::try_from(candidates.len()).unwrap_or(u32::MAX),
        start: range.start(),
        end: range.end(),
    })
}
