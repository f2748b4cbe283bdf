//! Message heuristics shared by the engine and CLI adapters.
//!
//! Docker, Podman and nerdctl report allocation and connectivity problems as
//! free text, so the adapters fall back to matching well-known fragments.

const EXHAUSTION_MARKERS: &[&str] = &[
    "port is already allocated",
    "address already in use",
    "no space left",
    "cannot allocate memory",
    "out of memory",
    "too many",
    "resource temporarily unavailable",
];

const UNREACHABLE_MARKERS: &[&str] = &[
    "connection refused",
    "cannot connect",
    "failed to dial",
    "is the docker daemon running",
    "connection reset",
    "broken pipe",
    "timed out",
];

const MISSING_MARKERS: &[&str] = &["no such container", "container not found", "no such object"];

fn contains_any(message: &str, markers: &[&str]) -> bool {
    let lower = message.to_ascii_lowercase();
    markers.iter().any(|m| lower.contains(m))
}

/// The runtime refused to hand out ports, memory, disk or processes.
pub fn is_exhaustion(message: &str) -> bool {
    contains_any(message, EXHAUSTION_MARKERS)
}

/// The daemon could not be reached at all.
pub fn is_unreachable(message: &str) -> bool {
    contains_any(message, UNREACHABLE_MARKERS)
}

/// The container the sandbox points at does not exist.
///
/// A bare "not found" is not enough: images, namespaces and snapshots go
/// missing with the same words. containerd's own form names the container,
/// as in `container "sandbox-sb-1" in namespace "default": not found`.
pub fn is_missing(message: &str) -> bool {
    if contains_any(message, MISSING_MARKERS) {
        return true;
    }
    let lower = message.to_ascii_lowercase();
    lower.contains("container \"") && lower.contains("\": not found")
}
