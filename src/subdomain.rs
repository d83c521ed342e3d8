//! # Subdomain Allocation
//!
//! Pure allocation logic mapping an optional requested name plus the set
//! of taken labels to an assigned DNS label. Generated names look like
//! `chara-misty-cedar-otter`; requested names are honored when they are
//! valid labels and free.

use std::collections::HashSet;

use rand::Rng;

use crate::error::{Result, TunnelError};

/// Attempts at a fresh random name before falling back to a numeric suffix.
const GENERATE_ATTEMPTS: usize = 16;

/// Suffix range scanned after random generation keeps colliding.
const SUFFIX_ATTEMPTS: u32 = 10_000;

const WORDS: &[&str] = &[
    "amber", "birch", "brook", "cedar", "cloud", "coral", "crane", "delta", "ember", "fern",
    "finch", "frost", "glade", "harbor", "hazel", "heron", "iris", "juniper", "lagoon", "linden",
    "maple", "meadow", "misty", "north", "otter", "pebble", "pine", "quartz", "raven", "ridge",
    "river", "slate", "spruce", "stone", "swift", "thorn", "tide", "vale", "willow", "wren",
];

/// Outcome of one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// The assigned DNS label (without the root domain).
    pub name: String,
    /// Whether the agent's requested name was honored.
    pub honored: bool,
}

/// Checks that `label` is a usable DNS label: 3–63 chars of `[a-z0-9-]`
/// with no leading or trailing hyphen.
pub fn validate_label(label: &str) -> bool {
    if label.len() < 3 || label.len() > 63 {
        return false;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return false;
    }
    label
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Normalizes a requested name: lowercase, first DNS label only. Returns
/// `None` when the result is not a valid label.
pub fn normalize_requested(raw: &str) -> Option<String> {
    let label = raw.to_ascii_lowercase();
    let label = label.split('.').next().unwrap_or_default();
    validate_label(label).then(|| label.to_string())
}

/// Allocates a label, honoring `requested` when possible.
///
/// Invalid or taken requested names fall back to generation, reported via
/// `honored: false`. Generation retries a bounded number of times, then
/// appends a numeric suffix; exhaustion of that scan is fatal.
pub fn allocate(requested: Option<&str>, taken: &HashSet<String>) -> Result<Allocation> {
    if let Some(label) = requested.and_then(normalize_requested) {
        if !taken.contains(&label) {
            return Ok(Allocation {
                name: label,
                honored: true,
            });
        }
    }

    let mut rng = rand::rng();
    let mut last = generate_name(&mut rng);
    for _ in 0..GENERATE_ATTEMPTS {
        if !taken.contains(&last) {
            return Ok(Allocation {
                name: last,
                honored: false,
            });
        }
        last = generate_name(&mut rng);
    }

    for n in 2..SUFFIX_ATTEMPTS {
        let candidate = format!("{last}-{n}");
        if candidate.len() <= 63 && !taken.contains(&candidate) {
            return Ok(Allocation {
                name: candidate,
                honored: false,
            });
        }
    }

    Err(TunnelError::AllocatorExhausted)
}

fn generate_name<R: Rng>(rng: &mut R) -> String {
    let pick = |rng: &mut R| WORDS[rng.random_range(0..WORDS.len())];
    format!("chara-{}-{}-{}", pick(rng), pick(rng), pick(rng))
}
