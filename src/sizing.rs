//! Disk image sizing.
//!
//! Estimates how large the raw filesystem image must be to hold a rootfs
//! tree, applies a slop policy, and rounds to the granularities mkfs and the
//! archive layout expect.

use std::path::Path;

use tracing::warn;
use walkdir::WalkDir;

use crate::error::Error;

const BLOCK_ALIGN: u64 = 4096;

/// Images are never smaller than this, whatever the estimate says.
const MIN_IMAGE_SIZE: u64 = 10 * 1024 * 1024;

/// Pick the image size for `rootfs`.
///
/// A non-zero `requested` size skips the tree walk. The slop string is a
/// `+`-separated list of `<N>%` (multiplicative) and human-size (additive)
/// terms; empty means "add 25%". The result is rounded up to 4 KiB and
/// floored at 10 MiB.
pub fn compute_size(rootfs: &Path, requested: u64, slop: &str) -> Result<u64, Error> {
    let raw = if requested > 0 {
        requested
    } else {
        estimate_tree_size(rootfs)?
    };
    let padded = apply_slop(raw, slop);
    Ok(round_up(padded, BLOCK_ALIGN).max(MIN_IMAGE_SIZE))
}

/// Sum the apparent sizes of every entry under `root`. Entries that vanish
/// mid-walk or cannot be read are skipped; sparse files and hard links are
/// counted at face value.
fn estimate_tree_size(root: &Path) -> Result<u64, Error> {
    let mut total = 0u64;
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) if ignorable(e.io_error()) => {
                warn!(path = ?e.path(), "skipping unreadable entry during size estimation");
                continue;
            }
            Err(e) => return Err(walk_error(e)),
        };
        match entry.metadata() {
            Ok(meta) => total += meta.len(),
            Err(e) if ignorable(e.io_error()) => {
                warn!(path = ?entry.path(), "skipping unstatable entry during size estimation");
            }
            Err(e) => return Err(walk_error(e)),
        }
    }
    Ok(total)
}

fn ignorable(e: Option<&std::io::Error>) -> bool {
    matches!(
        e.map(std::io::Error::kind),
        Some(std::io::ErrorKind::NotFound) | Some(std::io::ErrorKind::PermissionDenied)
    )
}

fn walk_error(e: walkdir::Error) -> Error {
    Error::Io(e.into_io_error().unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop during walk")
    }))
}

fn apply_slop(size: u64, slop: &str) -> u64 {
    if slop.is_empty() {
        return size * 5 / 4;
    }

    let mut out = size;
    for term in slop.split('+') {
        let term = term.trim();
        if let Some(percent) = term.strip_suffix('%') {
            match percent.trim().parse::<u64>() {
                Ok(n) => out = out * (100 + n) / 100,
                Err(_) => warn!(term, "ignoring unparseable slop term"),
            }
        } else if let Some(bytes) = parse_human_size(term) {
            out += bytes;
        } else {
            warn!(term, "ignoring unparseable slop term");
        }
    }
    out
}

/// `512`, `1024K`, `64M`, `1G`, `2T`; suffix is case-insensitive, an
/// optional `iB`/`B` tail is accepted.
fn parse_human_size(term: &str) -> Option<u64> {
    let split = term
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(term.len());
    let (digits, suffix) = term.split_at(split);
    let value: u64 = digits.parse().ok()?;

    let suffix = suffix.to_ascii_lowercase();
    let suffix = suffix
        .strip_suffix("ib")
        .or_else(|| suffix.strip_suffix('b'))
        .unwrap_or(&suffix);
    let shift = match suffix {
        "" => 0,
        "k" => 10,
        "m" => 20,
        "g" => 30,
        "t" => 40,
        _ => return None,
    };
    value.checked_mul(1u64 << shift)
}

fn round_up(n: u64, align: u64) -> u64 {
    n.div_ceil(align) * align
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
