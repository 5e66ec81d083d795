use std::collections::BTreeMap;

use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;

use crate::error::{Error, Result};

// ── Labels ────────────────────────────────────────────────────────────────────

pub const LABEL_K8S_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_K8S_NAME_VALUE: &str = "k8s-triliovault";
pub const LABEL_K8S_PART_OF: &str = "app.kubernetes.io/part-of";
pub const LABEL_K8S_PART_OF_VALUE: &str = "k8s-triliovault";
pub const LABEL_TRILIO_KEY: &str = "trilio";
pub const LABEL_TVK_PREFLIGHT_VALUE: &str = "tvk-preflight";
pub const LABEL_PREFLIGHT_RUN_KEY: &str = "preflight-run";

/// Labels stamped on every resource a preflight run creates.
///
/// `run-key` is only present when the resources belong to a specific run;
/// passing `None` yields the base set used to match "every run".
pub fn preflight_labels(uid: Option<&str>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (LABEL_K8S_NAME.to_string(), LABEL_K8S_NAME_VALUE.to_string()),
        (LABEL_K8S_PART_OF.to_string(), LABEL_K8S_PART_OF_VALUE.to_string()),
        (
            LABEL_TRILIO_KEY.to_string(),
            LABEL_TVK_PREFLIGHT_VALUE.to_string(),
        ),
    ]);
    if let Some(uid) = uid.filter(|u| !u.is_empty()) {
        labels.insert(LABEL_PREFLIGHT_RUN_KEY.to_string(), uid.to_string());
    }
    labels
}

/// Render a label selector (`k=v,k=v`) matching [`preflight_labels`].
pub fn label_selector(uid: Option<&str>) -> String {
    preflight_labels(uid)
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

// ── Run identity ──────────────────────────────────────────────────────────────

pub const RUN_UID_LEN: usize = 6;

const LOWER_LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const LOWER_ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Character set used when generating a run identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UidCharset {
    #[default]
    Letters,
    Alphanumeric,
}

/// Generate a 6-character run identity straight from the OS random source.
///
/// Bytes at or above the largest multiple of the alphabet size are rejected
/// so every character is equally likely.
pub fn generate_run_uid(charset: UidCharset) -> Result<String> {
    let alphabet = match charset {
        UidCharset::Letters => LOWER_LETTERS,
        UidCharset::Alphanumeric => LOWER_ALPHANUMERIC,
    };
    let limit = 256 - (256 % alphabet.len());
    let mut uid = String::with_capacity(RUN_UID_LEN);
    let mut buf = [0u8; 16];
    while uid.len() < RUN_UID_LEN {
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| Error::config(format!("error generating run identity :: {e}")))?;
        for &b in &buf {
            if (b as usize) < limit && uid.len() < RUN_UID_LEN {
                uid.push(alphabet[b as usize % alphabet.len()] as char);
            }
        }
    }
    Ok(uid)
}

/// True if `uid` looks like something [`generate_run_uid`] could produce.
pub fn is_valid_run_uid(uid: &str) -> bool {
    uid.len() == RUN_UID_LEN
        && uid
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

// ── Output glyphs ─────────────────────────────────────────────────────────────

/// Success marker printed in front of passing checks.
pub fn check_mark() -> &'static str {
    if cfg!(windows) {
        "\u{2713}"
    } else {
        "\u{2714}"
    }
}

/// Failure marker printed in front of failing checks.
pub fn cross_mark() -> &'static str {
    if cfg!(windows) {
        "[X]"
    } else {
        "\u{274C}"
    }
}

// ── Versions ──────────────────────────────────────────────────────────────────

/// A `major.minor.patch` triple; pre-release and build suffixes are dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SemVer {
    /// Parse `1.2.3`, `v1.2.3`, `v1.27.4+k3s1` or `v1.27.4-eks-1234`.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim().trim_start_matches('v');
        let core = trimmed
            .split(|c: char| c == '-' || c == '+')
            .next()
            .unwrap_or_default();
        let mut parts = core.split('.');
        let mut next = |name: &str| -> Result<u64> {
            parts
                .next()
                .unwrap_or("0")
                .parse::<u64>()
                .map_err(|_| Error::config(format!("invalid {name} in version '{raw}'")))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}

impl std::fmt::Display for SemVer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Pull the last `vX.Y.Z` out of free-form tool output.
///
/// Warnings are usually printed ahead of the real version, so the last match
/// wins.
pub fn extract_version_from_string(output: &str) -> Result<String> {
    let re = Regex::new(r"v\d+\.\d+\.\d+").map_err(|e| Error::config(e.to_string()))?;
    re.find_iter(output)
        .last()
        .map(|m| m.as_str()[1..].to_string())
        .ok_or_else(|| Error::config("no version of type vX.Y.Z found in the string"))
}

/// `true` when `current >= minimum`.
pub fn meets_min_version(current: &str, minimum: &str) -> Result<bool> {
    Ok(SemVer::parse(current)? >= SemVer::parse(minimum)?)
}
