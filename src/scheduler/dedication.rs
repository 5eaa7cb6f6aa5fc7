//! Dedication rules: per-drive admission constraints written as a
//! comma-separated `key=value` conjunction. A rule only restricts; a drive
//! without one accepts any request.

use chrono::{DateTime, Timelike, Utc};

use crate::error::{code, MountqError, Result};
use crate::scheduler::queue::{AccessMode, VolumeRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Clause {
    Uid(i32),
    Gid(i32),
    /// Glob over the requesting client name.
    Name(String),
    /// Glob over the requesting client host.
    Host(String),
    /// Glob over the volume id.
    Vid(String),
    Mode(AccessMode),
    /// Admits requests queued at least this many seconds.
    MinAgeSecs(i64),
    /// UTC time-of-day window in minutes since midnight, inclusive on both
    /// ends. `start > end` wraps around midnight.
    TimeWindow { start: u32, end: u32 },
}

/// A parsed dedication rule. Parsing happens once, at dedicate time; matching
/// is a pure predicate with no allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedicationRule {
    text: String,
    clauses: Vec<Clause>,
}

impl DedicationRule {
    /// Parse rule text. Keys: uid, gid, name, host, vid, mode, age, timew.
    /// A `*` value drops the clause. Malformed text is rejected here, never
    /// at match time.
    pub fn parse(text: &str) -> Result<Self> {
        let mut clauses = Vec::new();
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part.split_once('=').ok_or_else(|| bad_rule(part))?;
            let value = value.trim();
            if value == "*" {
                continue;
            }
            let clause = match key.trim() {
                "uid" => Clause::Uid(value.parse().map_err(|_| bad_rule(part))?),
                "gid" => Clause::Gid(value.parse().map_err(|_| bad_rule(part))?),
                "name" => Clause::Name(value.to_string()),
                "host" => Clause::Host(value.to_string()),
                "vid" => Clause::Vid(value.to_string()),
                "mode" => Clause::Mode(parse_mode(value).ok_or_else(|| bad_rule(part))?),
                "age" => {
                    let secs: i64 = value.parse().map_err(|_| bad_rule(part))?;
                    if secs < 0 {
                        return Err(bad_rule(part));
                    }
                    Clause::MinAgeSecs(secs)
                }
                "timew" => {
                    let (start, end) = parse_window(value).ok_or_else(|| bad_rule(part))?;
                    Clause::TimeWindow { start, end }
                }
                _ => return Err(bad_rule(part)),
            };
            clauses.push(clause);
        }
        Ok(Self {
            text: text.to_string(),
            clauses,
        })
    }

    /// Original rule text, for queue listings.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Does this rule admit `req` at `now`? Short-circuits on the first
    /// failing clause.
    pub fn admits(&self, req: &VolumeRequest, now: DateTime<Utc>) -> bool {
        self.clauses.iter().all(|c| match c {
            Clause::Uid(uid) => req.client_uid == *uid,
            Clause::Gid(gid) => req.client_gid == *gid,
            Clause::Name(pat) => glob_match(pat, &req.client_name),
            Clause::Host(pat) => glob_match(pat, &req.client_host),
            Clause::Vid(pat) => glob_match(pat, &req.volume_id),
            Clause::Mode(mode) => req.mode == *mode,
            Clause::MinAgeSecs(secs) => (now - req.arrival).num_seconds() >= *secs,
            Clause::TimeWindow { start, end } => {
                let minute = now.hour() * 60 + now.minute();
                if start <= end {
                    minute >= *start && minute <= *end
                } else {
                    minute >= *start || minute <= *end
                }
            }
        })
    }
}

fn bad_rule(part: &str) -> MountqError {
    MountqError::validation(
        code::BAD_DEDICATION,
        format!("malformed dedication clause '{part}'"),
    )
}

fn parse_mode(value: &str) -> Option<AccessMode> {
    match value {
        "read" | "0" => Some(AccessMode::Read),
        "write" | "1" => Some(AccessMode::Write),
        _ => None,
    }
}

/// Parse `HH:MM-HH:MM` into minutes since midnight.
fn parse_window(value: &str) -> Option<(u32, u32)> {
    let (from, to) = value.split_once('-')?;
    Some((parse_hhmm(from)?, parse_hhmm(to)?))
}

fn parse_hhmm(value: &str) -> Option<u32> {
    let (h, m) = value.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Glob match with `*` (any run) and `?` (any single byte), iterative with
/// single-star backtracking.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<u8> = pattern.bytes().collect();
    let t: Vec<u8> = text.bytes().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}
