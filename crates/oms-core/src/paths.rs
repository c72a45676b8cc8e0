//! Filesystem rendezvous path codec (spec §4.1).
//!
//! Every coordination fact between peer instances is carried entirely by a
//! *file name* under the job-control root. This module is the only place
//! that knows those name grammars; every other component depends solely on
//! the typed structs here, never on raw strings. Decoding is conservative:
//! a name that doesn't match a family's grammar returns `Err`, and callers
//! are expected to skip (not panic on) malformed names — per spec §7, a
//! malformed rendezvous file name is silently ignored.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stamp::{Stamp, StampError};

pub const SEP: &str = "-#-";

pub const QUEUE_DIR: &str = "queue";
pub const ACTIVE_DIR: &str = "active";
pub const HISTORY_DIR: &str = "history";
pub const STATE_DIR: &str = "state";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathCodecError {
    #[error("malformed name '{0}'")]
    Malformed(String),
    #[error("bad timestamp in '{name}': {source}")]
    BadStamp { name: String, source: StampError },
    #[error("bad integer field in '{0}'")]
    BadInt(String),
}

fn tokens(name: &str) -> Vec<&str> {
    name.split(SEP).collect()
}

fn parse_stamp(name: &str, tok: &str) -> Result<Stamp, PathCodecError> {
    Stamp::parse(tok).map_err(|source| PathCodecError::BadStamp {
        name: name.to_string(),
        source,
    })
}

fn parse_u32(name: &str, tok: &str) -> Result<u32, PathCodecError> {
    tok.parse::<u32>()
        .map_err(|_| PathCodecError::BadInt(name.to_string()))
}

fn parse_u64(name: &str, tok: &str) -> Result<u64, PathCodecError> {
    tok.parse::<u64>()
        .map_err(|_| PathCodecError::BadInt(name.to_string()))
}

fn parse_i64(name: &str, tok: &str) -> Result<i64, PathCodecError> {
    tok.parse::<i64>()
        .map_err(|_| PathCodecError::BadInt(name.to_string()))
}

/// Strip a fixed suffix (e.g. `.json`) off the last token, returning the
/// bare token plus an error if the suffix isn't present.
fn strip_suffix<'a>(
    name: &str,
    last: &'a str,
    suffix: &str,
) -> Result<&'a str, PathCodecError> {
    last.strip_suffix(suffix)
        .ok_or_else(|| PathCodecError::Malformed(name.to_string()))
}

// ---------------------------------------------------------------------------
// queue / active / history job files
// ---------------------------------------------------------------------------

/// `<subStamp>-#-<instance>-#-<model>-#-<digest>-#-<runStamp-or-_>-#-cpu-#-<cpu>-#-mem-#-<mem>-#-<pos>.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueName {
    pub sub_stamp: Stamp,
    pub instance: String,
    pub model: String,
    pub digest: String,
    pub run_stamp: Option<Stamp>,
    pub cpu: u32,
    pub mem: u64,
    pub position: u32,
}

impl QueueName {
    pub fn encode(&self) -> String {
        let run_stamp = match &self.run_stamp {
            Some(s) => s.as_str().to_string(),
            None => "_".to_string(),
        };
        format!(
            "{sub}{sep}{inst}{sep}{model}{sep}{digest}{sep}{run}{sep}cpu{sep}{cpu}{sep}mem{sep}{mem}{sep}{pos}.json",
            sub = self.sub_stamp,
            sep = SEP,
            inst = self.instance,
            model = self.model,
            digest = self.digest,
            run = run_stamp,
            cpu = self.cpu,
            mem = self.mem,
            pos = self.position,
        )
    }

    pub fn decode(name: &str) -> Result<Self, PathCodecError> {
        let toks = tokens(name);
        if toks.len() != 10 || toks[5] != "cpu" || toks[7] != "mem" {
            return Err(PathCodecError::Malformed(name.to_string()));
        }
        let position_tok = strip_suffix(name, toks[9], ".json")?;
        let run_stamp = if toks[4] == "_" {
            None
        } else {
            Some(parse_stamp(name, toks[4])?)
        };
        Ok(QueueName {
            sub_stamp: parse_stamp(name, toks[0])?,
            instance: toks[1].to_string(),
            model: toks[2].to_string(),
            digest: toks[3].to_string(),
            run_stamp,
            cpu: parse_u32(name, toks[6])?,
            mem: parse_u64(name, toks[8])?,
            position: parse_u32(name, position_tok)?,
        })
    }
}

/// Same grammar as [`QueueName`] plus a trailing `-#-<pid>`, under `active/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveName {
    pub sub_stamp: Stamp,
    pub instance: String,
    pub model: String,
    pub digest: String,
    pub run_stamp: Option<Stamp>,
    pub cpu: u32,
    pub mem: u64,
    pub position: u32,
    pub pid: u32,
}

impl ActiveName {
    pub fn encode(&self) -> String {
        let run_stamp = match &self.run_stamp {
            Some(s) => s.as_str().to_string(),
            None => "_".to_string(),
        };
        format!(
            "{sub}{sep}{inst}{sep}{model}{sep}{digest}{sep}{run}{sep}cpu{sep}{cpu}{sep}mem{sep}{mem}{sep}{pos}{sep}{pid}.json",
            sub = self.sub_stamp,
            sep = SEP,
            inst = self.instance,
            model = self.model,
            digest = self.digest,
            run = run_stamp,
            cpu = self.cpu,
            mem = self.mem,
            pos = self.position,
            pid = self.pid,
        )
    }

    pub fn decode(name: &str) -> Result<Self, PathCodecError> {
        let toks = tokens(name);
        if toks.len() != 11 || toks[5] != "cpu" || toks[7] != "mem" {
            return Err(PathCodecError::Malformed(name.to_string()));
        }
        let pid_tok = strip_suffix(name, toks[10], ".json")?;
        let run_stamp = if toks[4] == "_" {
            None
        } else {
            Some(parse_stamp(name, toks[4])?)
        };
        Ok(ActiveName {
            sub_stamp: parse_stamp(name, toks[0])?,
            instance: toks[1].to_string(),
            model: toks[2].to_string(),
            digest: toks[3].to_string(),
            run_stamp,
            cpu: parse_u32(name, toks[6])?,
            mem: parse_u64(name, toks[8])?,
            position: parse_u32(name, toks[9])?,
            pid: parse_u32(name, pid_tok)?,
        })
    }

    pub fn from_queue(q: QueueName, pid: u32) -> Self {
        ActiveName {
            sub_stamp: q.sub_stamp,
            instance: q.instance,
            model: q.model,
            digest: q.digest,
            run_stamp: q.run_stamp,
            cpu: q.cpu,
            mem: q.mem,
            position: q.position,
            pid,
        }
    }
}

/// `<subStamp>-#-<instance>-#-<model>-#-<digest>-#-<runStamp>-#-<status>.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryName {
    pub sub_stamp: Stamp,
    pub instance: String,
    pub model: String,
    pub digest: String,
    pub run_stamp: Stamp,
    pub status: String,
}

impl HistoryName {
    pub fn encode(&self) -> String {
        format!(
            "{sub}{sep}{inst}{sep}{model}{sep}{digest}{sep}{run}{sep}{status}.json",
            sub = self.sub_stamp,
            sep = SEP,
            inst = self.instance,
            model = self.model,
            digest = self.digest,
            run = self.run_stamp,
            status = self.status,
        )
    }

    pub fn decode(name: &str) -> Result<Self, PathCodecError> {
        let toks = tokens(name);
        if toks.len() != 6 {
            return Err(PathCodecError::Malformed(name.to_string()));
        }
        let status_tok = strip_suffix(name, toks[5], ".json")?;
        Ok(HistoryName {
            sub_stamp: parse_stamp(name, toks[0])?,
            instance: toks[1].to_string(),
            model: toks[2].to_string(),
            digest: toks[3].to_string(),
            run_stamp: parse_stamp(name, toks[4])?,
            status: status_tok.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// state/ directory families
// ---------------------------------------------------------------------------

/// `oms-#-<instance>-#-<timestamp>-#-<unixMillis>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatName {
    pub instance: String,
    pub timestamp: Stamp,
    pub unix_millis: i64,
}

impl HeartbeatName {
    pub fn encode(&self) -> String {
        format!(
            "oms{sep}{inst}{sep}{ts}{sep}{ms}",
            sep = SEP,
            inst = self.instance,
            ts = self.timestamp,
            ms = self.unix_millis,
        )
    }

    pub fn decode(name: &str) -> Result<Self, PathCodecError> {
        let toks = tokens(name);
        if toks.len() != 4 || toks[0] != "oms" {
            return Err(PathCodecError::Malformed(name.to_string()));
        }
        Ok(HeartbeatName {
            instance: toks[1].to_string(),
            timestamp: parse_stamp(name, toks[2])?,
            unix_millis: parse_i64(name, toks[3])?,
        })
    }
}

pub const GLOBAL_PAUSE_NAME: &str = "jobs.queue.all.paused";

/// `jobs.queue-#-<instance>-#-paused`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancePauseName {
    pub instance: String,
}

impl InstancePauseName {
    pub fn encode(&self) -> String {
        format!("jobs.queue{sep}{inst}{sep}paused", sep = SEP, inst = self.instance)
    }

    pub fn decode(name: &str) -> Result<Self, PathCodecError> {
        let toks = tokens(name);
        if toks.len() != 3 || toks[0] != "jobs.queue" || toks[2] != "paused" {
            return Err(PathCodecError::Malformed(name.to_string()));
        }
        Ok(InstancePauseName {
            instance: toks[1].to_string(),
        })
    }
}

macro_rules! comp_ts_family {
    ($name:ident, $tag:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name {
            pub server: String,
            pub timestamp: Stamp,
        }

        impl $name {
            pub fn encode(&self) -> String {
                format!(
                    "{tag}{sep}{name}{sep}{ts}",
                    tag = $tag,
                    sep = SEP,
                    name = self.server,
                    ts = self.timestamp,
                )
            }

            pub fn decode(name: &str) -> Result<Self, PathCodecError> {
                let toks = tokens(name);
                if toks.len() != 3 || toks[0] != $tag {
                    return Err(PathCodecError::Malformed(name.to_string()));
                }
                Ok($name {
                    server: toks[1].to_string(),
                    timestamp: parse_stamp(name, toks[2])?,
                })
            }
        }
    };
}

comp_ts_family!(CompStartName, "comp-start");
comp_ts_family!(CompStopName, "comp-stop");
comp_ts_family!(CompErrorName, "comp-error");

/// `comp-ready-#-<name>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompReadyName {
    pub server: String,
}

impl CompReadyName {
    pub fn encode(&self) -> String {
        format!("comp-ready{sep}{name}", sep = SEP, name = self.server)
    }

    pub fn decode(name: &str) -> Result<Self, PathCodecError> {
        let toks = tokens(name);
        if toks.len() != 2 || toks[0] != "comp-ready" {
            return Err(PathCodecError::Malformed(name.to_string()));
        }
        Ok(CompReadyName {
            server: toks[1].to_string(),
        })
    }
}

/// `comp-used-#-<name>-#-<subStamp>-#-<instance>-#-cpu-#-<cpu>-#-mem-#-<mem>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompUsedName {
    pub server: String,
    pub sub_stamp: Stamp,
    pub instance: String,
    pub cpu: u32,
    pub mem: u64,
}

impl CompUsedName {
    pub fn encode(&self) -> String {
        format!(
            "comp-used{sep}{name}{sep}{sub}{sep}{inst}{sep}cpu{sep}{cpu}{sep}mem{sep}{mem}",
            sep = SEP,
            name = self.server,
            sub = self.sub_stamp,
            inst = self.instance,
            cpu = self.cpu,
            mem = self.mem,
        )
    }

    pub fn decode(name: &str) -> Result<Self, PathCodecError> {
        let toks = tokens(name);
        if toks.len() != 8 || toks[0] != "comp-used" || toks[4] != "cpu" || toks[6] != "mem" {
            return Err(PathCodecError::Malformed(name.to_string()));
        }
        Ok(CompUsedName {
            server: toks[1].to_string(),
            sub_stamp: parse_stamp(name, toks[2])?,
            instance: toks[3].to_string(),
            cpu: parse_u32(name, toks[5])?,
            mem: parse_u64(name, toks[7])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskStatus {
    Ok,
    Over,
}

impl fmt::Display for DiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskStatus::Ok => write!(f, "ok"),
            DiskStatus::Over => write!(f, "over"),
        }
    }
}

impl std::str::FromStr for DiskStatus {
    type Err = PathCodecError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(DiskStatus::Ok),
            "over" => Ok(DiskStatus::Over),
            _ => Err(PathCodecError::Malformed(s.to_string())),
        }
    }
}

/// `disk-#-<instance>-#-size-#-<bytes>-#-status-#-<ok|over>-#-<timestamp>-#-<unixMillis>.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUseName {
    pub instance: String,
    pub bytes: u64,
    pub status: DiskStatus,
    pub timestamp: Stamp,
    pub unix_millis: i64,
}

impl DiskUseName {
    pub fn encode(&self) -> String {
        format!(
            "disk{sep}{inst}{sep}size{sep}{bytes}{sep}status{sep}{status}{sep}{ts}{sep}{ms}.json",
            sep = SEP,
            inst = self.instance,
            bytes = self.bytes,
            status = self.status,
            ts = self.timestamp,
            ms = self.unix_millis,
        )
    }

    pub fn decode(name: &str) -> Result<Self, PathCodecError> {
        let toks = tokens(name);
        if toks.len() != 8 || toks[0] != "disk" || toks[2] != "size" || toks[4] != "status" {
            return Err(PathCodecError::Malformed(name.to_string()));
        }
        let ms_tok = strip_suffix(name, toks[7], ".json")?;
        Ok(DiskUseName {
            instance: toks[1].to_string(),
            bytes: parse_u64(name, toks[3])?,
            status: toks[5]
                .parse()
                .map_err(|_| PathCodecError::Malformed(name.to_string()))?,
            timestamp: parse_stamp(name, toks[6])?,
            unix_millis: parse_i64(name, ms_tok)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_queue() -> QueueName {
        QueueName {
            sub_stamp: Stamp::parse("2022_08_17_10_00_00_000").unwrap(),
            instance: "_4040".to_string(),
            model: "M".to_string(),
            digest: "D".to_string(),
            run_stamp: None,
            cpu: 1,
            mem: 0,
            position: 20220817,
        }
    }

    #[test]
    fn queue_roundtrip() {
        let q = sample_queue();
        let encoded = q.encode();
        assert_eq!(QueueName::decode(&encoded).unwrap(), q);
    }

    #[test]
    fn queue_roundtrip_with_run_stamp() {
        let mut q = sample_queue();
        q.run_stamp = Some(Stamp::parse("2022_08_17_10_00_01_500").unwrap());
        let encoded = q.encode();
        assert_eq!(QueueName::decode(&encoded).unwrap(), q);
    }

    #[test]
    fn active_roundtrip() {
        let a = ActiveName::from_queue(sample_queue(), 99999);
        let encoded = a.encode();
        assert_eq!(ActiveName::decode(&encoded).unwrap(), a);
    }

    #[test]
    fn history_roundtrip() {
        let h = HistoryName {
            sub_stamp: Stamp::parse("2022_08_17_10_00_00_000").unwrap(),
            instance: "_4040".to_string(),
            model: "M".to_string(),
            digest: "D".to_string(),
            run_stamp: Stamp::parse("2022_08_17_10_00_05_000").unwrap(),
            status: "success".to_string(),
        };
        let encoded = h.encode();
        assert_eq!(HistoryName::decode(&encoded).unwrap(), h);
    }

    #[test]
    fn heartbeat_roundtrip() {
        let h = HeartbeatName {
            instance: "_4040".to_string(),
            timestamp: Stamp::now(),
            unix_millis: 1_660_000_000_000,
        };
        let encoded = h.encode();
        assert_eq!(HeartbeatName::decode(&encoded).unwrap(), h);
    }

    #[test]
    fn instance_pause_roundtrip() {
        let p = InstancePauseName {
            instance: "_8080".to_string(),
        };
        assert_eq!(InstancePauseName::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn comp_ready_roundtrip() {
        let r = CompReadyName {
            server: "s1".to_string(),
        };
        assert_eq!(CompReadyName::decode(&r.encode()).unwrap(), r);
    }

    #[test]
    fn comp_start_roundtrip() {
        let s = CompStartName {
            server: "s1".to_string(),
            timestamp: Stamp::now(),
        };
        assert_eq!(CompStartName::decode(&s.encode()).unwrap(), s);
    }

    #[test]
    fn comp_used_roundtrip() {
        let u = CompUsedName {
            server: "s1".to_string(),
            sub_stamp: Stamp::now(),
            instance: "_4040".to_string(),
            cpu: 4,
            mem: 1024,
        };
        assert_eq!(CompUsedName::decode(&u.encode()).unwrap(), u);
    }

    #[test]
    fn disk_use_roundtrip() {
        let d = DiskUseName {
            instance: "_4040".to_string(),
            bytes: 12345,
            status: DiskStatus::Over,
            timestamp: Stamp::now(),
            unix_millis: 1_660_000_000_123,
        };
        assert_eq!(DiskUseName::decode(&d.encode()).unwrap(), d);
    }

    #[test]
    fn malformed_names_are_rejected_not_panicking() {
        assert!(QueueName::decode("not-a-valid-name").is_err());
        assert!(HeartbeatName::decode("oms-#-only-two").is_err());
        assert!(CompReadyName::decode("comp-start-#-x").is_err());
    }

    #[test]
    fn global_pause_name_is_a_bare_constant() {
        assert_eq!(GLOBAL_PAUSE_NAME, "jobs.queue.all.paused");
    }

    fn arb_stamp() -> impl Strategy<Value = Stamp> {
        (0u32..9999, 0u32..99, 0u32..99, 0u32..99, 0u32..99, 0u32..99, 0u32..999).prop_map(
            |(y, mo, d, h, mi, s, ms)| {
                Stamp::parse(&format!(
                    "{y:04}_{mo:02}_{d:02}_{h:02}_{mi:02}_{s:02}_{ms:03}"
                ))
                .unwrap()
            },
        )
    }

    fn arb_token() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9]{1,10}"
    }

    fn arb_queue_name() -> impl Strategy<Value = QueueName> {
        (
            arb_stamp(),
            arb_token(),
            arb_token(),
            arb_token(),
            proptest::option::of(arb_stamp()),
            0u32..10_000,
            0u64..10_000_000,
            0u32..100_000_000,
        )
            .prop_map(
                |(sub_stamp, instance, model, digest, run_stamp, cpu, mem, position)| QueueName {
                    sub_stamp,
                    instance,
                    model,
                    digest,
                    run_stamp,
                    cpu,
                    mem,
                    position,
                },
            )
    }

    proptest! {
        /// spec §8: decode(encode(t)) == t for every syntactically valid
        /// component tuple.
        #[test]
        fn queue_name_roundtrips_through_encode_decode(q in arb_queue_name()) {
            let encoded = q.encode();
            prop_assert_eq!(QueueName::decode(&encoded).unwrap(), q);
        }

        /// spec §8: encode(decode(s)) == s for every string that decodes
        /// successfully — round-tripping the other direction too.
        #[test]
        fn queue_name_encode_is_stable_under_decode(q in arb_queue_name()) {
            let encoded = q.encode();
            let decoded = QueueName::decode(&encoded).unwrap();
            prop_assert_eq!(decoded.encode(), encoded);
        }

        #[test]
        fn active_name_roundtrips_through_encode_decode(q in arb_queue_name(), pid in 0u32..1_000_000) {
            let a = ActiveName::from_queue(q, pid);
            let encoded = a.encode();
            prop_assert_eq!(ActiveName::decode(&encoded).unwrap(), a);
        }
    }
}
