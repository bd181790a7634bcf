//! Isolate meta file parser
//!
//! Parses the `key:value` meta file isolate writes after every `--run` into
//! a typed [`MetaRecord`], applying the defaults and renames the rest of the
//! crate expects. Grounded on the teacher's own `engine::sandbox::meta`
//! parser, generalized to keep unknown fields and to support the round-trip
//! property via [`MetaRecord::to_kv_lines`].

use std::collections::BTreeMap;

use crate::config::signal_name;

/// Verbose execution status, after isolate's short codes and the
/// `cg-oom-killed` override have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaStatus {
    Ok,
    RuntimeError,
    TimedOut,
    Signaled,
    InternalError,
    OutOfMemory,
}

impl MetaStatus {
    fn from_short_code(code: &str) -> Self {
        match code {
            "RE" => MetaStatus::RuntimeError,
            "TO" => MetaStatus::TimedOut,
            "SG" => MetaStatus::Signaled,
            "XX" => MetaStatus::InternalError,
            _ => MetaStatus::Ok,
        }
    }

    fn short_code(self) -> &'static str {
        match self {
            MetaStatus::Ok => "OK",
            MetaStatus::RuntimeError => "RE",
            MetaStatus::TimedOut => "TO",
            MetaStatus::Signaled => "SG",
            MetaStatus::InternalError => "XX",
            // isolate itself never emits this one; OOM is our own override.
            MetaStatus::OutOfMemory => "OK",
        }
    }
}

/// Parsed, normalized isolate meta file contents.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaRecord {
    pub status: MetaStatus,
    pub exit_code: i32,
    pub exit_signal: i32,
    pub exit_signal_message: Option<String>,
    pub killed: bool,
    pub time: f64,
    pub wall_time: f64,
    pub max_rss: u64,
    pub cg_mem: u64,
    pub cg_oom_killed: bool,
    pub csw_forced: u64,
    pub csw_voluntary: u64,
    pub message: Option<String>,
    /// Unrecognized keys, preserved verbatim as strings.
    pub extra: BTreeMap<String, String>,
}

impl Default for MetaRecord {
    fn default() -> Self {
        Self {
            status: MetaStatus::Ok,
            exit_code: 0,
            exit_signal: 0,
            exit_signal_message: None,
            killed: false,
            time: 0.0,
            wall_time: 0.0,
            max_rss: 0,
            cg_mem: 0,
            cg_oom_killed: false,
            csw_forced: 0,
            csw_voluntary: 0,
            message: None,
            extra: BTreeMap::new(),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes")
}

/// Parses the content of an isolate meta file. Malformed lines (no colon)
/// are skipped; empty lines are ignored; unknown keys are kept verbatim in
/// [`MetaRecord::extra`].
pub fn parse_meta(content: &str) -> MetaRecord {
    let mut meta = MetaRecord::default();
    let mut status_code: Option<String> = None;

    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        match key {
            "status" => status_code = Some(value.to_string()),
            "exitcode" => meta.exit_code = value.parse().unwrap_or(0),
            "exitsig" => {
                meta.exit_signal = value.parse().unwrap_or(0);
                meta.exit_signal_message = Some(signal_name(meta.exit_signal));
            }
            "killed" => meta.killed = parse_bool(value),
            "time" => meta.time = value.parse().unwrap_or(0.0),
            "time-wall" => meta.wall_time = value.parse().unwrap_or(0.0),
            "max-rss" => meta.max_rss = value.parse().unwrap_or(0),
            "cg-mem" => meta.cg_mem = value.parse().unwrap_or(0),
            "cg-oom-killed" => meta.cg_oom_killed = parse_bool(value),
            "cg-time" | "cg-wall-time" => {
                // isolate also emits these under --cg; not part of the
                // consumer-facing vocabulary, kept as extras for debugging.
                meta.extra.insert(key.to_string(), value.to_string());
            }
            "csw-forced" => meta.csw_forced = value.parse().unwrap_or(0),
            "csw-voluntary" => meta.csw_voluntary = value.parse().unwrap_or(0),
            "message" => meta.message = Some(value.to_string()),
            _ => {
                meta.extra.insert(key.to_string(), value.to_string());
            }
        }
    }

    meta.status = match status_code {
        Some(code) => MetaStatus::from_short_code(&code),
        None if meta.exit_code != 0 => MetaStatus::RuntimeError,
        None => MetaStatus::Ok,
    };

    if meta.cg_oom_killed {
        meta.status = MetaStatus::OutOfMemory;
    }

    meta
}

impl MetaRecord {
    /// Encodes this record back to `key:value` lines, inverse of
    /// [`parse_meta`] for the fields isolate itself would write (fields at
    /// their zero/default value are omitted, matching isolate's own meta
    /// file which only ever writes keys that apply).
    pub fn to_kv_lines(&self) -> String {
        let mut lines = Vec::new();

        if !matches!(self.status, MetaStatus::Ok) {
            lines.push(format!("status:{}", self.status.short_code()));
        }
        lines.push(format!("exitcode:{}", self.exit_code));
        if self.exit_signal != 0 {
            lines.push(format!("exitsig:{}", self.exit_signal));
        }
        if self.killed {
            lines.push("killed:1".to_string());
        }
        lines.push(format!("time:{:.3}", self.time));
        lines.push(format!("time-wall:{:.3}", self.wall_time));
        if self.max_rss != 0 {
            lines.push(format!("max-rss:{}", self.max_rss));
        }
        if self.cg_mem != 0 {
            lines.push(format!("cg-mem:{}", self.cg_mem));
        }
        if self.cg_oom_killed {
            lines.push("cg-oom-killed:1".to_string());
        }
        if self.csw_forced != 0 {
            lines.push(format!("csw-forced:{}", self.csw_forced));
        }
        if self.csw_voluntary != 0 {
            lines.push(format!("csw-voluntary:{}", self.csw_voluntary));
        }
        if let Some(message) = &self.message {
            lines.push(format!("message:{message}"));
        }
        for (key, value) in &self.extra {
            lines.push(format!("{key}:{value}"));
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_of_defaults() {
        let default = MetaRecord::default();
        let encoded = default.to_kv_lines();
        let parsed = parse_meta(&encoded);
        assert_eq!(parsed, default);
    }

    #[test]
    fn parses_basic_success() {
        let content = "time:0.015\ntime-wall:0.020\ncg-mem:1024\nexitcode:0\n";
        let meta = parse_meta(content);
        assert_eq!(meta.time, 0.015);
        assert_eq!(meta.wall_time, 0.020);
        assert_eq!(meta.cg_mem, 1024);
        assert_eq!(meta.exit_code, 0);
        assert_eq!(meta.status, MetaStatus::Ok);
    }

    #[test]
    fn parses_timeout() {
        let content = "time:1.000\nstatus:TO\n";
        let meta = parse_meta(content);
        assert_eq!(meta.status, MetaStatus::TimedOut);
    }

    #[test]
    fn parses_signal_and_message() {
        let content = "status:SG\nexitsig:11\n";
        let meta = parse_meta(content);
        assert_eq!(meta.status, MetaStatus::Signaled);
        assert_eq!(meta.exit_signal, 11);
        assert_eq!(meta.exit_signal_message.as_deref(), Some("SIGSEGV"));
    }

    #[test]
    fn cg_oom_killed_overrides_status() {
        let content = "status:OK\ncg-oom-killed:1\n";
        let meta = parse_meta(content);
        assert_eq!(meta.status, MetaStatus::OutOfMemory);
        assert!(meta.cg_oom_killed);
    }

    #[test]
    fn unknown_keys_are_preserved_and_malformed_lines_skipped() {
        let content = "exitcode:0\nsome-new-key:42\nthis line has no colon\n\n";
        let meta = parse_meta(content);
        assert_eq!(meta.extra.get("some-new-key").map(String::as_str), Some("42"));
    }

    #[test]
    fn missing_status_with_nonzero_exit_is_runtime_error() {
        let content = "exitcode:1\n";
        let meta = parse_meta(content);
        assert_eq!(meta.status, MetaStatus::RuntimeError);
    }
}
