//! Isolate meta file parser
//!
//! Parses the flat `key:value` meta file written by isolate into `RunStats`.

use tracing::debug;

use super::{ExitKind, RunStats};

/// Parse isolate meta file content
///
/// `tool_output` is whatever isolate printed on its own stdout/stderr; it is
/// kept as the internal diagnostic message.
pub fn parse_meta(content: &str, tool_output: &str) -> RunStats {
    let mut stats = RunStats {
        internal_message: tool_output.to_string(),
        ..Default::default()
    };
    let mut status_str = "";

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "time" => {
                if let Ok(t) = value.parse::<f64>() {
                    stats.time_ms = (t * 1000.0).round() as u32;
                }
            }
            "time-wall" => {
                if let Ok(t) = value.parse::<f64>() {
                    stats.wall_time_ms = (t * 1000.0).round() as u32;
                }
            }
            "cg-mem" => {
                stats.memory_kb = value.parse().unwrap_or(0);
            }
            "exitcode" => {
                stats.exit_code = value.parse().unwrap_or(0);
            }
            "exitsig" => {
                stats.exit_signal = value.parse().ok();
            }
            "killed" => stats.killed = true,
            "message" => stats.message = value.to_string(),
            "status" => status_str = value,
            "cg-oom-killed" => stats.memory_limit_exceeded = true,
            "max-rss" | "csw-voluntary" | "csw-forced" | "cg-enabled" => {}
            other => debug!("Unknown isolate stat {}={}", other, value),
        }
    }

    stats.exit = match status_str {
        "TO" => ExitKind::TimeLimit,
        "SG" => ExitKind::Signaled,
        "RE" => ExitKind::RuntimeError,
        "XX" => ExitKind::SandboxError,
        "" if stats.exit_code == 0 => ExitKind::Normal,
        _ => ExitKind::RuntimeError,
    };

    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta_success() {
        let content = "time:0.015\ntime-wall:0.020\ncg-mem:1024\nmax-rss:900\nexitcode:0\n";
        let stats = parse_meta(content, "");

        assert_eq!(stats.time_ms, 15);
        assert_eq!(stats.wall_time_ms, 20);
        assert_eq!(stats.memory_kb, 1024);
        assert_eq!(stats.exit_code, 0);
        assert_eq!(stats.exit, ExitKind::Normal);
        assert!(stats.is_success());
    }

    #[test]
    fn test_parse_meta_wall_timeout() {
        let content = "time:0.100\ntime-wall:3.001\nkilled:1\nmessage:Time limit exceeded (wall clock)\nstatus:TO\n";
        let stats = parse_meta(content, "");

        assert_eq!(stats.exit, ExitKind::TimeLimit);
        assert!(stats.killed);
        assert!(stats.message.contains("wall"));
    }

    #[test]
    fn test_parse_meta_signal() {
        let content = "status:SG\nexitsig:11\nmessage:Caught fatal signal 11\n";
        let stats = parse_meta(content, "");

        assert_eq!(stats.exit, ExitKind::Signaled);
        assert_eq!(stats.exit_signal, Some(11));
    }

    #[test]
    fn test_parse_meta_oom_and_internal_error() {
        let oom = parse_meta("cg-mem:65536\ncg-oom-killed:1\nexitsig:9\nstatus:SG\n", "");
        assert!(oom.memory_limit_exceeded);
        assert!(!oom.is_success());

        let xx = parse_meta("status:XX\nmessage:execve failed\n", "Cannot run proxy");
        assert_eq!(xx.exit, ExitKind::SandboxError);
        assert_eq!(xx.internal_message, "Cannot run proxy");
    }

    #[test]
    fn test_parse_meta_nonzero_exit_without_status() {
        let stats = parse_meta("exitcode:3\n", "");
        assert_eq!(stats.exit, ExitKind::RuntimeError);
    }
}
