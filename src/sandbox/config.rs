//! Run configuration for a single sandboxed command

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A directory rule mounted into the box
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Directory {
    /// Path inside the box
    #[serde(rename = "in")]
    pub dir_in: String,
    /// Host path (defaults to the same path as `dir_in`)
    #[serde(default)]
    pub out: String,
    /// isolate mount options such as `rw`, `noexec` or `maybe`
    #[serde(default)]
    pub opts: String,
    /// Remove a default mount instead of adding one
    #[serde(default)]
    pub removes: bool,
    /// Pass `dir_in` through without an `=out` part
    #[serde(default)]
    pub verbatim: bool,
}

impl Directory {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            dir_in: path.into(),
            ..Default::default()
        }
    }

    pub fn with_opts(mut self, opts: impl Into<String>) -> Self {
        self.opts = opts.into();
        self
    }

    /// Render as an isolate `--dir` flag
    pub fn to_flag(&self) -> String {
        if self.removes {
            return format!("--dir={}=", self.dir_in);
        }
        let mut flag = format!("--dir={}", self.dir_in);
        if self.out.is_empty() {
            if !self.verbatim {
                flag.push('=');
                flag.push_str(&self.dir_in);
            }
        } else {
            flag.push('=');
            flag.push_str(&self.out);
        }
        if !self.opts.is_empty() {
            flag.push(':');
            flag.push_str(&self.opts);
        }
        flag
    }
}

/// Stdio wiring, limits, environment and mounts for one run
///
/// Unset stdio paths are wired to `/dev/null`. Zero limits mean "not set".
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub stderr_to_stdout: bool,

    pub memory_limit_kb: u32,
    pub stack_limit_kb: u32,
    pub time_limit_ms: u32,
    pub wall_time_limit_ms: u32,
    /// 0 lets the program spawn any number of processes
    pub max_procs: u32,

    pub inherit_env: bool,
    pub env_to_inherit: Vec<String>,
    pub env_to_set: HashMap<String, String>,

    pub directories: Vec<Directory>,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stdin(mut self, path: impl Into<String>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn with_stdout(mut self, path: impl Into<String>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn with_stderr(mut self, path: impl Into<String>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    pub fn with_stderr_to_stdout(mut self, value: bool) -> Self {
        self.stderr_to_stdout = value;
        self
    }

    pub fn with_memory_limit(mut self, kb: u32) -> Self {
        self.memory_limit_kb = kb;
        self
    }

    pub fn with_stack_limit(mut self, kb: u32) -> Self {
        self.stack_limit_kb = kb;
        self
    }

    pub fn with_time_limit(mut self, ms: u32) -> Self {
        self.time_limit_ms = ms;
        self
    }

    pub fn with_wall_time_limit(mut self, ms: u32) -> Self {
        self.wall_time_limit_ms = ms;
        self
    }

    pub fn with_max_procs(mut self, procs: u32) -> Self {
        self.max_procs = procs;
        self
    }

    pub fn with_inherit_env(mut self, value: bool) -> Self {
        self.inherit_env = value;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env_to_set.extend(env);
        self
    }

    pub fn with_directories(mut self, dirs: impl IntoIterator<Item = Directory>) -> Self {
        self.directories.extend(dirs);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_flags() {
        assert_eq!(Directory::new("/etc").to_flag(), "--dir=/etc=/etc");
        assert_eq!(
            Directory::new("/go").with_opts("rw:maybe").to_flag(),
            "--dir=/go=/go:rw:maybe"
        );

        let verbatim = Directory {
            dir_in: "/tmp".into(),
            verbatim: true,
            opts: "tmp".into(),
            ..Default::default()
        };
        assert_eq!(verbatim.to_flag(), "--dir=/tmp:tmp");

        let removes = Directory {
            dir_in: "/lib64".into(),
            removes: true,
            ..Default::default()
        };
        assert_eq!(removes.to_flag(), "--dir=/lib64=");
    }
}
