//! Language configuration for compilation and execution
//!
//! Languages are declarative: a compile command template, a run command,
//! the file names used inside the box, extra mounts and environment. The
//! registry is an ordinary value owned by whoever needs it (the grader, the
//! RPC server, tests), so several registries can live in one process.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::sandbox::Directory;

/// Token in a compile command that expands to the list of source files
pub const MAGIC_REPLACE: &str = "<REPLACE>";

/// Configuration for a supported programming language
#[derive(Debug, Clone, Deserialize)]
pub struct Language {
    /// Internal name, filled from the TOML table key
    #[serde(skip)]
    pub name: String,
    pub printable_name: String,
    #[serde(default)]
    pub extensions: Vec<String>,
    pub compiled: bool,
    #[serde(default)]
    pub disabled: bool,

    /// Compile command template (empty for interpreted languages)
    #[serde(default)]
    pub compile_command: Vec<String>,
    pub run_command: Vec<String>,

    /// Where the source is written inside the box
    pub source_name: String,
    /// Where the runnable artifact lives inside the box
    pub compiled_name: String,

    #[serde(default)]
    pub mounts: Vec<Directory>,

    #[serde(default)]
    pub build_env: HashMap<String, String>,
    #[serde(default)]
    pub run_env: HashMap<String, String>,
    /// Added at both compile time and run time; the specific maps win
    #[serde(default)]
    pub common_env: HashMap<String, String>,

    #[serde(default)]
    aliases: Vec<String>,
}

impl Language {
    /// Environment for the compile step
    pub fn build_env(&self) -> HashMap<String, String> {
        let mut env = self.common_env.clone();
        env.extend(self.build_env.clone());
        env
    }

    /// Environment for the run step
    pub fn run_env(&self) -> HashMap<String, String> {
        let mut env = self.common_env.clone();
        env.extend(self.run_env.clone());
        env
    }

    /// Expand the compile command, splicing `sources` in place of the magic token
    pub fn compile_argv(&self, sources: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.compile_command.len() + sources.len());
        let mut replaced = false;
        for arg in &self.compile_command {
            if arg == MAGIC_REPLACE && !replaced {
                argv.extend(sources.iter().cloned());
                replaced = true;
            } else {
                argv.push(arg.clone());
            }
        }
        if !replaced {
            warn!(language = %self.name, "Compile command has no {} token", MAGIC_REPLACE);
        }
        argv
    }

    fn matches_extension(&self, ext: &str) -> bool {
        self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }
}

/// Registry of languages keyed by internal name
#[derive(Debug, Clone, Default)]
pub struct Languages {
    langs: BTreeMap<String, Arc<Language>>,
    aliases: HashMap<String, String>,
}

impl Languages {
    /// Languages bundled with the binary
    pub fn embedded() -> anyhow::Result<Self> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
        Self::from_toml_str(content)
    }

    /// Load a language file from disk
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read language file {:?}", path))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw: BTreeMap<String, Language> =
            toml::from_str(content).context("Invalid language configuration")?;

        let mut registry = Self::default();
        for (name, mut lang) in raw {
            let name = name.to_lowercase();
            if lang.run_command.is_empty() {
                anyhow::bail!("Language {} has an empty run command", name);
            }
            if lang.compiled && lang.compile_command.is_empty() {
                anyhow::bail!("Compiled language {} has no compile command", name);
            }
            lang.name = name.clone();
            for alias in &lang.aliases {
                registry.aliases.insert(alias.to_lowercase(), name.clone());
            }
            registry.langs.insert(name, Arc::new(lang));
        }
        Ok(registry)
    }

    /// Look up an enabled language by name or alias
    pub fn get(&self, name: &str) -> Option<Arc<Language>> {
        let key = name.to_lowercase();
        let key = self.aliases.get(&key).unwrap_or(&key);
        self.langs.get(key).filter(|l| !l.disabled).cloned()
    }

    /// Look up an enabled language by the extension of `filename`
    ///
    /// When several languages share an extension the first one in name order wins.
    pub fn by_filename(&self, filename: &str) -> Option<Arc<Language>> {
        let ext = Path::new(filename).extension()?.to_str()?;
        let ext = format!(".{}", ext);
        self.langs
            .values()
            .find(|l| !l.disabled && l.matches_extension(&ext))
            .cloned()
    }

    /// Names of all enabled languages
    pub fn enabled(&self) -> Vec<String> {
        self.langs
            .values()
            .filter(|l| !l.disabled)
            .map(|l| l.name.clone())
            .collect()
    }

    /// Resolve every command to an absolute path on this host and disable the
    /// languages whose toolchain is missing. Returns the disabled names.
    pub fn disable_unavailable(&mut self) -> Vec<String> {
        let mut disabled = Vec::new();
        for (name, lang) in self.langs.iter_mut() {
            if lang.disabled {
                continue;
            }
            let mut updated = (**lang).clone();
            let resolved = if updated.compiled {
                resolve_command(&updated.compile_command).map(|cmd| updated.compile_command = cmd)
            } else {
                resolve_command(&updated.run_command).map(|cmd| updated.run_command = cmd)
            };
            match resolved {
                Ok(()) => debug!(language = %name, "Language toolchain resolved"),
                Err(e) => {
                    warn!(language = %name, "Disabling language: {}", e);
                    updated.disabled = true;
                    disabled.push(name.clone());
                }
            }
            *lang = Arc::new(updated);
        }
        disabled
    }
}

/// Resolve `argv[0]` to an absolute, symlink-free path
///
/// Commands that already point inside the box are returned unchanged.
pub fn resolve_command(argv: &[String]) -> anyhow::Result<Vec<String>> {
    let Some(program) = argv.first() else {
        anyhow::bail!("Empty command");
    };
    if program.starts_with("/box") {
        return Ok(argv.to_vec());
    }

    let found = which::which(program).with_context(|| format!("{} not found in PATH", program))?;
    let canonical = std::fs::canonicalize(&found)
        .with_context(|| format!("Failed to resolve symlinks for {:?}", found))?;

    let mut resolved = Vec::with_capacity(argv.len());
    resolved.push(canonical.to_string_lossy().into_owned());
    resolved.extend(argv[1..].iter().cloned());
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[c]
printable_name = "C"
extensions = [".c"]
compiled = true
compile_command = ["gcc", "-O2", "<REPLACE>", "-o", "/box/output"]
run_command = ["/box/output"]
source_name = "/box/main.c"
compiled_name = "/box/output"
common_env = { LANG = "C", MODE = "common" }
build_env = { MODE = "build" }

[python3]
printable_name = "Python 3"
extensions = [".py"]
compiled = false
run_command = ["python3", "/box/main.py"]
source_name = "/box/main.py"
compiled_name = "/box/main.py"
aliases = ["py", "python"]

[java]
printable_name = "Java"
extensions = [".java"]
compiled = true
disabled = true
compile_command = ["javac", "<REPLACE>"]
run_command = ["java", "Main"]
source_name = "/box/Main.java"
compiled_name = "/box/Main.class"
"#;

    #[test]
    fn test_load_languages() {
        let langs = Languages::from_toml_str(SAMPLE).unwrap();

        assert!(langs.get("c").is_some());
        assert_eq!(langs.get("PY").unwrap().name, "python3");
        assert!(langs.get("java").is_none(), "disabled languages are hidden");
        assert_eq!(langs.enabled(), vec!["c".to_string(), "python3".to_string()]);
    }

    #[test]
    fn test_by_filename() {
        let langs = Languages::from_toml_str(SAMPLE).unwrap();

        assert_eq!(langs.by_filename("checker.c").unwrap().name, "c");
        assert_eq!(langs.by_filename("sol.py").unwrap().name, "python3");
        assert!(langs.by_filename("Main.java").is_none());
        assert!(langs.by_filename("noext").is_none());
    }

    #[test]
    fn test_compile_argv_replaces_token() {
        let langs = Languages::from_toml_str(SAMPLE).unwrap();
        let c = langs.get("c").unwrap();

        let argv = c.compile_argv(&["/box/main.c".into(), "/box/grader.c".into()]);
        assert_eq!(
            argv,
            vec!["gcc", "-O2", "/box/main.c", "/box/grader.c", "-o", "/box/output"]
        );
    }

    #[test]
    fn test_env_layering() {
        let langs = Languages::from_toml_str(SAMPLE).unwrap();
        let c = langs.get("c").unwrap();

        let build = c.build_env();
        assert_eq!(build["MODE"], "build");
        assert_eq!(build["LANG"], "C");
        assert_eq!(c.run_env()["MODE"], "common");
    }

    #[test]
    fn test_embedded_languages_parse() {
        let langs = Languages::embedded().unwrap();
        assert!(langs.get("cpp17").is_some());
        assert_eq!(langs.get("cpp").unwrap().name, "cpp17");
        assert!(!langs.get("python3").unwrap().compiled);
    }

    #[test]
    fn test_resolve_command_keeps_box_paths() {
        let argv = vec!["/box/output".to_string(), "arg".to_string()];
        assert_eq!(resolve_command(&argv).unwrap(), argv);
        assert!(resolve_command(&[]).is_err());
    }
}
