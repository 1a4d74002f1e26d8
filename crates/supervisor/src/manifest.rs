use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Language runtime a sentinel is written for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Python,
    Node,
    Go,
    Java,
    Rust,
    Binary,
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Runtime::Python => "python",
            Runtime::Node => "node",
            Runtime::Go => "go",
            Runtime::Java => "java",
            Runtime::Rust => "rust",
            Runtime::Binary => "binary",
        };
        f.write_str(name)
    }
}

/// One `[[sentinels]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentinelManifest {
    pub name: String,
    pub runtime: Runtime,
    pub entry: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Resolved command line for a manifest, before interpreter lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Interpreter name (looked up on `PATH`) or the entry itself for binaries.
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Alternative program names tried when `program` is not on `PATH`.
    pub fallbacks: Vec<String>,
}

impl SentinelManifest {
    pub fn new(name: impl Into<String>, runtime: Runtime, entry: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runtime,
            entry: entry.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            enabled: true,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Map the runtime to an interpreter invocation with unbuffered output,
    /// so sentinel log lines reach the hub as they are written.
    pub fn invocation(&self) -> Invocation {
        let entry = self.entry.clone();
        let (program, mut args, env, fallbacks): (&str, Vec<String>, Vec<(String, String)>, Vec<String>) =
            match self.runtime {
                Runtime::Python => (
                    "python3",
                    vec!["-u".to_string(), entry],
                    vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
                    vec!["python".to_string()],
                ),
                Runtime::Node => ("node", vec![entry], Vec::new(), vec!["nodejs".to_string()]),
                Runtime::Go => ("go", vec!["run".to_string(), entry], Vec::new(), Vec::new()),
                Runtime::Java => {
                    let args = if entry.ends_with(".jar") {
                        vec!["-jar".to_string(), entry]
                    } else {
                        vec![entry]
                    };
                    ("java", args, Vec::new(), Vec::new())
                }
                Runtime::Rust if entry.ends_with("Cargo.toml") => (
                    "cargo",
                    vec![
                        "run".to_string(),
                        "--quiet".to_string(),
                        "--manifest-path".to_string(),
                        entry,
                        "--".to_string(),
                    ],
                    Vec::new(),
                    Vec::new(),
                ),
                Runtime::Rust | Runtime::Binary => {
                    return Invocation {
                        program: entry,
                        args: self.args.clone(),
                        env: self.env.clone().into_iter().collect(),
                        fallbacks: Vec::new(),
                    };
                }
            };
        args.extend(self.args.iter().cloned());
        let mut env = env;
        env.extend(self.env.clone());
        Invocation {
            program: program.to_string(),
            args,
            env,
            fallbacks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_runs_unbuffered() {
        let manifest = SentinelManifest::new("janitor", Runtime::Python, "sentinels/janitor.py")
            .with_args(["--verbose"]);
        let inv = manifest.invocation();
        assert_eq!(inv.program, "python3");
        assert_eq!(inv.args, vec!["-u", "sentinels/janitor.py", "--verbose"]);
        assert!(inv
            .env
            .contains(&("PYTHONUNBUFFERED".to_string(), "1".to_string())));
        assert_eq!(inv.fallbacks, vec!["python"]);
    }

    #[test]
    fn java_distinguishes_jars_from_sources() {
        let jar = SentinelManifest::new("a11y", Runtime::Java, "a11y.jar").invocation();
        assert_eq!(jar.args, vec!["-jar", "a11y.jar"]);
        let src = SentinelManifest::new("a11y", Runtime::Java, "A11y.java").invocation();
        assert_eq!(src.args, vec!["A11y.java"]);
    }

    #[test]
    fn go_and_rust_projects() {
        let go = SentinelManifest::new("vision", Runtime::Go, "main.go").invocation();
        assert_eq!(go.program, "go");
        assert_eq!(go.args, vec!["run", "main.go"]);

        let cargo = SentinelManifest::new("pulse", Runtime::Rust, "pulse/Cargo.toml").invocation();
        assert_eq!(cargo.program, "cargo");
        assert_eq!(cargo.args.last().map(String::as_str), Some("--"));

        let built = SentinelManifest::new("pulse", Runtime::Rust, "./target/release/pulse").invocation();
        assert_eq!(built.program, "./target/release/pulse");
    }
}
