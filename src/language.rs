//! Supported source languages.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A language the runner knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Go,
    #[value(name = "javascript", alias = "js")]
    #[serde(rename = "javascript", alias = "js")]
    JavaScript,
}

impl Language {
    /// File the submitted source is written to.
    pub const fn entry_file(self) -> &'static str {
        match self {
            Self::Go => "main.go",
            Self::JavaScript => "index.js",
        }
    }

    /// Name of the runtime binary, resolved against `PATH`.
    pub const fn binary(self) -> &'static str {
        match self {
            Self::Go => "go",
            Self::JavaScript => "node",
        }
    }

    /// Arguments for the one-time workspace initialization, if any.
    pub const fn init_args(self) -> Option<&'static [&'static str]> {
        match self {
            Self::Go => Some(&["mod", "init", "usercode"]),
            Self::JavaScript => None,
        }
    }

    /// Default inbound and outbound queue names.
    pub const fn default_queues(self) -> (&'static str, &'static str) {
        match self {
            Self::Go => ("gorunner", "gorunner-response"),
            Self::JavaScript => ("jsrunner", "jsrunner-response"),
        }
    }

    /// Shell line that runs the entry file from inside `workspace`.
    pub fn launch_line(self, binary: &Path, workspace: &Path) -> String {
        let bin = shell_quote(&binary.to_string_lossy());
        let dir = shell_quote(&workspace.to_string_lossy());
        match self {
            Self::Go => format!("cd {dir} && {bin} run {}\n", self.entry_file()),
            Self::JavaScript => format!("cd {dir} && {bin} {}\n", self.entry_file()),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Go => "go",
            Self::JavaScript => "javascript",
        })
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "go" | "golang" => Ok(Self::Go),
            "javascript" | "js" => Ok(Self::JavaScript),
            other => Err(format!("unknown language '{other}'")),
        }
    }
}

/// Single-quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
