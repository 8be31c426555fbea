//! Exec model shared by node hooks and the runtime
//!
//! Hooks talk to a running node by executing commands inside it; the
//! runtime returns an [`ExecResult`] that can be rendered for humans or as JSON.

use crate::error::{NetlabError, NetlabResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Output format for exec results
///
/// `table` parses as an alias of [`ExecOutputFormat::Plain`], whose output is
/// already column-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecOutputFormat {
    Json,
    #[default]
    Plain,
}

impl FromStr for ExecOutputFormat {
    type Err = NetlabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExecOutputFormat::Json),
            "plain" | "table" => Ok(ExecOutputFormat::Plain),
            other => Err(NetlabError::configuration(
                "exec.format",
                format!("cannot parse {:?} as an output format", other),
            )),
        }
    }
}

/// A command to execute inside a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecCmd {
    pub cmd: Vec<String>,
}

impl ExecCmd {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a command line using shell-like quoting rules.
    ///
    /// Single quotes are literal, double quotes allow `\"` and `\\` escapes,
    /// and a backslash outside quotes escapes the next character.
    pub fn parse(line: &str) -> NetlabResult<Self> {
        let mut args = Vec::new();
        let mut current = String::new();
        let mut in_word = false;
        let mut chars = line.chars();

        while let Some(c) = chars.next() {
            match c {
                '\'' => {
                    in_word = true;
                    loop {
                        match chars.next() {
                            Some('\'') => break,
                            Some(c) => current.push(c),
                            None => return Err(unterminated(line)),
                        }
                    }
                }
                '"' => {
                    in_word = true;
                    loop {
                        match chars.next() {
                            Some('"') => break,
                            Some('\\') => match chars.next() {
                                Some(c @ ('"' | '\\')) => current.push(c),
                                Some(c) => {
                                    current.push('\\');
                                    current.push(c);
                                }
                                None => return Err(unterminated(line)),
                            },
                            Some(c) => current.push(c),
                            None => return Err(unterminated(line)),
                        }
                    }
                }
                '\\' => {
                    in_word = true;
                    if let Some(c) = chars.next() {
                        current.push(c);
                    }
                }
                c if c.is_whitespace() => {
                    if in_word {
                        args.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    in_word = true;
                    current.push(c);
                }
            }
        }
        if in_word {
            args.push(current);
        }
        if args.is_empty() {
            return Err(NetlabError::configuration("exec", "empty command"));
        }
        Ok(Self { cmd: args })
    }

    pub fn cmd_string(&self) -> String {
        self.cmd.join(" ")
    }
}

fn unterminated(line: &str) -> NetlabError {
    NetlabError::configuration("exec", format!("unterminated quote in {:?}", line))
}

impl fmt::Display for ExecCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cmd_string())
    }
}

/// Result of a command executed inside a node
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub cmd: Vec<String>,
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn new(cmd: &ExecCmd) -> Self {
        Self {
            cmd: cmd.cmd.clone(),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, return_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.return_code = return_code;
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.return_code == 0
    }

    pub fn cmd_string(&self) -> String {
        self.cmd.join(" ")
    }

    /// Turn a non-zero return code into an [`NetlabError::Exec`]
    pub fn into_checked(self, container: &str) -> NetlabResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(NetlabError::Exec {
                container: container.to_string(),
                cmd: self.cmd_string(),
                return_code: self.return_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }

    /// Render the result in the requested format
    pub fn render(&self, format: ExecOutputFormat) -> NetlabResult<String> {
        match format {
            ExecOutputFormat::Plain => Ok(self.to_string()),
            ExecOutputFormat::Json => Ok(serde_json::to_string_pretty(&self.to_json())?),
        }
    }

    /// JSON form; stdout that is itself valid JSON is embedded as a value
    pub fn to_json(&self) -> serde_json::Value {
        let stdout = serde_json::from_str::<serde_json::Value>(&self.stdout)
            .unwrap_or_else(|_| serde_json::Value::String(self.stdout.clone()));
        serde_json::json!({
            "cmd": self.cmd,
            "returnCode": self.return_code,
            "stdout": stdout,
            "stderr": self.stderr,
        })
    }
}

impl fmt::Display for ExecResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cmd: {}\nReturnCode: {}\nStdOut:\n{}\nStdErr:\n{}\n",
            self.cmd_string(),
            self.return_code,
            self.stdout,
            self.stderr
        )
    }
}

/// Exec results grouped per node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecCollection {
    results: BTreeMap<String, Vec<ExecResult>>,
}

impl ExecCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: impl Into<String>, result: ExecResult) {
        self.results.entry(node.into()).or_default().push(result);
    }

    pub fn extend(&mut self, node: &str, results: impl IntoIterator<Item = ExecResult>) {
        self.results.entry(node.to_string()).or_default().extend(results);
    }

    pub fn get(&self, node: &str) -> &[ExecResult] {
        self.results.get(node).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.results.values().all(Vec::is_empty)
    }

    pub fn render(&self, format: ExecOutputFormat) -> NetlabResult<String> {
        match format {
            ExecOutputFormat::Json => {
                let map: BTreeMap<&String, Vec<serde_json::Value>> = self
                    .results
                    .iter()
                    .map(|(node, results)| (node, results.iter().map(ExecResult::to_json).collect()))
                    .collect();
                Ok(serde_json::to_string_pretty(&map)?)
            }
            ExecOutputFormat::Plain => {
                let mut out = String::new();
                for (node, results) in &self.results {
                    for result in results {
                        out.push_str(&format!("Node: {}\n{}", node, result));
                    }
                }
                Ok(out)
            }
        }
    }
}
