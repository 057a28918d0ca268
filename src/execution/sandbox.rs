//! Process sandbox for generated pandas code.
//!
//! Every run gets a fresh interpreter process with a cleared environment, a
//! throwaway working directory and a wall-clock timeout. Inside the process a
//! fixed harness:
//! - reads `{code, columns, rows}` from stdin and builds `df`;
//! - executes the code with a reduced `__builtins__` whose `__import__` only
//!   admits pandas and numpy, with `df` and `pd` as the only other names;
//! - diverts the code's prints to stderr;
//! - writes `{columns, rows}` or `{error}` as JSON to stdout.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::dataset::{Cell, Dataset};
use crate::utils::truncate_chars;

/// Message used when the code leaves no data frame behind.
pub const NO_DATAFRAME_MESSAGE: &str = "No valid DataFrame 'df' produced.";

const HARNESS: &str = r#"
import builtins
import json
import sys

import numpy as np
import pandas as pd

_ALLOWED_ROOTS = {"pandas", "numpy"}
_real_import = builtins.__import__


def _guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level != 0 or name.split(".")[0] not in _ALLOWED_ROOTS:
        raise ImportError("import of '%s' is not allowed" % name)
    return _real_import(name, globals, locals, fromlist, level)


_SAFE_BUILTINS = (
    "abs", "all", "any", "bool", "dict", "divmod", "enumerate", "filter", "float",
    "frozenset", "int", "isinstance", "len", "list", "map", "max", "min", "pow",
    "print", "range", "reversed", "round", "set", "slice", "sorted", "str", "sum",
    "tuple", "zip",
    "ArithmeticError", "Exception", "IndexError", "KeyError", "TypeError",
    "ValueError", "ZeroDivisionError",
)


def _reply(payload):
    sys.__stdout__.write(json.dumps(payload, allow_nan=False))
    sys.__stdout__.flush()


def _cell(value):
    if value is None or value is pd.NaT or value is pd.NA:
        return None
    if isinstance(value, (bool, np.bool_)):
        return bool(value)
    if isinstance(value, (int, np.integer)):
        return int(value)
    if isinstance(value, (float, np.floating)):
        value = float(value)
        if value != value or value in (float("inf"), float("-inf")):
            return None
        return value
    if isinstance(value, str):
        return value
    if isinstance(value, pd.Timestamp):
        return value.isoformat()
    return str(value)


def main():
    request = json.load(sys.stdin)
    df = pd.DataFrame(request["rows"], columns=request["columns"])

    safe = {name: getattr(builtins, name) for name in _SAFE_BUILTINS if hasattr(builtins, name)}
    safe["__import__"] = _guarded_import
    scope = {"__builtins__": safe, "df": df, "pd": pd}

    sys.stdout = sys.stderr
    try:
        exec(compile(request["code"], "<transformation>", "exec"), scope)
    except BaseException as exc:
        sys.stdout = sys.__stdout__
        _reply({"error": "%s: %s" % (type(exc).__name__, exc)})
        return
    sys.stdout = sys.__stdout__

    result = scope.get("df")
    if not isinstance(result, pd.DataFrame):
        _reply({"error": "No valid DataFrame 'df' produced."})
        return

    _reply({
        "columns": [str(c) for c in result.columns],
        "rows": [[_cell(v) for v in row] for row in result.itertuples(index=False, name=None)],
    })


main()
"#;

/// Failures of one sandboxed run.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The transformation itself raised; the message is what Python reported.
    #[error("{0}")]
    Script(String),

    #[error("Failed to start interpreter '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Interpreter exited with status {status}: {stderr}")]
    Crashed { status: String, stderr: String },

    #[error("Malformed harness reply: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs transformation code against a working copy of a dataset.
#[async_trait]
pub trait TransformRuntime: Send + Sync {
    /// Executes `code` with `df` bound to `working_copy`; returns the
    /// resulting `df`.
    async fn execute(&self, code: &str, working_copy: Dataset) -> Result<Dataset, SandboxError>;
}

/// Configuration for the process sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Interpreter to run.
    pub python_bin: String,
    /// Wall-clock limit for one run.
    pub timeout: Duration,
    /// Variables set in the otherwise empty child environment.
    pub env_vars: Vec<(String, String)>,
}

impl SandboxConfig {
    pub fn new(python_bin: impl Into<String>) -> Self {
        Self {
            python_bin: python_bin.into(),
            timeout: Duration::from_secs(60),
            env_vars: Vec::new(),
        }
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new("python3")
    }
}

#[derive(Serialize)]
struct HarnessRequest<'a> {
    code: &'a str,
    columns: &'a [String],
    rows: &'a [Vec<Cell>],
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HarnessReply {
    Failure { error: String },
    Frame {
        columns: Vec<String>,
        rows: Vec<Vec<Cell>>,
    },
}

/// Sandbox running each transformation in a fresh Python process.
#[derive(Debug, Clone, Default)]
pub struct PythonSandbox {
    config: SandboxConfig,
}

impl PythonSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn command(&self, workdir: &std::path::Path) -> Command {
        let mut cmd = Command::new(&self.config.python_bin);
        cmd.arg("-B")
            .arg("-c")
            .arg(HARNESS)
            .current_dir(workdir)
            .env_clear()
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // The interpreter still has to be found on PATH.
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }
        cmd
    }
}

#[async_trait]
impl TransformRuntime for PythonSandbox {
    async fn execute(&self, code: &str, working_copy: Dataset) -> Result<Dataset, SandboxError> {
        let workdir = tempfile::tempdir()?;
        let payload = serde_json::to_vec(&HarnessRequest {
            code,
            columns: working_copy.columns(),
            rows: working_copy.rows(),
        })
        .map_err(|e| SandboxError::Protocol(e.to_string()))?;
        // The child gets its own serialized copy; ours is no longer needed.
        drop(working_copy);

        let mut child = self.command(workdir.path()).spawn().map_err(|e| SandboxError::Spawn {
            program: self.config.python_bin.clone(),
            message: e.to_string(),
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Protocol("child stdin unavailable".to_string()))?;

        let run = async move {
            stdin.write_all(&payload).await?;
            drop(stdin);
            child.wait_with_output().await
        };

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.config.timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout = ?self.config.timeout, "Sandboxed transformation timed out");
                return Err(SandboxError::Timeout(self.config.timeout));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(stderr = %truncate_chars(stderr.trim(), 2000), "Sandbox stderr");
        }

        if output.stdout.is_empty() {
            return Err(SandboxError::Crashed {
                status: output.status.to_string(),
                stderr: truncate_chars(stderr.trim(), 2000),
            });
        }

        parse_reply(&output.stdout)
    }
}

fn parse_reply(stdout: &[u8]) -> Result<Dataset, SandboxError> {
    let reply: HarnessReply =
        serde_json::from_slice(stdout).map_err(|e| SandboxError::Protocol(e.to_string()))?;
    match reply {
        HarnessReply::Failure { error } => Err(SandboxError::Script(error)),
        HarnessReply::Frame { columns, rows } => {
            Dataset::new(columns, rows).map_err(|e| SandboxError::Protocol(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn costs() -> Dataset {
        Dataset::new(
            vec!["technology".into(), "year_vtg".into(), "inv_cost".into()],
            vec![
                vec!["solar_pv".into(), 2030i64.into(), 100.0.into()],
                vec!["wind_ppl".into(), 2030i64.into(), 200.0.into()],
            ],
        )
        .expect("valid")
    }

    #[test]
    fn test_config_builder() {
        let config = SandboxConfig::default()
            .with_timeout(Duration::from_secs(5))
            .with_env("OMP_NUM_THREADS", "1");
        assert_eq!(config.python_bin, "python3");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.env_vars, vec![("OMP_NUM_THREADS".into(), "1".into())]);
    }

    #[test]
    fn test_request_payload_shape() {
        let ds = costs();
        let payload = serde_json::to_value(HarnessRequest {
            code: "df = df",
            columns: ds.columns(),
            rows: ds.rows(),
        })
        .expect("serializes");
        assert_eq!(payload["columns"][2], "inv_cost");
        assert_eq!(payload["rows"][0][1], 2030);
    }

    #[test]
    fn test_parse_reply_variants() {
        let frame = parse_reply(br#"{"columns": ["a"], "rows": [[1.5], [null]]}"#).expect("frame");
        assert_eq!(frame.rows()[0][0], Cell::Number(1.5));
        assert!(frame.rows()[1][0].is_null());

        match parse_reply(br#"{"error": "KeyError: 'inv_costs'"}"#) {
            Err(SandboxError::Script(msg)) => assert_eq!(msg, "KeyError: 'inv_costs'"),
            other => panic!("expected script error, got {:?}", other),
        }

        assert!(matches!(
            parse_reply(br#"{"columns": ["a", "b"], "rows": [[1]]}"#),
            Err(SandboxError::Protocol(_))
        ));
        assert!(matches!(parse_reply(b"not json"), Err(SandboxError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_error() {
        let sandbox = PythonSandbox::new(SandboxConfig::new("/nonexistent/python-peach"));
        let err = sandbox.execute("df = df", costs()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }));
    }

    #[tokio::test]
    #[ignore = "requires python3 with pandas"]
    async fn test_transformation_runs_in_python() {
        let sandbox = PythonSandbox::default();
        let result = sandbox
            .execute(
                "import pandas as pd\nprint('noise')\ndf.loc[:, 'inv_cost'] = df['inv_cost'] * 1.1",
                costs(),
            )
            .await
            .expect("runs");

        let values: Vec<f64> = result
            .column("inv_cost")
            .expect("column")
            .iter()
            .filter_map(|c| c.as_f64())
            .collect();
        assert!((values[0] - 110.0).abs() < 1e-9);
        assert!((values[1] - 220.0).abs() < 1e-9);
        assert_eq!(result.column("year_vtg").expect("column")[0], &Cell::Number(2030.0));
    }

    #[tokio::test]
    #[ignore = "requires python3 with pandas"]
    async fn test_python_errors_and_guards() {
        let sandbox = PythonSandbox::default();

        let err = sandbox.execute("df['missing'] + 1", costs()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Script(ref m) if m.starts_with("KeyError")));

        let err = sandbox.execute("import json", costs()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Script(ref m) if m.contains("not allowed")));

        let err = sandbox.execute("df = 3", costs()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Script(ref m) if m == NO_DATAFRAME_MESSAGE));
    }

    #[tokio::test]
    #[ignore = "requires python3 with pandas"]
    async fn test_runaway_code_times_out() {
        let sandbox =
            PythonSandbox::new(SandboxConfig::default().with_timeout(Duration::from_millis(500)));
        let err = sandbox.execute("while True:\n    pass", costs()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }
}
