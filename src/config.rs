//! Operator configuration for one bridge instance.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker interpreter generation; selects the default binary name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PythonVersion {
    Python2,
    #[default]
    Python3,
}

impl PythonVersion {
    pub fn default_binary(self) -> &'static str {
        match self {
            Self::Python2 => "python2",
            Self::Python3 => "python3",
        }
    }
}

/// Configuration for one bridge instance.
///
/// Plain data so a job planner can ship it inside a serialized plan. Each
/// parallel instance needs a distinct `(operator_id, subtask_index)` pair to
/// keep scratch files collision-free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Generated plan/script artifact the worker executes.
    pub plan_path: PathBuf,
    /// Caller-supplied arguments appended to the worker command line.
    pub plan_arguments: Vec<String>,
    /// Task name used in diagnostics.
    pub task_name: String,
    /// Interpreter generation to launch.
    pub python_version: PythonVersion,
    /// Explicit interpreter path; overrides the version default.
    pub python_binary: Option<PathBuf>,
    /// Identifier of the owning operator, part of the handshake preamble.
    pub operator_id: u32,
    /// Parallel subtask index of the owning task.
    pub subtask_index: u32,
    /// Directory for the sender/receiver scratch files.
    pub tmp_dir: PathBuf,
    /// Debug mode: the worker is started out of band and timeouts are
    /// disabled.
    pub debug: bool,
    /// Wait applied before the startup exit probe and before surfacing an
    /// in-band error, letting the stderr drain catch up.
    pub grace_period: Duration,
    /// Bound on every blocking socket wait outside debug mode.
    pub read_timeout: Duration,
    /// Names of the broadcast variables to distribute before streaming.
    pub broadcast_names: Vec<String>,
}

impl BridgeConfig {
    pub fn new(plan_path: impl Into<PathBuf>) -> Self {
        Self {
            plan_path: plan_path.into(),
            plan_arguments: Vec::new(),
            task_name: "unnamed task".to_string(),
            python_version: PythonVersion::default(),
            python_binary: None,
            operator_id: 0,
            subtask_index: 0,
            tmp_dir: std::env::temp_dir(),
            debug: false,
            grace_period: Duration::from_secs(2),
            read_timeout: Duration::from_secs(60),
            broadcast_names: Vec::new(),
        }
    }

    pub fn with_plan_arguments(mut self, arguments: Vec<String>) -> Self {
        self.plan_arguments = arguments;
        self
    }

    pub fn with_task_name(mut self, name: impl Into<String>) -> Self {
        self.task_name = name.into();
        self
    }

    pub fn with_python_version(mut self, version: PythonVersion) -> Self {
        self.python_version = version;
        self
    }

    pub fn with_python_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.python_binary = Some(binary.into());
        self
    }

    pub fn with_operator_id(mut self, id: u32) -> Self {
        self.operator_id = id;
        self
    }

    pub fn with_subtask_index(mut self, index: u32) -> Self {
        self.subtask_index = index;
        self
    }

    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = dir.into();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_broadcast_names(mut self, names: Vec<String>) -> Self {
        self.broadcast_names = names;
        self
    }

    /// Interpreter the spawner launches.
    pub fn interpreter(&self) -> PathBuf {
        self.python_binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.python_version.default_binary()))
    }

    /// Scratch file the sender spools encoded input through.
    pub fn input_path(&self) -> PathBuf {
        self.scratch("input")
    }

    /// Scratch file the receiver reads encoded results from.
    pub fn output_path(&self) -> PathBuf {
        self.scratch("output")
    }

    fn scratch(&self, side: &str) -> PathBuf {
        self.tmp_dir.join(format!(
            "bridge-{}-{}.{}",
            self.operator_id, self.subtask_index, side
        ))
    }

    /// Socket wait bound; `None` disables timeouts (debug mode).
    pub(crate) fn socket_limit(&self) -> Option<Duration> {
        if self.debug {
            None
        } else {
            Some(self.read_timeout)
        }
    }
}
