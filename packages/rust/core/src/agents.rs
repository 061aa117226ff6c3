//! Stage collaborators.
//!
//! Context analysis, threat extraction, attack-tree generation, and the final
//! summary are performed by language-model agents that live outside this
//! process. [`StageAgents`] is the seam the orchestrator calls through;
//! [`BridgeAgents`] talks to an agent bridge subprocess over a JSON-lines
//! stdin/stdout protocol.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use treeward_shared::{
    AgentsConfig, AttackTree, ContextReport, ExtractionReport, MappingReport, Result,
    SummaryReport, TreewardError,
};

/// The LLM-backed stages of a threat-modeling run.
pub trait StageAgents {
    /// Find the files in `project_path` that matter for threat modeling.
    fn analyze_context(&mut self, project_path: &Path) -> Result<ContextReport>;

    /// Produce threat statements, from `threat_model` when one is supplied.
    fn extract(
        &mut self,
        project_path: &Path,
        context: &ContextReport,
        threat_model: Option<&Path>,
    ) -> Result<ExtractionReport>;

    /// Generate one attack tree per threat, writing diagrams under `output_dir`.
    fn generate_trees(
        &mut self,
        extraction: &ExtractionReport,
        output_dir: &Path,
    ) -> Result<Vec<AttackTree>>;

    /// Write the final report files and return their paths.
    fn summarize(
        &mut self,
        extraction: &ExtractionReport,
        trees: &[AttackTree],
        mapping: Option<&MappingReport>,
        output_dir: &Path,
    ) -> Result<SummaryReport>;
}

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// Stage-specific task payload.
#[derive(Debug, serde::Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
enum StageTask<'a> {
    ContextAnalysis {
        project_path: &'a Path,
    },
    Extraction {
        project_path: &'a Path,
        context: &'a ContextReport,
        #[serde(skip_serializing_if = "Option::is_none")]
        threat_model_path: Option<&'a Path>,
    },
    TreeGeneration {
        extraction: &'a ExtractionReport,
        output_dir: &'a Path,
    },
    Summary {
        extraction: &'a ExtractionReport,
        attack_trees: &'a [AttackTree],
        #[serde(skip_serializing_if = "Option::is_none")]
        mapping: Option<&'a MappingReport>,
        output_dir: &'a Path,
    },
}

impl StageTask<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::ContextAnalysis { .. } => "context_analysis",
            Self::Extraction { .. } => "extraction",
            Self::TreeGeneration { .. } => "tree_generation",
            Self::Summary { .. } => "summary",
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct TaskEnvelope<'a> {
    model: &'a str,
    #[serde(flatten)]
    task: StageTask<'a>,
}

/// Request message sent to the bridge.
#[derive(Debug, serde::Serialize)]
#[serde(tag = "type")]
enum RequestMessage<'a> {
    #[serde(rename = "run")]
    Run { id: String, task: TaskEnvelope<'a> },
    #[serde(rename = "shutdown")]
    Shutdown,
}

/// Response message received from the bridge.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type")]
enum ResponseMessage {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "result")]
    Result { id: String, result: BridgeResult },
    #[serde(rename = "error")]
    Error {
        #[allow(dead_code)]
        id: String,
        error: String,
    },
}

/// Stage result returned by the bridge.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BridgeResult {
    pub payload: serde_json::Value,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub latency_ms: u64,
}

/// Token usage accumulated over a bridge session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub calls: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

// ---------------------------------------------------------------------------
// Bridge handle
// ---------------------------------------------------------------------------

/// Handle to the spawned agent bridge subprocess.
struct BridgeHandle {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    request_counter: u64,
}

impl BridgeHandle {
    fn spawn(config: &AgentsConfig) -> Result<Self> {
        info!(cmd = %config.bridge_cmd, script = %config.bridge_script, "spawning agent bridge");

        let mut command = Command::new(&config.bridge_cmd);
        command
            .args(&config.bridge_args)
            .arg(&config.bridge_script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()); // bridge logs go to parent stderr
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            TreewardError::Collaborator(format!(
                "failed to spawn bridge: {e}. Is `{}` installed?",
                config.bridge_cmd
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TreewardError::Collaborator("failed to capture bridge stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TreewardError::Collaborator("failed to capture bridge stdout".into()))?;

        let mut handle = Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            request_counter: 0,
        };
        handle.wait_for_ready()?;
        Ok(handle)
    }

    fn wait_for_ready(&mut self) -> Result<()> {
        let line = self.read_line()?;
        let msg: ResponseMessage = serde_json::from_str(line.trim()).map_err(|e| {
            TreewardError::Collaborator(format!("invalid bridge ready message: {e} (got: {line})"))
        })?;

        match msg {
            ResponseMessage::Ready => {
                info!("bridge is ready");
                Ok(())
            }
            _ => Err(TreewardError::Collaborator(format!(
                "expected ready message, got: {line}"
            ))),
        }
    }

    fn send_task(&mut self, task: TaskEnvelope<'_>) -> Result<BridgeResult> {
        self.request_counter += 1;
        let id = format!("req-{}", self.request_counter);

        let request = RequestMessage::Run {
            id: id.clone(),
            task,
        };
        let json = serde_json::to_string(&request).map_err(|e| {
            TreewardError::Collaborator(format!("failed to serialize request: {e}"))
        })?;

        writeln!(self.stdin, "{json}").map_err(|e| {
            TreewardError::Collaborator(format!("failed to write to bridge stdin: {e}"))
        })?;
        self.stdin.flush().map_err(|e| {
            TreewardError::Collaborator(format!("failed to flush bridge stdin: {e}"))
        })?;

        let line = self.read_line()?;
        let msg: ResponseMessage = serde_json::from_str(line.trim()).map_err(|e| {
            TreewardError::Collaborator(format!(
                "invalid bridge response: {e} (got: {})",
                truncate(&line, 200)
            ))
        })?;

        match msg {
            ResponseMessage::Result {
                id: resp_id,
                result,
            } if resp_id == id => Ok(result),
            ResponseMessage::Result { id: resp_id, .. } => Err(TreewardError::Collaborator(
                format!("response id mismatch: expected {id}, got {resp_id}"),
            )),
            ResponseMessage::Error { error, .. } => Err(TreewardError::Collaborator(error)),
            ResponseMessage::Ready => Err(TreewardError::Collaborator(
                "unexpected ready message during a task".into(),
            )),
        }
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .map_err(|e| TreewardError::Collaborator(format!("bridge read error: {e}")))?;
        if line.is_empty() {
            return Err(TreewardError::Collaborator(
                "bridge closed stdout unexpectedly".into(),
            ));
        }
        Ok(line)
    }

    /// Send shutdown and wait for the bridge to exit.
    fn shutdown(mut self) {
        if let Ok(json) = serde_json::to_string(&RequestMessage::Shutdown) {
            let _ = writeln!(self.stdin, "{json}");
            let _ = self.stdin.flush();
        }
        drop(self.stdin);

        match self.child.wait() {
            Ok(status) => info!(?status, "bridge exited"),
            Err(e) => warn!("bridge wait error: {e}"),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

// ---------------------------------------------------------------------------
// Bridge-backed agents
// ---------------------------------------------------------------------------

/// [`StageAgents`] backed by the agent bridge subprocess.
///
/// The bridge is spawned on the first task and shut down on drop. After a
/// failed task the subprocess is discarded, so the next task starts clean.
pub struct BridgeAgents {
    config: AgentsConfig,
    bridge: Option<BridgeHandle>,
    usage: TokenUsage,
}

impl BridgeAgents {
    pub fn new(config: AgentsConfig) -> Self {
        Self {
            config,
            bridge: None,
            usage: TokenUsage::default(),
        }
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    fn run<T: DeserializeOwned>(&mut self, task: StageTask<'_>) -> Result<T> {
        let stage = task.name();
        let bridge = match &mut self.bridge {
            Some(bridge) => bridge,
            slot => slot.insert(BridgeHandle::spawn(&self.config)?),
        };

        let envelope = TaskEnvelope {
            model: &self.config.model,
            task,
        };
        let result = match bridge.send_task(envelope) {
            Ok(result) => result,
            Err(e) => {
                if let Some(bridge) = self.bridge.take() {
                    bridge.shutdown();
                }
                return Err(e);
            }
        };

        self.usage.calls += 1;
        self.usage.tokens_in += result.tokens_in;
        self.usage.tokens_out += result.tokens_out;
        debug!(
            stage,
            model = %result.model,
            tokens_in = result.tokens_in,
            tokens_out = result.tokens_out,
            latency_ms = result.latency_ms,
            "bridge task complete"
        );

        serde_json::from_value(result.payload).map_err(|e| {
            TreewardError::Collaborator(format!("malformed {stage} payload from bridge: {e}"))
        })
    }
}

impl StageAgents for BridgeAgents {
    fn analyze_context(&mut self, project_path: &Path) -> Result<ContextReport> {
        self.run(StageTask::ContextAnalysis { project_path })
    }

    fn extract(
        &mut self,
        project_path: &Path,
        context: &ContextReport,
        threat_model: Option<&Path>,
    ) -> Result<ExtractionReport> {
        self.run(StageTask::Extraction {
            project_path,
            context,
            threat_model_path: threat_model,
        })
    }

    fn generate_trees(
        &mut self,
        extraction: &ExtractionReport,
        output_dir: &Path,
    ) -> Result<Vec<AttackTree>> {
        self.run(StageTask::TreeGeneration {
            extraction,
            output_dir,
        })
    }

    fn summarize(
        &mut self,
        extraction: &ExtractionReport,
        trees: &[AttackTree],
        mapping: Option<&MappingReport>,
        output_dir: &Path,
    ) -> Result<SummaryReport> {
        self.run(StageTask::Summary {
            extraction,
            attack_trees: trees,
            mapping,
            output_dir,
        })
    }
}

impl Drop for BridgeAgents {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.shutdown();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
