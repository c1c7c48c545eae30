//! Task messages and their dispatch to the evidence operations

use serde_json::{json, Value};
use tracing::{error, info, warn};

use strata_core::{Error, ErrorKind, FileId, Result};

use crate::archiver::Archiver;
use crate::retimestamper::Retimestamper;
use crate::validator::{FileIdentifier, Validator};

/// A parsed task message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Archive {
        file_path: String,
        owner_name: String,
    },
    Retimestamp {
        file_id: FileId,
    },
    Validation {
        file: FileIdentifier,
        recipients: Vec<String>,
    },
}

fn string_field(value: &Value, field: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::WrongTask(format!("task field {:?} missing or not a string", field)))
}

impl Task {
    /// Parse a JSON task body; labels match case-insensitively
    pub fn parse(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| Error::WrongTask(format!("task is not JSON: {}", e)))?;
        let label = value
            .get("task")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::WrongTask("task has no label".into()))?;

        match label.to_ascii_lowercase().as_str() {
            "archive" => Ok(Task::Archive {
                file_path: string_field(&value, "file_path")?,
                owner_name: string_field(&value, "owner_name")?,
            }),
            "retimestamp" => {
                let id = value
                    .get("file_id")
                    .ok_or_else(|| Error::WrongTask("retimestamp task has no file_id".into()))?;
                match FileIdentifier::from_json(id)? {
                    FileIdentifier::Id(file_id) => Ok(Task::Retimestamp { file_id }),
                    other => Err(Error::WrongTask(format!(
                        "retimestamp needs a numeric file_id, got {}",
                        other
                    ))),
                }
            }
            "validation" => {
                let file = value
                    .get("files_info")
                    .ok_or_else(|| Error::WrongTask("validation task has no files_info".into()))
                    .and_then(FileIdentifier::from_json)?;
                let recipients = value
                    .get("result_recipients")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        Error::WrongTask("validation task has no result_recipients".into())
                    })?
                    .iter()
                    .map(|r| {
                        r.as_str().map(str::to_string).ok_or_else(|| {
                            Error::WrongTask(format!("recipient {} is not a string", r))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Task::Validation { file, recipients })
            }
            other => Err(Error::WrongTask(format!("unknown task label {:?}", other))),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Task::Archive { .. } => "archive",
            Task::Retimestamp { .. } => "Retimestamp",
            Task::Validation { .. } => "Validation",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Task::Archive {
                file_path,
                owner_name,
            } => json!({
                "task": self.label(),
                "file_path": file_path,
                "owner_name": owner_name,
            }),
            Task::Retimestamp { file_id } => json!({
                "task": self.label(),
                "file_id": file_id,
            }),
            Task::Validation { file, recipients } => json!({
                "task": self.label(),
                "files_info": file.to_json(),
                "result_recipients": recipients,
            }),
        }
    }
}

/// What the queue should do with a delivery once its task ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Task succeeded
    Ack,
    /// Task failed in a way another attempt will not change
    AckKnownError,
    /// Unclassified failure; another delivery may succeed
    Retry,
}

impl TaskOutcome {
    /// Outcome of `task` failing with `error`. A failed renewal is never
    /// redelivered: a retry would work against the same outermost layer.
    pub fn for_task(task: &Task, error: &Error) -> Self {
        match task {
            Task::Retimestamp { .. } => TaskOutcome::AckKnownError,
            Task::Archive { .. } | Task::Validation { .. } => Self::from_error(error),
        }
    }

    pub fn from_error(error: &Error) -> Self {
        match error.kind() {
            ErrorKind::Internal => TaskOutcome::Retry,
            ErrorKind::Transport
            | ErrorKind::Trust
            | ErrorKind::Format
            | ErrorKind::Persistence => TaskOutcome::AckKnownError,
        }
    }
}

/// Routes tasks to the operation they name
pub struct Dispatcher {
    archiver: Archiver,
    retimestamper: Retimestamper,
    validator: Validator,
}

impl Dispatcher {
    pub fn new(archiver: Archiver, retimestamper: Retimestamper, validator: Validator) -> Self {
        Self {
            archiver,
            retimestamper,
            validator,
        }
    }

    /// Run one task, returning a short summary of what was done
    pub async fn run(&self, task: &Task) -> Result<String> {
        match task {
            Task::Archive {
                file_path,
                owner_name,
            } => {
                let file = self.archiver.archive(file_path, owner_name).await?;
                Ok(format!("archived {} as file {}", file.file_name(), file.file_id))
            }
            Task::Retimestamp { file_id } => {
                let package = self.retimestamper.retimestamp(*file_id).await?;
                Ok(format!(
                    "file {} renewed with package {}",
                    file_id, package.package_id
                ))
            }
            Task::Validation { file, recipients } => {
                let result = self.validator.validate(file, recipients).await?;
                Ok(format!("validation of {}: {}", file, result))
            }
        }
    }

    /// Parse and run a raw task body
    pub async fn handle(&self, body: &[u8]) -> TaskOutcome {
        let task = match Task::parse(body) {
            Ok(task) => task,
            Err(e) => {
                error!(kind = ?e.kind(), "Rejected task: {}", e);
                return TaskOutcome::from_error(&e);
            }
        };
        info!(task = task.label(), "Received task");

        match self.run(&task).await {
            Ok(summary) => {
                info!("Task done: {}", summary);
                TaskOutcome::Ack
            }
            Err(e) => {
                let outcome = TaskOutcome::for_task(&task, &e);
                match outcome {
                    TaskOutcome::Retry => warn!("Task failed, will retry: {}", e),
                    _ => error!(task = task.label(), kind = ?e.kind(), "Task failed: {}", e),
                }
                outcome
            }
        }
    }
}
