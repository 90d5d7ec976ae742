use serde::{Deserialize, Serialize};

use crate::stage::StageKind;

/// Message handed from the orchestrator to a stage worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTask {
    pub job_id: String,
    pub stage_id: String,
    pub stage_kind: StageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_drawing_version_id: Option<String>,
    pub new_drawing_version_id: String,
}
