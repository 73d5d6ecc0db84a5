//! Documents produced by the `sources` and `status` plan templates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{OperonError, OperonResult};
use crate::model::object::{LifecycleState, Source};

/// Per-action slice of a rendered status document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStatus {
    /// Absent state means the template had nothing to say for this action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_usable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_repeatable: Option<bool>,
}

/// The full status document: one slice per lifecycle operation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDoc {
    #[serde(default)]
    pub provision: ActionStatus,
    #[serde(default)]
    pub deprovision: ActionStatus,
    #[serde(default)]
    pub bind: ActionStatus,
    #[serde(default)]
    pub unbind: ActionStatus,
}

/// Parse a rendered status document.
pub fn parse_status(content: &str) -> OperonResult<StatusDoc> {
    if content.trim().is_empty() {
        return Ok(StatusDoc::default());
    }
    serde_yaml::from_str(content).map_err(|err| OperonError::unmarshal("status document", err))
}

/// Parse a rendered sources document: logical name to resource reference.
pub fn parse_sources(content: &str) -> OperonResult<BTreeMap<String, Source>> {
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let sources: Option<BTreeMap<String, Source>> = serde_yaml::from_str(content)
        .map_err(|err| OperonError::unmarshal("sources document", err))?;
    Ok(sources.unwrap_or_default())
}
