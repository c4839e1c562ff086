/// Per-interaction output handed to the presentation layer.

use serde::Serialize;

use super::value::CallArgs;

/// Result of one `enter`/`choose`, cached until the next transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Output {
    /// Final passage of the jump chain; choices belong to it.
    pub passage_id: String,
    /// Every passage entered during this pass, in order.
    pub visited: Vec<String>,
    pub content: String,
    pub choices: Vec<RenderedChoice>,
    pub directives: Vec<RenderDirective>,
    pub inputs: Vec<InputRequest>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<RenderWarning>,
}

impl Output {
    pub fn choice_texts(&self) -> Vec<&str> {
        self.choices.iter().map(|c| c.text.as_str()).collect()
    }

    pub fn choice_targets(&self) -> Vec<&str> {
        self.choices.iter().map(|c| c.target.as_str()).collect()
    }
}

/// A choice that passed its guard and is not consumed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedChoice {
    pub key: String,
    pub text: String,
    pub target: String,
    /// Arguments evaluated at render time.
    pub args: CallArgs,
    pub one_shot: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Declarative UI request. The core never interprets `name`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderDirective {
    pub name: String,
    pub arguments: CallArgs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presentation_hint: Option<String>,
}

/// Text input the presentation layer should collect.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    pub field_name: String,
    pub label: Option<String>,
    pub placeholder: Option<String>,
}

/// A render-time evaluation failure that was recovered locally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderWarning {
    pub passage_id: String,
    pub expression: String,
    pub message: String,
}
