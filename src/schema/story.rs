/// Compiled story IR: the contract between the compiler and the runtime.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// IR document format version written by the compiler.
pub const IR_VERSION: &str = "0.1.0";

/// Separator used to namespace passage ids (`chapter1.intro`).
pub const NAMESPACE_SEPARATOR: char = '.';

#[derive(Debug, Error)]
pub enum StoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("RON serialization error: {0}")]
    RonWrite(#[from] ron::Error),
    #[error("unsupported story file extension: {0}")]
    UnsupportedFormat(String),
    #[error("invalid story: {0}")]
    Invalid(String),
}

/// A compiled story: passages keyed by id plus start passage and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryIr {
    pub version: String,
    pub initial_passage: String,
    #[serde(default)]
    pub metadata: StoryMetadata,
    #[serde(default)]
    pub imports: Vec<ImportDecl>,
    pub passages: IndexMap<String, Passage>,
}

/// Opaque story metadata, consumed by hosting layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub story_id: Option<String>,
    #[serde(default)]
    pub custom: IndexMap<String, String>,
}

impl StoryMetadata {
    /// Identity used in save documents: explicit `story_id`, else a slug of
    /// the title, else `"untitled"`.
    pub fn identity(&self) -> String {
        if let Some(ref id) = self.story_id {
            return id.clone();
        }
        match self.title {
            Some(ref title) => title
                .chars()
                .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
                .collect(),
            None => "untitled".to_string(),
        }
    }
}

/// `import module` or `from module import a, b as c`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportDecl {
    pub module: String,
    /// Empty for a whole-module import.
    #[serde(default)]
    pub names: Vec<ImportName>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportName {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
}

impl ImportName {
    pub fn bound_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// A named, addressable unit of narrative content and logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub execute: Vec<Command>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Passage {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            params: Vec::new(),
            content: Vec::new(),
            choices: Vec::new(),
            execute: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// Namespace prefix of this passage id (`a.b` for `a.b.c`).
    pub fn namespace(&self) -> Option<&str> {
        self.id.rsplit_once(NAMESPACE_SEPARATOR).map(|(ns, _)| ns)
    }

    /// Visit every content item, including nested branches, loop bodies,
    /// choice text and passage-level choices.
    pub fn walk<F: FnMut(&ContentItem)>(&self, mut f: F) {
        fn visit<F: FnMut(&ContentItem)>(items: &[ContentItem], f: &mut F) {
            for item in items {
                f(item);
                match item {
                    ContentItem::Conditional { branches } => {
                        for branch in branches {
                            visit(&branch.content, f);
                        }
                    }
                    ContentItem::Loop { body, .. } => visit(body, f),
                    ContentItem::Choice(choice) => visit(&choice.text, f),
                    _ => {}
                }
            }
        }
        visit(&self.content, &mut f);
        for choice in &self.choices {
            visit(&choice.text, &mut f);
        }
    }

    /// All choices, nested ones first in source order, then passage-level.
    pub fn all_choices(&self) -> Vec<&Choice> {
        let mut out = Vec::new();
        collect_nested_choices(&self.content, &mut out);
        out.extend(self.choices.iter());
        out
    }
}

fn collect_nested_choices<'a>(items: &'a [ContentItem], out: &mut Vec<&'a Choice>) {
    for item in items {
        match item {
            ContentItem::Choice(choice) => out.push(choice),
            ContentItem::Conditional { branches } => {
                for branch in branches {
                    collect_nested_choices(&branch.content, out);
                }
            }
            ContentItem::Loop { body, .. } => collect_nested_choices(body, out),
            _ => {}
        }
    }
}

/// Declared passage parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    /// Default expression source; `None` makes the parameter required.
    #[serde(default)]
    pub default: Option<String>,
}

/// Call argument: positional when `name` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arg {
    #[serde(default)]
    pub name: Option<String>,
    pub expr: String,
}

/// One ordered piece of passage content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentItem {
    Text(String),
    Expression {
        code: String,
        #[serde(default)]
        format: Option<String>,
    },
    Conditional {
        branches: Vec<Branch>,
    },
    Loop {
        vars: Vec<String>,
        collection: String,
        body: Vec<ContentItem>,
    },
    Jump {
        target: String,
        #[serde(default)]
        args: Vec<Arg>,
        line: usize,
    },
    Render {
        name: String,
        #[serde(default)]
        args: Vec<Arg>,
        #[serde(default)]
        hint: Option<String>,
    },
    Input {
        name: String,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        placeholder: Option<String>,
    },
    /// Statement evaluated during rendering against the pass-local frame.
    Command(Command),
    Choice(Choice),
}

/// `condition: None` is the unconditional `@else` branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    #[serde(default)]
    pub condition: Option<String>,
    pub content: Vec<ContentItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    /// Stable identity used to track consumed one-shot choices.
    pub key: String,
    pub text: Vec<ContentItem>,
    pub target: String,
    #[serde(default)]
    pub args: Vec<Arg>,
    #[serde(default)]
    pub guard: Option<String>,
    #[serde(default)]
    pub one_shot: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub line: usize,
}

/// Side-effecting statement run in the execute phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Assign {
        target: String,
        op: AssignOp,
        expression: String,
        line: usize,
    },
    Eval {
        code: String,
        line: usize,
    },
}

impl Command {
    pub fn line(&self) -> usize {
        match self {
            Self::Assign { line, .. } | Self::Eval { line, .. } => *line,
        }
    }

    /// Source-like text for error messages.
    pub fn source(&self) -> String {
        match self {
            Self::Assign {
                target,
                op,
                expression,
                ..
            } => format!("{} {} {}", target, op.symbol(), expression),
            Self::Eval { code, .. } => code.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl AssignOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Set => "=",
            Self::Add => "+=",
            Self::Sub => "-=",
            Self::Mul => "*=",
            Self::Div => "/=",
            Self::FloorDiv => "//=",
            Self::Mod => "%=",
            Self::Pow => "**=",
        }
    }

    /// Longest symbols first so `//=` is never read as `/=`.
    pub const ALL: [AssignOp; 8] = [
        AssignOp::FloorDiv,
        AssignOp::Pow,
        AssignOp::Add,
        AssignOp::Sub,
        AssignOp::Mul,
        AssignOp::Div,
        AssignOp::Mod,
        AssignOp::Set,
    ];
}

impl StoryIr {
    pub fn passage(&self, id: &str) -> Option<&Passage> {
        self.passages.get(id)
    }

    /// Check the invariants the runtime relies on.
    pub fn validate(&self) -> Result<(), StoryError> {
        if self.passages.is_empty() {
            return Err(StoryError::Invalid("story has no passages".to_string()));
        }
        if !self.passages.contains_key(&self.initial_passage) {
            return Err(StoryError::Invalid(format!(
                "initial passage '{}' not found in story",
                self.initial_passage
            )));
        }
        Ok(())
    }

    pub fn from_json(input: &str) -> Result<StoryIr, StoryError> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn to_json(&self) -> Result<String, StoryError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_ron(input: &str) -> Result<StoryIr, StoryError> {
        Ok(ron::from_str(input)?)
    }

    pub fn to_ron(&self) -> Result<String, StoryError> {
        Ok(ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?)
    }

    /// Load a compiled story, choosing JSON or RON from the extension.
    pub fn load(path: &Path) -> Result<StoryIr, StoryError> {
        let contents = std::fs::read_to_string(path)?;
        match extension(path).as_str() {
            "json" => Self::from_json(&contents),
            "ron" => Self::from_ron(&contents),
            other => Err(StoryError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), StoryError> {
        let contents = match extension(path).as_str() {
            "json" => self.to_json()?,
            "ron" => self.to_ron()?,
            other => return Err(StoryError::UnsupportedFormat(other.to_string())),
        };
        std::fs::write(path, contents)?;
        Ok(())
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_story() -> StoryIr {
        let mut start = Passage::new("Start");
        start.execute.push(Command::Assign {
            target: "gold".to_string(),
            op: AssignOp::Set,
            expression: "10".to_string(),
            line: 2,
        });
        start.content.push(ContentItem::Text("You have ".to_string()));
        start.content.push(ContentItem::Expression {
            code: "gold".to_string(),
            format: None,
        });
        start.choices.push(Choice {
            key: "Start#0".to_string(),
            text: vec![ContentItem::Text("Shop".to_string())],
            target: "town.shop".to_string(),
            args: vec![Arg {
                name: None,
                expr: "gold".to_string(),
            }],
            guard: Some("gold > 0".to_string()),
            one_shot: true,
            tags: vec![],
            line: 4,
        });
        let mut shop = Passage::new("town.shop");
        shop.params.push(Param {
            name: "budget".to_string(),
            default: None,
        });

        let mut passages = IndexMap::new();
        passages.insert("Start".to_string(), start);
        passages.insert("town.shop".to_string(), shop);
        StoryIr {
            version: IR_VERSION.to_string(),
            initial_passage: "Start".to_string(),
            metadata: StoryMetadata {
                title: Some("The Lost Key".to_string()),
                ..StoryMetadata::default()
            },
            imports: vec![],
            passages,
        }
    }

    #[test]
    fn json_round_trip() {
        let story = sample_story();
        let json = story.to_json().unwrap();
        assert_eq!(StoryIr::from_json(&json).unwrap(), story);
    }

    #[test]
    fn ron_round_trip() {
        let story = sample_story();
        let ron_text = story.to_ron().unwrap();
        assert_eq!(StoryIr::from_ron(&ron_text).unwrap(), story);
    }

    #[test]
    fn identity_falls_back_to_title_slug() {
        let story = sample_story();
        assert_eq!(story.metadata.identity(), "the_lost_key");
        assert_eq!(StoryMetadata::default().identity(), "untitled");
    }

    #[test]
    fn validate_rejects_missing_start() {
        let mut story = sample_story();
        story.initial_passage = "Nowhere".to_string();
        assert!(story.validate().is_err());
    }

    #[test]
    fn namespace_of_passage() {
        let story = sample_story();
        assert_eq!(story.passage("town.shop").unwrap().namespace(), Some("town"));
        assert_eq!(story.passage("Start").unwrap().namespace(), None);
    }

    #[test]
    fn all_choices_lists_passage_level() {
        let story = sample_story();
        let choices = story.passage("Start").unwrap().all_choices();
        assert_eq!(choices.len(), 1);
        assert_eq!(choices[0].key, "Start#0");
    }
}
