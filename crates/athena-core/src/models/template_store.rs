use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of the snippet derived from a template body
const SNIPPET_CHARS: usize = 60;

/// A reusable prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

impl Template {
    /// Explicit snippet, or the first characters of the body
    pub fn snippet(&self) -> String {
        match &self.snippet {
            Some(snippet) if !snippet.trim().is_empty() => snippet.clone(),
            _ => {
                let collapsed = self.content.split_whitespace().collect::<Vec<_>>().join(" ");
                if collapsed.chars().count() > SNIPPET_CHARS {
                    let head: String = collapsed.chars().take(SNIPPET_CHARS).collect();
                    format!("{}...", head.trim_end())
                } else {
                    collapsed
                }
            }
        }
    }
}

/// Local store for prompt templates, persisted as a plain list in settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateStore {
    templates: Vec<Template>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        name: impl Into<String>,
        content: impl Into<String>,
        snippet: Option<String>,
    ) -> &Template {
        self.templates.push(Template {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            content: content.into(),
            snippet,
        });
        &self.templates[self.templates.len() - 1]
    }

    pub fn update(
        &mut self,
        id: &str,
        name: impl Into<String>,
        content: impl Into<String>,
        snippet: Option<String>,
    ) -> bool {
        match self.templates.iter_mut().find(|t| t.id == id) {
            Some(template) => {
                template.name = name.into();
                template.content = content.into();
                template.snippet = snippet;
                true
            }
            None => false,
        }
    }

    pub fn delete(&mut self, id: &str) -> bool {
        let before = self.templates.len();
        self.templates.retain(|t| t.id != id);
        self.templates.len() != before
    }

    pub fn get(&self, id: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.id == id)
    }

    pub fn list(&self) -> &[Template] {
        &self.templates
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
