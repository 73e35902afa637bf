//! Question batch files (YAML)

use anyhow::{bail, Context, Result};
use docqa_core::domain::Question;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Fragments {
    One(String),
    Many(Vec<String>),
}

impl Fragments {
    fn into_vec(self) -> Vec<String> {
        match self {
            Fragments::One(fragment) => vec![fragment],
            Fragments::Many(fragments) => fragments,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QuestionEntry {
    id: Option<String>,
    name: Option<String>,
    prompt: Option<String>,
    text: Option<String>,
    expected_response_contains: Option<Fragments>,
    expected_fragments: Option<Fragments>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QuestionFile {
    List(Vec<QuestionEntry>),
    Wrapped { questions: Vec<QuestionEntry> },
}

/// Parse a batch; ids fall back to the entry name, then to `q<position>`
pub fn parse_questions(yaml: &str) -> Result<Vec<Question>> {
    let file: QuestionFile = serde_yaml::from_str(yaml).context("Invalid question file")?;
    let entries = match file {
        QuestionFile::List(entries) => entries,
        QuestionFile::Wrapped { questions } => questions,
    };

    let mut questions = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let id = entry
            .id
            .or(entry.name)
            .unwrap_or_else(|| format!("q{}", index + 1));
        // `prompt` wins when an entry carries both keys
        let Some(text) = non_blank(entry.prompt).or_else(|| non_blank(entry.text)) else {
            bail!("Question {} has neither prompt nor text", id);
        };
        let fragments = entry
            .expected_response_contains
            .or(entry.expected_fragments)
            .map(Fragments::into_vec)
            .unwrap_or_default();
        questions.push(Question::new(id, text, fragments));
    }
    Ok(questions)
}

pub fn load_questions(path: &Path) -> Result<Vec<Question>> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_questions(&yaml).with_context(|| format!("In {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_with_mixed_field_names() {
        let yaml = r#"
- id: sla
  text: What is the SLA?
  expected_fragments: ["99.9%", "monthly"]
- name: owner
  prompt: Who owns the contract?
  expected_response_contains: Acme Corp
- text: When does it renew?
"#;
        let questions = parse_questions(yaml).unwrap();
        assert_eq!(questions.len(), 3);

        assert_eq!(questions[0].id, "sla");
        assert_eq!(questions[0].expected_fragments, vec!["99.9%", "monthly"]);

        assert_eq!(questions[1].id, "owner");
        assert_eq!(questions[1].text, "Who owns the contract?");
        assert_eq!(questions[1].expected_fragments, vec!["Acme Corp"]);

        assert_eq!(questions[2].id, "q3");
        assert!(questions[2].expected_fragments.is_empty());
    }

    #[test]
    fn test_wrapped_file() {
        let yaml = "questions:\n  - text: Is there a penalty clause?\n";
        let questions = parse_questions(yaml).unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].id, "q1");
    }

    #[test]
    fn test_entry_without_text_is_rejected() {
        assert!(parse_questions("- id: broken\n").is_err());
    }

    #[test]
    fn test_entry_with_prompt_and_text() {
        let yaml = r#"
- name: penalty
  prompt: Is there a penalty clause?
  text: penalty clause
  expected_response_contains: penalty
  expected_fragments: [ignored]
- id: blank-prompt
  prompt: ""
  text: Who signed it?
"#;
        let questions = parse_questions(yaml).unwrap();
        assert_eq!(questions[0].text, "Is there a penalty clause?");
        assert_eq!(questions[0].expected_fragments, vec!["penalty"]);
        assert_eq!(questions[1].text, "Who signed it?");
    }

    #[test]
    fn test_load_reports_path() {
        let err = load_questions(Path::new("/nonexistent/questions.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/questions.yaml"));
    }
}
