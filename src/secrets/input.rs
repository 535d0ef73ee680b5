//! Operator input collection

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Password};

use crate::core::Sensitive;

/// Source of operator answers. Interactive in production, preset in
/// tests and unattended runs.
pub trait InputProvider: Send + Sync {
    /// Ask for a plain value, with an optional default
    fn prompt(&self, label: &str, default: Option<&str>) -> Result<String>;

    /// Ask for a confidential value; input is never echoed
    fn prompt_secret(&self, label: &str) -> Result<Sensitive>;

    /// Ask a yes/no question
    fn confirm(&self, question: &str, default: bool) -> Result<bool>;
}

/// Terminal prompts via dialoguer
pub struct InteractiveInput;

impl InputProvider for InteractiveInput {
    fn prompt(&self, label: &str, default: Option<&str>) -> Result<String> {
        let theme = ColorfulTheme::default();
        let mut input = Input::<String>::with_theme(&theme).with_prompt(label);
        if let Some(value) = default {
            input = input.default(value.to_string()).allow_empty(value.is_empty());
        }
        Ok(input.interact_text()?)
    }

    fn prompt_secret(&self, label: &str) -> Result<Sensitive> {
        let value = Password::with_theme(&ColorfulTheme::default())
            .with_prompt(label)
            .allow_empty_password(true)
            .interact()?;
        Ok(Sensitive::new(value))
    }

    fn confirm(&self, question: &str, default: bool) -> Result<bool> {
        Ok(Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(question)
            .default(default)
            .interact()?)
    }
}

/// Canned answers keyed by prompt label, for unattended runs
pub struct PresetInput {
    answers: HashMap<String, String>,
    assume_yes: bool,
}

impl PresetInput {
    pub fn new(answers: HashMap<String, String>, assume_yes: bool) -> Self {
        Self { answers, assume_yes }
    }

    /// Load answers from a flat YAML map of label to value
    pub fn from_file<P: AsRef<Path>>(path: P, assume_yes: bool) -> Result<Self> {
        let content = std::fs::read_to_string(&path).with_context(|| {
            format!("Failed to read answers file {}", path.as_ref().display())
        })?;
        let answers: HashMap<String, String> =
            serde_yaml::from_str(&content).context("Answers file must be a flat string map")?;
        Ok(Self::new(answers, assume_yes))
    }
}

impl InputProvider for PresetInput {
    fn prompt(&self, label: &str, default: Option<&str>) -> Result<String> {
        if let Some(answer) = self.answers.get(label) {
            return Ok(answer.clone());
        }
        default
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("No answer provided for '{label}'"))
    }

    fn prompt_secret(&self, label: &str) -> Result<Sensitive> {
        self.answers
            .get(label)
            .map(|v| Sensitive::new(v.clone()))
            .ok_or_else(|| anyhow::anyhow!("No answer provided for '{label}'"))
    }

    fn confirm(&self, _question: &str, default: bool) -> Result<bool> {
        Ok(self.assume_yes || default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_falls_back_to_default() {
        let input = PresetInput::new(HashMap::new(), false);
        assert_eq!(input.prompt("Username", Some("admin")).unwrap(), "admin");
        assert!(input.prompt("Username", None).is_err());
    }

    #[test]
    fn test_preset_secret_requires_answer() {
        let mut answers = HashMap::new();
        answers.insert("Password".to_string(), "hunter2".to_string());
        let input = PresetInput::new(answers, false);

        assert_eq!(input.prompt_secret("Password").unwrap().expose(), "hunter2");
        assert!(input.prompt_secret("Other").is_err());
    }

    #[test]
    fn test_assume_yes_confirms() {
        let input = PresetInput::new(HashMap::new(), true);
        assert!(input.confirm("Delete everything?", false).unwrap());
    }
}
