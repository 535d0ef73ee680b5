//! Stage install/uninstall behavior

pub mod driver;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::core::{RunContext, Stage};

pub use driver::LabDriver;

/// Performs the side effects of a stage. The engine owns ordering and
/// readiness waits; drivers only install, remove, and observe.
#[async_trait]
pub trait StageDriver: Send + Sync {
    /// Run the stage's install action. May extend the context with
    /// variables for later stages.
    async fn install(&self, stage: &Stage, ctx: &mut RunContext) -> anyhow::Result<()>;

    /// Remove what the stage installed. Missing pieces are not errors.
    async fn uninstall(&self, stage: &Stage, ctx: &RunContext) -> anyhow::Result<()>;

    /// One observation of the stage's readiness condition
    async fn ready(&self, stage: &Stage) -> anyhow::Result<bool>;
}

/// Substitute `{{ key }}` placeholders from the variable map. Unknown
/// placeholders are left verbatim so they surface in cluster errors
/// instead of disappearing silently.
pub fn render_template(template: &str, variables: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match variables.get(key) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_substitutes_variables() {
        let vars = vars(&[("netbox_host", "netbox.lab.local")]);
        assert_eq!(
            render_template("host: {{ netbox_host }}", &vars),
            "host: netbox.lab.local"
        );
        assert_eq!(
            render_template("host: {{netbox_host}}", &vars),
            "host: netbox.lab.local"
        );
    }

    #[test]
    fn test_render_keeps_unknown_placeholders() {
        let vars = vars(&[]);
        assert_eq!(render_template("host: {{ missing }}", &vars), "host: {{ missing }}");
    }

    #[test]
    fn test_render_multiple_occurrences() {
        let vars = vars(&[("ns", "vault")]);
        assert_eq!(
            render_template("{{ ns }}/{{ ns }}-token", &vars),
            "vault/vault-token"
        );
    }
}
