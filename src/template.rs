//! Script templates for remote execution.
//!
//! Templates are shell scripts with `{{NAME}}` placeholders. The defaults are
//! embedded in the binary from `templates/`; an override directory, when
//! configured, takes precedence file by file:
//!
//! ```text
//! templates/
//! ├── hashring-prime-workspace.sh
//! ├── hashring-remap-vnodes.sh
//! ├── hashring-create-archive.sh
//! └── hashring-cleanup.sh
//! ```
//!
//! Rendering is pure: a template plus a flat variable map yields a script,
//! and a placeholder with no value is an error rather than an empty string.

use crate::errors::TemplateError;
use regex::{Captures, Regex};
use rust_embed::RustEmbed;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::LazyLock;

static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Z][A-Z0-9_]*)\s*\}\}").expect("placeholder regex is valid")
});

#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/templates/"]
struct EmbeddedTemplates;

/// Flat mapping of variable names to values substituted into templates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ScriptVars(BTreeMap<String, String>);

impl ScriptVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ScriptVars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A named, parameterised command script. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct ScriptTemplate {
    name: String,
    source: String,
}

impl ScriptTemplate {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Placeholder names referenced by this template, deduplicated, in order of
    /// first appearance.
    pub fn variables(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for caps in PLACEHOLDER_REGEX.captures_iter(&self.source) {
            if let Some(m) = caps.get(1)
                && !seen.contains(&m.as_str())
            {
                seen.push(m.as_str());
            }
        }
        seen
    }

    /// Substitute every placeholder from `vars`.
    pub fn render(&self, vars: &ScriptVars) -> Result<String, TemplateError> {
        if let Some(missing) = self.variables().into_iter().find(|v| vars.get(v).is_none()) {
            return Err(TemplateError::UnknownVariable {
                template: self.name.clone(),
                variable: missing.to_string(),
            });
        }

        let rendered = PLACEHOLDER_REGEX.replace_all(&self.source, |caps: &Captures| {
            vars.get(&caps[1]).unwrap_or_default().to_string()
        });
        Ok(rendered.into_owned())
    }
}

/// Loads templates by short name (`remap-vnodes` → `hashring-remap-vnodes.sh`).
#[derive(Debug, Clone, Default)]
pub struct TemplateLoader {
    override_dir: Option<PathBuf>,
}

impl TemplateLoader {
    pub fn new(override_dir: Option<PathBuf>) -> Self {
        Self { override_dir }
    }

    pub fn file_name(name: &str) -> String {
        format!("hashring-{}.sh", name)
    }

    /// Load one template, preferring the override directory over the embedded copy.
    pub fn load(&self, name: &str) -> Result<ScriptTemplate, TemplateError> {
        let file_name = Self::file_name(name);

        if let Some(dir) = &self.override_dir {
            let path = dir.join(&file_name);
            if path.exists() {
                let source = std::fs::read_to_string(&path)
                    .map_err(|source| TemplateError::ReadFailed { path, source })?;
                return Ok(ScriptTemplate::new(name, source));
            }
        }

        let file = EmbeddedTemplates::get(&file_name).ok_or_else(|| TemplateError::NotFound {
            name: file_name.clone(),
        })?;
        let source = String::from_utf8(file.data.into_owned())
            .map_err(|_| TemplateError::InvalidEncoding { name: file_name })?;
        Ok(ScriptTemplate::new(name, source))
    }

    /// Load every named template, failing on the first one that cannot be loaded.
    pub fn load_set(&self, names: &[&str]) -> Result<TemplateSet, TemplateError> {
        let mut templates = HashMap::new();
        for name in names {
            templates.insert(name.to_string(), self.load(name)?);
        }
        Ok(TemplateSet { templates })
    }

    /// Names of all embedded templates, without prefix or extension.
    pub fn embedded_names() -> Vec<String> {
        let mut names: Vec<String> = EmbeddedTemplates::iter()
            .filter_map(|f| {
                f.strip_prefix("hashring-")
                    .and_then(|n| n.strip_suffix(".sh"))
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        names
    }
}

/// Templates loaded for one phase invocation.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: HashMap<String, ScriptTemplate>,
}

impl TemplateSet {
    pub fn insert(&mut self, template: ScriptTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    /// Render the named template.
    pub fn render(&self, name: &str, vars: &ScriptVars) -> Result<String, TemplateError> {
        self.templates
            .get(name)
            .ok_or_else(|| TemplateError::NotFound {
                name: name.to_string(),
            })?
            .render(vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> ScriptVars {
        [("WORKSPACE_ID", "p.1234abcd"), ("SHARD", "3")]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_render_substitutes_all_occurrences() {
        let t = ScriptTemplate::new("t", "cd /var/tmp/{{WORKSPACE_ID}} && echo {{SHARD}} {{ SHARD }}");
        assert_eq!(t.render(&vars()).unwrap(), "cd /var/tmp/p.1234abcd && echo 3 3");
    }

    #[test]
    fn test_render_unknown_variable_is_error() {
        let t = ScriptTemplate::new("t", "echo {{NEW_SHARD}}");
        let err = t.render(&vars()).unwrap_err();
        match err {
            TemplateError::UnknownVariable { template, variable } => {
                assert_eq!(template, "t");
                assert_eq!(variable, "NEW_SHARD");
            }
            other => panic!("Expected UnknownVariable, got {:?}", other),
        }
    }

    #[test]
    fn test_render_leaves_shell_syntax_alone() {
        let t = ScriptTemplate::new("t", "echo ${HOME} $((1 + 2)) {lower}");
        assert_eq!(t.render(&ScriptVars::new()).unwrap(), "echo ${HOME} $((1 + 2)) {lower}");
    }

    #[test]
    fn test_variables_are_deduplicated_in_order() {
        let t = ScriptTemplate::new("t", "{{B}} {{A}} {{B}}");
        assert_eq!(t.variables(), vec!["B", "A"]);
    }

    #[test]
    fn test_embedded_templates_are_present() {
        let names = TemplateLoader::embedded_names();
        for expected in ["cleanup", "create-archive", "prime-workspace", "remap-vnodes"] {
            assert!(names.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn test_remap_template_receives_status_url() {
        let loader = TemplateLoader::default();
        let t = loader.load("remap-vnodes").unwrap();
        assert!(t.variables().contains(&"STATUS_URL"));
    }

    #[test]
    fn test_override_dir_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hashring-cleanup.sh"), "echo custom {{WORKSPACE_ID}}").unwrap();

        let loader = TemplateLoader::new(Some(dir.path().to_path_buf()));
        let rendered = loader.load("cleanup").unwrap().render(&vars()).unwrap();
        assert_eq!(rendered, "echo custom p.1234abcd");

        // Templates absent from the override dir fall back to the embedded copy.
        assert!(loader.load("prime-workspace").is_ok());
    }

    #[test]
    fn test_missing_template() {
        let err = TemplateLoader::default().load("nonexistent").unwrap_err();
        assert!(matches!(err, TemplateError::NotFound { .. }));
    }

    #[test]
    fn test_template_set_render() {
        let mut set = TemplateSet::default();
        set.insert(ScriptTemplate::new("cleanup", "rm -rf {{WORKSPACE_ID}}"));
        assert_eq!(set.render("cleanup", &vars()).unwrap(), "rm -rf p.1234abcd");
        assert!(set.render("other", &vars()).is_err());
    }
}
