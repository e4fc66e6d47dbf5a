//! Script template commands - `reshard-phase render` and `reshard-phase templates`.

use anyhow::{Context, Result};
use reshard_phase::config::ReshardConfig;
use reshard_phase::phases::remap_ring::RemapContext;
use reshard_phase::plan::Plan;
use reshard_phase::template::TemplateLoader;
use std::path::Path;

/// Render `template` for the plan in `plan_path` and print it.
///
/// Plan-derived variables (`WORKSPACE_ID`, `TRANSITION`, `PLAN_UUID`,
/// `SHARD`, `NEW_SHARD`) are filled in; anything else comes from `--var`.
pub fn cmd_render(
    config_path: &Path,
    template: &str,
    plan_path: &Path,
    vars: &[(String, String)],
) -> Result<()> {
    let config = ReshardConfig::load_layered(config_path)?;
    let plan = Plan::load(plan_path)?;

    let mut script_vars = RemapContext::new(plan).vars;
    for (name, value) in vars {
        script_vars.set(name.as_str(), value.as_str());
    }

    let loader = TemplateLoader::new(config.templates.dir.clone());
    let script = loader
        .load(template)?
        .render(&script_vars)
        .with_context(|| format!("Failed to render {}", TemplateLoader::file_name(template)))?;

    print!("{}", script);
    Ok(())
}

pub fn cmd_templates() {
    for name in TemplateLoader::embedded_names() {
        println!("{:<20} {}", name, TemplateLoader::file_name(&name));
    }
}
