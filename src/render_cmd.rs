//! `render`: show the configuration a set of relations would produce.
//!
//! Reads a JSON array of relation descriptors (the same shape as the
//! `relation` field of a `relation-changed` event), renders it with the
//! configured settings and prints the result. The workload is not touched.

use anyhow::{bail, Context, Result};
use std::path::Path;

use grafana_operator_core::models::{ConfigArtifact, RelationDescriptor};
use grafana_operator_core::relation::RelationView;
use grafana_operator_core::render::render;

use crate::config::Config;

/// Render the artifact for the descriptors in `file`.
pub fn render_file(config: &Config, file: &Path) -> Result<ConfigArtifact> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read relations file: {}", file.display()))?;
    let relations: Vec<RelationDescriptor> =
        serde_json::from_str(&content).with_context(|| "Failed to parse relations file")?;

    let mut view = RelationView::new();
    for rel in relations {
        let id = rel.id;
        if let Err(e) = view.apply_changed(rel) {
            bail!("relation {} rejected: {}", id, e);
        }
    }

    let snapshot = view.snapshot()?;
    let peers = view.peer_states()?;
    let artifact = render(&config.render_settings(), &snapshot, &peers)
        .map_err(|e| anyhow::anyhow!("cannot render configuration: {}", e))?;
    Ok(artifact)
}

pub fn run_render(config: &Config, file: &Path) -> Result<()> {
    let artifact = render_file(config, file)?;
    let layer = artifact.layer();

    println!("fingerprint: {}", artifact.fingerprint());
    println!(
        "layer: {} ({}) -> {}",
        layer.service,
        layer.startup,
        layer.command.join(" ")
    );
    for (path, content) in artifact.files() {
        println!();
        println!("--- {} ---", path);
        print!("{}", String::from_utf8_lossy(content));
        if !content.ends_with(b"\n") {
            println!();
        }
    }
    Ok(())
}
