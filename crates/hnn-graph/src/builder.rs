//! Graph construction from a stream of declarations.

use hnn_core::{Declaration, GraphConfig, HnnError, HnnResult, ModelDescriptionProvider};
use tracing::info;

use crate::graph::FeatureGraph;

/// Drain `provider`, then bind forward references and check widths.
pub fn build_graph(
    provider: &mut dyn ModelDescriptionProvider,
    config: GraphConfig,
) -> HnnResult<FeatureGraph> {
    let mut graph = FeatureGraph::new(config);
    let mut count = 0usize;

    while let Some(decl) = provider.next_declaration()? {
        count += 1;
        match decl {
            Declaration::Bundle(b) => {
                graph.add_bundle_decl(&b)?;
            }
            Declaration::Mixture(m) => {
                let mut elems = Vec::with_capacity(m.elements.len());
                for e in &m.elements {
                    elems.push(graph.add_fea_elem(e)?);
                }
                graph.add_fea_mix(&m.name, &elems)?;
            }
            Declaration::Layer(l) => {
                graph.add_layer(&l)?;
            }
            Declaration::Network(n) => {
                let mut layers = Vec::with_capacity(n.layers.len());
                for name in &n.layers {
                    layers.push(graph.layer_id(name).ok_or_else(|| {
                        HnnError::Graph(format!(
                            "network '{}' refers to unknown layer '{name}'",
                            n.name
                        ))
                    })?);
                }
                graph.add_network(&n.name, &layers)?;
            }
            Declaration::Output(o) => {
                let layer = graph.layer_id(&o.layer).ok_or_else(|| {
                    HnnError::Graph(format!("output of stream {} is unknown layer '{}'", o.stream, o.layer))
                })?;
                graph.set_output(o.stream, layer)?;
            }
        }
    }

    graph.resolve_late_bound_sources()?;
    graph.check_consistency()?;

    info!(
        "feature graph built: {} declarations, {} layers, {} networks",
        count,
        graph.layer_ids().len(),
        graph.networks().len()
    );
    Ok(graph)
}
