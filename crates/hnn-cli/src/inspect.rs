//! Печать структуры графа признаков.

use anyhow::{Context, Result};
use hnn_graph::{ElemSource, FeatureGraph, LayerId};

fn source_name(graph: &FeatureGraph, source: &ElemSource) -> String {
    match source {
        ElemSource::RawStream { stream } => format!("stream {stream}"),
        ElemSource::Auxiliary { stream, index } => format!("aux {index} of stream {stream}"),
        ElemSource::Layer(id) => graph
            .layer(*id)
            .map(|l| format!("layer {}", l.name))
            .unwrap_or_else(|| id.to_string()),
        ElemSource::Pending { name, .. } => format!("unresolved {name}"),
    }
}

/// Вывести сети, слои, их входы и буферы ошибок.
pub fn print_graph(graph: &FeatureGraph, order: &[LayerId]) -> Result<()> {
    for net in graph.networks() {
        let names: Vec<&str> = net
            .layers
            .iter()
            .filter_map(|id| graph.layer(*id).map(|l| l.name.as_str()))
            .collect();
        println!("🕸  Network {}: {}", net.name, names.join(" -> "));
    }
    for (stream, layer) in graph.outputs() {
        let name = graph.layer(*layer).map(|l| l.name.as_str()).unwrap_or("?");
        println!("🎯 Output stream {stream}: {name}");
    }
    println!();

    println!("Layers (consumers first):");
    for &id in order {
        let layer = graph.layer(id).context("layer vanished")?;
        println!(
            "  • {} [{} -> {}] {} context {:?}{}",
            layer.name,
            layer.input_dim,
            layer.node_count,
            layer.activation,
            layer.derivation_context,
            if layer.is_final { " (final)" } else { "" }
        );
        for bundle in [layer.weights, layer.bias] {
            if let Some(b) = graph.bundle(bundle) {
                println!(
                    "      bundle {} {:?} uses={}",
                    b.name(),
                    b.dims(),
                    graph.bundle_uses(bundle)
                );
            }
        }
        if let Some(mix_id) = layer.input {
            let mix = graph.mix(mix_id).context("mixture vanished")?;
            println!(
                "      input {} dim={} pool={:?} uses={}",
                mix.name,
                mix.dim,
                mix.context_pool,
                graph.mix_uses(mix_id)
            );
            for elem_id in &mix.elems {
                let elem = graph.elem(*elem_id).context("element vanished")?;
                println!(
                    "        - {} [{}..{}) context {:?}",
                    source_name(graph, &elem.source),
                    elem.dim_offset,
                    elem.dim_offset + elem.width,
                    elem.context
                );
            }
        }
        if let Some(err) = &layer.error_mix {
            println!(
                "      error buffer {} ({} elements, {}, uses={})",
                err.buffer,
                err.elems.len(),
                if err.aliased { "aliased" } else { "owned" },
                graph.buffer_uses(err.buffer)
            );
        }
    }
    Ok(())
}
