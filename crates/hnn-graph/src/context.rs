//! Derivation-context propagation and error-graph construction.
//!
//! Every output layer is needed at offset 0. A consumer that reads a
//! producer through a context map `M` while itself derived at offsets `C`
//! needs the producer at `{c + m}`. Requirements flow from consumers to
//! producers, so layers are processed in DFS post-order over
//! producer→consumer edges.

use std::collections::BTreeMap;

use hnn_core::{HnnError, HnnResult};
use tracing::{debug, warn};

use crate::arena::{ElemId, LayerId, MixId};
use crate::graph::{ElemSource, ErrorElem, ErrorMix, FeatureGraph, GradientBuffer};

/// Sorted union of two sorted, duplicate-free offset lists.
pub fn merge_contexts(a: &[i32], b: &[i32]) -> Vec<i32> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

pub fn shift_context(context: &[i32], by: i32) -> Vec<i32> {
    context.iter().map(|c| c + by).collect()
}

/// `{c + m}` for every `c` in `outer` and `m` in `inner`.
pub fn expand_context(outer: &[i32], inner: &[i32]) -> Vec<i32> {
    inner.iter().fold(Vec::new(), |acc, &m| {
        merge_contexts(&acc, &shift_context(outer, m))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}

/// Producer→consumer adjacency, indexed by position in `layers`.
struct LayerEdges {
    layers: Vec<LayerId>,
    consumers: Vec<Vec<usize>>,
}

fn collect_edges(graph: &FeatureGraph) -> HnnResult<LayerEdges> {
    let layers = graph.layers.ids();
    let position: BTreeMap<LayerId, usize> =
        layers.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let mut consumers = vec![Vec::new(); layers.len()];

    for (ci, &consumer) in layers.iter().enumerate() {
        let Some(mix) = graph.layers.try_get(consumer)?.input else {
            continue;
        };
        for &elem in &graph.mixes.try_get(mix)?.elems {
            match &graph.elems.try_get(elem)?.source {
                ElemSource::Layer(src) => {
                    let pi = *position.get(src).ok_or_else(|| {
                        HnnError::Internal(format!("element {elem} reads freed {src}"))
                    })?;
                    if !consumers[pi].contains(&ci) {
                        consumers[pi].push(ci);
                    }
                }
                ElemSource::Pending { name, .. } => {
                    return Err(HnnError::UnresolvedSource(name.clone()));
                }
                _ => {}
            }
        }
    }
    Ok(LayerEdges { layers, consumers })
}

fn visit(
    node: usize,
    edges: &LayerEdges,
    colors: &mut [Color],
    order: &mut Vec<usize>,
    graph: &FeatureGraph,
) -> HnnResult<()> {
    colors[node] = Color::Grey;
    for &next in &edges.consumers[node] {
        match colors[next] {
            Color::White => visit(next, edges, colors, order, graph)?,
            Color::Grey => {
                let name = graph
                    .layer(edges.layers[next])
                    .map(|l| l.name.clone())
                    .unwrap_or_default();
                return Err(HnnError::UnsupportedCycle(name));
            }
            Color::Black => {}
        }
    }
    colors[node] = Color::Black;
    order.push(node);
    Ok(())
}

/// Layers ordered so that every consumer precedes its producers.
///
/// Fails with [`HnnError::UnsupportedCycle`] if a layer depends on itself.
pub fn consumer_first_order(graph: &FeatureGraph) -> HnnResult<Vec<LayerId>> {
    let edges = collect_edges(graph)?;
    let mut colors = vec![Color::White; edges.layers.len()];
    let mut order = Vec::with_capacity(edges.layers.len());
    for start in 0..edges.layers.len() {
        if colors[start] == Color::White {
            visit(start, &edges, &mut colors, &mut order, graph)?;
        }
    }
    Ok(order.into_iter().map(|i| edges.layers[i]).collect())
}

/// Annotate every node with the offsets it must be materialized at and
/// build the error graph. Returns the processing order.
pub fn propagate_context(graph: &mut FeatureGraph) -> HnnResult<Vec<LayerId>> {
    let order = consumer_first_order(graph)?;
    clear_annotations(graph)?;

    // layer derivation contexts, consumers first
    for &id in &order {
        let is_output = graph.outputs().values().any(|l| *l == id);
        let layer = graph.layers.try_get_mut(id)?;
        if layer.is_final || is_output || layer.derivation_context.is_empty() {
            if layer.derivation_context.is_empty() && !layer.is_final && !is_output {
                warn!("layer '{}' has no consumers and is not final", layer.name);
            }
            layer.derivation_context = merge_contexts(&layer.derivation_context, &[0]);
        }
        let derived = layer.derivation_context.clone();
        let Some(mix) = layer.input else { continue };

        for elem in graph.mixes.try_get(mix)?.elems.clone() {
            let e = graph.elems.try_get(elem)?;
            if let ElemSource::Layer(src) = e.source {
                let needed = expand_context(&derived, &e.context);
                let producer = graph.layers.try_get_mut(src)?;
                producer.derivation_context = merge_contexts(&producer.derivation_context, &needed);
            }
        }
    }

    // mixture and element pools
    let mut elem_pools: BTreeMap<ElemId, Vec<i32>> = BTreeMap::new();
    for mix in graph.mixes.ids() {
        let mut pool = Vec::new();
        for owner in graph.mixes.try_get(mix)?.owners.clone() {
            pool = merge_contexts(&pool, &graph.layers.try_get(owner)?.derivation_context);
        }
        let m = graph.mixes.try_get_mut(mix)?;
        m.context_pool = pool.clone();
        for &elem in &m.elems.clone() {
            let e = graph.elems.try_get(elem)?;
            let contribution = if e.is_cache_fed() {
                pool.clone()
            } else {
                expand_context(&pool, &e.context)
            };
            let entry = elem_pools.entry(elem).or_default();
            *entry = merge_contexts(entry, &contribution);
        }
    }
    for (elem, pool) in elem_pools {
        graph.elems.try_get_mut(elem)?.context_pool = pool;
    }

    allocate_buffers(graph)?;
    let shared = build_error_graph(graph)?;

    debug!(
        "context propagated over {} layers ({} error mixtures share a consumer buffer)",
        order.len(),
        shared
    );
    Ok(order)
}

fn clear_annotations(graph: &mut FeatureGraph) -> HnnResult<()> {
    for id in graph.layers.ids() {
        let layer = graph.layers.try_get_mut(id)?;
        layer.derivation_context.clear();
        layer.outputs.clear();
        let err = layer.error_mix.take();
        let grad = layer.input_gradient.take();
        if let Some(err) = err {
            graph.buffers.release(err.buffer)?;
        }
        if let Some(grad) = grad {
            graph.buffers.release(grad)?;
        }
    }
    for id in graph.mixes.ids() {
        let mix = graph.mixes.try_get_mut(id)?;
        mix.context_pool.clear();
        mix.matrices.clear();
        mix.filled_batch = None;
    }
    for id in graph.elems.ids() {
        let elem = graph.elems.try_get_mut(id)?;
        elem.context_pool.clear();
        elem.matrices.clear();
    }
    Ok(())
}

fn allocate_buffers(graph: &mut FeatureGraph) -> HnnResult<()> {
    for id in graph.layers.ids() {
        let (width, context) = {
            let l = graph.layers.try_get(id)?;
            (l.input_dim, l.derivation_context.clone())
        };
        let buffer = graph.buffers.insert(GradientBuffer::new(width, context.clone()));
        graph.buffers.acquire(buffer)?;
        let layer = graph.layers.try_get_mut(id)?;
        layer.input_gradient = Some(buffer);
        layer.outputs = vec![None; context.len()];
    }
    Ok(())
}

/// Mirror every backprop-enabled graph-output element into the producer's
/// error mixture. Returns how many mixtures alias a consumer buffer.
fn build_error_graph(graph: &mut FeatureGraph) -> HnnResult<usize> {
    let mut per_producer: BTreeMap<LayerId, Vec<ErrorElem>> = BTreeMap::new();
    for consumer in graph.layers.ids() {
        let Some(mix) = graph.layers.try_get(consumer)?.input else {
            continue;
        };
        let mut offset = 0;
        for &elem in &graph.mixes.try_get(mix)?.elems {
            let e = graph.elems.try_get(elem)?;
            if let (ElemSource::Layer(src), true) = (&e.source, e.backprop) {
                per_producer.entry(*src).or_default().push(ErrorElem {
                    consumer,
                    consumer_offset: offset,
                    source_offset: e.dim_offset,
                    width: e.width,
                    context: e.context.clone(),
                });
            }
            offset += e.expanded_width();
        }
    }

    let mut shared = 0;
    for (producer, elems) in per_producer {
        let (node_count, context) = {
            let p = graph.layers.try_get(producer)?;
            (p.node_count, p.derivation_context.clone())
        };
        let alias = match elems.as_slice() {
            [only] => {
                let consumer = graph.layers.try_get(only.consumer)?;
                let full = only.context == [0]
                    && only.width == consumer.input_dim
                    && only.source_offset == 0
                    && only.width == node_count
                    && context == consumer.derivation_context;
                if full { consumer.input_gradient } else { None }
            }
            _ => None,
        };
        let (buffer, aliased) = match alias {
            Some(buffer) => {
                shared += 1;
                (buffer, true)
            }
            None => (
                graph.buffers.insert(GradientBuffer::new(node_count, context)),
                false,
            ),
        };
        graph.buffers.acquire(buffer)?;
        graph.layers.try_get_mut(producer)?.error_mix = Some(ErrorMix {
            elems,
            buffer,
            aliased,
        });
    }
    Ok(shared)
}

/// Mixtures whose elements are all fed by the cache.
pub fn cache_fed_mixes(graph: &FeatureGraph) -> Vec<MixId> {
    graph
        .mixes
        .iter()
        .filter(|(_, m)| {
            m.elems
                .iter()
                .all(|e| graph.elem(*e).is_some_and(|e| e.is_cache_fed()))
        })
        .map(|(id, _)| id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_sorted_union() {
        assert_eq!(merge_contexts(&[-2, 0, 3], &[-1, 0, 4]), vec![-2, -1, 0, 3, 4]);
        assert_eq!(merge_contexts(&[], &[1]), vec![1]);
        assert_eq!(merge_contexts(&[5], &[]), vec![5]);
    }

    #[test]
    fn test_expand_context() {
        assert_eq!(expand_context(&[0], &[-1, 0, 1]), vec![-1, 0, 1]);
        assert_eq!(expand_context(&[-1, 0, 1], &[-1, 1]), vec![-2, -1, 0, 1, 2]);
        assert_eq!(shift_context(&[-1, 2], 3), vec![2, 5]);
    }
}
