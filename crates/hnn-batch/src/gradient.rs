//! Summing consumer input gradients into a producer's error buffer.

use candle_core::Tensor;
use hnn_core::{HnnError, HnnResult};
use hnn_graph::{FeatureGraph, LayerId};

/// Accumulate the error of `layer` from the input gradients of its consumers.
///
/// Each error element contributes, for every entry `c` of its context map,
/// the consumer gradient at offset `q - c` to the producer offset `q`.
/// Aliased error buffers already hold the consumer gradient; returns
/// `false` for them without touching anything.
pub fn accumulate_errors(graph: &mut FeatureGraph, layer: LayerId) -> HnnResult<bool> {
    let l = graph
        .layer(layer)
        .ok_or_else(|| HnnError::Internal(format!("{layer} vanished")))?;
    let Some(err) = l.error_mix.as_ref() else {
        return Ok(false);
    };
    if err.aliased {
        return Ok(false);
    }
    let node_count = l.node_count;
    let context = l.derivation_context.clone();
    let buffer = err.buffer;

    let mut sums: Vec<Option<(usize, Vec<f32>)>> = vec![None; context.len()];
    for (qi, &q) in context.iter().enumerate() {
        for e in &err.elems {
            let consumer = graph
                .layer(e.consumer)
                .ok_or_else(|| HnnError::Internal(format!("{} vanished", e.consumer)))?;
            let Some(grads) = consumer.input_gradient.and_then(|b| graph.buffer(b)) else {
                continue;
            };
            for (k, &c) in e.context.iter().enumerate() {
                let Some(grad) = grads.get(q - c) else {
                    continue;
                };
                let slice = grad
                    .narrow(1, e.consumer_offset + k * e.width, e.width)?
                    .to_vec2::<f32>()?;
                let rows = slice.len();
                let (acc_rows, acc) =
                    sums[qi].get_or_insert_with(|| (rows, vec![0f32; rows * node_count]));
                if *acc_rows != rows {
                    return Err(HnnError::DimensionMismatch(format!(
                        "gradient of {} has {rows} rows, expected {acc_rows}",
                        e.consumer
                    )));
                }
                for (r, values) in slice.iter().enumerate() {
                    let dest = &mut acc[r * node_count + e.source_offset..][..e.width];
                    for (d, v) in dest.iter_mut().zip(values) {
                        *d += v;
                    }
                }
            }
        }
    }

    let device = graph.device().clone();
    let mut matrices = Vec::with_capacity(sums.len());
    for sum in sums {
        matrices.push(match sum {
            Some((rows, data)) => Some(Tensor::from_vec(data, (rows, node_count), &device)?),
            None => None,
        });
    }
    let buf = graph
        .buffer_mut(buffer)
        .ok_or_else(|| HnnError::Internal(format!("{buffer} vanished")))?;
    buf.matrices = matrices;
    Ok(true)
}
