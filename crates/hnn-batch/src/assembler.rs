//! Materializing graph inputs for one cache batch.

use candle_core::Tensor;
use hnn_cache::{CacheBatch, StreamingCache};
use hnn_core::{FrameIndex, HnnError, HnnResult, UtteranceLabels};
use hnn_graph::{ElemId, ElemSource, FeatureGraph, LayerId, MixId, cache_fed_mixes};
use tracing::debug;

/// Copies cache frames into the feature graph, batch by batch.
#[derive(Debug, Clone)]
pub struct BatchAssembler {
    stream: usize,
    output_stream: usize,
    batch: Option<u64>,
}

impl BatchAssembler {
    /// Assembler for input stream `stream`; labels go to output stream 0.
    pub fn new(stream: usize) -> Self {
        Self {
            stream,
            output_stream: 0,
            batch: None,
        }
    }

    pub fn with_output_stream(mut self, stream: usize) -> Self {
        self.output_stream = stream;
        self
    }

    pub fn stream(&self) -> usize {
        self.stream
    }

    /// Index of the batch last assembled.
    pub fn current_batch(&self) -> Option<u64> {
        self.batch
    }

    /// Fill every cache-fed element and mixture and the label targets.
    /// Returns the number of frames.
    pub fn assemble(
        &mut self,
        graph: &mut FeatureGraph,
        cache: &StreamingCache,
        batch: &CacheBatch,
    ) -> HnnResult<usize> {
        self.batch = Some(batch.index);
        if batch.is_empty() {
            return Ok(0);
        }
        let device = graph.device().clone();

        for id in graph.input_elems(self.stream).to_vec() {
            let elem = graph
                .elem(id)
                .ok_or_else(|| HnnError::Internal(format!("{id} vanished")))?;
            let mut matrices = Vec::with_capacity(elem.context_pool.len());
            for &offset in &elem.context_pool {
                let data = match elem.source {
                    ElemSource::RawStream { .. } => expand_raw(
                        cache,
                        &batch.frames,
                        elem.src_dim,
                        elem.dim_offset,
                        elem.width,
                        &elem.context,
                        offset,
                    )?,
                    ElemSource::Auxiliary { index, .. } => expand_aux(
                        cache,
                        &batch.frames,
                        index,
                        elem.dim_offset,
                        elem.width,
                        elem.context.len(),
                    )?,
                    _ => {
                        return Err(HnnError::Internal(format!(
                            "{id} is listed as an input but is not cache-fed"
                        )));
                    }
                };
                matrices.push(Tensor::from_vec(
                    data,
                    (batch.len(), elem.expanded_width()),
                    &device,
                )?);
            }
            if let Some(elem) = graph.elem_mut(id) {
                elem.matrices = matrices;
            }
        }

        for mix in cache_fed_mixes(graph) {
            self.fill_mix_by_id(graph, mix)?;
        }
        self.fill_labels(graph, cache, batch)?;

        debug!("assembled batch {} ({} frames)", batch.index, batch.len());
        Ok(batch.len())
    }

    /// Fill the input mixture of `layer` for the current batch.
    ///
    /// Producer outputs must already be set. A mixture shared by several
    /// layers is filled once; returns `false` when it was already filled.
    pub fn fill_mix(&self, graph: &mut FeatureGraph, layer: LayerId) -> HnnResult<bool> {
        let l = graph
            .layer(layer)
            .ok_or_else(|| HnnError::Internal(format!("{layer} vanished")))?;
        let mix = l
            .input
            .ok_or_else(|| HnnError::Graph(format!("layer '{}' has no input mixture", l.name)))?;
        self.fill_mix_by_id(graph, mix)
    }

    fn fill_mix_by_id(&self, graph: &mut FeatureGraph, mix: MixId) -> HnnResult<bool> {
        let batch = self
            .batch
            .ok_or_else(|| HnnError::Internal("no batch has been assembled".into()))?;
        let m = graph
            .mix(mix)
            .ok_or_else(|| HnnError::Internal(format!("{mix} vanished")))?;
        if m.filled_batch == Some(batch) {
            return Ok(false);
        }

        let mut matrices = Vec::with_capacity(m.context_pool.len());
        for &offset in &m.context_pool {
            let mut parts = Vec::with_capacity(m.elems.len());
            for &id in &m.elems {
                parts.push(elem_part(graph, id, offset)?);
            }
            let matrix = match parts.len() {
                1 => parts.remove(0),
                _ => Tensor::cat(&parts, 1)?,
            };
            let cols = matrix.dims().get(1).copied().unwrap_or(0);
            if cols != m.dim {
                return Err(HnnError::DimensionMismatch(format!(
                    "mixture '{}' assembled {cols} columns, expected {}",
                    m.name, m.dim
                )));
            }
            matrices.push(matrix);
        }

        if let Some(m) = graph.mix_mut(mix) {
            m.matrices = matrices;
            m.filled_batch = Some(batch);
        }
        Ok(true)
    }

    fn fill_labels(
        &self,
        graph: &mut FeatureGraph,
        cache: &StreamingCache,
        batch: &CacheBatch,
    ) -> HnnResult<()> {
        let first = cache
            .labels(batch.frames[0].utterance)
            .ok_or_else(|| HnnError::Internal("batch refers to an unknown utterance".into()))?;
        if matches!(first, UtteranceLabels::None | UtteranceLabels::Lattices { .. }) {
            return Ok(());
        }

        let layer = graph.output_layer(self.output_stream).ok_or_else(|| {
            HnnError::Graph(format!(
                "labels are loaded but output stream {} has no layer",
                self.output_stream
            ))
        })?;
        let width = graph
            .layer(layer)
            .ok_or_else(|| HnnError::Internal(format!("{layer} vanished")))?
            .node_count;

        let mut data = vec![0f32; batch.len() * width];
        for (row, frame) in batch.frames.iter().enumerate() {
            let name = cache
                .utterance(frame.utterance)
                .map(|u| u.name.as_str())
                .unwrap_or("?");
            let dest = &mut data[row * width..(row + 1) * width];
            match cache.labels(frame.utterance) {
                Some(UtteranceLabels::Targets(targets)) => {
                    let target = targets.get(frame.frame).copied().ok_or_else(|| {
                        HnnError::Internal(format!("'{name}' has no target for frame {}", frame.frame))
                    })?;
                    if target >= width {
                        return Err(HnnError::DimensionMismatch(format!(
                            "target {target} of '{name}' frame {} exceeds output width {width}",
                            frame.frame
                        )));
                    }
                    dest[target] = 1.0;
                }
                Some(UtteranceLabels::Features(features)) => {
                    if features.cols() != width {
                        return Err(HnnError::DimensionMismatch(format!(
                            "feature labels of '{name}' are {} wide, output layer has {width} nodes",
                            features.cols()
                        )));
                    }
                    dest.copy_from_slice(features.row(frame.frame));
                }
                _ => {
                    return Err(HnnError::InvalidData(format!(
                        "utterance '{name}' has no frame labels"
                    )));
                }
            }
        }

        let targets = Tensor::from_vec(data, (batch.len(), width), graph.device())?;
        graph.set_targets(self.output_stream, targets);
        Ok(())
    }
}

fn clamp_frame(frame: usize, offset: i32, len: usize) -> usize {
    let t = frame as i64 + offset as i64;
    t.clamp(0, len as i64 - 1) as usize
}

fn expand_raw(
    cache: &StreamingCache,
    frames: &[FrameIndex],
    src_dim: usize,
    dim_offset: usize,
    width: usize,
    context: &[i32],
    pool_offset: i32,
) -> HnnResult<Vec<f32>> {
    let mut data = Vec::with_capacity(frames.len() * width * context.len());
    for fi in frames {
        let matrix = cache.frames(fi.utterance)?;
        if matrix.cols() != src_dim {
            return Err(HnnError::DimensionMismatch(format!(
                "stream frames are {} wide, feature element expects {src_dim}",
                matrix.cols()
            )));
        }
        for &c in context {
            let row = matrix.row(clamp_frame(fi.frame, pool_offset + c, matrix.rows()));
            data.extend_from_slice(&row[dim_offset..dim_offset + width]);
        }
    }
    Ok(data)
}

fn expand_aux(
    cache: &StreamingCache,
    frames: &[FrameIndex],
    index: usize,
    dim_offset: usize,
    width: usize,
    copies: usize,
) -> HnnResult<Vec<f32>> {
    let mut data = Vec::with_capacity(frames.len() * width * copies);
    for fi in frames {
        let utt = cache
            .utterance(fi.utterance)
            .ok_or_else(|| HnnError::Internal(format!("unknown utterance {}", fi.utterance)))?;
        let aux = utt.aux(index)?;
        if aux.len() < dim_offset + width {
            return Err(HnnError::DimensionMismatch(format!(
                "auxiliary vector {index} of '{}' has {} values, element reads [{dim_offset}, {})",
                utt.name,
                aux.len(),
                dim_offset + width
            )));
        }
        for _ in 0..copies {
            data.extend_from_slice(&aux[dim_offset..dim_offset + width]);
        }
    }
    Ok(data)
}

/// One element's contribution to a mixture at `offset`.
fn elem_part(graph: &FeatureGraph, id: ElemId, offset: i32) -> HnnResult<Tensor> {
    let elem = graph
        .elem(id)
        .ok_or_else(|| HnnError::Internal(format!("{id} vanished")))?;

    if elem.is_cache_fed() {
        let idx = elem.pool_index(offset).ok_or_else(|| {
            HnnError::Internal(format!("{id} was not materialized at offset {offset}"))
        })?;
        return elem
            .matrices
            .get(idx)
            .cloned()
            .ok_or_else(|| HnnError::Internal(format!("{id} has not been assembled")));
    }

    let producer = elem
        .source_layer()
        .ok_or_else(|| HnnError::UnresolvedSource(format!("{id}")))?;
    let full = elem.dim_offset == 0 && elem.width == elem.src_dim;
    let mut parts = Vec::with_capacity(elem.context.len());
    for &c in &elem.context {
        let output = graph.layer_output(producer, offset + c).ok_or_else(|| {
            HnnError::Graph(format!(
                "output of {producer} at offset {} is not available",
                offset + c
            ))
        })?;
        parts.push(if full {
            output.clone()
        } else {
            output.narrow(1, elem.dim_offset, elem.width)?
        });
    }
    Ok(match parts.len() {
        1 => parts.remove(0),
        _ => Tensor::cat(&parts, 1)?,
    })
}
