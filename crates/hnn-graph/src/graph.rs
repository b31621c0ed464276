//! Feature graph: elements, mixtures, layers and networks.
//!
//! Nodes live in reference-counted arenas and point at each other through
//! typed ids. Forward references from feature elements to layers declared
//! later stay `Pending` until [`FeatureGraph::resolve_late_bound_sources`].

use std::collections::{BTreeMap, HashMap};

use candle_core::{Device, Tensor};
use hnn_core::{
    ActivationKind, BundleDecl, ElemDecl, GraphConfig, HnnError, HnnResult, LayerDecl, LayerKind,
    SourceDecl,
};
use tracing::{debug, warn};

use crate::arena::{Arena, BufferId, BundleId, ElemId, LayerId, MixId};
use crate::bundle::TensorBundle;

// ---------------------------------------------------------------------------
// Feature elements
// ---------------------------------------------------------------------------

/// Where a feature element takes its values from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElemSource {
    /// Raw observation stream filled by the cache.
    RawStream { stream: usize },
    /// Output of another layer.
    Layer(LayerId),
    /// Per-utterance auxiliary vector of a stream.
    Auxiliary { stream: usize, index: usize },
    /// Layer referenced by name before its declaration.
    Pending {
        name: String,
        src_dim: Option<usize>,
    },
}

/// A contiguous slice of a source, expanded over relative frame offsets.
#[derive(Debug, Clone)]
pub struct FeaElem {
    pub source: ElemSource,
    pub src_dim: usize,
    pub dim_offset: usize,
    pub width: usize,
    /// Strictly increasing relative frame offsets.
    pub context: Vec<i32>,
    /// Error flows back into the source layer (graph-output elements only).
    pub backprop: bool,
    /// Offsets this element must be materialized at.
    pub context_pool: Vec<i32>,
    /// One `(frames × width·|context|)` matrix per context-pool entry.
    pub matrices: Vec<Tensor>,
}

impl FeaElem {
    /// Width after context expansion.
    pub fn expanded_width(&self) -> usize {
        self.width * self.context.len()
    }

    /// Filled directly by the cache (raw stream or auxiliary vector).
    pub fn is_cache_fed(&self) -> bool {
        matches!(
            self.source,
            ElemSource::RawStream { .. } | ElemSource::Auxiliary { .. }
        )
    }

    pub fn source_layer(&self) -> Option<LayerId> {
        match self.source {
            ElemSource::Layer(id) => Some(id),
            _ => None,
        }
    }

    /// Stream the cache fills this element from.
    pub fn cache_stream(&self) -> Option<usize> {
        match self.source {
            ElemSource::RawStream { stream } | ElemSource::Auxiliary { stream, .. } => Some(stream),
            _ => None,
        }
    }

    /// Position of `offset` in the context pool.
    pub fn pool_index(&self, offset: i32) -> Option<usize> {
        self.context_pool.binary_search(&offset).ok()
    }

    fn same_input(&self, other: &FeaElem) -> bool {
        self.source == other.source
            && self.src_dim == other.src_dim
            && self.dim_offset == other.dim_offset
            && self.width == other.width
            && self.context == other.context
    }
}

// ---------------------------------------------------------------------------
// Mixtures
// ---------------------------------------------------------------------------

/// Ordered concatenation of feature elements consumed by one or more layers.
#[derive(Debug, Clone)]
pub struct FeaMix {
    pub name: String,
    pub elems: Vec<ElemId>,
    pub dim: usize,
    pub owners: Vec<LayerId>,
    pub context_pool: Vec<i32>,
    /// One `(frames × dim)` matrix per context-pool entry.
    pub matrices: Vec<Tensor>,
    /// Batch the matrices were last filled for.
    pub filled_batch: Option<u64>,
}

impl FeaMix {
    pub fn pool_index(&self, offset: i32) -> Option<usize> {
        self.context_pool.binary_search(&offset).ok()
    }
}

// ---------------------------------------------------------------------------
// Error graph
// ---------------------------------------------------------------------------

/// Slice of a consumer's input gradient that belongs to a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorElem {
    pub consumer: LayerId,
    /// Column where the element starts inside the consumer's input.
    pub consumer_offset: usize,
    /// Column where the element starts inside the producer's output.
    pub source_offset: usize,
    pub width: usize,
    pub context: Vec<i32>,
}

/// Accumulated error for a producer layer.
#[derive(Debug, Clone)]
pub struct ErrorMix {
    pub elems: Vec<ErrorElem>,
    pub buffer: BufferId,
    /// The buffer is the single consumer's input-gradient buffer.
    pub aliased: bool,
}

/// Per-context gradient matrices of one layer input or error mixture.
#[derive(Debug, Clone)]
pub struct GradientBuffer {
    pub width: usize,
    pub context: Vec<i32>,
    pub matrices: Vec<Option<Tensor>>,
}

impl GradientBuffer {
    pub fn new(width: usize, context: Vec<i32>) -> Self {
        let matrices = vec![None; context.len()];
        Self {
            width,
            context,
            matrices,
        }
    }

    pub fn get(&self, offset: i32) -> Option<&Tensor> {
        let idx = self.context.binary_search(&offset).ok()?;
        self.matrices[idx].as_ref()
    }
}

// ---------------------------------------------------------------------------
// Layers and networks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LayerElem {
    pub name: String,
    pub kind: LayerKind,
    pub input_dim: usize,
    pub node_count: usize,
    pub weights: BundleId,
    pub bias: BundleId,
    pub activation: ActivationKind,
    pub activation_params: Vec<BundleId>,
    pub input: Option<MixId>,
    pub error_mix: Option<ErrorMix>,
    /// Relative offsets at which this layer's output is required.
    pub derivation_context: Vec<i32>,
    pub is_final: bool,
    /// Number of feature elements reading this layer's output.
    pub consumers: usize,
    pub network: Option<usize>,
    pub input_gradient: Option<BufferId>,
    /// Output per derivation-context entry, written by the numeric code.
    pub outputs: Vec<Option<Tensor>>,
}

impl LayerElem {
    pub fn context_index(&self, offset: i32) -> Option<usize> {
        self.derivation_context.binary_search(&offset).ok()
    }
}

#[derive(Debug, Clone)]
pub struct Network {
    pub name: String,
    pub layers: Vec<LayerId>,
}

// ---------------------------------------------------------------------------
// FeatureGraph
// ---------------------------------------------------------------------------

/// Owner of every graph node.
#[derive(Debug)]
pub struct FeatureGraph {
    pub(crate) config: GraphConfig,
    pub(crate) device: Device,
    pub(crate) bundles: Arena<BundleId, TensorBundle>,
    pub(crate) elems: Arena<ElemId, FeaElem>,
    pub(crate) mixes: Arena<MixId, FeaMix>,
    pub(crate) layers: Arena<LayerId, LayerElem>,
    pub(crate) buffers: Arena<BufferId, GradientBuffer>,
    bundle_names: HashMap<String, BundleId>,
    mix_names: HashMap<String, MixId>,
    layer_names: HashMap<String, LayerId>,
    networks: Vec<Network>,
    outputs: BTreeMap<usize, LayerId>,
    inputs: BTreeMap<usize, Vec<ElemId>>,
    targets: BTreeMap<usize, Tensor>,
}

impl FeatureGraph {
    pub fn new(config: GraphConfig) -> Self {
        Self::with_device(config, Device::Cpu)
    }

    pub fn with_device(config: GraphConfig, device: Device) -> Self {
        Self {
            config,
            device,
            bundles: Arena::new(),
            elems: Arena::new(),
            mixes: Arena::new(),
            layers: Arena::new(),
            buffers: Arena::new(),
            bundle_names: HashMap::new(),
            mix_names: HashMap::new(),
            layer_names: HashMap::new(),
            networks: Vec::new(),
            outputs: BTreeMap::new(),
            inputs: BTreeMap::new(),
            targets: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    // -- bundles ------------------------------------------------------------

    /// Register a bundle under its name.
    pub fn add_bundle(&mut self, bundle: TensorBundle) -> HnnResult<BundleId> {
        if self.bundle_names.contains_key(bundle.name()) {
            return Err(HnnError::Graph(format!(
                "bundle '{}' declared twice",
                bundle.name()
            )));
        }
        let name = bundle.name().to_string();
        let id = self.bundles.insert(bundle);
        self.bundle_names.insert(name, id);
        Ok(id)
    }

    pub fn add_bundle_decl(&mut self, decl: &BundleDecl) -> HnnResult<BundleId> {
        let bundle = TensorBundle::from_decl(decl, &self.device)?;
        self.add_bundle(bundle)
    }

    pub fn bundle(&self, id: BundleId) -> Option<&TensorBundle> {
        self.bundles.get(id)
    }

    pub fn bundle_mut(&mut self, id: BundleId) -> Option<&mut TensorBundle> {
        self.bundles.get_mut(id)
    }

    pub fn bundle_id(&self, name: &str) -> Option<BundleId> {
        self.bundle_names.get(name).copied()
    }

    pub fn bundle_uses(&self, id: BundleId) -> usize {
        self.bundles.uses(id)
    }

    fn lookup_bundle(&self, name: &str, layer: &str) -> HnnResult<BundleId> {
        self.bundle_id(name).ok_or_else(|| {
            HnnError::Graph(format!("layer '{layer}' refers to unknown bundle '{name}'"))
        })
    }

    // -- feature elements ---------------------------------------------------

    /// Validate and store a feature element.
    ///
    /// Identical cache-fed elements are shared: the id of the existing one is
    /// returned.
    pub fn add_fea_elem(&mut self, decl: &ElemDecl) -> HnnResult<ElemId> {
        validate_context(&decl.context)?;
        if decl.width == 0 {
            return Err(HnnError::Graph("feature element with zero width".into()));
        }

        let (source, src_dim) = match &decl.source {
            SourceDecl::Stream { index } => {
                let src_dim = decl.src_dim.ok_or_else(|| {
                    HnnError::Graph(format!(
                        "raw feature element of stream {index} needs src_dim"
                    ))
                })?;
                (ElemSource::RawStream { stream: *index }, src_dim)
            }
            SourceDecl::Auxiliary { stream, index } => (
                ElemSource::Auxiliary {
                    stream: *stream,
                    index: *index,
                },
                decl.src_dim.unwrap_or(decl.dim_offset + decl.width),
            ),
            SourceDecl::Layer { name } => match self.layer_names.get(name) {
                Some(&id) => {
                    let node_count = self.layers.try_get(id)?.node_count;
                    check_declared_src_dim(name, decl.src_dim, node_count)?;
                    (ElemSource::Layer(id), node_count)
                }
                None => (
                    ElemSource::Pending {
                        name: name.clone(),
                        src_dim: decl.src_dim,
                    },
                    decl.src_dim.unwrap_or(0),
                ),
            },
        };

        if src_dim > 0 || !matches!(source, ElemSource::Pending { .. }) {
            check_slice(decl.dim_offset, decl.width, src_dim)?;
        }

        let backprop = decl.backprop
            && matches!(
                source,
                ElemSource::Layer(_) | ElemSource::Pending { .. }
            );
        let elem = FeaElem {
            source,
            src_dim,
            dim_offset: decl.dim_offset,
            width: decl.width,
            context: decl.context.clone(),
            backprop,
            context_pool: Vec::new(),
            matrices: Vec::new(),
        };
        Ok(self.store_elem(elem))
    }

    fn store_elem(&mut self, elem: FeaElem) -> ElemId {
        let stream = match elem.source {
            ElemSource::RawStream { stream } | ElemSource::Auxiliary { stream, .. } => {
                Some(stream)
            }
            _ => None,
        };
        if let Some(stream) = stream {
            let existing = self.inputs.get(&stream).and_then(|ids| {
                ids.iter()
                    .copied()
                    .find(|id| self.elems.get(*id).is_some_and(|e| e.same_input(&elem)))
            });
            if let Some(id) = existing {
                return id;
            }
            let id = self.elems.insert(elem);
            self.inputs.entry(stream).or_default().push(id);
            return id;
        }
        if let ElemSource::Layer(layer) = elem.source {
            if let Some(l) = self.layers.get_mut(layer) {
                l.consumers += 1;
            }
        }
        self.elems.insert(elem)
    }

    pub fn elem(&self, id: ElemId) -> Option<&FeaElem> {
        self.elems.get(id)
    }

    pub fn elem_mut(&mut self, id: ElemId) -> Option<&mut FeaElem> {
        self.elems.get_mut(id)
    }

    pub fn elem_uses(&self, id: ElemId) -> usize {
        self.elems.uses(id)
    }

    /// Cache-fed elements of a stream, deduplicated.
    pub fn input_elems(&self, stream: usize) -> &[ElemId] {
        self.inputs.get(&stream).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn input_streams(&self) -> Vec<usize> {
        self.inputs.keys().copied().collect()
    }

    // -- mixtures -----------------------------------------------------------

    /// Concatenate elements into a named mixture.
    pub fn add_fea_mix(&mut self, name: &str, elems: &[ElemId]) -> HnnResult<MixId> {
        if self.mix_names.contains_key(name) {
            return Err(HnnError::Graph(format!("mixture '{name}' declared twice")));
        }
        if elems.is_empty() {
            return Err(HnnError::Graph(format!("mixture '{name}' has no elements")));
        }
        let mut dim = 0;
        for &id in elems {
            dim += self.elems.try_get(id)?.expanded_width();
        }
        for &id in elems {
            self.elems.acquire(id)?;
        }
        let id = self.mixes.insert(FeaMix {
            name: name.to_string(),
            elems: elems.to_vec(),
            dim,
            owners: Vec::new(),
            context_pool: Vec::new(),
            matrices: Vec::new(),
            filled_batch: None,
        });
        self.mix_names.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn mix(&self, id: MixId) -> Option<&FeaMix> {
        self.mixes.get(id)
    }

    pub fn mix_mut(&mut self, id: MixId) -> Option<&mut FeaMix> {
        self.mixes.get_mut(id)
    }

    pub fn mix_id(&self, name: &str) -> Option<MixId> {
        self.mix_names.get(name).copied()
    }

    pub fn mix_ids(&self) -> Vec<MixId> {
        self.mixes.ids()
    }

    /// Number of layers consuming the mixture.
    pub fn mix_uses(&self, id: MixId) -> usize {
        self.mixes.uses(id)
    }

    // -- layers -------------------------------------------------------------

    /// Add a layer, checking its bundles against the declared dimensions.
    pub fn add_layer(&mut self, decl: &LayerDecl) -> HnnResult<LayerId> {
        if self.layer_names.contains_key(&decl.name) {
            return Err(HnnError::Graph(format!("layer '{}' declared twice", decl.name)));
        }
        if decl.kind != LayerKind::Perceptron {
            return Err(HnnError::Graph(format!(
                "layer '{}': only perceptron layers can be assembled",
                decl.name
            )));
        }

        let weights = self.lookup_bundle(&decl.weights, &decl.name)?;
        let bias = self.lookup_bundle(&decl.bias, &decl.name)?;
        let w_dims = self.bundles.try_get(weights)?.dims().to_vec();
        if w_dims != [decl.node_count, decl.input_dim] {
            return Err(HnnError::DimensionMismatch(format!(
                "layer '{}': weights '{}' are {:?}, expected [{}, {}]",
                decl.name, decl.weights, w_dims, decl.node_count, decl.input_dim
            )));
        }
        self.check_vector(bias, decl.node_count, &decl.name)?;

        if decl.activation_params.len() != decl.activation.parameter_count() {
            return Err(HnnError::Graph(format!(
                "layer '{}': activation {} takes {} parameter vectors, got {}",
                decl.name,
                decl.activation,
                decl.activation.parameter_count(),
                decl.activation_params.len()
            )));
        }
        let mut activation_params = Vec::with_capacity(decl.activation_params.len());
        for name in &decl.activation_params {
            let id = self.lookup_bundle(name, &decl.name)?;
            self.check_vector(id, decl.node_count, &decl.name)?;
            activation_params.push(id);
        }

        let input = match &decl.input {
            Some(name) => Some(self.mix_id(name).ok_or_else(|| {
                HnnError::Graph(format!(
                    "layer '{}' refers to unknown mixture '{name}'",
                    decl.name
                ))
            })?),
            None => None,
        };

        self.bundles.acquire(weights)?;
        self.bundles.acquire(bias)?;
        for &id in &activation_params {
            self.bundles.acquire(id)?;
        }

        let id = self.layers.insert(LayerElem {
            name: decl.name.clone(),
            kind: decl.kind,
            input_dim: decl.input_dim,
            node_count: decl.node_count,
            weights,
            bias,
            activation: decl.activation,
            activation_params,
            input: None,
            error_mix: None,
            derivation_context: Vec::new(),
            is_final: decl.is_final,
            consumers: 0,
            network: None,
            input_gradient: None,
            outputs: Vec::new(),
        });
        self.layer_names.insert(decl.name.clone(), id);
        if let Some(mix) = input {
            self.attach_input(id, mix)?;
        }
        debug!(
            "layer '{}' added: {} -> {} ({})",
            decl.name, decl.input_dim, decl.node_count, decl.activation
        );
        Ok(id)
    }

    fn check_vector(&self, id: BundleId, len: usize, layer: &str) -> HnnResult<()> {
        let bundle = self.bundles.try_get(id)?;
        if bundle.dims() != [len] {
            return Err(HnnError::DimensionMismatch(format!(
                "layer '{layer}': vector '{}' is {:?}, expected [{len}]",
                bundle.name(),
                bundle.dims()
            )));
        }
        Ok(())
    }

    /// Make `mix` the input of `layer`.
    pub fn attach_input(&mut self, layer: LayerId, mix: MixId) -> HnnResult<()> {
        let l = self.layers.try_get(layer)?;
        if l.input.is_some() {
            return Err(HnnError::Graph(format!("layer '{}' already has an input", l.name)));
        }
        self.mixes.acquire(mix)?;
        self.mixes.try_get_mut(mix)?.owners.push(layer);
        self.layers.try_get_mut(layer)?.input = Some(mix);
        Ok(())
    }

    pub fn layer(&self, id: LayerId) -> Option<&LayerElem> {
        self.layers.get(id)
    }

    pub fn layer_mut(&mut self, id: LayerId) -> Option<&mut LayerElem> {
        self.layers.get_mut(id)
    }

    pub fn layer_id(&self, name: &str) -> Option<LayerId> {
        self.layer_names.get(name).copied()
    }

    pub fn layer_ids(&self) -> Vec<LayerId> {
        self.layers.ids()
    }

    pub fn layer_uses(&self, id: LayerId) -> usize {
        self.layers.uses(id)
    }

    // -- networks and outputs -----------------------------------------------

    /// Group layers into a network; a layer belongs to at most one network.
    pub fn add_network(&mut self, name: &str, layers: &[LayerId]) -> HnnResult<usize> {
        let index = self.networks.len();
        for (pos, &id) in layers.iter().enumerate() {
            if layers[..pos].contains(&id) {
                return Err(HnnError::Graph(format!(
                    "network '{name}' lists layer {id} twice"
                )));
            }
            let layer = self.layers.try_get(id)?;
            if let Some(other) = layer.network {
                return Err(HnnError::Graph(format!(
                    "layer '{}' already belongs to network '{}'",
                    layer.name, self.networks[other].name
                )));
            }
        }
        for &id in layers {
            self.layers.acquire(id)?;
            self.layers.try_get_mut(id)?.network = Some(index);
        }
        self.networks.push(Network {
            name: name.to_string(),
            layers: layers.to_vec(),
        });
        Ok(index)
    }

    pub fn networks(&self) -> &[Network] {
        &self.networks
    }

    pub fn set_output(&mut self, stream: usize, layer: LayerId) -> HnnResult<()> {
        self.layers.try_get(layer)?;
        self.outputs.insert(stream, layer);
        Ok(())
    }

    pub fn output_layer(&self, stream: usize) -> Option<LayerId> {
        self.outputs.get(&stream).copied()
    }

    pub fn outputs(&self) -> &BTreeMap<usize, LayerId> {
        &self.outputs
    }

    // -- late binding and consistency ---------------------------------------

    /// Bind every forward reference to its layer.
    pub fn resolve_late_bound_sources(&mut self) -> HnnResult<usize> {
        let pending: Vec<(ElemId, String, Option<usize>)> = self
            .elems
            .iter()
            .filter_map(|(id, e)| match &e.source {
                ElemSource::Pending { name, src_dim } => Some((id, name.clone(), *src_dim)),
                _ => None,
            })
            .collect();

        for (id, name, declared) in &pending {
            let layer = self
                .layer_id(name)
                .ok_or_else(|| HnnError::UnresolvedSource(name.clone()))?;
            let node_count = self.layers.try_get(layer)?.node_count;
            check_declared_src_dim(name, *declared, node_count)?;
            let elem = self.elems.try_get_mut(*id)?;
            check_slice(elem.dim_offset, elem.width, node_count)?;
            elem.source = ElemSource::Layer(layer);
            elem.src_dim = node_count;
            self.layers.try_get_mut(layer)?.consumers += 1;
        }
        if !pending.is_empty() {
            debug!("resolved {} forward layer references", pending.len());
        }
        Ok(pending.len())
    }

    /// Synthesize missing inputs and check mixture widths against layers.
    pub fn check_consistency(&mut self) -> HnnResult<()> {
        for net in 0..self.networks.len() {
            let layers = self.networks[net].layers.clone();
            for (pos, &id) in layers.iter().enumerate() {
                if self.layers.try_get(id)?.input.is_some() {
                    continue;
                }
                let prev = if pos == 0 { None } else { Some(layers[pos - 1]) };
                self.synthesize_input(id, prev)?;
            }
        }

        for id in self.layers.ids() {
            let layer = self.layers.try_get(id)?;
            let mix = layer.input.ok_or_else(|| {
                HnnError::Graph(format!(
                    "layer '{}' has no input and belongs to no network",
                    layer.name
                ))
            })?;
            let mix = self.mixes.try_get(mix)?;
            if mix.dim != layer.input_dim {
                return Err(HnnError::DimensionMismatch(format!(
                    "mixture '{}' provides {} values, layer '{}' expects {}",
                    mix.name, mix.dim, layer.name, layer.input_dim
                )));
            }
        }
        Ok(())
    }

    fn synthesize_input(&mut self, layer: LayerId, prev: Option<LayerId>) -> HnnResult<()> {
        let (name, input_dim) = {
            let l = self.layers.try_get(layer)?;
            (l.name.clone(), l.input_dim)
        };
        if !self.config.implicit_inputs {
            return Err(HnnError::Graph(format!("layer '{name}' has no input mixture")));
        }
        let elem = match prev {
            None => {
                warn!(
                    "layer '{}' has no input: reading stream {} directly ({} values)",
                    name, self.config.default_stream, input_dim
                );
                FeaElem {
                    source: ElemSource::RawStream {
                        stream: self.config.default_stream,
                    },
                    src_dim: input_dim,
                    dim_offset: 0,
                    width: input_dim,
                    context: vec![0],
                    backprop: false,
                    context_pool: Vec::new(),
                    matrices: Vec::new(),
                }
            }
            Some(prev) => {
                let p = self.layers.try_get(prev)?;
                if p.node_count != input_dim {
                    return Err(HnnError::DimensionMismatch(format!(
                        "layer '{}' produces {} values, next layer '{}' expects {}",
                        p.name, p.node_count, name, input_dim
                    )));
                }
                warn!("layer '{}' has no input: chaining output of '{}'", name, p.name);
                FeaElem {
                    source: ElemSource::Layer(prev),
                    src_dim: p.node_count,
                    dim_offset: 0,
                    width: p.node_count,
                    context: vec![0],
                    backprop: true,
                    context_pool: Vec::new(),
                    matrices: Vec::new(),
                }
            }
        };
        let elem = self.store_elem(elem);
        let mix = self.add_fea_mix(&format!("{name}.input"), &[elem])?;
        self.attach_input(layer, mix)
    }

    // -- teardown -----------------------------------------------------------

    /// Drop one reference to a layer; frees it and whatever only it used.
    ///
    /// Only network membership holds a layer, so a layer outside every
    /// network cannot be released this way; [`FeatureGraph::teardown`]
    /// frees those.
    pub fn release_layer(&mut self, id: LayerId) -> HnnResult<bool> {
        let layer = self.layers.try_get(id)?;
        if self.layers.uses(id) == 0 {
            return Err(HnnError::Graph(format!(
                "layer '{}' is not held by any network",
                layer.name
            )));
        }
        self.free_layer(id)
    }

    fn free_layer(&mut self, id: LayerId) -> HnnResult<bool> {
        let Some(layer) = self.layers.release(id)? else {
            return Ok(false);
        };
        self.layer_names.remove(&layer.name);
        for bundle in [layer.weights, layer.bias]
            .into_iter()
            .chain(layer.activation_params.iter().copied())
        {
            if let Some(b) = self.bundles.release(bundle)? {
                self.bundle_names.remove(b.name());
            }
        }
        if let Some(mix) = layer.input {
            if let Some(m) = self.mixes.get_mut(mix) {
                m.owners.retain(|o| *o != id);
            }
            self.release_mix(mix)?;
        }
        if let Some(buffer) = layer.input_gradient {
            self.buffers.release(buffer)?;
        }
        if let Some(err) = layer.error_mix {
            self.buffers.release(err.buffer)?;
        }
        self.outputs.retain(|_, l| *l != id);
        Ok(true)
    }

    fn release_mix(&mut self, id: MixId) -> HnnResult<()> {
        let Some(mix) = self.mixes.release(id)? else {
            return Ok(());
        };
        self.mix_names.remove(&mix.name);
        for elem in mix.elems {
            if let Some(e) = self.elems.release(elem)? {
                if let ElemSource::Layer(src) = e.source {
                    if let Some(l) = self.layers.get_mut(src) {
                        l.consumers = l.consumers.saturating_sub(1);
                    }
                }
                for ids in self.inputs.values_mut() {
                    ids.retain(|i| *i != elem);
                }
            }
        }
        Ok(())
    }

    /// Release every network's layers, then the layers no network holds.
    pub fn teardown(&mut self) -> HnnResult<()> {
        let networks = std::mem::take(&mut self.networks);
        for net in &networks {
            for &id in &net.layers {
                self.release_layer(id)?;
            }
        }
        for id in self.layers.ids() {
            if self.layers.uses(id) == 0 {
                self.layers.acquire(id)?;
                self.free_layer(id)?;
            }
        }
        Ok(())
    }

    // -- buffers used by the numeric code -----------------------------------

    pub fn buffer(&self, id: BufferId) -> Option<&GradientBuffer> {
        self.buffers.get(id)
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> Option<&mut GradientBuffer> {
        self.buffers.get_mut(id)
    }

    pub fn buffer_uses(&self, id: BufferId) -> usize {
        self.buffers.uses(id)
    }

    /// Store a layer output for one derivation-context offset.
    pub fn set_layer_output(&mut self, layer: LayerId, offset: i32, output: Tensor) -> HnnResult<()> {
        let l = self.layers.try_get_mut(layer)?;
        let idx = l.context_index(offset).ok_or_else(|| {
            HnnError::Graph(format!(
                "layer '{}' is not derived at offset {offset}",
                l.name
            ))
        })?;
        let dims = output.dims();
        if dims.len() != 2 || dims[1] != l.node_count {
            return Err(HnnError::DimensionMismatch(format!(
                "output of layer '{}' is {:?}, expected [_, {}]",
                l.name, dims, l.node_count
            )));
        }
        l.outputs[idx] = Some(output);
        Ok(())
    }

    pub fn layer_output(&self, layer: LayerId, offset: i32) -> Option<&Tensor> {
        let l = self.layers.get(layer)?;
        let idx = l.context_index(offset)?;
        l.outputs[idx].as_ref()
    }

    /// Store the gradient with respect to a layer's input at one offset.
    pub fn set_input_gradient(&mut self, layer: LayerId, offset: i32, grad: Tensor) -> HnnResult<()> {
        let l = self.layers.try_get(layer)?;
        let buffer = l.input_gradient.ok_or_else(|| {
            HnnError::Graph(format!("layer '{}' has no gradient buffer yet", l.name))
        })?;
        let name = l.name.clone();
        let buf = self.buffers.try_get_mut(buffer)?;
        let idx = buf.context.binary_search(&offset).map_err(|_| {
            HnnError::Graph(format!("layer '{name}' is not derived at offset {offset}"))
        })?;
        let dims = grad.dims();
        if dims.len() != 2 || dims[1] != buf.width {
            return Err(HnnError::DimensionMismatch(format!(
                "input gradient of layer '{name}' is {:?}, expected [_, {}]",
                dims, buf.width
            )));
        }
        buf.matrices[idx] = Some(grad);
        Ok(())
    }

    // -- labels -------------------------------------------------------------

    pub fn set_targets(&mut self, stream: usize, targets: Tensor) {
        self.targets.insert(stream, targets);
    }

    pub fn targets(&self, stream: usize) -> Option<&Tensor> {
        self.targets.get(&stream)
    }
}

fn validate_context(context: &[i32]) -> HnnResult<()> {
    if context.is_empty() {
        return Err(HnnError::Graph("empty context map".into()));
    }
    if context.windows(2).any(|w| w[0] >= w[1]) {
        return Err(HnnError::Graph(format!(
            "context map {:?} is not strictly increasing",
            context
        )));
    }
    Ok(())
}

fn check_slice(offset: usize, width: usize, src_dim: usize) -> HnnResult<()> {
    if offset + width > src_dim {
        return Err(HnnError::DimensionMismatch(format!(
            "slice [{offset}, {}) exceeds source width {src_dim}",
            offset + width
        )));
    }
    Ok(())
}

fn check_declared_src_dim(layer: &str, declared: Option<usize>, node_count: usize) -> HnnResult<()> {
    match declared {
        Some(d) if d != node_count => Err(HnnError::DimensionMismatch(format!(
            "feature element declares {d} values for layer '{layer}' with {node_count} nodes"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hnn_core::BundleKind;

    fn bundle(graph: &mut FeatureGraph, name: &str, shape: &[usize]) {
        graph
            .add_bundle_decl(&BundleDecl {
                name: name.into(),
                shape: shape.to_vec(),
                kind: BundleKind::SessionIndependent,
                values: None,
                fill: 0.0,
                update: true,
            })
            .expect("bundle");
    }

    fn layer(name: &str, input_dim: usize, nodes: usize, input: Option<&str>) -> LayerDecl {
        LayerDecl {
            name: name.into(),
            kind: LayerKind::Perceptron,
            input_dim,
            node_count: nodes,
            weights: format!("{name}.W"),
            bias: format!("{name}.b"),
            activation: ActivationKind::Sigmoid,
            activation_params: Vec::new(),
            input: input.map(str::to_string),
            is_final: false,
        }
    }

    fn raw(src_dim: usize, offset: usize, width: usize, context: &[i32]) -> ElemDecl {
        ElemDecl {
            source: SourceDecl::Stream { index: 0 },
            src_dim: Some(src_dim),
            dim_offset: offset,
            width,
            context: context.to_vec(),
            backprop: true,
        }
    }

    #[test]
    fn test_context_must_increase() {
        let mut graph = FeatureGraph::new(GraphConfig::default());
        let err = graph.add_fea_elem(&raw(4, 0, 4, &[1, 0])).unwrap_err();
        assert!(matches!(err, HnnError::Graph(_)));
        let err = graph.add_fea_elem(&raw(4, 0, 4, &[0, 0])).unwrap_err();
        assert!(matches!(err, HnnError::Graph(_)));
    }

    #[test]
    fn test_slice_beyond_source() {
        let mut graph = FeatureGraph::new(GraphConfig::default());
        let err = graph.add_fea_elem(&raw(4, 2, 3, &[0])).unwrap_err();
        assert!(matches!(err, HnnError::DimensionMismatch(_)));
    }

    #[test]
    fn test_identical_raw_elements_are_shared() {
        let mut graph = FeatureGraph::new(GraphConfig::default());
        let a = graph.add_fea_elem(&raw(4, 0, 4, &[-1, 0, 1])).expect("elem");
        let b = graph.add_fea_elem(&raw(4, 0, 4, &[-1, 0, 1])).expect("elem");
        let c = graph.add_fea_elem(&raw(4, 0, 4, &[0])).expect("elem");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(graph.input_elems(0), &[a, c]);
    }

    #[test]
    fn test_weight_shape_checked() {
        let mut graph = FeatureGraph::new(GraphConfig::default());
        bundle(&mut graph, "L1.W", &[3, 5]);
        bundle(&mut graph, "L1.b", &[3]);
        let err = graph.add_layer(&layer("L1", 4, 3, None)).unwrap_err();
        assert!(matches!(err, HnnError::DimensionMismatch(_)));
        assert_eq!(graph.bundle_uses(graph.bundle_id("L1.W").expect("id")), 0);
    }

    #[test]
    fn test_shared_weights_counted() {
        let mut graph = FeatureGraph::new(GraphConfig::default());
        bundle(&mut graph, "W", &[3, 4]);
        bundle(&mut graph, "b", &[3]);
        for name in ["A", "B"] {
            let mut decl = layer(name, 4, 3, None);
            decl.weights = "W".into();
            decl.bias = "b".into();
            graph.add_layer(&decl).expect("layer");
        }
        let w = graph.bundle_id("W").expect("id");
        assert_eq!(graph.bundle_uses(w), 2);

        let a = graph.layer_id("A").expect("A");
        let b = graph.layer_id("B").expect("B");
        graph.add_network("n", &[a, b]).expect("network");
        graph.release_layer(a).expect("release");
        assert_eq!(graph.bundle_uses(w), 1);
        graph.release_layer(b).expect("release");
        assert!(graph.bundle(w).is_none());
        assert!(graph.bundle_id("W").is_none());
    }

    #[test]
    fn test_layer_outside_networks_freed_by_teardown() {
        let mut graph = FeatureGraph::new(GraphConfig::default());
        bundle(&mut graph, "L1.W", &[3, 4]);
        bundle(&mut graph, "L1.b", &[3]);
        bundle(&mut graph, "L2.W", &[3, 4]);
        bundle(&mut graph, "L2.b", &[3]);
        let held = graph.add_layer(&layer("L1", 4, 3, None)).expect("layer");
        let orphan = graph.add_layer(&layer("L2", 4, 3, None)).expect("layer");
        graph.add_network("net", &[held]).expect("network");

        let err = graph.release_layer(orphan).unwrap_err();
        assert!(matches!(err, HnnError::Graph(_)));
        assert!(graph.layer(orphan).is_some());

        graph.teardown().expect("teardown");
        assert!(graph.layer(held).is_none());
        assert!(graph.layer(orphan).is_none());
        assert!(graph.layer_id("L2").is_none());
        assert!(graph.bundle_id("L2.W").is_none());
        assert!(graph.bundle_id("L1.b").is_none());
    }

    #[test]
    fn test_layer_in_two_networks_rejected() {
        let mut graph = FeatureGraph::new(GraphConfig::default());
        bundle(&mut graph, "L1.W", &[3, 4]);
        bundle(&mut graph, "L1.b", &[3]);
        let id = graph.add_layer(&layer("L1", 4, 3, None)).expect("layer");
        graph.add_network("first", &[id]).expect("network");
        let err = graph.add_network("second", &[id]).unwrap_err();
        assert!(matches!(err, HnnError::Graph(_)));
        assert_eq!(graph.layer_uses(id), 1);
    }

    #[test]
    fn test_forward_reference_resolved() {
        let mut graph = FeatureGraph::new(GraphConfig::default());
        let fwd = graph
            .add_fea_elem(&ElemDecl {
                source: SourceDecl::Layer { name: "later".into() },
                src_dim: None,
                dim_offset: 1,
                width: 2,
                context: vec![0],
                backprop: true,
            })
            .expect("elem");
        bundle(&mut graph, "later.W", &[3, 4]);
        bundle(&mut graph, "later.b", &[3]);
        let id = graph.add_layer(&layer("later", 4, 3, None)).expect("layer");
        assert_eq!(graph.resolve_late_bound_sources().expect("resolve"), 1);
        let elem = graph.elem(fwd).expect("elem");
        assert_eq!(elem.source, ElemSource::Layer(id));
        assert_eq!(elem.src_dim, 3);
        assert_eq!(graph.layer(id).expect("layer").consumers, 1);
    }

    #[test]
    fn test_unknown_forward_reference() {
        let mut graph = FeatureGraph::new(GraphConfig::default());
        graph
            .add_fea_elem(&ElemDecl {
                source: SourceDecl::Layer { name: "ghost".into() },
                src_dim: None,
                dim_offset: 0,
                width: 2,
                context: vec![0],
                backprop: true,
            })
            .expect("elem");
        let err = graph.resolve_late_bound_sources().unwrap_err();
        assert!(matches!(err, HnnError::UnresolvedSource(name) if name == "ghost"));
    }

    #[test]
    fn test_implicit_chain_synthesized() {
        let mut graph = FeatureGraph::new(GraphConfig::default());
        bundle(&mut graph, "L1.W", &[3, 4]);
        bundle(&mut graph, "L1.b", &[3]);
        bundle(&mut graph, "L2.W", &[2, 3]);
        bundle(&mut graph, "L2.b", &[2]);
        let l1 = graph.add_layer(&layer("L1", 4, 3, None)).expect("L1");
        let l2 = graph.add_layer(&layer("L2", 3, 2, None)).expect("L2");
        graph.add_network("net", &[l1, l2]).expect("network");
        graph.check_consistency().expect("consistent");

        let mix1 = graph.mix(graph.layer(l1).expect("L1").input.expect("input")).expect("mix");
        let e1 = graph.elem(mix1.elems[0]).expect("elem");
        assert_eq!(e1.source, ElemSource::RawStream { stream: 0 });
        assert_eq!(mix1.dim, 4);

        let mix2 = graph.mix(graph.layer(l2).expect("L2").input.expect("input")).expect("mix");
        let e2 = graph.elem(mix2.elems[0]).expect("elem");
        assert_eq!(e2.source, ElemSource::Layer(l1));
        assert_eq!(graph.layer(l1).expect("L1").consumers, 1);
    }

    #[test]
    fn test_implicit_chain_width_mismatch() {
        let mut graph = FeatureGraph::new(GraphConfig::default());
        bundle(&mut graph, "L1.W", &[3, 4]);
        bundle(&mut graph, "L1.b", &[3]);
        bundle(&mut graph, "L2.W", &[2, 5]);
        bundle(&mut graph, "L2.b", &[2]);
        let l1 = graph.add_layer(&layer("L1", 4, 3, None)).expect("L1");
        let l2 = graph.add_layer(&layer("L2", 5, 2, None)).expect("L2");
        graph.add_network("net", &[l1, l2]).expect("network");
        let err = graph.check_consistency().unwrap_err();
        assert!(matches!(err, HnnError::DimensionMismatch(_)));
    }

    #[test]
    fn test_implicit_inputs_can_be_disabled() {
        let config = GraphConfig {
            implicit_inputs: false,
            ..GraphConfig::default()
        };
        let mut graph = FeatureGraph::new(config);
        bundle(&mut graph, "L1.W", &[3, 4]);
        bundle(&mut graph, "L1.b", &[3]);
        let l1 = graph.add_layer(&layer("L1", 4, 3, None)).expect("L1");
        graph.add_network("net", &[l1]).expect("network");
        assert!(matches!(
            graph.check_consistency().unwrap_err(),
            HnnError::Graph(_)
        ));
    }
}
