//! Integration tests for graph construction and context propagation.

use hnn_core::{
    ActivationKind, BundleDecl, BundleKind, Declaration, ElemDecl, GraphConfig, HnnError,
    LayerDecl, LayerKind, MixtureDecl, ModelDescription, NetworkDecl, OutputDecl, SourceDecl,
};
use hnn_graph::{
    ElemSource, FeatureGraph, build_graph, consumer_first_order, merge_contexts,
    propagate_context,
};
use proptest::prelude::*;

fn bundles(name: &str, nodes: usize, input_dim: usize) -> Vec<Declaration> {
    vec![
        Declaration::Bundle(BundleDecl {
            name: format!("{name}.W"),
            shape: vec![nodes, input_dim],
            kind: BundleKind::SessionIndependent,
            values: None,
            fill: 0.0,
            update: true,
        }),
        Declaration::Bundle(BundleDecl {
            name: format!("{name}.b"),
            shape: vec![nodes],
            kind: BundleKind::SessionIndependent,
            values: None,
            fill: 0.0,
            update: true,
        }),
    ]
}

fn layer(name: &str, input_dim: usize, nodes: usize, input: Option<&str>, last: bool) -> Declaration {
    Declaration::Layer(LayerDecl {
        name: name.into(),
        kind: LayerKind::Perceptron,
        input_dim,
        node_count: nodes,
        weights: format!("{name}.W"),
        bias: format!("{name}.b"),
        activation: if last {
            ActivationKind::Softmax
        } else {
            ActivationKind::Sigmoid
        },
        activation_params: Vec::new(),
        input: input.map(str::to_string),
        is_final: last,
    })
}

fn raw(src_dim: usize, width: usize, context: &[i32]) -> ElemDecl {
    ElemDecl {
        source: SourceDecl::Stream { index: 0 },
        src_dim: Some(src_dim),
        dim_offset: 0,
        width,
        context: context.to_vec(),
        backprop: false,
    }
}

fn from_layer(name: &str, width: usize, context: &[i32]) -> ElemDecl {
    ElemDecl {
        source: SourceDecl::Layer { name: name.into() },
        src_dim: None,
        dim_offset: 0,
        width,
        context: context.to_vec(),
        backprop: true,
    }
}

fn mixture(name: &str, elements: Vec<ElemDecl>) -> Declaration {
    Declaration::Mixture(MixtureDecl {
        name: name.into(),
        elements,
    })
}

fn network(layers: &[&str]) -> Declaration {
    Declaration::Network(NetworkDecl {
        name: "net".into(),
        layers: layers.iter().map(|s| s.to_string()).collect(),
    })
}

fn build(decls: Vec<Declaration>) -> Result<FeatureGraph, HnnError> {
    let mut provider = ModelDescription::new(decls).into_provider();
    build_graph(&mut provider, GraphConfig::default())
}

/// L1 <- raw ±2, L2 <- L1 {-1,0,1}, L3 <- L2 {-1,1}.
fn context_chain() -> Vec<Declaration> {
    let mut decls = Vec::new();
    decls.extend(bundles("L1", 4, 15));
    decls.extend(bundles("L2", 3, 12));
    decls.extend(bundles("L3", 2, 6));
    decls.push(mixture("in1", vec![raw(3, 3, &[-2, -1, 0, 1, 2])]));
    decls.push(mixture("in2", vec![from_layer("L1", 4, &[-1, 0, 1])]));
    decls.push(mixture("in3", vec![from_layer("L2", 3, &[-1, 1])]));
    decls.push(layer("L1", 15, 4, Some("in1"), false));
    decls.push(layer("L2", 12, 3, Some("in2"), false));
    decls.push(layer("L3", 6, 2, Some("in3"), true));
    decls.push(network(&["L1", "L2", "L3"]));
    decls.push(Declaration::Output(OutputDecl {
        stream: 0,
        layer: "L3".into(),
    }));
    decls
}

#[test]
fn test_mixture_width_mismatch_rejected() {
    let mut decls = bundles("L1", 8, 40);
    decls.push(mixture("in", vec![raw(13, 13, &[-1, 0, 1])]));
    decls.push(layer("L1", 40, 8, Some("in"), true));
    decls.push(network(&["L1"]));

    let err = build(decls).expect_err("39 != 40 must fail");
    assert!(
        matches!(err, HnnError::DimensionMismatch(_)),
        "unexpected error: {err}"
    );
}

#[test]
fn test_shared_mixture_use_count() {
    let mut decls = bundles("A", 5, 12);
    decls.extend(bundles("B", 7, 12));
    decls.push(mixture("shared", vec![raw(4, 4, &[-1, 0, 1])]));
    decls.push(layer("A", 12, 5, Some("shared"), true));
    decls.push(layer("B", 12, 7, Some("shared"), true));
    decls.push(Declaration::Network(NetworkDecl {
        name: "a".into(),
        layers: vec!["A".into()],
    }));
    decls.push(Declaration::Network(NetworkDecl {
        name: "b".into(),
        layers: vec!["B".into()],
    }));

    let graph = build(decls).expect("graph");
    let mix = graph.mix_id("shared").expect("mixture");
    assert_eq!(graph.mix_uses(mix), 2);
    assert_eq!(graph.mix(mix).expect("mix").owners.len(), 2);
}

#[test]
fn test_derivation_contexts_flow_backwards() {
    let mut graph = build(context_chain()).expect("graph");
    propagate_context(&mut graph).expect("propagate");

    let ctx = |name: &str| {
        graph
            .layer(graph.layer_id(name).expect("layer"))
            .expect("layer")
            .derivation_context
            .clone()
    };
    assert_eq!(ctx("L3"), vec![0]);
    assert_eq!(ctx("L2"), vec![-1, 1]);
    assert_eq!(ctx("L1"), vec![-2, -1, 0, 1, 2]);

    let in1 = graph.mix(graph.mix_id("in1").expect("in1")).expect("mix");
    assert_eq!(in1.context_pool, vec![-2, -1, 0, 1, 2]);
    let raw_elem = graph.elem(in1.elems[0]).expect("elem");
    assert_eq!(raw_elem.context_pool, vec![-2, -1, 0, 1, 2]);

    let in3 = graph.mix(graph.mix_id("in3").expect("in3")).expect("mix");
    assert_eq!(in3.context_pool, vec![0]);
    assert_eq!(graph.elem(in3.elems[0]).expect("elem").context_pool, vec![-1, 1]);
}

#[test]
fn test_propagation_is_repeatable() {
    let mut graph = build(context_chain()).expect("graph");
    propagate_context(&mut graph).expect("first pass");
    let l1 = graph.layer_id("L1").expect("L1");
    let first = graph.layer(l1).expect("L1").derivation_context.clone();
    let buffer = graph.layer(l1).expect("L1").input_gradient.expect("buffer");

    propagate_context(&mut graph).expect("second pass");
    assert_eq!(graph.layer(l1).expect("L1").derivation_context, first);
    // the previous buffer was released
    assert_eq!(graph.buffer_uses(buffer), 0);
}

#[test]
fn test_cycle_detected() {
    let mut decls = bundles("L1", 4, 4);
    decls.extend(bundles("L2", 4, 4));
    decls.push(mixture("in1", vec![from_layer("L2", 4, &[0])]));
    decls.push(mixture("in2", vec![from_layer("L1", 4, &[0])]));
    decls.push(layer("L1", 4, 4, Some("in1"), false));
    decls.push(layer("L2", 4, 4, Some("in2"), true));
    decls.push(network(&["L1", "L2"]));

    let mut graph = build(decls).expect("declarations are well-formed");
    let err = propagate_context(&mut graph).expect_err("cycle");
    assert!(matches!(err, HnnError::UnsupportedCycle(_)), "unexpected error: {err}");
    // detection keeps no state: it fails the same way again
    assert!(matches!(
        consumer_first_order(&graph),
        Err(HnnError::UnsupportedCycle(_))
    ));
}

#[test]
fn test_self_loop_detected() {
    let mut decls = bundles("L1", 4, 8);
    decls.push(mixture("in1", vec![raw(4, 4, &[0]), from_layer("L1", 4, &[-1])]));
    decls.push(layer("L1", 8, 4, Some("in1"), true));
    decls.push(network(&["L1"]));

    let mut graph = build(decls).expect("declarations are well-formed");
    let err = propagate_context(&mut graph).expect_err("self loop");
    assert!(matches!(err, HnnError::UnsupportedCycle(name) if name == "L1"));
}

#[test]
fn test_acyclic_order_puts_consumers_first() {
    let graph = build(context_chain()).expect("graph");
    let order = consumer_first_order(&graph).expect("order");
    let pos = |name: &str| {
        let id = graph.layer_id(name).expect("layer");
        order.iter().position(|l| *l == id).expect("in order")
    };
    assert!(pos("L3") < pos("L2"));
    assert!(pos("L2") < pos("L1"));
}

#[test]
fn test_error_buffer_aliased_for_plain_chain() {
    let mut decls = bundles("L1", 6, 4);
    decls.extend(bundles("L2", 3, 6));
    decls.push(layer("L1", 4, 6, None, false));
    decls.push(layer("L2", 6, 3, None, true));
    decls.push(network(&["L1", "L2"]));

    let mut graph = build(decls).expect("graph");
    propagate_context(&mut graph).expect("propagate");

    let l1 = graph.layer(graph.layer_id("L1").expect("L1")).expect("L1");
    let l2 = graph.layer(graph.layer_id("L2").expect("L2")).expect("L2");
    let err = l1.error_mix.as_ref().expect("error mixture");
    assert!(err.aliased);
    assert_eq!(Some(err.buffer), l2.input_gradient);
    assert_eq!(graph.buffer_uses(err.buffer), 2);
    assert!(l2.error_mix.is_none());
}

#[test]
fn test_final_producer_keeps_own_error_buffer() {
    // L1 is final itself, so it is derived at {0} on top of what L2 needs
    let mut decls = bundles("L1", 6, 4);
    decls.extend(bundles("L2", 3, 6));
    decls.extend(bundles("L3", 2, 6));
    decls.push(mixture("in1", vec![raw(4, 4, &[0])]));
    decls.push(mixture("in2", vec![from_layer("L1", 6, &[0])]));
    decls.push(mixture("in3", vec![from_layer("L2", 3, &[-1, 1])]));
    decls.push(layer("L1", 4, 6, Some("in1"), true));
    decls.push(layer("L2", 6, 3, Some("in2"), false));
    decls.push(layer("L3", 6, 2, Some("in3"), true));
    decls.push(network(&["L1", "L2", "L3"]));

    let mut graph = build(decls).expect("graph");
    propagate_context(&mut graph).expect("propagate");

    let l1 = graph.layer(graph.layer_id("L1").expect("L1")).expect("L1");
    let l2 = graph.layer(graph.layer_id("L2").expect("L2")).expect("L2");
    assert_eq!(l2.derivation_context, vec![-1, 1]);
    assert_eq!(l1.derivation_context, vec![-1, 0, 1]);

    let err = l1.error_mix.as_ref().expect("error mixture");
    assert!(!err.aliased);
    assert_ne!(Some(err.buffer), l2.input_gradient);
    let buffer = graph.buffer(err.buffer).expect("buffer");
    assert_eq!(buffer.width, 6);
    assert_eq!(buffer.context, vec![-1, 0, 1]);
    assert_eq!(graph.buffer_uses(err.buffer), 1);
}

#[test]
fn test_error_buffer_owned_with_context() {
    let mut graph = build(context_chain()).expect("graph");
    propagate_context(&mut graph).expect("propagate");

    let l2 = graph.layer(graph.layer_id("L2").expect("L2")).expect("L2");
    let err = l2.error_mix.as_ref().expect("error mixture");
    assert!(!err.aliased);
    assert_eq!(err.elems.len(), 1);
    assert_eq!(err.elems[0].context, vec![-1, 1]);
    let buffer = graph.buffer(err.buffer).expect("buffer");
    assert_eq!(buffer.width, 3);
    assert_eq!(buffer.context, vec![-1, 1]);
    assert_eq!(graph.buffer_uses(err.buffer), 1);
}

#[test]
fn test_forward_reference_in_description() {
    let mut decls = Vec::new();
    decls.push(mixture("in2", vec![from_layer("L1", 5, &[0])]));
    decls.extend(bundles("L1", 5, 3));
    decls.extend(bundles("L2", 2, 5));
    decls.push(layer("L1", 3, 5, None, false));
    decls.push(layer("L2", 5, 2, Some("in2"), true));
    decls.push(network(&["L1", "L2"]));

    let graph = build(decls).expect("graph");
    let in2 = graph.mix(graph.mix_id("in2").expect("in2")).expect("mix");
    let l1 = graph.layer_id("L1").expect("L1");
    assert_eq!(graph.elem(in2.elems[0]).expect("elem").source, ElemSource::Layer(l1));
}

#[test]
fn test_description_from_json() {
    let json = serde_json::json!({
        "declarations": [
            {"decl": "bundle", "name": "h.W", "shape": [8, 9]},
            {"decl": "bundle", "name": "h.b", "shape": [8]},
            {"decl": "mixture", "name": "in", "elements": [
                {"source": {"type": "stream", "index": 0}, "src_dim": 3, "width": 3, "context": [-1, 0, 1]}
            ]},
            {"decl": "layer", "name": "h", "input_dim": 9, "node_count": 8,
             "weights": "h.W", "bias": "h.b", "activation": "relu", "input": "in", "final": true},
            {"decl": "network", "name": "net", "layers": ["h"]},
            {"decl": "output", "stream": 0, "layer": "h"}
        ]
    });
    let desc: ModelDescription = serde_json::from_value(json).expect("description");
    let mut provider = desc.into_provider();
    let graph = build_graph(&mut provider, GraphConfig::default()).expect("graph");
    assert_eq!(graph.output_layer(0), graph.layer_id("h"));
    assert_eq!(graph.input_elems(0).len(), 1);
}

fn sorted_unique() -> impl Strategy<Value = Vec<i32>> {
    proptest::collection::btree_set(-20i32..20, 0..12).prop_map(|s| s.into_iter().collect())
}

proptest! {
    #[test]
    fn prop_merge_is_idempotent(a in sorted_unique()) {
        prop_assert_eq!(merge_contexts(&a, &a), a);
    }

    #[test]
    fn prop_merge_is_commutative(a in sorted_unique(), b in sorted_unique()) {
        prop_assert_eq!(merge_contexts(&a, &b), merge_contexts(&b, &a));
    }

    #[test]
    fn prop_merge_is_associative(a in sorted_unique(), b in sorted_unique(), c in sorted_unique()) {
        prop_assert_eq!(
            merge_contexts(&merge_contexts(&a, &b), &c),
            merge_contexts(&a, &merge_contexts(&b, &c))
        );
    }

    #[test]
    fn prop_merge_absorbs_repeated_operand(a in sorted_unique(), b in sorted_unique()) {
        let ab = merge_contexts(&a, &b);
        prop_assert_eq!(merge_contexts(&a, &ab), ab.clone());
        prop_assert_eq!(merge_contexts(&ab, &b), ab);
    }

    #[test]
    fn prop_merge_sorted_unique_union(a in sorted_unique(), b in sorted_unique()) {
        let merged = merge_contexts(&a, &b);
        prop_assert!(merged.windows(2).all(|w| w[0] < w[1]));
        for v in a.iter().chain(b.iter()) {
            prop_assert!(merged.contains(v));
        }
        prop_assert!(merged.iter().all(|v| a.contains(v) || b.contains(v)));
    }
}
