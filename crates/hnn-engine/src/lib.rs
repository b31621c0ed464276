//! # hnn-engine
//!
//! Единый фасад подачи данных RustHNN.
//!
//! `FeedPipeline` связывает граф признаков, потоковый кеш, сборку батчей и
//! подмену параметров дикторов: один вызов `next_batch` выдаёт очередной
//! батч, после чего входные матрицы читаются прямо из графа.
//!
//! # Пример
//!
//! ```ignore
//! use hnn_engine::{FeedPipeline, PipelineConfig};
//! use hnn_core::ModelDescription;
//!
//! let config = PipelineConfig::default();
//! let mut provider = ModelDescription::from_json_file("model.json")?.into_provider();
//! let graph = hnn_engine::build_graph(&mut provider, config.graph.clone())?;
//! let cache = hnn_engine::open_cache(manifest, Box::new(reader), None, &config)?;
//! let mut pipeline = FeedPipeline::new(graph, cache)?;
//! loop {
//!     let info = pipeline.next_batch()?;
//!     // входы слоёв читаются из pipeline.graph()
//!     if info.is_final {
//!         break;
//!     }
//! }
//! ```

mod pipeline;

pub use hnn_graph::{build_graph, propagate_context};
pub use pipeline::{BatchInfo, FeedPipeline, PipelineConfig, open_cache};
