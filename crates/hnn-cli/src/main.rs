//! # hnn-cli
//!
//! CLI для проверки графа признаков и прогона данных через потоковый кеш.

mod inspect;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hnn_cache::Manifest;
use hnn_core::{LabelSource, ModelDescription, ShufflePolicy, VisitPolicy};
use hnn_engine::{FeedPipeline, PipelineConfig, build_graph, open_cache, propagate_context};
use hnn_features::{HtkLabelSource, HtkObservationReader, TargetList};
use hnn_graph::FeatureGraph;

#[derive(Parser)]
#[command(name = "hnn")]
#[command(author, version, about = "RustHNN: feature graphs and streaming training data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Построить граф по описанию модели и вывести его аннотации
    Inspect {
        /// Описание модели (JSON)
        #[arg(long)]
        model: PathBuf,

        /// Конфигурация конвейера (JSON); используется только раздел графа
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Прогнать манифест через кеш и сборщик батчей
    Stream {
        /// Описание модели (JSON)
        #[arg(long)]
        model: PathBuf,

        /// Список высказываний, по одному имени в строке
        #[arg(long)]
        manifest: PathBuf,

        /// Каталог с файлами параметров HTK
        #[arg(long)]
        features: PathBuf,

        /// Расширение файлов параметров
        #[arg(long, default_value = "fea")]
        ext: String,

        /// Конфигурация конвейера (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Каталог с файлами меток HTK (требует --targets)
        #[arg(long)]
        labels: Option<PathBuf>,

        /// Список целей, по одной метке в строке
        #[arg(long)]
        targets: Option<PathBuf>,

        /// Политика обхода: original, utterance-random, frame-random, parallel-original, parallel-random
        #[arg(long)]
        policy: Option<String>,

        /// Перемешивание: random-exchange, fixed-range-exchange, lfsr
        #[arg(long)]
        shuffle: Option<String>,

        /// Кадров в батче (потоков для параллельных политик)
        #[arg(long)]
        batch: Option<usize>,

        /// Число эпох
        #[arg(long, default_value_t = 1)]
        epochs: u32,
    },
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(p) => PipelineConfig::from_json_file(p)
            .with_context(|| format!("не удалось прочитать конфигурацию {}", p.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn load_graph(model: &Path, config: &PipelineConfig) -> Result<FeatureGraph> {
    let description = ModelDescription::from_json_file(model)
        .with_context(|| format!("не удалось прочитать описание модели {}", model.display()))?;
    let mut provider = description.into_provider();
    Ok(build_graph(&mut provider, config.graph.clone())?)
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { model, config } => {
            println!("🔍 RustHNN - Graph Inspection");
            println!("=============================");
            println!("Model: {}", model.display());
            println!();

            let config = load_config(config.as_deref())?;
            let mut graph = load_graph(&model, &config)?;
            let order = propagate_context(&mut graph)?;
            inspect::print_graph(&graph, &order)?;
        }

        Commands::Stream {
            model,
            manifest,
            features,
            ext,
            config,
            labels,
            targets,
            policy,
            shuffle,
            batch,
            epochs,
        } => {
            println!("🎞  RustHNN - Streaming");
            println!("=======================");
            println!("Model: {}", model.display());
            println!("Manifest: {}", manifest.display());
            println!("Features: {}", features.display());

            let mut config = load_config(config.as_deref())?;
            if let Some(p) = policy {
                config.cache.visit_policy = VisitPolicy::from_str_loose(&p)
                    .with_context(|| format!("неизвестная политика обхода '{p}'"))?;
            }
            if let Some(s) = shuffle {
                config.cache.shuffle_policy = ShufflePolicy::from_str_loose(&s)
                    .with_context(|| format!("неизвестный способ перемешивания '{s}'"))?;
            }
            if let Some(b) = batch {
                config.cache.batch_size = b;
            }
            config.validate()?;
            println!(
                "Policy: {}, shuffle: {}, batch: {}, ceiling: {} frames",
                config.cache.visit_policy,
                config.cache.shuffle_policy,
                config.cache.batch_size,
                config.cache.frame_ceiling
            );
            println!();

            let label_source: Option<Box<dyn LabelSource>> = match (labels, targets) {
                (Some(dir), Some(list)) => {
                    let targets = TargetList::from_path(&list)?;
                    println!("🏷  Labels: {} ({} targets)", dir.display(), targets.len());
                    Some(Box::new(HtkLabelSource::new(dir, "lab", targets)))
                }
                (None, None) => None,
                _ => bail!("--labels и --targets задаются вместе"),
            };

            let start = Instant::now();
            let graph = load_graph(&model, &config)?;
            let list = Manifest::from_path(&manifest)?;
            println!("📂 {} utterances in manifest", list.len());
            let reader = HtkObservationReader::new(&features, ext);
            let cache = open_cache(list, Box::new(reader), label_source, &config)?;
            let mut pipeline = FeedPipeline::with_speakers(graph, cache, &config.speakers)?;

            for epoch in 0..epochs {
                if epoch > 0 {
                    pipeline.reset()?;
                }
                let epoch_start = Instant::now();
                let mut batches = 0u64;
                let mut frames = 0usize;
                let mut utterances = 0usize;
                loop {
                    let info = pipeline.next_batch()?;
                    if info.frame_count > 0 {
                        batches += 1;
                    }
                    frames += info.frame_count;
                    utterances += info.utterance_end.iter().filter(|e| **e).count();
                    if info.is_final {
                        break;
                    }
                }
                let stats = pipeline.cache().stats();
                println!(
                    "✅ Epoch {}: {} batches, {} frames, {} utterances ({} skipped), peak {} resident frames, {:.2}s",
                    epoch + 1,
                    batches,
                    frames,
                    utterances,
                    stats.skipped,
                    pipeline.cache().peak_resident_frames(),
                    epoch_start.elapsed().as_secs_f32()
                );
            }
            println!();
            println!("⏱  Total: {:.2}s", start.elapsed().as_secs_f32());
        }
    }

    Ok(())
}
