//! Dependency graph mutation and validation benchmarks
//!
//! Benchmarks for the hot writer path: adding a repository's worth of
//! models, re-validating after a modification, and cascading removal.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use model_repo_manager::graph::{DependencyGraph, connect_affected};
use model_repo_manager::model::{ModelIdentifier, ModelInfo, ModelInfoMap};
use model_repo_manager::model_config::{ANY_VERSION, EnsembleConfig, EnsembleStep, ModelConfig};
use std::collections::BTreeSet;
use std::hint::black_box;
use std::path::PathBuf;

/// `count` leaves, each referenced by one ensemble
fn repository(count: usize) -> ModelInfoMap {
    let mut infos = ModelInfoMap::new();
    for i in 0..count {
        let leaf = format!("leaf-{i}");
        let mut info = ModelInfo::new(
            ModelConfig::autofill(&leaf),
            PathBuf::from("/repo").join(&leaf),
            1,
        );
        info.explicitly_load = true;
        infos.insert(ModelIdentifier::global(&leaf), info);

        let ensemble = format!("pipeline-{i}");
        let mut config = ModelConfig::autofill(&ensemble);
        config.platform = "ensemble".to_string();
        config.ensemble = Some(EnsembleConfig {
            step: vec![EnsembleStep {
                model_name: leaf,
                model_version: ANY_VERSION,
            }],
        });
        let mut info = ModelInfo::new(config, PathBuf::from("/repo").join(&ensemble), 1);
        info.explicitly_load = true;
        infos.insert(ModelIdentifier::global(&ensemble), info);
    }
    infos
}

fn populated(infos: &ModelInfoMap) -> DependencyGraph {
    let ids: BTreeSet<ModelIdentifier> = infos.keys().cloned().collect();
    let mut graph = DependencyGraph::new();
    let affected = graph.add_nodes(&ids, infos);
    connect_affected(&mut graph, &affected);
    graph
}

fn bench_add_and_connect(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_add_and_connect");
    for model_count in [10, 100, 1000] {
        let infos = repository(model_count);
        group.bench_with_input(
            BenchmarkId::new("models", model_count * 2),
            &infos,
            |b, infos| {
                b.iter(|| black_box(populated(infos)));
            },
        );
    }
    group.finish();
}

fn bench_update_revalidation(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_update_revalidation");
    for model_count in [10, 100, 1000] {
        let infos = repository(model_count);
        let graph = populated(&infos);
        let modified: BTreeSet<ModelIdentifier> = infos
            .keys()
            .filter(|id| id.name.starts_with("leaf"))
            .cloned()
            .collect();

        group.bench_with_input(
            BenchmarkId::new("models", model_count * 2),
            &(graph, infos, modified),
            |b, (graph, infos, modified)| {
                b.iter_batched(
                    || graph.clone(),
                    |mut graph| {
                        let affected = graph.update_nodes(modified, infos);
                        connect_affected(&mut graph, &affected);
                        black_box(graph)
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

fn bench_cascading_removal(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_cascading_removal");
    for model_count in [10, 100, 1000] {
        let infos = repository(model_count);
        let graph = populated(&infos);
        let ensembles: BTreeSet<ModelIdentifier> = infos
            .keys()
            .filter(|id| id.name.starts_with("pipeline"))
            .cloned()
            .collect();

        group.bench_with_input(
            BenchmarkId::new("models", model_count * 2),
            &(graph, ensembles),
            |b, (graph, ensembles)| {
                b.iter_batched(
                    || graph.clone(),
                    |mut graph| {
                        black_box(graph.remove_nodes(ensembles, true));
                        graph
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_add_and_connect,
    bench_update_revalidation,
    bench_cascading_removal
);
criterion_main!(benches);
