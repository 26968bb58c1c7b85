use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use costmeter::coster::calculate;
use costmeter::coster::exporter::buffering::BufferingExporter;
use costmeter::coster::exporter::stats::StatsExporter;
use costmeter::coster::exporter::CostExporter;
use costmeter::coster::mapper::{source_view, Mapper, Mapping, PathExpr};
use costmeter::coster::record::{CostKind, CostRecord};
use costmeter::coster::strategy::PricingStrategy;
use costmeter::coster::table::{Labels, PricingEntry, PricingTable};
use costmeter::export::health::HealthMetrics;
use costmeter::inventory::{
    Container, Node, NodeStatus, ObjectMeta, Quantity, ResourceRequirements, Workload,
    WorkloadSpec, WorkloadStatus, PHASE_RUNNING,
};

const NODES: usize = 50;
const PODS_PER_NODE: usize = 40;

fn node(idx: usize) -> Node {
    Node {
        metadata: ObjectMeta {
            name: format!("node-{idx}"),
            labels: BTreeMap::from([(
                "pool".to_string(),
                if idx % 5 == 0 { "gpu" } else { "general" }.to_string(),
            )]),
            ..Default::default()
        },
        status: NodeStatus {
            capacity: BTreeMap::from([
                ("cpu".to_string(), Quantity::new("16")),
                ("memory".to_string(), Quantity::new("64Gi")),
                ("nvidia.com/gpu".to_string(), Quantity::new("2")),
            ]),
        },
    }
}

fn workload(node_idx: usize, idx: usize) -> Workload {
    Workload {
        metadata: ObjectMeta {
            name: format!("pod-{node_idx}-{idx}"),
            namespace: "bench".to_string(),
            labels: BTreeMap::from([("app".to_string(), format!("svc-{}", idx % 12))]),
            ..Default::default()
        },
        spec: WorkloadSpec {
            node_name: format!("node-{node_idx}"),
            containers: vec![Container {
                name: "main".to_string(),
                resources: ResourceRequirements {
                    requests: BTreeMap::from([
                        ("cpu".to_string(), Quantity::new("250m")),
                        ("memory".to_string(), Quantity::new("512Mi")),
                    ]),
                },
            }],
        },
        status: WorkloadStatus {
            phase: PHASE_RUNNING.to_string(),
        },
    }
}

fn table() -> PricingTable {
    PricingTable::new(vec![
        PricingEntry {
            labels: Labels::from([("pool".to_string(), "gpu".to_string())]),
            hourly_milli_cpu_cost_micro_cents: 3000.0,
            hourly_memory_byte_cost_micro_cents: 0.0004,
            hourly_gpu_cost_micro_cents: 7_000_000.0,
        },
        PricingEntry {
            labels: Labels::new(),
            hourly_milli_cpu_cost_micro_cents: 1000.0,
            hourly_memory_byte_cost_micro_cents: 0.0002,
            hourly_gpu_cost_micro_cents: 0.0,
        },
    ])
}

fn mapper() -> Mapper {
    Mapper::new(vec![
        Mapping {
            source: PathExpr::parse("{.Pod.ObjectMeta.Labels.app}").expect("path"),
            destination: "service".to_string(),
            default: "unknown".to_string(),
        },
        Mapping {
            source: PathExpr::parse("{.Node.Labels['pool']}").expect("path"),
            destination: "pool".to_string(),
            default: "none".to_string(),
        },
    ])
}

fn bench_strategies(c: &mut Criterion) {
    let nodes: Vec<Node> = (0..NODES).map(node).collect();
    let workloads: Vec<Workload> = (0..NODES)
        .flat_map(|n| (0..PODS_PER_NODE).map(move |i| workload(n, i)))
        .collect();
    let table = table();

    c.bench_function("calculate_all_strategies_2000_pods", |b| {
        b.iter(|| {
            let items = calculate(
                &PricingStrategy::ALL,
                &table,
                Duration::from_secs(10),
                black_box(&workloads),
                black_box(&nodes),
            );
            black_box(items.len())
        });
    });

    let mapper = mapper();
    let items = calculate(
        &[PricingStrategy::Weighted],
        &table,
        Duration::from_secs(10),
        &workloads,
        &nodes,
    );
    c.bench_function("map_dimensions_2000_items", |b| {
        b.iter(|| {
            for item in &items {
                black_box(mapper.map_data(&source_view(item)));
            }
        });
    });
}

fn bench_buffer_merge(c: &mut Criterion) {
    let health = std::sync::Arc::new(HealthMetrics::new(":0").expect("health"));
    let stats = StatsExporter::new(&["service"], std::sync::Arc::clone(&health)).expect("stats");
    let buffer = BufferingExporter::new(
        CostExporter::Stats(stats),
        Duration::from_secs(300),
        Some(health),
    );

    let now = Utc::now();
    let records: Vec<CostRecord> = (0..2000)
        .map(|i| CostRecord {
            kind: CostKind::Weighted,
            strategy: "WeightedPricingStrategy".to_string(),
            value: 1_000,
            dimensions: BTreeMap::from([
                ("service".to_string(), format!("svc-{}", i % 12)),
                ("pool".to_string(), "general".to_string()),
            ]),
            end_time: now,
        })
        .collect();

    c.bench_function("buffer_merge_2000_records", |b| {
        b.iter(|| {
            for record in &records {
                buffer.export_cost(record.clone());
            }
            black_box(buffer.drain().len())
        });
    });
}

criterion_group!(benches, bench_strategies, bench_buffer_merge);
criterion_main!(benches);
