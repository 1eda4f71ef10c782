use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use conduit_core::manager::graph::resolve;
use conduit_core::source::FileFormat;
use conduit_core::validation::{
    CompletenessValidator, ContentQualityValidator, DuplicateValidator, FieldSpec, FieldType,
    SchemaValidator, StaticKeys,
};
use conduit_core::{CompositeValidator, PipelineConfig, RawItem, SourceSpec, ValidationMode};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

fn sample_items(n: usize) -> Vec<RawItem> {
    (0..n)
        .map(|i| {
            let title = if i % 10 == 0 { json!(null) } else { json!(format!("Study {i}")) };
            RawItem::new(
                format!("PMC{i}"),
                json!({
                    "pmcid": format!("PMC{i}"),
                    "title": title,
                    "year": 2000 + (i % 25),
                    "abstract": "Tumor suppressor gene expression was measured in kidney tissue \
                                 samples, and protein levels correlated with patient outcomes.",
                }),
            )
        })
        .collect()
}

fn validators(mode: ValidationMode) -> CompositeValidator {
    let mut fields = BTreeMap::new();
    fields.insert("pmcid".to_string(), FieldSpec::required(FieldType::String));
    fields.insert("year".to_string(), FieldSpec::optional(FieldType::Integer));
    let mut patterns = BTreeMap::new();
    patterns.insert("pmcid".to_string(), r"PMC\d+".to_string());

    CompositeValidator::new(
        vec![
            Box::new(SchemaValidator::new(fields, true)),
            Box::new(
                CompletenessValidator::new(
                    vec!["pmcid".into(), "title".into()],
                    vec!["abstract".into()],
                    &patterns,
                )
                .unwrap(),
            ),
            Box::new(
                ContentQualityValidator::new(["tumor", "gene", "protein", "kidney", "expression"])
                    .with_length_bounds(50, Some(10_000)),
            ),
        ],
        mode,
    )
}

fn bench_validation(c: &mut Criterion) {
    let items = sample_items(1_000);
    let mut group = c.benchmark_group("composite_validation");
    group.throughput(Throughput::Elements(items.len() as u64));
    for mode in [ValidationMode::Strict, ValidationMode::Lenient] {
        let composite = validators(mode);
        let id = BenchmarkId::from_parameter(format!("{mode:?}"));
        group.bench_with_input(id, &items, |b, items| {
            b.iter(|| {
                items
                    .iter()
                    .filter(|item| composite.validate(black_box(item)).valid)
                    .count()
            })
        });
    }
    group.finish();
}

fn bench_duplicate_detection(c: &mut Criterion) {
    let items = sample_items(1_000);
    let existing = StaticKeys::new((0..10_000).step_by(3).map(|i| format!("PMC{i}")));
    let composite = CompositeValidator::new(
        vec![Box::new(DuplicateValidator::new("pmcid", Arc::new(existing), false))],
        ValidationMode::Strict,
    );
    c.bench_function("duplicate_validator_1000", |b| {
        b.iter(|| items.iter().filter(|item| composite.validate(item).valid).count())
    });
}

fn bench_dependency_resolution(c: &mut Criterion) {
    let configs: Vec<PipelineConfig> = (0..200)
        .map(|i| {
            let deps: Vec<String> = [i / 2, i / 3]
                .into_iter()
                .filter(|d| *d < i)
                .map(|d| format!("p{d:03}"))
                .collect();
            PipelineConfig::new(
                format!("p{i:03}"),
                SourceSpec::File {
                    path: "data.jsonl".into(),
                    format: FileFormat::default(),
                    id_field: None,
                },
            )
            .with_dependencies(deps)
        })
        .collect();

    c.bench_function("resolve_200_pipelines", |b| {
        b.iter(|| resolve(black_box(&configs), BTreeMap::new()))
    });
}

criterion_group!(
    benches,
    bench_validation,
    bench_duplicate_detection,
    bench_dependency_resolution,
);
criterion_main!(benches);
