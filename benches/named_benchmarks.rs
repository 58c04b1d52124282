//! Benchmarks for named-placeholder translation.
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pgflow::named::{referenced_names, translate};
use serde_json::{json, Map, Value};

const SINGLE: &str = "SELECT * FROM users WHERE id = $id";

const FILTERED: &str = "SELECT id, name, email FROM users \
    WHERE region = $region AND age > $min_age AND status = $status \
    ORDER BY created_at DESC LIMIT $limit";

const REPEATED: &str = "SELECT * FROM events \
    WHERE (actor = $user OR target = $user) \
    AND ts BETWEEN $from AND $to \
    AND kind = ANY($kinds) \
    AND NOT (actor = $user AND kind = $excluded)";

fn params(names: &[&str]) -> Map<String, Value> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.to_string(), json!(i)))
        .collect()
}

fn wide_query(n: usize) -> (String, Map<String, Value>) {
    let names: Vec<String> = (0..n).map(|i| format!("p{:03}", i)).collect();
    let predicates: Vec<String> = names.iter().map(|n| format!("c_{n} = ${n}")).collect();
    let sql = format!("SELECT * FROM wide WHERE {}", predicates.join(" AND "));
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    (sql, params(&refs))
}

fn bench_translate(c: &mut Criterion) {
    let mut group = c.benchmark_group("translate");

    let cases = [
        ("single", SINGLE, params(&["id"])),
        (
            "filtered",
            FILTERED,
            params(&["region", "min_age", "status", "limit"]),
        ),
        (
            "repeated",
            REPEATED,
            params(&["user", "from", "to", "kinds", "excluded", "unused"]),
        ),
    ];
    for (name, sql, values) in &cases {
        group.bench_with_input(BenchmarkId::new("translate", name), sql, |b, sql| {
            b.iter(|| translate(black_box(sql), black_box(values)))
        });
    }
    group.finish();
}

fn bench_wide(c: &mut Criterion) {
    let mut group = c.benchmark_group("wide");
    for n in [10, 100] {
        let (sql, values) = wide_query(n);
        group.bench_with_input(BenchmarkId::new("translate", n), &sql, |b, sql| {
            b.iter(|| translate(black_box(sql), black_box(&values)))
        });
        group.bench_with_input(BenchmarkId::new("scan", n), &sql, |b, sql| {
            b.iter(|| referenced_names(black_box(sql)))
        });
    }
    group.finish();
}

fn bench_missing(c: &mut Criterion) {
    let values = params(&["region"]);
    c.bench_function("missing_parameters", |b| {
        b.iter(|| translate(black_box(FILTERED), black_box(&values)).is_err())
    });
}

criterion_group!(benches, bench_translate, bench_wide, bench_missing);
criterion_main!(benches);
