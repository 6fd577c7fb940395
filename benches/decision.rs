use authzd::config::AuditOptions;
use authzd::iam::PolicyLookup;
use authzd::{
    AuditPipeline, AuditSink, DecisionEngine, DecisionRequest, Effect, PatternMatcher, Policy,
    Result,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::sync::Arc;

struct Static(Arc<Vec<Policy>>);

impl PolicyLookup for Static {
    fn policies_for(&self, _key: &str) -> Result<Option<Arc<Vec<Policy>>>> {
        Ok(Some(Arc::clone(&self.0)))
    }
}

struct Discard;

impl AuditSink for Discard {
    fn append_batch(&self, _key: &str, _records: &[Vec<u8>]) -> Result<()> {
        Ok(())
    }
}

/// A realistic policy set for one subject
fn create_policies(extra: usize) -> Vec<Policy> {
    let mut policies = vec![
        Policy::new("public-read", "users:<.*>", "<read|list>", "public:<.*>", Effect::Allow),
        Policy::new(
            "own-docs",
            "users:alice",
            "<read|write>",
            "users:alice:documents:<.*>",
            Effect::Allow,
        ),
        Policy::new("system", "users:<.*>", "write", "system:<.*>", Effect::Deny),
        Policy::new("office", "users:alice", "<.*>", "reports:<.*>", Effect::Allow)
            .with_condition("remoteIP", "cidr", json!({"range": "10.0.0.0/8"})),
    ];
    for i in 0..extra {
        policies.push(Policy::new(
            format!("filler-{i}"),
            "users:alice",
            "read",
            format!("project{i}:<.*>"),
            Effect::Allow,
        ));
    }
    policies
}

fn engine(policies: Vec<Policy>) -> DecisionEngine {
    let audit = Arc::new(AuditPipeline::new(
        AuditOptions {
            records_buffer_size: 100_000,
            detailed_recording: false,
            ..AuditOptions::default()
        },
        Arc::new(Discard),
    ));
    audit.start(2).unwrap();
    DecisionEngine::new(Arc::new(Static(Arc::new(policies))), audit)
}

fn request(resource: &str) -> DecisionRequest {
    DecisionRequest::new("users:alice", "read", resource)
        .with_context("username", "alice")
        .with_context("remoteIP", "10.1.2.3")
}

/// Decisions against warm pattern caches (hot path)
fn bench_authorize(c: &mut Criterion) {
    let mut group = c.benchmark_group("authorize");

    for count in [100u64, 1_000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let engine = engine(create_policies(0));
            b.iter(|| {
                for i in 0..count {
                    let resource = if i % 2 == 0 { "public:readme" } else { "reports:q3" };
                    black_box(engine.authorize(&request(resource)));
                }
            });
        });
    }

    group.finish();
}

/// Candidate pool size
fn bench_policy_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy_count");

    for extra in [5usize, 25, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(extra), &extra, |b, &extra| {
            let engine = engine(create_policies(extra));
            b.iter(|| black_box(engine.authorize(&request("project3:file"))));
        });
    }

    group.finish();
}

/// Pattern compilation versus cached regexes
fn bench_pattern_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("pattern_matching");

    group.bench_function("literal", |b| {
        let matcher = PatternMatcher::default();
        b.iter(|| black_box(matcher.matches("users:alice", "users:alice").unwrap_or(false)));
    });

    group.bench_function("cached_regex", |b| {
        let matcher = PatternMatcher::default();
        b.iter(|| {
            for i in 0..100 {
                let value = format!("articles:{i}");
                black_box(matcher.matches("articles:<[0-9]+>", &value).unwrap_or(false));
            }
        });
    });

    group.bench_function("cold_regex", |b| {
        b.iter(|| {
            let matcher = PatternMatcher::new(1);
            for i in 0..20 {
                let pattern = format!("articles{i}:<.*>");
                black_box(matcher.matches(&pattern, "articles3:x").unwrap_or(false));
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_authorize,
    bench_policy_count,
    bench_pattern_matching
);
criterion_main!(benches);
