use compliance_kernel_core::{
    detect_conflicts, evaluate_eligibility, match_concepts, Authority, ConceptRecord, EvaluationContext,
    EvidenceRecord, InMemoryRepository, MalformedPredicatePolicy, MatchSettings, PipelineConfig, Query,
    ReasoningPipeline, RuleCandidate, RuleRecord, RuleStatus, SourcePointerRecord, ValueType,
};
use criterion::{criterion_group, criterion_main, Criterion};
use std::collections::BTreeMap;
use time::{Date, Month, OffsetDateTime};

fn as_of() -> OffsetDateTime {
    match Date::from_calendar_date(2025, Month::March, 1) {
        Ok(date) => date.midnight().assume_utc(),
        Err(err) => panic!("invalid bench date: {err}"),
    }
}

fn mk_concept(index: usize) -> ConceptRecord {
    ConceptRecord {
        id: format!("c-{index}"),
        slug: format!("doprinos-{index}"),
        name: format!("Stopa doprinosa skupina {index}"),
        aliases: vec![format!("doprinos {index}")],
        embedding: None,
    }
}

fn mk_evidence(index: usize) -> EvidenceRecord {
    EvidenceRecord {
        id: format!("ev-{index}"),
        url: format!("https://narodne-novine.nn.hr/clanci/sluzbeni/bench-{index}.html"),
        fetched_at: Some(as_of()),
        source: "narodne-novine".to_string(),
        title: None,
    }
}

fn mk_rule(index: usize, slug: &str) -> RuleRecord {
    RuleRecord {
        id: format!("rule-{index:04}"),
        concept_slug: slug.to_string(),
        title: format!("Stopa doprinosa {index}"),
        law_reference: Some("Zakon o doprinosima".to_string()),
        authority: if index % 3 == 0 { Authority::Law } else { Authority::Guidance },
        status: RuleStatus::Published,
        effective_from: Date::from_calendar_date(2019, Month::January, 1).ok(),
        effective_until: None,
        confidence: 0.9,
        value: "20".to_string(),
        value_type: ValueType::Percentage,
        applies_if: Some(serde_json::json!({ "op": "in", "field": "entity.type", "values": ["limited_company", "sole_trader"] })),
        sources: vec![SourcePointerRecord {
            exact_quote: "Stopa doprinosa iznosi 20 %".to_string(),
            evidence_id: format!("ev-{index}"),
        }],
    }
}

fn repository() -> InMemoryRepository {
    let mut repository = InMemoryRepository::new().with_concept(ConceptRecord {
        id: "c-pension".to_string(),
        slug: "doprinos-mirovinsko".to_string(),
        name: "Stopa doprinosa za mirovinsko osiguranje".to_string(),
        aliases: Vec::new(),
        embedding: None,
    });
    for index in 0..200 {
        repository = repository.with_concept(mk_concept(index));
    }
    for index in 0..500 {
        repository = repository
            .with_evidence(mk_evidence(index))
            .with_rule(mk_rule(index, "doprinos-mirovinsko"));
    }
    repository
}

fn bench_pipeline(c: &mut Criterion) {
    let repository = repository();
    let client = compliance_kernel_core::ClientContext {
        legal_form: Some("d.o.o.".to_string()),
        ..compliance_kernel_core::ClientContext::default()
    };
    let query = Query::new("Kolika je stopa doprinosa za mirovinsko osiguranje u Hrvatskoj?")
        .with_client(client)
        .with_as_of(as_of());

    c.bench_function("pipeline_500_rules", |b| {
        b.iter(|| {
            let (events, terminal) =
                ReasoningPipeline::new(query.clone(), &repository, PipelineConfig::default()).run_to_completion();
            if events.is_empty() || terminal.outcome() == "ERROR" {
                panic!("pipeline benchmark run failed: {terminal:?}");
            }
        });
    });
}

fn bench_stages(c: &mut Criterion) {
    let concepts = (0..1_000).map(mk_concept).collect::<Vec<_>>();
    let settings = MatchSettings::default();
    c.bench_function("match_concepts_1000", |b| {
        b.iter(|| match_concepts("stopa doprinosa skupina 42", &concepts, &settings, None));
    });

    let evidence = (0..1_000).map(|index| (format!("ev-{index}"), mk_evidence(index))).collect::<BTreeMap<_, _>>();
    let candidates = (0..1_000)
        .map(|index| RuleCandidate::from_record(mk_rule(index, &format!("doprinos-{}", index % 10)), &evidence))
        .collect::<Vec<_>>();
    let client = compliance_kernel_core::ClientContext {
        legal_form: Some("obrt".to_string()),
        ..compliance_kernel_core::ClientContext::default()
    };
    let context = EvaluationContext::from_client(Some(&client), as_of().date());
    c.bench_function("eligibility_and_conflicts_1000", |b| {
        b.iter(|| {
            let report =
                evaluate_eligibility(candidates.clone(), &context, as_of().date(), MalformedPredicatePolicy::FailOpen);
            detect_conflicts(&report.eligible)
        });
    });
}

criterion_group!(pipeline_benches, bench_pipeline, bench_stages);
criterion_main!(pipeline_benches);
