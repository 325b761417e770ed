//! Cross-module properties: normalization, cache keys, placeholder binding,
//! and the validator's boundary behavior, checked over a spread of inputs.

use nlsearch::cache::cache_key;
use nlsearch::intent::IntentClassifier;
use nlsearch::models::{normalize_query, RuleId, SearchOptions, SqlArtifact};
use nlsearch::rules::RuleBasedGenerator;
use nlsearch::validator::{SqlValidator, MAX_SQL_BYTES};

const WHITELIST: [&str; 5] = [
    "customers",
    "customer_memos",
    "customer_products",
    "users",
    "events",
];

const SAMPLE_QUERIES: [&str; 10] = [
    "customers named 홍길동",
    "  고객   목록  보여주세요 ",
    "최근 3개월 가입 고객 수",
    "서울 지역 고객과 메모",
    "average premium by region for 30대",
    "건강보험 가입 고객",
    "UPPER Case QUERY",
    "지난달 해지 내역",
    "100만원 이상 계약",
    "tab\tand\nnewline  query",
];

#[test]
fn normalization_is_idempotent_for_all_samples() {
    for query in SAMPLE_QUERIES {
        let once = normalize_query(query);
        assert_eq!(normalize_query(&once), once, "not idempotent for {:?}", query);
    }
}

#[test]
fn cache_key_is_invariant_under_normalization() {
    let options = SearchOptions::default();
    let context = serde_json::json!({"dept": "sales", "region": "서울"});
    for query in SAMPLE_QUERIES {
        let direct = cache_key(&normalize_query(query), &context, &options);
        let renormalized = cache_key(
            &normalize_query(&normalize_query(query)),
            &context,
            &options,
        );
        assert_eq!(direct, renormalized);
        assert_eq!(direct.len(), 32);
    }
}

#[test]
fn whitespace_and_case_variants_share_keys() {
    let options = SearchOptions::default();
    let context = serde_json::json!({});
    let a = cache_key(&normalize_query("Customers  Named 홍길동"), &context, &options);
    let b = cache_key(&normalize_query("customers named 홍길동"), &context, &options);
    assert_eq!(a, b);
}

#[test]
fn every_rule_artifact_binds_exactly_its_placeholders() {
    let classifier = IntentClassifier::new(None);
    let generator = RuleBasedGenerator::new();

    for query in SAMPLE_QUERIES {
        let intent = classifier.classify(&normalize_query(query));
        if let Some(artifact) = generator.generate(&intent) {
            let placeholders = SqlArtifact::placeholders(&artifact.sql);
            let keys: std::collections::BTreeSet<String> =
                artifact.parameters.keys().cloned().collect();
            assert_eq!(
                placeholders, keys,
                "placeholder mismatch for {:?}: {}",
                query, artifact.sql
            );
        }
    }
}

#[test]
fn accepted_sql_always_carries_an_enforceable_limit() {
    let classifier = IntentClassifier::new(None);
    let generator = RuleBasedGenerator::new();
    let validator = SqlValidator::new(WHITELIST);

    for query in SAMPLE_QUERIES {
        let intent = classifier.classify(&normalize_query(query));
        if let Some(artifact) = generator.generate(&intent) {
            let verdict = validator.validate(&artifact.sql);
            assert!(
                verdict.accepted,
                "rule artifact rejected for {:?}: {:?}",
                query, verdict.reasons
            );
            let upper = verdict.normalized_sql.to_uppercase();
            let is_aggregate = upper.contains("COUNT(") || upper.contains("AVG(");
            assert!(
                upper.contains("LIMIT") || is_aggregate,
                "no LIMIT in executable SQL: {}",
                verdict.normalized_sql
            );
        }
    }
}

#[test]
fn limit_boundary_is_exact() {
    let validator = SqlValidator::new(WHITELIST);
    assert!(validator.validate("SELECT * FROM customers LIMIT 100").accepted);

    let over = validator.validate("SELECT * FROM customers LIMIT 101");
    assert!(!over.accepted);
    assert_eq!(over.reasons, vec![RuleId::LimitExceeded]);
}

#[test]
fn length_boundary_is_exact() {
    let validator = SqlValidator::new(WHITELIST);
    let base = "SELECT * FROM customers WHERE name = '' LIMIT 1";
    let pad = MAX_SQL_BYTES - base.len();

    let at = format!(
        "SELECT * FROM customers WHERE name = '{}' LIMIT 1",
        "x".repeat(pad)
    );
    assert_eq!(at.len(), MAX_SQL_BYTES);
    assert!(validator.validate(&at).accepted);

    let over = format!(
        "SELECT * FROM customers WHERE name = '{}' LIMIT 1",
        "x".repeat(pad + 1)
    );
    assert!(validator
        .validate(&over)
        .reasons
        .contains(&RuleId::TooLong));
}

#[test]
fn context_key_order_never_changes_the_key() {
    let options = SearchOptions::default();
    let ordered = serde_json::json!({"a": 1, "b": 2, "c": 3});
    let shuffled = serde_json::json!({"c": 3, "a": 1, "b": 2});
    assert_eq!(
        cache_key("q", &ordered, &options),
        cache_key("q", &shuffled, &options)
    );
}

#[test]
fn rejection_reasons_never_echo_sql() {
    let validator = SqlValidator::new(WHITELIST);
    let hostile = "'; DROP TABLE customers; --";
    let verdict = validator.validate(hostile);
    assert!(!verdict.accepted);
    for rule in &verdict.reasons {
        assert!(!rule.as_str().contains("DROP"));
    }
    let err = nlsearch::error::SearchError::Security {
        rules: verdict.reasons,
    };
    assert!(!err.client_message().contains("DROP TABLE"));
}
