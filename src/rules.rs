//! Deterministic rule-based SQL generation.
//!
//! A small table of pattern templates keyed on the intent kind and the
//! entities the classifier actually extracted. Values are always bound as
//! `%(name)s` parameters, never inlined into the SQL text. Each template
//! carries a fixed confidence in 0.6–0.8; when nothing matches the generator
//! reports no match and the strategy layer decides what happens next.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use regex::Regex;
use std::sync::OnceLock;

use crate::models::{EntityKind, Intent, IntentKind, SqlArtifact, SqlSource};

pub struct RuleBasedGenerator;

impl RuleBasedGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Translate an intent into SQL, or `None` when no template applies.
    pub fn generate(&self, intent: &Intent) -> Option<SqlArtifact> {
        match intent.kind {
            IntentKind::SimpleQuery => self.simple_query(intent),
            IntentKind::Filtering => self.filtering(intent),
            IntentKind::Aggregation => Some(self.aggregation(intent)),
            IntentKind::Join => Some(self.join(intent)),
        }
    }

    fn simple_query(&self, intent: &Intent) -> Option<SqlArtifact> {
        if let Some(name) = intent.first_entity(EntityKind::CustomerName) {
            let mut parameters = BTreeMap::new();
            parameters.insert("customer_name".to_string(), serde_json::json!(name));
            return Some(artifact(
                "SELECT * FROM customers WHERE name = %(customer_name)s LIMIT 100",
                parameters,
                "customer lookup by exact name",
                0.8,
            ));
        }

        Some(artifact(
            "SELECT * FROM customers ORDER BY created_at DESC LIMIT 100",
            BTreeMap::new(),
            "recent customer listing",
            0.6,
        ))
    }

    fn filtering(&self, intent: &Intent) -> Option<SqlArtifact> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut parameters = BTreeMap::new();
        let mut confidence: f64 = 0.6;

        if let Some(name) = intent.first_entity(EntityKind::CustomerName) {
            conditions.push("name = %(customer_name)s");
            parameters.insert("customer_name".to_string(), serde_json::json!(name));
            confidence = 0.75;
        }
        if let Some(date) = intent.first_entity(EntityKind::Date) {
            conditions.push("created_at >= %(start_date)s");
            parameters.insert(
                "start_date".to_string(),
                serde_json::json!(resolve_start_date(date)),
            );
            confidence = confidence.max(0.7);
        }
        if let Some(location) = intent.first_entity(EntityKind::Location) {
            conditions.push("address LIKE %(location)s");
            parameters.insert(
                "location".to_string(),
                serde_json::json!(format!("%{}%", location)),
            );
            confidence = confidence.max(0.65);
        }

        if conditions.is_empty() {
            return None;
        }

        let sql = format!(
            "SELECT * FROM customers WHERE {} LIMIT 100",
            conditions.join(" AND ")
        );
        Some(artifact(&sql, parameters, "filtered customer listing", confidence))
    }

    fn aggregation(&self, intent: &Intent) -> SqlArtifact {
        let mut parameters = BTreeMap::new();

        if let Some(date) = intent.first_entity(EntityKind::Date) {
            parameters.insert(
                "start_date".to_string(),
                serde_json::json!(resolve_start_date(date)),
            );
            return artifact(
                "SELECT COUNT(*) AS customer_count FROM customers WHERE created_at >= %(start_date)s",
                parameters,
                "customer count since a date",
                0.7,
            );
        }

        if let Some(product) = intent.first_entity(EntityKind::ProductName) {
            parameters.insert("product_name".to_string(), serde_json::json!(product));
            return artifact(
                "SELECT COUNT(*) AS subscription_count, AVG(coverage_amount) AS avg_coverage \
                 FROM customer_products WHERE product_name = %(product_name)s",
                parameters,
                "subscription stats for one product",
                0.7,
            );
        }

        artifact(
            "SELECT COUNT(*) AS customer_count FROM customers",
            parameters,
            "total customer count",
            0.6,
        )
    }

    fn join(&self, intent: &Intent) -> SqlArtifact {
        if let Some(name) = intent.first_entity(EntityKind::CustomerName) {
            let mut parameters = BTreeMap::new();
            parameters.insert("customer_name".to_string(), serde_json::json!(name));
            return artifact(
                "SELECT c.customer_id, c.name, m.refined_memo, m.created_at \
                 FROM customers c \
                 LEFT JOIN customer_memos m ON m.customer_id = c.customer_id \
                 WHERE c.name = %(customer_name)s \
                 ORDER BY m.created_at DESC LIMIT 100",
                parameters,
                "memos for one customer",
                0.7,
            );
        }

        artifact(
            "SELECT c.customer_id, c.name, m.refined_memo, m.created_at \
             FROM customers c \
             LEFT JOIN customer_memos m ON m.customer_id = c.customer_id \
             ORDER BY m.created_at DESC LIMIT 100",
            BTreeMap::new(),
            "customers joined with recent memos",
            0.6,
        )
    }
}

impl Default for RuleBasedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn artifact(
    sql: &str,
    parameters: BTreeMap<String, serde_json::Value>,
    explanation: &str,
    confidence: f64,
) -> SqlArtifact {
    SqlArtifact {
        sql: sql.to_string(),
        parameters,
        explanation: explanation.to_string(),
        confidence,
        source: SqlSource::Rule,
    }
}

fn relative_date_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:최근|지난)\s*(\d+)\s*개?([일주월년])").expect("static pattern")
    })
}

/// Resolve a date entity to an ISO date string. Absolute dates pass through;
/// relative Korean expressions count back from today; anything unparseable
/// falls back to 30 days ago.
fn resolve_start_date(raw: &str) -> String {
    let today = Utc::now().date_naive();

    if let Some(caps) = relative_date_pattern().captures(raw) {
        let n: i64 = caps[1].parse().unwrap_or(1);
        let delta = match &caps[2] {
            "일" => Duration::days(n),
            "주" => Duration::weeks(n),
            "월" => Duration::days(30 * n),
            _ => Duration::days(365 * n),
        };
        return (today - delta).format("%Y-%m-%d").to_string();
    }

    match raw {
        "오늘" => return today.format("%Y-%m-%d").to_string(),
        "어제" => return (today - Duration::days(1)).format("%Y-%m-%d").to_string(),
        "이번주" | "지난주" => {
            return (today - Duration::weeks(1)).format("%Y-%m-%d").to_string()
        }
        "이번달" | "지난달" => {
            return (today - Duration::days(30)).format("%Y-%m-%d").to_string()
        }
        _ => {}
    }

    let cleaned = raw.replace(['.', '/'], "-");
    if chrono::NaiveDate::parse_from_str(&cleaned, "%Y-%m-%d").is_ok() {
        return cleaned;
    }

    (today - Duration::days(30)).format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::IntentClassifier;
    use crate::models::SqlArtifact as Artifact;

    fn classify(q: &str) -> Intent {
        IntentClassifier::new(None).classify(q)
    }

    #[test]
    fn named_customer_template() {
        let artifact = RuleBasedGenerator::new()
            .generate(&classify("customers named 홍길동"))
            .unwrap();
        assert!(artifact.sql.contains("WHERE name = %(customer_name)s"));
        assert_eq!(
            artifact.parameters.get("customer_name"),
            Some(&serde_json::json!("홍길동"))
        );
        assert!(artifact.confidence >= 0.6);
    }

    #[test]
    fn every_template_binds_its_placeholders() {
        let generator = RuleBasedGenerator::new();
        for query in [
            "customers named 홍길동",
            "고객 목록",
            "최근 3개월 가입 고객",
            "서울 지역 고객",
            "고객 수 통계",
            "건강보험 평균",
            "홍길동 고객과 메모",
            "고객과 메모 함께",
        ] {
            if let Some(artifact) = generator.generate(&classify(query)) {
                assert!(
                    artifact.placeholders_bound(),
                    "unbound placeholders for: {} → {}",
                    query,
                    artifact.sql
                );
            }
        }
    }

    #[test]
    fn values_never_inlined() {
        let artifact = RuleBasedGenerator::new()
            .generate(&classify("customers named 홍길동"))
            .unwrap();
        assert!(!artifact.sql.contains("홍길동"));
    }

    #[test]
    fn filtering_without_usable_entities_is_no_match() {
        // Force a filtering intent with no extractable entities.
        let mut intent = classify("최근 가입");
        intent.entities.clear();
        intent.kind = IntentKind::Filtering;
        assert!(RuleBasedGenerator::new().generate(&intent).is_none());
    }

    #[test]
    fn confidence_stays_in_template_band() {
        let generator = RuleBasedGenerator::new();
        for query in ["customers named 홍길동", "고객 수 통계", "고객과 메모 함께"] {
            let artifact = generator.generate(&classify(query)).unwrap();
            assert!((0.6..=0.8).contains(&artifact.confidence));
        }
    }

    #[test]
    fn relative_dates_resolve_to_iso() {
        let date = resolve_start_date("최근 3개월");
        assert!(chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d").is_ok());
        assert_eq!(resolve_start_date("2024-01-05"), "2024-01-05");
        assert_eq!(resolve_start_date("2024.01.05"), "2024-01-05");
    }

    #[test]
    fn placeholder_sets_match_parameter_keys() {
        let artifact = RuleBasedGenerator::new()
            .generate(&classify("최근 3개월 서울 고객"))
            .unwrap();
        let names = Artifact::placeholders(&artifact.sql);
        let keys: std::collections::BTreeSet<String> =
            artifact.parameters.keys().cloned().collect();
        assert_eq!(names, keys);
    }
}
