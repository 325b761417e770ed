//! Prompt rendering for the LLM SQL generator.
//!
//! The prompt is a data asset: a static schema summary, a handful of
//! example pairs, and a strict respond-with-JSON directive. The generator
//! renders it with the user query and the classifier's reading, and the
//! response parser in [`crate::llm`] holds the other end of the contract.

use crate::models::Intent;

/// Columns exposed to the model, per whitelisted table. Kept in sync with
/// the read replica's schema by hand; the validator is the enforcement
/// layer, this is only guidance.
pub const SCHEMA_SUMMARY: &str = "\
Tables available (PostgreSQL, read-only):
  customers(customer_id, name, affiliation, gender, date_of_birth, phone, address, job_title, created_at, updated_at)
  customer_memos(id, customer_id, original_memo, refined_memo, status, author, created_at)
  customer_products(product_id, customer_id, product_name, coverage_amount, subscription_date, created_at)
  users(id, name, email, phone, created_at)
  events(event_id, customer_id, memo_id, event_type, scheduled_date, priority, status, description, created_at)";

const EXAMPLES: &str = r#"Examples:

Q: 홍길동 고객 정보
{"sql": "SELECT * FROM customers WHERE name = %(name)s LIMIT 100", "parameters": {"name": "홍길동"}, "explanation": "exact-name customer lookup"}

Q: 최근 1개월 가입 고객 수
{"sql": "SELECT COUNT(*) AS signup_count FROM customers WHERE created_at >= %(start_date)s", "parameters": {"start_date": "2024-05-01"}, "explanation": "signup count over the last month"}

Q: customers in 서울 with their memos
{"sql": "SELECT c.name, m.refined_memo FROM customers c JOIN customer_memos m ON m.customer_id = c.customer_id WHERE c.address LIKE %(region)s LIMIT 100", "parameters": {"region": "%서울%"}, "explanation": "region-filtered customers joined with memos"}"#;

const DIRECTIVE: &str = "\
Respond with a single JSON object and nothing else:
{\"sql\": string, \"parameters\": object, \"explanation\": string, \"confidence\": number (optional)}
Rules:
- SELECT or WITH statements only, against the tables listed above.
- Bind every literal through a %(name)s placeholder with a matching key in \"parameters\". Never inline user values.
- Include LIMIT 100 or lower on row-returning queries.";

/// Render the full SQL-generation prompt for one request.
pub fn render_sql_prompt(query: &str, intent: &Intent) -> String {
    let entities = if intent.entities.is_empty() {
        "none".to_string()
    } else {
        intent
            .entities
            .iter()
            .map(|(kind, values)| format!("{}={}", kind.as_str(), values.join("|")))
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        "You translate natural-language questions about a customer CRM into safe SQL.\n\n\
         {schema}\n\n\
         {examples}\n\n\
         Query: {query}\n\
         Detected intent: {kind} (confidence {confidence:.2})\n\
         Detected entities: {entities}\n\n\
         {directive}",
        schema = SCHEMA_SUMMARY,
        examples = EXAMPLES,
        query = query,
        kind = intent.kind.as_str(),
        confidence = intent.confidence,
        entities = entities,
        directive = DIRECTIVE,
    )
}
