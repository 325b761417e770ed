//! Query intent classification.
//!
//! Pattern-based classification of natural-language queries (Korean first,
//! with English fallbacks) into one of four kinds, plus entity and keyword
//! extraction. Classification never fails: a query with no recognizable
//! signal is returned as `simple_query` with confidence 0.1.
//!
//! An optional morphological analyzer can be plugged in via
//! [`MorphAnalyzer`]; when absent, regex matching is the sole signal source.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use regex::Regex;

use crate::models::{EntityKind, Intent, IntentKind};

/// Part-of-speech classes the classifier cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pos {
    Noun,
    Verb,
    Josa,
    Modifier,
    Other,
}

/// One token from a morphological analysis pass.
#[derive(Debug, Clone)]
pub struct Morpheme {
    pub word: String,
    pub pos: Pos,
}

/// Hook for an external Korean morphological analyzer. The gateway ships
/// without one; deployments that bundle an analyzer register it here and the
/// classifier folds its tokens into the scoring.
pub trait MorphAnalyzer: Send + Sync {
    fn analyze(&self, query: &str) -> Vec<Morpheme>;
}

pub struct IntentClassifier {
    kind_patterns: Vec<(IntentKind, Vec<Regex>)>,
    entity_patterns: Vec<(EntityKind, Vec<Regex>)>,
    name_stopwords: BTreeSet<&'static str>,
    intent_words: Vec<&'static str>,
    morph: Option<Arc<dyn MorphAnalyzer>>,
}

impl IntentClassifier {
    pub fn new(morph: Option<Arc<dyn MorphAnalyzer>>) -> Self {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns
                .iter()
                .map(|p| Regex::new(p).expect("static pattern"))
                .collect()
        };

        let kind_patterns = vec![
            (
                IntentKind::SimpleQuery,
                compile(&[
                    r"목록", r"정보", r"보여", r"알려", r"이름", r"연락처", r"주소",
                    r"전화번호", r"\blist\b", r"\bshow\b", r"\bnamed\b",
                ]),
            ),
            (
                IntentKind::Filtering,
                compile(&[
                    r"조건", r"\d+세", r"\d+대", r"최근", r"지난", r"이상", r"이하",
                    r"포함", r"제외", r"해당", r"\brecent\b", r"\blast\b", r"\bsince\b",
                ]),
            ),
            (
                IntentKind::Aggregation,
                compile(&[
                    r"개수", r"총", r"평균", r"최대", r"최소", r"합계", r"통계", r"분석",
                    r"비율", r"퍼센트", r"\bcount\b", r"\baverage\b", r"\bavg\b",
                    r"\bsum\b", r"\btotal\b",
                ]),
            ),
            (
                IntentKind::Join,
                compile(&[
                    r"[가-힣]+[와과랑]\s", r"관련", r"연결", r"함께", r"매칭", r"연관",
                    r"\bwith their\b", r"\bjoined\b", r"\band their\b",
                ]),
            ),
        ];

        let entity_patterns = vec![
            (
                EntityKind::Date,
                compile(&[
                    r"\d{4}[-./]\d{1,2}[-./]\d{1,2}",
                    r"\d{1,2}월\s*\d{1,2}일",
                    r"최근\s*\d+\s*개?[일주월년]",
                    r"지난\s*\d+\s*개?[일주월년]",
                    r"오늘|어제|내일|이번주|지난주|이번달|지난달",
                    r"\blast (?:week|month|year)\b",
                ]),
            ),
            (
                EntityKind::ProductName,
                compile(&[
                    r"건강보험|자동차보험|생명보험|화재보험|여행자보험",
                    r"[가-힣]+보험",
                    r"[가-힣]+플랜",
                    r"\binsurance\b",
                ]),
            ),
            (
                EntityKind::Amount,
                compile(&[r"\d+[만억]\s*원?", r"\d+\s*원", r"\d+\s*[%퍼센트]"]),
            ),
            (
                EntityKind::Location,
                compile(&[
                    r"서울|부산|대구|인천|광주|대전|울산|세종",
                    r"강남|서초|마포|종로|영등포",
                    r"[가-힣]+[시도구군]\b",
                ]),
            ),
            (
                EntityKind::Keyword,
                compile(&[r"가입|해지|변경|조회|검색|찾기|확인|신청|취소|연장|갱신"]),
            ),
        ];

        // Common nouns the name pattern would otherwise swallow.
        let name_stopwords: BTreeSet<&'static str> = [
            "고객", "목록", "정보", "평균", "통계", "분석", "보험", "상품", "메모",
            "지역", "최근", "지난", "개수", "합계", "조회", "검색", "이름", "주소",
            "연락처", "조건", "비율", "내역", "현황", "오늘", "어제", "내일",
            "서울", "부산", "대구", "인천", "광주", "대전", "울산", "세종",
            "보여줘", "알려줘", "해줘", "찾아줘", "이상", "이하", "만원",
            "함께", "관련", "연결", "매칭", "연관", "포함", "제외", "해당",
        ]
        .into_iter()
        .collect();

        let intent_words = vec![
            "조회", "검색", "찾기", "보기", "확인", "가입", "해지", "변경", "신청",
            "취소", "연장", "분석", "통계", "비교", "합계", "평균",
        ];

        Self {
            kind_patterns,
            entity_patterns,
            name_stopwords,
            intent_words,
            morph,
        }
    }

    /// Classify a normalized query. Always succeeds.
    pub fn classify(&self, query: &str) -> Intent {
        let query = simplify_honorifics(query);

        let morphemes = self
            .morph
            .as_ref()
            .map(|m| m.analyze(&query))
            .unwrap_or_default();

        let (kind, confidence, match_counts) = self.classify_kind(&query, &morphemes);
        let entities = self.extract_entities(&query);
        let keywords = self.extract_keywords(&query, &morphemes);

        let entity_count: usize = entities.values().map(Vec::len).sum();
        let join_signals = match_counts[kind_index(IntentKind::Join)];
        let agg_signals = match_counts[kind_index(IntentKind::Aggregation)];
        let complexity = (0.1 * entity_count as f64
            + 0.2 * join_signals as f64
            + 0.15 * agg_signals as f64
            + 0.05 * query.chars().count() as f64 / 100.0)
            .min(1.0);

        let reasoning = if morphemes.is_empty() {
            format!(
                "pattern match: kind={} confidence={:.2} entities={}",
                kind.as_str(),
                confidence,
                entity_count
            )
        } else {
            format!(
                "pattern match + morphology ({} tokens): kind={} confidence={:.2}",
                morphemes.len(),
                kind.as_str(),
                confidence
            )
        };

        Intent {
            kind,
            entities,
            keywords,
            complexity: complexity.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            reasoning,
        }
    }

    /// Score each kind and pick the winner. Ranking uses raw (boosted) match
    /// counts so kinds with larger pattern tables are not penalized; the
    /// reported confidence is the winner's match ratio over its own table.
    fn classify_kind(&self, query: &str, morphemes: &[Morpheme]) -> (IntentKind, f64, [usize; 4]) {
        let mut counts = [0usize; 4];
        let mut scores = [0.0f64; 4];

        for (kind, patterns) in &self.kind_patterns {
            let idx = kind_index(*kind);
            let matched = patterns.iter().filter(|p| p.is_match(query)).count();
            counts[idx] = matched;
            scores[idx] = matched as f64;
        }

        // Morphology boosts: aggregation nouns, filtering modifiers, join josa.
        for m in morphemes {
            match m.pos {
                Pos::Noun if ["수", "개수", "총", "평균"].iter().any(|w| m.word.contains(w)) => {
                    scores[kind_index(IntentKind::Aggregation)] += 0.1;
                }
                Pos::Modifier if ["최근", "지난", "특정"].iter().any(|w| m.word.contains(w)) => {
                    scores[kind_index(IntentKind::Filtering)] += 0.1;
                }
                Pos::Josa if matches!(m.word.as_str(), "와" | "과" | "랑") => {
                    scores[kind_index(IntentKind::Join)] += 0.1;
                }
                _ => {}
            }
        }

        // Highest score wins; ties resolve by precedence:
        // aggregation > join > filtering > simple_query.
        let precedence = [
            IntentKind::Aggregation,
            IntentKind::Join,
            IntentKind::Filtering,
            IntentKind::SimpleQuery,
        ];
        let mut best = IntentKind::SimpleQuery;
        let mut best_score = f64::NEG_INFINITY;
        for kind in precedence {
            let s = scores[kind_index(kind)];
            if s > best_score {
                best = kind;
                best_score = s;
            }
        }

        let confidence = if best_score <= 0.0 {
            0.1
        } else {
            let table_len = self
                .kind_patterns
                .iter()
                .find(|(k, _)| *k == best)
                .map(|(_, p)| p.len())
                .unwrap_or(1);
            (best_score / table_len as f64).clamp(0.1, 1.0)
        };
        (best, confidence, counts)
    }

    fn extract_entities(&self, query: &str) -> BTreeMap<EntityKind, Vec<String>> {
        let mut entities = BTreeMap::new();

        for (kind, patterns) in &self.entity_patterns {
            let mut found: Vec<String> = Vec::new();
            for pattern in patterns {
                for m in pattern.find_iter(query) {
                    let text = m.as_str().trim();
                    if text.chars().count() < 2 {
                        continue;
                    }
                    if !found.iter().any(|f| f == text) {
                        found.push(text.to_string());
                    }
                }
            }
            if !found.is_empty() {
                entities.insert(*kind, found);
            }
        }

        let names = self.extract_customer_names(query, &entities);
        if !names.is_empty() {
            entities.insert(EntityKind::CustomerName, names);
        }

        entities
    }

    /// Customer names are whitespace-delimited Hangul tokens of 2–4
    /// syllables, optionally suffixed with 씨/님/분 or a trailing josa,
    /// minus stopwords and anything already claimed as a product or
    /// location.
    fn extract_customer_names(
        &self,
        query: &str,
        entities: &BTreeMap<EntityKind, Vec<String>>,
    ) -> Vec<String> {
        let name_token = name_token_pattern();
        let claimed: Vec<&String> = entities
            .get(&EntityKind::ProductName)
            .into_iter()
            .chain(entities.get(&EntityKind::Location))
            .chain(entities.get(&EntityKind::Keyword))
            .flatten()
            .collect();

        let mut names: Vec<String> = Vec::new();
        for token in query.split_whitespace() {
            let Some(caps) = name_token.captures(token) else {
                continue;
            };
            let stem = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            if stem.is_empty()
                || self.name_stopwords.contains(stem)
                || claimed.iter().any(|c| c.as_str() == stem || c.as_str() == token)
            {
                continue;
            }
            if !names.iter().any(|n| n == stem) {
                names.push(stem.to_string());
            }
        }
        names
    }

    fn extract_keywords(&self, query: &str, morphemes: &[Morpheme]) -> BTreeSet<String> {
        let mut keywords = BTreeSet::new();
        for word in &self.intent_words {
            if query.contains(word) {
                keywords.insert((*word).to_string());
            }
        }
        for m in morphemes {
            if matches!(m.pos, Pos::Noun | Pos::Verb)
                && m.word.chars().count() >= 2
                && self.intent_words.iter().any(|w| m.word.contains(w))
            {
                keywords.insert(m.word.clone());
            }
        }
        keywords
    }
}

fn name_token_pattern() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        // Lazy stem so a trailing particle is peeled off when present.
        Regex::new(r"^([가-힣]{2,4}?)(?:씨|님|분|와|과|랑|은|는|이|가|을|를|의)?$")
            .expect("static pattern")
    })
}

fn kind_index(kind: IntentKind) -> usize {
    match kind {
        IntentKind::SimpleQuery => 0,
        IntentKind::Filtering => 1,
        IntentKind::Aggregation => 2,
        IntentKind::Join => 3,
    }
}

/// Collapse Korean honorific request forms so the pattern tables only need
/// the short forms. Applied to classification input only — never to the
/// normalized query used for cache keys.
pub fn simplify_honorifics(query: &str) -> String {
    let mut out = query.to_string();
    for (long, short) in [
        ("알려주세요", "알려줘"),
        ("보여주세요", "보여줘"),
        ("해주시겠어요", "해줘"),
        ("해주세요", "해줘"),
        ("주세요", "줘"),
    ] {
        out = out.replace(long, short);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> IntentClassifier {
        IntentClassifier::new(None)
    }

    #[test]
    fn named_customer_is_simple_query() {
        let intent = classifier().classify("customers named 홍길동");
        assert_eq!(intent.kind, IntentKind::SimpleQuery);
        assert_eq!(
            intent.entities.get(&EntityKind::CustomerName),
            Some(&vec!["홍길동".to_string()])
        );
    }

    #[test]
    fn average_by_region_is_aggregation() {
        let intent = classifier().classify("average premium by region for 30대");
        assert_eq!(intent.kind, IntentKind::Aggregation);
        assert!(intent.confidence >= 0.05);
    }

    #[test]
    fn korean_aggregation_beats_filtering_on_tie() {
        // 평균 (aggregation) and 최근 (filtering) both match; precedence
        // resolves to aggregation when scores tie or aggregation leads.
        let intent = classifier().classify("최근 평균 평균 합계 통계");
        assert_eq!(intent.kind, IntentKind::Aggregation);
    }

    #[test]
    fn classification_never_fails() {
        let intent = classifier().classify("???");
        assert_eq!(intent.kind, IntentKind::SimpleQuery);
        assert!(intent.confidence <= 0.2);
    }

    #[test]
    fn extracts_dates_and_amounts() {
        let intent = classifier().classify("지난 3개월 100만원 이상 계약");
        assert!(intent.entities.contains_key(&EntityKind::Date));
        assert!(intent.entities.contains_key(&EntityKind::Amount));
    }

    #[test]
    fn name_stopwords_not_extracted_as_customers() {
        let intent = classifier().classify("고객 목록 보여줘");
        assert!(!intent
            .entities
            .get(&EntityKind::CustomerName)
            .map(|v| v.iter().any(|n| n == "고객" || n == "목록"))
            .unwrap_or(false));
    }

    #[test]
    fn complexity_clamped_to_unit_interval() {
        let long = "평균 합계 통계 와 관련 함께 ".repeat(40);
        let intent = classifier().classify(&long);
        assert!(intent.complexity <= 1.0);
        assert!(intent.complexity >= 0.0);
    }

    #[test]
    fn honorific_simplification() {
        assert_eq!(simplify_honorifics("고객 목록 보여주세요"), "고객 목록 보여줘");
    }

    #[test]
    fn empty_entity_lists_are_omitted() {
        let intent = classifier().classify("show list");
        for values in intent.entities.values() {
            assert!(!values.is_empty());
        }
    }
}
