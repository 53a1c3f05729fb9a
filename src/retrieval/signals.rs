//! Individual relevance signals: tokens, keyword overlap, business-pattern
//! markers, and cosine similarity.

use std::collections::BTreeSet;

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be",
    "been", "before", "being", "below", "between", "both", "but", "by", "can", "could", "did",
    "do", "does", "each", "for", "from", "had", "has", "have", "he", "her", "his", "how", "if",
    "in", "into", "is", "it", "its", "may", "more", "most", "must", "no", "not", "of", "on",
    "only", "or", "other", "our", "out", "over", "per", "same", "shall", "she", "should", "so",
    "such", "than", "that", "the", "their", "them", "then", "there", "these", "they", "this",
    "those", "through", "to", "under", "until", "up", "upon", "very", "was", "we", "were",
    "what", "when", "where", "which", "while", "who", "will", "with", "within", "would", "you",
    "your",
];

/// Business-pattern markers. A marker matches when any of its terms appears
/// as whole words, optionally pluralised with a trailing `s` ("dealers"
/// matches "dealer", "capacity" does not match "cap").
const MARKERS: &[(&str, &[&str])] = &[
    ("kpi:revenue", &["revenue", "arpu", "spend"]),
    ("kpi:airtime", &["airtime", "recharge", "top up", "topup", "reload"]),
    ("kpi:data", &["data bundle", "data usage", "data revenue", "mb", "gb"]),
    ("kpi:activation", &["activation", "gross add", "gross adds", "new subscriber", "sim sale"]),
    ("kpi:device", &["device", "handset", "smartphone", "router"]),
    ("kpi:mobile_money", &["mobile money", "momo", "wallet", "cash in", "cash out"]),
    ("kpi:voice", &["voice", "minutes", "mou"]),
    ("kpi:sms", &["sms"]),
    ("kpi:churn", &["churn", "retention", "win back", "winback"]),
    ("channel:dealer", &["dealer", "distributor", "master dealer"]),
    ("channel:retailer", &["retailer", "outlet", "shop", "kiosk"]),
    ("channel:agent", &["agent", "freelancer", "ambassador"]),
    ("channel:franchise", &["franchise"]),
    ("channel:direct_sales", &["direct sales", "dsa", "salesforce", "sales force"]),
    ("rule:slab", &["slab", "tier", "band"]),
    ("rule:target", &["target", "achievement", "quota"]),
    ("rule:bonus", &["bonus", "incentive", "kicker"]),
    ("rule:cap", &["cap", "capped", "maximum payout", "ceiling"]),
];

/// Lowercased alphanumeric words of at least two characters.
pub fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|s| s.chars().count() >= 2)
        .map(|s| s.to_lowercase())
        .collect()
}

/// Distinct words with stop words removed.
pub fn keywords(text: &str) -> BTreeSet<String> {
    words(text)
        .into_iter()
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Share of the query's keywords that also occur in the candidate. Zero when
/// the query has no keywords.
pub fn keyword_score(query: &BTreeSet<String>, candidate: &BTreeSet<String>) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    let shared = query.intersection(candidate).count();
    shared as f64 / query.len() as f64
}

/// Names of the business-pattern markers present in `text`.
pub fn detect_markers(text: &str) -> BTreeSet<String> {
    let padded = format!(" {} ", words(text).join(" "));
    MARKERS
        .iter()
        .filter(|(_, terms)| {
            terms.iter().any(|term| {
                padded.contains(&format!(" {term} ")) || padded.contains(&format!(" {term}s "))
            })
        })
        .map(|(name, _)| (*name).to_string())
        .collect()
}

/// True when `tag` names a known marker.
pub fn is_marker(tag: &str) -> bool {
    MARKERS.iter().any(|(name, _)| *name == tag)
}

/// Share of the query's markers that the candidate shares. Zero when the query
/// carries no markers.
pub fn pattern_score(query: &BTreeSet<String>, candidate: &BTreeSet<String>) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    let shared = query.intersection(candidate).count();
    shared as f64 / query.len() as f64
}

/// Cosine similarity clamped to `[0, 1]`; zero-norm inputs score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_drop_stop_words_and_case() {
        let kw = keywords("The Dealer commission FOR the month of June");
        let expected: BTreeSet<String> = ["dealer", "commission", "month", "june"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(kw, expected);
    }

    #[test]
    fn keyword_score_is_query_coverage() {
        let q = keywords("airtime dealer commission june");
        let e = keywords("Dealer airtime payout for May");
        assert!((keyword_score(&q, &e) - 0.5).abs() < 1e-12);
        assert_eq!(keyword_score(&BTreeSet::new(), &e), 0.0);
    }

    #[test]
    fn markers_match_whole_words_only() {
        let markers = detect_markers("Capture bandwidth capacity in Mbps; mount the shopfront");
        assert!(markers.is_empty(), "{markers:?}");

        let markers = detect_markers("Payout capped at 5 GB, caps per band; shops and top-up");
        assert!(markers.contains("rule:cap"));
        assert!(markers.contains("rule:slab"));
        assert!(markers.contains("kpi:data"));
        assert!(markers.contains("channel:retailer"));
        assert!(markers.contains("kpi:airtime"));
    }

    #[test]
    fn markers_match_plurals_and_phrases() {
        let markers = detect_markers("Pay dealers a bonus on Mobile Money cash in volume");
        assert!(markers.contains("channel:dealer"));
        assert!(markers.contains("rule:bonus"));
        assert!(markers.contains("kpi:mobile_money"));
        assert!(!markers.contains("kpi:airtime"));
    }

    #[test]
    fn pattern_score_partial_overlap() {
        let q = detect_markers("airtime target for retailers");
        let e = detect_markers("airtime slab for dealers");
        // q = {airtime, target, retailer}; shared = {airtime}
        assert_eq!(q.len(), 3);
        assert!((pattern_score(&q, &e) - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(pattern_score(&BTreeSet::new(), &e), 0.0);
    }

    #[test]
    fn cosine_handles_zero_and_opposite_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-9);
    }
}
