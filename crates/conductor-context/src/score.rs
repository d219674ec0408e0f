//! BM25-inspired relevance scoring for workspace files and priority
//! normalization for retrieval and graph hits.

const K1: f64 = 1.5;
const B: f64 = 0.75;
const AVG_DOC_LEN: f64 = 200.0;

/// Rough token estimate used for budget arithmetic across the pack.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() / 4).max(1) as u32
}

/// Score each document against the keyword set and normalize the results to
/// 0..=100. Term frequency saturates with document length the usual BM25 way;
/// inverse document frequency is computed over the candidate set itself.
pub fn score_documents(docs: &[&str], keywords: &[String]) -> Vec<u8> {
    if docs.is_empty() {
        return Vec::new();
    }
    if keywords.is_empty() {
        return vec![0; docs.len()];
    }

    let lowered: Vec<String> = docs.iter().map(|d| d.to_lowercase()).collect();
    let doc_count = lowered.len() as f64;

    let mut raw = Vec::with_capacity(lowered.len());
    for doc in &lowered {
        let words: Vec<&str> = doc
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .collect();
        let doc_len = words.len() as f64;
        let mut score = 0.0;
        for keyword in keywords {
            let tf = words.iter().filter(|w| *w == keyword).count() as f64;
            if tf == 0.0 {
                continue;
            }
            let containing = lowered.iter().filter(|d| d.contains(keyword.as_str())).count() as f64;
            let idf = ((doc_count - containing + 0.5) / (containing + 0.5) + 1.0).ln();
            let norm = tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * doc_len / AVG_DOC_LEN));
            score += idf * norm;
        }
        raw.push(score);
    }

    let max = raw.iter().cloned().fold(0.0_f64, f64::max);
    if max <= 0.0 {
        return vec![0; docs.len()];
    }
    raw.iter()
        .map(|score| ((score / max) * 100.0).round() as u8)
        .collect()
}

/// Min-max normalize retrieval scores into the 60..=85 priority band. A
/// single hit (or a flat set) lands on the midpoint.
pub fn retrieval_priorities(scores: &[f64]) -> Vec<u8> {
    const LO: f64 = 60.0;
    const HI: f64 = 85.0;
    if scores.is_empty() {
        return Vec::new();
    }
    let min = scores.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if scores.len() == 1 || (max - min).abs() < f64::EPSILON {
        let mid = ((LO + HI) / 2.0).round() as u8;
        return vec![mid; scores.len()];
    }
    scores
        .iter()
        .map(|score| (LO + (score - min) / (max - min) * (HI - LO)).round() as u8)
        .collect()
}

/// Graph hits decay with hop distance, floored at 10.
pub fn graph_priority(hops: u32) -> u8 {
    70_i64.saturating_sub(10 * i64::from(hops)).max(10) as u8
}
