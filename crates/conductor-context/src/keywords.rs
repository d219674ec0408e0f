/// Keyword extraction over task prompts: lowercase, split on
/// non-alphanumerics, drop stopwords and short tokens, dedupe preserving
/// first-seen order.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "do", "for", "from", "has",
    "have", "how", "in", "into", "is", "it", "its", "of", "on", "or", "should", "so", "that",
    "the", "their", "then", "there", "these", "this", "to", "use", "we", "what", "when", "where",
    "which", "will", "with", "you", "your", "add", "make", "please", "using",
];

pub fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric() && c != '_') {
        let token = raw.trim_matches('_').to_lowercase();
        if token.len() < 3 || STOPWORDS.contains(&token.as_str()) {
            continue;
        }
        if seen.insert(token.clone()) {
            out.push(token);
        }
        if out.len() >= limit {
            break;
        }
    }
    out
}
