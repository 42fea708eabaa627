//! Static English stopword list
//!
//! Trimmed-down list of common function words. Negations, intensifiers,
//! and quantifiers that often carry signal in survey text (not, no, but,
//! however, very, too, more, less, only, just, also, well, much, many,
//! most, all) are deliberately absent.

/// Sorted for binary search
const STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "am", "an", "and", "any", "are", "aren",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "by",
    "can", "couldn", "did", "didn", "do", "does", "doesn", "doing", "don", "down", "during",
    "each", "few", "for", "from", "further", "had", "hadn", "has", "hasn", "have", "haven",
    "having", "he", "her", "here", "hers", "herself", "him", "himself", "his", "how", "i", "if",
    "in", "into", "is", "isn", "it", "its", "itself", "me", "mightn", "mustn", "my", "myself",
    "needn", "nor", "now", "of", "off", "on", "once", "or", "other", "our", "ours", "ourselves",
    "out", "over", "own", "re", "s", "same", "shan", "she", "should", "shouldn", "so", "some",
    "such", "t", "than", "that", "the", "their", "theirs", "them", "themselves", "then", "there",
    "these", "they", "this", "those", "through", "to", "under", "until", "up", "was", "wasn",
    "we", "were", "weren", "what", "when", "where", "which", "while", "who", "whom", "why",
    "will", "with", "won", "wouldn", "you", "your", "yours", "yourself", "yourselves",
];

/// Whether a lowercased token is a stopword
pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.binary_search(&token).is_ok()
}
