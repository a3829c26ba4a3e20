/// Tokenize a title: split on whitespace and lowercase each word.
///
/// Punctuation stays attached to its word and there is no stemming or
/// stopword removal, so `"Matrix:"` and `"matrix"` are distinct tokens.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace().map(str::to_lowercase)
}
