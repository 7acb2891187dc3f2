/// Prompt splitting on configurable separators.
///
/// Input text is cut into prompt units on the prompt separator, and rank
/// prompts are cut once more into a (query, document) pair.
use crate::embedder::EmbedError;

/// Splits `source` on every non-overlapping occurrence of `sep`.
///
/// The trailing segment is always kept, so the result is never empty and
/// `split(t, s).join(s) == t`.
pub fn split<'a>(source: &'a str, sep: &str) -> Result<Vec<&'a str>, EmbedError> {
    if sep.is_empty() {
        return Err(EmbedError::EmptySeparator);
    }
    Ok(source.split(sep).collect())
}

/// Splits a rank prompt into `(query, document)`.
///
/// Returns `Ok(None)` when the prompt does not contain `sep`, and
/// [`EmbedError::MalformedPair`] when it contains more than one separator.
pub fn split_pair<'a>(
    prompt: &'a str,
    sep: &str,
) -> Result<Option<(&'a str, &'a str)>, EmbedError> {
    if sep.is_empty() {
        return Err(EmbedError::EmptySeparator);
    }
    if !prompt.contains(sep) {
        return Ok(None);
    }

    let parts = split(prompt, sep)?;
    match parts.as_slice() {
        [query, document] => Ok(Some((query, document))),
        _ => Err(EmbedError::MalformedPair { parts: parts.len() }),
    }
}

/// Replaces every occurrence of `find` in `source`. An empty `find` leaves
/// the text untouched.
pub fn replace_all(source: &str, find: &str, replace: &str) -> String {
    if find.is_empty() {
        return source.to_string();
    }
    source.replace(find, replace)
}
