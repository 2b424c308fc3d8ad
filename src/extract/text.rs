use std::{
    panic::{self, AssertUnwindSafe},
    path::Path,
    sync::LazyLock,
};

use regex::Regex;
use tracing::warn;

static HYPHEN_BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w)-[ \t]*\n[ \t]*(\w)").expect("valid hyphen regex"));
static TRAILING_SPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+\n").expect("valid trailing space regex"));
static SPACE_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("valid space run regex"));

/// Turns a stored file into plain text. Failures yield an empty string.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path, max_chars: usize) -> String;

    fn name(&self) -> &'static str;
}

/// Page-by-page reader backed by `pdf-extract`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfTextExtractor;

impl TextExtractor for PdfTextExtractor {
    fn extract(&self, path: &Path, max_chars: usize) -> String {
        // The parser panics on some malformed files.
        let pages = match panic::catch_unwind(AssertUnwindSafe(|| {
            pdf_extract::extract_text_by_pages(path)
        })) {
            Ok(Ok(pages)) => pages,
            Ok(Err(err)) => {
                warn!(?err, path = %path.display(), "failed to read PDF text");
                return String::new();
            }
            Err(_) => {
                warn!(path = %path.display(), "PDF parser panicked");
                return String::new();
            }
        };

        join_pages(pages.iter().map(String::as_str), max_chars)
    }

    fn name(&self) -> &'static str {
        "pdf-extract"
    }
}

/// Joins non-empty pages with blank lines, stopping once `max_chars` is reached.
pub fn join_pages<'a>(pages: impl IntoIterator<Item = &'a str>, max_chars: usize) -> String {
    let mut chunks: Vec<String> = Vec::new();
    let mut total = 0usize;

    for page in pages {
        if page.trim().is_empty() {
            continue;
        }
        let remaining = max_chars.saturating_sub(total);
        if remaining == 0 {
            break;
        }
        let chunk: String = page.chars().take(remaining).collect();
        total += chunk.chars().count();
        chunks.push(chunk);
        if total >= max_chars {
            break;
        }
    }

    chunks.join("\n\n")
}

/// Prefix of the document used by the first-pages identity strategy.
pub fn first_pages(text: &str, budget: usize) -> &str {
    match text.char_indices().nth(budget) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Repairs common PDF text artifacts before line-oriented parsing.
pub fn normalize_pdf_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let replaced = text
        .replace('\u{FB01}', "fi")
        .replace('\u{FB02}', "fl")
        .replace('\u{FB03}', "ffi")
        .replace('\u{FB04}', "ffl")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\u{00A0}', " ");

    let joined = HYPHEN_BREAK_RE.replace_all(&replaced, "$1$2");
    let trimmed = TRAILING_SPACE_RE.replace_all(&joined, "\n");
    SPACE_RUN_RE.replace_all(&trimmed, " ").into_owned()
}

/// Char-safe clamp of `idx` down to the nearest boundary.
pub(crate) fn floor_boundary(text: &str, idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    let mut idx = idx;
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn join_pages_skips_blank_pages_and_respects_budget() {
        let text = join_pages(["uno", "  ", "dos", "tres"], 7);
        assert_eq!(text, "uno\n\ndos\n\nt");
        assert_eq!(join_pages(Vec::<&str>::new(), 100), "");
    }

    #[test]
    fn missing_or_corrupt_files_yield_empty_text() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.pdf");
        assert_eq!(PdfTextExtractor.extract(&missing, 1_000), "");

        let corrupt = dir.path().join("corrupt.pdf");
        std::fs::write(&corrupt, b"not a pdf at all").unwrap();
        assert_eq!(PdfTextExtractor.extract(&corrupt, 1_000), "");
    }

    #[test]
    fn normalizes_ligatures_hyphenation_and_spacing() {
        let raw = "Plani\u{FB01}cación de   obras\r\nconstruc-\n  ción  \nfinal";
        assert_eq!(
            normalize_pdf_text(raw),
            "Planificación de obras\nconstrucción\nfinal"
        );
    }

    #[test]
    fn first_pages_is_char_safe() {
        assert_eq!(first_pages("añoño", 2), "añ");
        assert_eq!(first_pages("abc", 10), "abc");
        assert_eq!(floor_boundary("añ", 2), 1);
    }
}
