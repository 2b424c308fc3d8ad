//! Subject identity (name + code) resolution from local evidence.
//!
//! Strategies run in a fixed order and each one is a pure function over the
//! file name and text. A candidate is only accepted once its code is seen in
//! the document text; the file name is the last resort when nothing else is.

use std::{path::Path, sync::LazyLock};

use regex::Regex;
use serde::Serialize;

use super::{
    catalog,
    resolve::{normalize_code, sanitize_subject_name},
};

static FILE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>.+?)\s*\((?P<code>[A-Za-z0-9-]{3,})\)$").expect("valid file name regex")
});
static FILE_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\((?P<code>[A-Za-z0-9-]{3,})\)$").expect("valid file code regex")
});
static NAME_CODE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*(?P<name>[^\n\r]{3,120}?)[ \t]*\([ \t]*(?P<code>[A-Za-z]{2,6}[0-9]{2,4}|[A-Za-z0-9][A-Za-z0-9-]{2,})[ \t]*\)[ \t]*$",
    )
    .expect("valid name/code line regex")
});

const MIN_LINE_NAME_CHARS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    FileName,
    FirstPages,
    FullText,
    LineBeforeCode,
    /// Name and code proposed by the model on the full path.
    Model,
}

impl IdentityStrategy {
    pub const ORDER: [IdentityStrategy; 4] = [
        IdentityStrategy::FileName,
        IdentityStrategy::FirstPages,
        IdentityStrategy::FullText,
        IdentityStrategy::LineBeforeCode,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IdentityStrategy::FileName => "file_name",
            IdentityStrategy::FirstPages => "first_pages",
            IdentityStrategy::FullText => "full_text",
            IdentityStrategy::LineBeforeCode => "line_before_code",
            IdentityStrategy::Model => "model",
        }
    }

    fn propose(self, input: &IdentityInput<'_>) -> Option<Candidate> {
        let (name, code) = match self {
            IdentityStrategy::FileName => from_file_name(input.file_name)?,
            IdentityStrategy::FirstPages => from_first_pages(input.first_pages)?,
            IdentityStrategy::FullText => from_pool(input.full_text)?,
            IdentityStrategy::LineBeforeCode => from_line_before_code(input.first_pages)?,
            IdentityStrategy::Model => return None,
        };
        Some(Candidate {
            name,
            code,
            strategy: self,
        })
    }
}

/// Evidence available for one document.
#[derive(Debug, Clone, Copy)]
pub struct IdentityInput<'a> {
    pub file_name: &'a str,
    pub first_pages: &'a str,
    pub full_text: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub code: String,
    pub strategy: IdentityStrategy,
}

/// How the final code was arrived at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodeTrace {
    pub candidate_code: Option<String>,
    pub near_name_code: Option<String>,
    pub global_code: Option<String>,
    pub filename_code: Option<String>,
    pub chosen_code: Option<String>,
    pub appeared_in_text: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedIdentity {
    pub name: String,
    pub code: String,
    pub strategy: IdentityStrategy,
    /// Whether the chosen code occurs in the document text.
    pub validated: bool,
    pub code_trace: CodeTrace,
}

#[derive(Debug, Clone, Copy)]
pub struct SubjectIdentifier {
    pub uppercase_codes: bool,
    pub titlecase_names: bool,
}

impl SubjectIdentifier {
    pub fn new(uppercase_codes: bool, titlecase_names: bool) -> Self {
        Self {
            uppercase_codes,
            titlecase_names,
        }
    }

    /// First candidate whose code is confirmed by the text, else the file name
    /// candidate unconfirmed, else nothing.
    pub fn resolve(&self, input: &IdentityInput<'_>) -> Option<ResolvedIdentity> {
        let mut fallback = None;

        for strategy in IdentityStrategy::ORDER {
            let Some(candidate) = strategy.propose(input) else {
                continue;
            };
            let Some(resolved) = self.settle(candidate, input) else {
                continue;
            };
            if resolved.validated {
                return Some(resolved);
            }
            if strategy == IdentityStrategy::FileName {
                fallback = Some(resolved);
            }
        }

        fallback
    }

    /// Checks a model-proposed identity against the same local evidence.
    pub fn confirm_model_candidate(
        &self,
        name: &str,
        code: &str,
        input: &IdentityInput<'_>,
    ) -> Option<ResolvedIdentity> {
        let candidate = Candidate {
            name: name.to_string(),
            code: code.to_string(),
            strategy: IdentityStrategy::Model,
        };
        self.settle(candidate, input).filter(|resolved| resolved.validated)
    }

    /// Code stated by the document for an already-known subject: near its
    /// name, then anywhere, then from the file name.
    pub fn code_for_subject(&self, subject_name: &str, input: &IdentityInput<'_>) -> Option<String> {
        let text = evidence_text(input);
        catalog::extract_code_near_name(text, subject_name)
            .or_else(|| catalog::extract_code(text))
            .or_else(|| filename_code(input.file_name))
            .and_then(|code| normalize_code(&code, self.uppercase_codes))
    }

    fn settle(&self, candidate: Candidate, input: &IdentityInput<'_>) -> Option<ResolvedIdentity> {
        let name = sanitize_subject_name(&candidate.name, self.titlecase_names)?;
        let code = normalize_code(&candidate.code, self.uppercase_codes)?;
        let text = evidence_text(input);

        let mut trace = CodeTrace {
            candidate_code: Some(code.clone()),
            appeared_in_text: catalog::code_in_text(&code, text),
            ..CodeTrace::default()
        };

        if trace.appeared_in_text {
            trace.chosen_code = Some(code.clone());
            return Some(ResolvedIdentity {
                name,
                code,
                strategy: candidate.strategy,
                validated: true,
                code_trace: trace,
            });
        }

        trace.near_name_code = catalog::extract_code_near_name(text, &name);
        if trace.near_name_code.is_none() {
            trace.global_code = catalog::extract_code(text);
        }
        if trace.near_name_code.is_none() && trace.global_code.is_none() {
            trace.filename_code = filename_code(input.file_name);
        }

        let replacement = trace
            .near_name_code
            .clone()
            .or_else(|| trace.global_code.clone())
            .or_else(|| trace.filename_code.clone())
            .filter(|code| catalog::code_in_text(code, text))
            .and_then(|code| normalize_code(&code, self.uppercase_codes));

        match replacement {
            Some(code) => {
                trace.chosen_code = Some(code.clone());
                trace.appeared_in_text = true;
                Some(ResolvedIdentity {
                    name,
                    code,
                    strategy: candidate.strategy,
                    validated: true,
                    code_trace: trace,
                })
            }
            None => {
                trace.chosen_code = Some(code.clone());
                Some(ResolvedIdentity {
                    name,
                    code,
                    strategy: candidate.strategy,
                    validated: false,
                    code_trace: trace,
                })
            }
        }
    }
}

fn evidence_text<'a>(input: &IdentityInput<'a>) -> &'a str {
    if input.full_text.trim().is_empty() {
        input.first_pages
    } else {
        input.full_text
    }
}

fn file_stem(file_name: &str) -> String {
    let normalized = file_name.replace('\\', "/");
    Path::new(&normalized)
        .file_stem()
        .map(|stem| stem.to_string_lossy().trim().to_string())
        .unwrap_or_default()
}

/// Code in a trailing `(CODE)` of the file stem.
pub fn filename_code(file_name: &str) -> Option<String> {
    let stem = file_stem(file_name);
    FILE_CODE_RE
        .captures(&stem)
        .map(|caps| caps["code"].to_string())
}

fn from_file_name(file_name: &str) -> Option<(String, String)> {
    let stem = file_stem(file_name);
    if stem.is_empty() {
        return None;
    }
    let pool_name = catalog::match_pool_name(&stem);

    if let Some(caps) = FILE_NAME_RE.captures(&stem) {
        let name = pool_name
            .map(str::to_string)
            .unwrap_or_else(|| caps["name"].trim().to_string());
        return Some((name, caps["code"].trim().to_string()));
    }

    let pool_name = pool_name?;
    let code = catalog::extract_code_near_name(&stem, pool_name)
        .or_else(|| catalog::extract_code(&stem))?;
    Some((pool_name.to_string(), code))
}

fn from_first_pages(text: &str) -> Option<(String, String)> {
    if let Some(caps) = NAME_CODE_LINE_RE.captures(text) {
        let name = caps["name"].trim();
        let code = caps["code"].trim();
        if !name.is_empty() && !code.is_empty() {
            return Some((name.to_string(), code.to_string()));
        }
    }
    from_pool(text)
}

fn from_pool(text: &str) -> Option<(String, String)> {
    let name = catalog::match_pool_name(text)?;
    let code =
        catalog::extract_code_near_name(text, name).or_else(|| catalog::extract_code(text))?;
    Some((name.to_string(), code))
}

fn from_line_before_code(text: &str) -> Option<(String, String)> {
    let code = catalog::find_code(text)?;
    let name = text[..code.start()]
        .trim_end()
        .lines()
        .last()?
        .trim()
        .trim_matches(':')
        .trim();
    if name.chars().count() < MIN_LINE_NAME_CHARS {
        return None;
    }
    Some((name.to_string(), code.as_str().to_string()))
}
