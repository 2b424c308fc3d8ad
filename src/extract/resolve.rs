use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::catalog::{self, collapse_whitespace};

const NAME_PREFIXES: [&str; 2] = [
    "Asignaturas",
    "Administrador de Asignaturas y Programas de Estudio",
];
const MIN_TEXT_HOURS: i32 = 4;
const MAX_TEXT_HOURS: i32 = 500;
const EXPECTED_LEARNING_MAX_CHARS: usize = 240;
const EXPECTED_LEARNING_MIN_SENTENCE: usize = 40;
const EXPECTED_LEARNING_STOPS: [&str; 10] = [
    "APRENDIZAJES ESPERADOS",
    "CRITERIOS DE EVALU",
    "CONTENIDOS MÍNIMOS",
    "CONTENIDOS MINIMOS",
    "ACTIVIDADES MÍNIMAS",
    "ACTIVIDADES MINIMAS",
    "ESTRATEGIAS",
    "SISTEMA DE EVALU",
    "KEYBOARD_ARROW_DOWN",
    "UA ",
];

// Contextual patterns, most specific first.
static HOURS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"horas\s*totales\s*(?:del|de la)?\s*(?:curso|asignatura)?\s*[:\-]?\s*(?P<n>\d{1,3})",
        r"total\s*de\s*horas\s*[:\-]?\s*(?P<n>\d{1,3})",
        r"horas\s*de\s*la\s*asignatura\s*[:\-]?\s*(?P<n>\d{1,3})",
        r"duraci[oó]n\s*[:\-]?\s*(?P<n>\d{1,3})\s*(?:horas|hrs\.?|h\.)",
        r"(?P<n>\d{1,3})\s*(?:horas|hrs\.?|h\.)(?:\s*(?:cronol[oó]gicas|pedag[oó]gicas))?",
        r"horas\s*(?:cronol[oó]gicas|pedag[oó]gicas)\s*[:\-]?\s*(?P<n>\d{1,3})",
        r"hrs\.?\s*[:\-]?\s*(?P<n>\d{1,3})",
    ]
    .iter()
    .map(|pattern| Regex::new(&format!("(?i){pattern}")).expect("valid hours regex"))
    .collect()
});
static CRITERION_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+\.\d+\.\d+\b").expect("valid criterion regex"));

/// Keeps `[A-Za-z0-9_-]` and applies the configured case.
pub fn normalize_code(raw: &str, uppercase: bool) -> Option<String> {
    let code: String = raw
        .trim()
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '-' || *ch == '_')
        .collect();
    if code.is_empty() {
        return None;
    }
    Some(if uppercase {
        code.to_ascii_uppercase()
    } else {
        code.to_ascii_lowercase()
    })
}

/// Capitalizes the first letter of every run of letters.
pub fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_word = false;
    for ch in text.chars() {
        if ch.is_alphabetic() {
            if in_word {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(ch);
            in_word = false;
        }
    }
    out
}

/// Cleans a candidate subject name: breadcrumbs, portal headers, casing.
pub fn sanitize_subject_name(raw: &str, titlecase: bool) -> Option<String> {
    let mut name = collapse_whitespace(raw);
    if titlecase {
        name = title_case(&name);
    }

    if name.contains('>') {
        if let Some(last) = name
            .split('>')
            .map(str::trim)
            .rev()
            .find(|part| !part.is_empty())
        {
            name = last.to_string();
        }
    }

    for prefix in NAME_PREFIXES {
        let lowered = name.to_lowercase();
        let wanted = format!("{} ", prefix.to_lowercase());
        if lowered.starts_with(&wanted) {
            name = name
                .chars()
                .skip(prefix.chars().count())
                .collect::<String>()
                .trim()
                .to_string();
        }
    }

    (!name.is_empty()).then_some(name)
}

/// Total subject hours stated in the text, if any.
pub fn parse_hours_from_text(text: &str) -> Option<i32> {
    let haystack = collapse_whitespace(text).to_lowercase();
    if haystack.is_empty() {
        return None;
    }

    for pattern in HOURS_PATTERNS.iter() {
        let best = pattern
            .captures_iter(&haystack)
            .filter_map(|caps| caps.name("n")?.as_str().parse::<i32>().ok())
            .filter(|value| (MIN_TEXT_HOURS..=MAX_TEXT_HOURS).contains(value))
            .max();
        if best.is_some() {
            return best;
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HoursSource {
    Model,
    UnitsSum,
    Text,
    Default,
}

/// Diagnostic record of how subject hours were chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HoursTrace {
    pub ia_hours: Option<i64>,
    pub units_sum: Option<i64>,
    pub parsed_from_text: Option<i32>,
    pub chosen: i32,
    pub source: HoursSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disagreement: Option<String>,
}

/// Picks subject hours: model, then unit sum, then text, then the default.
/// Zero or negative values count as absent.
pub fn choose_hours(
    model_hours: Option<i64>,
    unit_hours: &[Option<i32>],
    text: &str,
    default_hours: i32,
) -> HoursTrace {
    let declared: Vec<i64> = unit_hours.iter().flatten().map(|h| *h as i64).collect();
    let units_sum = (!declared.is_empty()).then(|| declared.iter().sum::<i64>());
    let parsed = parse_hours_from_text(text);

    let positive = |value: Option<i64>| value.filter(|v| *v > 0).map(|v| v.min(i32::MAX as i64) as i32);

    let (chosen, source) = if let Some(hours) = positive(model_hours) {
        (hours, HoursSource::Model)
    } else if let Some(hours) = positive(units_sum) {
        (hours, HoursSource::UnitsSum)
    } else if let Some(hours) = parsed.filter(|v| *v > 0) {
        (hours, HoursSource::Text)
    } else {
        (default_hours, HoursSource::Default)
    };

    let disagreement = match (positive(model_hours), positive(units_sum)) {
        (Some(model), Some(sum)) if model != sum => {
            Some(format!("model declared {model} hours, units add up to {sum}"))
        }
        _ => None,
    };

    HoursTrace {
        ia_hours: model_hours,
        units_sum,
        parsed_from_text: parsed,
        chosen,
        source,
        disagreement,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaSource {
    NameTable,
    CodePrefix,
    Model,
    Default,
}

/// Area by name table, then code prefix, then the model's label, then default.
pub fn resolve_area(
    name: Option<&str>,
    code: Option<&str>,
    model_area: Option<&str>,
    default_area: &str,
) -> (String, AreaSource) {
    if let Some(area) = name.and_then(catalog::pool_area) {
        return (area.to_string(), AreaSource::NameTable);
    }
    if let Some(area) = code.and_then(catalog::area_by_code) {
        return (area.to_string(), AreaSource::CodePrefix);
    }
    if let Some(raw) = model_area.filter(|raw| !raw.trim().is_empty()) {
        let mapped = catalog::map_area_name(raw, default_area);
        if catalog::is_known_area(&mapped) {
            return (mapped, AreaSource::Model);
        }
    }
    let fallback = if catalog::is_known_area(default_area) {
        default_area.to_string()
    } else {
        catalog::AREA_ENUM[0].to_string()
    };
    (fallback, AreaSource::Default)
}

/// Trims headings and criterion codes glued onto an expected-learning text.
pub fn sanitize_expected_learning(raw: &str) -> Option<String> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    let upper = text.to_uppercase();
    let mut cut_chars = text.chars().count();
    if upper.chars().count() == cut_chars {
        for stop in EXPECTED_LEARNING_STOPS {
            if let Some(byte_idx) = upper.find(stop) {
                cut_chars = cut_chars.min(upper[..byte_idx].chars().count());
            }
        }
    }
    if let Some(m) = CRITERION_CODE_RE.find(text) {
        cut_chars = cut_chars.min(text[..m.start()].chars().count());
    }

    let chars: Vec<char> = text.chars().take(cut_chars).collect();
    let trimmed: String = chars.iter().collect::<String>().trim().to_string();

    let trimmed_chars: Vec<char> = trimmed.chars().collect();
    let result = if trimmed_chars.len() > EXPECTED_LEARNING_MAX_CHARS {
        match trimmed_chars.iter().position(|ch| *ch == '.') {
            Some(dot) if (EXPECTED_LEARNING_MIN_SENTENCE..=EXPECTED_LEARNING_MAX_CHARS).contains(&dot) => {
                trimmed_chars[..=dot].iter().collect::<String>().trim().to_string()
            }
            _ => {
                let head: String = trimmed_chars[..EXPECTED_LEARNING_MAX_CHARS].iter().collect();
                format!("{}…", head.trim_end())
            }
        }
    } else {
        trimmed
    };

    (!result.is_empty()).then_some(result)
}
