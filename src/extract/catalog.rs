//! Static reference data: the area enum, the known subject-name pool and the
//! code patterns, plus the matching helpers built on them.

use std::sync::LazyLock;

use regex::{Match, Regex};
use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};

pub const AREA_ENUM: [&str; 13] = [
    "Administracion",
    "Agroindustria Y Medioambiente",
    "Automatizacion, Electronica Y Robotica",
    "Construccion",
    "Diseno E Industria Digital",
    "Energia",
    "Gastronomia",
    "Informatica, Ciberseguridad Y Telecomunicaciones",
    "Logistica",
    "Mecanica",
    "Mineria",
    "Salud",
    "Turismo Y Hospitalidad",
];

const INFORMATICA: &str = "Informatica, Ciberseguridad Y Telecomunicaciones";
const CONSTRUCCION: &str = "Construccion";
const ADMINISTRACION: &str = "Administracion";
const GASTRONOMIA: &str = "Gastronomia";
const TURISMO: &str = "Turismo Y Hospitalidad";
const SALUD: &str = "Salud";
const DISENO: &str = "Diseno E Industria Digital";

/// Known subject names, each with the area it belongs to.
pub const SUBJECT_NAME_POOL: [(&str, &str); 48] = [
    ("Proyecto Integrador TI", INFORMATICA),
    ("Taller de Portafolio", INFORMATICA),
    ("Taller de Titulo", INFORMATICA),
    ("Desarrollo de Aplicaciones Moviles", INFORMATICA),
    ("Desarrollo Backend", INFORMATICA),
    ("Desarrollo Frontend", INFORMATICA),
    ("Ingenieria de Software", INFORMATICA),
    ("Integracion Continua y Entrega Continua", INFORMATICA),
    ("Arquitectura de Software", INFORMATICA),
    ("DevOps", INFORMATICA),
    ("Cloud Computing", INFORMATICA),
    ("Ciberseguridad Aplicada", INFORMATICA),
    ("Gestion de Proyectos TI", INFORMATICA),
    ("UX/UI Aplicado", INFORMATICA),
    ("Proyecto de Construccion", CONSTRUCCION),
    ("Gestion de Obras", CONSTRUCCION),
    ("Control de Calidad en Obras", CONSTRUCCION),
    ("Planificacion y Control de Obras", CONSTRUCCION),
    ("Evaluacion de Proyectos de Construccion", CONSTRUCCION),
    ("BIM Aplicado", CONSTRUCCION),
    ("Topografia Aplicada", CONSTRUCCION),
    ("Energias Renovables Aplicadas", "Energia"),
    ("Automatizacion y PLC", "Automatizacion, Electronica Y Robotica"),
    ("Proyecto Integrador de Negocios", ADMINISTRACION),
    ("Plan de Negocios", ADMINISTRACION),
    ("Emprendimiento e Innovacion", ADMINISTRACION),
    ("Evaluacion de Proyectos", ADMINISTRACION),
    ("Control de Gestion Aplicado", ADMINISTRACION),
    ("Marketing Digital Aplicado", ADMINISTRACION),
    ("Direccion de Proyectos", ADMINISTRACION),
    ("Gestion de Personas Aplicada", ADMINISTRACION),
    ("Customer Experience", ADMINISTRACION),
    ("Proyecto Gastronomico", GASTRONOMIA),
    ("Gestion de Restaurantes", GASTRONOMIA),
    ("Planificacion de Produccion Gastronomica", GASTRONOMIA),
    ("Banqueteria y Catering", GASTRONOMIA),
    ("Gestion de Operaciones Hoteleras", TURISMO),
    ("Gestion de Eventos", TURISMO),
    ("Turismo Sustentable", TURISMO),
    ("Taller de Integracion Profesional", SALUD),
    ("Educacion para la Salud", SALUD),
    ("Atencion Primaria de Salud", SALUD),
    ("Practica Profesional", SALUD),
    ("Proyecto de Diseno", DISENO),
    ("Produccion Audiovisual", DISENO),
    ("Produccion Musical", DISENO),
    ("Postproduccion", DISENO),
    ("Diseno UX Aplicado", DISENO),
];

/// Keyword synonyms checked in order against a folded area label.
const AREA_KEYWORDS: [(&str, &str); 17] = [
    ("informatica", INFORMATICA),
    ("ciberseguridad", INFORMATICA),
    ("telecom", INFORMATICA),
    ("admin", ADMINISTRACION),
    ("finanza", ADMINISTRACION),
    ("contab", ADMINISTRACION),
    ("logistica", "Logistica"),
    ("salud", SALUD),
    ("turismo", TURISMO),
    ("energia", "Energia"),
    ("mecan", "Mecanica"),
    ("mineria", "Mineria"),
    ("agro", "Agroindustria Y Medioambiente"),
    ("electron", "Automatizacion, Electronica Y Robotica"),
    ("constru", CONSTRUCCION),
    ("dise", DISENO),
    ("gastr", GASTRONOMIA),
];

const TOKEN_STOPWORDS: [&str; 7] = ["de", "del", "la", "el", "y", "en", "ti"];
const MIN_TOKEN_CHARS: usize = 4;
const TOKEN_COVERAGE_THRESHOLD: f64 = 0.6;
const FUZZY_RATIO_THRESHOLD: f64 = 0.82;
const NEAR_NAME_WINDOW_CHARS: usize = 200;

static PRIMARY_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z]{2,6}[0-9]{2,4}\b").expect("valid code regex"));
static SECONDARY_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z0-9][A-Za-z0-9\-]{2,}\b").expect("valid code regex"));
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\p{L}{2,}").expect("valid token regex"));

/// Lowercases and strips combining marks (`"Diseño"` -> `"diseno"`).
pub fn fold(text: &str) -> String {
    text.nfkd()
        .filter(|ch| !is_combining_mark(*ch))
        .collect::<String>()
        .to_lowercase()
        .trim()
        .to_string()
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn pool_area(name: &str) -> Option<&'static str> {
    let folded = fold(name);
    SUBJECT_NAME_POOL
        .iter()
        .find(|(pool_name, _)| fold(pool_name) == folded)
        .map(|(_, area)| *area)
}

pub fn area_by_code(code: &str) -> Option<&'static str> {
    let upper = code.to_uppercase();
    if upper.starts_with("INF") || upper.contains("TI") {
        return Some(INFORMATICA);
    }
    None
}

/// Maps a free-form area label onto the enum, or `default` when nothing fits.
pub fn map_area_name(raw: &str, default: &str) -> String {
    let folded = fold(raw);
    if folded.is_empty() {
        return default.to_string();
    }

    if let Some((_, area)) = AREA_KEYWORDS.iter().find(|(kw, _)| folded.contains(kw)) {
        return area.to_string();
    }

    AREA_ENUM
        .iter()
        .find(|area| {
            let area = fold(area);
            area.contains(&folded) || folded.contains(&area)
        })
        .map(|area| area.to_string())
        .unwrap_or_else(|| default.to_string())
}

pub fn is_known_area(area: &str) -> bool {
    AREA_ENUM.contains(&area)
}

/// First code-shaped token, preferring the letters+digits form.
pub fn find_code(text: &str) -> Option<Match<'_>> {
    PRIMARY_CODE_RE
        .find(text)
        .or_else(|| SECONDARY_CODE_RE.find(text))
}

pub fn extract_code(text: &str) -> Option<String> {
    find_code(text).map(|m| m.as_str().to_string())
}

/// Code found within a short window after the first mention of `name`.
pub fn extract_code_near_name(text: &str, name: &str) -> Option<String> {
    let haystack = fold(&collapse_whitespace(text));
    let needle = fold(&collapse_whitespace(name));
    if needle.is_empty() {
        return None;
    }

    let start = haystack.find(&needle)? + needle.len();
    let window: String = haystack[start..]
        .chars()
        .take(NEAR_NAME_WINDOW_CHARS)
        .collect();
    extract_code(&window)
}

/// Whether `code` literally occurs in `text`, ignoring case and line breaks.
pub fn code_in_text(code: &str, text: &str) -> bool {
    let code = code.trim().to_lowercase();
    if code.is_empty() {
        return false;
    }
    collapse_whitespace(text).to_lowercase().contains(&code)
}

fn match_tokens(name: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(name)
        .map(|m| fold(m.as_str()))
        .filter(|token| !TOKEN_STOPWORDS.contains(&token.as_str()))
        .filter(|token| token.chars().count() >= MIN_TOKEN_CHARS)
        .collect()
}

/// Best pool name mentioned in `text`: folded substring first, then token
/// coverage, then a fuzzy ratio against the whole text.
pub fn match_pool_name(text: &str) -> Option<&'static str> {
    let folded = fold(text);
    if folded.is_empty() {
        return None;
    }

    if let Some((name, _)) = SUBJECT_NAME_POOL
        .iter()
        .find(|(name, _)| folded.contains(&fold(name)))
    {
        return Some(name);
    }

    let mut best: Option<(&'static str, f64)> = None;
    for (name, _) in SUBJECT_NAME_POOL.iter() {
        let tokens = match_tokens(name);
        if tokens.is_empty() {
            continue;
        }
        let hits = tokens.iter().filter(|token| folded.contains(token.as_str())).count();
        let coverage = hits as f64 / tokens.len() as f64;
        if best.is_none_or(|(_, score)| coverage > score) {
            best = Some((name, coverage));
        }
    }
    if let Some((name, score)) = best {
        if score >= TOKEN_COVERAGE_THRESHOLD {
            return Some(name);
        }
    }

    SUBJECT_NAME_POOL
        .iter()
        .find(|(name, _)| {
            let name = fold(name);
            ratio_upper_bound(&name, &folded) >= FUZZY_RATIO_THRESHOLD
                && similarity_ratio(&name, &folded) >= FUZZY_RATIO_THRESHOLD
        })
        .map(|(name, _)| *name)
}

// No alignment can beat the shorter side matching completely.
fn ratio_upper_bound(a: &str, b: &str) -> f64 {
    let (la, lb) = (a.chars().count(), b.chars().count());
    if la + lb == 0 {
        return 1.0;
    }
    2.0 * la.min(lb) as f64 / (la + lb) as f64
}

/// Ratcliff/Obershelp similarity: twice the matched characters over the total.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    2.0 * matching_chars(&a, &b) as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let (i, j, size) = longest_common_block(a, b);
    if size == 0 {
        return 0;
    }
    size + matching_chars(&a[..i], &b[..j]) + matching_chars(&a[i + size..], &b[j + size..])
}

fn longest_common_block(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut previous = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        let mut current = vec![0usize; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            if ca == cb {
                let run = previous[j] + 1;
                current[j + 1] = run;
                if run > best.2 {
                    best = (i + 1 - run, j + 1 - run, run);
                }
            }
        }
        previous = current;
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_and_area_tables_agree() {
        for (name, area) in SUBJECT_NAME_POOL {
            assert!(is_known_area(area), "{name} maps outside the enum");
        }
        assert_eq!(pool_area("taller de título"), Some(INFORMATICA));
        assert_eq!(pool_area("Cocina Molecular"), None);
    }

    #[test]
    fn area_keywords_and_fallback() {
        assert_eq!(map_area_name("Área de Informática", ADMINISTRACION), INFORMATICA);
        assert_eq!(map_area_name("Construcción Civil", ADMINISTRACION), CONSTRUCCION);
        assert_eq!(map_area_name("Diseño Gráfico", ADMINISTRACION), DISENO);
        assert_eq!(map_area_name("Astronomía", "Salud"), "Salud");
        assert_eq!(map_area_name("", "Salud"), "Salud");
        assert_eq!(area_by_code("TIHI43"), Some(INFORMATICA));
        assert_eq!(area_by_code("INF101"), Some(INFORMATICA));
        assert_eq!(area_by_code("GAS210"), None);
    }

    #[test]
    fn code_search_prefers_letter_digit_codes() {
        assert_eq!(
            extract_code("Programa de asignatura TIHI43 vigente").as_deref(),
            Some("TIHI43")
        );
        assert!(code_in_text("tihi43", "codigo:\nTIHI43\n"));
        assert!(!code_in_text("ABC12", "nothing here"));
        assert_eq!(
            extract_code_near_name("Taller de Titulo\n(TIHI43) y otras ADM100", "taller de titulo")
                .as_deref(),
            Some("tihi43")
        );
    }

    #[test]
    fn pool_matching_tolerates_accents_and_partial_names() {
        assert_eq!(
            match_pool_name("ASIGNATURA: TALLER DE TÍTULO"),
            Some("Taller de Titulo")
        );
        assert_eq!(
            match_pool_name("contenidos de arquitectura y software empresarial"),
            Some("Arquitectura de Software")
        );
        assert_eq!(match_pool_name("Desarrolo Backnd"), Some("Desarrollo Backend"));
        assert_eq!(match_pool_name(""), None);
    }

    #[test]
    fn similarity_ratio_matches_reference_values() {
        assert_eq!(similarity_ratio("abcd", "abcd"), 1.0);
        assert_eq!(similarity_ratio("abcd", "bcde"), 0.75);
        assert!(similarity_ratio("abc", "xyz") < 0.01);
    }
}
