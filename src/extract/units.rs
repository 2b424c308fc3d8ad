//! Unit segmentation from the descriptor text.
//!
//! The primary parser reads the "Sistema de Evaluación" table: evidence lines
//! (`1 Informe técnico`), criteria (`1.1.1 ...`), declared unit hours and the
//! "Los estudiantes ..." situation paragraphs. A looser heading/bullet parser
//! covers documents that have no such table.

use std::{
    collections::{BTreeMap, HashMap},
    sync::LazyLock,
};

use regex::Regex;

use super::text::{floor_boundary, normalize_pdf_text};
use crate::models::{SubjectUnit, UNIT_NUMBERS};

const SITUATION_LOOKBACK: usize = 400;
const SITUATION_WINDOW: usize = 8_000;
const GLOBAL_BLOCK_LOOKBACK: usize = 200;
const LOCAL_BLOCK_LOOKBACK: usize = 50;
const BLOCK_LOOKAHEAD: usize = 2_000;
const MIN_SITUATION_CHARS: usize = 60;
const EXPECTED_LEARNING_LIMIT: usize = 220;
const MAX_HEADING_HOURS: i32 = 200;

const SANITIZE_PREFIXES: [&str; 12] = [
    "rúbrica",
    "rubrica",
    "escala de apreciación",
    "escala de apreciacion",
    "perfil docente",
    "preferencia",
    "observación",
    "observacion",
    "esta unidad de aprendizaje",
    "ua estrategia",
    "estrategia didáctica",
    "estrategia didactica",
];

static ANCHOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)sistema\s+de\s+evaluaci[oó]n").expect("valid anchor regex"));
static EVIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(\d{1,2})[ \t]+([A-ZÁÉÍÓÚÑ][^:\n]{2,200})[ \t]*$")
        .expect("valid evidence regex")
});
static INLINE_CRITERION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,2}\.\d+\.\d+\b").expect("valid criterion regex"));
static UNIT_HOURS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?mi)^[ \t]*(\d{1,2})[ \t]*[.)]?[ \t]*[^|\n]*\|[ \t]*Horas[ \t]+de[ \t]+la[ \t]+Unidad[ \t]*:[ \t]*(\d+)\b",
    )
    .expect("valid unit hours regex")
});
static CRITERION_START_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(\d{1,2})\.(\d+)\.(\d+)\s+").expect("valid criterion start regex")
});
static STUDENT_START_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^[ \t]*(?:los|las|el|la)[ \t]+estudiantes?\b")
        .expect("valid situation regex")
});
static NUMBERED_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*\d+[ \t]*[.)][ \t]+[A-ZÁÉÍÓÚÑ]").expect("valid numbered line regex")
});
static INLINE_ADMIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*(?:R[úu]brica|Escala de apreciaci[oó]n)\b.*$")
        .expect("valid admin token regex")
});
static SPACE_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("valid whitespace regex"));

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[ \t]*(?:unidad|u)[ \t]*([ivxlc0-9]{1,3})[ \t]*[:\-–—]?[ \t]*([^\n]*)")
        .expect("valid heading regex")
});
static BLOCK_HOURS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{1,3})\s*(?:horas|hrs\.?|h\.)").expect("valid block hours regex")
});
static NUMBERED_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.").expect("valid numbered item regex"));
static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d{1,2})\.(\d{1,2})\s+(.+)$").expect("valid bullet regex")
});
static BULLET_STOP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:\d+\.\d+\.\d+\b|(?:APRENDIZAJES|CRITERIOS|CONTENIDOS|ACTIVIDADES|ESTRATEGIAS|SISTEMA)\b)",
    )
    .expect("valid bullet stop regex")
});
static SIMPLE_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d)\.\s+(.+)").expect("valid simple item regex"));

/// Per-unit data recovered from the evaluation section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitEvidence {
    pub evaluation_evidence: Option<String>,
    pub activities_description: Option<String>,
    pub unit_hours: Option<i32>,
}

#[derive(Debug, Clone)]
struct Criterion {
    start: usize,
    end: usize,
    line: String,
}

/// Parses the evaluation section into per-unit evidence, keyed by unit 1..4.
pub fn segment_units(raw_text: &str) -> BTreeMap<i32, UnitEvidence> {
    let text = normalize_pdf_text(raw_text);
    if text.trim().is_empty() {
        return BTreeMap::new();
    }

    let hours = declared_unit_hours(&text);
    let (evidence, evidence_pos) = evidence_lines(&text);
    let (criteria, spans) = criteria_by_unit(&text);
    let situations = situations_by_unit(&text, &spans, &evidence_pos);

    let mut units: BTreeMap<i32, UnitEvidence> = BTreeMap::new();
    let numbers = hours
        .keys()
        .chain(evidence.keys())
        .chain(criteria.keys())
        .chain(situations.keys())
        .copied()
        .filter(|n| UNIT_NUMBERS.contains(n));

    for number in numbers {
        if units.contains_key(&number) {
            continue;
        }
        let mut parts: Vec<String> = Vec::new();
        if let Some(situation) = situations.get(&number) {
            parts.push(situation.clone());
        }
        if let Some(lines) = criteria.get(&number) {
            parts.extend(lines.iter().cloned());
        }

        let entry = UnitEvidence {
            evaluation_evidence: evidence.get(&number).cloned(),
            activities_description: (!parts.is_empty()).then(|| parts.join("\n")),
            unit_hours: hours.get(&number).copied(),
        };
        if entry != UnitEvidence::default() {
            units.insert(number, entry);
        }
    }

    units
}

fn declared_unit_hours(text: &str) -> HashMap<i32, i32> {
    UNIT_HOURS_RE
        .captures_iter(text)
        .filter_map(|caps| Some((caps[1].parse().ok()?, caps[2].parse().ok()?)))
        .collect()
}

fn evidence_lines(text: &str) -> (HashMap<i32, String>, HashMap<i32, usize>) {
    let anchor = ANCHOR_RE.find(text).map(|m| m.start()).unwrap_or(0);
    let segment = &text[anchor..];

    let mut lines = HashMap::new();
    let mut positions = HashMap::new();
    for caps in EVIDENCE_RE.captures_iter(segment) {
        let Ok(number) = caps[1].parse::<i32>() else {
            continue;
        };
        let phrase = caps[2].trim();
        if phrase.contains("Horas") || phrase.contains('|') {
            continue;
        }
        if lines.contains_key(&number) {
            continue;
        }
        let cleaned = trim_at_first_criterion(phrase);
        lines.insert(number, format!("{number} {cleaned}"));
        if let Some(whole) = caps.get(0) {
            positions.insert(number, anchor + whole.start());
        }
    }
    (lines, positions)
}

fn trim_at_first_criterion(line: &str) -> &str {
    match INLINE_CRITERION_RE.find(line) {
        Some(m) => line[..m.start()].trim_end(),
        None => line,
    }
}

fn criteria_by_unit(
    text: &str,
) -> (HashMap<i32, Vec<String>>, HashMap<i32, (usize, usize)>) {
    let mut boundaries: Vec<usize> = CRITERION_START_RE
        .find_iter(text)
        .chain(STUDENT_START_RE.find_iter(text))
        .chain(NUMBERED_LINE_RE.find_iter(text))
        .map(|m| m.start())
        .collect();
    boundaries.sort_unstable();

    let mut per_unit: HashMap<i32, HashMap<String, Criterion>> = HashMap::new();
    for caps in CRITERION_START_RE.captures_iter(text) {
        let Some(header) = caps.get(0) else {
            continue;
        };
        let Ok(number) = caps[1].parse::<i32>() else {
            continue;
        };
        let body_start = header.end();
        let body_end = boundaries
            .iter()
            .copied()
            .find(|pos| *pos > body_start)
            .unwrap_or(text.len());
        if body_end <= body_start {
            continue;
        }

        let code = format!("{}.{}.{}", &caps[1], &caps[2], &caps[3]);
        let body = sanitize_text_block(&text[body_start..body_end]);
        let line = format!("{code} {body}").trim().to_string();
        let criterion = Criterion {
            start: header.start(),
            end: body_end,
            line,
        };

        let unit = per_unit.entry(number).or_default();
        let replace = unit
            .get(&code)
            .is_none_or(|existing| criterion.line.chars().count() > existing.line.chars().count());
        if replace {
            unit.insert(code, criterion);
        }
    }

    let mut lines = HashMap::new();
    let mut spans = HashMap::new();
    for (number, by_code) in per_unit {
        let mut items: Vec<Criterion> = by_code.into_values().collect();
        items.sort_by_key(|item| item.start);
        if let (Some(first), Some(last)) = (items.first(), items.last()) {
            spans.insert(number, (first.start, last.end));
        }
        lines.insert(number, items.into_iter().map(|item| item.line).collect());
    }
    (lines, spans)
}

fn expected_verb(unit: i32) -> Option<&'static str> {
    match unit {
        1 => Some("elaboran"),
        2 => Some("diseñan"),
        3 => Some("construyen"),
        4 => Some("demuestran"),
        _ => None,
    }
}

fn situations_by_unit(
    text: &str,
    spans: &HashMap<i32, (usize, usize)>,
    evidence_pos: &HashMap<i32, usize>,
) -> HashMap<i32, String> {
    let global_blocks: Vec<(usize, usize, String)> = STUDENT_START_RE
        .find_iter(text)
        .filter_map(|m| {
            let left = floor_boundary(text, m.start().saturating_sub(GLOBAL_BLOCK_LOOKBACK));
            let right = floor_boundary(text, m.end() + BLOCK_LOOKAHEAD);
            collect_block(&text[left..right]).map(|block| (m.start(), m.end(), block))
        })
        .collect();

    let mut numbers: Vec<i32> = spans.keys().chain(evidence_pos.keys()).copied().collect();
    numbers.sort_unstable();
    numbers.dedup();

    let mut out = HashMap::new();
    for number in numbers {
        let Some((left, right)) = situation_window(text, number, spans, evidence_pos) else {
            continue;
        };
        let verb = expected_verb(number);
        let slice = &text[left..right];

        let mut candidate = collect_block(slice).map(|block| match verb {
            Some(verb) if !block.to_lowercase().contains(verb) => {
                let with_verb = STUDENT_START_RE
                    .find_iter(slice)
                    .filter_map(|m| {
                        let l = floor_boundary(slice, m.start().saturating_sub(LOCAL_BLOCK_LOOKBACK));
                        let r = floor_boundary(slice, m.end() + BLOCK_LOOKAHEAD);
                        collect_block(&slice[l..r])
                    })
                    .filter(|b| b.to_lowercase().contains(verb))
                    .max_by_key(|b| b.chars().count());
                with_verb.unwrap_or(block)
            }
            _ => block,
        });

        if candidate.is_none() && !global_blocks.is_empty() {
            let center = (left + right) / 2;
            candidate = global_blocks
                .iter()
                .min_by_key(|(start, end, block)| {
                    let distance = ((start + end) / 2).abs_diff(center);
                    let penalty = match verb {
                        Some(verb) if block.to_lowercase().contains(verb) => 0,
                        _ => 1,
                    };
                    (penalty, distance, std::cmp::Reverse(block.chars().count()))
                })
                .map(|(_, _, block)| block.clone());
        }

        if let Some(block) = candidate {
            if block.chars().count() >= MIN_SITUATION_CHARS {
                out.insert(number, sanitize_text_block(&block));
            }
        }
    }
    out
}

fn situation_window(
    text: &str,
    number: i32,
    spans: &HashMap<i32, (usize, usize)>,
    evidence_pos: &HashMap<i32, usize>,
) -> Option<(usize, usize)> {
    let first = spans
        .get(&number)
        .map(|(start, _)| *start)
        .into_iter()
        .chain(evidence_pos.get(&number).copied())
        .min()?;
    let start = floor_boundary(text, first.saturating_sub(SITUATION_LOOKBACK));

    let next = number + 1;
    let end = spans
        .get(&next)
        .map(|(start, _)| *start)
        .into_iter()
        .chain(evidence_pos.get(&next).copied())
        .min()
        .unwrap_or(start + SITUATION_WINDOW);
    let end = floor_boundary(text, end);

    (end > start).then_some((start, end))
}

fn collect_block(slice: &str) -> Option<String> {
    let lines: Vec<&str> = slice.lines().collect();
    let start = lines.iter().position(|line| STUDENT_START_RE.is_match(line))?;

    let mut buffer: Vec<String> = Vec::new();
    for raw in &lines[start..] {
        let line = raw.trim();
        if line.is_empty() {
            if buffer.is_empty() {
                continue;
            }
            break;
        }
        if CRITERION_START_RE.is_match(line) || NUMBERED_LINE_RE.is_match(line) {
            break;
        }
        let line = INLINE_ADMIN_RE.replace(line, "");
        if line.is_empty() {
            break;
        }
        buffer.push(line.into_owned());
    }

    if buffer.is_empty() {
        return None;
    }
    let block = sanitize_text_block(&buffer.join(" "));
    (!block.is_empty()).then_some(block)
}

/// Joins the lines of a block, stopping at rubric or profile boilerplate.
pub fn sanitize_text_block(block: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for line in block.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        let lower = line.to_lowercase();
        if SANITIZE_PREFIXES.iter().any(|prefix| lower.starts_with(prefix)) {
            break;
        }
        kept.push(line);
    }

    let joined = kept.join(" ");
    let collapsed = SPACE_RUN_RE.replace_all(&joined, " ");
    INLINE_ADMIN_RE
        .replace(collapsed.trim(), "")
        .trim()
        .to_string()
}

/// Looser parser for `Unidad N: Title` headings, `n.m` bullets or `n.` lines.
pub fn parse_unit_headings(text: &str) -> Vec<SubjectUnit> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let units = units_from_headings(text);
    if !units.is_empty() {
        return units;
    }
    let units = units_from_bullets(text);
    if !units.is_empty() {
        return units;
    }
    units_from_numbered_lines(text)
}

fn roman_or_decimal(raw: &str) -> Option<i32> {
    if raw.chars().all(|ch| ch.is_ascii_digit()) {
        return raw.parse().ok();
    }
    let value = match raw.to_uppercase().as_str() {
        "I" => 1,
        "II" => 2,
        "III" => 3,
        "IV" => 4,
        "V" => 5,
        "VI" => 6,
        "VII" => 7,
        "VIII" => 8,
        "IX" => 9,
        "X" => 10,
        _ => return None,
    };
    Some(value)
}

fn units_from_headings(text: &str) -> Vec<SubjectUnit> {
    let headings: Vec<(usize, usize, String, String)> = HEADING_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                whole.start(),
                whole.end(),
                caps[1].to_string(),
                caps[2].trim().to_string(),
            ))
        })
        .collect();

    let mut units = Vec::new();
    for (idx, (_, end, raw_number, title)) in headings.iter().enumerate() {
        let block_end = headings.get(idx + 1).map(|h| h.0).unwrap_or(text.len());
        let Some(number) = roman_or_decimal(raw_number).filter(|n| UNIT_NUMBERS.contains(n)) else {
            continue;
        };
        let block = if block_end > *end { &text[*end..block_end] } else { "" };

        let hours = BLOCK_HOURS_RE
            .captures_iter(block)
            .filter_map(|caps| caps[1].parse::<i32>().ok())
            .filter(|value| (1..=MAX_HEADING_HOURS).contains(value))
            .max();

        let numbered: Vec<&str> = block
            .lines()
            .map(str::trim)
            .filter(|line| NUMBERED_ITEM_RE.is_match(line))
            .collect();

        units.push(SubjectUnit {
            number,
            expected_learning: (!title.is_empty()).then(|| title.clone()),
            unit_hours: hours,
            activities_description: (numbered.len() >= 3).then(|| numbered.join("\n")),
            evaluation_evidence: None,
        });
        if units.len() >= 4 {
            break;
        }
    }
    units
}

fn units_from_bullets(text: &str) -> Vec<SubjectUnit> {
    let lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    let mut groups: BTreeMap<i32, Vec<String>> = BTreeMap::new();

    let mut i = 0;
    while i < lines.len() {
        let Some(caps) = BULLET_RE.captures(lines[i]) else {
            i += 1;
            continue;
        };
        let major = caps[1].parse::<i32>().unwrap_or(0);
        if !UNIT_NUMBERS.contains(&major) {
            i += 1;
            continue;
        }

        let mut buffer = vec![caps[3].trim().to_string()];
        let mut j = i + 1;
        while j < lines.len() {
            let line = lines[j].trim();
            if line.is_empty() || BULLET_RE.is_match(lines[j]) || BULLET_STOP_RE.is_match(line) {
                break;
            }
            buffer.push(line.to_string());
            j += 1;
        }

        let item = buffer.join(" ").trim().to_string();
        if !item.is_empty() {
            groups.entry(major).or_default().push(item);
        }
        i = j;
    }

    groups
        .into_iter()
        .filter(|(_, items)| !items.is_empty())
        .map(|(number, items)| SubjectUnit {
            number,
            expected_learning: Some(shorten(&items[0], EXPECTED_LEARNING_LIMIT)),
            unit_hours: None,
            activities_description: (items.len() >= 2).then(|| {
                items
                    .iter()
                    .enumerate()
                    .map(|(idx, item)| format!("{}. {item}", idx + 1))
                    .collect::<Vec<_>>()
                    .join("\n")
            }),
            evaluation_evidence: None,
        })
        .collect()
}

fn units_from_numbered_lines(text: &str) -> Vec<SubjectUnit> {
    let mut seen: Vec<i32> = Vec::new();
    let mut units = Vec::new();
    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some(caps) = SIMPLE_ITEM_RE.captures(line) else {
            continue;
        };
        let number = caps[1].parse::<i32>().unwrap_or(0);
        if !UNIT_NUMBERS.contains(&number) || seen.contains(&number) {
            continue;
        }
        seen.push(number);
        units.push(SubjectUnit {
            number,
            expected_learning: Some(caps[2].trim().to_string()),
            ..SubjectUnit::default()
        });
    }
    units
}

/// Cuts at the first sentence end when it falls in a sensible range, else
/// truncates with an ellipsis.
pub fn shorten(text: &str, limit: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= limit {
        return text.to_string();
    }
    if let Some(dot) = chars.iter().position(|ch| *ch == '.') {
        if (60..=limit).contains(&dot) {
            return chars[..=dot].iter().collect::<String>().trim().to_string();
        }
    }
    let head: String = chars[..limit].iter().collect();
    format!("{}…", head.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVALUATION_SAMPLE: &str = "\
PROGRAMA DE ASIGNATURA
1 Identifica requerimientos | Horas de la Unidad: 12
2 Diseña soluciones | Horas de la Unidad: 18
SISTEMA DE EVALUACIÓN
1 Informe de requerimientos
1.1.1 Identifica necesidades del cliente.
1.1.2 Documenta requisitos funcionales.
Los estudiantes elaboran un informe técnico de requerimientos para una empresa real del sector productivo.

2 Prototipo funcional
2.1.1 Diseña la arquitectura de la solución.
Los estudiantes diseñan un prototipo funcional que responde a los requerimientos levantados con la empresa.
";

    #[test]
    fn evaluation_table_yields_evidence_criteria_and_hours() {
        let units = segment_units(EVALUATION_SAMPLE);
        assert_eq!(units.len(), 2);

        let first = &units[&1];
        assert_eq!(first.evaluation_evidence.as_deref(), Some("1 Informe de requerimientos"));
        assert_eq!(first.unit_hours, Some(12));
        assert_eq!(
            first.activities_description.as_deref(),
            Some(
                "Los estudiantes elaboran un informe técnico de requerimientos para una empresa real del sector productivo.\n\
                 1.1.1 Identifica necesidades del cliente.\n\
                 1.1.2 Documenta requisitos funcionales."
            )
        );

        let second = &units[&2];
        assert_eq!(second.evaluation_evidence.as_deref(), Some("2 Prototipo funcional"));
        assert_eq!(second.unit_hours, Some(18));
        let activities = second.activities_description.as_deref().unwrap();
        assert!(activities.starts_with("Los estudiantes diseñan"));
        assert!(activities.ends_with("2.1.1 Diseña la arquitectura de la solución."));
    }

    #[test]
    fn situation_with_the_unit_verb_wins_inside_the_window() {
        let text = "\
SISTEMA DE EVALUACIÓN
1 Informe de avance
Los estudiantes revisan antecedentes del proyecto junto al docente guía del curso.

Los estudiantes elaboran un informe técnico con la propuesta de mejora para la empresa.
";
        let units = segment_units(text);

        assert_eq!(
            units[&1].activities_description.as_deref(),
            Some("Los estudiantes elaboran un informe técnico con la propuesta de mejora para la empresa.")
        );
    }

    #[test]
    fn empty_window_falls_back_to_the_nearest_situation() {
        let far = "Los estudiantes presentan un avance oral del proyecto ante la comisión evaluadora.\n\n";
        let near = "Los estudiantes presentan una maqueta final del proyecto ante la empresa asociada.\n\n";
        let line = "Texto de relleno sin formato.\n";
        let marker = far.len() + line.len() * 100;
        let text = format!("{far}{}{}{near}", line.repeat(100), line.repeat(20));
        let positions = HashMap::from([(3, marker), (4, marker + 100)]);

        let situations = situations_by_unit(&text, &HashMap::new(), &positions);
        assert_eq!(
            situations.get(&3).map(String::as_str),
            Some("Los estudiantes presentan una maqueta final del proyecto ante la empresa asociada.")
        );

        let far = far.replace("presentan un avance oral", "construyen un prototipo");
        let text = format!("{far}{}{}{near}", line.repeat(100), line.repeat(20));
        let marker = far.len() + line.len() * 100;
        let positions = HashMap::from([(3, marker), (4, marker + 100)]);

        let situations = situations_by_unit(&text, &HashMap::new(), &positions);
        assert_eq!(
            situations.get(&3).map(String::as_str),
            Some("Los estudiantes construyen un prototipo del proyecto ante la comisión evaluadora.")
        );
    }

    #[test]
    fn evidence_before_anchor_is_ignored() {
        let text = "1 Introducción general\nSistema de evaluacion\n2 Prototipo funcional\n";
        let units = segment_units(text);
        assert!(!units.contains_key(&1));
        assert_eq!(
            units[&2].evaluation_evidence.as_deref(),
            Some("2 Prototipo funcional")
        );
    }

    #[test]
    fn sanitize_stops_at_rubric_boilerplate() {
        let block = "Analiza el caso.\n  Propone mejoras   concretas.\nRúbrica de evaluación\nNo debe aparecer";
        assert_eq!(
            sanitize_text_block(block),
            "Analiza el caso. Propone mejoras concretas."
        );
        assert_eq!(
            sanitize_text_block("Entrega informe Escala de apreciación 40%"),
            "Entrega informe"
        );
    }

    #[test]
    fn headings_parser_reads_roman_numerals_and_hours() {
        let text = "Unidad I: Fundamentos de redes\nDuración 24 horas\n1. Configura\n2. Prueba\n3. Documenta\nUnidad II - Seguridad perimetral\n";
        let units = parse_unit_headings(text);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].number, 1);
        assert_eq!(units[0].expected_learning.as_deref(), Some("Fundamentos de redes"));
        assert_eq!(units[0].unit_hours, Some(24));
        assert_eq!(
            units[0].activities_description.as_deref(),
            Some("1. Configura\n2. Prueba\n3. Documenta")
        );
        assert_eq!(units[1].number, 2);
        assert_eq!(units[1].expected_learning.as_deref(), Some("Seguridad perimetral"));
    }

    #[test]
    fn bullets_are_grouped_per_unit() {
        let text = "1.1 Reconoce el contexto\n1.2 Analiza requisitos\n2.1 Construye prototipo\n";
        let units = parse_unit_headings(text);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].expected_learning.as_deref(), Some("Reconoce el contexto"));
        assert_eq!(
            units[0].activities_description.as_deref(),
            Some("1. Reconoce el contexto\n2. Analiza requisitos")
        );
        assert_eq!(units[1].activities_description, None);
    }

    #[test]
    fn shorten_prefers_sentence_end() {
        let sentence = format!("{}. resto", "a".repeat(70));
        assert_eq!(shorten(&sentence, 72), format!("{}.", "a".repeat(70)));
        assert_eq!(shorten(&"b".repeat(10), 4), "bbbb…");
        assert_eq!(shorten("corto", 220), "corto");
    }
}
