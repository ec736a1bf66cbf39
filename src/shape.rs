//! Shape normalization: wide membership years to long, long staff years to
//! wide.
//!
//! Up to 2016 membership was published wide, one column per
//! race x grade x sex cell. Every such column is first canonicalized to a
//! five-character packed key (`RRGGS`: race code, grade code, sex code) and
//! the key is decoded positionally through three lookup tables. Each table is
//! total over its domain, including the aggregate sentinels `X` (total), `Y`
//! (total less adult education) and `Z` (the IAMEMPUP indicator).

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

use anyhow::{Result, bail};
use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    data::{Value, render_cell},
    error::HarmonizeError,
    frame::Frame,
};

pub const RACE_COLUMN: &str = "RACE_ETHNICITY";
pub const GRADE_COLUMN: &str = "GRADE";
pub const SEX_COLUMN: &str = "SEX";
pub const TOTAL_INDICATOR_COLUMN: &str = "TOTAL_INDICATOR";

pub const EDUCATION_UNIT_TOTAL: &str = "Education Unit Total";
pub const UNIT_TOTAL_LESS_AE: &str = "Derived - Education Unit Total minus Adult Education Count";
pub const CATEGORY_SET_A: &str = "Category Set A - By Race/Ethnicity; Sex; Grade";
pub const SUBTOTAL_BY_GRADE: &str = "Subtotal 4 - By Grade";
pub const SUBTOTAL_RACE_SEX_LESS_AE: &str =
    "Derived - Subtotal by Race/Ethnicity and Sex minus Adult Education Count";
pub const MEMBERSHIP_INDICATOR: &str = "IAMEMPUP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregate {
    Total,
    TotalLessAe,
    Indicator,
}

impl Aggregate {
    pub const ALL: [Aggregate; 3] = [Aggregate::Total, Aggregate::TotalLessAe, Aggregate::Indicator];

    fn from_char(code: char) -> Option<Aggregate> {
        match code {
            'X' => Some(Aggregate::Total),
            'Y' => Some(Aggregate::TotalLessAe),
            'Z' => Some(Aggregate::Indicator),
            _ => None,
        }
    }

    fn from_code(code: &str) -> Option<Aggregate> {
        let mut chars = code.chars();
        let first = chars.next()?;
        let aggregate = Aggregate::from_char(first)?;
        chars.all(|c| c == first).then_some(aggregate)
    }

    fn as_char(self) -> char {
        match self {
            Aggregate::Total => 'X',
            Aggregate::TotalLessAe => 'Y',
            Aggregate::Indicator => 'Z',
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Aggregate::Total => "Aggregation",
            Aggregate::TotalLessAe => "Aggregation Less AE",
            Aggregate::Indicator => "IAMEMPUP",
        }
    }

    pub fn from_label(label: &str) -> Option<Aggregate> {
        Aggregate::ALL.into_iter().find(|a| a.label() == label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Race {
    AmericanIndian,
    Asian,
    Hispanic,
    Black,
    White,
    PacificIslander,
    TwoOrMore,
    Aggregate(Aggregate),
}

impl Race {
    pub const REAL: [Race; 7] = [
        Race::AmericanIndian,
        Race::Asian,
        Race::Hispanic,
        Race::Black,
        Race::White,
        Race::PacificIslander,
        Race::TwoOrMore,
    ];

    pub fn from_code(code: &str) -> Option<Race> {
        let race = match code {
            "AM" => Race::AmericanIndian,
            "AS" => Race::Asian,
            "HI" => Race::Hispanic,
            "BL" => Race::Black,
            "WH" => Race::White,
            "HP" => Race::PacificIslander,
            "TR" => Race::TwoOrMore,
            other if other.len() == 2 => Race::Aggregate(Aggregate::from_code(other)?),
            _ => return None,
        };
        Some(race)
    }

    pub fn code(&self) -> String {
        match self {
            Race::AmericanIndian => "AM".to_string(),
            Race::Asian => "AS".to_string(),
            Race::Hispanic => "HI".to_string(),
            Race::Black => "BL".to_string(),
            Race::White => "WH".to_string(),
            Race::PacificIslander => "HP".to_string(),
            Race::TwoOrMore => "TR".to_string(),
            Race::Aggregate(a) => a.as_char().to_string().repeat(2),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Race::AmericanIndian => "American Indian or Alaska Native",
            Race::Asian => "Asian",
            Race::Hispanic => "Hispanic/Latino",
            Race::Black => "Black or African American",
            Race::White => "White",
            Race::PacificIslander => "Native Hawaiian or Other Pacific Islander",
            Race::TwoOrMore => "Two or more races",
            Race::Aggregate(a) => a.label(),
        }
    }

    pub fn aggregate(&self) -> Option<Aggregate> {
        match self {
            Race::Aggregate(a) => Some(*a),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Grade {
    Numbered(u8),
    Kindergarten,
    PreKindergarten,
    Ungraded,
    AdultEducation,
    /// `AL`: all grades, published alongside per-race columns. It shares the
    /// `Aggregation` label with `XX`, so a label alone cannot tell the two
    /// codes apart.
    AllGrades,
    Aggregate(Aggregate),
}

impl Grade {
    pub fn from_code(code: &str) -> Option<Grade> {
        let grade = match code {
            "KG" => Grade::Kindergarten,
            "PK" => Grade::PreKindergarten,
            "UG" => Grade::Ungraded,
            "AE" => Grade::AdultEducation,
            "AL" => Grade::AllGrades,
            digits if digits.len() == 2 && digits.bytes().all(|b| b.is_ascii_digit()) => {
                let number: u8 = digits.parse().ok()?;
                if !(1..=13).contains(&number) {
                    return None;
                }
                Grade::Numbered(number)
            }
            other if other.len() == 2 => Grade::Aggregate(Aggregate::from_code(other)?),
            _ => return None,
        };
        Some(grade)
    }

    pub fn code(&self) -> String {
        match self {
            Grade::Numbered(n) => format!("{n:02}"),
            Grade::Kindergarten => "KG".to_string(),
            Grade::PreKindergarten => "PK".to_string(),
            Grade::Ungraded => "UG".to_string(),
            Grade::AdultEducation => "AE".to_string(),
            Grade::AllGrades => "AL".to_string(),
            Grade::Aggregate(a) => a.as_char().to_string().repeat(2),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Grade::Numbered(n) => format!("Grade {n}"),
            Grade::Kindergarten => "Kindergarten".to_string(),
            Grade::PreKindergarten => "Pre-Kindergarten".to_string(),
            Grade::Ungraded => "Ungraded".to_string(),
            Grade::AdultEducation => "Adult Education".to_string(),
            Grade::AllGrades => Aggregate::Total.label().to_string(),
            Grade::Aggregate(a) => a.label().to_string(),
        }
    }

    pub fn aggregate(&self) -> Option<Aggregate> {
        match self {
            Grade::AllGrades => Some(Aggregate::Total),
            Grade::Aggregate(a) => Some(*a),
            _ => None,
        }
    }

    pub fn all() -> Vec<Grade> {
        let mut grades: Vec<Grade> = (1..=13).map(Grade::Numbered).collect();
        grades.extend([
            Grade::Kindergarten,
            Grade::PreKindergarten,
            Grade::Ungraded,
            Grade::AdultEducation,
            Grade::AllGrades,
        ]);
        grades.extend(Aggregate::ALL.map(Grade::Aggregate));
        grades
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sex {
    Female,
    Male,
    Aggregate(Aggregate),
}

impl Sex {
    pub fn from_code(code: &str) -> Option<Sex> {
        match code {
            "F" => Some(Sex::Female),
            "M" => Some(Sex::Male),
            other if other.len() == 1 => Aggregate::from_code(other).map(Sex::Aggregate),
            _ => None,
        }
    }

    pub fn code(&self) -> String {
        match self {
            Sex::Female => "F".to_string(),
            Sex::Male => "M".to_string(),
            Sex::Aggregate(a) => a.as_char().to_string(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Sex::Female => "Female",
            Sex::Male => "Male",
            Sex::Aggregate(a) => a.label(),
        }
    }

    pub fn aggregate(&self) -> Option<Aggregate> {
        match self {
            Sex::Aggregate(a) => Some(*a),
            _ => None,
        }
    }

    pub fn all() -> Vec<Sex> {
        let mut sexes = vec![Sex::Female, Sex::Male];
        sexes.extend(Aggregate::ALL.map(Sex::Aggregate));
        sexes
    }
}

impl Race {
    pub fn all() -> Vec<Race> {
        let mut races = Race::REAL.to_vec();
        races.extend(Aggregate::ALL.map(Race::Aggregate));
        races
    }
}

/// A decoded `RRGGS` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CategoryKey {
    pub race: Race,
    pub grade: Grade,
    pub sex: Sex,
}

impl fmt::Display for CategoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_key(self))
    }
}

pub fn decode_key(key: &str) -> Result<CategoryKey> {
    let unknown = |dimension: &'static str, code: &str| HarmonizeError::UnknownCategoryCode {
        dimension,
        code: code.to_string(),
        key: key.to_string(),
    };
    if key.len() != 5 || !key.is_ascii() {
        return Err(unknown("packed key", key).into());
    }
    let race = Race::from_code(&key[0..2]).ok_or_else(|| unknown("race", &key[0..2]))?;
    let grade = Grade::from_code(&key[2..4]).ok_or_else(|| unknown("grade", &key[2..4]))?;
    let sex = Sex::from_code(&key[4..5]).ok_or_else(|| unknown("sex", &key[4..5]))?;
    Ok(CategoryKey { race, grade, sex })
}

pub fn encode_key(key: &CategoryKey) -> String {
    format!("{}{}{}", key.race.code(), key.grade.code(), key.sex.code())
}

/// Canonical packed key for a wide membership column, or `None` when the
/// name has no packed reading.
///
/// `G01` -> `XX01X`, `PK` -> `XXPKX`, `AM` -> `AMXXX`, `WHITE` -> `WHXXX`,
/// `UNG` -> `XXUGX`, `TOTAL` -> `XXXXX`, `MEMBER` -> `YYYYY`,
/// `IAMEMPUP` -> `ZZZZZ`, four character race-by-grade names gain an
/// aggregate sex (`AMKG` -> `AMKGX`), and five character names are already
/// packed. Four and five character names only count when every code in them
/// decodes.
pub fn wide_column_key(name: &str) -> Option<String> {
    let upper = name.trim().to_ascii_uppercase();
    let fixed = match upper.as_str() {
        "TOTAL" => Some("XXXXX"),
        "MEMBER" => Some("YYYYY"),
        "IAMEMPUP" => Some("ZZZZZ"),
        "UNG" => Some("XXUGX"),
        "WHITE" => Some("WHXXX"),
        "BLACK" => Some("BLXXX"),
        "HISP" => Some("HIXXX"),
        "ASIAN" => Some("ASXXX"),
        "PACIFIC" => Some("HPXXX"),
        _ => None,
    };
    if let Some(key) = fixed {
        return Some(key.to_string());
    }
    if matches!(upper.as_str(), "PK" | "KG" | "UG" | "AE") {
        return Some(format!("XX{upper}X"));
    }
    if upper.len() == 2 && Race::from_code(&upper).is_some_and(|r| r.aggregate().is_none()) {
        return Some(format!("{upper}XXX"));
    }
    if let Some(digits) = upper.strip_prefix('G')
        && digits.len() == 2
        && digits.bytes().all(|b| b.is_ascii_digit())
    {
        return Some(format!("XX{digits}X"));
    }
    let key = match upper.len() {
        4 if upper.is_ascii() => format!("{upper}X"),
        5 if upper.is_ascii() => upper,
        _ => return None,
    };
    decode_key(&key).is_ok().then_some(key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Wide,
    Long,
}

/// Long frames carry explicit dimension columns; anything else is wide.
pub fn detect_shape(frame: &Frame) -> Shape {
    if [RACE_COLUMN, GRADE_COLUMN, SEX_COLUMN]
        .iter()
        .all(|column| frame.has_column(column))
    {
        Shape::Long
    } else {
        Shape::Wide
    }
}

/// Melts every non-identifier column into one row per (row, column) with the
/// decoded race, grade and sex labels and the raw cell in `value_column`.
/// Rows keep input order; within a row, value columns keep column order.
/// Columns with no packed reading are reported together as unmapped.
pub fn melt_wide(
    frame: &Frame,
    year: i32,
    id_columns: &[String],
    value_column: &str,
) -> Result<Frame> {
    let id_indexes = id_columns
        .iter()
        .map(|column| match frame.column_index(column) {
            Some(idx) => Ok(idx),
            None => bail!("Identifier column '{column}' is not in the wide frame"),
        })
        .collect::<Result<Vec<_>>>()?;

    let mut value_columns = Vec::new();
    let mut unmapped = Vec::new();
    for (idx, name) in frame.columns().iter().enumerate() {
        if id_indexes.contains(&idx) {
            continue;
        }
        let Some(key) = wide_column_key(name) else {
            unmapped.push(name.clone());
            continue;
        };
        let decoded = decode_key(&key)?;
        let labels = [
            Value::Text(decoded.race.label().to_string()),
            Value::Text(decoded.grade.label()),
            Value::Text(decoded.sex.label().to_string()),
        ];
        value_columns.push((idx, labels));
    }
    if !unmapped.is_empty() {
        return Err(HarmonizeError::UnmappedColumns {
            year,
            columns: unmapped,
        }
        .into());
    }
    debug!(
        "Melting {} value column(s) over {} row(s)",
        value_columns.len(),
        frame.len()
    );

    let mut columns = id_columns.to_vec();
    columns.extend([
        RACE_COLUMN.to_string(),
        GRADE_COLUMN.to_string(),
        SEX_COLUMN.to_string(),
        value_column.to_string(),
    ]);
    let mut long = Frame::new(columns);
    for row in frame.rows() {
        for (idx, labels) in &value_columns {
            let mut melted: Vec<Option<Value>> =
                id_indexes.iter().map(|i| row[*i].clone()).collect();
            melted.extend(labels.iter().cloned().map(Some));
            melted.push(row[*idx].clone());
            long.push_row(melted)?;
        }
    }
    Ok(long)
}

/// Total indicator for one combination of dimension labels.
///
/// Only a row whose three dimensions are all the plain aggregate is the
/// education unit total, and only an all-less-AE row is the derived total.
pub fn total_indicator(race: &str, grade: &str, sex: &str) -> String {
    let aggregates = [
        Aggregate::from_label(race),
        Aggregate::from_label(grade),
        Aggregate::from_label(sex),
    ];
    match aggregates {
        [Some(Aggregate::Total), Some(Aggregate::Total), Some(Aggregate::Total)] => {
            EDUCATION_UNIT_TOTAL.to_string()
        }
        [
            Some(Aggregate::TotalLessAe),
            Some(Aggregate::TotalLessAe),
            Some(Aggregate::TotalLessAe),
        ] => UNIT_TOTAL_LESS_AE.to_string(),
        [
            Some(Aggregate::Indicator),
            Some(Aggregate::Indicator),
            Some(Aggregate::Indicator),
        ] => MEMBERSHIP_INDICATOR.to_string(),
        [None, None, None] => CATEGORY_SET_A.to_string(),
        [Some(Aggregate::Total), None, Some(Aggregate::Total)] => SUBTOTAL_BY_GRADE.to_string(),
        [None, Some(Aggregate::TotalLessAe), None] => SUBTOTAL_RACE_SEX_LESS_AE.to_string(),
        _ => {
            let by = ["Race/Ethnicity", "Grade", "Sex"]
                .iter()
                .zip(aggregates)
                .filter(|(_, aggregate)| aggregate.is_none())
                .map(|(name, _)| *name)
                .join("; ");
            if by.is_empty() {
                "Derived - Mixed Aggregation".to_string()
            } else {
                format!("Subtotal - By {by}")
            }
        }
    }
}

fn text_at(row: &[Option<Value>], idx: usize) -> String {
    render_cell(row[idx].as_ref())
}

fn dimension_indexes(frame: &Frame) -> Result<[usize; 3]> {
    let mut indexes = [0; 3];
    for (slot, column) in indexes.iter_mut().zip([RACE_COLUMN, GRADE_COLUMN, SEX_COLUMN]) {
        *slot = match frame.column_index(column) {
            Some(idx) => idx,
            None => bail!("Dimension column '{column}' is missing"),
        };
    }
    Ok(indexes)
}

/// Adds the `TOTAL_INDICATOR` column computed from the dimension labels.
/// Must run before [`relabel_aggregates`], which keys on it.
pub fn tag_totals(frame: &mut Frame) -> Result<()> {
    let [race, grade, sex] = dimension_indexes(frame)?;
    let indicators = frame
        .rows()
        .iter()
        .map(|row| {
            Some(Value::Text(total_indicator(
                &text_at(row, race),
                &text_at(row, grade),
                &text_at(row, sex),
            )))
        })
        .collect();
    frame.push_column(TOTAL_INDICATOR_COLUMN, indicators)
}

/// Replaces aggregate dimension labels with `TOTAL` / `SUBTOTAL` style
/// labels according to the row's total indicator so that per-category sums
/// never pick up aggregate rows. Returns the number of rewritten cells.
pub fn relabel_aggregates(frame: &mut Frame) -> Result<usize> {
    let [race, grade, sex] = dimension_indexes(frame)?;
    let Some(indicator_idx) = frame.column_index(TOTAL_INDICATOR_COLUMN) else {
        bail!("'{TOTAL_INDICATOR_COLUMN}' must be tagged before relabeling aggregates");
    };
    let mut rewritten = 0;
    for row in frame.rows_mut() {
        let indicator = text_at(row, indicator_idx);
        let mut set = |row: &mut Vec<Option<Value>>, idx: usize, label: &str| {
            let label = Some(Value::Text(label.to_string()));
            if row[idx] != label {
                row[idx] = label;
                rewritten += 1;
            }
        };
        match indicator.as_str() {
            EDUCATION_UNIT_TOTAL => {
                for idx in [race, grade, sex] {
                    set(row, idx, "TOTAL");
                }
            }
            UNIT_TOTAL_LESS_AE => {
                for idx in [race, grade, sex] {
                    set(row, idx, "TOTAL less AE");
                }
            }
            SUBTOTAL_RACE_SEX_LESS_AE => set(row, grade, "SUBTOTAL less AE"),
            SUBTOTAL_BY_GRADE => {
                set(row, race, "SUBTOTAL");
                set(row, sex, "SUBTOTAL");
            }
            _ => {}
        }
        for idx in [race, grade, sex] {
            match Aggregate::from_label(&text_at(row, idx)) {
                Some(Aggregate::Total) => set(row, idx, "SUBTOTAL"),
                Some(Aggregate::TotalLessAe) => set(row, idx, "SUBTOTAL less AE"),
                _ => {}
            }
        }
    }
    Ok(rewritten)
}

/// Staff category labels of the long releases and the column each one
/// lands in. Both spellings of the administrators label occur.
pub const STAFF_LABELS: [(&str, &str); 28] = [
    ("Elementary School Counselors", "ELMGUI"),
    ("Secondary School Counselors", "SECGUI"),
    ("School Counselors", "GUI"),
    ("Pre-kindergarten Teachers", "PKTCH"),
    ("Kindergarten Teachers", "KGTCH"),
    ("Elementary Teachers", "ELMTCH"),
    ("Secondary Teachers", "SECTCH"),
    ("Ungraded Teachers", "UGTCH"),
    ("School Administrators", "SCHADM"),
    ("School administrators", "SCHADM"),
    ("School Administrative Support Staff", "SCHSUP"),
    ("Paraprofessionals/Instructional Aides", "PARA"),
    ("Librarians/media specialists", "LIBSPE"),
    ("Library/Media Support Staff", "LIBSUP"),
    ("Student Support Services Staff", "STUSUP"),
    ("Student Support Services Staff (w/o Psychology)", "STUSUPWOPSYCH"),
    ("School Psychologists", "SCHPSYCH"),
    ("LEA Administrators", "LEAADM"),
    ("LEA Administrative Support Staff", "LEASUP"),
    ("Instructional Coordinators and Supervisors to the Staff", "CORSUP"),
    ("All Other Support Staff", "OTHSUP"),
    ("Missing", "MISSING"),
    ("Teachers", "TOTTCH"),
    ("Guidance Counselors", "TOTGUI"),
    ("School Staff", "SCHSTA"),
    ("LEA Staff", "LEASTA"),
    ("Other Staff", "OTHSTA"),
    ("No Category Codes", "TOTAL"),
];

pub fn staff_labels() -> BTreeMap<String, String> {
    STAFF_LABELS
        .iter()
        .map(|(label, column)| (label.to_string(), column.to_string()))
        .collect()
}

/// Long -> wide pivot of a labelled value column (staff years published
/// one row per staff category).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PivotSpec {
    pub id_columns: Vec<String>,
    pub label_column: String,
    pub value_column: String,
    /// Published label -> destination column; the staff table when omitted.
    #[serde(default = "staff_labels")]
    pub labels: BTreeMap<String, String>,
}

impl PivotSpec {
    fn target_columns(&self) -> Vec<String> {
        self.labels
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Pivots `frame` so every identifier tuple becomes one row with one column
/// per destination in `spec.labels`. Unknown labels and repeated
/// (identifier, destination) pairs are fatal; destinations a row never
/// reports are absent. Columns outside the spec are discarded.
pub fn pivot_wider(frame: &Frame, spec: &PivotSpec) -> Result<Frame> {
    let id_indexes = spec
        .id_columns
        .iter()
        .map(|column| match frame.column_index(column) {
            Some(idx) => Ok(idx),
            None => bail!("Identifier column '{column}' is not in the long frame"),
        })
        .collect::<Result<Vec<_>>>()?;
    let (Some(label_idx), Some(value_idx)) = (
        frame.column_index(&spec.label_column),
        frame.column_index(&spec.value_column),
    ) else {
        bail!(
            "Pivot needs columns '{}' and '{}'",
            spec.label_column,
            spec.value_column
        );
    };
    let discarded: Vec<&String> = frame
        .columns()
        .iter()
        .enumerate()
        .filter(|(idx, _)| !id_indexes.contains(idx) && *idx != label_idx && *idx != value_idx)
        .map(|(_, name)| name)
        .collect();
    if !discarded.is_empty() {
        debug!("Pivot discards column(s) {discarded:?}");
    }

    let targets = spec.target_columns();
    let target_index: HashMap<&str, usize> = targets
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.as_str(), idx))
        .collect();

    let mut groups: Vec<(Vec<Option<Value>>, Vec<Option<Option<Value>>>)> = Vec::new();
    let mut group_index: HashMap<Vec<String>, usize> = HashMap::new();
    for row in frame.rows() {
        let label = text_at(row, label_idx);
        let target = spec
            .labels
            .get(label.trim())
            .ok_or_else(|| HarmonizeError::PivotConflict {
                detail: format!("label '{label}' has no destination column"),
            })?;
        let id_key: Vec<String> = id_indexes.iter().map(|i| text_at(row, *i)).collect();
        let slot = match group_index.get(&id_key) {
            Some(slot) => *slot,
            None => {
                let ids = id_indexes.iter().map(|i| row[*i].clone()).collect();
                groups.push((ids, vec![None; targets.len()]));
                group_index.insert(id_key.clone(), groups.len() - 1);
                groups.len() - 1
            }
        };
        let column = target_index[target.as_str()];
        let cell = &mut groups[slot].1[column];
        if cell.is_some() {
            return Err(HarmonizeError::PivotConflict {
                detail: format!("{id_key:?} reports '{target}' more than once"),
            }
            .into());
        }
        *cell = Some(row[value_idx].clone());
    }

    let mut columns = spec.id_columns.clone();
    columns.extend(targets.iter().cloned());
    let mut wide = Frame::new(columns);
    for (ids, values) in groups {
        let mut row = ids;
        row.extend(values.into_iter().map(Option::flatten));
        wide.push_row(row)?;
    }
    Ok(wide)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_legal_code_round_trips() {
        for race in Race::all() {
            for grade in Grade::all() {
                for sex in Sex::all() {
                    let key = CategoryKey { race, grade, sex };
                    let packed = encode_key(&key);
                    assert_eq!(packed.len(), 5);
                    assert_eq!(decode_key(&packed).unwrap(), key, "{packed}");
                }
            }
        }
    }

    #[test]
    fn unknown_codes_name_their_dimension() {
        let err = decode_key("QQ01F").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarmonizeError>(),
            Some(HarmonizeError::UnknownCategoryCode { dimension: "race", .. })
        ));
        let err = decode_key("AM14F").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarmonizeError>(),
            Some(HarmonizeError::UnknownCategoryCode { dimension: "grade", .. })
        ));
        let err = decode_key("AM01Q").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarmonizeError>(),
            Some(HarmonizeError::UnknownCategoryCode { dimension: "sex", .. })
        ));
        assert!(decode_key("XY").is_err());
    }

    #[test]
    fn mixed_sentinel_codes_are_rejected() {
        assert!(decode_key("XY01F").is_err());
        assert!(decode_key("AMXYF").is_err());
    }

    #[test]
    fn labels_follow_nces_codes() {
        assert_eq!(Race::Hispanic.label(), "Hispanic/Latino");
        assert_eq!(
            Race::from_code("HP").unwrap().label(),
            "Native Hawaiian or Other Pacific Islander"
        );
        assert_eq!(Grade::Numbered(1).label(), "Grade 1");
        assert_eq!(Grade::AllGrades.label(), "Aggregation");
    }

    #[test]
    fn wide_column_names_canonicalize() {
        assert_eq!(wide_column_key("G01").as_deref(), Some("XX01X"));
        assert_eq!(wide_column_key("pk").as_deref(), Some("XXPKX"));
        assert_eq!(wide_column_key("AM").as_deref(), Some("AMXXX"));
        assert_eq!(wide_column_key("AMKG").as_deref(), Some("AMKGX"));
        assert_eq!(wide_column_key("HISP").as_deref(), Some("HIXXX"));
        assert_eq!(wide_column_key("TOTAL").as_deref(), Some("XXXXX"));
        assert_eq!(wide_column_key("MEMBER").as_deref(), Some("YYYYY"));
        assert_eq!(wide_column_key("UNG").as_deref(), Some("XXUGX"));
        assert_eq!(wide_column_key("AM01F").as_deref(), Some("AM01F"));
        assert_eq!(wide_column_key("SEANAME"), None);
        assert_eq!(wide_column_key("NAME"), None);
        assert_eq!(wide_column_key("STATE"), None);
    }

    #[test]
    fn all_grades_and_total_share_one_label() {
        let all = Grade::from_code("AL").unwrap();
        let total = Grade::from_code("XX").unwrap();
        assert_ne!(all, total);
        assert_eq!(all.label(), total.label());
        assert_eq!(Aggregate::from_label(&all.label()), Some(Aggregate::Total));
        assert_eq!(all.aggregate(), total.aggregate());
    }

    #[test]
    fn staff_table_is_the_default_pivot_labels() {
        let spec: PivotSpec = serde_yaml::from_str(
            "id_columns: [LEAID]\nlabel_column: STAFF\nvalue_column: STAFF_COUNT\n",
        )
        .unwrap();
        assert_eq!(spec.labels.len(), STAFF_LABELS.len());
        assert_eq!(spec.labels["School administrators"], "SCHADM");
        assert_eq!(spec.labels["No Category Codes"], "TOTAL");
        assert_eq!(spec.target_columns().len(), 27);
    }

    #[test]
    fn unit_total_requires_all_three_aggregates() {
        assert_eq!(
            total_indicator("Aggregation", "Aggregation", "Aggregation"),
            EDUCATION_UNIT_TOTAL
        );
        assert_eq!(
            total_indicator("Asian", "Aggregation", "Aggregation"),
            "Subtotal - By Race/Ethnicity"
        );
        assert_eq!(
            total_indicator("Aggregation", "Grade 3", "Aggregation"),
            SUBTOTAL_BY_GRADE
        );
        assert_eq!(
            total_indicator("Asian", "Aggregation Less AE", "Male"),
            SUBTOTAL_RACE_SEX_LESS_AE
        );
        assert_eq!(total_indicator("Asian", "Grade 3", "Male"), CATEGORY_SET_A);
    }
}
