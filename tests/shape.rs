mod common;

use std::collections::BTreeMap;

use ccd_harmonize::{
    error::HarmonizeError,
    shape::{
        Aggregate, CategoryKey, EDUCATION_UNIT_TOTAL, GRADE_COLUMN, Grade, PivotSpec, RACE_COLUMN, Race,
        SEX_COLUMN, Sex, Shape, TOTAL_INDICATOR_COLUMN, decode_key, detect_shape, encode_key,
        melt_wide, pivot_wider, relabel_aggregates, tag_totals, wide_column_key,
    },
};
use common::{frame, int, text};
use proptest::prelude::*;

fn category_key() -> impl Strategy<Value = CategoryKey> {
    (
        proptest::sample::select(Race::all()),
        proptest::sample::select(Grade::all()),
        proptest::sample::select(Sex::all()),
    )
        .prop_map(|(race, grade, sex)| CategoryKey { race, grade, sex })
}

proptest! {
    #[test]
    fn packed_keys_round_trip(key in category_key()) {
        let packed = encode_key(&key);
        prop_assert_eq!(packed.len(), 5);
        prop_assert_eq!(decode_key(&packed).unwrap(), key);
    }

    #[test]
    fn unit_total_iff_all_three_dimensions_aggregate(key in category_key()) {
        let ids = frame(&["LEAID", "X"], vec![vec![text("1"), int(5)]]);
        let mut wide = ids.clone();
        wide.rename_column("X", &encode_key(&key)).unwrap();
        let mut long = melt_wide(&wide, 1995, &["LEAID".to_string()], "STUDENT_COUNT").unwrap();
        tag_totals(&mut long).unwrap();
        let indicator = long
            .cell(0, TOTAL_INDICATOR_COLUMN)
            .and_then(|v| v.as_text())
            .unwrap()
            .to_string();
        let all_plain_total = key.race == Race::Aggregate(Aggregate::Total)
            && matches!(key.grade, Grade::Aggregate(Aggregate::Total) | Grade::AllGrades)
            && key.sex == Sex::Aggregate(Aggregate::Total);
        prop_assert_eq!(indicator == EDUCATION_UNIT_TOTAL, all_plain_total);
    }
}

#[test]
fn wide_year_melts_to_one_row_per_category() {
    let wide = frame(
        &["LEAID", "AMKGF", "G01", "TOTAL", "WHITE"],
        vec![vec![text("0100005"), int(3), int(40), int(500), int(410)]],
    );
    assert_eq!(detect_shape(&wide), Shape::Wide);
    let mut long = melt_wide(&wide, 1995, &["LEAID".to_string()], "STUDENT_COUNT").unwrap();
    assert_eq!(detect_shape(&long), Shape::Long);
    assert_eq!(
        long.columns(),
        ["LEAID", RACE_COLUMN, GRADE_COLUMN, SEX_COLUMN, "STUDENT_COUNT"]
    );
    assert_eq!(long.len(), 4);
    assert_eq!(long.rows()[0][1], text("American Indian or Alaska Native"));
    assert_eq!(long.rows()[0][2], text("Kindergarten"));
    assert_eq!(long.rows()[0][3], text("Female"));
    assert_eq!(long.rows()[1][2], text("Grade 1"));

    tag_totals(&mut long).unwrap();
    assert_eq!(long.cell(2, TOTAL_INDICATOR_COLUMN), text(EDUCATION_UNIT_TOTAL).as_ref());
    relabel_aggregates(&mut long).unwrap();
    for column in [RACE_COLUMN, GRADE_COLUMN, SEX_COLUMN] {
        assert_eq!(long.cell(2, column), text("TOTAL").as_ref());
    }
    // Grade 1 row: race and sex are aggregates, grade is real.
    assert_eq!(long.cell(1, RACE_COLUMN), text("SUBTOTAL").as_ref());
    assert_eq!(long.cell(1, GRADE_COLUMN), text("Grade 1").as_ref());
}

#[test]
fn unknown_wide_columns_are_unmapped() {
    let wide = frame(
        &["LEAID", "NAME", "G01", "BOGUS1"],
        vec![vec![text("1"), text("Albertville City"), int(40), int(1)]],
    );
    let err = melt_wide(&wide, 1995, &["LEAID".to_string()], "STUDENT_COUNT").unwrap_err();
    match err.downcast_ref::<HarmonizeError>() {
        Some(HarmonizeError::UnmappedColumns { year, columns }) => {
            assert_eq!(*year, 1995);
            assert_eq!(columns, &vec!["NAME".to_string(), "BOGUS1".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(wide_column_key("HISP"), Some("HIXXX".to_string()));
    assert_eq!(wide_column_key("PACIFIC"), Some("HPXXX".to_string()));
}

fn staff_spec() -> PivotSpec {
    PivotSpec {
        id_columns: vec!["LEAID".into()],
        label_column: "STAFF".into(),
        value_column: "STAFF_COUNT".into(),
        labels: BTreeMap::from([
            ("Elementary School Counselors".to_string(), "ELMGUI".to_string()),
            ("School administrators".to_string(), "SCHADM".to_string()),
            ("School Administrators".to_string(), "SCHADM".to_string()),
            ("No Category Codes".to_string(), "TOTAL".to_string()),
        ]),
    }
}

#[test]
fn long_staff_year_pivots_wide() {
    let long = frame(
        &["LEAID", "STAFF", "STAFF_COUNT"],
        vec![
            vec![text("1"), text("Elementary School Counselors"), int(2)],
            vec![text("1"), text("No Category Codes"), int(40)],
            vec![text("2"), text("School Administrators"), int(3)],
        ],
    );
    let wide = pivot_wider(&long, &staff_spec()).unwrap();
    assert_eq!(wide.columns(), ["LEAID", "ELMGUI", "SCHADM", "TOTAL"]);
    assert_eq!(wide.len(), 2);
    assert_eq!(wide.rows()[0], vec![text("1"), int(2), None, int(40)]);
    assert_eq!(wide.rows()[1], vec![text("2"), None, int(3), None]);
}

#[test]
fn pivot_conflicts_are_fatal() {
    let duplicate = frame(
        &["LEAID", "STAFF", "STAFF_COUNT"],
        vec![
            vec![text("1"), text("School administrators"), int(2)],
            vec![text("1"), text("School Administrators"), int(2)],
        ],
    );
    let unknown = frame(
        &["LEAID", "STAFF", "STAFF_COUNT"],
        vec![vec![text("1"), text("Bus drivers"), int(2)]],
    );
    for long in [duplicate, unknown] {
        let err = pivot_wider(&long, &staff_spec()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarmonizeError>(),
            Some(HarmonizeError::PivotConflict { .. })
        ));
    }
}
