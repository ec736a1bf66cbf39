mod common;

use std::collections::BTreeMap;

use ccd_harmonize::{
    data::Value,
    frame::Frame,
    harmonize::{HarmonizePlan, harmonize},
    ingest::{IngestOptions, SourceFormat, read_table},
    values::{
        DmsFlag, apply_text_sentinels, normalize_boolean_columns, normalize_numeric_columns,
        uppercase_columns,
    },
};
use common::{TestWorkspace, frame, int, text};
use proptest::prelude::*;

fn names(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| c.to_string()).collect()
}

#[test]
fn reporting_codes_become_absent_with_a_flag() {
    let mut membership = frame(
        &["LEAID", "STUDENT_COUNT"],
        vec![
            vec![text("1"), int(-1)],
            vec![text("2"), int(-2)],
            vec![text("3"), int(-34000)],
            vec![text("4"), int(0)],
            vec![text("5"), text("412")],
        ],
    );
    let counts = names(&["STUDENT_COUNT"]);
    let report =
        normalize_numeric_columns(&mut membership, &counts, &counts, Some("DMS_FLAG")).unwrap();

    let values: Vec<_> = membership
        .rows()
        .iter()
        .map(|row| row[1].clone())
        .collect();
    assert_eq!(values, vec![None, None, None, int(0), int(412)]);
    let flags: Vec<_> = (0..membership.len())
        .map(|i| membership.cell(i, "DMS_FLAG").cloned())
        .collect();
    assert_eq!(
        flags,
        vec![
            text(DmsFlag::Missing.as_str()),
            text(DmsFlag::NotApplicable.as_str()),
            text(DmsFlag::Anomalous.as_str()),
            text(DmsFlag::Reported.as_str()),
            text(DmsFlag::Reported.as_str()),
        ]
    );

    let tally = &report.counts["STUDENT_COUNT"];
    assert_eq!(tally.reported, 2);
    assert_eq!(tally.absent(), 3);
}

#[test]
fn a_flag_column_needs_exactly_one_count_column() {
    let mut staff = frame(&["A", "B"], vec![vec![int(1), int(2)]]);
    let err =
        normalize_numeric_columns(&mut staff, &names(&["A", "B"]), &[], Some("DMS_FLAG"))
            .unwrap_err();
    assert!(err.to_string().contains("exactly one"));
}

#[test]
fn no_negative_number_survives_normalization() {
    let mut fiscal = frame(
        &["TOTALREV", "TOTALEXP"],
        vec![
            vec![Some(Value::Real(-0.5)), text("-7")],
            vec![Some(Value::Real(10.25)), text("3")],
        ],
    );
    let columns = names(&["TOTALREV", "TOTALEXP"]);
    normalize_numeric_columns(&mut fiscal, &columns, &names(&["TOTALEXP"]), None).unwrap();
    for row in fiscal.rows() {
        for cell in row.iter().flatten() {
            assert!(cell.as_f64().is_some_and(|f| f >= 0.0), "{cell:?}");
        }
    }
    assert_eq!(fiscal.rows()[1], vec![Some(Value::Real(10.25)), int(3)]);
}

#[test]
fn yes_no_columns_share_one_lookup() {
    let mut directory = frame(
        &["LEAID", "CHARTER"],
        vec![
            vec![text("1"), text("Yes")],
            vec![text("2"), text("N")],
            vec![text("3"), int(1)],
            vec![text("4"), text("Not reported")],
        ],
    );
    let report = normalize_boolean_columns(&mut directory, &names(&["CHARTER"])).unwrap();
    let mapped: Vec<_> = directory.rows().iter().map(|row| row[1].clone()).collect();
    assert_eq!(
        mapped,
        vec![
            Some(Value::Boolean(true)),
            Some(Value::Boolean(false)),
            Some(Value::Boolean(true)),
            None,
        ]
    );
    assert_eq!(report.booleans_unmapped["CHARTER"], 1);
}

#[test]
fn text_sentinels_clear_and_uppercase_folds() {
    let mut directory = frame(
        &["MSTATE", "ULOCAL"],
        vec![
            vec![text("al"), text("SP")],
            vec![text("Ga"), text("00")],
            vec![text("tx"), text("11")],
        ],
    );
    let sentinels = BTreeMap::from([(
        "ULOCAL".to_string(),
        vec!["SP".to_string(), "00".to_string(), ".".to_string()],
    )]);
    let report = apply_text_sentinels(&mut directory, &sentinels).unwrap();
    assert_eq!(report.text_sentinels["ULOCAL"], 2);
    uppercase_columns(&mut directory, &names(&["MSTATE"])).unwrap();

    assert_eq!(
        directory.rows(),
        [
            vec![text("AL"), None],
            vec![text("GA"), None],
            vec![text("TX"), text("11")],
        ]
    );
}

fn normalize_file(path: &std::path::Path, plan: &HarmonizePlan) -> Frame {
    let format = SourceFormat::Delimited { delimiter: b',' };
    let raw = read_table(path, 1996, &format, &IngestOptions::default()).unwrap();
    let mut out = harmonize(raw, 1996, plan).unwrap();
    let counts = names(&["MEMBER"]);
    normalize_numeric_columns(&mut out, &counts, &counts, None).unwrap();
    normalize_boolean_columns(&mut out, &names(&["CHARTER"])).unwrap();
    out
}

fn raw_token() -> impl Strategy<Value = String> {
    prop_oneof![
        (-40000i64..40000).prop_map(|n| n.to_string()),
        (0.0f64..1.0e6).prop_map(|f| format!("{f:.3}")),
        Just("M".to_string()),
        Just("N".to_string()),
        Just(String::new()),
        "[A-Za-z ]{1,8}",
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn reprocessing_a_year_is_byte_identical(
        rows in proptest::collection::vec((raw_token(), raw_token()), 1..20)
    ) {
        let workspace = TestWorkspace::new();
        let mut body = String::from("LEAID,MEMBER,CHARTER\n");
        for (idx, (member, charter)) in rows.iter().enumerate() {
            body.push_str(&format!("{:07},{member},{charter}\n", idx + 1));
        }
        let path = workspace.write("member_1996.csv", &body);
        let plan: HarmonizePlan = serde_yaml::from_str(
            "columns:\n  - name: LEAID\n  - name: MEMBER\n  - name: CHARTER\n",
        )
        .unwrap();

        let first = normalize_file(&path, &plan);
        let second = normalize_file(&path, &plan);
        prop_assert_eq!(first.fingerprint(), second.fingerprint());
        prop_assert_eq!(first, second);
    }
}
