mod common;

use ccd_harmonize::{
    config::PipelineConfig,
    pipeline::{RunSummary, run_pipeline},
};
use common::{TestWorkspace, write_pipeline_fixture};
use rusqlite::Connection;

fn run(workspace: &TestWorkspace) -> RunSummary {
    let config = PipelineConfig::load(&write_pipeline_fixture(workspace)).expect("config");
    run_pipeline(&config, None).expect("pipeline run")
}

fn scalar<T: rusqlite::types::FromSql>(db: &Connection, sql: &str) -> T {
    db.query_row(sql, [], |row| row.get(0))
        .unwrap_or_else(|err| panic!("{sql}: {err}"))
}

#[test]
fn three_families_load_into_one_database() {
    let workspace = TestWorkspace::new();
    let summary = run(&workspace);
    assert_eq!(summary.level, "district");
    assert_eq!(summary.families.len(), 3);
    assert_eq!(summary.state_rows, Some(2));

    let db = Connection::open(workspace.path().join("ccd.db")).unwrap();
    assert_eq!(scalar::<i64>(&db, "SELECT COUNT(*) FROM directory"), 6);
    // The 1991 row published without an identifier took it from its name.
    assert_eq!(
        scalar::<i64>(
            &db,
            "SELECT COUNT(*) FROM directory WHERE leaid = '0100005' AND district_name IS NOT NULL"
        ),
        2
    );
    assert_eq!(
        scalar::<Option<i64>>(
            &db,
            "SELECT charter FROM directory WHERE end_year = 1991 AND leaid = '0200001'"
        ),
        None
    );
    assert_eq!(
        scalar::<i64>(&db, "SELECT COUNT(*) FROM directory WHERE ulocal IS NULL"),
        2
    );
    assert_eq!(
        scalar::<String>(&db, "SELECT st FROM directory WHERE end_year = 1990 AND leaid = '0200001'"),
        "AK"
    );

    assert_eq!(scalar::<i64>(&db, "SELECT COUNT(*) FROM state"), 2);
    assert_eq!(
        scalar::<String>(&db, "SELECT statename FROM state WHERE fipst = '01'"),
        "ALABAMA"
    );

    // The -1 cell is dropped; the rest are reported counts.
    assert_eq!(scalar::<i64>(&db, "SELECT COUNT(*) FROM membership"), 5);
    assert_eq!(
        scalar::<i64>(
            &db,
            "SELECT student_count FROM membership WHERE leaid = '0100005' AND race_ethnicity = 'TOTAL'"
        ),
        500
    );
    assert_eq!(
        scalar::<i64>(&db, "SELECT COUNT(*) FROM membership WHERE dms_flag = 'Reported'"),
        5
    );

    assert_eq!(
        scalar::<i64>(&db, "SELECT totalrev FROM fiscal WHERE leaid = '0100005'"),
        350
    );
    assert_eq!(
        scalar::<Option<i64>>(&db, "SELECT totalrev FROM fiscal WHERE leaid = '0100006'"),
        None
    );

    let directory = &summary.families[0];
    let reconcile = directory.reconcile.as_ref().expect("reconcile report");
    assert_eq!(reconcile.filled_by_name, 1);
    assert_eq!(reconcile.dropped, 0);
    assert_eq!(directory.values.booleans_unmapped["CHARTER"], 1);

    let written: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(workspace.path().join("summary.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(written["families"].as_array().map(Vec::len), Some(3));
    assert_eq!(written["families"][1]["table"], "membership");
}

#[test]
fn rerunning_reproduces_the_same_tables() {
    let workspace = TestWorkspace::new();
    let first = run(&workspace);
    let second = run(&workspace);

    let fingerprints = |summary: &RunSummary| -> Vec<String> {
        summary
            .families
            .iter()
            .flat_map(|family| family.years.iter().map(|year| year.fingerprint.clone()))
            .collect()
    };
    assert_eq!(fingerprints(&first), fingerprints(&second));
    for (a, b) in first.families.iter().zip(&second.families) {
        assert_eq!(a.frame.fingerprint(), b.frame.fingerprint());
        assert_eq!(a.rows_loaded, b.rows_loaded);
    }

    let db = Connection::open(workspace.path().join("ccd.db")).unwrap();
    assert_eq!(scalar::<i64>(&db, "SELECT COUNT(*) FROM directory"), 6);
    assert_eq!(scalar::<i64>(&db, "SELECT COUNT(*) FROM state"), 2);
}

#[test]
fn a_single_family_can_be_selected() {
    let workspace = TestWorkspace::new();
    let config = PipelineConfig::load(&write_pipeline_fixture(&workspace)).unwrap();
    let summary = run_pipeline(&config, Some("fiscal")).unwrap();
    assert_eq!(summary.families.len(), 1);
    assert_eq!(summary.families[0].rows_loaded, 2);
    assert_eq!(summary.state_rows, None);

    assert!(run_pipeline(&config, Some("staff")).is_err());
}

#[test]
fn a_failing_year_leaves_earlier_tables_intact() {
    let workspace = TestWorkspace::new();
    let config_path = write_pipeline_fixture(&workspace);
    let config = PipelineConfig::load(&config_path).unwrap();
    run_pipeline(&config, None).unwrap();

    workspace.write(
        "membership_1990.csv",
        "LEAID,AMKGF,BOGUS1\n0100005,1,2\n",
    );
    let err = run_pipeline(&config, None).unwrap_err();
    assert!(format!("{err:#}").contains("membership"));

    let db = Connection::open(workspace.path().join("ccd.db")).unwrap();
    assert_eq!(scalar::<i64>(&db, "SELECT COUNT(*) FROM directory"), 6);
    assert_eq!(scalar::<i64>(&db, "SELECT COUNT(*) FROM membership"), 5);
}

const LONG_MEMBERSHIP_YAML: &str = r#"
database: long.db
level: district
families:
  - name: membership
    years: [2019]
    source:
      path: membership_{year}.csv
      column_types:
        STUDENT_COUNT: integer
      missing_tokens:
        STUDENT_COUNT: ["N"]
    plan:
      columns:
        - name: LEAID
        - name: RACE_ETHNICITY
        - name: GRADE
        - name: SEX
        - name: TOTAL_INDICATOR
        - name: STUDENT_COUNT
        - name: DMS_FLAG
    values:
      numeric: [STUDENT_COUNT]
      integer: [STUDENT_COUNT]
      flag_column: DMS_FLAG
    key: [LEAID, RACE_ETHNICITY, GRADE, SEX]
"#;

#[test]
fn published_flags_and_reporting_codes_survive_a_long_year() {
    let workspace = TestWorkspace::new();
    let set_a = "Category Set A - By Race/Ethnicity; Sex; Grade";
    workspace.write(
        "membership_2019.csv",
        &format!(
            "LEAID,RACE_ETHNICITY,GRADE,SEX,STUDENT_COUNT,TOTAL_INDICATOR,DMS_FLAG\n\
             0100005,White,Grade 1,Female,12,{set_a},Reported\n\
             0100005,White,Grade 1,Male,N,{set_a},\n\
             0100005,White,Grade 2,Female,3,{set_a},Derived\n\
             0100005,White,Grade 2,Male,-1,{set_a},Reported\n"
        ),
    );
    let config_path = workspace.write("pipeline.yaml", LONG_MEMBERSHIP_YAML);
    let config = PipelineConfig::load(&config_path).unwrap();
    let summary = run_pipeline(&config, None).unwrap();
    assert_eq!(summary.families[0].rows_loaded, 4);

    let db = Connection::open(workspace.path().join("long.db")).unwrap();
    let flag = |grade: &str, sex: &str| -> (Option<i64>, String) {
        db.query_row(
            "SELECT student_count, dms_flag FROM membership WHERE grade = ?1 AND sex = ?2",
            [grade, sex],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap()
    };
    assert_eq!(flag("Grade 1", "Female"), (Some(12), "Reported".to_string()));
    assert_eq!(flag("Grade 1", "Male"), (None, "Not applicable".to_string()));
    assert_eq!(flag("Grade 2", "Female"), (Some(3), "Derived".to_string()));
    assert_eq!(flag("Grade 2", "Male"), (None, "Missing".to_string()));
}

const ROUTED_YAML: &str = r#"
database: routed.db
level: district
overrides: overrides.yaml
families:
  - name: membership
    years: [1995]
    source:
      path: membership_{year}.csv
    melt:
      id_columns: [LEAID]
    plan:
      columns:
        - name: LEAID
        - name: RACE_ETHNICITY
        - name: GRADE
        - name: SEX
        - name: TOTAL_INDICATOR
        - name: STUDENT_COUNT
      unmapped: drop
    values:
      numeric: [STUDENT_COUNT]
      integer: [STUDENT_COUNT]
      flag_column: DMS_FLAG
    key: [LEAID, RACE_ETHNICITY, GRADE, SEX]
  - name: fiscal
    years: [1991, 1992]
    source:
      path: fiscal_{year}.csv
      delimiter: comma
    plan:
      columns:
        - name: LEAID
        - name: TOTALREV
    values:
      numeric: [TOTALREV]
      integer: [TOTALREV]
    key: [LEAID]
"#;

const ROUTED_OVERRIDES: &str = r#"
rules:
  - family: membership
    years: 1995
    action: source_path
    value: whole_{year}.csv
  - family: fiscal
    years: 1992
    action: source_path
    value: sdf92.txt
  - family: fiscal
    years: 1992
    action: headers_from_layout
    path: sdf92_layout.txt
    skip_lines: 2
"#;

#[test]
fn routed_years_read_combined_and_header_less_files() {
    let workspace = TestWorkspace::new();
    workspace.write(
        "whole_1995.csv",
        "LEAID,NAME,CITY,G01,WHITE,UNG\n0100005,Albertville City,Albertville,40,30,N\n",
    );
    workspace.write("fiscal_1991.csv", "LEAID,TOTALREV\n0100005,100\n");
    workspace.write("sdf92.txt", "0100005,250\n");
    workspace.write(
        "sdf92_layout.txt",
        "FY 1992 finance\nRecord layout\n\nName Start End\nLEAID 1 7\n\tseven character agency ID\nTOTALREV 8 15\n",
    );
    workspace.write("overrides.yaml", ROUTED_OVERRIDES);
    let config_path = workspace.write("pipeline.yaml", ROUTED_YAML);
    let config = PipelineConfig::load(&config_path).unwrap();
    let summary = run_pipeline(&config, None).unwrap();

    // NAME and CITY belong to the directory; the ungraded "N" has no count.
    assert_eq!(summary.families[0].rows_loaded, 2);
    let db = Connection::open(workspace.path().join("routed.db")).unwrap();
    assert_eq!(
        scalar::<i64>(&db, "SELECT student_count FROM membership WHERE grade = 'Grade 1'"),
        40
    );
    assert_eq!(
        scalar::<i64>(&db, "SELECT COUNT(*) FROM membership WHERE dms_flag = 'Reported'"),
        2
    );
    assert_eq!(
        scalar::<i64>(&db, "SELECT totalrev FROM fiscal WHERE end_year = 1992"),
        250
    );
    assert_eq!(scalar::<i64>(&db, "SELECT COUNT(*) FROM fiscal"), 2);
}
