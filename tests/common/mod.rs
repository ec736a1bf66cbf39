#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use ccd_harmonize::{data::Value, frame::Frame};
use tempfile::{TempDir, tempdir};

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        self.write_bytes(name, contents.as_bytes())
    }

    /// Writes raw bytes, for inputs that are not UTF-8.
    pub fn write_bytes(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents).expect("write temp file contents");
        path
    }
}

pub fn text(value: &str) -> Option<Value> {
    Some(Value::Text(value.to_string()))
}

pub fn int(value: i64) -> Option<Value> {
    Some(Value::Integer(value))
}

pub fn frame(columns: &[&str], rows: Vec<Vec<Option<Value>>>) -> Frame {
    Frame::from_rows(columns.iter().map(|c| c.to_string()).collect(), rows).expect("frame")
}

/// Left-justifies each `(value, width)` pair into one fixed-width record.
pub fn fixed_record(fields: &[(&str, usize)]) -> String {
    fields
        .iter()
        .map(|(value, width)| format!("{value:<width$}"))
        .collect()
}

const PIPELINE_YAML: &str = r#"
database: ccd.db
level: district
overrides: overrides.yaml
summary_path: summary.json
state_lookup:
  family: directory
  name_column: STNAME
families:
  - name: directory
    years: [1990, 1991]
    source:
      path: directory_{year}.csv
      header_sentinel: LEAID
    plan:
      columns:
        - name: LEAID
        - name: FIPST
          sources: [FIPS]
        - name: ST
        - name: STNAME
        - name: STID
        - name: NAME
        - name: CHARTER
        - name: ULOCAL
    values:
      boolean: [CHARTER]
      uppercase: [ST]
      text_sentinels:
        ULOCAL: ["SP", "00"]
    reconcile:
      primary: LEAID
      secondary: STID
      name: DISTRICT_NAME
    key: [LEAID]
  - name: membership
    years: [1990]
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
    values:
      numeric: [STUDENT_COUNT]
      integer: [STUDENT_COUNT]
      flag_column: DMS_FLAG
    key: [LEAID, RACE_ETHNICITY, GRADE, SEX]
  - name: fiscal
    years: [1990]
    source:
      format: fixed_width
      path: fiscal_{year}.dat
      layout_path: fiscal_layout_{year}.txt
    plan:
      columns:
        - name: LEAID
        - name: TFEDREV
        - name: TSTREV
        - name: TOTALREV
      derived_sums:
        - column: TOTALREV
          addends: [TFEDREV, TSTREV]
    values:
      numeric: [TFEDREV, TSTREV, TOTALREV]
      integer: [TFEDREV, TSTREV, TOTALREV]
    key: [LEAID]
    column_types:
      TOTALREV: integer
"#;

const OVERRIDES_YAML: &str = r#"
rules:
  - family: directory
    years: 1991
    action: uppercase_headers
    note: 1990-91 directory ships lower-case headers
"#;

const FISCAL_LAYOUT: &str = "\
FISCAL FILE LAYOUT
LEAID    1-7    7  AN  Agency ID
TFEDREV  8-15   8  N   Federal revenue
TSTREV   16-23  8  N   State revenue
";

/// Writes a small three-family run (delimited directory with a missing
/// identifier, wide membership, fixed-width fiscal) and returns the config
/// path.
pub fn write_pipeline_fixture(workspace: &TestWorkspace) -> PathBuf {
    workspace.write(
        "directory_1990.csv",
        "LEAID,FIPS,ST,STNAME,STID,NAME,CHARTER,ULOCAL\n\
         0100005,01,AL,ALABAMA ,101,Albertville City,N,11\n\
         0100006,01,AL,Alabama,102,Marshall County,Yes,SP\n\
         0200001,02,ak,ALASKA,201,Anchorage,2,21\n",
    );
    workspace.write(
        "directory_1991.csv",
        "Common Core of Data 1990-91\n\
         leaid,fipst,st,stname,stid,name,charter,ulocal\n\
         ,01,AL,Alabama,101,ALBERTVILLE CITY,N,11\n\
         0100006,01,AL,Alabama,102,Marshall County,Y,00\n\
         0200001,02,AK,Alaska,201,Anchorage,Not reported,21\n",
    );
    workspace.write(
        "membership_1990.csv",
        "LEAID,AMKGF,G01,TOTAL\n0100005,-1,40,500\n0100006,3,50,600\n",
    );
    workspace.write("fiscal_layout_1990.txt", FISCAL_LAYOUT);
    let fiscal = [
        fixed_record(&[("0100005", 7), ("     100", 8), ("     250", 8)]),
        fixed_record(&[("0100006", 7), ("      -1", 8), ("      10", 8)]),
    ]
    .join("\n");
    workspace.write("fiscal_1990.dat", &format!("{fiscal}\n"));
    workspace.write("overrides.yaml", OVERRIDES_YAML);
    workspace.write("pipeline.yaml", PIPELINE_YAML)
}
