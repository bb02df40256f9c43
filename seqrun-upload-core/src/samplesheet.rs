//! Sample Filter: gate runs on the sample names in their sample sheet.
//!
//! The sheet is the `*samplesheet*.csv` file at the top of the run directory.
//! Sample names are read from the first column of the rows under the single
//! `Sample_ID` header line. When a target carries a pattern, every sample must
//! match it for the run to be uploaded; an empty sample list never matches.

use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SampleSheetError {
    #[error("no sample sheet found in {0}")]
    Missing(PathBuf),

    #[error("{count} sample sheets with differing contents found in {dir}")]
    Ambiguous { dir: PathBuf, count: usize },

    #[error("sample sheet is malformed: {0}")]
    Malformed(String),

    #[error("failed to read sample sheet: {0}")]
    Io(#[from] io::Error),
}

/// Whether a run passed the sample filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleVerdict {
    Accepted,
    Rejected { reason: String },
}

impl SampleVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SampleVerdict::Accepted)
    }
}

static SAMPLESHEET_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)samplesheet.*\.csv$").expect("sample sheet name pattern is valid"));

/// `*samplesheet*.csv`, case-insensitive.
fn is_samplesheet_name(name: &str) -> bool {
    SAMPLESHEET_NAME.is_match(name)
}

/// Sample sheet files directly inside `run_dir`, sorted by name.
pub fn find_samplesheets(run_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut sheets = Vec::new();
    for entry in fs::read_dir(run_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if is_samplesheet_name(&name.to_string_lossy()) && entry.path().is_file() {
            sheets.push(entry.path());
        }
    }
    sheets.sort();
    Ok(sheets)
}

/// Read the run's sample sheet as lines.
///
/// Several sheets are tolerated only when they are identical.
pub fn read_samplesheet(run_dir: &Path) -> Result<Vec<String>, SampleSheetError> {
    let sheets = find_samplesheets(run_dir)?;
    debug!(run_dir = %run_dir.display(), found = ?sheets, "Looking for sample sheet");

    let mut contents: Option<String> = None;
    for sheet in &sheets {
        let text = fs::read_to_string(sheet)?;
        match &contents {
            None => contents = Some(text),
            Some(first) if *first == text => {}
            Some(_) => {
                return Err(SampleSheetError::Ambiguous {
                    dir: run_dir.to_path_buf(),
                    count: sheets.len(),
                })
            }
        }
    }

    contents
        .map(|text| text.lines().map(str::to_owned).collect())
        .ok_or_else(|| SampleSheetError::Missing(run_dir.to_path_buf()))
}

/// Parse sample names from sample sheet lines.
pub fn parse_sample_names(lines: &[String]) -> Result<Vec<String>, SampleSheetError> {
    let headers: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.starts_with("Sample_ID"))
        .map(|(i, _)| i)
        .collect();

    let header = match headers.as_slice() {
        [only] => *only,
        _ => {
            return Err(SampleSheetError::Malformed(format!(
                "expected exactly one Sample_ID line, found {} (lines {:?})",
                headers.len(),
                headers
            )))
        }
    };

    let names: Vec<String> = lines[header + 1..]
        .iter()
        .map(|l| l.trim())
        .take_while(|l| !l.starts_with('['))
        .filter(|l| !l.is_empty())
        .map(|l| l.split(',').next().unwrap_or_default().trim().to_owned())
        .collect();

    debug!(count = names.len(), ?names, "Parsed sample names");
    Ok(names)
}

/// True when every name contains a match for `pattern`. An empty list is false.
pub fn all_samples_match(names: &[String], pattern: &Regex) -> bool {
    !names.is_empty() && names.iter().all(|n| pattern.is_match(n))
}

/// Decide whether the run at `run_dir` passes the sample filter.
pub fn evaluate_samples(run_dir: &Path, pattern: Option<&Regex>, skip_check: bool) -> SampleVerdict {
    if pattern.is_none() && skip_check {
        return SampleVerdict::Accepted;
    }

    let names = match read_samplesheet(run_dir).and_then(|lines| parse_sample_names(&lines)) {
        Ok(names) => names,
        Err(e) => {
            warn!(run_dir = %run_dir.display(), error = %e, "Failed parsing sample sheet, run will not be uploaded");
            return SampleVerdict::Rejected {
                reason: e.to_string(),
            };
        }
    };

    let Some(pattern) = pattern else {
        return SampleVerdict::Accepted;
    };

    info!(run_dir = %run_dir.display(), pattern = %pattern, "Checking sample names against pattern");
    if all_samples_match(&names, pattern) {
        info!(run_dir = %run_dir.display(), "All samples match pattern");
        SampleVerdict::Accepted
    } else if names.is_empty() {
        warn!(run_dir = %run_dir.display(), "Sample sheet lists no samples, run will not be uploaded");
        SampleVerdict::Rejected {
            reason: "sample sheet lists no samples".to_string(),
        }
    } else {
        info!(run_dir = %run_dir.display(), pattern = %pattern, "One or more samples did not match pattern, run will not be uploaded");
        SampleVerdict::Rejected {
            reason: format!("not every sample matches {pattern}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samplesheet_names_are_recognised() {
        for name in [
            "SAMPLESHEET.CSV",
            "SampleSheet.csv",
            "Samplesheet.csv",
            "samplesheet.csv",
            "experiment_1_samplesheet.csv",
            "experiment_2_SampleSheet.csv",
            "experiment_3-samplesheet_attempt_1.csv",
        ] {
            assert!(is_samplesheet_name(name), "{name} should match");
        }
    }

    #[test]
    fn non_samplesheet_names_are_ignored() {
        for name in [
            "my_file.csv",
            "SampleSheet.txt",
            "samplesheet.tsv",
            "Samplesheet.xlsx",
            "samplesheet",
            "sample_1.csv",
            "samplesheet.csv.bak",
        ] {
            assert!(!is_samplesheet_name(name), "{name} should not match");
        }
    }
}
