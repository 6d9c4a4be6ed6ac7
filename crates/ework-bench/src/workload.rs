//! Synthetic CSV workload.
//!
//! The pool routine parses a comma-separated document of unsigned integers and
//! folds it into a [`CsvSummary`]. Each worker learns the expected column count
//! once, from the pool's init data, and rejects ragged rows against it.

use core::cell::Cell;
use ework::InitData;
use std::fmt::Write as _;

thread_local! {
    static EXPECTED_COLUMNS: Cell<Option<usize>> = const { Cell::new(None) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvSummary {
    pub rows: usize,
    pub columns: usize,
    pub checksum: u64,
}

#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum WorkloadError {
    #[error("Row {row} has {found} columns, expected {expected}")]
    RaggedRow {
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error("Row {row}, column {column}: `{value}` is not an unsigned integer")]
    InvalidNumber {
        row: usize,
        column: usize,
        value: String,
    },
    #[error("Init data must be an object with a positive `columns` field")]
    InvalidInitData,
}

/// Builds a header line plus `rows` lines of `columns` pseudo-random integers.
pub fn generate_csv(rows: usize, columns: usize) -> String {
    let mut out = String::with_capacity(rows * columns * 6);
    for column in 0..columns {
        if column > 0 {
            out.push(',');
        }
        let _ = write!(out, "c{column}");
    }
    out.push('\n');

    let mut state = 0x2545_f491_4f6c_dd1d_u64;
    for _ in 0..rows {
        for column in 0..columns {
            if column > 0 {
                out.push(',');
            }
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let _ = write!(out, "{}", state % 100_000);
        }
        out.push('\n');
    }
    out
}

/// Parses a document produced by [`generate_csv`].
///
/// The first line is a header and is only used to count columns. When
/// `expected` is set, every line must have exactly that many fields.
pub fn parse_csv(input: &str, expected: Option<usize>) -> Result<CsvSummary, WorkloadError> {
    let mut lines = input.lines().filter(|line| !line.is_empty());
    let columns = match lines.next() {
        Some(header) => header.split(',').count(),
        None => {
            return Ok(CsvSummary {
                rows: 0,
                columns: 0,
                checksum: 0,
            });
        }
    };
    let expected = expected.unwrap_or(columns);
    if columns != expected {
        return Err(WorkloadError::RaggedRow {
            row: 0,
            found: columns,
            expected,
        });
    }

    let mut rows = 0;
    let mut checksum = 0u64;
    for (index, line) in lines.enumerate() {
        let row = index + 1;
        let mut found = 0;
        for (column, field) in line.split(',').enumerate() {
            let value = field
                .trim()
                .parse::<u64>()
                .map_err(|_| WorkloadError::InvalidNumber {
                    row,
                    column,
                    value: field.to_string(),
                })?;
            checksum = checksum.wrapping_mul(31).wrapping_add(value);
            found += 1;
        }
        if found != expected {
            return Err(WorkloadError::RaggedRow {
                row,
                found,
                expected,
            });
        }
        rows += 1;
    }

    Ok(CsvSummary {
        rows,
        columns,
        checksum,
    })
}

/// Init routine for pool workers. Reads `{"columns": N}` from the init data.
pub fn init_worker(data: Option<&InitData>) -> Result<(), WorkloadError> {
    let columns = data
        .and_then(|d| d.get("columns"))
        .and_then(InitData::as_u64)
        .and_then(|c| usize::try_from(c).ok())
        .filter(|&c| c > 0)
        .ok_or(WorkloadError::InvalidInitData)?;
    EXPECTED_COLUMNS.with(|c| c.set(Some(columns)));
    Ok(())
}

/// Pool routine. Uses the column count stored by [`init_worker`].
pub fn parse_job(input: &str) -> Result<CsvSummary, WorkloadError> {
    parse_csv(input, EXPECTED_COLUMNS.with(Cell::get))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generated_documents_parse() {
        let csv = generate_csv(100, 4);
        let summary = parse_csv(&csv, Some(4)).unwrap();
        assert_eq!(summary.rows, 100);
        assert_eq!(summary.columns, 4);
        assert_eq!(parse_csv(&csv, None).unwrap(), summary);
    }

    #[test]
    fn generation_is_deterministic() {
        assert_eq!(generate_csv(10, 3), generate_csv(10, 3));
    }

    #[test]
    fn empty_document_is_empty_summary() {
        let summary = parse_csv("", None).unwrap();
        assert_eq!(summary.rows, 0);
        assert_eq!(summary.checksum, 0);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let err = parse_csv("a,b\n1,2\n3\n", None).unwrap_err();
        assert_eq!(
            err,
            WorkloadError::RaggedRow {
                row: 2,
                found: 1,
                expected: 2
            }
        );
    }

    #[test]
    fn header_must_match_expected_columns() {
        let err = parse_csv("a,b\n1,2\n", Some(3)).unwrap_err();
        assert!(matches!(err, WorkloadError::RaggedRow { row: 0, .. }));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = parse_csv("a,b\n1,x\n", None).unwrap_err();
        assert_eq!(
            err,
            WorkloadError::InvalidNumber {
                row: 1,
                column: 1,
                value: "x".to_string()
            }
        );
    }

    #[test]
    fn init_worker_sets_the_thread_local() {
        init_worker(Some(&json!({ "columns": 2 }))).unwrap();
        assert!(parse_job("a,b\n1,2\n").is_ok());
        assert!(parse_job("a,b,c\n1,2,3\n").is_err());
    }

    #[test]
    fn init_worker_rejects_bad_data() {
        assert_eq!(init_worker(None), Err(WorkloadError::InvalidInitData));
        assert_eq!(
            init_worker(Some(&json!({ "columns": 0 }))),
            Err(WorkloadError::InvalidInitData)
        );
        assert_eq!(
            init_worker(Some(&json!("columns"))),
            Err(WorkloadError::InvalidInitData)
        );
    }
}
