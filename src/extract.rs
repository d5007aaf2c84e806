//! Source extraction from Form ADV period directories.
//!
//! A source root holds one directory per reporting period
//! (`ADV_Filing_Data_*` / `adv-filing-data-*`), each containing delimited
//! CSV extracts: `IA_ADV_Base_A_*` adviser base records,
//! `IA_Schedule_A_B_*` control persons, and `IA_Schedule_D_7B1_*` private
//! funds. Columns are addressed by header name, never position, and a
//! missing optional column reads as null for every row. Extraction is a
//! pure transformation: no datastore access happens here.

use anyhow::{bail, Result};
use csv::ByteRecord;
use globset::Glob;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::models::{AdviserRecord, ControlPersonRecord, PrivateFundRecord};
use crate::normalize::{
    classify_fund_type, clean_value, normalize_phone, normalize_website, parse_count, parse_flag,
    parse_money, synthetic_key,
};

/// Everything extracted from one reporting-period directory.
#[derive(Debug, Default)]
pub struct PeriodExtract {
    pub period: String,
    pub advisers: Vec<AdviserRecord>,
    pub control_persons: Vec<ControlPersonRecord>,
    pub private_funds: Vec<PrivateFundRecord>,
    /// Rows that could not be parsed or carried no usable identity.
    pub skipped_rows: u64,
}

/// Service flags from Part 1A Item 5.G.
const SERVICE_COLUMNS: &[(&str, &str)] = &[
    ("5G1", "Financial Planning"),
    ("5G2", "Portfolio Management (Individuals)"),
    ("5G3", "Portfolio Management (Businesses)"),
    ("5G4", "Pension Consulting"),
    ("5G5", "Selection of Other Advisers"),
    ("5G6", "Publication of Newsletters"),
    ("5G7", "Other Services"),
];

/// Client-type count columns from Part 1A Item 5.D.
const CLIENT_COLUMNS: &[(&str, &str)] = &[
    ("5D1a", "Individuals (non-high net worth)"),
    ("5D1b", "High net worth individuals"),
    ("5D1c", "Banking or thrift institutions"),
    ("5D1d", "Investment companies"),
    ("5D1e", "Business development companies"),
    ("5D1f", "Pooled investment vehicles"),
];

/// Find reporting-period directories under the source root, sorted by name
/// so periods ingest in chronological order.
pub fn discover_periods(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        bail!("Source root does not exist: {}", root.display());
    }

    let mut periods = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("ADV_Filing_Data_") || name.starts_with("adv-filing-data-") {
            periods.push(entry.path());
        }
    }

    periods.sort();
    Ok(periods)
}

/// Extract all record types from one period directory.
pub fn extract_period(dir: &Path, ingest: &IngestConfig) -> Result<PeriodExtract> {
    let period = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let base_matcher = Glob::new("IA_ADV_Base_A_*.csv")?.compile_matcher();
    let people_matcher = Glob::new("IA_Schedule_A_B_*.csv")?.compile_matcher();
    let funds_matcher = Glob::new("IA_Schedule_D_7B1_*.csv")?.compile_matcher();

    let mut extract = PeriodExtract {
        period: period.clone(),
        ..Default::default()
    };

    for path in csv_files(dir) {
        let file_name = match path.file_name() {
            Some(n) => n.to_string_lossy().to_string(),
            None => continue,
        };

        if base_matcher.is_match(&file_name) {
            extract_base_file(&path, &file_name, &period, ingest, &mut extract)?;
        } else if people_matcher.is_match(&file_name) {
            extract_people_file(&path, &mut extract)?;
        } else if funds_matcher.is_match(&file_name) {
            extract_funds_file(&path, &mut extract)?;
        }
    }

    Ok(extract)
}

/// All CSV files under a period directory (extracts are sometimes nested
/// one level deep after unzipping).
fn csv_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();
    files
}

fn extract_base_file(
    path: &Path,
    file_name: &str,
    period: &str,
    ingest: &IngestConfig,
    out: &mut PeriodExtract,
) -> Result<()> {
    let (cols, rows, skipped) = read_csv(path)?;
    out.skipped_rows += skipped;

    for row in &rows {
        match parse_base_row(&cols, row, file_name, period, ingest) {
            Some(record) => out.advisers.push(record),
            None => out.skipped_rows += 1,
        }
    }

    Ok(())
}

fn parse_base_row(
    cols: &Columns,
    row: &ByteRecord,
    file_name: &str,
    period: &str,
    ingest: &IngestConfig,
) -> Option<AdviserRecord> {
    let legal_name = cols.get(row, "1A").or_else(|| cols.get(row, "1B1"));
    let crd = cols.get(row, "1E1");
    let city = cols.get(row, "1F1-City");
    let state = cols.get(row, "1F1-State").map(|s| s.to_uppercase());

    // A row with neither a CRD number nor a firm name is unaddressable.
    let crd_number = match crd {
        Some(c) => c,
        None => {
            let name = legal_name.as_deref()?;
            synthetic_key(
                name,
                city.as_deref().unwrap_or(""),
                state.as_deref().unwrap_or(""),
            )
        }
    };

    let mut aum = cols.raw(row, "5F2f").as_deref().and_then(parse_money);
    if ingest.aum_in_thousands {
        aum = aum.map(|v| v.saturating_mul(1000));
    }

    let services = flag_list(cols, row, SERVICE_COLUMNS);
    let client_types = count_list(cols, row, CLIENT_COLUMNS);

    Some(AdviserRecord {
        crd_number,
        legal_name,
        sec_number: cols.get(row, "1P"),
        street1: cols.get(row, "1F1-Street 1"),
        street2: cols.get(row, "1F1-Street 2"),
        city,
        state,
        postal: cols.get(row, "1F1-Postal"),
        phone: cols.raw(row, "1F1-Phone").as_deref().and_then(normalize_phone),
        fax: cols.raw(row, "1F1-Fax").as_deref().and_then(normalize_phone),
        website: cols.raw(row, "1I").as_deref().and_then(normalize_website),
        aum,
        employee_count: cols.raw(row, "5B1a").as_deref().and_then(parse_count),
        services,
        client_types,
        has_private_funds: cols
            .raw(row, "7B")
            .as_deref()
            .map(parse_flag)
            .unwrap_or(false),
        filing_id: cols.raw(row, "FilingID").as_deref().and_then(parse_count),
        filing_date: cols
            .raw(row, "DateSubmitted")
            .as_deref()
            .and_then(normalize_filing_date),
        filing_period: Some(period.to_string()),
        source_file: Some(file_name.to_string()),
    })
}

fn extract_people_file(path: &Path, out: &mut PeriodExtract) -> Result<()> {
    let (cols, rows, skipped) = read_csv(path)?;
    out.skipped_rows += skipped;

    for row in &rows {
        let adviser_crd = match cols.get(row, "1E1") {
            Some(c) => c,
            None => {
                out.skipped_rows += 1;
                continue;
            }
        };
        let person_name = match cols.get(row, "Full Legal Name") {
            Some(n) => n,
            None => {
                out.skipped_rows += 1;
                continue;
            }
        };

        out.control_persons.push(ControlPersonRecord {
            adviser_crd,
            filing_id: cols.raw(row, "FilingID").as_deref().and_then(parse_count),
            person_name,
            title: cols
                .get(row, "Title or Status")
                .unwrap_or_else(|| "Unknown".to_string()),
            ownership_code: cols.get(row, "Ownership Code"),
            ownership_percent: cols
                .raw(row, "Ownership Percent")
                .and_then(|v| v.parse::<f64>().ok()),
        });
    }

    Ok(())
}

fn extract_funds_file(path: &Path, out: &mut PeriodExtract) -> Result<()> {
    let (cols, rows, skipped) = read_csv(path)?;
    out.skipped_rows += skipped;

    for row in &rows {
        let adviser_crd = match cols.get(row, "1E1") {
            Some(c) => c,
            None => {
                out.skipped_rows += 1;
                continue;
            }
        };
        let filing_id = match cols.raw(row, "FilingID").as_deref().and_then(parse_count) {
            Some(id) => id,
            None => {
                out.skipped_rows += 1;
                continue;
            }
        };
        let reference_id = match cols.get(row, "Fund ID") {
            Some(id) => id,
            None => {
                out.skipped_rows += 1;
                continue;
            }
        };

        out.private_funds.push(PrivateFundRecord {
            adviser_crd,
            filing_id,
            reference_id,
            fund_name: cols.get(row, "Fund Name"),
            fund_type: classify_fund_type(cols.raw(row, "Fund Type").as_deref().unwrap_or(""))
                .to_string(),
            gross_asset_value: cols
                .raw(row, "Gross Asset Value")
                .as_deref()
                .and_then(parse_money),
            min_investment: cols
                .raw(row, "Minimum Investment")
                .as_deref()
                .and_then(parse_money),
            is_master_fund: cols.raw(row, "Master Fund").as_deref().map(parse_flag),
            is_fund_of_funds: cols.raw(row, "Fund of Funds").as_deref().map(parse_flag),
            exclusion_type: cols.get(row, "Exclusion"),
        });
    }

    Ok(())
}

/// Comma list of service labels whose flag column reads `Y`.
fn flag_list(cols: &Columns, row: &ByteRecord, columns: &[(&str, &str)]) -> Option<String> {
    let labels: Vec<&str> = columns
        .iter()
        .filter(|(col, _)| cols.raw(row, col).as_deref().map(parse_flag).unwrap_or(false))
        .map(|(_, label)| *label)
        .collect();
    if labels.is_empty() {
        None
    } else {
        Some(labels.join(", "))
    }
}

/// Comma list of client-type labels whose count column is positive.
fn count_list(cols: &Columns, row: &ByteRecord, columns: &[(&str, &str)]) -> Option<String> {
    let labels: Vec<&str> = columns
        .iter()
        .filter(|(col, _)| {
            cols.raw(row, col)
                .as_deref()
                .and_then(parse_count)
                .map(|n| n > 0)
                .unwrap_or(false)
        })
        .map(|(_, label)| *label)
        .collect();
    if labels.is_empty() {
        None
    } else {
        Some(labels.join(", "))
    }
}

/// Bring `DateSubmitted` to ISO form; unparseable dates are dropped.
fn normalize_filing_date(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    for format in ["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y"] {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(trimmed, format) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    None
}

// ============ CSV access by header name ============

/// Header-name index over a CSV file. The extracts are Latin-1, so fields
/// are decoded lossily rather than assumed UTF-8.
struct Columns {
    index: HashMap<String, usize>,
}

impl Columns {
    fn from_headers(headers: &ByteRecord) -> Self {
        let index = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (String::from_utf8_lossy(h).trim().to_string(), i))
            .collect();
        Self { index }
    }

    /// Raw trimmed field; empty cells and absent columns read as `None`.
    fn raw(&self, record: &ByteRecord, name: &str) -> Option<String> {
        let idx = *self.index.get(name)?;
        let field = record.get(idx)?;
        let value = String::from_utf8_lossy(field).trim().to_string();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }

    /// Like [`Columns::raw`] but with filler values (`N/A`, `NONE`, …)
    /// treated as null.
    fn get(&self, record: &ByteRecord, name: &str) -> Option<String> {
        self.raw(record, name).as_deref().and_then(clean_value)
    }
}

fn read_csv(path: &Path) -> Result<(Columns, Vec<ByteRecord>, u64)> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.byte_headers()?.clone();
    let cols = Columns::from_headers(&headers);

    let mut rows = Vec::new();
    let mut skipped = 0u64;
    for result in reader.byte_records() {
        match result {
            Ok(record) => rows.push(record),
            Err(_) => skipped += 1,
        }
    }

    Ok((cols, rows, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_period(dir: &Path, base_csv: &str) -> PathBuf {
        let period = dir.join("ADV_Filing_Data_2024_03");
        fs::create_dir_all(&period).unwrap();
        fs::write(period.join("IA_ADV_Base_A_20240301.csv"), base_csv).unwrap();
        period
    }

    #[test]
    fn discovers_only_period_directories() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("ADV_Filing_Data_2024_03")).unwrap();
        fs::create_dir(tmp.path().join("adv-filing-data-2024-06")).unwrap();
        fs::create_dir(tmp.path().join("brochures")).unwrap();
        fs::write(tmp.path().join("notes.txt"), "x").unwrap();

        let periods = discover_periods(tmp.path()).unwrap();
        assert_eq!(periods.len(), 2);
    }

    #[test]
    fn reads_columns_by_name_not_position() {
        let tmp = tempfile::tempdir().unwrap();
        // Column order differs from the usual extract layout on purpose.
        let period = write_period(
            tmp.path(),
            "1F1-City,1A,1E1,5F2f,1F1-State,FilingID\n\
             ST. LOUIS,Acme Capital LLC,100001,5000000,MO,9001\n",
        );

        let extract = extract_period(&period, &IngestConfig::default()).unwrap();
        assert_eq!(extract.advisers.len(), 1);
        let a = &extract.advisers[0];
        assert_eq!(a.crd_number, "100001");
        assert_eq!(a.legal_name.as_deref(), Some("Acme Capital LLC"));
        assert_eq!(a.state.as_deref(), Some("MO"));
        assert_eq!(a.aum, Some(5_000_000));
        assert_eq!(a.filing_id, Some(9001));
    }

    #[test]
    fn missing_optional_columns_read_as_null() {
        let tmp = tempfile::tempdir().unwrap();
        let period = write_period(tmp.path(), "1A,1E1\nAcme Capital LLC,100001\n");

        let extract = extract_period(&period, &IngestConfig::default()).unwrap();
        let a = &extract.advisers[0];
        assert_eq!(a.aum, None);
        assert_eq!(a.city, None);
        assert_eq!(a.phone, None);
        assert_eq!(a.services, None);
    }

    #[test]
    fn row_without_identity_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let period = write_period(
            tmp.path(),
            "1A,1E1,1F1-City\n,,SPRINGFIELD\nAcme Capital LLC,100001,ST. LOUIS\n",
        );

        let extract = extract_period(&period, &IngestConfig::default()).unwrap();
        assert_eq!(extract.advisers.len(), 1);
        assert_eq!(extract.skipped_rows, 1);
    }

    #[test]
    fn missing_crd_gets_synthetic_key() {
        let tmp = tempfile::tempdir().unwrap();
        let period = write_period(
            tmp.path(),
            "1A,1E1,1F1-City,1F1-State\nAcme Capital LLC,,ST. LOUIS,MO\n",
        );

        let extract = extract_period(&period, &IngestConfig::default()).unwrap();
        assert!(extract.advisers[0].crd_number.starts_with("GEN_"));
    }

    #[test]
    fn services_and_clients_derive_from_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let period = write_period(
            tmp.path(),
            "1A,1E1,5G1,5G4,5D1b\nAcme Capital LLC,100001,Y,Y,12\n",
        );

        let extract = extract_period(&period, &IngestConfig::default()).unwrap();
        let a = &extract.advisers[0];
        assert_eq!(
            a.services.as_deref(),
            Some("Financial Planning, Pension Consulting")
        );
        assert_eq!(
            a.client_types.as_deref(),
            Some("High net worth individuals")
        );
    }

    #[test]
    fn aum_in_thousands_scales() {
        let tmp = tempfile::tempdir().unwrap();
        let period = write_period(tmp.path(), "1A,1E1,5F2f\nAcme Capital LLC,100001,1800\n");

        let ingest = IngestConfig {
            aum_in_thousands: true,
        };
        let extract = extract_period(&period, &ingest).unwrap();
        assert_eq!(extract.advisers[0].aum, Some(1_800_000));
    }

    #[test]
    fn schedule_files_parse_people_and_funds() {
        let tmp = tempfile::tempdir().unwrap();
        let period = write_period(tmp.path(), "1A,1E1\nAcme Capital LLC,100001\n");
        fs::write(
            period.join("IA_Schedule_A_B_20240301.csv"),
            "FilingID,1E1,Full Legal Name,Title or Status,Ownership Percent\n\
             9001,100001,SMITH JANE,MANAGING MEMBER,75.0\n",
        )
        .unwrap();
        fs::write(
            period.join("IA_Schedule_D_7B1_20240301.csv"),
            "FilingID,1E1,Fund ID,Fund Name,Fund Type,Gross Asset Value,Master Fund\n\
             9001,100001,805-1111,Acme Opportunities LP,hedge,25000000,N\n",
        )
        .unwrap();

        let extract = extract_period(&period, &IngestConfig::default()).unwrap();
        assert_eq!(extract.control_persons.len(), 1);
        assert_eq!(extract.control_persons[0].person_name, "SMITH JANE");
        assert_eq!(extract.control_persons[0].ownership_percent, Some(75.0));

        assert_eq!(extract.private_funds.len(), 1);
        let f = &extract.private_funds[0];
        assert_eq!(f.reference_id, "805-1111");
        assert_eq!(f.fund_type, "Hedge Fund");
        assert_eq!(f.gross_asset_value, Some(25_000_000));
        assert_eq!(f.is_master_fund, Some(false));
    }

    #[test]
    fn filing_date_normalizes_to_iso() {
        assert_eq!(
            normalize_filing_date("03/31/2024"),
            Some("2024-03-31".to_string())
        );
        assert_eq!(
            normalize_filing_date("2024-03-31"),
            Some("2024-03-31".to_string())
        );
        assert_eq!(normalize_filing_date("yesterday"), None);
    }
}
