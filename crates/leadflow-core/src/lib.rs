//! Core domain model and field parsers for Leadflow.

use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "leadflow-core";

/// Fixed origin tag for rows ingested from bulk CSV exports.
pub const CSV_SOURCE: &str = "csv";

#[derive(Debug, Error)]
pub enum RowError {
    #[error("row {row}: missing email address")]
    MissingEmail { row: u64 },
    #[error("row {row}: email {email:?} has no '@'")]
    MissingAtSign { row: u64, email: String },
    #[error("row {row}: email {email:?} has an empty local part")]
    EmptyLocalPart { row: u64, email: String },
    #[error("row {row}: email {email:?} has an unusable domain")]
    InvalidDomain { row: u64, email: String },
    #[error("row {row}: malformed CSV record: {reason}")]
    Malformed { row: u64, reason: String },
}

impl RowError {
    pub fn row(&self) -> u64 {
        match self {
            Self::MissingEmail { row }
            | Self::MissingAtSign { row, .. }
            | Self::EmptyLocalPart { row, .. }
            | Self::InvalidDomain { row, .. }
            | Self::Malformed { row, .. } => *row,
        }
    }
}

/// One raw CSV row of the bulk lead export, straight off the parser.
///
/// Empty cells deserialize to `None`, never to empty strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLeadRow {
    #[serde(rename = "Salutation", default, deserialize_with = "de_blank")]
    pub salutation: Option<String>,
    #[serde(rename = "First Name", default, deserialize_with = "de_blank")]
    pub first_name: Option<String>,
    #[serde(rename = "Last Name", default, deserialize_with = "de_blank")]
    pub last_name: Option<String>,
    #[serde(rename = "Email address", default, deserialize_with = "de_blank")]
    pub email: Option<String>,
    #[serde(rename = "Company", default, deserialize_with = "de_blank")]
    pub company: Option<String>,
    #[serde(rename = "Address", default, deserialize_with = "de_blank")]
    pub address: Option<String>,
    #[serde(rename = "Address Line 2", default, deserialize_with = "de_blank")]
    pub address_line2: Option<String>,
    #[serde(rename = "City", default, deserialize_with = "de_blank")]
    pub city: Option<String>,
    #[serde(rename = "State", default, deserialize_with = "de_blank")]
    pub state: Option<String>,
    #[serde(rename = "Country", default, deserialize_with = "de_blank")]
    pub country: Option<String>,
    #[serde(rename = "Zip Code", default, deserialize_with = "de_blank")]
    pub zip_code: Option<String>,
    #[serde(rename = "Phone", default, deserialize_with = "de_blank")]
    pub phone: Option<String>,
    #[serde(rename = "Mobile Phone", default, deserialize_with = "de_blank")]
    pub mobile_phone: Option<String>,
    #[serde(rename = "Industry", default, deserialize_with = "de_blank")]
    pub industry: Option<String>,
    #[serde(rename = "Job Title Level", default, deserialize_with = "de_blank")]
    pub job_title_level: Option<String>,
    #[serde(rename = "Job Title", default, deserialize_with = "de_blank")]
    pub job_title: Option<String>,
    #[serde(rename = "Department", default, deserialize_with = "de_blank")]
    pub department: Option<String>,
    #[serde(rename = "Employee Size", default, deserialize_with = "de_blank")]
    pub employee_size: Option<String>,
    #[serde(rename = "Revenue", default, deserialize_with = "de_blank")]
    pub revenue: Option<String>,
    #[serde(rename = "Job Title Link", default, deserialize_with = "de_blank")]
    pub job_title_link: Option<String>,
    #[serde(rename = "Employee Size Link", default, deserialize_with = "de_blank")]
    pub employee_size_link: Option<String>,
}

fn de_blank<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.and_then(|v| clean_value(&v)))
}

/// Trim a cell and collapse blank / placeholder values to `None`.
pub fn clean_value(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "null" | "none" | "n/a" | "na" => None,
        _ => Some(trimmed.to_string()),
    }
}

/// Read a lead export, returning parsed rows alongside per-row parse errors.
///
/// Row numbers are 1-based data rows (the header is row 0). A malformed
/// record is reported and skipped; it never aborts the read.
pub fn read_lead_rows<R: Read>(reader: R) -> (Vec<(u64, RawLeadRow)>, Vec<RowError>) {
    read_lead_rows_delim(reader, b',')
}

/// As [`read_lead_rows`] with an explicit delimiter, for tab-separated exports.
pub fn read_lead_rows_delim<R: Read>(
    reader: R,
    delimiter: u8,
) -> (Vec<(u64, RawLeadRow)>, Vec<RowError>) {
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut rows = Vec::new();
    let mut errors = Vec::new();
    for (idx, record) in csv_reader.deserialize::<RawLeadRow>().enumerate() {
        let row_no = idx as u64 + 1;
        match record {
            Ok(row) => rows.push((row_no, row)),
            Err(err) => errors.push(RowError::Malformed {
                row: row_no,
                reason: err.to_string(),
            }),
        }
    }
    (rows, errors)
}

/// Convenience wrapper over [`read_lead_rows`] for a file path. `.tsv`
/// files are read tab-separated, everything else comma-separated.
pub fn read_lead_file(path: &Path) -> std::io::Result<(Vec<(u64, RawLeadRow)>, Vec<RowError>)> {
    let delimiter = match path.extension() {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => b'\t',
        _ => b',',
    };
    let file = std::fs::File::open(path)?;
    Ok(read_lead_rows_delim(file, delimiter))
}

/// Extract the company identity domain from an email address.
///
/// Returns `(domain, email)` where the email may have been rewritten: a
/// dotless but plausible domain gets a `.com` suffix so that
/// `ravi@unionbankofindia` resolves to `unionbankofindia.com`.
pub fn extract_domain(row: u64, email: Option<&str>) -> Result<(String, String), RowError> {
    let email = match email.map(str::trim) {
        Some(e) if !e.is_empty() => e,
        _ => return Err(RowError::MissingEmail { row }),
    };

    let Some((local, raw_domain)) = email.split_once('@') else {
        return Err(RowError::MissingAtSign {
            row,
            email: email.to_string(),
        });
    };
    if local.trim().is_empty() {
        return Err(RowError::EmptyLocalPart {
            row,
            email: email.to_string(),
        });
    }

    let domain = raw_domain
        .trim()
        .trim_end_matches('.')
        .to_ascii_lowercase();

    if domain.contains('.') && domain.len() > 3 {
        return Ok((domain.clone(), format!("{local}@{domain}")));
    }

    // Dotless domains like "unionbankofindia" are common export artifacts.
    let plausible = domain.len() > 2
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if plausible {
        let fixed = format!("{domain}.com");
        return Ok((fixed.clone(), format!("{local}@{fixed}")));
    }

    Err(RowError::InvalidDomain {
        row,
        email: email.to_string(),
    })
}

/// Parse an employee-size cell into a `(min, max)` pair.
///
/// Accepted shapes: `"100-500"`, `"1000 to 5000"`, `"1000+"`,
/// `"10,001+ employees"`, plain integers. Junk values (URLs, department
/// names leaking into the column) yield `(None, None)`.
pub fn parse_employee_size(value: Option<&str>) -> (Option<i32>, Option<i32>) {
    let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return (None, None);
    };

    let lowered = raw.to_ascii_lowercase();
    const JUNK: [&str; 6] = ["http", "www", "linkedin.com", "sales", "marketing", "other"];
    if JUNK.iter().any(|j| lowered.contains(j)) {
        return (None, None);
    }

    let mut cleaned = lowered;
    for suffix in ["employees", "employee", "emp"] {
        if let Some(stripped) = cleaned.strip_suffix(suffix) {
            cleaned = stripped.trim().to_string();
            break;
        }
    }

    let parse_int = |s: &str| s.replace(',', "").trim().parse::<i32>().ok();

    for separator in ["-", " to ", " t0 ", "to", "t0"] {
        if let Some((lo, hi)) = cleaned.split_once(separator) {
            if let (Some(min), Some(max)) = (parse_int(lo), parse_int(hi)) {
                return (Some(min), Some(max));
            }
            return (None, None);
        }
    }

    if let Some(stripped) = cleaned.strip_suffix('+') {
        return (parse_int(stripped), None);
    }

    match parse_int(&cleaned) {
        Some(size) => (Some(size), Some(size)),
        None => (None, None),
    }
}

/// Parse a revenue cell into whole dollars.
///
/// Accepts `K`/`M`/`B` suffixes, `$`, `USD` and thousands separators:
/// `"$1.5M"` -> `1_500_000`. Plain numbers are taken at face value.
pub fn parse_revenue(value: Option<&str>) -> Option<i64> {
    let raw = value.map(str::trim).filter(|v| !v.is_empty())?;
    let cleaned = raw
        .to_ascii_uppercase()
        .replace("USD", "")
        .replace(['$', ','], "")
        .trim()
        .to_string();

    let (number, multiplier) = match cleaned.chars().last()? {
        'K' => (&cleaned[..cleaned.len() - 1], 1_000_f64),
        'M' => (&cleaned[..cleaned.len() - 1], 1_000_000_f64),
        'B' => (&cleaned[..cleaned.len() - 1], 1_000_000_000_f64),
        _ => (cleaned.as_str(), 1_f64),
    };

    let value: f64 = number.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier) as i64)
}

/// Normalize a phone cell to digits, keeping a leading `+`.
///
/// Values with fewer than 7 digits are treated as junk and dropped.
pub fn normalize_phone(value: Option<&str>) -> Option<String> {
    let raw = value.map(str::trim).filter(|v| !v.is_empty())?;
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 {
        return None;
    }
    if raw.starts_with('+') {
        Some(format!("+{digits}"))
    } else {
        Some(digits)
    }
}

/// Join two address lines with a single space, skipping blanks.
pub fn build_full_address(line1: Option<&str>, line2: Option<&str>) -> Option<String> {
    match (line1, line2) {
        (Some(a), Some(b)) => Some(format!("{a} {b}")),
        (Some(a), None) => Some(a.to_string()),
        (None, Some(b)) => Some(b.to_string()),
        (None, None) => None,
    }
}

/// A deduplicated organization, keyed by its email domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub domain: String,
    pub name: String,
    pub industry: Option<String>,
    pub min_employee_size: Option<i32>,
    pub max_employee_size: Option<i32>,
    pub employee_size_link: Option<String>,
    pub revenue: Option<i64>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub zip_code: Option<String>,
    pub phone: Option<String>,
    pub mobile_phone: Option<String>,
    pub external_source: String,
    pub external_id: String,
}

/// An individual contact, always owned by exactly one company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProspectRecord {
    pub salutation: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
    pub job_title: Option<String>,
    pub job_title_level: Option<String>,
    pub job_title_link: Option<String>,
    pub department: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub country_display: Option<String>,
    pub state_code: Option<String>,
    pub state_display: Option<String>,
    pub city_code: Option<String>,
    pub city_display: Option<String>,
    pub zip_code: Option<String>,
    pub phone: Option<String>,
    pub mobile_phone: Option<String>,
    pub company_domain: String,
    pub external_source: String,
    pub external_id: String,
}

/// Normalize one raw row into its company / prospect pair.
///
/// The company external id is stable per domain so re-ingestion upserts
/// rather than duplicates; the prospect external id is the processed email.
pub fn normalize_row(row_no: u64, row: &RawLeadRow) -> Result<(CompanyRecord, ProspectRecord), RowError> {
    let (domain, email) = extract_domain(row_no, row.email.as_deref())?;
    let (min_size, max_size) = parse_employee_size(row.employee_size.as_deref());
    let revenue = parse_revenue(row.revenue.as_deref());
    let address = build_full_address(row.address.as_deref(), row.address_line2.as_deref());
    let phone = normalize_phone(row.phone.as_deref());
    let mobile_phone = normalize_phone(row.mobile_phone.as_deref());

    let company = CompanyRecord {
        name: row
            .company
            .clone()
            .unwrap_or_else(|| format!("Company-{domain}")),
        industry: row.industry.clone(),
        min_employee_size: min_size,
        max_employee_size: max_size,
        employee_size_link: row.employee_size_link.clone(),
        revenue,
        address: address.clone(),
        city: row.city.clone(),
        state: row.state.clone(),
        country: row.country.clone(),
        zip_code: row.zip_code.clone(),
        phone: phone.clone(),
        mobile_phone: mobile_phone.clone(),
        external_source: CSV_SOURCE.to_string(),
        external_id: format!("company_{domain}"),
        domain: domain.clone(),
    };

    let prospect = ProspectRecord {
        salutation: row.salutation.clone(),
        first_name: row.first_name.clone(),
        last_name: row.last_name.clone(),
        email: email.clone(),
        job_title: row.job_title.clone(),
        job_title_level: row.job_title_level.clone(),
        job_title_link: row.job_title_link.clone(),
        department: row.department.clone(),
        address,
        city: row.city.clone(),
        state: row.state.clone(),
        country: row.country.clone(),
        country_code: None,
        country_display: None,
        state_code: None,
        state_display: None,
        city_code: None,
        city_display: None,
        zip_code: row.zip_code.clone(),
        phone,
        mobile_phone,
        company_domain: domain,
        external_source: CSV_SOURCE.to_string(),
        external_id: email,
    };

    Ok((company, prospect))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn domain_extraction_lowercases_after_at() {
        let (domain, email) = extract_domain(1, Some("laura.maggioni@st.com")).unwrap();
        assert_eq!(domain, "st.com");
        assert_eq!(email, "laura.maggioni@st.com");

        let (domain, _) = extract_domain(1, Some("Bob@Example.COM")).unwrap();
        assert_eq!(domain, "example.com");
    }

    #[test]
    fn dotless_domain_gets_com_suffix() {
        let (domain, email) = extract_domain(3, Some("ravi.katta@unionbankofindia")).unwrap();
        assert_eq!(domain, "unionbankofindia.com");
        assert_eq!(email, "ravi.katta@unionbankofindia.com");
    }

    #[test]
    fn bad_emails_are_row_errors() {
        assert!(matches!(
            extract_domain(7, None),
            Err(RowError::MissingEmail { row: 7 })
        ));
        assert!(matches!(
            extract_domain(8, Some("not-an-email")),
            Err(RowError::MissingAtSign { row: 8, .. })
        ));
        assert!(matches!(
            extract_domain(9, Some("@acme.com")),
            Err(RowError::EmptyLocalPart { row: 9, .. })
        ));
        assert!(matches!(
            extract_domain(10, Some("x@!")),
            Err(RowError::InvalidDomain { row: 10, .. })
        ));
    }

    #[test]
    fn employee_size_range_shapes() {
        assert_eq!(parse_employee_size(Some("100-500")), (Some(100), Some(500)));
        assert_eq!(
            parse_employee_size(Some("1000 to 5000")),
            (Some(1000), Some(5000))
        );
        assert_eq!(parse_employee_size(Some("1000+")), (Some(1000), None));
        assert_eq!(
            parse_employee_size(Some("10,001+ employees")),
            (Some(10001), None)
        );
        assert_eq!(parse_employee_size(Some("250")), (Some(250), Some(250)));
        assert_eq!(parse_employee_size(Some("11 TO 50")), (Some(11), Some(50)));
    }

    #[test]
    fn employee_size_junk_is_none() {
        assert_eq!(parse_employee_size(Some("linkedin.com/acme")), (None, None));
        assert_eq!(parse_employee_size(Some("Sales")), (None, None));
        assert_eq!(parse_employee_size(None), (None, None));
        assert_eq!(parse_employee_size(Some("ten-twenty")), (None, None));
    }

    #[test]
    fn phone_normalization_keeps_digits_and_plus() {
        assert_eq!(
            normalize_phone(Some("+1 (415) 555-0132")),
            Some("+14155550132".to_string())
        );
        assert_eq!(
            normalize_phone(Some("415.555.0132")),
            Some("4155550132".to_string())
        );
        assert_eq!(normalize_phone(Some("ext. 42")), None);
        assert_eq!(normalize_phone(None), None);
    }

    #[test]
    fn revenue_suffixes() {
        assert_eq!(parse_revenue(Some("100K")), Some(100_000));
        assert_eq!(parse_revenue(Some("$1.5M")), Some(1_500_000));
        assert_eq!(parse_revenue(Some("2B")), Some(2_000_000_000));
        assert_eq!(parse_revenue(Some("500")), Some(500));
        assert_eq!(parse_revenue(Some("500,000 USD")), Some(500_000));
        assert_eq!(parse_revenue(Some("unknown")), None);
        assert_eq!(parse_revenue(None), None);
    }

    #[test]
    fn empty_cells_become_none_not_empty_strings() {
        let csv = "Salutation,First Name,Last Name,Email address,Company,Address,City,State,Country,Zip Code,Phone,Mobile Phone,Industry,Job Title Level,Job Title,Department,Employee Size,Job Title Link,Employee Size Link\n\
                   Ms.,Laura,Maggioni,laura.maggioni@st.com,ST,,Milan,,Italy,,,,Semiconductors,,Engineer,,100-500,,\n";
        let (rows, errors) = read_lead_rows(Cursor::new(csv));
        assert!(errors.is_empty());
        assert_eq!(rows.len(), 1);
        let (row_no, row) = &rows[0];
        assert_eq!(*row_no, 1);
        assert_eq!(row.address, None);
        assert_eq!(row.state, None);
        assert_eq!(row.city.as_deref(), Some("Milan"));
    }

    #[test]
    fn tab_separated_exports_read_with_tab_delimiter() {
        let tsv = "Email address\tCompany\na@acme.com\tAcme\n";
        let (rows, errors) = read_lead_rows_delim(Cursor::new(tsv), b'\t');
        assert!(errors.is_empty());
        assert_eq!(rows[0].1.email.as_deref(), Some("a@acme.com"));
        assert_eq!(rows[0].1.company.as_deref(), Some("Acme"));
    }

    #[test]
    fn normalize_builds_linked_pair() {
        let row = RawLeadRow {
            email: Some("laura.maggioni@st.com".into()),
            company: Some("STMicroelectronics".into()),
            employee_size: Some("10,001+".into()),
            revenue: Some("10M".into()),
            address: Some("Via Olivetti 2".into()),
            ..Default::default()
        };
        let (company, prospect) = normalize_row(1, &row).unwrap();
        assert_eq!(company.domain, "st.com");
        assert_eq!(company.external_id, "company_st.com");
        assert_eq!(company.min_employee_size, Some(10001));
        assert_eq!(company.max_employee_size, None);
        assert_eq!(company.revenue, Some(10_000_000));
        assert_eq!(prospect.company_domain, "st.com");
        assert_eq!(prospect.external_id, "laura.maggioni@st.com");
        assert_eq!(prospect.external_source, CSV_SOURCE);
    }

    #[test]
    fn missing_company_name_falls_back_to_domain() {
        let row = RawLeadRow {
            email: Some("a@acme.io".into()),
            ..Default::default()
        };
        let (company, _) = normalize_row(1, &row).unwrap();
        assert_eq!(company.name, "Company-acme.io");
    }
}
