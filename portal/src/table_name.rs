use std::fmt;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid table name {0:?}: only letters, digits and underscores are allowed")]
pub struct InvalidTableName(pub String);

/// A warehouse table name that is safe to splice into SQL.
///
/// Every value matches `^[A-Za-z0-9_]+$`; the only ways to build one are
/// [`TableName::parse`] and [`TableName::from_filename`], so holding a
/// `TableName` is proof the check ran.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
    pub fn parse(raw: &str) -> Result<Self, InvalidTableName> {
        let valid = !raw.is_empty()
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_');
        if valid {
            Ok(TableName(raw.to_string()))
        } else {
            Err(InvalidTableName(raw.to_string()))
        }
    }

    /// Derives the table name from an uploaded file name: directories are
    /// dropped, the last extension is stripped, spaces become underscores and
    /// the result is lower-cased.
    pub fn from_filename(filename: &str) -> Result<Self, InvalidTableName> {
        let stem = file_stem(base_name(filename));
        Self::parse(&stem.replace(' ', "_").to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Table holding the latest preview of this one.
    pub fn analysis(&self) -> TableName {
        TableName(format!("{}_analysis", self.0))
    }

    /// View publishing `report_id` over this table. Report ids are static
    /// identifiers from the catalog.
    pub fn view(&self, report_id: &str) -> TableName {
        TableName(format!("{}__{}_v", self.0, report_id))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last path component, accepting both separators browsers send.
pub fn base_name(filename: &str) -> &str {
    filename.rsplit(['/', '\\']).next().unwrap_or(filename)
}

/// `name` without its last extension.
pub fn file_stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// Lower-cased last extension, without the dot.
pub fn extension(name: &str) -> Option<String> {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => Some(ext.to_ascii_lowercase()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(TableName::parse("sales_2024").unwrap().as_str(), "sales_2024");
        assert!(TableName::parse("Sales").is_ok());
        for bad in ["", "sales-2024", "sales;DROP", "a.b", "with space", "`x`", "é"] {
            assert_eq!(TableName::parse(bad), Err(InvalidTableName(bad.to_string())));
        }
    }

    #[test]
    fn test_from_filename() {
        let cases = [
            ("sales.csv", "sales"),
            ("Q1 Report.xlsx", "q1_report"),
            ("C:\\Users\\me\\Sales.CSV", "sales"),
            ("dir/sub/orders.json", "orders"),
            ("noext", "noext"),
        ];
        for (filename, expected) in cases {
            assert_eq!(TableName::from_filename(filename).unwrap().as_str(), expected);
        }

        assert!(TableName::from_filename("archive.tar.gz").is_err());
        assert!(TableName::from_filename(".csv").is_err());
        assert!(TableName::from_filename("résumé.csv").is_err());
    }

    #[test]
    fn test_derived_names() {
        let table = TableName::parse("sales").unwrap();
        assert_eq!(table.analysis().as_str(), "sales_analysis");
        assert_eq!(table.view("dept_totals").as_str(), "sales__dept_totals_v");
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("a.XLSX").as_deref(), Some("xlsx"));
        assert_eq!(extension("a.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension("noext"), None);
        assert_eq!(extension(".bashrc"), None);
        assert_eq!(file_stem("Q1 Report.xlsx"), "Q1 Report");
        assert_eq!(base_name("a/b\\c.csv"), "c.csv");
    }
}
