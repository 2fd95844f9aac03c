use cloud::warehouse::ResultSet;
use serde_json::Value;

/// Renders a result set as CSV: a header of column names in schema order,
/// then one record per row with every cell stringified and nulls left empty.
pub fn to_csv(results: &ResultSet) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&results.columns)?;
    for row in &results.rows {
        writer.write_record(row.iter().map(cell_text))?;
    }
    writer.into_inner().map_err(|e| e.into_error().into())
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
