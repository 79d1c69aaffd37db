use std::io::{self, Write};

use serde_json::Value;

/// Print a term result to the provided writer.
///
/// Arrays of objects are laid out as a table with one column per field,
/// other arrays one element per line, anything else as compact JSON.
pub fn print_value<W: Write>(value: &Value, w: &mut W) -> io::Result<()> {
    let Value::Array(items) = value else {
        return writeln!(w, "{value}");
    };
    if items.is_empty() {
        return writeln!(w, "(0 rows)");
    }
    if !items.iter().all(Value::is_object) {
        for item in items {
            writeln!(w, "{}", cell(item))?;
        }
        return writeln!(w, "({} rows)", items.len());
    }

    let mut cols: Vec<&str> = items
        .iter()
        .filter_map(Value::as_object)
        .flat_map(|row| row.keys().map(String::as_str))
        .collect();
    cols.sort();
    cols.dedup();

    let index_width = items.len().to_string().len();
    let col_widths: Vec<usize> = cols
        .iter()
        .map(|c| {
            let max_val = items
                .iter()
                .map(|r| r.get(*c).map(|v| cell(v).len()).unwrap_or(0))
                .max()
                .unwrap_or(0);
            std::cmp::max(c.len(), max_val)
        })
        .collect();

    let mut header = format!("{:>width$}", "", width = index_width);
    for (c, w_width) in cols.iter().zip(col_widths.iter()) {
        header.push_str(&format!(" {:<width$}", c, width = w_width));
    }
    writeln!(w, "{}", header.trim_end())?;

    for (i, row) in items.iter().enumerate() {
        let mut line = format!("{:>width$}", i, width = index_width);
        for (c, w_width) in cols.iter().zip(col_widths.iter()) {
            let val = row.get(*c).map(cell).unwrap_or_default();
            line.push_str(&format!(" {:<width$}", val, width = w_width));
        }
        writeln!(w, "{}", line.trim_end())?;
    }
    writeln!(w, "({} rows)", items.len())
}

/// Strings print bare, everything else as JSON.
fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(value: Value) -> String {
        let mut buf: Vec<u8> = Vec::new();
        print_value(&value, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn rows_are_tabulated() {
        let output = render(json!([{"id": 1, "name": "ann"}, {"id": 22}]));
        let expected = "  id name\n0 1  ann\n1 22\n(2 rows)\n";
        assert_eq!(output, expected);
    }

    #[test]
    fn names_and_scalars() {
        assert_eq!(render(json!(["a", "b"])), "a\nb\n(2 rows)\n");
        assert_eq!(render(json!([])), "(0 rows)\n");
        assert_eq!(render(json!({"created": 1})), "{\"created\":1}\n");
        assert_eq!(render(Value::Null), "null\n");
    }
}
