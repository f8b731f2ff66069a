//! Format tables with a stupid API: give it `Vec<String>` where each
//! string is one tab-separated row (the first row is the header), get
//! back nicely aligned columns printed to stdout.

/// Print `rows` as a table, padding each column to the width of its
/// widest cell. A cell containing no tab character prints on its own,
/// unindented line (used for section separators between groups of rows).
pub fn format_table(rows: Vec<String>) {
	print!("{}", format_table_to_string(rows));
}

/// As [`format_table`], but returns the rendered text instead of printing
/// it, for callers that want to capture or test the output.
pub fn format_table_to_string(rows: Vec<String>) -> String {
	let split: Vec<Vec<&str>> = rows.iter().map(|r| r.split('\t').collect()).collect();

	let n_cols = split.iter().map(|r| r.len()).max().unwrap_or(0);
	let mut widths = vec![0usize; n_cols];
	for row in &split {
		if row.len() > 1 {
			for (i, cell) in row.iter().enumerate() {
				widths[i] = widths[i].max(cell.chars().count());
			}
		}
	}

	let mut out = String::new();
	for row in &split {
		if row.len() <= 1 {
			out.push_str(row.first().copied().unwrap_or(""));
			out.push('\n');
			continue;
		}
		for (i, cell) in row.iter().enumerate() {
			if i + 1 == row.len() {
				out.push_str(cell);
			} else {
				out.push_str(&format!("{:width$}  ", cell, width = widths[i]));
			}
		}
		out.push('\n');
	}
	out
}
