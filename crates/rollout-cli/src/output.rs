use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

/// Plain-text listing. Counts and sizes are right-aligned so digits line up.
pub struct Table {
    titles: Vec<&'static str>,
    right: Vec<bool>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(titles: &[&'static str]) -> Self {
        Self {
            titles: titles.to_vec(),
            right: vec![false; titles.len()],
            rows: Vec::new(),
        }
    }

    /// Right-align the named columns.
    pub fn numeric(mut self, titles: &[&str]) -> Self {
        for (i, title) in self.titles.iter().enumerate() {
            if titles.contains(title) {
                self.right[i] = true;
            }
        }
        self
    }

    /// Missing cells render as `-`; extra cells are dropped.
    pub fn row(&mut self, mut cells: Vec<String>) {
        cells.resize(self.titles.len(), "-".to_string());
        self.rows.push(cells);
    }

    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self.titles.iter().map(|t| t.len()).collect();
        for row in &self.rows {
            for (w, cell) in widths.iter_mut().zip(row) {
                *w = (*w).max(cell.chars().count());
            }
        }

        let mut out = String::new();
        let titles = self.titles.iter().map(|t| t.to_string()).collect::<Vec<_>>();
        for line in std::iter::once(&titles).chain(&self.rows) {
            let cells: Vec<String> = line
                .iter()
                .zip(&widths)
                .zip(&self.right)
                .map(|((cell, &w), &right)| {
                    if right {
                        format!("{cell:>w$}")
                    } else {
                        format!("{cell:<w$}")
                    }
                })
                .collect();
            out.push_str(cells.join("  ").trim_end());
            out.push('\n');
        }
        out
    }

    pub fn print(&self) {
        print!("{}", self.render());
    }
}

/// `-` for absent values in tables.
pub fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

pub fn timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Dump sizes in binary units, one decimal above a KiB.
pub fn bytes(size: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if size < 1024 {
        return format!("{size} B");
    }
    let mut value = size as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_columns_align_right() {
        let mut table = Table::new(&["ID", "SIZE"]).numeric(&["SIZE"]);
        table.row(vec!["b1".into(), "5 B".into()]);
        table.row(vec!["b22".into(), "1.5 KiB".into()]);
        assert_eq!(
            table.render(),
            "ID      SIZE\nb1       5 B\nb22  1.5 KiB\n"
        );
    }

    #[test]
    fn short_rows_are_padded_with_dashes() {
        let mut table = Table::new(&["DOMAIN", "PORT", "TLS"]);
        table.row(vec!["a.example.com".into()]);
        let rendered = table.render();
        let line = rendered.lines().nth(1).unwrap();
        assert_eq!(line, "a.example.com  -     -");
    }

    #[test]
    fn width_counts_characters() {
        let mut table = Table::new(&["T", "X"]);
        table.row(vec!["é".into(), "1".into()]);
        assert_eq!(table.render(), "T  X\né  1\n");
    }

    #[test]
    fn sizes_use_binary_units() {
        assert_eq!(bytes(0), "0 B");
        assert_eq!(bytes(1023), "1023 B");
        assert_eq!(bytes(1536), "1.5 KiB");
        assert_eq!(bytes(50 * 1024 * 1024), "50.0 MiB");
    }
}
