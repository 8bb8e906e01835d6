//! Box-drawing table renderer for IOP, peer and mapping listings.

use colored::Colorize;

/// Column alignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Align {
    Left,
    Right,
}

/// Collects headers and rows, then renders with Unicode borders.
pub struct Table {
    headers: Vec<String>,
    alignments: Vec<Align>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// All columns default to left alignment.
    pub fn new(headers: &[&str]) -> Self {
        let headers: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
        let alignments = vec![Align::Left; headers.len()];
        Self {
            headers,
            alignments,
            rows: Vec::new(),
        }
    }

    /// Out-of-range columns are ignored.
    pub fn align(mut self, col: usize, alignment: Align) -> Self {
        if let Some(a) = self.alignments.get_mut(col) {
            *a = alignment;
        }
        self
    }

    /// Extra cells are dropped; missing cells are blank.
    pub fn add_row<S: AsRef<str>>(&mut self, cells: &[S]) {
        let row = (0..self.headers.len())
            .map(|i| cells.get(i).map(|c| c.as_ref()).unwrap_or("").to_string())
            .collect();
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column_widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }
        widths
    }

    fn pad(text: &str, width: usize, alignment: Align) -> String {
        let fill = " ".repeat(width.saturating_sub(text.chars().count()));
        match alignment {
            Align::Left => format!("{text}{fill}"),
            Align::Right => format!("{fill}{text}"),
        }
    }

    fn border(widths: &[usize], left: &str, mid: &str, right: &str) -> String {
        let segments: Vec<String> = widths.iter().map(|w| "\u{2500}".repeat(w + 2)).collect();
        format!("{left}{}{right}", segments.join(mid))
    }

    /// Render to a string:
    /// ```text
    /// ┌────────┬────────┐
    /// │ Name   │ Type   │
    /// ├────────┼────────┤
    /// │ tempIn │ DOUBLE │
    /// └────────┴────────┘
    /// ```
    pub fn render(&self) -> String {
        let widths = self.column_widths();
        let row_line = |cells: Vec<String>| format!("\u{2502}{}\u{2502}", cells.join("\u{2502}"));

        let mut lines = vec![Self::border(&widths, "\u{250c}", "\u{252c}", "\u{2510}")];
        lines.push(row_line(
            self.headers
                .iter()
                .enumerate()
                .map(|(i, h)| format!(" {} ", Self::pad(h, widths[i], self.alignments[i]).bold()))
                .collect(),
        ));
        lines.push(Self::border(&widths, "\u{251c}", "\u{253c}", "\u{2524}"));
        for row in &self.rows {
            lines.push(row_line(
                row.iter()
                    .enumerate()
                    .map(|(i, cell)| format!(" {} ", Self::pad(cell, widths[i], self.alignments[i])))
                    .collect(),
            ));
        }
        lines.push(Self::border(&widths, "\u{2514}", "\u{2534}", "\u{2518}"));
        lines.join("\n")
    }

    pub fn print(&self) {
        println!("{}", self.render());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iop_table_layout() {
        let mut t = Table::new(&["Category", "Name", "Type"]);
        t.add_row(&["input", "tempIn", "DOUBLE"]);
        t.add_row(&["output", "alarm", "BOOL"]);

        let rendered = t.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[0].starts_with('\u{250c}'));
        assert!(lines[5].ends_with('\u{2518}'));
        assert!(lines[1].contains("Category"));
        assert!(lines[3].contains("tempIn"));
        assert!(lines[4].contains("BOOL"));
    }

    #[test]
    fn test_right_alignment_and_missing_cells() {
        let mut t = Table::new(&["Peer", "Reconnects"]).align(1, Align::Right);
        t.add_row(&["sensor-1", "3"]);
        t.add_row(&["sensor-22"]);
        let rendered = t.render();
        let line = rendered.lines().find(|l| l.contains("sensor-1 ")).unwrap();
        assert!(line.contains("          3 "));
        assert!(!t.is_empty());
    }
}
