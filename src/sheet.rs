//! The GSTR-1 summary spreadsheet.
//!
//! The template has three tables ("GSTR-1", "Books" and "Difference"), each
//! with one row per month of the financial year and a total row. We only
//! fill in the "GSTR-1" table; the others are left for the accountant.
//!
//! A [`Sheet`] is written out either as an `.xlsx` workbook, with the
//! template's formatting, or as plain CSV.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
    sync::LazyLock,
};

use regex::Regex;
use rust_xlsxwriter::{Color, Format, FormatAlign, Formula, Workbook};

use crate::{classifier::Fields, form::gstr1, prelude::*};

/// Table titles and the row each one starts on.
const TABLES: &[(&str, u32)] = &[("GSTR-1", 7), ("Books", 23), ("Difference", 39)];

/// Months of the financial year, in row order.
const MONTHS: &[&str] = &[
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
    "January",
    "February",
    "March",
];

/// Column headers, starting at column A.
const HEADERS: &[&str] = &[
    "Month",
    "B2B Forward Charges",
    "B2B Reverse Charges",
    "B2CL",
    "B2CS",
    "Export Sales",
    "Exempted",
    "Amendments in Local",
    "Amendments in Exempted Sales",
    "Total Sales",
    "DN/CN",
    "Amendments in DN/CN",
    "Advance Received (11A)",
    "Advance Adjusted (11B)",
    "Net Sales",
    "IGST",
    "CGST",
    "SGST",
    "CESS",
    "Total Tax",
    "IGST",
    "CGST",
    "SGST",
    "CESS",
    "IGST",
    "CGST",
    "SGST",
    "CESS",
];

/// Headers spanning several columns, written on the title row.
const CATEGORY_HEADERS: &[(&str, &str, &str)] = &[
    ("U", "X", "Tax reversed due to DN/CN issued"),
    ("Y", "AB", "Net Tax"),
];

/// The worksheet name in the workbook.
const WORKSHEET_NAME: &str = "GSTR-1";

/// Lakh/crore digit grouping.
const AMOUNT_FORMAT: &str = "##,##,##0.00";

const DEFAULT_COL_WIDTH: f64 = 21.0;
const HEADER_ROW_HEIGHT: f64 = 28.35;

/// Blue header fill.
const HEADER_FILL: u32 = 0x0070C0;

static CELL_REF_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z]{1,3})([1-9][0-9]*)$").expect("failed to compile regex")
});

/// A cell address like `B9`. Columns and rows are numbered from 1.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CellRef {
    // Row first, so cells sort in reading order.
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    pub fn new(col: u32, row: u32) -> Self {
        Self { row, col }
    }

    /// Parse a column name like `AC` into a 1-based column number.
    pub fn parse_col(name: &str) -> Result<u32> {
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(anyhow!("invalid column name {:?}", name));
        }
        Ok(name
            .bytes()
            .fold(0, |acc, b| acc * 26 + u32::from(b - b'A' + 1)))
    }

    /// The name of a 1-based column number.
    pub fn col_name(mut col: u32) -> String {
        let mut name = vec![];
        while col > 0 {
            let rem = (col - 1) % 26;
            name.push(char::from(b'A' + rem as u8));
            col = (col - 1) / 26;
        }
        name.iter().rev().collect()
    }
}

impl FromStr for CellRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let caps = CELL_REF_REGEX
            .captures(s)
            .ok_or_else(|| anyhow!("invalid cell reference {:?}", s))?;
        let col = Self::parse_col(&caps[1])?;
        let row = caps[2]
            .parse::<u32>()
            .with_context(|| format!("invalid row in cell reference {:?}", s))?;
        Ok(Self::new(col, row))
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::col_name(self.col), self.row)
    }
}

/// The contents of a cell.
#[derive(Clone, Debug, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    /// A formula, without the leading `=`.
    Formula(String),
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Text(text) => write!(f, "{}", text),
            Cell::Number(n) => write!(f, "{:.2}", n),
            Cell::Formula(formula) => write!(f, "={}", formula),
        }
    }
}

/// How a cell is drawn in the workbook. CSV output ignores this.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Style {
    /// Bold white on blue, centered.
    Header,
    /// Bold, left-aligned.
    Label,
    /// Right-aligned, with lakh/crore grouping.
    Amount,
    /// A bold [`Style::Amount`].
    Total,
}

impl Style {
    fn format(self) -> Format {
        match self {
            Style::Header => Format::new()
                .set_font_name("Calibri")
                .set_bold()
                .set_font_color(Color::White)
                .set_background_color(Color::RGB(HEADER_FILL))
                .set_align(FormatAlign::Center)
                .set_align(FormatAlign::VerticalCenter)
                .set_text_wrap(),
            Style::Label => Format::new()
                .set_font_name("Calibri")
                .set_bold()
                .set_align(FormatAlign::Left)
                .set_align(FormatAlign::VerticalCenter),
            Style::Amount => Format::new()
                .set_num_format(AMOUNT_FORMAT)
                .set_align(FormatAlign::Right),
            Style::Total => Format::new()
                .set_bold()
                .set_num_format(AMOUNT_FORMAT)
                .set_align(FormatAlign::Right)
                .set_align(FormatAlign::VerticalCenter),
        }
    }
}

#[derive(Clone, Debug)]
struct Entry {
    value: Cell,
    style: Style,
}

/// A sparse spreadsheet, plus the bits of layout we need for the workbook.
#[derive(Clone, Debug, Default)]
pub struct Sheet {
    cells: BTreeMap<CellRef, Entry>,
    /// Merged ranges, as inclusive `(top_left, bottom_right)` pairs.
    merges: Vec<(CellRef, CellRef)>,
    row_heights: BTreeMap<u32, f64>,
}

impl Sheet {
    /// An empty GSTR-1 summary sheet.
    pub fn template() -> Self {
        let mut sheet = Self::default();

        // Legal name, tax period, financial year and GSTIN.
        for &(_, cell) in gstr1::TEXT_CELLS {
            sheet.merge_named(cell, "C");
        }

        for &(title, heading) in TABLES {
            let label = |text: &str| Cell::Text(text.to_owned());
            sheet.set_styled(CellRef::new(1, heading), label(title), Style::Label);
            for &(first, last, header) in CATEGORY_HEADERS {
                sheet.set_named(first, heading, label(header), Style::Header);
                sheet.merge_named(&format!("{first}{heading}"), last);
            }
            for (idx, header) in (1..).zip(HEADERS) {
                sheet.set_styled(CellRef::new(idx, heading + 1), label(*header), Style::Header);
            }
            sheet.row_heights.insert(heading + 1, HEADER_ROW_HEIGHT);
            for (offset, month) in (2..).zip(MONTHS) {
                sheet.set_styled(CellRef::new(1, heading + offset), label(*month), Style::Label);
            }

            let first = heading + 2;
            let last = heading + 1 + MONTHS.len() as u32;
            let total_row = last + 1;
            sheet.set_styled(CellRef::new(1, total_row), label("Total"), Style::Label);
            for col in 2..=HEADERS.len() as u32 {
                let name = CellRef::col_name(col);
                sheet.set_styled(
                    CellRef::new(col, total_row),
                    Cell::Formula(format!("SUM({name}{first}:{name}{last})")),
                    Style::Total,
                );
            }
        }
        sheet
    }

    /// Get a cell.
    #[cfg(test)]
    pub fn get(&self, cell: CellRef) -> Option<&Cell> {
        self.cells.get(&cell).map(|entry| &entry.value)
    }

    #[cfg(test)]
    fn style(&self, cell: CellRef) -> Option<Style> {
        self.cells.get(&cell).map(|entry| entry.style)
    }

    /// Set a cell and its style.
    pub fn set_styled(&mut self, cell: CellRef, value: Cell, style: Style) {
        self.cells.insert(cell, Entry { value, style });
    }

    /// Set a cell by column name. Column names come from our own tables, so
    /// a bad one is a bug.
    fn set_named(&mut self, col: &str, row: u32, value: Cell, style: Style) {
        match CellRef::parse_col(col) {
            Ok(col) => self.set_styled(CellRef::new(col, row), value, style),
            Err(err) => error!("{:#}", err),
        }
    }

    /// Merge `first` with the cells to its right, up to column `last_col`.
    fn merge_named(&mut self, first: &str, last_col: &str) {
        let range = first.parse::<CellRef>().and_then(|first| {
            let last_col = CellRef::parse_col(last_col)?;
            Ok((first, CellRef::new(last_col, first.row)))
        });
        match range {
            Ok(range) => self.merges.push(range),
            Err(err) => error!("{:#}", err),
        }
    }

    /// Render every row from 1 to the last used row, padded to the same
    /// width.
    pub fn rows(&self) -> Vec<Vec<String>> {
        let Some(max_row) = self.cells.keys().map(|c| c.row).max() else {
            return vec![];
        };
        let max_col = self.cells.keys().map(|c| c.col).max().unwrap_or(1);
        let mut rows = vec![vec![String::new(); max_col as usize]; max_row as usize];
        for (cell, entry) in &self.cells {
            rows[(cell.row - 1) as usize][(cell.col - 1) as usize] = entry.value.to_string();
        }
        rows
    }

    /// Serialize as an `.xlsx` workbook with a single worksheet.
    pub fn to_xlsx(&self) -> Result<Vec<u8>> {
        let mut workbook = Workbook::new();
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(WORKSHEET_NAME)?;

        let max_col = self.cells.keys().map(|c| c.col).max().unwrap_or(1);
        for col in 1..=max_col {
            worksheet.set_column_width(xlsx_col(col)?, DEFAULT_COL_WIDTH)?;
        }
        for (&row, &height) in &self.row_heights {
            worksheet.set_row_height(row - 1, height)?;
        }

        // Merged ranges carry the value and style of their top-left cell.
        let mut covered = BTreeSet::new();
        for &(first, last) in &self.merges {
            let (text, style) = match self.cells.get(&first) {
                Some(entry) => (entry.value.to_string(), entry.style),
                None => (String::new(), Style::Label),
            };
            worksheet.merge_range(
                first.row - 1,
                xlsx_col(first.col)?,
                last.row - 1,
                xlsx_col(last.col)?,
                &text,
                &style.format(),
            )?;
            for col in first.col..=last.col {
                covered.insert(CellRef::new(col, first.row));
            }
        }

        for (cell, entry) in &self.cells {
            if covered.contains(cell) {
                continue;
            }
            let (row, col) = (cell.row - 1, xlsx_col(cell.col)?);
            let format = entry.style.format();
            match &entry.value {
                Cell::Text(text) => {
                    worksheet.write_string_with_format(row, col, text, &format)?;
                }
                Cell::Number(n) => {
                    worksheet.write_number_with_format(row, col, *n, &format)?;
                }
                Cell::Formula(formula) => {
                    worksheet.write_formula_with_format(
                        row,
                        col,
                        Formula::new(formula),
                        &format,
                    )?;
                }
            }
        }

        workbook
            .save_to_buffer()
            .context("Failed to write workbook")
    }

    /// Serialize as CSV. Formulas are written with a leading `=`, which
    /// spreadsheet programs evaluate on import.
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(vec![]);
        for row in self.rows() {
            wtr.write_record(&row).context("Failed to write CSV row")?;
        }
        wtr.into_inner()
            .map_err(|err| anyhow!("Failed to finish CSV output: {}", err.error()))
    }
}

/// Convert a 1-based column number to the workbook's 0-based one.
fn xlsx_col(col: u32) -> Result<u16> {
    u16::try_from(col - 1).with_context(|| format!("column {} is too wide", col))
}

/// The sheet row for a tax period like "April", if we know it.
pub fn row_for_tax_period(tax_period: &str) -> Option<u32> {
    let (_, heading) = TABLES[0];
    (2..)
        .zip(MONTHS)
        .find(|(_, month)| month.eq_ignore_ascii_case(tax_period.trim()))
        .map(|(offset, _)| heading + offset)
}

/// A filled-in sheet.
#[derive(Debug)]
pub struct Generated {
    pub sheet: Sheet,
    pub warnings: Vec<String>,
}

/// Fill in the template from recognized fields.
#[instrument(level = "debug", skip_all)]
pub fn generate(fields: &Fields) -> Result<Generated> {
    let mut sheet = Sheet::template();
    let mut warnings = vec![];

    for &(name, cell) in gstr1::TEXT_CELLS {
        if let Some(text) = fields.text.get(name) {
            sheet.set_styled(cell.parse()?, Cell::Text(text.clone()), Style::Label);
        }
    }

    let tax_period = fields
        .text
        .get(gstr1::TAX_PERIOD)
        .map(String::as_str)
        .unwrap_or_default();
    let Some(row) = row_for_tax_period(tax_period) else {
        let message = format!("Unable to determine row number for tax period: {tax_period}");
        warn!("{}", message);
        warnings.push(message);
        return Ok(Generated { sheet, warnings });
    };

    for &(col, names) in gstr1::AMOUNT_COLUMNS {
        // Amounts we read but couldn't parse count as zero.
        let values = names
            .iter()
            .filter_map(|name| fields.amounts.get(*name).copied())
            .collect::<Vec<_>>();
        if !values.is_empty() {
            let cell = CellRef::new(CellRef::parse_col(col)?, row);
            let sum = values.iter().map(|v| v.unwrap_or(0.0)).sum();
            sheet.set_styled(cell, Cell::Number(sum), Style::Amount);
        }
    }
    Ok(Generated { sheet, warnings })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(s: &str) -> CellRef {
        s.parse().unwrap()
    }

    #[test]
    fn cell_refs_parse_and_display() -> Result<()> {
        assert_eq!("B9".parse::<CellRef>()?, CellRef::new(2, 9));
        assert_eq!("AC21".parse::<CellRef>()?, CellRef::new(29, 21));
        assert_eq!(CellRef::new(26, 1).to_string(), "Z1");
        assert_eq!(CellRef::new(27, 1).to_string(), "AA1");
        assert!("A0".parse::<CellRef>().is_err());
        assert!("b9".parse::<CellRef>().is_err());
        assert!("9B".parse::<CellRef>().is_err());
        Ok(())
    }

    #[test]
    fn template_has_three_tables() {
        let sheet = Sheet::template();
        for (title, heading) in [("GSTR-1", 7), ("Books", 23), ("Difference", 39)] {
            assert_eq!(sheet.get(CellRef::new(1, heading)), Some(&Cell::Text(title.into())));
            assert_eq!(
                sheet.get(CellRef::new(1, heading + 2)),
                Some(&Cell::Text("April".into()))
            );
            assert_eq!(
                sheet.get(CellRef::new(1, heading + 13)),
                Some(&Cell::Text("March".into()))
            );
        }
        assert_eq!(sheet.get(cell("AB8")), Some(&Cell::Text("CESS".into())));
        assert_eq!(
            sheet.get(cell("U7")),
            Some(&Cell::Text("Tax reversed due to DN/CN issued".into()))
        );
        assert_eq!(sheet.get(cell("Y39")), Some(&Cell::Text("Net Tax".into())));
    }

    #[test]
    fn totals_sum_their_own_table() {
        let sheet = Sheet::template();
        assert_eq!(sheet.get(cell("B21")), Some(&Cell::Formula("SUM(B9:B20)".into())));
        assert_eq!(sheet.get(cell("AB37")), Some(&Cell::Formula("SUM(AB25:AB36)".into())));
        assert_eq!(sheet.get(cell("C53")), Some(&Cell::Formula("SUM(C41:C52)".into())));
        assert_eq!(sheet.get(cell("AC21")), None);
        assert_eq!(sheet.style(cell("B21")), Some(Style::Total));
        assert_eq!(sheet.style(cell("A21")), Some(Style::Label));
    }

    #[test]
    fn template_layout_matches_the_workbook() {
        let sheet = Sheet::template();
        assert_eq!(sheet.style(cell("B8")), Some(Style::Header));
        assert_eq!(sheet.style(cell("U23")), Some(Style::Header));
        assert_eq!(sheet.row_heights.get(&24), Some(&HEADER_ROW_HEIGHT));
        for (first, last) in [("A1", "C1"), ("A4", "C4"), ("U7", "X7"), ("Y39", "AB39")] {
            assert!(
                sheet.merges.contains(&(cell(first), cell(last))),
                "{first}:{last} is not merged"
            );
        }
        assert_eq!(sheet.merges.len(), 4 + 2 * TABLES.len());
    }

    #[test]
    fn writes_an_xlsx_workbook() -> Result<()> {
        let mut fields = Fields::default();
        fields.text.insert("taxPeriod".into(), "April".into());
        fields.text.insert("legalName".into(), "Acme Traders".into());
        fields.amounts.insert("value4a".into(), Some(1234567.5));
        let xlsx = generate(&fields)?.sheet.to_xlsx()?;
        // An .xlsx file is a zip archive.
        assert!(xlsx.starts_with(b"PK\x03\x04"));
        Ok(())
    }

    #[test]
    fn xlsx_columns_are_zero_based() -> Result<()> {
        assert_eq!(xlsx_col(1)?, 0);
        assert_eq!(xlsx_col(28)?, 27);
        assert!(xlsx_col(70_000).is_err());
        Ok(())
    }

    #[test]
    fn tax_periods_map_to_rows() {
        assert_eq!(row_for_tax_period("April"), Some(9));
        assert_eq!(row_for_tax_period(" march "), Some(20));
        assert_eq!(row_for_tax_period("Q1"), None);
    }

    #[test]
    fn amounts_are_summed_into_the_tax_period_row() -> Result<()> {
        let mut fields = Fields::default();
        fields.text.insert("taxPeriod".into(), "May".into());
        fields.text.insert("gstin".into(), "27AAAAA0000A1Z5".into());
        fields.amounts.insert("value6a".into(), Some(100.0));
        fields.amounts.insert("value6b".into(), Some(20.5));
        fields.amounts.insert("value6c".into(), None);
        fields.amounts.insert("igst4a".into(), Some(18.0));
        fields.amounts.insert("value4a".into(), None);

        let generated = generate(&fields)?;
        assert!(generated.warnings.is_empty());
        let sheet = generated.sheet;
        assert_eq!(sheet.get(cell("A2")), Some(&Cell::Text("May".into())));
        assert_eq!(sheet.get(cell("A4")), Some(&Cell::Text("27AAAAA0000A1Z5".into())));
        assert_eq!(sheet.get(cell("F10")), Some(&Cell::Number(120.5)));
        assert_eq!(sheet.get(cell("P10")), Some(&Cell::Number(18.0)));
        assert_eq!(sheet.style(cell("P10")), Some(Style::Amount));
        assert_eq!(sheet.get(cell("C10")), None);
        Ok(())
    }

    #[test]
    fn unparsed_amounts_count_as_zero() -> Result<()> {
        let mut fields = Fields::default();
        fields.text.insert("taxPeriod".into(), "June".into());
        fields.amounts.insert("value4a".into(), None);
        fields.amounts.insert("igst4a".into(), None);
        fields.amounts.insert("igst5".into(), Some(7.25));

        let sheet = generate(&fields)?.sheet;
        assert_eq!(sheet.get(cell("B11")), Some(&Cell::Number(0.0)));
        assert_eq!(sheet.get(cell("P11")), Some(&Cell::Number(7.25)));
        Ok(())
    }

    #[test]
    fn unknown_tax_period_warns() -> Result<()> {
        let mut fields = Fields::default();
        fields.text.insert("taxPeriod".into(), "Smarch".into());
        fields.amounts.insert("value4a".into(), Some(1.0));
        let generated = generate(&fields)?;
        assert_eq!(
            generated.warnings,
            ["Unable to determine row number for tax period: Smarch"]
        );
        assert_eq!(generated.sheet.get(cell("B9")), None);
        Ok(())
    }

    #[test]
    fn csv_rows_are_rectangular() -> Result<()> {
        let mut sheet = Sheet::default();
        sheet.set_styled(cell("A1"), Cell::Text("Acme, Ltd".into()), Style::Label);
        sheet.set_styled(cell("C2"), Cell::Number(1234.5), Style::Amount);
        sheet.set_styled(cell("B3"), Cell::Formula("SUM(C1:C2)".into()), Style::Total);
        let csv = String::from_utf8(sheet.to_csv()?)?;
        assert_eq!(csv, "\"Acme, Ltd\",,\n,,1234.50\n,=SUM(C1:C2),\n");
        Ok(())
    }
}
