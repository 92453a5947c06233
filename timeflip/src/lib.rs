//! Reshapes Timeflip time-tracking exports into a task × week table.
//! The core is pure: callers pass raw text plus a warning sink and get a table back.
//! Reading files, writing CSV and logging live at the edges (`storage`, `csv_io`, `diagnostics`).

pub mod core {
    use chrono::NaiveDate;
    use serde::Serialize;
    use std::path::PathBuf;

    /* ------------------------------ Raw input ------------------------------ */

    /// One delimiter-split source row. Empty fields are stored as `None`.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct RawRow {
        pub cells: Vec<Option<String>>,
    }

    impl RawRow {
        pub fn new<I, S>(cells: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            let cells = cells
                .into_iter()
                .map(|c| {
                    let c = c.into();
                    if c.is_empty() { None } else { Some(c) }
                })
                .collect();
            Self { cells }
        }

        /// Cell at `idx`, or `None` when the column is missing or empty.
        pub fn cell(&self, idx: usize) -> Option<&str> {
            self.cells.get(idx).and_then(|c| c.as_deref())
        }

        pub fn len(&self) -> usize {
            self.cells.len()
        }

        pub fn is_empty(&self) -> bool {
            self.cells.iter().all(Option::is_none)
        }
    }

    /// A comma table read with its header row (the simple Task/Week/Value shape).
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct HeaderedTable {
        pub headers: Vec<String>,
        pub records: Vec<Vec<String>>,
    }

    impl HeaderedTable {
        /// Index of the column whose trimmed header equals `name`.
        pub fn column(&self, name: &str) -> Option<usize> {
            self.headers.iter().position(|h| h.trim() == name)
        }
    }

    /* ------------------------------ Week blocks ------------------------------ */

    /// Rows between two `Week #` markers, in file order.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct WeekBlock {
        /// `<n>` from the `Week #<n>` marker, when it parses. Never used for ordering.
        pub ordinal: Option<u32>,
        pub reference_date: Option<NaiveDate>,
        pub rows: Vec<RawRow>,
    }

    /// Account and date range found before the first week marker.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
    pub struct ExportMetadata {
        pub account: Option<String>,
        pub from: Option<NaiveDate>,
        pub to: Option<NaiveDate>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum InputFormat {
        Simple,
        Complex,
    }

    /* ------------------------------ Result table ------------------------------ */

    pub const TASK_HEADER: &str = "Task";
    pub const TOTAL_LABEL: &str = "Total";

    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct TableRow {
        pub label: String,
        pub values: Vec<f64>,
    }

    /// Wide task × week table. Rows keep first-seen order; labels may repeat.
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct ResultTable {
        /// Header of the row-label column (empty for the degenerate no-task table).
        pub index_label: String,
        pub columns: Vec<String>,
        pub rows: Vec<TableRow>,
    }

    impl ResultTable {
        pub fn new(columns: Vec<String>) -> Self {
            Self {
                index_label: TASK_HEADER.to_string(),
                columns,
                rows: vec![],
            }
        }

        pub fn push_row(&mut self, label: impl Into<String>, values: Vec<f64>) {
            self.rows.push(TableRow {
                label: label.into(),
                values,
            });
        }

        pub fn row(&self, label: &str) -> Option<&TableRow> {
            self.rows.iter().find(|r| r.label == label)
        }

        /// Cell lookup by row label and column label (first match for each).
        pub fn value(&self, row: &str, column: &str) -> Option<f64> {
            let idx = self.columns.iter().position(|c| c == column)?;
            self.row(row)?.values.get(idx).copied()
        }

        /// Column-wise sums over every row currently in the table.
        pub fn column_totals(&self) -> Vec<f64> {
            let mut totals = vec![0.0; self.columns.len()];
            for row in &self.rows {
                for (slot, v) in totals.iter_mut().zip(&row.values) {
                    *slot += v;
                }
            }
            totals
        }

        pub fn is_empty(&self) -> bool {
            self.rows.is_empty()
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum TransformError {
        #[error("input file not found: {0:?}")]
        InputNotFound(PathBuf),
        #[error("missing required columns: {}", .0.join(", "))]
        MissingColumns(Vec<String>),
        #[error("task {task:?} has more than one value for week {week:?}")]
        DuplicateCell { task: String, week: String },
        #[error("reading tabular input")]
        Read(#[source] csv::Error),
        #[error("writing tabular output")]
        Write(#[source] csv::Error),
        #[error(transparent)]
        Io(#[from] std::io::Error),
        #[error("transform failed: {0}")]
        Failure(String),
    }
}

pub mod diagnostics {
    //! Warnings raised while degrading gracefully on bad cells.
    //!
    //! The core never logs on its own; it reports to whatever `WarningSink` the caller passes in.

    use serde::Serialize;
    use std::fmt;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum Warning {
        InvalidDuration { task: String, raw: String },
        InvalidDate { raw: String },
        TotalMismatch { task: String, declared: f64, daily: f64 },
        EmptyTaskName { record: usize },
        DuplicateCellOverwritten { task: String, week: String },
        NoTasks,
    }

    impl fmt::Display for Warning {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Warning::InvalidDuration { task, raw } => {
                    write!(f, "invalid time value for task {task:?}: {raw:?}; using 0.0")
                }
                Warning::InvalidDate { raw } => {
                    write!(f, "unparseable date {raw:?}; leaving it unset")
                }
                Warning::TotalMismatch {
                    task,
                    declared,
                    daily,
                } => write!(
                    f,
                    "task {task:?}: daily breakdown {daily:.2} differs from declared total {declared:.2}; using the breakdown"
                ),
                Warning::EmptyTaskName { record } => {
                    write!(f, "record {record} has no task name; skipped")
                }
                Warning::DuplicateCellOverwritten { task, week } => write!(
                    f,
                    "task {task:?} has more than one value for week {week:?}; keeping the last"
                ),
                Warning::NoTasks => f.write_str("no tasks found in the input"),
            }
        }
    }

    pub trait WarningSink {
        fn warn(&mut self, warning: Warning);
    }

    impl WarningSink for Vec<Warning> {
        fn warn(&mut self, warning: Warning) {
            self.push(warning);
        }
    }

    /// Forwards every warning to `tracing` and keeps a copy for reports.
    #[derive(Debug, Default)]
    pub struct LoggingSink {
        pub recorded: Vec<Warning>,
    }

    impl WarningSink for LoggingSink {
        fn warn(&mut self, warning: Warning) {
            tracing::warn!("{warning}");
            self.recorded.push(warning);
        }
    }

}

pub mod grammar {
    //! Small `nom` grammars for the tokens embedded in export cells.

    use chrono::NaiveDate;
    use nom::{
        IResult,
        bytes::complete::{tag, take_while_m_n},
        character::complete::{char, digit1, space0},
        combinator::{all_consuming, map_res},
        sequence::{preceded, tuple},
    };
    use std::str::FromStr;

    type PResult<'a, T> = IResult<&'a str, T>;

    fn number<'a, T: FromStr>(min: usize, max: usize) -> impl FnMut(&'a str) -> PResult<'a, T> {
        map_res(take_while_m_n(min, max, char_is_digit), |s: &str| s.parse::<T>())
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    // DD.MM.YYYY
    fn dotted_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                number::<u32>(1, 2),
                char('.'),
                number::<u32>(1, 2),
                char('.'),
                number::<i32>(4, 4),
            )),
            |(d, _, m, _, y)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn week_marker(i: &str) -> PResult<'_, u32> {
        preceded(
            tuple((tag("Week"), space0, char('#'), space0)),
            map_res(digit1, |s: &str| s.parse::<u32>()),
        )(i)
    }

    /// Parse a `DD.MM.YYYY` cell (surrounding whitespace allowed).
    pub fn parse_dotted_date(s: &str) -> Option<NaiveDate> {
        all_consuming(dotted_date)(s.trim()).ok().map(|(_, d)| d)
    }

    /// The `<n>` of a `Week #<n>` marker cell.
    pub fn week_ordinal(cell: &str) -> Option<u32> {
        week_marker(cell.trim()).ok().map(|(_, n)| n)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn dotted_dates() {
            assert_eq!(
                parse_dotted_date("29.12.2024"),
                NaiveDate::from_ymd_opt(2024, 12, 29)
            );
            assert_eq!(
                parse_dotted_date(" 5.1.2025 "),
                NaiveDate::from_ymd_opt(2025, 1, 5)
            );
            assert_eq!(parse_dotted_date("31.02.2024"), None);
            assert_eq!(parse_dotted_date("2024-12-29"), None);
            assert_eq!(parse_dotted_date("29.12.2024x"), None);
        }

        #[test]
        fn week_ordinals() {
            assert_eq!(week_ordinal("Week #12"), Some(12));
            assert_eq!(week_ordinal("Week #3 (partial)"), Some(3));
            assert_eq!(week_ordinal("Week #"), None);
            assert_eq!(week_ordinal("Weekly"), None);
        }
    }
}

pub mod classify {
    use crate::core::{RawRow, TASK_HEADER};

    pub const WEEK_MARKER_PREFIX: &str = "Week #";
    pub const SUMMARY_PREFIXES: [&str; 3] = ["Subtotal", "Day total", "Hours total"];

    pub const TAG_COLUMN: usize = 0;
    pub const TASK_COLUMN: usize = 1;
    pub const DECLARED_COLUMN: usize = 2;
    /// Sun..Sat breakdown.
    pub const DAY_COLUMNS: std::ops::RangeInclusive<usize> = 4..=10;

    /// A row that carries one task's time for the current week.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskRow<'a> {
        /// Trimmed, never empty, never "Task".
        pub name: &'a str,
        pub declared: &'a str,
        pub row: &'a RawRow,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RowKind<'a> {
        WeekMarker,
        Header,
        Task(TaskRow<'a>),
        Summary,
        Noise,
    }

    pub fn is_week_marker(row: &RawRow) -> bool {
        row.cell(TAG_COLUMN)
            .is_some_and(|c| c.starts_with(WEEK_MARKER_PREFIX))
    }

    /// Trimmed task name; `None` if nothing is left.
    pub fn clean_task_name(raw: &str) -> Option<&str> {
        let name = raw.trim();
        (!name.is_empty()).then_some(name)
    }

    pub fn is_summary_name(name: &str) -> bool {
        SUMMARY_PREFIXES.iter().any(|p| name.starts_with(p))
    }

    pub fn classify_row(row: &RawRow) -> RowKind<'_> {
        if is_week_marker(row) {
            return RowKind::WeekMarker;
        }
        if let Some(tag) = row.cell(TAG_COLUMN) {
            if !matches!(tag.trim(), "" | "-") {
                return RowKind::Noise;
            }
        }
        let Some(name) = row.cell(TASK_COLUMN).and_then(clean_task_name) else {
            return RowKind::Noise;
        };
        if name == TASK_HEADER {
            return RowKind::Header;
        }
        if is_summary_name(name) {
            return RowKind::Summary;
        }
        match row.cell(DECLARED_COLUMN) {
            Some(declared) => RowKind::Task(TaskRow {
                name,
                declared,
                row,
            }),
            None => RowKind::Noise,
        }
    }

}

pub mod segment {
    //! Groups semicolon rows into weekly blocks and reads the export preamble.

    use crate::classify::{DAY_COLUMNS, TAG_COLUMN, is_week_marker};
    use crate::core::{ExportMetadata, RawRow, WeekBlock};
    use crate::diagnostics::{Warning, WarningSink};
    use crate::grammar::{parse_dotted_date, week_ordinal};
    use chrono::NaiveDate;

    /// Split `rows` into blocks at every `Week #` marker.
    ///
    /// The row right after a marker is the column header and is always dropped.
    /// Rows before the first marker belong to no block. The final block is kept
    /// only if it collected at least one row.
    pub fn segment_weeks(rows: &[RawRow], sink: &mut dyn WarningSink) -> Vec<WeekBlock> {
        let mut blocks = Vec::new();
        let mut current: Option<WeekBlock> = None;
        let mut skip_header = false;

        for row in rows {
            if skip_header {
                skip_header = false;
                continue;
            }
            if is_week_marker(row) {
                if let Some(done) = current.take() {
                    blocks.push(done);
                }
                current = Some(open_block(row, sink));
                skip_header = true;
                continue;
            }
            if let Some(block) = current.as_mut() {
                block.rows.push(row.clone());
            }
        }

        if let Some(last) = current {
            if !last.rows.is_empty() {
                blocks.push(last);
            }
        }
        blocks
    }

    fn open_block(marker: &RawRow, sink: &mut dyn WarningSink) -> WeekBlock {
        WeekBlock {
            ordinal: marker.cell(TAG_COLUMN).and_then(week_ordinal),
            reference_date: reference_date(marker, sink),
            rows: vec![],
        }
    }

    /// First non-empty cell from the day columns onward, read as `DD.MM.YYYY`.
    pub fn reference_date(marker: &RawRow, sink: &mut dyn WarningSink) -> Option<NaiveDate> {
        let raw = (*DAY_COLUMNS.start()..marker.len())
            .filter_map(|i| marker.cell(i))
            .find(|c| !c.trim().is_empty())?;
        let date = parse_dotted_date(raw);
        if date.is_none() {
            sink.warn(Warning::InvalidDate {
                raw: raw.to_string(),
            });
        }
        date
    }

    /* ------------------------------ Preamble ------------------------------ */

    /// Read `Account:`, `From:` and `To:` from the rows before the first marker.
    pub fn extract_metadata(rows: &[RawRow], sink: &mut dyn WarningSink) -> ExportMetadata {
        let mut meta = ExportMetadata::default();
        for row in rows.iter().take_while(|r| !is_week_marker(r)) {
            for (idx, cell) in row.cells.iter().enumerate() {
                let Some(label) = cell.as_deref().map(str::trim) else {
                    continue;
                };
                let value = || value_after(row, idx);
                match label {
                    "Account:" => meta.account = value().map(str::to_string),
                    "From:" => meta.from = value().and_then(|v| metadata_date(v, sink)),
                    "To:" => meta.to = value().and_then(|v| metadata_date(v, sink)),
                    _ => {}
                }
            }
        }
        meta
    }

    fn value_after(row: &RawRow, label_idx: usize) -> Option<&str> {
        (label_idx + 1..row.len())
            .filter_map(|i| row.cell(i))
            .map(str::trim)
            .find(|v| !v.is_empty())
    }

    fn metadata_date(raw: &str, sink: &mut dyn WarningSink) -> Option<NaiveDate> {
        let date = parse_dotted_date(raw);
        if date.is_none() {
            sink.warn(Warning::InvalidDate {
                raw: raw.to_string(),
            });
        }
        date
    }

}

pub mod reconcile {
    use crate::classify::{DAY_COLUMNS, TaskRow};
    use crate::core::RawRow;
    use crate::diagnostics::{Warning, WarningSink};

    pub const DEFAULT_TOLERANCE: f64 = 0.01;

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct ReconcileOptions {
        /// Largest declared/daily difference still treated as agreement.
        pub tolerance: f64,
    }

    impl Default for ReconcileOptions {
        fn default() -> Self {
            Self {
                tolerance: DEFAULT_TOLERANCE,
            }
        }
    }

    /// Non-negative finite decimal hours.
    pub fn parse_duration(raw: &str) -> Option<f64> {
        let v = raw.trim().parse::<f64>().ok()?;
        (v.is_finite() && v >= 0.0).then_some(v)
    }

    /// Sum of the Sun..Sat cells, or `None` when the row stops before them.
    /// Empty or unparseable day cells count as zero.
    pub fn daily_sum(row: &RawRow) -> Option<f64> {
        if row.len() <= *DAY_COLUMNS.start() {
            return None;
        }
        Some(
            DAY_COLUMNS
                .filter_map(|i| row.cell(i))
                .filter_map(parse_duration)
                .sum(),
        )
    }

    /// Decide the hours for one task row.
    ///
    /// The declared total can be stale, so a non-zero daily breakdown that
    /// disagrees beyond the tolerance wins.
    pub fn reconcile_row(
        task: &TaskRow<'_>,
        opts: &ReconcileOptions,
        sink: &mut dyn WarningSink,
    ) -> f64 {
        let declared = parse_duration(task.declared).unwrap_or_else(|| {
            sink.warn(Warning::InvalidDuration {
                task: task.name.to_string(),
                raw: task.declared.to_string(),
            });
            0.0
        });

        match daily_sum(task.row) {
            Some(daily) if daily > 0.0 && (daily - declared).abs() > opts.tolerance => {
                sink.warn(Warning::TotalMismatch {
                    task: task.name.to_string(),
                    declared,
                    daily,
                });
                daily
            }
            _ => declared,
        }
    }

}

pub mod options {
    use crate::reconcile::ReconcileOptions;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum FormatChoice {
        /// Header test decides.
        #[default]
        Auto,
        Simple,
        Complex,
    }

    /// What to do when a simple file repeats a (Task, Week) pair.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum DuplicatePolicy {
        #[default]
        Reject,
        LastWins,
    }

    /// What to do when one week block lists the same task twice.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum RepeatPolicy {
        #[default]
        Sum,
        Overwrite,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Default)]
    pub struct TransformOptions {
        pub format: FormatChoice,
        pub duplicates: DuplicatePolicy,
        pub repeats: RepeatPolicy,
        pub reconcile: ReconcileOptions,
    }
}

pub mod storage {
    use crate::core::{HeaderedTable, RawRow, ResultTable, TransformError};
    use std::{fs, path::Path};

    /// Splits raw text into rows; the two reading modes the detector chooses between.
    pub trait TabularReader {
        /// Only the header row of a comma table.
        fn read_header(&self, text: &str) -> Result<Vec<String>, TransformError>;

        /// Comma table with header row.
        fn read_headered(&self, text: &str) -> Result<HeaderedTable, TransformError>;

        /// Semicolon rows, no header.
        fn read_raw_rows(&self, text: &str) -> Result<Vec<RawRow>, TransformError>;
    }

    pub trait TableWriter {
        /// Bring values to what `render` will print, so totals computed
        /// afterwards agree with the written cells.
        fn prepare(&self, table: ResultTable) -> ResultTable {
            table
        }

        fn render(&self, table: &ResultTable) -> Result<String, TransformError>;

        fn save(&self, table: &ResultTable, path: &Path) -> Result<(), TransformError> {
            let text = self.render(table)?;
            fs::write(path, text)?;
            Ok(())
        }
    }

    /// Read the whole input file, failing fast when it does not exist.
    pub fn load_input(path: &Path) -> Result<String, TransformError> {
        if !path.exists() {
            return Err(TransformError::InputNotFound(path.to_path_buf()));
        }
        Ok(fs::read_to_string(path)?)
    }
}

pub mod csv_io {
    //! `csv`-crate implementations of the storage traits.

    use crate::core::{HeaderedTable, RawRow, ResultTable, TransformError};
    use crate::storage::{TableWriter, TabularReader};

    #[derive(Debug, Clone, Copy)]
    pub struct CsvReader {
        pub simple_delimiter: u8,
        pub export_delimiter: u8,
    }

    impl Default for CsvReader {
        fn default() -> Self {
            Self {
                simple_delimiter: b',',
                export_delimiter: b';',
            }
        }
    }

    impl CsvReader {
        fn headered<'a>(&self, text: &'a str) -> csv::Reader<&'a [u8]> {
            csv::ReaderBuilder::new()
                .delimiter(self.simple_delimiter)
                .has_headers(true)
                .flexible(true)
                .from_reader(text.as_bytes())
        }
    }

    impl TabularReader for CsvReader {
        fn read_header(&self, text: &str) -> Result<Vec<String>, TransformError> {
            let mut reader = self.headered(text);
            let headers = reader.headers().map_err(TransformError::Read)?;
            Ok(headers.iter().map(str::to_string).collect())
        }

        fn read_headered(&self, text: &str) -> Result<HeaderedTable, TransformError> {
            let mut reader = self.headered(text);
            let headers: Vec<String> = reader
                .headers()
                .map_err(TransformError::Read)?
                .iter()
                .map(str::to_string)
                .collect();
            let mut records: Vec<Vec<String>> = Vec::new();
            for record in reader.records() {
                let record = record.map_err(TransformError::Read)?;
                records.push(record.iter().map(str::to_string).collect());
            }
            Ok(HeaderedTable { headers, records })
        }

        fn read_raw_rows(&self, text: &str) -> Result<Vec<RawRow>, TransformError> {
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(self.export_delimiter)
                .has_headers(false)
                .flexible(true)
                .from_reader(text.as_bytes());
            let mut rows = Vec::new();
            for record in reader.records() {
                let record = record.map_err(TransformError::Read)?;
                rows.push(RawRow::new(record.iter()));
            }
            Ok(rows)
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct CsvWriter {
        pub delimiter: u8,
        /// Decimals written per cell; `None` writes the shortest exact form.
        pub precision: Option<u8>,
    }

    impl Default for CsvWriter {
        fn default() -> Self {
            Self {
                delimiter: b',',
                precision: None,
            }
        }
    }

    impl CsvWriter {
        fn cell(&self, value: f64) -> String {
            match self.precision {
                Some(p) => format!("{:.*}", usize::from(p), value),
                None => value.to_string(),
            }
        }
    }

    impl TableWriter for CsvWriter {
        fn prepare(&self, mut table: ResultTable) -> ResultTable {
            let Some(p) = self.precision else {
                return table;
            };
            let scale = 10f64.powi(i32::from(p));
            for row in &mut table.rows {
                for v in &mut row.values {
                    *v = (*v * scale).round() / scale;
                }
            }
            table
        }

        fn render(&self, table: &ResultTable) -> Result<String, TransformError> {
            let mut writer = csv::WriterBuilder::new()
                .delimiter(self.delimiter)
                .from_writer(Vec::new());

            let header = std::iter::once(table.index_label.as_str())
                .chain(table.columns.iter().map(String::as_str));
            writer.write_record(header).map_err(TransformError::Write)?;

            for row in &table.rows {
                let mut record = Vec::with_capacity(row.values.len() + 1);
                record.push(row.label.clone());
                record.extend(row.values.iter().map(|&v| self.cell(v)));
                writer.write_record(&record).map_err(TransformError::Write)?;
            }

            let bytes = writer.into_inner().map_err(|e| {
                TransformError::Failure(format!("flushing csv output: {}", e.error()))
            })?;
            String::from_utf8(bytes).map_err(|e| TransformError::Failure(e.to_string()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn export_rows_keep_positions_and_blank_cells() {
            let rows = CsvReader::default()
                .read_raw_rows("Week #1;;;;29.12.2024;\n\n-;Code;7.75;;;\n")
                .expect("rows");
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0].cell(0), Some("Week #1"));
            assert_eq!(rows[0].cell(1), None);
            assert_eq!(rows[0].cell(4), Some("29.12.2024"));
            assert_eq!(rows[1].cell(2), Some("7.75"));
        }

        #[test]
        fn headered_table_reads_records() {
            let table = CsvReader::default()
                .read_headered("Task,Week,Value\nTask A,1,10\n")
                .expect("table");
            assert_eq!(table.headers, vec!["Task", "Week", "Value"]);
            assert_eq!(table.records, vec![vec!["Task A", "1", "10"]]);
            assert_eq!(table.column("Value"), Some(2));
        }

        #[test]
        fn render_writes_label_column_first() {
            let mut table = ResultTable::new(vec!["Week 1".into(), "Week 2".into()]);
            table.push_row("Task A", vec![10.0, 15.0]);
            table.push_row("Task, quoted", vec![0.126, 0.0]);
            let text = CsvWriter::default().render(&table).expect("render");
            assert_eq!(
                text,
                "Task,Week 1,Week 2\nTask A,10,15\n\"Task, quoted\",0.126,0\n"
            );
        }

        #[test]
        fn default_output_keeps_source_digits() {
            let mut table = ResultTable::new(vec!["Week 1".into()]);
            table.push_row("Slack", vec![6.395]);
            let writer = CsvWriter::default();
            let text = writer.render(&writer.prepare(table)).expect("render");
            assert_eq!(text, "Task,Week 1\nSlack,6.395\n");
        }

        #[test]
        fn fixed_precision_rounds_values_before_rendering() {
            let mut table = ResultTable::new(vec!["Week 1".into(), "Week 2".into()]);
            table.push_row("Task A", vec![10.0, 0.126]);
            let writer = CsvWriter {
                precision: Some(2),
                ..CsvWriter::default()
            };
            let prepared = writer.prepare(table);
            assert_eq!(prepared.rows[0].values, vec![10.0, 0.13]);
            assert_eq!(
                writer.render(&prepared).expect("render"),
                "Task,Week 1,Week 2\nTask A,10.00,0.13\n"
            );
        }

        #[test]
        fn save_writes_file() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("out.csv");
            let table = ResultTable::new(vec!["Week 1".into()]);
            CsvWriter {
                delimiter: b';',
                precision: Some(1),
            }
            .save(&table, &path)
            .expect("save");
            assert_eq!(
                std::fs::read_to_string(&path).expect("read back"),
                "Task;Week 1\n"
            );
        }
    }
}

pub mod detect {
    use crate::core::{HeaderedTable, InputFormat, RawRow, TransformError};
    use crate::options::FormatChoice;
    use crate::storage::TabularReader;
    use std::collections::BTreeSet;

    pub const SIMPLE_COLUMNS: [&str; 3] = ["Task", "Week", "Value"];

    /// Detected shape plus the rows read for it.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Detected {
        Simple(HeaderedTable),
        Complex(Vec<RawRow>),
    }

    impl Detected {
        pub fn format(&self) -> InputFormat {
            match self {
                Detected::Simple(_) => InputFormat::Simple,
                Detected::Complex(_) => InputFormat::Complex,
            }
        }
    }

    /// True when the trimmed header names are exactly {Task, Week, Value}.
    pub fn is_simple_header(headers: &[String]) -> bool {
        let found: BTreeSet<&str> = headers.iter().map(|h| h.trim()).collect();
        found == BTreeSet::from(SIMPLE_COLUMNS)
    }

    pub fn missing_columns(headers: &[String]) -> Vec<String> {
        SIMPLE_COLUMNS
            .iter()
            .filter(|c| !headers.iter().any(|h| h.trim() == **c))
            .map(|c| c.to_string())
            .collect()
    }

    /// Pick the reading mode. Each read starts fresh from `text`, so a
    /// rejected header never leaks into the semicolon pass.
    pub fn detect_format(
        text: &str,
        reader: &dyn TabularReader,
        choice: FormatChoice,
    ) -> Result<Detected, TransformError> {
        match choice {
            FormatChoice::Auto => {
                let simple = reader
                    .read_header(text)
                    .map(|h| is_simple_header(&h))
                    .unwrap_or(false);
                if simple {
                    Ok(Detected::Simple(reader.read_headered(text)?))
                } else {
                    Ok(Detected::Complex(reader.read_raw_rows(text)?))
                }
            }
            FormatChoice::Simple => {
                let table = reader.read_headered(text)?;
                let missing = missing_columns(&table.headers);
                if missing.is_empty() {
                    Ok(Detected::Simple(table))
                } else {
                    Err(TransformError::MissingColumns(missing))
                }
            }
            FormatChoice::Complex => Ok(Detected::Complex(reader.read_raw_rows(text)?)),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::csv_io::CsvReader;

        fn detect(text: &str, choice: FormatChoice) -> Result<Detected, TransformError> {
            detect_format(text, &CsvReader::default(), choice)
        }

        #[test]
        fn simple_header_selects_simple() {
            let d = detect("Task,Week,Value\nA,1,2\n", FormatChoice::Auto).expect("detect");
            assert_eq!(d.format(), InputFormat::Simple);
            let d = detect(" Value , Task,Week\n", FormatChoice::Auto).expect("detect");
            assert_eq!(d.format(), InputFormat::Simple);
        }

        #[test]
        fn anything_else_is_complex() {
            let d = detect("Account:;Jane;;\nWeek #1;;;;\n", FormatChoice::Auto).expect("detect");
            match d {
                Detected::Complex(rows) => assert_eq!(rows.len(), 2),
                other => panic!("expected complex, got {:?}", other),
            }
            let d = detect("Task,Week,Value,Note\n", FormatChoice::Auto).expect("detect");
            assert_eq!(d.format(), InputFormat::Complex);
        }

        #[test]
        fn forced_simple_reports_missing_columns() {
            let err = detect("Task,Week\nA,1\n", FormatChoice::Simple).unwrap_err();
            match err {
                TransformError::MissingColumns(cols) => assert_eq!(cols, vec!["Value"]),
                other => panic!("expected missing columns, got {other:?}"),
            }
        }

        #[test]
        fn forced_simple_tolerates_extra_columns() {
            let d = detect("Task,Week,Value,Note\nA,1,2,x\n", FormatChoice::Simple).expect("detect");
            assert_eq!(d.format(), InputFormat::Simple);
        }

        #[test]
        fn forced_complex_skips_header_test() {
            let d = detect("Task,Week,Value\n", FormatChoice::Complex).expect("detect");
            assert_eq!(d.format(), InputFormat::Complex);
        }
    }
}

pub mod pivot {
    pub mod ledger {
        use indexmap::IndexMap;

        use crate::options::RepeatPolicy;

        /// Ordered task → per-week hours accumulator.
        ///
        /// Between weeks every sequence has exactly `weeks()` entries. A task's
        /// position in the map is fixed at first sight, which is also its row order.
        #[derive(Debug, Clone, Default)]
        pub struct TaskLedger {
            tasks: IndexMap<String, Vec<f64>>,
            weeks: usize,
        }

        impl TaskLedger {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn is_empty(&self) -> bool {
                self.tasks.is_empty()
            }

            /// Record hours for `task` in the week currently open.
            pub fn record(&mut self, task: &str, hours: f64, policy: RepeatPolicy) {
                let week = self.weeks;
                let seq = self
                    .tasks
                    .entry(task.to_string())
                    .or_insert_with(|| vec![0.0; week]);
                if seq.len() == week {
                    seq.push(hours);
                } else if let Some(slot) = seq.last_mut() {
                    match policy {
                        RepeatPolicy::Sum => *slot += hours,
                        RepeatPolicy::Overwrite => *slot = hours,
                    }
                }
            }

            /// Close the open week, zero-filling tasks it did not mention.
            pub fn close_week(&mut self) {
                for seq in self.tasks.values_mut() {
                    if seq.len() == self.weeks {
                        seq.push(0.0);
                    }
                }
                self.weeks += 1;
                debug_assert!(self.tasks.values().all(|s| s.len() == self.weeks));
            }

            pub fn into_rows(self) -> impl Iterator<Item = (String, Vec<f64>)> {
                self.tasks.into_iter()
            }
        }

    }

    pub mod simple {
        use indexmap::{IndexMap, IndexSet};

        use crate::classify::clean_task_name;
        use crate::core::{HeaderedTable, ResultTable, TransformError};
        use crate::detect::missing_columns;
        use crate::diagnostics::{Warning, WarningSink};
        use crate::finalize;
        use crate::options::{DuplicatePolicy, TransformOptions};
        use crate::reconcile::parse_duration;

        /// Long Task/Week/Value records → wide table.
        ///
        /// Tasks and weeks keep first-occurrence order; week values are used verbatim
        /// in the `Week {value}` labels.
        pub fn pivot_simple(
            table: &HeaderedTable,
            opts: &TransformOptions,
            sink: &mut dyn WarningSink,
        ) -> Result<ResultTable, TransformError> {
            let missing = missing_columns(&table.headers);
            if !missing.is_empty() {
                return Err(TransformError::MissingColumns(missing));
            }
            let (Some(task_col), Some(week_col), Some(value_col)) = (
                table.column("Task"),
                table.column("Week"),
                table.column("Value"),
            ) else {
                return Err(TransformError::Failure("header lookup failed".into()));
            };

            let mut weeks: IndexSet<String> = IndexSet::new();
            let mut cells: IndexMap<String, IndexMap<usize, f64>> = IndexMap::new();

            for (idx, record) in table.records.iter().enumerate() {
                let field = |col: usize| record.get(col).map(String::as_str).unwrap_or("");
                // +2: one for the header, one for 1-based numbering.
                let Some(task) = clean_task_name(field(task_col)) else {
                    sink.warn(Warning::EmptyTaskName { record: idx + 2 });
                    continue;
                };
                let week = field(week_col);
                let raw = field(value_col);
                let value = parse_duration(raw).unwrap_or_else(|| {
                    sink.warn(Warning::InvalidDuration {
                        task: task.to_string(),
                        raw: raw.to_string(),
                    });
                    0.0
                });

                let (week_idx, _) = weeks.insert_full(week.to_string());
                let row = cells.entry(task.to_string()).or_default();
                if row.contains_key(&week_idx) {
                    match opts.duplicates {
                        DuplicatePolicy::Reject => {
                            return Err(TransformError::DuplicateCell {
                                task: task.to_string(),
                                week: week.to_string(),
                            });
                        }
                        DuplicatePolicy::LastWins => sink.warn(Warning::DuplicateCellOverwritten {
                            task: task.to_string(),
                            week: week.to_string(),
                        }),
                    }
                }
                row.insert(week_idx, value);
            }

            if cells.is_empty() {
                return Ok(finalize::empty_simple_table());
            }

            let columns = weeks.iter().map(|w| format!("Week {w}")).collect();
            let rows = cells.into_iter().map(|(task, row)| {
                let values = (0..weeks.len())
                    .map(|i| row.get(&i).copied().unwrap_or(0.0))
                    .collect();
                (task, values)
            });
            Ok(finalize::build_table(columns, rows))
        }

        #[cfg(test)]
        mod tests {
            use super::*;

            fn table(lines: &[&str]) -> HeaderedTable {
                let mut it = lines.iter();
                let headers: Vec<String> = it
                    .next()
                    .map(|h| h.split(',').map(str::to_string).collect())
                    .unwrap_or_default();
                let records: Vec<Vec<String>> = it
                    .map(|l| l.split(',').map(str::to_string).collect())
                    .collect();
                HeaderedTable { headers, records }
            }

            fn pivot(lines: &[&str]) -> (Result<ResultTable, TransformError>, Vec<Warning>) {
                let mut warnings: Vec<Warning> = Vec::new();
                let r = pivot_simple(&table(lines), &TransformOptions::default(), &mut warnings);
                (r, warnings)
            }

            #[test]
            fn pivots_two_tasks_two_weeks() {
                let (r, warnings) = pivot(&[
                    "Task,Week,Value",
                    "Task A,1,10",
                    "Task A,2,15",
                    "Task B,1,5",
                    "Task B,2,8",
                ]);
                let t = r.expect("pivot");
                assert_eq!(t.columns, vec!["Week 1", "Week 2"]);
                assert_eq!(t.row("Task A").map(|r| r.values.clone()), Some(vec![10.0, 15.0]));
                assert_eq!(t.row("Task B").map(|r| r.values.clone()), Some(vec![5.0, 8.0]));
                assert!(warnings.is_empty());
            }

            #[test]
            fn first_occurrence_order_and_zero_fill() {
                let (r, _) = pivot(&["Task,Week,Value", "B,2,1", "A,1,4", "B,1,2"]);
                let t = r.expect("pivot");
                assert_eq!(t.columns, vec!["Week 2", "Week 1"]);
                assert_eq!(t.rows[0].label, "B");
                assert_eq!(t.value("A", "Week 2"), Some(0.0));
                assert_eq!(t.value("A", "Week 1"), Some(4.0));
                assert_eq!(t.value("B", "Week 1"), Some(2.0));
            }

            #[test]
            fn week_values_are_not_reformatted() {
                let (r, _) = pivot(&["Week,Value,Task", "01,3,A", "2025-W02,4,A"]);
                assert_eq!(r.expect("pivot").columns, vec!["Week 01", "Week 2025-W02"]);
            }

            #[test]
            fn header_only_gives_placeholder_column() {
                let (r, _) = pivot(&["Task,Week,Value"]);
                let t = r.expect("pivot");
                assert!(t.is_empty());
                assert_eq!(t.columns, vec!["Week 1"]);
            }

            #[test]
            fn duplicate_pair_rejected_by_default() {
                let (r, _) = pivot(&["Task,Week,Value", "A,1,1", "A,1,2"]);
                assert!(matches!(
                    r,
                    Err(TransformError::DuplicateCell { ref task, ref week }) if task == "A" && week == "1"
                ));
            }

            #[test]
            fn duplicate_pair_last_wins_when_allowed() {
                let opts = TransformOptions {
                    duplicates: DuplicatePolicy::LastWins,
                    ..TransformOptions::default()
                };
                let mut warnings: Vec<Warning> = Vec::new();
                let t = pivot_simple(
                    &table(&["Task,Week,Value", "A,1,1", "A,1,2"]),
                    &opts,
                    &mut warnings,
                )
                .expect("pivot");
                assert_eq!(t.value("A", "Week 1"), Some(2.0));
                assert_eq!(warnings.len(), 1);
            }

            #[test]
            fn bad_values_and_blank_tasks_degrade() {
                let (r, warnings) = pivot(&["Task,Week,Value", "A,1,abc", " ,1,3"]);
                let t = r.expect("pivot");
                assert_eq!(t.value("A", "Week 1"), Some(0.0));
                assert_eq!(t.rows.len(), 1);
                assert_eq!(warnings.len(), 2);
                assert!(warnings.contains(&Warning::EmptyTaskName { record: 3 }));
            }
        }
    }

    pub mod complex {
        use super::ledger::TaskLedger;
        use crate::classify::{RowKind, classify_row};
        use crate::core::{ResultTable, WeekBlock};
        use crate::diagnostics::{Warning, WarningSink};
        use crate::finalize;
        use crate::options::TransformOptions;
        use crate::reconcile::reconcile_row;

        /// Weekly blocks → wide table, one column per block in block order.
        pub fn pivot_blocks(
            blocks: &[WeekBlock],
            opts: &TransformOptions,
            sink: &mut dyn WarningSink,
        ) -> ResultTable {
            let mut ledger = TaskLedger::new();
            for block in blocks {
                for row in &block.rows {
                    if let RowKind::Task(task) = classify_row(row) {
                        let hours = reconcile_row(&task, &opts.reconcile, sink);
                        ledger.record(task.name, hours, opts.repeats);
                    }
                }
                ledger.close_week();
            }

            if ledger.is_empty() {
                sink.warn(Warning::NoTasks);
                return finalize::empty_complex_table();
            }
            finalize::build_table(finalize::week_labels(blocks), ledger.into_rows())
        }

    }
}

pub mod finalize {
    use crate::core::{ResultTable, TASK_HEADER, TOTAL_LABEL, WeekBlock};

    /// Column used when there is nothing to show.
    pub const PLACEHOLDER_WEEK: &str = "Week 1";

    pub fn week_label(index: usize, block: &WeekBlock) -> String {
        match block.reference_date {
            Some(date) => date.format("%Y-%m-%d").to_string(),
            None => format!("Week {}", index + 1),
        }
    }

    pub fn week_labels(blocks: &[WeekBlock]) -> Vec<String> {
        blocks
            .iter()
            .enumerate()
            .map(|(i, b)| week_label(i, b))
            .collect()
    }

    pub fn build_table(
        columns: Vec<String>,
        rows: impl IntoIterator<Item = (String, Vec<f64>)>,
    ) -> ResultTable {
        let mut table = ResultTable::new(columns);
        for (label, values) in rows {
            table.push_row(label, values);
        }
        table
    }

    /// Header-only simple input: no rows, a single `Week 1` column.
    pub fn empty_simple_table() -> ResultTable {
        ResultTable::new(vec![PLACEHOLDER_WEEK.to_string()])
    }

    /// Export without task rows: no rows, columns `Task` and `Week 1`.
    pub fn empty_complex_table() -> ResultTable {
        ResultTable {
            index_label: String::new(),
            columns: vec![TASK_HEADER.to_string(), PLACEHOLDER_WEEK.to_string()],
            rows: vec![],
        }
    }

    /// Append the `Total` row (column-wise sum of every task row).
    pub fn with_total(mut table: ResultTable) -> ResultTable {
        let totals = table.column_totals();
        table.push_row(TOTAL_LABEL, totals);
        table
    }

}

/* ------------------------------ Entry points ------------------------------ */

use crate::core::{ExportMetadata, InputFormat, ResultTable, TransformError};
use crate::csv_io::CsvReader;
use crate::detect::{Detected, detect_format};
use crate::diagnostics::WarningSink;
use crate::options::TransformOptions;
use crate::storage::{TableWriter, TabularReader};
use serde::Serialize;
use std::path::Path;

/// Outcome of one transform call. `table` has no `Total` row yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transformed {
    pub format: InputFormat,
    pub metadata: ExportMetadata,
    pub table: ResultTable,
}

/// Transform raw file text using the `csv` reader.
pub fn transform(
    text: &str,
    opts: &TransformOptions,
    sink: &mut dyn WarningSink,
) -> Result<Transformed, TransformError> {
    transform_with(&CsvReader::default(), text, opts, sink)
}

pub fn transform_with(
    reader: &dyn TabularReader,
    text: &str,
    opts: &TransformOptions,
    sink: &mut dyn WarningSink,
) -> Result<Transformed, TransformError> {
    let detected = detect_format(text, reader, opts.format)?;
    let format = detected.format();
    let (metadata, table) = match detected {
        Detected::Simple(table) => (
            ExportMetadata::default(),
            pivot::simple::pivot_simple(&table, opts, sink)?,
        ),
        Detected::Complex(rows) => {
            let metadata = segment::extract_metadata(&rows, sink);
            let blocks = segment::segment_weeks(&rows, sink);
            (metadata, pivot::complex::pivot_blocks(&blocks, opts, sink))
        }
    };
    Ok(Transformed {
        format,
        metadata,
        table,
    })
}

/// The table as `writer` will emit it: values prepared for output, then the
/// Total row summed from those prepared values.
pub fn finalized_for(table: &ResultTable, writer: &dyn TableWriter) -> ResultTable {
    finalize::with_total(writer.prepare(table.clone()))
}

/// Append the `Total` row and hand the table to `writer`.
pub fn save_table(
    table: &ResultTable,
    writer: &dyn TableWriter,
    path: &Path,
) -> Result<(), TransformError> {
    writer.save(&finalized_for(table, writer), path)
}

pub use csv_io::CsvWriter;
pub use diagnostics::{LoggingSink, Warning};
pub use finalize::with_total;
