//! The `extract` subcommand.

use std::sync::Arc;

use clap::{Args, ValueEnum};

use crate::{
    async_utils::io::{write_json_output, write_output},
    extract::{ExtractionStatus, extract_file},
    pages::PageOpts,
    pool::WorkerPool,
    prelude::*,
    recognizer::tesseract::{TesseractOpts, TesseractRecognizerFactory},
    ui::Ui,
};

use super::PoolOpts;

/// Extract command line arguments.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// The GSTR-1 PDF (or a single page image) to read.
    pub input_path: PathBuf,

    #[clap(flatten)]
    pub pool_opts: PoolOpts,

    #[clap(flatten)]
    pub page_opts: PageOpts,

    /// Where to write the summary sheet. Defaults to stdout.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Sheet format. Defaults to CSV for stdout and `.csv` files, and to
    /// xlsx otherwise.
    #[clap(long = "format", value_enum)]
    pub format: Option<SheetFormat>,

    /// Where to write a JSON report of recognized fields, warnings and errors.
    #[clap(long = "report")]
    pub report_path: Option<PathBuf>,
}

/// Output formats for the summary sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SheetFormat {
    /// An Excel workbook with the template's formatting.
    Xlsx,
    /// Plain CSV. Formulas are written as `=SUM(...)`.
    Csv,
}

impl SheetFormat {
    /// Pick a format for `path` when none was given.
    fn for_output_path(path: Option<&Path>) -> Self {
        match path.and_then(|p| p.extension()) {
            Some(ext) if !ext.eq_ignore_ascii_case("csv") => SheetFormat::Xlsx,
            Some(_) => SheetFormat::Csv,
            None if path.is_some() => SheetFormat::Xlsx,
            None => SheetFormat::Csv,
        }
    }
}

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all, fields(path = %opts.input_path.display()))]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    let factory = Arc::new(TesseractRecognizerFactory::new(TesseractOpts::from_env()));
    let (pool, worker) = WorkerPool::new(opts.pool_opts.to_config(), factory);

    let extraction = extract_file(&ui, &opts.input_path, &opts.page_opts, &pool).await;

    // Shut the pool down whether or not we succeeded.
    pool.terminate().await;
    drop(pool);
    worker.join().await?;
    let extraction = extraction?;

    if let Some(report_path) = &opts.report_path {
        write_json_output(Some(report_path.as_path()), &extraction.report).await?;
    }
    let output_path = opts.output_path.as_deref();
    let sheet = match opts
        .format
        .unwrap_or_else(|| SheetFormat::for_output_path(output_path))
    {
        SheetFormat::Xlsx => extraction.sheet.to_xlsx()?,
        SheetFormat::Csv => extraction.sheet.to_csv()?,
    };
    write_output(output_path, &sheet).await?;

    let report = &extraction.report;
    if !report.warnings.is_empty() {
        ui.display_message(
            "⚠️",
            &format!("{} warnings, see the log or --report", report.warnings.len()),
        );
    }
    for error in &report.errors {
        ui.display_message("❌", error);
    }
    match report.status {
        ExtractionStatus::Ok => Ok(()),
        ExtractionStatus::Incomplete => {
            warn!(
                errors = report.errors.len(),
                "Some pages could not be recognized"
            );
            Ok(())
        }
        ExtractionStatus::Failed => Err(anyhow!(
            "could not recognize any pages in {:?}",
            opts.input_path.display()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheet_format_follows_the_output_path() {
        let format = |path: Option<&str>| SheetFormat::for_output_path(path.map(Path::new));
        assert_eq!(format(None), SheetFormat::Csv);
        assert_eq!(format(Some("summary.csv")), SheetFormat::Csv);
        assert_eq!(format(Some("summary.CSV")), SheetFormat::Csv);
        assert_eq!(format(Some("summary.xlsx")), SheetFormat::Xlsx);
        assert_eq!(format(Some("summary")), SheetFormat::Xlsx);
    }
}
