//! Extract a GSTR-1 summary from a single document.
//!
//! We rasterize the document, submit one OCR task per page that has form
//! fields, and wait for all of them. A page that fails to OCR is recorded as
//! an error, but never stops its siblings. Then we classify whatever we got
//! and fill in the sheet.

use std::sync::Arc;

use futures::future::join_all;
use schemars::JsonSchema;

use crate::{
    classifier::{self, Fields, PageText},
    form::gstr1,
    pages::{PageOpts, PageSet},
    pool::{RegionProgress, WorkerPool},
    prelude::*,
    sheet::{self, Sheet},
    ui::{ProgressConfig, Ui},
};

/// How well extraction went.
#[derive(Clone, Copy, Debug, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    /// Every page with form fields was recognized.
    Ok,
    /// Some pages failed. The fields we have are still usable.
    Incomplete,
    /// No pages could be recognized.
    Failed,
}

/// A summary of one extraction run.
#[derive(Debug, JsonSchema, Serialize)]
pub struct ExtractionReport {
    /// The document we read.
    pub path: PathBuf,

    /// Overall status.
    pub status: ExtractionStatus,

    /// Pages recognized successfully, in order.
    pub pages_recognized: Vec<u32>,

    /// Fields found on the form.
    pub fields: Fields,

    /// Problems that didn't prevent us from reading a page.
    pub warnings: Vec<String>,

    /// Pages we could not read, as `OCR failed for page N: ...`.
    pub errors: Vec<String>,
}

/// Everything produced by [`extract_file`].
#[derive(Debug)]
pub struct Extraction {
    pub report: ExtractionReport,
    pub sheet: Sheet,
}

/// Extract the form fields from `path` using an existing pool.
///
/// Rasterization and pool startup failures are returned as errors. Per-page
/// OCR failures are recorded in the report.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn extract_file(
    ui: &Ui,
    path: &Path,
    page_opts: &PageOpts,
    pool: &WorkerPool,
) -> Result<Extraction> {
    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "🖨️",
        msg: "Rasterizing pages",
        done_msg: "Rasterized pages",
    });
    let page_set = PageSet::from_path(path, page_opts)
        .await
        .with_context(|| format!("failed to rasterize {:?}", path.display()))?;
    spinner.finish_with_message(format!("Rasterized {} pages", page_set.pages.len()));
    let mut warnings = page_set.warnings;

    pool.initialize()
        .await
        .context("failed to start OCR workers")?;

    let mut form_pages = vec![];
    for page in &page_set.pages {
        match gstr1::rectangles_for_page(page.number) {
            Some(regions) => form_pages.push((page, regions)),
            None => debug!(page = page.number, "No form fields on page, skipping"),
        }
    }

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "🔎",
            msg: "Recognizing fields",
            done_msg: "Recognized fields",
        },
        form_pages.iter().map(|(_, regions)| regions.len() as u64).sum(),
    );

    // Everything is queued before we wait on anything.
    let mut tasks = vec![];
    for (page, regions) in form_pages {
        let progress = {
            let pb = pb.clone();
            Arc::new(move |_done: usize| pb.inc(1)) as RegionProgress
        };
        let recognized =
            pool.submit_with_progress(page.image.clone(), regions, page.number, progress);
        tasks.push(async move { (page.number, recognized.await) });
    }
    let results = join_all(tasks).await;
    pb.finish_using_style();
    if let Ok(stats) = pool.stats().await {
        debug!(?stats, "OCR worker pool after extraction");
    }

    let attempted = results.len();
    let mut pages = vec![];
    let mut errors = vec![];
    for (page_number, result) in results {
        match result {
            Ok(regions) => pages.push(PageText {
                page_number,
                regions,
            }),
            Err(err) => {
                let message = format!("OCR failed for page {}: {}", page_number, err);
                error!("{}", message);
                errors.push(message);
            }
        }
    }

    let classification = classifier::classify(&pages);
    warnings.extend(classification.warnings);
    let generated = sheet::generate(&classification.fields)?;
    warnings.extend(generated.warnings);

    let status = if attempted > 0 && pages.is_empty() {
        ExtractionStatus::Failed
    } else if !errors.is_empty() || attempted == 0 {
        ExtractionStatus::Incomplete
    } else {
        ExtractionStatus::Ok
    };
    info!(?status, pages = pages.len(), errors = errors.len(), "Extraction finished");

    Ok(Extraction {
        report: ExtractionReport {
            path: path.to_owned(),
            status,
            pages_recognized: pages.iter().map(|p| p.page_number).collect(),
            fields: classification.fields,
            warnings,
            errors,
        },
        sheet: generated.sheet,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::{
        pool::PoolConfig,
        recognizer::{PageImage, Recognition, Recognizer, RecognizerFactory, Region},
        sheet::{Cell, CellRef},
    };

    /// Answers every field on page 1 with plausible text. If `broken`, every
    /// page fails to load.
    struct FormFactory {
        broken: bool,
    }

    #[async_trait]
    impl RecognizerFactory for FormFactory {
        async fn create(&self, _lang: &str) -> Result<Box<dyn Recognizer>> {
            Ok(Box::new(FormRecognizer {
                broken: self.broken,
            }))
        }
    }

    struct FormRecognizer {
        broken: bool,
    }

    #[async_trait]
    impl Recognizer for FormRecognizer {
        async fn load_page(&mut self, _page: &PageImage) -> Result<()> {
            if self.broken {
                Err(anyhow!("corrupt page"))
            } else {
                Ok(())
            }
        }

        async fn recognize_region(&mut self, region: Region) -> Result<Recognition> {
            let name = gstr1::field_for_region(1, region)
                .map(|f| f.name)
                .unwrap_or_default();
            let text = match name {
                "taxPeriod" => "April",
                "legalName" => "Acme Traders",
                "gstin" => "27AAAAA0000A1Z5",
                "financialYear" => "2024-25",
                "cess5" => "",
                _ => "1,000.00",
            };
            Ok(Recognition {
                text: text.to_owned(),
                confidence: if text.is_empty() { 0.0 } else { 92.0 },
            })
        }
    }

    async fn run(broken: bool) -> Result<Extraction> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR")?;

        let config = PoolConfig {
            size: 2,
            ..PoolConfig::default()
        };
        let (pool, worker) = WorkerPool::new(config, Arc::new(FormFactory { broken }));
        let ui = Ui::init_for_tests();
        let extraction = extract_file(&ui, file.path(), &PageOpts::default(), &pool).await;
        pool.terminate().await;
        drop(pool);
        worker.join().await?;
        extraction
    }

    #[tokio::test]
    async fn extracts_fields_into_the_sheet() -> Result<()> {
        let extraction = run(false).await?;
        let report = &extraction.report;
        assert_eq!(report.status, ExtractionStatus::Ok);
        assert_eq!(report.pages_recognized, [1]);
        assert!(report.errors.is_empty());
        assert_eq!(report.fields.text["legalName"], "Acme Traders");
        assert_eq!(report.fields.amounts["value4a"], Some(1000.0));
        assert!(!report.fields.amounts.contains_key("cess5"));
        assert_eq!(report.warnings.len(), 1);

        let sheet = &extraction.sheet;
        assert_eq!(
            sheet.get(CellRef::new(1, 1)),
            Some(&Cell::Text("Acme Traders".into()))
        );
        // value6a + value6b + value6c
        assert_eq!(sheet.get("F9".parse()?), Some(&Cell::Number(3000.0)));
        // cess4a + cess6a + cess6b + cess6c, with cess5 blank
        assert_eq!(sheet.get("S9".parse()?), Some(&Cell::Number(4000.0)));
        Ok(())
    }

    #[tokio::test]
    async fn page_failures_are_reported_not_raised() -> Result<()> {
        let extraction = run(true).await?;
        let report = &extraction.report;
        assert_eq!(report.status, ExtractionStatus::Failed);
        assert!(report.pages_recognized.is_empty());
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("OCR failed for page 1: "));
        assert!(report.errors[0].contains("corrupt page"));
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_documents_are_fatal() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"not a document")?;
        let (pool, _worker) =
            WorkerPool::new(PoolConfig::default(), Arc::new(FormFactory { broken: false }));
        let ui = Ui::init_for_tests();
        let result = extract_file(&ui, file.path(), &PageOpts::default(), &pool).await;
        assert!(result.is_err());
        assert_eq!(pool.stats().await?.slots, 0);
        Ok(())
    }
}
