//! Turn an input file into a set of numbered page images.

use std::{collections::BTreeMap, sync::Arc, sync::LazyLock};

use clap::Args;
use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore, prelude::*,
    recognizer::PageImage,
};

/// Image types we can OCR as-is, as a single page.
const SUPPORTED_IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg"];

/// PDF MIME type.
const PDF_MIME_TYPE: &str = "application/pdf";

static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line of Poppler output contain an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Page rendering options.
#[derive(Args, Clone, Debug)]
pub struct PageOpts {
    /// Resolution used to rasterize PDF pages. The form rectangles are
    /// measured at 144 DPI, so only change this for unusual scans.
    #[clap(long, default_value = "144")]
    pub dpi: u32,
}

impl Default for PageOpts {
    fn default() -> Self {
        Self { dpi: 144 }
    }
}

/// A single page, numbered from 1.
#[derive(Debug)]
pub struct Page {
    pub number: u32,
    pub image: Arc<PageImage>,
}

/// All the pages of an input file, rasterized.
#[derive(Debug)]
pub struct PageSet {
    /// Our pages, in order.
    pub pages: Vec<Page>,

    /// Anything the rasterizer complained about without failing.
    pub warnings: Vec<String>,
}

impl PageSet {
    /// Load `path`, rasterizing it if it is a PDF.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn from_path(path: &Path, opts: &PageOpts) -> Result<Self> {
        let mime_type = get_mime_type(path)?;
        if mime_type == PDF_MIME_TYPE {
            Self::from_rasterized_pdf(path, opts).await
        } else if SUPPORTED_IMAGE_TYPES.contains(&mime_type.as_str()) {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {:?}", path.display()))?;
            Ok(Self {
                pages: vec![Page {
                    number: 1,
                    image: Arc::new(PageImage { mime_type, data }),
                }],
                warnings: vec![],
            })
        } else {
            Err(anyhow!(
                "unsupported file type {} for {:?}",
                mime_type,
                path.display()
            ))
        }
    }

    /// Rasterize every page of a PDF to PNG.
    #[instrument(level = "debug", skip_all, fields(path = %path.display(), dpi = opts.dpi))]
    async fn from_rasterized_pdf(path: &Path, opts: &PageOpts) -> Result<Self> {
        let total_pages = get_pdf_page_count(path).await?;

        let tmpdir = tempfile::TempDir::with_prefix("pages")?;
        let out_prefix = tmpdir.path().join("page");

        // `pdftocairo` uses at least a full core, so don't run too many.
        let output = with_cpu_semaphore(|| async {
            Command::new("pdftocairo")
                .arg("-png")
                .arg("-r")
                .arg(opts.dpi.to_string())
                .arg(path)
                .arg(&out_prefix)
                .kill_on_drop(true)
                .output()
                .await
                .with_context(|| {
                    format!("failed to run pdftocairo on {:?}", path.display())
                })
        })
        .await?;
        check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;

        // pdftocairo zero-pads page numbers to a common width, so a
        // lexical sort gives page order.
        let mut png_paths = tmpdir
            .path()
            .read_dir()
            .context("failed to read temporary page directory")?
            .map(|entry| Ok(entry.context("failed to read page directory entry")?.path()))
            .collect::<Result<Vec<_>>>()?;
        png_paths.retain(|p| p.extension().is_some_and(|ext| ext == "png"));
        png_paths.sort();
        if png_paths.len() != total_pages {
            return Err(anyhow!(
                "expected {} pages from pdftocairo, found {}",
                total_pages,
                png_paths.len()
            ));
        }

        let mut pages = Vec::with_capacity(png_paths.len());
        for (idx, png_path) in png_paths.iter().enumerate() {
            let data = tokio::fs::read(png_path)
                .await
                .with_context(|| format!("failed to read {:?}", png_path.display()))?;
            pages.push(Page {
                number: u32::try_from(idx + 1).context("too many pages")?,
                image: PageImage::png(data),
            });
        }

        let warnings = String::from_utf8_lossy(&output.stderr)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();
        Ok(Self { pages, warnings })
    }
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    parse_pdfinfo_page_count(&output).with_context(|| {
        format!(
            "failed to parse page count for {:?} from pdfinfo output",
            path.display()
        )
    })
}

/// Find the `Pages:` property in `pdfinfo` output.
fn parse_pdfinfo_page_count(output: &str) -> Result<usize> {
    let mut properties = BTreeMap::new();
    for line in output.lines() {
        if let Some((key, value)) = line.split_once(':') {
            properties.insert(key.trim(), value.trim());
        }
    }
    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    Ok(page_count_str.parse::<usize>()?)
}

/// Get the MIME type of a file.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to get MIME type for {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown MIME type for {:?}", path.display()))?
        .mime_type()
        .to_string())
}
