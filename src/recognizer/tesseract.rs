//! Tesseract OCR engine.
//!
//! Each engine decodes its page once, then crops every region into a small
//! PNG and runs the `tesseract` CLI on it in single-line mode, reading back
//! TSV output so we get per-word confidences.

use std::{env, io::Cursor, process::Stdio, sync::Arc};

use image::{DynamicImage, ImageFormat};
use tempfile::TempDir;
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics},
    prelude::*,
};

use super::{PageImage, Recognition, Recognizer, RecognizerFactory, Region};

/// Characters that may appear on the form.
const CHAR_WHITELIST: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789,.- ";

/// Tesseract page segmentation mode: "treat the image as a single text line".
const PSM_SINGLE_LINE: &str = "7";

/// TSV `level` of a single word.
const WORD_LEVEL: &str = "5";

/// Options for running Tesseract.
#[derive(Clone, Debug)]
pub struct TesseractOpts {
    /// The `tesseract` binary to run.
    pub tesseract_path: PathBuf,
}

impl TesseractOpts {
    /// Read options from the environment, falling back to `tesseract` on the
    /// `PATH`.
    pub fn from_env() -> Self {
        let tesseract_path = env::var_os("TESSERACT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("tesseract"));
        Self { tesseract_path }
    }
}

/// Builds [`TesseractRecognizer`]s.
pub struct TesseractRecognizerFactory {
    opts: TesseractOpts,
}

impl TesseractRecognizerFactory {
    /// Create a new factory.
    pub fn new(opts: TesseractOpts) -> Self {
        Self { opts }
    }
}

#[async_trait]
impl RecognizerFactory for TesseractRecognizerFactory {
    #[instrument(level = "debug", skip_all, fields(lang = %lang))]
    async fn create(&self, lang: &str) -> Result<Box<dyn Recognizer>> {
        let output = Command::new(&self.opts.tesseract_path)
            .arg("--list-langs")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| {
                format!("cannot run {:?}", self.opts.tesseract_path.display())
            })?;
        check_for_command_failure("tesseract", &output, None)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !list_langs_contains(&stdout, lang) {
            return Err(anyhow!(
                "tesseract language data for {:?} is not installed",
                lang
            ));
        }

        let tmpdir = TempDir::with_prefix("tesseract")
            .context("cannot create tesseract scratch directory")?;
        Ok(Box::new(TesseractRecognizer {
            opts: self.opts.clone(),
            lang: lang.to_owned(),
            tmpdir,
            page: None,
        }))
    }
}

/// A single Tesseract "instance": a language, a scratch directory and the
/// currently loaded page.
pub struct TesseractRecognizer {
    opts: TesseractOpts,
    lang: String,
    tmpdir: TempDir,
    page: Option<Arc<DynamicImage>>,
}

#[async_trait]
impl Recognizer for TesseractRecognizer {
    async fn load_page(&mut self, page: &PageImage) -> Result<()> {
        self.page = None;
        let format = ImageFormat::from_mime_type(&page.mime_type)
            .ok_or_else(|| anyhow!("unsupported page image type {}", page.mime_type))?;
        let data = page.data.clone();
        let image = spawn_blocking_propagating_panics(move || {
            image::load_from_memory_with_format(&data, format)
        })
        .await?
        .context("cannot decode page image")?;
        trace!(width = image.width(), height = image.height(), "Loaded page");
        self.page = Some(Arc::new(image));
        Ok(())
    }

    #[instrument(level = "trace", skip_all, fields(region = %region))]
    async fn recognize_region(&mut self, region: Region) -> Result<Recognition> {
        let page = self
            .page
            .clone()
            .ok_or_else(|| anyhow!("no page loaded"))?;
        let png = spawn_blocking_propagating_panics(move || crop_to_png(&page, region))
            .await??;

        let input_path = self.tmpdir.path().join("region.png");
        tokio::fs::write(&input_path, &png)
            .await
            .context("cannot write tesseract input file")?;

        let output = Command::new(&self.opts.tesseract_path)
            .arg(&input_path)
            .arg("stdout")
            .arg("--psm")
            .arg(PSM_SINGLE_LINE)
            .arg("-l")
            .arg(&self.lang)
            .arg("-c")
            .arg(format!("tessedit_char_whitelist={CHAR_WHITELIST}"))
            .arg("-c")
            .arg("preserve_interword_spaces=1")
            .arg("tsv")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .context("cannot run tesseract")?;
        check_for_command_failure("tesseract", &output, None)?;

        let tsv = String::from_utf8(output.stdout)
            .context("tesseract output was not valid UTF-8")?;
        parse_tsv(&tsv)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.page = None;
        Ok(())
    }
}

/// Crop `region` out of `page` and encode it as PNG. Regions that hang off
/// the edge of the page are clipped.
fn crop_to_png(page: &DynamicImage, region: Region) -> Result<Vec<u8>> {
    let width = region
        .width
        .min(page.width().saturating_sub(region.left));
    let height = region
        .height
        .min(page.height().saturating_sub(region.top));
    if width == 0 || height == 0 {
        return Err(anyhow!(
            "region {} lies outside the {}x{} page",
            region,
            page.width(),
            page.height()
        ));
    }
    let crop = page.crop_imm(region.left, region.top, width, height);
    let mut png = Vec::new();
    crop.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("cannot encode region as PNG")?;
    Ok(png)
}

/// Does `tesseract --list-langs` output mention `lang`? Multi-language
/// combinations like `eng+hin` need every component.
fn list_langs_contains(output: &str, lang: &str) -> bool {
    let available = output
        .lines()
        .skip_while(|line| line.starts_with("List of available languages"))
        .map(str::trim)
        .collect::<Vec<_>>();
    lang.split('+').all(|wanted| available.contains(&wanted))
}

/// Parse Tesseract TSV output into text and a mean word confidence.
///
/// Words are joined with single spaces. Rows with a negative confidence are
/// layout rows, not words. If no words were found, the text is empty and the
/// confidence is 0.
fn parse_tsv(tsv: &str) -> Result<Recognition> {
    let mut lines = tsv.lines();
    let header = lines
        .next()
        .ok_or_else(|| anyhow!("tesseract produced no TSV output"))?;
    let columns = header.split('\t').collect::<Vec<_>>();
    let column = |name: &str| {
        columns
            .iter()
            .position(|&c| c == name)
            .ok_or_else(|| anyhow!("tesseract TSV output has no {:?} column", name))
    };
    let level_idx = column("level")?;
    let conf_idx = column("conf")?;
    let text_idx = column("text")?;

    let mut words = vec![];
    let mut total_conf = 0.0f32;
    for line in lines.filter(|line| !line.trim().is_empty()) {
        let fields = line.split('\t').collect::<Vec<_>>();
        if fields.get(level_idx) != Some(&WORD_LEVEL) {
            continue;
        }
        let conf = fields
            .get(conf_idx)
            .ok_or_else(|| anyhow!("truncated tesseract TSV row: {:?}", line))?
            .trim()
            .parse::<f32>()
            .with_context(|| format!("bad confidence in tesseract TSV row: {:?}", line))?;
        let text = fields.get(text_idx).map(|t| t.trim()).unwrap_or_default();
        if conf < 0.0 || text.is_empty() {
            continue;
        }
        words.push(text);
        total_conf += conf;
    }

    let confidence = if words.is_empty() {
        0.0
    } else {
        total_conf / words.len() as f32
    };
    Ok(Recognition {
        text: words.join(" "),
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    const HEADER: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    #[test]
    fn parses_words_and_mean_confidence() -> Result<()> {
        let tsv = format!(
            "{HEADER}\n\
             1\t1\t0\t0\t0\t0\t0\t0\t170\t21\t-1\t\n\
             4\t1\t1\t1\t1\t0\t2\t3\t160\t15\t-1\t\n\
             5\t1\t1\t1\t1\t1\t2\t3\t60\t15\t90.5\t12,34,567\n\
             5\t1\t1\t1\t1\t2\t70\t3\t40\t15\t70.5\t.00\n"
        );
        let recognition = parse_tsv(&tsv)?;
        assert_eq!(recognition.text, "12,34,567 .00");
        assert!((recognition.confidence - 80.5).abs() < 0.001);
        Ok(())
    }

    #[test]
    fn blank_region_has_no_text_and_zero_confidence() -> Result<()> {
        let tsv = format!("{HEADER}\n1\t1\t0\t0\t0\t0\t0\t0\t170\t21\t-1\t\n");
        let recognition = parse_tsv(&tsv)?;
        assert_eq!(recognition.text, "");
        assert_eq!(recognition.confidence, 0.0);
        Ok(())
    }

    #[test]
    fn missing_header_is_an_error() {
        assert!(parse_tsv("").is_err());
        assert!(parse_tsv("level\tconf\n").is_err());
    }

    #[test]
    fn checks_every_requested_language() {
        let output = "List of available languages in \"/usr/share/tessdata/\" (3):\neng\nhin\nosd\n";
        assert!(list_langs_contains(output, "eng"));
        assert!(list_langs_contains(output, "eng+hin"));
        assert!(!list_langs_contains(output, "deu"));
        assert!(!list_langs_contains(output, "eng+deu"));
    }

    #[test]
    fn crops_are_clipped_to_the_page() -> Result<()> {
        let page = DynamicImage::ImageRgb8(RgbImage::from_pixel(100, 50, Rgb([255; 3])));
        let png = crop_to_png(&page, Region::new(40, 80, 170, 21))?;
        let crop = image::load_from_memory_with_format(&png, ImageFormat::Png)?;
        assert_eq!((crop.width(), crop.height()), (20, 10));
        assert!(crop_to_png(&page, Region::new(60, 0, 10, 10)).is_err());
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires tesseract to be installed"]
    async fn blank_page_recognizes_as_empty() -> Result<()> {
        let page = DynamicImage::ImageRgb8(RgbImage::from_pixel(400, 100, Rgb([255; 3])));
        let mut png = Vec::new();
        page.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

        let factory = TesseractRecognizerFactory::new(TesseractOpts::from_env());
        let mut engine = factory.create("eng").await?;
        engine.load_page(&PageImage::png(png)).await?;
        let recognition = engine.recognize_region(Region::new(10, 10, 170, 21)).await?;
        assert_eq!(recognition.text, "");
        engine.shutdown().await?;
        Ok(())
    }
}
