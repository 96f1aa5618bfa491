//! Turning input documents into page images.
//!
//! PDFs are rendered one page at a time with Poppler's `pdftocairo` CLI.
//! Plain images are accepted as single-page documents.

use std::{collections::BTreeMap, io::Cursor, sync::LazyLock};

use image::{ImageFormat, ImageReader, RgbImage};
use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics},
    cpu_limit::with_cpu_semaphore,
    prelude::*,
};

/// Image types accepted as single-page documents.
const SUPPORTED_IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg", "image/webp", "image/gif"];

/// PDF MIME type.
const PDF_MIME_TYPE: &str = "application/pdf";

/// A default error regex for checking command output.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line contain an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Opens documents for rendering.
#[async_trait]
pub trait Rasterizer: Send + Sync + 'static {
    /// Open a document. Failing here is fatal for the whole document.
    async fn open(&self, data: Vec<u8>) -> Result<Box<dyn RasterDocument>>;
}

/// An open document whose pages can be rendered independently.
#[async_trait]
pub trait RasterDocument: Send + Sync {
    /// Number of pages.
    fn page_count(&self) -> usize;

    /// Render a page (0-based) at the given resolution.
    async fn render_page(&self, page_idx: usize, dpi: u32) -> Result<RgbImage>;
}

/// Rasterizer using Poppler's command-line tools.
#[derive(Clone, Copy, Debug, Default)]
pub struct PopplerRasterizer;

#[async_trait]
impl Rasterizer for PopplerRasterizer {
    #[instrument(level = "debug", skip_all, fields(bytes = data.len()))]
    async fn open(&self, data: Vec<u8>) -> Result<Box<dyn RasterDocument>> {
        let mime_type = infer::get(&data)
            .map(|kind| kind.mime_type())
            .ok_or_else(|| anyhow!("could not detect the input file type"))?;
        debug!(mime_type, "Detected input type");

        if mime_type == PDF_MIME_TYPE {
            Ok(Box::new(PdfDocument::new(data).await?))
        } else if SUPPORTED_IMAGE_TYPES.contains(&mime_type) {
            Ok(Box::new(ImageDocument::new(data, mime_type).await?))
        } else {
            Err(anyhow!("unsupported input type {mime_type}"))
        }
    }
}

/// A PDF copied to a temporary directory so Poppler can read it.
struct PdfDocument {
    tmpdir: tempfile::TempDir,
    page_count: usize,
}

impl PdfDocument {
    fn path(&self) -> PathBuf {
        self.tmpdir.path().join("input.pdf")
    }

    async fn new(data: Vec<u8>) -> Result<Self> {
        let tmpdir = tempfile::TempDir::with_prefix("fiscal-ocr-pdf")
            .context("cannot create temporary directory")?;
        let path = tmpdir.path().join("input.pdf");
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("cannot write {:?}", path.display()))?;
        let page_count = get_pdf_page_count(&path).await?;
        Ok(Self { tmpdir, page_count })
    }
}

#[async_trait]
impl RasterDocument for PdfDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    #[instrument(level = "debug", skip(self))]
    async fn render_page(&self, page_idx: usize, dpi: u32) -> Result<RgbImage> {
        if page_idx >= self.page_count {
            bail!(
                "page index {page_idx} out of range for {} pages",
                self.page_count
            );
        }
        let path = self.path();
        let page = (page_idx + 1).to_string();
        let out_stem = self.tmpdir.path().join(format!("page-{page}"));

        // `pdftocairo` uses at least a full CPU, so don't run too many at once.
        // `-singlefile` stops it from adding page digits to the output name.
        let mut cmd = Command::new("pdftocairo");
        cmd.arg("-png")
            .arg("-singlefile")
            .args(["-r", &dpi.to_string()])
            .args(["-f", &page, "-l", &page])
            .arg(&path)
            .arg(&out_stem);
        let output = with_cpu_semaphore(|| async {
            cmd.output().await.with_context(|| {
                format!("failed to run pdftocairo on {:?}", path.display())
            })
        })
        .await?;
        check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;

        let png_path = out_stem.with_extension("png");
        let png = tokio::fs::read(&png_path)
            .await
            .with_context(|| format!("pdftocairo did not write {:?}", png_path.display()))?;
        // Pages are rendered on demand, so don't let them pile up on disk.
        tokio::fs::remove_file(&png_path).await.ok();
        decode_image(png, Some(ImageFormat::Png)).await
    }
}

/// A single image treated as a one-page document.
struct ImageDocument {
    image: RgbImage,
}

impl ImageDocument {
    async fn new(data: Vec<u8>, mime_type: &str) -> Result<Self> {
        let format = ImageFormat::from_mime_type(mime_type);
        Ok(Self {
            image: decode_image(data, format).await?,
        })
    }
}

#[async_trait]
impl RasterDocument for ImageDocument {
    fn page_count(&self) -> usize {
        1
    }

    async fn render_page(&self, page_idx: usize, _dpi: u32) -> Result<RgbImage> {
        if page_idx != 0 {
            bail!("page index {page_idx} out of range for a single image");
        }
        Ok(self.image.clone())
    }
}

/// Decode image bytes to RGB on the blocking pool.
async fn decode_image(data: Vec<u8>, format: Option<ImageFormat>) -> Result<RgbImage> {
    spawn_blocking_propagating_panics(move || -> Result<RgbImage> {
        let mut reader = ImageReader::new(Cursor::new(data));
        match format {
            Some(format) => reader.set_format(format),
            None => {
                reader = reader
                    .with_guessed_format()
                    .context("cannot detect image format")?;
            }
        }
        Ok(reader.decode().context("cannot decode image")?.to_rgb8())
    })
    .await
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    // Run pdfinfo to get the number of pages.
    let output = Command::new("pdfinfo")
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    // Parse the output of pdfinfo into properties.
    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    let properties = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect::<BTreeMap<_, _>>();

    let pages = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    pages.parse::<usize>().with_context(|| {
        format!(
            "failed to parse page count for {:?} from pdfinfo output",
            path.display()
        )
    })
}
