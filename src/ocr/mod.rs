//! Page orchestration: render each page, pick the best OCR candidate, look
//! for client names on receipts, and assemble per-page results.

use std::sync::Arc;

use futures::{StreamExt as _, stream};
use image::RgbImage;
use indicatif::ProgressBar;
use schemars::JsonSchema;

use self::{
    candidates::{
        CandidateEngine, Rotation, Selection, StandardVariants, UsedVariant, VariantPipeline,
    },
    engines::OcrEngine,
    names::{NameCandidate, NameScanner, finalize_candidates, has_client_name},
};
use crate::{
    async_utils::spawn_blocking_propagating_panics,
    imaging::marks::MaskOutcome,
    policy::ProcessingPolicy,
    prelude::*,
    raster::{RasterDocument, Rasterizer},
};

pub mod candidates;
pub mod engines;
pub mod names;

/// Separator used when joining pages into a single text.
pub const PAGE_BREAK: &str = "\n\n--- PAGE BREAK ---\n\n";

/// The result of processing one page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PageResult {
    /// 1-based page number.
    pub page: usize,
    /// Recognized text, whitespace-normalized. Empty if the page failed.
    pub text: String,
    /// Recognized text with the engine's line breaks.
    pub raw_text: String,
    /// Number of characters in `text`.
    pub char_count: usize,
    /// Why this page failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// How the text was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<PageMeta>,
}

impl PageResult {
    /// A successfully processed page.
    pub fn success(page: usize, text: String, raw_text: String, meta: PageMeta) -> Self {
        Self {
            page,
            char_count: text.chars().count(),
            text,
            raw_text,
            error: None,
            meta: Some(meta),
        }
    }

    /// A page that could not be processed.
    pub fn failure(page: usize, err: &anyhow::Error) -> Self {
        Self {
            page,
            text: String::new(),
            raw_text: String::new(),
            char_count: 0,
            error: Some(format!("{err:?}")),
            meta: None,
        }
    }
}

/// Metadata describing the winning trial for a page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PageMeta {
    /// Image variant and rotation, e.g. `clean_rot90` or `baseline_otsu`.
    pub variant: String,
    /// Which family of images won.
    pub used_variant: UsedVariant,
    /// Rotation of the winning trial.
    pub rot: Rotation,
    /// Layout mode of the winning trial, e.g. `psm6`.
    pub psm: String,
    /// Mean word confidence of the winning trial, rounded.
    pub avg_conf: f64,
    /// Composite score of the winning trial.
    pub score: f64,
    /// How many trials succeeded.
    pub trial_count: usize,
    /// Did a cheap baseline make the full pipeline unnecessary?
    pub early_exit: bool,
    /// Skew correction applied, in degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deskew_angle: Option<f64>,
    /// What mark suppression decided.
    pub mask: MaskOutcome,
    /// Possible client names. These are hints only and never change `text`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub name_candidates: Vec<NameCandidate>,
}

impl PageMeta {
    fn new(selection: &Selection, name_candidates: Vec<NameCandidate>) -> Self {
        let best = &selection.best;
        Self {
            variant: best.label(),
            used_variant: best.variant.family(),
            rot: best.rotation,
            psm: best.mode.to_string(),
            avg_conf: best.confidence.round(),
            score: best.score,
            trial_count: selection.trial_count,
            early_exit: selection.early_exit,
            deskew_angle: selection.deskew_angle,
            mask: selection.mask,
            name_candidates,
        }
    }
}

/// Summary of a processed document.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct DocumentStatistics {
    pub total_pages: usize,
    pub pages_with_text: usize,
    pub pages_with_errors: usize,
    pub total_characters: usize,
    pub average_chars_per_page: f64,
    /// Percentage of pages with text, `0..=100`.
    pub success_rate: f64,
}

impl DocumentStatistics {
    /// Compute statistics from page results.
    pub fn from_pages(pages: &[PageResult]) -> Self {
        let total_pages = pages.len();
        let total_characters = pages.iter().map(|p| p.char_count).sum::<usize>();
        let pages_with_text = pages.iter().filter(|p| p.char_count > 0).count();
        let pages_with_errors = pages.iter().filter(|p| p.error.is_some()).count();
        let (average_chars_per_page, success_rate) = if total_pages == 0 {
            (0.0, 0.0)
        } else {
            (
                total_characters as f64 / total_pages as f64,
                pages_with_text as f64 / total_pages as f64 * 100.0,
            )
        };
        Self {
            total_pages,
            pages_with_text,
            pages_with_errors,
            total_characters,
            average_chars_per_page,
            success_rate,
        }
    }
}

/// Join page texts with [`PAGE_BREAK`].
pub fn join_pages(pages: &[PageResult]) -> String {
    pages
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join(PAGE_BREAK)
}

/// Select the best candidate for a page and, on receipts without a readable
/// client name, scan for one.
fn analyze_page(
    policy: &ProcessingPolicy,
    ocr: &dyn OcrEngine,
    variants: &dyn VariantPipeline,
    page: &RgbImage,
) -> Result<(Selection, Vec<NameCandidate>)> {
    let selection = CandidateEngine::new(policy, ocr, variants).select(page)?;

    let mut candidates = vec![];
    if policy.receipt_mode && !has_client_name(&selection.best.text) {
        let scanner = NameScanner::new(policy, ocr);
        candidates.extend(scanner.micro_scan(&selection.reference));
        if let Some(gray) = &selection.page_gray {
            candidates.extend(scanner.scan_name_region(gray));
        }
    }
    Ok((selection, finalize_candidates(candidates)))
}

/// Extracts text from documents, one [`PageResult`] per page.
pub struct Extractor {
    policy: Arc<ProcessingPolicy>,
    rasterizer: Arc<dyn Rasterizer>,
    ocr: Arc<dyn OcrEngine>,
    variants: Arc<dyn VariantPipeline>,
    page_concurrency: usize,
    progress: Option<ProgressBar>,
}

impl Extractor {
    /// Create an extractor using the standard image pipeline.
    pub fn new(
        policy: ProcessingPolicy,
        rasterizer: Arc<dyn Rasterizer>,
        ocr: Arc<dyn OcrEngine>,
    ) -> Self {
        Self {
            policy: Arc::new(policy),
            rasterizer,
            ocr,
            variants: Arc::new(StandardVariants),
            page_concurrency: 1,
            progress: None,
        }
    }

    /// Process up to `n` pages at once. Pages only share the read-only
    /// policy, so this is safe, but each page holds several full-size images.
    pub fn with_page_concurrency(mut self, n: usize) -> Self {
        self.page_concurrency = n.max(1);
        self
    }

    /// Report per-page progress.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Extract text from every page of a document.
    ///
    /// Only a document that cannot be opened at all is an error. Failures on
    /// individual pages are recorded in that page's [`PageResult::error`].
    #[instrument(level = "debug", skip_all, fields(bytes = data.len()))]
    pub async fn extract(&self, data: Vec<u8>) -> Result<Vec<PageResult>> {
        info!(dpi = self.policy.dpi, language = %self.policy.language, "Starting OCR");
        let document = self
            .rasterizer
            .open(data)
            .await
            .context("cannot open document")?;
        let page_count = document.page_count();
        if let Some(progress) = &self.progress {
            progress.set_length(page_count as u64);
        }

        let document = document.as_ref();
        let pages = stream::iter(0..page_count)
            .map(|page_idx| self.process_page(document, page_idx))
            // Keep page order while working on several pages at once.
            .buffered(self.page_concurrency)
            .collect::<Vec<_>>()
            .await;
        Ok(pages)
    }

    /// Extract text and join the pages with [`PAGE_BREAK`].
    pub async fn extract_as_text(&self, data: Vec<u8>) -> Result<String> {
        Ok(join_pages(&self.extract(data).await?))
    }

    /// Extract text and summarize the results.
    pub async fn statistics(&self, data: Vec<u8>) -> Result<DocumentStatistics> {
        Ok(DocumentStatistics::from_pages(&self.extract(data).await?))
    }

    /// Process one page, turning any failure into an error result.
    #[instrument(level = "debug", skip(self, document), fields(page = page_idx + 1))]
    async fn process_page(&self, document: &dyn RasterDocument, page_idx: usize) -> PageResult {
        let page = page_idx + 1;
        let result = match self.try_process_page(document, page_idx).await {
            Ok(result) => result,
            Err(err) => {
                warn!(page, "Page failed: {err:#}");
                PageResult::failure(page, &err)
            }
        };
        if let Some(progress) = &self.progress {
            progress.inc(1);
        }
        result
    }

    async fn try_process_page(
        &self,
        document: &dyn RasterDocument,
        page_idx: usize,
    ) -> Result<PageResult> {
        let page = page_idx + 1;
        let image = document
            .render_page(page_idx, self.policy.dpi)
            .await
            .with_context(|| format!("cannot render page {page}"))?;

        let policy = self.policy.clone();
        let ocr = self.ocr.clone();
        let variants = self.variants.clone();
        let (selection, name_candidates) = spawn_blocking_propagating_panics(move || {
            analyze_page(&policy, ocr.as_ref(), variants.as_ref(), &image)
        })
        .await
        .with_context(|| format!("cannot OCR page {page}"))?;

        let meta = PageMeta::new(&selection, name_candidates);
        let best = selection.best;
        info!(
            page,
            chars = best.length,
            confidence = meta.avg_conf,
            psm = %meta.psm,
            rot = %meta.rot,
            variant = %meta.variant,
            names = meta.name_candidates.len(),
            "Page OK"
        );
        Ok(PageResult::success(page, best.text, best.raw_text, meta))
    }
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Rgb};

    use super::*;
    use crate::{
        ocr::candidates::tests::{ScriptedEngine, recognition},
        policy::Preset,
    };

    /// Pages that either render to an image or fail.
    struct FakeDocument {
        pages: Vec<Result<RgbImage, String>>,
    }

    #[async_trait]
    impl RasterDocument for FakeDocument {
        fn page_count(&self) -> usize {
            self.pages.len()
        }

        async fn render_page(&self, page_idx: usize, _dpi: u32) -> Result<RgbImage> {
            match &self.pages[page_idx] {
                Ok(image) => Ok(image.clone()),
                Err(msg) => Err(anyhow!("{msg}")),
            }
        }
    }

    /// Opens every input as the same fake document, unless the input is
    /// `b"garbage"`.
    struct FakeRasterizer {
        pages: Vec<Result<RgbImage, String>>,
    }

    #[async_trait]
    impl Rasterizer for FakeRasterizer {
        async fn open(&self, data: Vec<u8>) -> Result<Box<dyn RasterDocument>> {
            if data == b"garbage" {
                bail!("not a document");
            }
            Ok(Box::new(FakeDocument {
                pages: self.pages.clone(),
            }))
        }
    }

    fn blank_page() -> RgbImage {
        RgbImage::from_pixel(60, 80, Rgb([255, 255, 255]))
    }

    fn extractor(
        policy: ProcessingPolicy,
        pages: Vec<Result<RgbImage, String>>,
        ocr: Arc<dyn OcrEngine>,
    ) -> Extractor {
        Extractor::new(policy, Arc::new(FakeRasterizer { pages }), ocr).with_page_concurrency(2)
    }

    const CLEAN_TEXT: &str = "NOTA FISCAL DE SERVICOS ELETRONICA PRESTADOR DE SERVICOS";

    fn confident_engine() -> Arc<dyn OcrEngine> {
        Arc::new(ScriptedEngine::new(|_: &GrayImage, _| Ok(recognition(CLEAN_TEXT, 90.0))))
    }

    #[tokio::test]
    async fn page_failures_do_not_stop_the_document() -> Result<()> {
        let pages = vec![
            Ok(blank_page()),
            Err("renderer exploded".to_owned()),
            Ok(blank_page()),
        ];
        let results = extractor(ProcessingPolicy::default(), pages, confident_engine())
            .extract(b"pdf".to_vec())
            .await?;

        assert_eq!(results.len(), 3);
        assert_eq!(
            results.iter().map(|r| r.page).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(results[0].error.is_none());
        assert_eq!(results[0].text, CLEAN_TEXT);
        assert!(results[1].error.as_ref().unwrap().contains("renderer exploded"));
        assert_eq!(results[1].text, "");
        assert!(results[1].meta.is_none());
        for result in &results {
            assert_eq!(result.char_count, result.text.chars().count());
        }

        let meta = results[2].meta.as_ref().unwrap();
        assert!(meta.early_exit);
        assert_eq!(meta.variant, "baseline_gray");
        assert_eq!(meta.used_variant, UsedVariant::Baseline);
        assert_eq!(meta.psm, "psm6");
        assert_eq!(meta.avg_conf, 90.0);
        assert!(meta.name_candidates.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn every_page_gets_a_result_even_when_all_fail() -> Result<()> {
        let engine: Arc<dyn OcrEngine> =
            Arc::new(ScriptedEngine::new(|_: &GrayImage, _| Err(anyhow!("no tesseract"))));
        let pages = vec![Ok(blank_page()), Ok(blank_page())];
        let results = extractor(ProcessingPolicy::default(), pages, engine)
            .extract(b"pdf".to_vec())
            .await?;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.error.is_some() && r.char_count == 0));

        let stats = DocumentStatistics::from_pages(&results);
        assert_eq!(stats.pages_with_errors, 2);
        assert_eq!(stats.success_rate, 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_documents_are_fatal() {
        let result = extractor(ProcessingPolicy::default(), vec![], confident_engine())
            .extract(b"garbage".to_vec())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn text_and_statistics() -> Result<()> {
        let pages = vec![Ok(blank_page()), Err("bad page".to_owned())];
        let extractor = extractor(ProcessingPolicy::default(), pages, confident_engine());

        let text = extractor.extract_as_text(b"pdf".to_vec()).await?;
        assert_eq!(text, format!("{CLEAN_TEXT}{PAGE_BREAK}"));

        let stats = extractor.statistics(b"pdf".to_vec()).await?;
        let chars = CLEAN_TEXT.chars().count();
        assert_eq!(
            stats,
            DocumentStatistics {
                total_pages: 2,
                pages_with_text: 1,
                pages_with_errors: 1,
                total_characters: chars,
                average_chars_per_page: chars as f64 / 2.0,
                success_rate: 50.0,
            }
        );
        Ok(())
    }

    #[test]
    fn empty_documents_have_zero_rates() {
        assert_eq!(
            DocumentStatistics::from_pages(&[]),
            DocumentStatistics::default()
        );
    }

    #[test]
    fn degenerate_page_sizes_are_handled_by_every_preset() {
        let engine = ScriptedEngine::new(|_: &GrayImage, _| Ok(recognition("?", 10.0)));
        for &preset in Preset::ALL {
            let policy = preset.policy();
            for (width, height) in [(1, 1), (2, 2), (1, 300), (300, 1), (7, 5)] {
                let page = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
                let result = analyze_page(&policy, &engine, &StandardVariants, &page);
                assert!(
                    result.is_ok(),
                    "{} failed on a {width}x{height} page",
                    preset.name()
                );
            }
        }
    }

    /// A receipt page: gray print lines and a small blue signature near the
    /// bottom.
    fn receipt_page() -> RgbImage {
        let mut page = RgbImage::from_pixel(400, 600, Rgb([250, 250, 250]));
        for line in 0..12 {
            let top = 60 + line * 40;
            for y in top..top + 6 {
                for x in 40..360 {
                    page.put_pixel(x, y, Rgb([70, 70, 70]));
                }
            }
        }
        for x in 150..250 {
            let y = 560 + (x % 12) / 3;
            for dy in 0..3 {
                page.put_pixel(x, y + dy, Rgb([30, 60, 200]));
            }
        }
        page
    }

    #[tokio::test]
    async fn receipts_without_a_client_name_get_name_candidates() -> Result<()> {
        // Narrow strips show the client line; the full page reads poorly.
        let engine: Arc<dyn OcrEngine> = Arc::new(ScriptedEngine::new(|image: &GrayImage, _| {
            if image.width() > 3 * image.height() {
                Ok(recognition("CLIENTE: JOAO DA SILVA", 70.0))
            } else {
                Ok(recognition("CUPOM FISCAL ELETRONICO TOTAL 10,00", 50.0))
            }
        }));
        let results = extractor(Preset::Nfce.policy(), vec![Ok(receipt_page())], engine)
            .extract(b"pdf".to_vec())
            .await?;

        let result = &results[0];
        assert_eq!(result.error, None);
        assert!(result.char_count > 0);
        assert_eq!(result.text, "CUPOM FISCAL ELETRONICO TOTAL 10,00");
        let meta = result.meta.as_ref().unwrap();
        assert_eq!(meta.rot, Rotation::Rot0);
        assert!(!meta.early_exit);
        assert!(
            meta.name_candidates
                .iter()
                .any(|c| c.value == "JOAO DA SILVA")
        );
        Ok(())
    }
}
