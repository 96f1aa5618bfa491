//! OCR engine wrapping the `tesseract` CLI tool.
//!
//! We ask for TSV output, which gives us per-word confidences and enough
//! layout information to rebuild lines.

use std::process::Command;

use image::{GrayImage, ImageFormat};

use crate::{async_utils::check_for_command_failure, prelude::*};

use super::{LayoutMode, OcrEngine, Recognition, RecognizedWord};

/// Tesseract's word-level TSV rows.
const WORD_LEVEL: u8 = 5;

/// OCR engine wrapping the `tesseract` CLI tool.
#[derive(Clone, Debug)]
pub struct TesseractEngine {
    /// Path or name of the `tesseract` binary.
    program: String,
    /// OCR engine mode (`--oem`). 1 is the LSTM engine.
    engine_mode: u8,
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self {
            program: "tesseract".to_owned(),
            engine_mode: 1,
        }
    }
}

impl TesseractEngine {
    /// Create an engine using the `tesseract` binary found on `PATH`.
    pub fn new() -> Self {
        Self::default()
    }
}

impl OcrEngine for TesseractEngine {
    #[instrument(level = "trace", skip_all, fields(%mode, language))]
    fn recognize(
        &self,
        image: &GrayImage,
        language: &str,
        mode: LayoutMode,
    ) -> Result<Recognition> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")
            .context("cannot create tesseract temporary directory")?;
        let input_path = tmpdir.path().join("input.png");
        image
            .save_with_format(&input_path, ImageFormat::Png)
            .context("cannot write tesseract input file")?;

        // Run tesseract, sending TSV to standard output.
        let output = Command::new(&self.program)
            .arg(&input_path)
            .arg("stdout")
            .args(["-l", language])
            .args(["--oem", &self.engine_mode.to_string()])
            .args(["--psm", &mode.psm().to_string()])
            .args(["-c", "preserve_interword_spaces=1"])
            .arg("tsv")
            .output()
            .with_context(|| format!("cannot run {}", self.program))?;
        check_for_command_failure("tesseract", &output, None)?;

        parse_tsv(&output.stdout)
    }
}

/// One row of tesseract's TSV output.
#[derive(Debug, Deserialize)]
struct TsvRow {
    level: u8,
    page_num: u32,
    block_num: u32,
    par_num: u32,
    line_num: u32,
    conf: f64,
    #[serde(default)]
    text: Option<String>,
}

/// Parse tesseract TSV output into a [`Recognition`].
pub(crate) fn parse_tsv(tsv: &[u8]) -> Result<Recognition> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .has_headers(true)
        .from_reader(tsv);

    let mut words = vec![];
    for row in reader.deserialize::<TsvRow>() {
        let row = row.context("cannot parse tesseract TSV output")?;
        if row.level != WORD_LEVEL {
            continue;
        }
        let Some(text) = row.text else {
            continue;
        };
        words.push(RecognizedWord {
            text,
            confidence: row.conf,
            line_key: (row.page_num, row.block_num, row.par_num, row.line_num),
        });
    }
    Ok(Recognition::from_words(words))
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    const SAMPLE_TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t640\t480\t-1\t
2\t1\t1\t0\t0\t0\t36\t92\t582\t90\t-1\t
4\t1\t1\t1\t1\t0\t36\t92\t400\t30\t-1\t
5\t1\t1\t1\t1\t1\t36\t92\t120\t30\t96.06\tCLIENTE:
5\t1\t1\t1\t1\t2\t170\t92\t140\t30\t91.5\tMARIA
5\t1\t1\t1\t2\t1\t36\t140\t90\t30\t88.0\t\"SOUZA\"
5\t1\t1\t1\t2\t2\t140\t140\t10\t30\t95.0\t
";

    #[test]
    fn parses_words_and_lines() {
        let recognition = parse_tsv(SAMPLE_TSV.as_bytes()).unwrap();
        assert_eq!(recognition.words.len(), 3);
        assert_eq!(recognition.text(), "CLIENTE: MARIA \"SOUZA\"");
        assert_eq!(recognition.raw_text(), "CLIENTE: MARIA\n\"SOUZA\"");
        let mean = recognition.mean_confidence();
        assert!((mean - (96.06 + 91.5 + 88.0) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn empty_output_is_an_empty_recognition() {
        let header = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n";
        let recognition = parse_tsv(header.as_bytes()).unwrap();
        assert!(recognition.words.is_empty());
    }

    #[test]
    #[ignore = "Requires tesseract to be installed"]
    fn blank_image_recognizes_nothing() {
        let image = GrayImage::from_pixel(200, 100, Luma([255]));
        let recognition = TesseractEngine::new()
            .recognize(&image, "eng", LayoutMode::SingleBlock)
            .unwrap();
        assert_eq!(recognition.text(), "");
    }
}
