//! Rendering input pages via Poppler's command-line tools.
//!
//! We treat the PDF rendering engine as an external collaborator with a
//! narrow contract: page count, per-page embedded text, and per-page
//! rasterization. Poppler's `pdfinfo`, `pdftotext` and `pdftocairo` cover
//! all three.

use std::{collections::BTreeMap, io::Cursor, process::Output, sync::LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use crate::prelude::*;

/// Render scale applied uniformly to every page. 2x balances recognition
/// accuracy against memory and time for typical scans.
pub const RENDER_SCALE: f32 = 2.0;

/// Poppler takes DPI rather than a scale factor. PDF points are 1/72", so
/// a 2x render is 144 DPI.
pub const RASTER_DPI: u32 = (72.0 * RENDER_SCALE) as u32;

/// Lines in Poppler's stderr that contain this are real errors.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// ...except for xref reconstruction chatter, which Poppler prints for many
/// perfectly usable PDFs.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// One rasterized page. The raster is transient: callers consume it and
/// drop it before the next page is rendered, so peak memory stays bounded
/// to a single page.
#[derive(Debug, Clone)]
pub struct Raster {
    /// JPEG-encoded page image.
    pub data: Vec<u8>,
    /// Pixel width of the rendered image.
    pub width_px: u32,
    /// Pixel height of the rendered image.
    pub height_px: u32,
}

/// Mapping from image-pixel space (origin top-left) to page-coordinate
/// space (points, origin bottom-left).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageTransform {
    /// Output page width in points.
    pub page_width_pt: f32,
    /// Output page height in points.
    pub page_height_pt: f32,
    /// Points per horizontal pixel.
    pub scale_x: f32,
    /// Points per vertical pixel.
    pub scale_y: f32,
}

impl PageTransform {
    /// Derive the transform for a raster produced at `scale`. The page's
    /// true output dimensions are the pixel dimensions divided by the
    /// render scale.
    pub fn new(raster: &Raster, scale: f32) -> Self {
        let page_width_pt = raster.width_px as f32 / scale;
        let page_height_pt = raster.height_px as f32 / scale;
        Self {
            page_width_pt,
            page_height_pt,
            scale_x: page_width_pt / raster.width_px as f32,
            scale_y: page_height_pt / raster.height_px as f32,
        }
    }

    /// Map a pixel coordinate into page space, flipping the vertical axis.
    pub fn to_page_space(&self, x_px: f32, y_px: f32) -> (f32, f32) {
        (
            x_px * self.scale_x,
            self.page_height_pt - y_px * self.scale_y,
        )
    }
}

/// Interface to the document rendering engine.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Check that any external resources the renderer needs are available.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// How many pages does the document have?
    async fn page_count(&self) -> Result<usize>;

    /// Extract the embedded text of a page (1-based index).
    async fn embedded_text(&self, page_no: usize) -> Result<String>;

    /// Rasterize a page (1-based index) at [`RENDER_SCALE`].
    async fn render_page(&self, page_no: usize) -> Result<Raster>;
}

/// [`PageRenderer`] backed by Poppler's CLI tools.
pub struct PopplerRenderer {
    /// Path to the input PDF.
    path: PathBuf,
}

impl PopplerRenderer {
    /// Create a renderer for the given PDF path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Check that the Poppler tools we depend on are actually runnable.
    /// They all print their version and exit 0 when passed `-v`.
    #[instrument(level = "debug")]
    pub async fn probe_tools() -> Result<()> {
        for tool in ["pdfinfo", "pdftotext", "pdftocairo"] {
            Command::new(tool)
                .arg("-v")
                .output()
                .await
                .with_context(|| {
                    format!("failed to run {tool} (is Poppler installed?)")
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl PageRenderer for PopplerRenderer {
    async fn prepare(&self) -> Result<()> {
        Self::probe_tools().await
    }

    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    async fn page_count(&self) -> Result<usize> {
        let output = Command::new("pdfinfo")
            .arg(&self.path)
            .output()
            .await
            .with_context(|| {
                format!("failed to run pdfinfo on {:?}", self.path.display())
            })?;
        check_for_command_failure("pdfinfo", &output, false)?;

        // pdfinfo prints "Key: value" lines.
        let stdout = String::from_utf8(output.stdout)
            .context("pdfinfo output was not valid UTF-8")?;
        let mut properties = BTreeMap::new();
        for line in stdout.lines() {
            let mut parts = line.splitn(2, ':');
            let key = parts.next().unwrap_or("").trim();
            let value = parts.next().unwrap_or("").trim();
            properties.insert(key.to_string(), value.to_string());
        }
        let page_count = properties
            .get("Pages")
            .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
        page_count.parse::<usize>().with_context(|| {
            format!(
                "failed to parse page count for {:?} from pdfinfo output",
                self.path.display()
            )
        })
    }

    #[instrument(level = "debug", skip_all, fields(page_no))]
    async fn embedded_text(&self, page_no: usize) -> Result<String> {
        let output = Command::new("pdftotext")
            .arg("-f")
            .arg(page_no.to_string())
            .arg("-l")
            .arg(page_no.to_string())
            .arg("-enc")
            .arg("UTF-8")
            .arg(&self.path)
            .arg("-")
            .output()
            .await
            .with_context(|| {
                format!("failed to run pdftotext on {:?}", self.path.display())
            })?;
        check_for_command_failure("pdftotext", &output, true)?;
        String::from_utf8(output.stdout).context("pdftotext output was not valid UTF-8")
    }

    #[instrument(level = "debug", skip_all, fields(page_no, dpi = RASTER_DPI))]
    async fn render_page(&self, page_no: usize) -> Result<Raster> {
        // Render into a scratch directory which is deleted as soon as the
        // bytes are in memory.
        let tmpdir = tempfile::TempDir::with_prefix("searchify-page")?;
        let out_base = tmpdir.path().join("page");
        let output = Command::new("pdftocairo")
            .arg("-jpeg")
            .arg("-r")
            .arg(RASTER_DPI.to_string())
            .arg("-f")
            .arg(page_no.to_string())
            .arg("-l")
            .arg(page_no.to_string())
            .arg("-singlefile")
            .arg(&self.path)
            .arg(&out_base)
            .output()
            .await
            .with_context(|| {
                format!("failed to run pdftocairo on {:?}", self.path.display())
            })?;
        check_for_command_failure("pdftocairo", &output, true)?;

        let out_path = out_base.with_extension("jpg");
        let data = tokio::fs::read(&out_path).await.with_context(|| {
            format!("failed to read rendered page {:?}", out_path.display())
        })?;
        let (width_px, height_px) = image::ImageReader::new(Cursor::new(&data))
            .with_guessed_format()
            .context("failed to sniff rendered page format")?
            .into_dimensions()
            .with_context(|| format!("failed to decode rendered page {page_no}"))?;
        Ok(Raster {
            data,
            width_px,
            height_px,
        })
    }
}

/// Report any command failures, and include any error output.
///
/// Poppler tools sometimes exit 0 while still printing errors, so callers
/// can also ask us to scan stderr for error-looking lines.
fn check_for_command_failure(
    command_name: &str,
    output: &Output,
    scan_stderr: bool,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(command_name, output = %stdout, "Standard output from command");
    if !stderr.is_empty() {
        debug!(command_name, output = %stderr, "Standard error from command");
    }

    if output.status.success() {
        if scan_stderr && stderr.lines().any(is_error_line) {
            return Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr
            ));
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr
        ))
    }
}

/// Does this stderr line contain an actual error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raster(width_px: u32, height_px: u32) -> Raster {
        Raster {
            data: vec![],
            width_px,
            height_px,
        }
    }

    #[test]
    fn page_dimensions_are_pixels_over_scale() {
        let transform = PageTransform::new(&raster(1224, 1584), RENDER_SCALE);
        assert_eq!(transform.page_width_pt, 612.0);
        assert_eq!(transform.page_height_pt, 792.0);
    }

    #[test]
    fn vertical_axis_is_flipped() {
        // 200px tall bitmap over a 100pt page: scale_y = 0.5.
        let transform = PageTransform::new(&raster(160, 200), 2.0);
        assert_eq!(transform.scale_y, 0.5);
        let (x, y) = transform.to_page_space(10.0, 30.0);
        assert_eq!(x, 5.0);
        assert_eq!(y, 100.0 - 30.0 * 0.5);
    }

    #[test]
    fn pixel_origin_maps_to_top_left_of_page() {
        let transform = PageTransform::new(&raster(1000, 500), 2.0);
        let (x, y) = transform.to_page_space(0.0, 0.0);
        assert_eq!((x, y), (0.0, transform.page_height_pt));
    }

    #[test]
    fn error_lines_are_detected() {
        assert!(is_error_line("Syntax Error: something bad"));
        assert!(!is_error_line("Syntax Warning: something mild"));
        // Poppler's xref reconstruction chatter is downgraded.
        assert!(!is_error_line("Syntax Error: xref num 12 not found"));
    }
}
