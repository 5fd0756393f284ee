use crate::engine::ExecutionContext;
use crate::error::RenderError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use tracing::{debug, instrument};

const CSS_PX_PER_INCH: f64 = 96.0;

/// Page-format keywords accepted for document jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PageFormat {
    A0,
    A1,
    A2,
    A3,
    #[default]
    A4,
    A5,
    A6,
    Letter,
    Legal,
    Tabloid,
    Ledger,
}

impl PageFormat {
    pub const ALL: [PageFormat; 11] = [
        PageFormat::A0,
        PageFormat::A1,
        PageFormat::A2,
        PageFormat::A3,
        PageFormat::A4,
        PageFormat::A5,
        PageFormat::A6,
        PageFormat::Letter,
        PageFormat::Legal,
        PageFormat::Tabloid,
        PageFormat::Ledger,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PageFormat::A0 => "A0",
            PageFormat::A1 => "A1",
            PageFormat::A2 => "A2",
            PageFormat::A3 => "A3",
            PageFormat::A4 => "A4",
            PageFormat::A5 => "A5",
            PageFormat::A6 => "A6",
            PageFormat::Letter => "Letter",
            PageFormat::Legal => "Legal",
            PageFormat::Tabloid => "Tabloid",
            PageFormat::Ledger => "Ledger",
        }
    }

    /// Portrait (width, height) in inches
    pub fn dimensions_in(&self) -> (f64, f64) {
        match self {
            PageFormat::A0 => (33.11, 46.81),
            PageFormat::A1 => (23.39, 33.11),
            PageFormat::A2 => (16.54, 23.39),
            PageFormat::A3 => (11.69, 16.54),
            PageFormat::A4 => (8.27, 11.69),
            PageFormat::A5 => (5.83, 8.27),
            PageFormat::A6 => (4.13, 5.83),
            PageFormat::Letter => (8.5, 11.0),
            PageFormat::Legal => (8.5, 14.0),
            PageFormat::Tabloid => (11.0, 17.0),
            PageFormat::Ledger => (17.0, 11.0),
        }
    }
}

impl fmt::Display for PageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PageFormat {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| RenderError::Validation(format!("unsupported page format: {s}")))
    }
}

/// Convert a CSS length (`20px`, `1in`, `2.5cm`, `10mm`, `12pt`, `0`) to inches
///
/// A bare number is taken as pixels.
pub fn css_length_to_inches(value: &str) -> Result<f64, RenderError> {
    let trimmed = value.trim().to_ascii_lowercase();
    let invalid = || RenderError::Validation(format!("invalid CSS length: {value:?}"));

    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let number: f64 = number.trim().parse().map_err(|_| invalid())?;
    if !number.is_finite() || number < 0.0 {
        return Err(invalid());
    }

    let inches = match unit {
        "" | "px" => number / CSS_PX_PER_INCH,
        "in" => number,
        "cm" => number / 2.54,
        "mm" => number / 25.4,
        "pt" => number / 72.0,
        _ => return Err(invalid()),
    };

    Ok(inches)
}

/// Margins in inches
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginInches {
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PdfSettings {
    pub page_format: PageFormat,
    pub landscape: bool,
    pub print_background: bool,
    pub margin: MarginInches,
}

impl PdfSettings {
    /// Portrait paper size in inches; orientation travels as `landscape`
    pub fn paper_size(&self) -> (f64, f64) {
        self.page_format.dimensions_in()
    }
}

/// Raster encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Lossy, smaller files
    #[default]
    Jpeg,
    /// Lossless
    Png,
    /// Lossy with good size/quality balance
    Webp,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::Webp => "image/webp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
        }
    }

    pub fn is_lossless(&self) -> bool {
        matches!(self, OutputFormat::Png)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            "webp" => Ok(OutputFormat::Webp),
            _ => Err(RenderError::Validation(format!("unsupported output format: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterSettings {
    pub format: OutputFormat,
    /// `None` for lossless encodings
    pub quality: Option<u8>,
    pub full_page: bool,
}

impl RasterSettings {
    pub fn new(format: OutputFormat, quality: u8, full_page: bool) -> Self {
        Self {
            format,
            quality: (!format.is_lossless()).then_some(quality),
            full_page,
        }
    }
}

/// Captured bytes plus what we know about them
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub pixel_size: Option<(u32, u32)>,
}

impl Artifact {
    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }
}

/// Turns the current state of a context into a paged document or a raster
#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureEngine;

impl CaptureEngine {
    #[instrument(skip(self, context), fields(format = %settings.page_format))]
    pub async fn document(
        &self,
        context: &dyn ExecutionContext,
        settings: &PdfSettings,
    ) -> Result<Artifact, RenderError> {
        let bytes = context
            .print_document(settings)
            .await
            .map_err(into_capture_error)?;

        if bytes.is_empty() {
            return Err(RenderError::Capture("engine returned an empty document".to_string()));
        }

        debug!("Printed {} byte document", bytes.len());
        Ok(Artifact {
            bytes,
            content_type: "application/pdf",
            pixel_size: None,
        })
    }

    #[instrument(
        skip(self, context),
        fields(format = %settings.format, full_page = settings.full_page)
    )]
    pub async fn raster(
        &self,
        context: &dyn ExecutionContext,
        settings: &RasterSettings,
    ) -> Result<Artifact, RenderError> {
        let bytes = context
            .capture_raster(settings)
            .await
            .map_err(into_capture_error)?;

        if bytes.is_empty() {
            return Err(RenderError::Capture("engine returned an empty image".to_string()));
        }

        let pixel_size = pixel_size(&bytes);
        debug!("Captured {} byte image, dimensions {:?}", bytes.len(), pixel_size);

        Ok(Artifact {
            bytes,
            content_type: settings.format.content_type(),
            pixel_size,
        })
    }
}

fn into_capture_error(err: RenderError) -> RenderError {
    match err {
        RenderError::Capture(_) => err,
        other => RenderError::Capture(other.to_string()),
    }
}

/// Decode just the header of an encoded image
pub fn pixel_size(bytes: &[u8]) -> Option<(u32, u32)> {
    image::io::Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn css_lengths_convert_to_inches() {
        assert!(approx(css_length_to_inches("20px").unwrap(), 20.0 / 96.0));
        assert!(approx(css_length_to_inches("96").unwrap(), 1.0));
        assert!(approx(css_length_to_inches("1in").unwrap(), 1.0));
        assert!(approx(css_length_to_inches("2.54cm").unwrap(), 1.0));
        assert!(approx(css_length_to_inches(" 25.4MM ").unwrap(), 1.0));
        assert!(approx(css_length_to_inches("72pt").unwrap(), 1.0));
        assert!(approx(css_length_to_inches("0").unwrap(), 0.0));
    }

    #[test]
    fn bad_css_lengths_are_validation_errors() {
        for bad in ["", "px", "-3px", "12em", "ten px", "NaN"] {
            assert!(
                matches!(css_length_to_inches(bad), Err(RenderError::Validation(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn page_formats_parse_case_insensitively() {
        assert_eq!("a4".parse::<PageFormat>().unwrap(), PageFormat::A4);
        assert_eq!("LETTER".parse::<PageFormat>().unwrap(), PageFormat::Letter);
        assert!("B5".parse::<PageFormat>().is_err());
        assert_eq!(PageFormat::default(), PageFormat::A4);
    }

    #[test]
    fn paper_size_stays_portrait_in_landscape() {
        let mut settings = PdfSettings {
            page_format: PageFormat::Letter,
            landscape: false,
            print_background: true,
            margin: MarginInches {
                top: 0.0,
                right: 0.0,
                bottom: 0.0,
                left: 0.0,
            },
        };
        let (width, height) = settings.paper_size();
        assert!(approx(width, 8.5));
        assert!(approx(height, 11.0));

        settings.landscape = true;
        assert_eq!(settings.paper_size(), (width, height));
    }

    #[test]
    fn lossless_formats_drop_quality() {
        assert_eq!(RasterSettings::new(OutputFormat::Png, 80, true).quality, None);
        assert_eq!(RasterSettings::new(OutputFormat::Jpeg, 80, true).quality, Some(80));
        assert_eq!(OutputFormat::Webp.content_type(), "image/webp");
        assert_eq!("JPG".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
    }

    #[test]
    fn pixel_size_reads_encoded_headers() {
        let img = image::DynamicImage::new_rgb8(4, 3);
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageOutputFormat::Png).unwrap();

        assert_eq!(pixel_size(buf.get_ref()), Some((4, 3)));
        assert_eq!(pixel_size(b"not an image"), None);
    }
}
