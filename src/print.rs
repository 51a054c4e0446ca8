//! Print layout options for PDF captures
//!
//! Paper sizes and margins are expressed the way callers send them (`A4`,
//! `1.5cm`) and converted to inches, the unit the DevTools printing command
//! expects.

use crate::CaptureError;
use std::str::FromStr;

/// Named paper sizes, dimensions in inches (portrait)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaperFormat {
    Letter,
    Legal,
    Tabloid,
    Ledger,
    A0,
    A1,
    A2,
    A3,
    #[default]
    A4,
    A5,
    A6,
}

impl PaperFormat {
    pub fn size_inches(&self) -> (f64, f64) {
        match self {
            PaperFormat::Letter => (8.5, 11.0),
            PaperFormat::Legal => (8.5, 14.0),
            PaperFormat::Tabloid => (11.0, 17.0),
            PaperFormat::Ledger => (17.0, 11.0),
            PaperFormat::A0 => (33.1, 46.8),
            PaperFormat::A1 => (23.4, 33.1),
            PaperFormat::A2 => (16.54, 23.4),
            PaperFormat::A3 => (11.7, 16.54),
            PaperFormat::A4 => (8.27, 11.7),
            PaperFormat::A5 => (5.83, 8.27),
            PaperFormat::A6 => (4.13, 5.83),
        }
    }
}

impl FromStr for PaperFormat {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "letter" => PaperFormat::Letter,
            "legal" => PaperFormat::Legal,
            "tabloid" => PaperFormat::Tabloid,
            "ledger" => PaperFormat::Ledger,
            "a0" => PaperFormat::A0,
            "a1" => PaperFormat::A1,
            "a2" => PaperFormat::A2,
            "a3" => PaperFormat::A3,
            "a4" => PaperFormat::A4,
            "a5" => PaperFormat::A5,
            "a6" => PaperFormat::A6,
            _ => return Err(CaptureError::validation(format!("Unknown paper format {s}"))),
        })
    }
}

/// A CSS length as accepted in margin parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CssLength {
    inches: f64,
}

impl CssLength {
    const PX_PER_INCH: f64 = 96.0;

    pub fn from_inches(inches: f64) -> Self {
        Self { inches }
    }

    pub fn inches(&self) -> f64 {
        self.inches
    }
}

impl FromStr for CssLength {
    type Err = CaptureError;

    /// Unitless values are pixels.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_ascii_lowercase();
        let split = raw
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(raw.len());
        let (number, unit) = raw.split_at(split);
        let value: f64 = number
            .trim()
            .parse()
            .map_err(|_| CaptureError::validation(format!("Invalid length {s}")))?;
        if !value.is_finite() || value < 0.0 {
            return Err(CaptureError::validation(format!("Invalid length {s}")));
        }

        let inches = match unit {
            "" | "px" => value / Self::PX_PER_INCH,
            "in" => value,
            "cm" => value / 2.54,
            "mm" => value / 25.4,
            _ => return Err(CaptureError::validation(format!("Unknown length unit in {s}"))),
        };
        Ok(Self { inches })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Margins {
    pub top: CssLength,
    pub right: CssLength,
    pub bottom: CssLength,
    pub left: CssLength,
}

impl Default for Margins {
    fn default() -> Self {
        let margin = CssLength::from_inches(1.5 / 2.54);
        Self {
            top: margin,
            right: margin,
            bottom: margin,
            left: margin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PrintOptions {
    pub landscape: bool,
    /// Footer label; `Some("")` prints only the page counter.
    pub footer: Option<String>,
    pub format: PaperFormat,
    pub margins: Margins,
    pub page_ranges: String,
}

impl PrintOptions {
    pub fn validate(&self) -> Result<(), CaptureError> {
        let valid_ranges = self
            .page_ranges
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '-' | ',' | ' '));
        if !valid_ranges {
            return Err(CaptureError::validation(format!(
                "Invalid page ranges {}",
                self.page_ranges
            )));
        }

        let (width, height) = self.oriented_size();
        let m = &self.margins;
        if m.left.inches() + m.right.inches() >= width
            || m.top.inches() + m.bottom.inches() >= height
        {
            return Err(CaptureError::validation("Margins leave no printable area"));
        }
        Ok(())
    }

    /// Portrait paper width and height in inches. The printer rotates the
    /// sheet itself when `landscape` is set.
    pub fn paper_size(&self) -> (f64, f64) {
        self.format.size_inches()
    }

    /// Width and height of the printed page as it comes out, in inches.
    pub fn oriented_size(&self) -> (f64, f64) {
        let (width, height) = self.paper_size();
        if self.landscape {
            (height, width)
        } else {
            (width, height)
        }
    }

    pub fn footer_template(&self) -> Option<String> {
        self.footer.as_deref().map(footer_template)
    }
}

/// Footer shown on every printed page: the label on the left, page counter on the right.
pub fn footer_template(label: &str) -> String {
    format!(
        r#"<style>
.footer {{
  position: absolute;
  width: 100%;
  font-size: 12px;
  color: black;
  margin: 6px;
  z-index: 1000;
}}
.footer .right {{
  float: right;
  margin-right: 12px;
}}
</style>
<div class="footer">
  <div class="right">
    <span class="pageNumber"></span>/<span class="totalPages"></span>
  </div>
  <div class="left">
    <span>{}</span>
  </div>
</div>"#,
        escape_html(label)
    )
}

fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}
