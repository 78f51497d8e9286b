//! Time x effect heatmap and its SVG export

use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::observation::{ArmId, ComparisonId};
use crate::render::{Frame, GridScale, Representation};
use crate::{Error, Result};

/// One row per frame (oldest first), one column per grid point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heatmap {
    comparison: ComparisonId,
    representation: Representation,
    scale: GridScale,
    axis: Vec<f64>,
    sample_counts: Vec<u64>,
    rows: Vec<Vec<f64>>,
    e_values: Vec<f64>,
    leading_arms: Vec<Option<ArmId>>,
    first_stop: Option<usize>,
}

impl Heatmap {
    pub(super) fn from_frames(comparison: ComparisonId, frames: &[Frame]) -> Result<Self> {
        let Some(first) = frames.first() else {
            return Err(Error::FrameNotFound {
                comparison: comparison.to_string(),
                frame_number: 0,
                available: 0,
            });
        };
        if let Some(odd) = frames
            .iter()
            .find(|f| f.grid() != first.grid() || f.representation() != first.representation())
        {
            return Err(Error::InvalidGridSpec(format!(
                "frame at sample count {} was rendered on a different grid than the first frame",
                odd.sample_count()
            )));
        }

        Ok(Self {
            representation: first.representation(),
            scale: first.grid().scale,
            axis: first.axis().to_vec(),
            sample_counts: frames.iter().map(Frame::sample_count).collect(),
            rows: frames.iter().map(|f| f.values().to_vec()).collect(),
            e_values: frames.iter().map(|f| f.summary().e_value).collect(),
            leading_arms: frames.iter().map(|f| f.summary().leading_arm.clone()).collect(),
            first_stop: frames.iter().position(|f| f.summary().recommend_stop),
            comparison,
        })
    }

    /// Comparison the frames belong to.
    #[must_use]
    pub const fn comparison(&self) -> &ComparisonId {
        &self.comparison
    }

    /// How cell values are to be read.
    #[must_use]
    pub const fn representation(&self) -> Representation {
        self.representation
    }

    /// Grid points shared by every row.
    #[must_use]
    pub fn axis(&self) -> &[f64] {
        &self.axis
    }

    /// Sample count of each row.
    #[must_use]
    pub fn sample_counts(&self) -> &[u64] {
        &self.sample_counts
    }

    /// Cell values, one row per frame.
    #[must_use]
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    /// E-value of each row.
    #[must_use]
    pub fn e_values(&self) -> &[f64] {
        &self.e_values
    }

    /// Leading arm of each row.
    #[must_use]
    pub fn leading_arms(&self) -> &[Option<ArmId>] {
        &self.leading_arms
    }

    /// Index of the first row that recommended stopping.
    #[must_use]
    pub const fn first_stop(&self) -> Option<usize> {
        self.first_stop
    }

    /// Standalone SVG document, time running downwards and the effect axis
    /// left to right.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_svg(&self, width: u32, height: u32) -> String {
        const MARGIN_LEFT: f64 = 64.0;
        const MARGIN_RIGHT: f64 = 96.0;
        const MARGIN_TOP: f64 = 32.0;
        const MARGIN_BOTTOM: f64 = 32.0;

        let width = f64::from(width.max(200));
        let height = f64::from(height.max(120));
        let plot_w = width - MARGIN_LEFT - MARGIN_RIGHT;
        let plot_h = height - MARGIN_TOP - MARGIN_BOTTOM;
        let cell_w = plot_w / self.axis.len().max(1) as f64;
        let cell_h = plot_h / self.rows.len().max(1) as f64;
        let peak = self
            .rows
            .iter()
            .flatten()
            .copied()
            .filter(|v| v.is_finite())
            .fold(0.0_f64, f64::max);

        let mut svg = String::new();
        // Writing to a String cannot fail.
        let _ = writeln!(
            svg,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}" font-family="sans-serif" font-size="11">"#
        );
        let _ = writeln!(
            svg,
            r#"<text x="{MARGIN_LEFT}" y="18" font-size="13">{} ({})</text>"#,
            escape(&self.comparison.to_string()),
            match self.representation {
                Representation::Density => "posterior density",
                Representation::ProbabilitySurface => "P(effect > x)",
            }
        );

        for (r, row) in self.rows.iter().enumerate() {
            let y = MARGIN_TOP + r as f64 * cell_h;
            for (c, value) in row.iter().enumerate() {
                let x = MARGIN_LEFT + c as f64 * cell_w;
                let t = if peak > 0.0 { (value / peak).clamp(0.0, 1.0) } else { 0.0 };
                let _ = writeln!(
                    svg,
                    r#"<rect x="{x:.2}" y="{y:.2}" width="{:.2}" height="{:.2}" fill="{}"/>"#,
                    cell_w + 0.05,
                    cell_h + 0.05,
                    ramp(t)
                );
            }
            let label_x = MARGIN_LEFT + plot_w + 6.0;
            let label_y = y + cell_h / 2.0 + 4.0;
            let arm = self.leading_arms[r]
                .as_ref()
                .map_or_else(|| "-".to_string(), |a| escape(a.as_str()));
            let _ = writeln!(
                svg,
                r#"<text x="{label_x:.2}" y="{label_y:.2}">n={} {arm}</text>"#,
                self.sample_counts[r]
            );
        }

        if let Some(stop) = self.first_stop {
            let y = MARGIN_TOP + stop as f64 * cell_h;
            let _ = writeln!(
                svg,
                r##"<line x1="{MARGIN_LEFT}" y1="{y:.2}" x2="{:.2}" y2="{y:.2}" stroke="#d62728" stroke-width="2"/>"##,
                MARGIN_LEFT + plot_w
            );
        }

        // Odds ratio 1 (no effect) reference line.
        if let Some(x) = self.column_of(1.0) {
            let x = MARGIN_LEFT + x * cell_w;
            let _ = writeln!(
                svg,
                r##"<line x1="{x:.2}" y1="{MARGIN_TOP}" x2="{x:.2}" y2="{:.2}" stroke="#444" stroke-dasharray="4 3"/>"##,
                MARGIN_TOP + plot_h
            );
        }

        if let (Some(lo), Some(hi)) = (self.axis.first(), self.axis.last()) {
            let base = MARGIN_TOP + plot_h + 16.0;
            let _ = writeln!(svg, r#"<text x="{MARGIN_LEFT}" y="{base:.2}">{lo:.3}</text>"#);
            let _ = writeln!(
                svg,
                r#"<text x="{:.2}" y="{base:.2}" text-anchor="end">{hi:.3}</text>"#,
                MARGIN_LEFT + plot_w
            );
        }
        svg.push_str("</svg>\n");
        svg
    }

    /// Write [`to_svg`](Self::to_svg) output to `path`.
    ///
    /// # Errors
    ///
    /// Returns IO errors.
    pub fn write_svg(&self, path: impl AsRef<Path>, width: u32, height: u32) -> Result<()> {
        std::fs::write(path, self.to_svg(width, height))?;
        Ok(())
    }

    // Fractional column index of an axis value, in display coordinates.
    #[allow(clippy::cast_precision_loss)]
    fn column_of(&self, value: f64) -> Option<f64> {
        let (&lo, &hi) = (self.axis.first()?, self.axis.last()?);
        if self.axis.len() < 2 || value < lo || value > hi {
            return None;
        }
        let t = match self.scale {
            GridScale::Linear => (value - lo) / (hi - lo),
            GridScale::Log => (value.ln() - lo.ln()) / (hi.ln() - lo.ln()),
        };
        Some(0.5 + t * (self.axis.len() - 1) as f64)
    }
}

// White to dark blue.
fn ramp(t: f64) -> String {
    let channel = |from: f64, to: f64| {
        let v = (to - from).mul_add(t, from).round().clamp(0.0, 255.0);
        // Clamped to the u8 range above.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let v = v as u8;
        v
    };
    format!(
        "#{:02x}{:02x}{:02x}",
        channel(255.0, 8.0),
        channel(255.0, 48.0),
        channel(255.0, 107.0)
    )
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
