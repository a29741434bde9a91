//! CSV batch scoring.

use crate::error::{Result, ValidationError};
use crate::features::{FEATURE_COUNT, FEATURE_NAMES};
use crate::pipeline::{Prediction, ScoringContext};
use ndarray::Array2;
use std::io::{Read, Write};
use tracing::{debug, info};

/// Name of the column that receives the predicted label.
pub const PREDICTION_COLUMN: &str = "Prediction";

#[derive(Clone, Debug, PartialEq)]
pub struct BatchTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl BatchTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    pub fn read_csv<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers = rdr.headers()?.iter().map(str::to_string).collect();
        let rows = rdr
            .records()
            .map(|r| r.map(|rec| rec.iter().map(str::to_string).collect()))
            .collect::<std::result::Result<Vec<Vec<String>>, _>>()?;
        Ok(Self { headers, rows })
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let idx = self.headers.iter().position(|h| h == name)?;
        Some(
            self.rows
                .iter()
                .map(|r| r.get(idx).map(String::as_str).unwrap_or(""))
                .collect(),
        )
    }

    /// Feature columns absent from the header, in canonical order.
    pub fn missing_features(&self) -> Vec<String> {
        FEATURE_NAMES
            .iter()
            .filter(|name| !self.headers.iter().any(|h| h == *name))
            .map(|name| name.to_string())
            .collect()
    }

    /// Extracts the `(n, 14)` feature matrix, or rejects the whole table.
    pub fn feature_matrix(&self) -> Result<Array2<f64>> {
        let missing = self.missing_features();
        if !missing.is_empty() {
            return Err(ValidationError::MissingColumns(missing).into());
        }
        let indices: Vec<usize> = FEATURE_NAMES
            .iter()
            .filter_map(|name| self.headers.iter().position(|h| h == name))
            .collect();
        let mut matrix = Array2::zeros((self.rows.len(), FEATURE_COUNT));
        for (r, row) in self.rows.iter().enumerate() {
            for (c, &idx) in indices.iter().enumerate() {
                let cell = row.get(idx).map(String::as_str).unwrap_or("");
                let value = cell
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| ValidationError::InvalidValue {
                        row: r + 1,
                        column: FEATURE_NAMES[c].to_string(),
                        value: cell.to_string(),
                    })?;
                matrix[[r, c]] = value;
            }
        }
        Ok(matrix)
    }

    /// Sets the prediction column, replacing an existing one.
    fn set_predictions(&mut self, predictions: &[Prediction]) {
        let idx = match self.headers.iter().position(|h| h == PREDICTION_COLUMN) {
            Some(idx) => idx,
            None => {
                self.headers.push(PREDICTION_COLUMN.to_string());
                self.headers.len() - 1
            }
        };
        for (row, p) in self.rows.iter_mut().zip(predictions) {
            if row.len() <= idx {
                row.resize(idx + 1, String::new());
            }
            row[idx] = p.state.label().to_string();
        }
    }
}

/// Validates, scores every row, and returns the table with predictions attached.
pub fn score_table(ctx: &ScoringContext, mut table: BatchTable) -> Result<BatchTable> {
    let matrix = table.feature_matrix()?;
    debug!(rows = table.len(), "scoring batch");
    let predictions = ctx.score_matrix(matrix.view())?;
    table.set_predictions(&predictions);
    info!(rows = predictions.len(), "batch scored");
    Ok(table)
}
