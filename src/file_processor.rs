use std::io;
use std::time;

use failure::Fail;
use log::{info, warn};
use rayon::prelude::*;

use super::cli_utils;
use super::resolver::{FeatureIndex, ResolverConfig, Shape};

const MISSING_PROPERTY_VALUE: &str = "-";

/// Where each entity row's geometry comes from.
pub enum GeometrySource {
    /// A column holding a serialized GeoJSON geometry. 0-based.
    GeoJsonColumn(usize),
    /// A longitude/latitude column pair (point entities). 0-based.
    LonLatColumns { longitude: usize, latitude: usize },
}

#[derive(Debug)]
pub struct ProcessStats {
    pub total_rows: u32,
    pub matched_rows: u32,
    pub unmatched_rows: u32,
    pub invalid_rows: u32,
}

#[derive(Debug, Fail)]
pub enum FileProcessorError {
    #[fail(display = "I/O error: {}", _0)]
    Io(io::Error),
    #[fail(display = "Csv error: {}", _0)]
    Csv(csv::Error),
}

impl From<csv::Error> for FileProcessorError {
    fn from(err: csv::Error) -> FileProcessorError {
        FileProcessorError::Csv(err)
    }
}

enum RowOutcome {
    Matched {
        feature_id: String,
        score: f64,
        values: Vec<String>,
    },
    Unmatched,
    Invalid,
}

#[inline]
fn record_size(record: &csv::StringRecord) -> u64 {
    let size: usize = record.iter().map(|field| field.len()).sum();
    size as u64
}

fn entity_shape(record: &csv::StringRecord, source: &GeometrySource) -> Option<Shape> {
    match source {
        GeometrySource::GeoJsonColumn(column) => {
            let text = record.get(*column)?;
            if text.trim().is_empty() {
                return None;
            }
            let geometry: geojson::Geometry = serde_json::from_str(text).ok()?;
            Shape::from_geojson(geometry.value).ok()
        }
        GeometrySource::LonLatColumns {
            longitude,
            latitude,
        } => {
            let lon = record.get(*longitude).and_then(|v| v.parse::<f64>().ok())?;
            let lat = record.get(*latitude).and_then(|v| v.parse::<f64>().ok())?;
            if !lon.is_finite() || !lat.is_finite() {
                return None;
            }
            Some(Shape::Point(geo_types::Point::new(lon, lat)))
        }
    }
}

#[inline]
fn pad_row(new_record: &mut csv::StringRecord, property_count: usize) {
    new_record.push_field(""); // feature_id
    new_record.push_field(""); // score
    for _ in 0..property_count {
        new_record.push_field("");
    }
}

/// Resolves every entity row of `input` against `index` and writes the rows
/// back out extended with the selected feature. Entities and outcomes are
/// held in memory; the scoring loop runs in parallel over the immutable
/// index, and rows are written afterwards in input order so reruns are
/// byte-identical.
pub fn assign_features(
    index: &FeatureIndex,
    config: &ResolverConfig,
    input: &mut dyn io::Read,
    input_size: Option<u64>,
    output: &mut dyn io::Write,
    delimiter: u8,
    geometry_source: &GeometrySource,
    properties: &[String],
    has_header: bool,
    write_status: bool,
) -> Result<ProcessStats, FileProcessorError> {
    let start_instant = time::Instant::now();

    let read_bar = cli_utils::create_progress_bar_bytes(false, "Reading entities...", input_size);

    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false) // The header row is carried through by hand.
        .flexible(true)
        .from_reader(input);

    let mut header: Option<csv::StringRecord> = None;
    let mut records: Vec<csv::StringRecord> = Vec::new();
    let mut unreadable_rows = 0;

    for (line_number, record_result) in csv_reader.records().enumerate() {
        match record_result {
            Err(err) => {
                warn!("Unable to read line {}: {}", line_number + 1, err);
                unreadable_rows += 1;
            }
            Ok(record) => {
                read_bar.inc(record_size(&record));
                if has_header && line_number == 0 {
                    header = Some(record);
                } else {
                    records.push(record);
                }
            }
        }
    }
    read_bar.finish();

    let mut shapes: Vec<Option<Shape>> = Vec::with_capacity(records.len());
    for (position, record) in records.iter().enumerate() {
        let shape = entity_shape(record, geometry_source);
        if shape.is_none() {
            let line_number = position + if has_header { 2 } else { 1 };
            warn!(
                "Skipping entity at line {}: null or unparseable geometry",
                line_number
            );
        }
        shapes.push(shape);
    }

    let score_bar = cli_utils::create_progress_bar_count(
        false,
        "Scoring entities...",
        Some(records.len() as u64),
    );

    let outcomes: Vec<RowOutcome> = shapes
        .par_iter()
        .map(|shape| {
            let outcome = match shape {
                None => RowOutcome::Invalid,
                Some(shape) => match index.resolve_one(shape, config) {
                    None => RowOutcome::Unmatched,
                    Some(assignment) => RowOutcome::Matched {
                        feature_id: assignment.feature_id.to_owned(),
                        score: assignment.score,
                        values: properties
                            .iter()
                            .map(|property| {
                                assignment
                                    .properties
                                    .get(property)
                                    .cloned()
                                    .unwrap_or_else(|| MISSING_PROPERTY_VALUE.to_owned())
                            })
                            .collect(),
                    },
                },
            };
            score_bar.inc(1);
            outcome
        })
        .collect();

    score_bar.finish();

    let mut csv_writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_writer(output);

    if let Some(header) = header {
        let mut new_header: Vec<String> = header.iter().map(String::from).collect();
        new_header.push("feature_id".to_owned());
        new_header.push("score".to_owned());
        for property in properties {
            new_header.push(property.clone());
        }
        if write_status {
            new_header.push("status".to_owned());
        }
        csv_writer.write_record(&new_header)?;
    }

    let mut matched_rows = 0;
    let mut unmatched_rows = 0;
    let mut invalid_rows = 0;

    for (record, outcome) in records.iter().zip(&outcomes) {
        let mut new_record = record.clone();
        match outcome {
            RowOutcome::Matched {
                feature_id,
                score,
                values,
            } => {
                matched_rows += 1;
                new_record.push_field(feature_id);
                new_record.push_field(&score.to_string());
                for value in values {
                    new_record.push_field(value);
                }
                if write_status {
                    new_record.push_field("matched");
                }
            }
            RowOutcome::Unmatched => {
                unmatched_rows += 1;
                pad_row(&mut new_record, properties.len());
                if write_status {
                    new_record.push_field("unmatched");
                }
            }
            RowOutcome::Invalid => {
                invalid_rows += 1;
                pad_row(&mut new_record, properties.len());
                if write_status {
                    new_record.push_field("invalid");
                }
            }
        }
        csv_writer.write_record(&new_record)?;
    }

    csv_writer.flush().map_err(FileProcessorError::Io)?;

    let total_rows = records.len() as u32 + unreadable_rows;
    let elapsed_secs = start_instant.elapsed().as_millis() as f32 / 1000.0f32;
    info!(
        "Processed {} rows of data in {} seconds. Avg: {} rows/sec",
        total_rows,
        elapsed_secs,
        (total_rows as f32) / elapsed_secs
    );

    Ok(ProcessStats {
        total_rows,
        matched_rows,
        unmatched_rows,
        invalid_rows: invalid_rows + unreadable_rows,
    })
}
