use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path;

use failure::Fail;

use super::cli_utils;
use super::resolver::{FeatureIndex, FeatureIndexError};

#[derive(Debug, Fail)]
pub enum IndexIoError {
    #[fail(display = "I/O error: {}", _0)]
    Io(std::io::Error),
    #[fail(display = "Index encoding error: {}", _0)]
    Encoding(bincode::Error),
}

pub fn load_index(input_path: &path::Path) -> Result<FeatureIndex, IndexIoError> {
    let progress_bar = cli_utils::create_progress_bar_count(false, "Loading index...", None);
    progress_bar.enable_steady_tick(200);

    let file_reader = File::open(input_path).map_err(IndexIoError::Io)?;
    let buf_reader = BufReader::new(file_reader);
    let result = bincode::deserialize_from(buf_reader).map_err(IndexIoError::Encoding);

    progress_bar.finish();
    result
}

pub fn save_index(index: &FeatureIndex, output_path: &path::Path) -> Result<(), IndexIoError> {
    let file_writer = File::create(output_path).map_err(IndexIoError::Io)?;
    let buf_writer = BufWriter::new(file_writer);
    bincode::serialize_into(buf_writer, index).map_err(IndexIoError::Encoding)
}

pub fn build_index<P: AsRef<path::Path>>(
    geojson_path: P,
    id_property: &str,
) -> Result<FeatureIndex, FeatureIndexError> {
    FeatureIndex::from_file(geojson_path, id_property)
}
