//! Zarr V3 writer for retrieval results.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use zarrs::array::codec::bytes_to_bytes::blosc::{
    BloscCodec, BloscCompressionLevel, BloscCompressor, BloscShuffleMode,
};
use zarrs::array::{ArrayBuilder, DataType, Element, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::group::GroupBuilder;
use zarrs_filesystem::FilesystemStore;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::config::{ZarrCompression, ZarrOutputConfig};
use crate::dataset::{RetrievalResults, ALTITUDE, LATITUDE, LONGITUDE, TIME};
use crate::encoding::{encoding_for, EncodedData};
use crate::error::{InferenceError, Result};

/// Result of writing a retrieval to Zarr.
#[derive(Debug)]
pub struct ZarrWriteResult {
    pub path: PathBuf,
    /// Arrays written, coordinates included.
    pub arrays: Vec<String>,
    /// Uncompressed bytes written.
    pub bytes_written: u64,
}

/// Writer for storing retrieval results as Zarr V3 hierarchies.
#[derive(Debug, Clone)]
pub struct ZarrWriter {
    config: ZarrOutputConfig,
}

/// Description of one array to write.
struct ArraySpec<'a> {
    name: &'a str,
    dims: Vec<String>,
    shape: Vec<u64>,
    data_type: DataType,
    fill_value: FillValue,
    attributes: Map<String, Value>,
    typesize: usize,
}

impl ZarrWriter {
    pub fn new(config: ZarrOutputConfig) -> Self {
        Self { config }
    }

    /// Write `results` to a new Zarr hierarchy at `path`.
    ///
    /// The hierarchy is built in a staging directory next to `path` and moved
    /// into place once complete, so a failed write leaves nothing at `path`.
    /// An existing hierarchy at `path` is replaced.
    pub fn write(&self, path: &Path, results: &RetrievalResults) -> Result<ZarrWriteResult> {
        let sizes = results.dimension_sizes()?;
        check_coordinate(TIME, results.time.len(), sizes.get(TIME))?;
        check_coordinate(LATITUDE, results.latitude.len(), sizes.get(LATITUDE))?;
        check_coordinate(LONGITUDE, results.longitude.len(), sizes.get(LONGITUDE))?;

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".partial")
            .tempdir_in(parent)?;

        let (arrays, bytes_written) = self.write_hierarchy(staging.path(), results)?;

        if path.exists() {
            debug!(path = %path.display(), "Replacing existing output");
            std::fs::remove_dir_all(path)?;
        }
        std::fs::rename(staging.path(), path)?;

        info!(
            path = %path.display(),
            arrays = arrays.len(),
            bytes_written,
            compression = %self.config.compression,
            "Wrote retrieval results"
        );

        Ok(ZarrWriteResult {
            path: path.to_path_buf(),
            arrays,
            bytes_written,
        })
    }

    /// Write the group and all arrays into the store at `root`.
    fn write_hierarchy(
        &self,
        root: &Path,
        results: &RetrievalResults,
    ) -> Result<(Vec<String>, u64)> {
        let store = Arc::new(
            FilesystemStore::new(root).map_err(|e| InferenceError::storage_error(e.to_string()))?,
        );

        let mut group_attrs = Map::new();
        for (key, value) in &results.attributes {
            group_attrs.insert(key.clone(), json!(value));
        }
        let group = GroupBuilder::new()
            .attributes(group_attrs)
            .build(store.clone(), "/")
            .map_err(|e| InferenceError::storage_error(e.to_string()))?;
        group
            .store_metadata()
            .map_err(|e| InferenceError::storage_error(e.to_string()))?;

        let mut arrays = Vec::new();
        let mut bytes_written = 0u64;

        if !results.time.is_empty() {
            let seconds: Vec<i64> = results.time.iter().map(|t| t.timestamp()).collect();
            let mut attributes = Map::new();
            attributes.insert(
                "units".to_string(),
                json!("seconds since 1970-01-01 00:00:00"),
            );
            attributes.insert("calendar".to_string(), json!("standard"));
            bytes_written += self.write_array(
                &store,
                ArraySpec {
                    name: TIME,
                    dims: vec![TIME.to_string()],
                    shape: vec![seconds.len() as u64],
                    data_type: DataType::Int64,
                    fill_value: FillValue::from(0i64),
                    attributes,
                    typesize: 8,
                },
                &seconds,
            )?;
            arrays.push(TIME.to_string());
        }

        let mut coordinates: Vec<(&str, Vec<f32>, &str)> = Vec::new();
        if !results.latitude.is_empty() {
            let values = results.latitude.iter().map(|&v| v as f32).collect();
            coordinates.push((LATITUDE, values, "degrees_north"));
        }
        if !results.longitude.is_empty() {
            let values = results.longitude.iter().map(|&v| v as f32).collect();
            coordinates.push((LONGITUDE, values, "degrees_east"));
        }
        if let Some(altitude) = &results.altitude {
            coordinates.push((ALTITUDE, altitude.clone(), "m"));
        }

        for (name, values, units) in coordinates {
            let mut attributes = Map::new();
            attributes.insert("units".to_string(), json!(units));
            bytes_written += self.write_array(
                &store,
                ArraySpec {
                    name,
                    dims: vec![name.to_string()],
                    shape: vec![values.len() as u64],
                    data_type: DataType::Float32,
                    fill_value: FillValue::from(f32::NAN),
                    attributes,
                    typesize: 4,
                },
                &values,
            )?;
            arrays.push(name.to_string());
        }

        for (name, variable) in &results.variables {
            let encoding = encoding_for(name);
            let encoded = encoding.encode(&variable.data)?;
            let shape: Vec<u64> = encoded.shape().iter().map(|&n| n as u64).collect();
            let attributes = encoding.attributes();

            bytes_written += match encoded {
                EncodedData::Float32(data) => {
                    let values: Vec<f32> = data.iter().copied().collect();
                    self.write_array(
                        &store,
                        ArraySpec {
                            name,
                            dims: variable.dims.clone(),
                            shape,
                            data_type: DataType::Float32,
                            fill_value: FillValue::from(f32::NAN),
                            attributes,
                            typesize: 4,
                        },
                        &values,
                    )?
                }
                EncodedData::UInt8(data) => {
                    let values: Vec<u8> = data.iter().copied().collect();
                    self.write_array(
                        &store,
                        ArraySpec {
                            name,
                            dims: variable.dims.clone(),
                            shape,
                            data_type: DataType::UInt8,
                            fill_value: FillValue::from(crate::encoding::UINT8_FILL),
                            attributes,
                            typesize: 1,
                        },
                        &values,
                    )?
                }
            };
            arrays.push(name.clone());
        }

        Ok((arrays, bytes_written))
    }

    fn write_array<T: Element>(
        &self,
        store: &Arc<FilesystemStore>,
        spec: ArraySpec<'_>,
        values: &[T],
    ) -> Result<u64> {
        let chunk_shape: Vec<u64> = spec
            .dims
            .iter()
            .zip(&spec.shape)
            .map(|(dim, &len)| {
                let chunk = if dim == LATITUDE || dim == LONGITUDE {
                    len.min(self.config.chunk_size as u64)
                } else if dim == TIME {
                    1
                } else {
                    len
                };
                chunk.max(1)
            })
            .collect();

        let chunk_grid: zarrs::array::ChunkGrid = chunk_shape
            .try_into()
            .map_err(|e| InferenceError::storage_error(format!("{:?}", e)))?;

        let mut attributes = spec.attributes;
        attributes.insert("_ARRAY_DIMENSIONS".to_string(), json!(spec.dims));

        let mut binding =
            ArrayBuilder::new(spec.shape.clone(), spec.data_type, chunk_grid, spec.fill_value);
        let mut builder = binding.attributes(attributes);

        if self.config.compression != ZarrCompression::None {
            let codec = self.create_compression_codec(spec.typesize)?;
            builder = builder.bytes_to_bytes_codecs(vec![codec]);
        }

        let path = format!("/{}", spec.name);
        let array = builder
            .build(store.clone(), &path)
            .map_err(|e| InferenceError::storage_error(e.to_string()))?;

        array
            .store_metadata()
            .map_err(|e| InferenceError::storage_error(e.to_string()))?;

        let start = vec![0; spec.shape.len()];
        let subset = ArraySubset::new_with_start_shape(start, spec.shape)
            .map_err(|e| InferenceError::storage_error(e.to_string()))?;
        array
            .store_array_subset_elements(&subset, values)
            .map_err(|e| InferenceError::storage_error(e.to_string()))?;

        debug!(array = spec.name, elements = values.len(), "Stored array");

        Ok((values.len() * std::mem::size_of::<T>()) as u64)
    }

    fn create_compression_codec(
        &self,
        typesize: usize,
    ) -> Result<Arc<dyn zarrs::array::codec::BytesToBytesCodecTraits>> {
        let level = BloscCompressionLevel::try_from(self.config.compression_level)
            .map_err(|_| InferenceError::invalid_settings("Invalid compression level"))?;

        let compressor = match self.config.compression {
            ZarrCompression::None => {
                return Err(InferenceError::invalid_settings(
                    "No compression configured",
                ))
            }
            ZarrCompression::BloscLz4 => BloscCompressor::LZ4,
            ZarrCompression::BloscZstd => BloscCompressor::Zstd,
        };

        let shuffle = if typesize > 1 {
            BloscShuffleMode::BitShuffle
        } else {
            BloscShuffleMode::NoShuffle
        };

        let codec = BloscCodec::new(compressor, level, None, shuffle, Some(typesize))
            .map_err(|e| InferenceError::invalid_settings(e.to_string()))?;

        Ok(Arc::new(codec))
    }
}

fn check_coordinate(name: &str, len: usize, expected: Option<&usize>) -> Result<()> {
    match expected {
        Some(&expected) if len != 0 && len != expected => Err(InferenceError::shape_mismatch(
            format!("coordinate '{name}' has {len} values, variables have {expected}"),
        )),
        _ => Ok(()),
    }
}
