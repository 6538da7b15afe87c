//! Parquet file writer
use crate::errors::PersistenceError;
use crate::FrameOutput;
use arrow::array::{ArrayRef, Int16Builder, UInt16Builder, UInt64Builder, UInt8Builder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

/// One row per detected object
fn create_schema() -> Schema {
    Schema::new(vec![
        Field::new("frame", DataType::UInt64, false),
        Field::new("range_idx", DataType::UInt16, false),
        Field::new("doppler_idx", DataType::Int16, false),
        Field::new("peak_val", DataType::UInt16, false),
        Field::new("x", DataType::Int16, false),
        Field::new("y", DataType::Int16, false),
        Field::new("z", DataType::Int16, false),
        Field::new("azimuth_bin", DataType::UInt16, false),
        Field::new("doa_state", DataType::UInt8, false),
    ])
}

/// A batch writer to write detected objects to a Parquet file.
pub struct BatchWriter {
    writer: Option<ArrowWriter<File>>,
    schema: Arc<Schema>,
}

impl BatchWriter {
    pub fn new(file_path: PathBuf) -> Result<Self, PersistenceError> {
        let file = File::create(&file_path)?;
        let schema = Arc::new(create_schema());
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let writer = ArrowWriter::try_new(file, schema.clone(), Some(props))
            .map_err(|e| PersistenceError::Parquet(e.to_string()))?;
        Ok(Self {
            writer: Some(writer),
            schema,
        })
    }

    /// Write a record batch
    fn write(&mut self, batch: RecordBatch) -> Result<(), PersistenceError> {
        if let Some(writer) = &mut self.writer {
            writer
                .write(&batch)
                .map_err(|e| PersistenceError::Parquet(e.to_string()))
        } else {
            Err(PersistenceError::Parquet(
                "Writer has been finalized".into(),
            ))
        }
    }

    /// Finalize the writer by taking ownership and closing it.
    /// Returns the number of rows in the file.
    pub fn finalize(&mut self) -> Result<u64, PersistenceError> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| PersistenceError::Parquet("Writer already finalized".into()))?;
        let metadata = writer
            .close()
            .map_err(|e| PersistenceError::Parquet(e.to_string()))?;
        Ok(metadata.num_rows.max(0) as u64)
    }

    /// Add the objects of a batch of frames.
    pub fn add_batch(&mut self, frames: &[FrameOutput]) -> Result<(), PersistenceError> {
        let num_rows = frames.iter().map(|f| f.objects.len()).sum();
        let mut frame = UInt64Builder::with_capacity(num_rows);
        let mut range_idx = UInt16Builder::with_capacity(num_rows);
        let mut doppler_idx = Int16Builder::with_capacity(num_rows);
        let mut peak_val = UInt16Builder::with_capacity(num_rows);
        let mut x = Int16Builder::with_capacity(num_rows);
        let mut y = Int16Builder::with_capacity(num_rows);
        let mut z = Int16Builder::with_capacity(num_rows);
        let mut azimuth_bin = UInt16Builder::with_capacity(num_rows);
        let mut doa_state = UInt8Builder::with_capacity(num_rows);

        for f in frames {
            for o in &f.objects {
                frame.append_value(f.frame_index);
                range_idx.append_value(o.range_idx);
                doppler_idx.append_value(o.doppler_idx);
                peak_val.append_value(o.peak_val);
                x.append_value(o.x);
                y.append_value(o.y);
                z.append_value(o.z);
                azimuth_bin.append_value(o.azimuth_bin);
                doa_state.append_value(o.doa_state.as_code());
            }
        }

        let arrays: Vec<ArrayRef> = vec![
            Arc::new(frame.finish()),
            Arc::new(range_idx.finish()),
            Arc::new(doppler_idx.finish()),
            Arc::new(peak_val.finish()),
            Arc::new(x.finish()),
            Arc::new(y.finish()),
            Arc::new(z.finish()),
            Arc::new(azimuth_bin.finish()),
            Arc::new(doa_state.finish()),
        ];
        let batch = RecordBatch::try_new(self.schema.clone(), arrays)
            .map_err(|e| PersistenceError::Parquet(e.to_string()))?;
        self.write(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{DetectedObject, DoaState};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    #[test]
    fn test_objects_written_as_rows() {
        let path = std::env::temp_dir().join(format!("mmdss_rows_{}.parquet", std::process::id()));
        let object = DetectedObject {
            range_idx: 17,
            doppler_idx: -3,
            peak_val: 9000,
            x: 12,
            y: 340,
            z: 0,
            azimuth_bin: 5,
            doa_state: DoaState::Resolved,
        };
        let frames = vec![
            FrameOutput {
                frame_index: 0,
                objects: vec![object; 2],
                ..Default::default()
            },
            FrameOutput {
                frame_index: 1,
                ..Default::default()
            },
            FrameOutput {
                frame_index: 2,
                objects: vec![object],
                ..Default::default()
            },
        ];

        let mut writer = BatchWriter::new(path.clone()).unwrap();
        writer.add_batch(&frames).unwrap();
        assert_eq!(writer.finalize().unwrap(), 3);
        assert!(writer.finalize().is_err());

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let rows: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(rows, 3);
        std::fs::remove_file(&path).unwrap();
    }
}
