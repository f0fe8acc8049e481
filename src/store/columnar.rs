//! Columnar (Arrow/Parquet) dataset pages and streaming reads.
//!
//! Built directly against `arrow`/`parquet`'s documented `RecordBatch` and
//! row-group APIs, keeping the same pre-sized-buffers-and-bounded-channel
//! hot-path discipline the rest of the crate's streaming paths use.
//!
//! Items are encoded one row per item: `item_id`, `source`, `created_at`,
//! `payload` (binary), `canonical_metadata` (JSON string). The specific file
//! format is implementation-chosen per spec §4.1; the contract is lossless
//! round-trip and batch-sized streaming.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, BinaryArray, StringArray, TimestampNanosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression as ParquetCompression;
use parquet::file::properties::WriterProperties;
use tokio::sync::mpsc;

use crate::error::{PulseError, Result};
use crate::types::{Compression, Item, ItemMetadata};

fn arrow_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("item_id", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("created_at", DataType::Timestamp(TimeUnit::Nanosecond, None), false),
        Field::new("payload", DataType::Binary, false),
        Field::new("canonical_metadata", DataType::Utf8, false),
        Field::new("extra_metadata", DataType::Utf8, false),
    ]))
}

fn items_to_batch(items: &[Item]) -> Result<RecordBatch> {
    let item_ids: Vec<&str> = items.iter().map(|i| i.item_id.as_str()).collect();
    let sources: Vec<&str> = items.iter().map(|i| i.source.as_str()).collect();
    let created_at: Vec<i64> = items
        .iter()
        .map(|i| i.created_at.timestamp_nanos_opt().unwrap_or_default())
        .collect();
    let payloads: Vec<&[u8]> = items.iter().map(|i| i.payload.as_slice()).collect();
    let canonical: Vec<String> = items
        .iter()
        .map(|i| serde_json::to_string(&i.metadata.canonical_fields))
        .collect::<std::result::Result<_, _>>()?;
    let extra: Vec<String> = items
        .iter()
        .map(|i| serde_json::to_string(&i.metadata.extra))
        .collect::<std::result::Result<_, _>>()?;

    RecordBatch::try_new(
        arrow_schema(),
        vec![
            Arc::new(StringArray::from(item_ids)),
            Arc::new(StringArray::from(sources)),
            Arc::new(TimestampNanosecondArray::from(created_at)),
            Arc::new(BinaryArray::from(payloads)),
            Arc::new(StringArray::from(canonical.iter().map(String::as_str).collect::<Vec<_>>())),
            Arc::new(StringArray::from(extra.iter().map(String::as_str).collect::<Vec<_>>())),
        ],
    )
    .map_err(|e| PulseError::SerializationError(e.to_string()))
}

fn batch_to_items(batch: &RecordBatch, dataset_id: &str) -> Result<Vec<Item>> {
    let item_ids = column_as_strings(batch, "item_id")?;
    let sources = column_as_strings(batch, "source")?;
    let created_at = batch
        .column_by_name("created_at")
        .ok_or_else(|| PulseError::SerializationError("missing created_at column".into()))?
        .as_any()
        .downcast_ref::<TimestampNanosecondArray>()
        .ok_or_else(|| PulseError::SerializationError("created_at has wrong type".into()))?;
    let payloads = batch
        .column_by_name("payload")
        .ok_or_else(|| PulseError::SerializationError("missing payload column".into()))?
        .as_any()
        .downcast_ref::<BinaryArray>()
        .ok_or_else(|| PulseError::SerializationError("payload has wrong type".into()))?;
    let canonical = column_as_strings(batch, "canonical_metadata")?;
    let extra = column_as_strings(batch, "extra_metadata")?;

    let mut out = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let created = DateTime::<Utc>::from_timestamp_nanos(created_at.value(row));
        let metadata = ItemMetadata {
            canonical_fields: serde_json::from_str(&canonical[row])?,
            extra: serde_json::from_str(&extra[row])?,
        };
        out.push(Item {
            item_id: item_ids[row].clone(),
            dataset_id: dataset_id.to_string(),
            source: sources[row].clone(),
            created_at: created,
            payload: payloads.value(row).to_vec(),
            metadata,
        });
    }
    Ok(out)
}

fn column_as_strings(batch: &RecordBatch, name: &str) -> Result<Vec<String>> {
    let col = batch
        .column_by_name(name)
        .ok_or_else(|| PulseError::SerializationError(format!("missing {name} column")))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| PulseError::SerializationError(format!("{name} has wrong type")))?;
    Ok((0..col.len()).map(|i| col.value(i).to_string()).collect())
}

fn parquet_compression(c: Compression) -> ParquetCompression {
    match c {
        Compression::None => ParquetCompression::UNCOMPRESSED,
        Compression::Snappy => ParquetCompression::SNAPPY,
        Compression::Zstd => ParquetCompression::ZSTD(Default::default()),
    }
}

/// Write a full set of items to one dataset-version Parquet file, with
/// page-level checksums enabled and compression per spec §4.1.
pub fn write_items(path: &Path, items: &[Item], compression: Compression) -> Result<()> {
    let batch = items_to_batch(items)?;
    let file = std::fs::File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(parquet_compression(compression))
        .set_statistics_enabled(parquet::file::properties::EnabledStatistics::Page)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
        .map_err(|e| PulseError::SerializationError(e.to_string()))?;
    writer
        .write(&batch)
        .map_err(|e| PulseError::SerializationError(e.to_string()))?;
    writer.close().map_err(|e| PulseError::SerializationError(e.to_string()))?;
    Ok(())
}

/// One decoded batch of up to `batch_rows` items, as returned by the
/// streaming reader.
pub struct ItemBatch {
    pub items: Vec<Item>,
}

/// A finite, forward-only, non-restartable stream of decoded batches
/// (spec §4.1). Prefetches up to `prefetch_depth` batches ahead in a
/// background blocking task so the reader thread isn't stalled on I/O while
/// the consumer processes the previous batch.
pub struct DatasetStream {
    receiver: mpsc::Receiver<Result<ItemBatch>>,
}

impl DatasetStream {
    /// Open `path` and start streaming decoded batches of `batch_rows`
    /// rows, optionally projected to `columns` and filtered by
    /// `row_filter` (applied to each row's canonical metadata).
    pub fn open(
        path: PathBuf,
        dataset_id: String,
        batch_rows: usize,
        columns: Option<Vec<String>>,
        row_filter: Option<Arc<dyn Fn(&ItemMetadata) -> bool + Send + Sync>>,
        prefetch_depth: usize,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(prefetch_depth.max(1));
        tokio::task::spawn_blocking(move || {
            let result = Self::stream_blocking(&path, &dataset_id, batch_rows, columns, row_filter, &tx);
            if let Err(e) = result {
                let _ = tx.blocking_send(Err(e));
            }
        });
        Ok(Self { receiver: rx })
    }

    fn stream_blocking(
        path: &Path,
        dataset_id: &str,
        batch_rows: usize,
        columns: Option<Vec<String>>,
        row_filter: Option<Arc<dyn Fn(&ItemMetadata) -> bool + Send + Sync>>,
        tx: &mpsc::Sender<Result<ItemBatch>>,
    ) -> Result<()> {
        let file = std::fs::File::open(path)?;
        let mut builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| PulseError::SerializationError(e.to_string()))?
            .with_batch_size(batch_rows.max(1));

        if let Some(wanted) = &columns {
            // `batch_to_items` needs every one of these columns to
            // reconstruct a full `Item`; project-down is a read-side I/O
            // optimization, not a way to drop required fields, so the
            // requested set is only ever widened, never trusted as-is.
            const REQUIRED: [&str; 6] = ["item_id", "source", "created_at", "payload", "canonical_metadata", "extra_metadata"];
            let schema = builder.schema().clone();
            let indices: Vec<usize> = schema
                .fields()
                .iter()
                .enumerate()
                .filter(|(_, f)| wanted.iter().any(|w| w == f.name()) || REQUIRED.contains(&f.name().as_str()))
                .map(|(i, _)| i)
                .collect();
            if !indices.is_empty() {
                let mask = parquet::arrow::ProjectionMask::roots(builder.parquet_schema(), indices);
                builder = builder.with_projection(mask);
            }
        }

        let reader = builder
            .build()
            .map_err(|e| PulseError::SerializationError(e.to_string()))?;

        for batch in reader {
            let batch = batch.map_err(|e| PulseError::SerializationError(e.to_string()))?;
            let mut items = batch_to_items(&batch, dataset_id)?;
            if let Some(filter) = &row_filter {
                items.retain(|item| filter(&item.metadata));
            }
            if tx.blocking_send(Ok(ItemBatch { items })).is_err() {
                // Consumer dropped; stop reading ahead.
                break;
            }
        }
        Ok(())
    }

    /// Pull the next batch, or `None` once the stream is exhausted. Not
    /// restartable — call [`Self::open`] again to re-read.
    pub async fn next_batch(&mut self) -> Option<Result<ItemBatch>> {
        self.receiver.recv().await
    }
}
