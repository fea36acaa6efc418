//! On-disk journal: an Arrow IPC stream of storage records.
//!
//! Every structural change and every cell write is appended as one record
//! batch and synced before the call returns. Replaying the stream rebuilds the
//! file state; a torn trailing batch (crash mid-append) is dropped.

use std::fs::{self, File, OpenOptions};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float64Array, Float64Builder, Int64Array, Int64Builder, ListArray,
    ListBuilder, StringArray, StringBuilder, UInt64Array, UInt64Builder, UInt8Array,
    UInt8Builder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage::DatasetHeader;
use crate::views::DataView;

type StorageResult<T> = std::result::Result<T, StorageError>;

/// Cell values of one dataset (or a contiguous run of cells).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Values {
    Float(Vec<f64>),
    Int(Vec<Option<i64>>),
    Text(Vec<Option<String>>),
}

impl Values {
    pub(crate) fn len(&self) -> usize {
        match self {
            Values::Float(v) => v.len(),
            Values::Int(v) => v.len(),
            Values::Text(v) => v.len(),
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Values::Float(_) => "float64",
            Values::Int(_) => "int64",
            Values::Text(_) => "text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Attribute {
    key: String,
    value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Record {
    CreateDataset {
        path: String,
        header: DatasetHeader,
    },
    WriteCells {
        path: String,
        offset: u64,
        values: Values,
    },
    TextRecord {
        path: String,
        text: String,
        comment: Option<String>,
    },
    SetAttribute {
        path: String,
        key: String,
        value: serde_json::Value,
    },
    Resize {
        path: String,
        shape: Vec<usize>,
    },
    View {
        path: String,
        view: DataView,
    },
}

impl Record {
    fn op(&self) -> u8 {
        match self {
            Record::CreateDataset { .. } => 0,
            Record::WriteCells { .. } => 1,
            Record::TextRecord { .. } => 2,
            Record::SetAttribute { .. } => 3,
            Record::Resize { .. } => 4,
            Record::View { .. } => 5,
        }
    }

    fn path(&self) -> &str {
        match self {
            Record::CreateDataset { path, .. }
            | Record::WriteCells { path, .. }
            | Record::TextRecord { path, .. }
            | Record::SetAttribute { path, .. }
            | Record::Resize { path, .. }
            | Record::View { path, .. } => path,
        }
    }
}

fn journal_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("op", DataType::UInt8, false),
        Field::new("path", DataType::Utf8, false),
        Field::new("offset", DataType::UInt64, true),
        Field::new(
            "floats",
            DataType::List(Arc::new(Field::new("item", DataType::Float64, true))),
            true,
        ),
        Field::new(
            "ints",
            DataType::List(Arc::new(Field::new("item", DataType::Int64, true))),
            true,
        ),
        Field::new(
            "texts",
            DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))),
            true,
        ),
        Field::new("meta", DataType::Utf8, true),
    ]))
}

// ─── Encoding ────────────────────────────────────────────────────────────────

fn encode(records: &[Record]) -> StorageResult<RecordBatch> {
    let mut op = UInt8Builder::new();
    let mut path = StringBuilder::new();
    let mut offset = UInt64Builder::new();
    let mut floats = ListBuilder::new(Float64Builder::new());
    let mut ints = ListBuilder::new(Int64Builder::new());
    let mut texts = ListBuilder::new(StringBuilder::new());
    let mut meta = StringBuilder::new();

    for record in records {
        op.append_value(record.op());
        path.append_value(record.path());

        let mut row_offset = None;
        let mut row_values = None;
        let mut row_meta = None;
        match record {
            Record::CreateDataset { header, .. } => {
                row_meta = Some(serde_json::to_string(header)?);
            }
            Record::WriteCells { offset, values, .. } => {
                row_offset = Some(*offset);
                row_values = Some(values.clone());
            }
            Record::TextRecord { text, comment, .. } => {
                row_values = Some(Values::Text(vec![Some(text.clone())]));
                row_meta = comment.clone();
            }
            Record::SetAttribute { key, value, .. } => {
                row_meta = Some(serde_json::to_string(&Attribute {
                    key: key.clone(),
                    value: value.clone(),
                })?);
            }
            Record::Resize { shape, .. } => {
                row_meta = Some(serde_json::to_string(shape)?);
            }
            Record::View { view, .. } => {
                row_meta = Some(serde_json::to_string(view)?);
            }
        }

        offset.append_option(row_offset);
        meta.append_option(row_meta);
        match row_values {
            Some(Values::Float(v)) => {
                floats.values().append_slice(&v);
                floats.append(true);
                ints.append_null();
                texts.append_null();
            }
            Some(Values::Int(v)) => {
                floats.append_null();
                for i in v {
                    ints.values().append_option(i);
                }
                ints.append(true);
                texts.append_null();
            }
            Some(Values::Text(v)) => {
                floats.append_null();
                ints.append_null();
                for s in v {
                    texts.values().append_option(s);
                }
                texts.append(true);
            }
            None => {
                floats.append_null();
                ints.append_null();
                texts.append_null();
            }
        }
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(op.finish()),
        Arc::new(path.finish()),
        Arc::new(offset.finish()),
        Arc::new(floats.finish()),
        Arc::new(ints.finish()),
        Arc::new(texts.finish()),
        Arc::new(meta.finish()),
    ];
    Ok(RecordBatch::try_new(journal_schema(), columns)?)
}

// ─── Decoding ────────────────────────────────────────────────────────────────

fn column<'a, T: 'static>(batch: &'a RecordBatch, idx: usize) -> StorageResult<&'a T> {
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| StorageError::Corrupt(format!("unexpected type for column {idx}")))
}

fn list_item<'a, T: 'static>(
    list: &'a ListArray,
    row: usize,
    slot: &'a mut Option<ArrayRef>,
) -> StorageResult<Option<&'a T>> {
    if list.is_null(row) {
        return Ok(None);
    }
    let item = slot.insert(list.value(row));
    item.as_any()
        .downcast_ref::<T>()
        .map(Some)
        .ok_or_else(|| StorageError::Corrupt("unexpected list item type".to_string()))
}

fn required_meta<'a>(meta: &'a StringArray, row: usize, op: u8) -> StorageResult<&'a str> {
    if meta.is_null(row) {
        return Err(StorageError::Corrupt(format!("record {op} without metadata")));
    }
    Ok(meta.value(row))
}

fn decode(batch: &RecordBatch, out: &mut Vec<Record>) -> StorageResult<()> {
    if batch.num_columns() != 7 {
        return Err(StorageError::Corrupt(format!(
            "expected 7 journal columns, found {}",
            batch.num_columns()
        )));
    }
    let ops = column::<UInt8Array>(batch, 0)?;
    let paths = column::<StringArray>(batch, 1)?;
    let offsets = column::<UInt64Array>(batch, 2)?;
    let floats = column::<ListArray>(batch, 3)?;
    let ints = column::<ListArray>(batch, 4)?;
    let texts = column::<ListArray>(batch, 5)?;
    let meta = column::<StringArray>(batch, 6)?;

    for row in 0..batch.num_rows() {
        let op = ops.value(row);
        let path = paths.value(row).to_string();

        let mut float_slot = None;
        let mut int_slot = None;
        let mut text_slot = None;
        let values = if let Some(f) = list_item::<Float64Array>(floats, row, &mut float_slot)? {
            Some(Values::Float(f.values().to_vec()))
        } else if let Some(i) = list_item::<Int64Array>(ints, row, &mut int_slot)? {
            Some(Values::Int(i.iter().collect()))
        } else {
            list_item::<StringArray>(texts, row, &mut text_slot)?
                .map(|s| Values::Text(s.iter().map(|v| v.map(str::to_string)).collect()))
        };

        let record = match op {
            0 => Record::CreateDataset {
                path,
                header: serde_json::from_str(required_meta(meta, row, op)?)?,
            },
            1 => {
                if offsets.is_null(row) {
                    return Err(StorageError::Corrupt("cell write without offset".to_string()));
                }
                let values = values.ok_or_else(|| {
                    StorageError::Corrupt("cell write without values".to_string())
                })?;
                Record::WriteCells {
                    path,
                    offset: offsets.value(row),
                    values,
                }
            }
            2 => {
                let text = match values {
                    Some(Values::Text(mut v)) if v.len() == 1 => v.pop().flatten().unwrap_or_default(),
                    _ => return Err(StorageError::Corrupt("malformed text record".to_string())),
                };
                let comment = (!meta.is_null(row)).then(|| meta.value(row).to_string());
                Record::TextRecord { path, text, comment }
            }
            3 => {
                let attr: Attribute = serde_json::from_str(required_meta(meta, row, op)?)?;
                Record::SetAttribute {
                    path,
                    key: attr.key,
                    value: attr.value,
                }
            }
            4 => Record::Resize {
                path,
                shape: serde_json::from_str(required_meta(meta, row, op)?)?,
            },
            5 => Record::View {
                path,
                view: serde_json::from_str(required_meta(meta, row, op)?)?,
            },
            other => return Err(StorageError::Corrupt(format!("unknown record op {other}"))),
        };
        out.push(record);
    }
    Ok(())
}

/// Result of reading a journal from disk.
#[derive(Debug, Default)]
pub(crate) struct Replay {
    pub records: Vec<Record>,
    /// The stream ended in an incomplete batch.
    pub torn: bool,
}

/// Read every complete record. An incomplete trailing batch is skipped.
pub(crate) fn read_journal(path: &Path) -> StorageResult<Replay> {
    let bytes = fs::read(path)?;
    if bytes.is_empty() {
        return Ok(Replay {
            records: vec![],
            torn: true,
        });
    }

    let reader = match StreamReader::try_new(Cursor::new(bytes), None) {
        Ok(reader) => reader,
        Err(e) => {
            // A crash right after creation may leave a partial schema message.
            warn!(path = %path.display(), error = %e, "Journal header unreadable, treating as empty");
            return Ok(Replay {
                records: vec![],
                torn: true,
            });
        }
    };
    if reader.schema().fields().len() != journal_schema().fields().len() {
        return Err(StorageError::Corrupt(format!(
            "{} is not a labsweep journal",
            path.display()
        )));
    }

    let mut replay = Replay::default();
    for batch in reader {
        match batch {
            Ok(batch) => decode(&batch, &mut replay.records)?,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Dropping torn journal tail");
                replay.torn = true;
                break;
            }
        }
    }
    debug!(path = %path.display(), records = replay.records.len(), "Journal replayed");
    Ok(replay)
}

/// Append-only journal writer. Every append is durable before it returns.
pub(crate) struct JournalWriter {
    writer: StreamWriter<File>,
}

impl JournalWriter {
    /// Start a new journal at `path`, truncating any existing file.
    pub(crate) fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let writer = StreamWriter::try_new(file, &journal_schema())?;
        writer.get_ref().sync_data()?;
        Ok(Self { writer })
    }

    /// Rewrite the journal at `path` as the given snapshot, then keep appending to it.
    ///
    /// The snapshot goes to a sibling temp file which replaces `path` only once
    /// it is fully synced, so a crash leaves either the old or the new journal.
    pub(crate) fn compact(path: &Path, snapshot: &[Record]) -> StorageResult<Self> {
        let tmp = tmp_path(path);
        let mut journal = Self::create(&tmp)?;
        if !snapshot.is_empty() {
            journal.append(snapshot)?;
        }
        fs::rename(&tmp, path)?;
        sync_parent(path);
        Ok(journal)
    }

    pub(crate) fn append(&mut self, records: &[Record]) -> StorageResult<()> {
        let batch = encode(records)?;
        self.writer.write(&batch)?;
        self.sync()
    }

    pub(crate) fn sync(&mut self) -> StorageResult<()> {
        use std::io::Write;
        self.writer.get_mut().flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}
