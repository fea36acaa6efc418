//! Flatten a dataset into a table (one row per cell) for CSV, JSON or Parquet.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::error::Result;
use crate::models::{CellState, CellValue, DType};
use crate::storage::{DataFile, DatasetHandle};

#[derive(Debug, Clone)]
struct Column {
    name: String,
    dtype: DType,
    values: Vec<Option<CellValue>>,
}

/// A dataset in long form: one coordinate column per dimension, then the values.
/// Empty cells are null.
#[derive(Debug, Clone)]
pub struct DatasetTable {
    columns: Vec<Column>,
    rows: usize,
}

impl DatasetTable {
    /// Build the table for `handle`. Dimensions without a linked axis dataset
    /// get a `dim_<k>` column holding the index.
    pub fn from_file(file: &DataFile, handle: &DatasetHandle) -> Result<Self> {
        let header = file.header(handle)?.clone();
        let rows = header.len();
        let shape = &header.shape;

        let mut strides = vec![1; shape.len()];
        for k in (0..shape.len().saturating_sub(1)).rev() {
            strides[k] = strides[k + 1] * shape[k + 1];
        }

        let mut columns = vec![];
        for (k, &n) in shape.iter().enumerate() {
            let axis = header.axes.get(k).and_then(|p| file.dataset_at(p));
            let (name, coords): (String, Vec<Option<f64>>) = match axis {
                Some(axis) => {
                    let values = file.read_array(&axis)?;
                    let coords = (0..n)
                        .map(|i| values.as_slice().and_then(|v| v.get(i)).copied().filter(|v| !v.is_nan()))
                        .collect();
                    (axis.name().to_string(), coords)
                }
                None => (format!("dim_{k}"), (0..n).map(|i| Some(i as f64)).collect()),
            };
            let values = (0..rows)
                .map(|row| coords[(row / strides[k]) % n].map(CellValue::Float))
                .collect();
            columns.push(Column {
                name,
                dtype: DType::Float64,
                values,
            });
        }

        let values = file
            .cells(handle)?
            .into_iter()
            .map(|cell| match cell {
                CellState::Empty => None,
                CellState::Written(v) => Some(v),
            })
            .collect();
        columns.push(Column {
            name: header.name.clone(),
            dtype: header.dtype,
            values,
        });

        Ok(Self { columns, rows })
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn to_csv(&self) -> String {
        let mut out = self.column_names().join(",") + "\n";
        for row in 0..self.rows {
            let cells: Vec<String> = self
                .columns
                .iter()
                .map(|c| match &c.values[row] {
                    None => String::new(),
                    Some(CellValue::Float(f)) => f.to_string(),
                    Some(CellValue::Int(i)) => i.to_string(),
                    Some(CellValue::Text(s)) => csv_quote(s),
                })
                .collect();
            out += &(cells.join(",") + "\n");
        }
        out
    }

    /// Array of row objects.
    pub fn to_json(&self) -> serde_json::Value {
        let rows = (0..self.rows)
            .map(|row| {
                let object: serde_json::Map<String, serde_json::Value> = self
                    .columns
                    .iter()
                    .map(|c| {
                        let value = match &c.values[row] {
                            None => serde_json::Value::Null,
                            Some(CellValue::Float(f)) => serde_json::json!(f),
                            Some(CellValue::Int(i)) => serde_json::json!(i),
                            Some(CellValue::Text(s)) => serde_json::json!(s),
                        };
                        (c.name.clone(), value)
                    })
                    .collect();
                serde_json::Value::Object(object)
            })
            .collect();
        serde_json::Value::Array(rows)
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let mut fields = vec![];
        let mut arrays: Vec<ArrayRef> = vec![];
        for column in &self.columns {
            let (data_type, array): (DataType, ArrayRef) = match column.dtype {
                DType::Float64 => (
                    DataType::Float64,
                    Arc::new(Float64Array::from(
                        column.values.iter().map(|v| v.as_ref().and_then(CellValue::as_f64)).collect::<Vec<_>>(),
                    )),
                ),
                DType::Int64 => (
                    DataType::Int64,
                    Arc::new(Int64Array::from(
                        column
                            .values
                            .iter()
                            .map(|v| match v {
                                Some(CellValue::Int(i)) => Some(*i),
                                _ => None,
                            })
                            .collect::<Vec<_>>(),
                    )),
                ),
                DType::Text => (
                    DataType::Utf8,
                    Arc::new(StringArray::from(
                        column
                            .values
                            .iter()
                            .map(|v| match v {
                                Some(CellValue::Text(s)) => Some(s.as_str()),
                                _ => None,
                            })
                            .collect::<Vec<_>>(),
                    )),
                ),
            };
            fields.push(Field::new(&column.name, data_type, true));
            arrays.push(array);
        }
        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
    }

    pub fn write_parquet(&self, path: &Path) -> Result<()> {
        let batch = self.to_record_batch()?;
        let file = fs::File::create(path)?;
        let props = WriterProperties::builder()
            .set_compression(parquet::basic::Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(())
    }
}

fn csv_quote(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Axis;
    use crate::storage::{DatasetSpec, Mode};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::TempDir;

    fn sample(tmp: &TempDir) -> (DataFile, DatasetHandle) {
        let mut file = DataFile::open(tmp.path().join("t.arrows"), Mode::Write).unwrap();
        let x = file.create_axis(&Axis::new("x", vec![0.5, 1.5], "V").unwrap()).unwrap();
        let y = file.create_axis(&Axis::new("y", vec![10.0, 20.0, 30.0], "A").unwrap()).unwrap();
        let z = file
            .create_dataset(DatasetSpec::new("z", vec![2, 3]).axes(vec![x, y]).unit("Ohm"))
            .unwrap();
        file.write_cell(&z, &[0, 0], 1.0).unwrap();
        file.write_cell(&z, &[1, 2], 6.0).unwrap();
        (file, z)
    }

    #[test]
    fn test_table_layout() {
        let tmp = TempDir::new().unwrap();
        let (file, z) = sample(&tmp);
        let table = DatasetTable::from_file(&file, &z).unwrap();
        assert_eq!(table.column_names(), ["x", "y", "z"]);
        assert_eq!(table.num_rows(), 6);

        let csv = table.to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "x,y,z");
        assert_eq!(lines[1], "0.5,10,1");
        assert_eq!(lines[2], "0.5,20,");
        assert_eq!(lines[6], "1.5,30,6");
    }

    #[test]
    fn test_json_uses_null_for_empty_cells() {
        let tmp = TempDir::new().unwrap();
        let (file, z) = sample(&tmp);
        let json = DatasetTable::from_file(&file, &z).unwrap().to_json();
        assert_eq!(json[0]["z"], serde_json::json!(1.0));
        assert!(json[1]["z"].is_null());
        assert_eq!(json[5]["y"], serde_json::json!(30.0));
    }

    #[test]
    fn test_parquet_written() {
        let tmp = TempDir::new().unwrap();
        let (file, z) = sample(&tmp);
        let out = tmp.path().join("z.parquet");
        DatasetTable::from_file(&file, &z).unwrap().write_parquet(&out).unwrap();

        let reader = ParquetRecordBatchReaderBuilder::try_new(fs::File::open(&out).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 6);
        assert_eq!(batches[0].schema().field(2).name(), "z");
        assert_eq!(batches[0].column(2).null_count(), 4);
    }

    #[test]
    fn test_unlinked_dimensions_use_index() {
        let tmp = TempDir::new().unwrap();
        let mut file = DataFile::open(tmp.path().join("t.arrows"), Mode::Write).unwrap();
        let h = file.create_dataset(DatasetSpec::new("counts", vec![2])).unwrap();
        let table = DatasetTable::from_file(&file, &h).unwrap();
        assert_eq!(table.column_names(), ["dim_0", "counts"]);
        assert_eq!(table.to_csv(), "dim_0,counts\n0,\n1,\n");
    }

    #[test]
    fn test_csv_quotes_text() {
        assert_eq!(csv_quote("a,b"), "\"a,b\"");
        assert_eq!(csv_quote("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_quote("plain"), "plain");
    }
}
