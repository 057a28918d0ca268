//! Parquet sink and source for datasets.
//!
//! Column types are chosen from the values they hold:
//! numbers become `Float64`, booleans `Boolean`, text `Utf8`. Columns that mix
//! kinds are stored as `Utf8` holding one JSON value per cell and are tagged
//! with field metadata so that reading them back restores the original cells.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float32Array, Float64Array, Float64Builder,
    Int32Array, Int64Array, LargeStringArray, StringArray, StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use super::{Cell, ColumnKind, Dataset};
use crate::error::DatasetError;

/// Field metadata key marking JSON-encoded mixed columns.
const CELL_ENCODING_KEY: &str = "peach.cell_encoding";
const CELL_ENCODING_JSON: &str = "json";

/// Convert a dataset into an Arrow RecordBatch.
pub fn dataset_to_record_batch(dataset: &Dataset) -> Result<RecordBatch, DatasetError> {
    if dataset.column_count() == 0 {
        return Err(DatasetError::Invalid("dataset has no columns".to_string()));
    }

    let mut fields = Vec::with_capacity(dataset.column_count());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(dataset.column_count());

    for (idx, name) in dataset.columns().iter().enumerate() {
        let values = dataset.rows().iter().map(|row| &row[idx]);
        match dataset.column_kind(idx) {
            ColumnKind::Number => {
                let mut builder = Float64Builder::with_capacity(dataset.row_count());
                for cell in values {
                    builder.append_option(cell.as_f64());
                }
                fields.push(Field::new(name, DataType::Float64, true));
                columns.push(Arc::new(builder.finish()));
            }
            ColumnKind::Bool => {
                let mut builder = BooleanBuilder::with_capacity(dataset.row_count());
                for cell in values {
                    match cell {
                        Cell::Bool(b) => builder.append_value(*b),
                        _ => builder.append_null(),
                    }
                }
                fields.push(Field::new(name, DataType::Boolean, true));
                columns.push(Arc::new(builder.finish()));
            }
            ColumnKind::Text | ColumnKind::Empty => {
                let mut builder = StringBuilder::new();
                for cell in values {
                    builder.append_option(cell.as_str());
                }
                fields.push(Field::new(name, DataType::Utf8, true));
                columns.push(Arc::new(builder.finish()));
            }
            ColumnKind::Mixed => {
                let mut builder = StringBuilder::new();
                for cell in values {
                    if cell.is_null() {
                        builder.append_null();
                    } else {
                        builder.append_value(serde_json::to_string(cell)?);
                    }
                }
                let metadata = HashMap::from([(
                    CELL_ENCODING_KEY.to_string(),
                    CELL_ENCODING_JSON.to_string(),
                )]);
                fields.push(Field::new(name, DataType::Utf8, true).with_metadata(metadata));
                columns.push(Arc::new(builder.finish()));
            }
        }
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

/// Write a dataset to a Parquet file on disk.
pub fn write_dataset(dataset: &Dataset, output_path: &Path) -> Result<(), DatasetError> {
    let batch = dataset_to_record_batch(dataset)?;

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(output_path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(Default::default()))
        .build();

    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    tracing::info!(
        path = %output_path.display(),
        rows = dataset.row_count(),
        columns = dataset.column_count(),
        "Parquet artifact written"
    );

    Ok(())
}

/// Read a dataset from a Parquet file.
pub fn read_dataset(input_path: &Path) -> Result<Dataset, DatasetError> {
    let file = File::open(input_path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema = builder.schema().clone();
    let reader = builder.build()?;

    let columns: Vec<String> = schema.fields().iter().map(|f| f.name().clone()).collect();
    let mut rows: Vec<Vec<Cell>> = Vec::new();

    for batch_result in reader {
        let batch = batch_result?;
        let mut batch_rows = vec![Vec::with_capacity(columns.len()); batch.num_rows()];

        for (field, array) in schema.fields().iter().zip(batch.columns()) {
            let json_encoded = field
                .metadata()
                .get(CELL_ENCODING_KEY)
                .is_some_and(|v| v == CELL_ENCODING_JSON);
            let cells = array_to_cells(field.name(), array.as_ref(), json_encoded)?;
            for (row, cell) in batch_rows.iter_mut().zip(cells) {
                row.push(cell);
            }
        }

        rows.extend(batch_rows);
    }

    Dataset::new(columns, rows)
}

fn array_to_cells(
    column: &str,
    array: &dyn Array,
    json_encoded: bool,
) -> Result<Vec<Cell>, DatasetError> {
    let len = array.len();
    let any = array.as_any();

    let cells = match array.data_type() {
        DataType::Float64 => {
            let arr = downcast::<Float64Array>(column, any)?;
            (0..len)
                .map(|i| null_or(arr, i, || Cell::Number(arr.value(i))))
                .collect()
        }
        DataType::Float32 => {
            let arr = downcast::<Float32Array>(column, any)?;
            (0..len)
                .map(|i| null_or(arr, i, || Cell::Number(arr.value(i) as f64)))
                .collect()
        }
        DataType::Int64 => {
            let arr = downcast::<Int64Array>(column, any)?;
            (0..len)
                .map(|i| null_or(arr, i, || Cell::Number(arr.value(i) as f64)))
                .collect()
        }
        DataType::Int32 => {
            let arr = downcast::<Int32Array>(column, any)?;
            (0..len)
                .map(|i| null_or(arr, i, || Cell::Number(arr.value(i) as f64)))
                .collect()
        }
        DataType::Boolean => {
            let arr = downcast::<BooleanArray>(column, any)?;
            (0..len)
                .map(|i| null_or(arr, i, || Cell::Bool(arr.value(i))))
                .collect()
        }
        DataType::Utf8 => {
            let arr = downcast::<StringArray>(column, any)?;
            let mut cells = Vec::with_capacity(len);
            for i in 0..len {
                cells.push(text_cell(arr.is_null(i), || arr.value(i), json_encoded)?);
            }
            cells
        }
        DataType::LargeUtf8 => {
            let arr = downcast::<LargeStringArray>(column, any)?;
            let mut cells = Vec::with_capacity(len);
            for i in 0..len {
                cells.push(text_cell(arr.is_null(i), || arr.value(i), json_encoded)?);
            }
            cells
        }
        other => {
            return Err(DatasetError::UnsupportedColumnType {
                column: column.to_string(),
                data_type: other.to_string(),
            })
        }
    };

    Ok(cells)
}

fn downcast<'a, T: 'static>(
    column: &str,
    any: &'a dyn std::any::Any,
) -> Result<&'a T, DatasetError> {
    any.downcast_ref::<T>().ok_or_else(|| {
        DatasetError::Invalid(format!("column '{}' does not match its declared type", column))
    })
}

fn null_or<A: Array>(arr: &A, i: usize, value: impl FnOnce() -> Cell) -> Cell {
    if arr.is_null(i) {
        Cell::Null
    } else {
        value()
    }
}

fn text_cell<'a>(
    is_null: bool,
    value: impl FnOnce() -> &'a str,
    json_encoded: bool,
) -> Result<Cell, DatasetError> {
    if is_null {
        return Ok(Cell::Null);
    }
    let raw = value();
    if json_encoded {
        Ok(serde_json::from_str(raw)?)
    } else {
        Ok(Cell::Text(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_sheet() -> Dataset {
        Dataset::new(
            vec![
                "technology".into(),
                "year_vtg".into(),
                "inv_cost".into(),
                "active".into(),
                "note".into(),
                "unused".into(),
            ],
            vec![
                vec![
                    "solar_pv".into(),
                    2030i64.into(),
                    1320.0.into(),
                    true.into(),
                    "new".into(),
                    Cell::Null,
                ],
                vec![
                    "coal_ppl".into(),
                    2035i64.into(),
                    Cell::Null,
                    false.into(),
                    42i64.into(),
                    Cell::Null,
                ],
            ],
        )
        .expect("valid dataset")
    }

    #[test]
    fn test_record_batch_types() {
        let batch = dataset_to_record_batch(&scenario_sheet()).expect("batch");
        let schema = batch.schema();
        assert_eq!(schema.field(0).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(1).data_type(), &DataType::Float64);
        assert_eq!(schema.field(2).data_type(), &DataType::Float64);
        assert_eq!(schema.field(3).data_type(), &DataType::Boolean);
        assert_eq!(schema.field(4).data_type(), &DataType::Utf8);
        assert_eq!(
            schema.field(4).metadata().get(CELL_ENCODING_KEY).map(String::as_str),
            Some(CELL_ENCODING_JSON)
        );
        assert_eq!(batch.num_rows(), 2);
    }

    #[test]
    fn test_write_then_read_matches_in_memory_dataset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("scenario-updated.parquet");
        let original = scenario_sheet();

        write_dataset(&original, &path).expect("write parquet");
        let restored = read_dataset(&path).expect("read parquet");

        assert_eq!(restored, original);
    }

    #[test]
    fn test_empty_rows_keep_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.parquet");
        let empty = Dataset::new(vec!["a".into(), "b".into()], vec![]).expect("valid");

        write_dataset(&empty, &path).expect("write parquet");
        let restored = read_dataset(&path).expect("read parquet");

        assert_eq!(restored.columns(), &["a".to_string(), "b".to_string()]);
        assert_eq!(restored.row_count(), 0);
    }

    #[test]
    fn test_no_columns_is_rejected() {
        let empty = Dataset::new(vec![], vec![]).expect("valid");
        assert!(matches!(
            dataset_to_record_batch(&empty),
            Err(DatasetError::Invalid(_))
        ));
    }
}
