//! Arrow IPC record-batch blocks.
//!
//! A page payload is `meta_len: u32` followed by the IPC record-batch
//! message metadata and then the IPC body. No schema message is written;
//! the reader supplies the schema.

use std::collections::HashMap;

use arrow::array::RecordBatch;
use arrow::buffer::Buffer;
use arrow::ipc::reader::read_record_batch;
use arrow::ipc::root_as_message;
use arrow::ipc::writer::{DictionaryTracker, IpcDataGenerator, IpcWriteOptions};
use arrow_schema::{DataType, SchemaRef};
use spillway_common::{Result, SpillwayError};

const META_LEN_BYTES: usize = 4;

/// Reject column types that need dictionary messages.
pub fn check_supported(data_type: &DataType) -> Result<()> {
    if contains_dictionary(data_type) {
        return Err(SpillwayError::Unsupported(format!(
            "dictionary-encoded column type {data_type} cannot be spilled"
        )));
    }
    Ok(())
}

fn contains_dictionary(data_type: &DataType) -> bool {
    match data_type {
        DataType::Dictionary(_, _) => true,
        DataType::List(f)
        | DataType::LargeList(f)
        | DataType::ListView(f)
        | DataType::LargeListView(f)
        | DataType::FixedSizeList(f, _)
        | DataType::Map(f, _) => contains_dictionary(f.data_type()),
        DataType::Struct(fields) => fields.iter().any(|f| contains_dictionary(f.data_type())),
        DataType::Union(fields, _) => fields
            .iter()
            .any(|(_, f)| contains_dictionary(f.data_type())),
        DataType::RunEndEncoded(_, values) => contains_dictionary(values.data_type()),
        _ => false,
    }
}

/// Encode `batch` as one IPC record-batch message.
pub fn write_columns(batch: &RecordBatch, out: &mut Vec<u8>) -> Result<()> {
    let generator = IpcDataGenerator::default();
    let mut dictionaries = DictionaryTracker::new(false);
    let (encoded_dictionaries, encoded) = generator
        .encoded_batch(batch, &mut dictionaries, &IpcWriteOptions::default())
        .map_err(|e| SpillwayError::Execution(format!("ipc encode failed: {e}")))?;
    if !encoded_dictionaries.is_empty() {
        return Err(SpillwayError::Unsupported(
            "dictionary-encoded columns cannot be spilled".to_string(),
        ));
    }

    let meta_len = u32::try_from(encoded.ipc_message.len()).map_err(|_| {
        SpillwayError::Execution(format!(
            "ipc metadata of {} bytes is too large",
            encoded.ipc_message.len()
        ))
    })?;
    out.reserve(META_LEN_BYTES + encoded.ipc_message.len() + encoded.arrow_data.len());
    out.extend_from_slice(&meta_len.to_le_bytes());
    out.extend_from_slice(&encoded.ipc_message);
    out.extend_from_slice(&encoded.arrow_data);
    Ok(())
}

/// Rebuild a batch of `rows` rows from a payload produced by [`write_columns`].
pub fn read_columns(schema: &SchemaRef, rows: usize, payload: Vec<u8>) -> Result<RecordBatch> {
    if payload.len() < META_LEN_BYTES {
        return Err(corrupt(format!(
            "payload of {} bytes has no ipc metadata length",
            payload.len()
        )));
    }
    let mut len_bytes = [0u8; META_LEN_BYTES];
    len_bytes.copy_from_slice(&payload[..META_LEN_BYTES]);
    let body_start = META_LEN_BYTES + u32::from_le_bytes(len_bytes) as usize;
    if body_start > payload.len() {
        return Err(corrupt(format!(
            "ipc metadata overruns payload of {} bytes",
            payload.len()
        )));
    }

    let buffer = Buffer::from_vec(payload);
    let message = root_as_message(&buffer.as_slice()[META_LEN_BYTES..body_start])
        .map_err(|e| corrupt(format!("invalid ipc message: {e}")))?;
    let ipc_batch = message
        .header_as_record_batch()
        .ok_or_else(|| corrupt("ipc message is not a record batch".to_string()))?;
    if ipc_batch.length() != rows as i64 {
        return Err(corrupt(format!(
            "ipc batch has {} rows, page header declares {rows}",
            ipc_batch.length()
        )));
    }
    let body_len = usize::try_from(message.bodyLength())
        .map_err(|_| corrupt(format!("negative ipc body length {}", message.bodyLength())))?;
    if buffer.len() - body_start < body_len {
        return Err(corrupt(format!(
            "ipc body is {} bytes, message declares {body_len}",
            buffer.len() - body_start
        )));
    }

    read_record_batch(
        &buffer.slice(body_start),
        ipc_batch,
        SchemaRef::clone(schema),
        &HashMap::new(),
        None,
        &message.version(),
    )
    .map_err(|e| corrupt(format!("ipc decode failed: {e}")))
}

fn corrupt(message: String) -> SpillwayError {
    SpillwayError::Corruption(message)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{
        ArrayRef, Decimal128Array, DictionaryArray, Int32Array, LargeStringArray, ListArray,
        StringViewArray, StructArray, TimestampMicrosecondArray, UInt64Array,
    };
    use arrow::datatypes::{Int32Type, Int8Type};
    use arrow_schema::{Field, Schema};

    use super::*;

    fn round_trip(batch: &RecordBatch) -> RecordBatch {
        let mut payload = Vec::new();
        write_columns(batch, &mut payload).expect("write");
        read_columns(&batch.schema(), batch.num_rows(), payload).expect("read")
    }

    fn single_column(name: &str, array: ArrayRef) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new(
            name,
            array.data_type().clone(),
            true,
        )]));
        RecordBatch::try_new(schema, vec![array]).expect("batch")
    }

    #[test]
    fn wide_and_nested_types_survive() {
        let decimal = Decimal128Array::from(vec![Some(12_345), None, Some(-1)])
            .with_precision_and_scale(38, 2)
            .expect("decimal");
        let columns = vec![
            (
                "ts",
                Arc::new(TimestampMicrosecondArray::from(vec![Some(1), None, Some(-5)]))
                    as ArrayRef,
            ),
            ("dec", Arc::new(decimal) as ArrayRef),
            (
                "large",
                Arc::new(LargeStringArray::from(vec![Some(""), Some("spill"), None])) as ArrayRef,
            ),
            (
                "view",
                Arc::new(StringViewArray::from(vec![
                    Some("a string longer than twelve bytes"),
                    None,
                    Some("short"),
                ])) as ArrayRef,
            ),
            (
                "list",
                Arc::new(ListArray::from_iter_primitive::<Int32Type, _, _>(vec![
                    Some(vec![Some(1), None]),
                    None,
                    Some(vec![]),
                ])) as ArrayRef,
            ),
        ];
        for (name, array) in columns {
            let batch = single_column(name, array);
            assert_eq!(round_trip(&batch), batch, "{name}");
        }
    }

    #[test]
    fn struct_columns_and_slices_survive() {
        let inner = StructArray::from(vec![
            (
                Arc::new(Field::new("a", DataType::Int32, true)),
                Arc::new(Int32Array::from(vec![Some(1), None, Some(3), Some(4)])) as ArrayRef,
            ),
            (
                Arc::new(Field::new("b", DataType::UInt64, false)),
                Arc::new(UInt64Array::from(vec![10u64, 20, 30, 40])) as ArrayRef,
            ),
        ]);
        let batch = single_column("s", Arc::new(inner));
        let slice = batch.slice(1, 2);
        assert_eq!(round_trip(&slice), slice);
    }

    #[test]
    fn truncated_payload_is_corruption() {
        let batch = single_column("i", Arc::new(Int32Array::from(vec![1, 2, 3])));
        let mut payload = Vec::new();
        write_columns(&batch, &mut payload).expect("write");
        payload.truncate(payload.len() - 2);
        let err = read_columns(&batch.schema(), 3, payload).expect_err("truncated");
        assert!(matches!(err, SpillwayError::Corruption(_)));
    }

    #[test]
    fn row_count_mismatch_is_corruption() {
        let batch = single_column("i", Arc::new(Int32Array::from(vec![1, 2, 3])));
        let mut payload = Vec::new();
        write_columns(&batch, &mut payload).expect("write");
        let err = read_columns(&batch.schema(), 4, payload).expect_err("rows");
        assert!(matches!(err, SpillwayError::Corruption(_)));
    }

    #[test]
    fn dictionary_columns_are_rejected() {
        let dictionary = DataType::Dictionary(Box::new(DataType::Int8), Box::new(DataType::Utf8));
        assert!(check_supported(&DataType::Utf8View).is_ok());
        assert!(matches!(
            check_supported(&dictionary),
            Err(SpillwayError::Unsupported(_))
        ));
        let nested = DataType::List(Arc::new(Field::new("item", dictionary, true)));
        assert!(matches!(
            check_supported(&nested),
            Err(SpillwayError::Unsupported(_))
        ));

        let array: DictionaryArray<Int8Type> = vec!["a", "b", "a"].into_iter().collect();
        let batch = single_column("d", Arc::new(array));
        let mut payload = Vec::new();
        assert!(matches!(
            write_columns(&batch, &mut payload),
            Err(SpillwayError::Unsupported(_))
        ));
    }
}
