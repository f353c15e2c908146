//! `spillway inspect`: walk the records of a spill file.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use spillway_common::{CompressionCodec, SpillwayError};
use spillway_serde::{read_serialized_page, PagesSerde, SerializedPage};

use crate::{CliResult, InspectOpts};

pub(crate) fn run(opts: InspectOpts) -> CliResult<()> {
    let schema = opts.types.as_deref().map(decode_schema).transpose()?;
    // Decoding is marker-driven, so writer settings are not needed here.
    let serde = PagesSerde::new(CompressionCodec::None, None, false);

    let mut input = BufReader::new(File::open(&opts.file)?);
    let mut offset = 0u64;
    let mut pages = 0u64;
    let mut rows = 0u64;
    loop {
        let page = match read_serialized_page(&mut input) {
            Ok(Some(page)) => page,
            Ok(None) => break,
            Err(e) => {
                println!("offset={offset} error: {e}");
                return Err(e.into());
            }
        };
        println!("{}", describe(offset, &page, opts.verify));
        if let Some(schema) = &schema {
            if page.markers.is_encrypted() {
                println!("  skipped decode: page is encrypted");
            } else {
                match serde.deserialize(schema, &page) {
                    Ok(batch) => println!(
                        "  decoded {} row(s) x {} column(s)",
                        batch.num_rows(),
                        batch.num_columns()
                    ),
                    Err(e) => println!("  decode failed: {e}"),
                }
            }
        }
        offset += page.encoded_len() as u64;
        pages += 1;
        rows += u64::from(page.row_count);
    }
    println!("{pages} page(s), {rows} row(s), {offset} byte(s)");
    Ok(())
}

fn describe(offset: u64, page: &SerializedPage, verify: bool) -> String {
    let checksum = if !page.markers.is_checksummed() {
        "none".to_string()
    } else if !verify {
        format!("{:08x}", page.checksum)
    } else {
        match page.verify_checksum() {
            Ok(()) => format!("{:08x} ok", page.checksum),
            Err(_) => format!("{:08x} MISMATCH", page.checksum),
        }
    };
    format!(
        "offset={offset} rows={} markers={:?} uncompressed={} size={} checksum={checksum}",
        page.row_count,
        page.markers,
        page.uncompressed_size,
        page.payload.len(),
    )
}

/// Build a positional schema (`c0`, `c1`, ...) from type names.
fn decode_schema(types: &[String]) -> Result<SchemaRef, SpillwayError> {
    let fields = types
        .iter()
        .enumerate()
        .map(|(i, name)| Ok(Field::new(format!("c{i}"), parse_type(name)?, true)))
        .collect::<Result<Vec<_>, SpillwayError>>()?;
    Ok(Arc::new(Schema::new(fields)))
}

fn parse_type(name: &str) -> Result<DataType, SpillwayError> {
    Ok(match name.to_ascii_lowercase().as_str() {
        "boolean" | "bool" => DataType::Boolean,
        "int8" => DataType::Int8,
        "int16" => DataType::Int16,
        "int32" => DataType::Int32,
        "int64" => DataType::Int64,
        "uint8" => DataType::UInt8,
        "uint16" => DataType::UInt16,
        "uint32" => DataType::UInt32,
        "uint64" => DataType::UInt64,
        "float32" => DataType::Float32,
        "float64" => DataType::Float64,
        "date32" => DataType::Date32,
        "date64" => DataType::Date64,
        "timestamp_us" => DataType::Timestamp(TimeUnit::Microsecond, None),
        "utf8" | "string" => DataType::Utf8,
        "large_utf8" => DataType::LargeUtf8,
        "utf8_view" => DataType::Utf8View,
        "binary" => DataType::Binary,
        "large_binary" => DataType::LargeBinary,
        other => {
            return Err(SpillwayError::InvalidConfig(format!(
                "unknown column type '{other}'"
            )))
        }
    })
}
