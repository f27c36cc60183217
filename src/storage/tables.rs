use redb::TableDefinition;

/// File records: digest hex -> FileRecord (msgpack)
pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

/// Pipeline output: digest hex -> OcrResult (msgpack)
pub const OCR_RESULTS: TableDefinition<&str, &[u8]> = TableDefinition::new("ocr_results");
