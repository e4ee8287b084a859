pub const EVENTS_PROCESSED: &str = "events_processed_total";
pub const EVENTS_PER_SECOND: &str = "events_processed_per_second";
pub const DEAD_LETTER_ENTRIES: &str = "dlq_entries_total";
pub const STORE_OPERATION_DURATION: &str = "db_operation_duration_seconds";
pub const CONSUME_DURATION: &str = "kafka_consume_duration_seconds";
pub const PRODUCE_DURATION: &str = "kafka_produce_duration_seconds";
