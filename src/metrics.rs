//! Engine metrics.
//!
//! Thin helpers over the metrics facade; the host process decides how and
//! whether the recorders are exported.

use metrics::counter;

/// Record a successfully parsed query.
pub fn record_query_parsed() {
    counter!("streamql.query.parsed").increment(1);
}

/// Record a query rejected at parse or validation time.
pub fn record_query_rejected() {
    counter!("streamql.query.rejected").increment(1);
}

/// Record one processed line and whether it survived filtering.
pub fn record_line_processed(kept: bool) {
    counter!("streamql.pipeline.lines").increment(1);
    if !kept {
        counter!("streamql.pipeline.lines_dropped").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_a_noop() {
        // The facade drops records when no recorder is installed.
        record_query_parsed();
        record_query_rejected();
        record_line_processed(true);
        record_line_processed(false);
    }
}
