// Rate-limited logging for frames that were read but could not be used.
use felix_wire::Frame;
use std::sync::atomic::{AtomicUsize, Ordering};

const DECODE_ERROR_LOG_LIMIT: usize = 20;
static DECODE_ERROR_LOGS: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn log_decode_error(context: &str, err: &anyhow::Error, frame: &Frame) {
    t_counter!("felix_client_decode_errors_total").increment(1);
    let count = DECODE_ERROR_LOGS.fetch_add(1, Ordering::Relaxed);
    if count >= DECODE_ERROR_LOG_LIMIT {
        return;
    }
    let preview_len = frame.payload.len().min(64);
    let preview = &frame.payload[..preview_len];
    let hex = preview
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    let printable = preview
        .iter()
        .map(|b| {
            let c = *b as char;
            if c.is_ascii_graphic() || c == ' ' {
                c
            } else {
                '.'
            }
        })
        .collect::<String>();
    tracing::warn!(
        context,
        error = %err,
        frame_len = frame.header.length,
        payload_len = frame.payload.len(),
        preview_hex = %hex,
        preview_printable = %printable,
        "felix-client decode error"
    );
}

pub(crate) fn log_oversized_frame(context: &str, length: usize, max_frame_bytes: usize) {
    t_counter!("felix_client_decode_errors_total").increment(1);
    let count = DECODE_ERROR_LOGS.fetch_add(1, Ordering::Relaxed);
    if count >= DECODE_ERROR_LOG_LIMIT {
        return;
    }
    tracing::warn!(
        context,
        frame_len = length,
        max_frame_bytes,
        "felix-client skipped oversized frame"
    );
}
