//! Result shaping: bound captured output and build the response.

use pane_mcp_core::{CapturedOutput, Response};

/// Keep the first `max_chars` characters of `text`.
///
/// Returns the kept text and whether anything was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => (text[..byte_index].to_string(), true),
        None => (text.to_string(), false),
    }
}

/// Build a successful response from captured output.
///
/// `truncated` is set when the output was cut here or when the capture was
/// already partial (timeout). `original_length` always counts the full
/// capture.
pub fn shape(captured: &CapturedOutput, max_output_chars: usize) -> Response {
    let (output, cut) = truncate_chars(&captured.raw_text, max_output_chars);
    Response {
        success: true,
        output,
        truncated: cut || captured.truncated,
        timed_out: captured.timed_out,
        original_length: captured.original_length,
        exit_status: captured.exit_status,
        strategy: None,
        session_id: None,
        error: None,
    }
}
