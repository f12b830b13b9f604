/// Map a target `finish_reason` onto a source `stop_reason`. Unknown reasons pass through.
pub fn map_finish_reason(reason: &str) -> &str {
    match reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "content_filter" => "stop_sequence",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::map_finish_reason;

    #[test]
    fn known_reasons_are_mapped() {
        assert_eq!(map_finish_reason("stop"), "end_turn");
        assert_eq!(map_finish_reason("length"), "max_tokens");
        assert_eq!(map_finish_reason("content_filter"), "stop_sequence");
    }

    #[test]
    fn unknown_reasons_pass_through() {
        assert_eq!(map_finish_reason("foo"), "foo");
        assert_eq!(map_finish_reason("tool_calls"), "tool_calls");
        assert_eq!(map_finish_reason(""), "");
    }
}
