use super::*;

fn sample_send() -> Frame {
    Frame::new(Command::Send)
        .with_header("destination", "/app/chat.sendMessage")
        .with_header("content-type", "application/json")
        .with_body(r#"{"type":"CHAT","content":"hi"}"#)
}

#[test]
fn command_parse_matches_wire_spelling() {
    for command in [
        Command::Connect,
        Command::Connected,
        Command::Send,
        Command::Subscribe,
        Command::Unsubscribe,
        Command::Message,
        Command::Error,
        Command::Disconnect,
        Command::Receipt,
    ] {
        assert_eq!(Command::parse(command.as_str()).expect("command"), command);
    }
}

#[test]
fn command_parse_rejects_unknown_verb() {
    let err = Command::parse("PUBLISH").expect_err("verb should be invalid");
    assert_eq!(err, CodecError::UnknownCommand("PUBLISH".to_owned()));
}

#[test]
fn encode_frame_adds_content_length_and_nul() {
    let text = encode_frame(&sample_send());
    assert!(text.starts_with("SEND\ndestination:/app/chat.sendMessage\n"));
    assert!(text.contains("content-length:30\n\n"));
    assert!(text.ends_with("}\0"));
}

#[test]
fn encode_frame_omits_content_length_for_empty_body() {
    let text = encode_frame(&Frame::new(Command::Disconnect));
    assert_eq!(text, "DISCONNECT\n\n\0");
}

#[test]
fn decode_frame_reads_back_encoded_send() {
    let frame = sample_send();
    let decoded = decode_frame(&encode_frame(&frame)).expect("decode should succeed");
    assert_eq!(decoded.command, Command::Send);
    assert_eq!(decoded.header("destination"), Some("/app/chat.sendMessage"));
    assert_eq!(decoded.body, frame.body);
}

#[test]
fn header_escaping_applies_outside_connect() {
    let frame = Frame::new(Command::Message).with_header("note", "a:b\nc\\d");
    let text = encode_frame(&frame);
    assert!(text.contains("note:a\\cb\\nc\\\\d\n"));

    let decoded = decode_frame(&text).expect("decode");
    assert_eq!(decoded.header("note"), Some("a:b\nc\\d"));
}

#[test]
fn connect_headers_are_not_escaped() {
    let frame = Frame::new(Command::Connect).with_header("host", "chat.example:8080");
    let text = encode_frame(&frame);
    assert!(text.contains("host:chat.example:8080\n"));

    let decoded = decode_frame(&text).expect("decode");
    assert_eq!(decoded.header("host"), Some("chat.example:8080"));
}

#[test]
fn decode_rejects_undefined_escape() {
    let err = decode_frame("MESSAGE\nbad:\\t\n\n\0").expect_err("escape should fail");
    assert!(matches!(err, CodecError::InvalidEscape(_)));
}

#[test]
fn repeated_header_first_value_wins() {
    let frame = decode_frame("MESSAGE\nfoo:first\nfoo:second\n\n\0").expect("decode");
    assert_eq!(frame.header("foo"), Some("first"));
    assert_eq!(frame.headers.len(), 2);
}

#[test]
fn decode_frames_skips_heartbeats_and_reads_several() {
    let input = "\n\r\nMESSAGE\nsubscription:sub-0\n\nhello\0\nRECEIPT\nreceipt-id:7\n\n\0\n";
    let frames = decode_frames(input).expect("decode");
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].body, "hello");
    assert_eq!(frames[1].command, Command::Receipt);
}

#[test]
fn decode_honours_content_length_with_embedded_nul() {
    let frame = decode_frame("MESSAGE\ncontent-length:3\n\na\0b\0").expect("decode");
    assert_eq!(frame.body, "a\0b");
}

#[test]
fn decode_counts_content_length_in_bytes() {
    let body = "alice님이 입장했습니다.";
    let text = encode_frame(&Frame::new(Command::Message).with_body(body));
    let frame = decode_frame(&text).expect("decode");
    assert_eq!(frame.body, body);
}

#[test]
fn decode_frame_rejects_missing_nul() {
    let err = decode_frame("MESSAGE\n\nbody").expect_err("missing nul");
    assert_eq!(err, CodecError::MissingNul);
}

#[test]
fn decode_frame_rejects_truncated_headers() {
    let err = decode_frame("MESSAGE\ndestination:/topic").expect_err("truncated");
    assert_eq!(err, CodecError::Truncated);
}

#[test]
fn decode_rejects_content_length_past_usize() {
    let input = format!("MESSAGE\ncontent-length:{}\n\nx\0", usize::MAX);
    assert_eq!(decode_frames(&input).expect_err("oversized"), CodecError::Truncated);
}

#[test]
fn decode_frame_rejects_header_without_colon() {
    let err = decode_frame("MESSAGE\nnocolon\n\n\0").expect_err("malformed");
    assert!(matches!(err, CodecError::MalformedHeader(_)));
}

#[test]
fn decode_frame_distinguishes_empty_and_multiple() {
    assert_eq!(decode_frame("\n\n").expect_err("empty"), CodecError::Empty);
    let err = decode_frame("RECEIPT\n\n\0RECEIPT\n\n\0").expect_err("two frames");
    assert_eq!(err, CodecError::TrailingFrames(2));
}

#[test]
fn is_heartbeat_only_for_bare_eols() {
    assert!(is_heartbeat("\n"));
    assert!(is_heartbeat("\r\n"));
    assert!(!is_heartbeat(""));
    assert!(!is_heartbeat("MESSAGE\n\n\0"));
}

#[test]
fn heartbeat_parse_tolerates_garbage() {
    assert_eq!(HeartBeat::parse("10000,20000"), HeartBeat::new(10000, 20000));
    assert_eq!(HeartBeat::parse(" 5 , x"), HeartBeat::new(5, 0));
    assert_eq!(HeartBeat::parse(""), HeartBeat::default());
    assert_eq!(HeartBeat::new(20000, 0).header_value(), "20000,0");
}

#[test]
fn negotiate_takes_max_when_both_sides_agree() {
    let negotiated = negotiate(HeartBeat::new(20000, 0), HeartBeat::new(10000, 25000));
    assert_eq!(negotiated.send_every, Some(Duration::from_millis(25000)));
    assert_eq!(negotiated.expect_every, None);
}

#[test]
fn negotiate_disables_direction_when_either_side_zero() {
    let negotiated = negotiate(HeartBeat::new(0, 5000), HeartBeat::new(0, 10000));
    assert_eq!(negotiated.send_every, None);
    assert_eq!(negotiated.expect_every, None);

    let negotiated = negotiate(HeartBeat::new(1000, 5000), HeartBeat::new(8000, 1000));
    assert_eq!(negotiated.send_every, Some(Duration::from_millis(1000)));
    assert_eq!(negotiated.expect_every, Some(Duration::from_millis(8000)));
}
