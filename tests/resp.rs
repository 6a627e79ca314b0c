use bytes::BytesMut;
use emberd::protocol;

#[test]
fn parse_single_frame() {
    let data = b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n";
    let (consumed, argv) = protocol::parse_one(data).unwrap().unwrap();
    assert_eq!(consumed, data.len());
    assert_eq!(argv, vec![b"SET".to_vec(), b"a".to_vec(), b"1".to_vec()]);
}

#[test]
fn parse_incomplete_frames_need_more_bytes() {
    assert!(protocol::parse_one(b"").unwrap().is_none());
    assert!(protocol::parse_one(b"*2\r\n").unwrap().is_none());
    assert!(protocol::parse_one(b"*2\r\n$3\r\nGET\r\n$1\r\n").unwrap().is_none());
    // Split mid-length-line
    assert!(protocol::parse_one(b"*12").unwrap().is_none());
}

#[test]
fn parse_many_handles_pipelining_and_keeps_partials() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
    buf.extend_from_slice(b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n");
    buf.extend_from_slice(b"*1\r\n$4\r\nPI"); // partial tail
    let mut frames = Vec::new();
    protocol::parse_many(&mut buf, &mut frames).unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], vec![b"PING".to_vec()]);
    assert_eq!(frames[1], vec![b"GET".to_vec(), b"a".to_vec()]);
    assert_eq!(&buf[..], b"*1\r\n$4\r\nPI");
}

#[test]
fn parse_rejects_malformed_input() {
    assert!(protocol::parse_one(b"PING\r\n").is_err());
    assert!(protocol::parse_one(b"*0\r\n").is_err());
    assert!(protocol::parse_one(b"*1\r\n:5\r\n").is_err());
    assert!(protocol::parse_one(b"*1\r\n$-4\r\nxx\r\n").is_err());
    // Payload not terminated by CRLF
    assert!(protocol::parse_one(b"*1\r\n$2\r\nabXY").is_err());
}

#[test]
fn encoders_produce_wire_format() {
    assert_eq!(protocol::resp_simple("OK"), b"+OK\r\n");
    assert_eq!(protocol::resp_error("boom"), b"-ERR boom\r\n");
    assert_eq!(protocol::resp_integer(-7), b":-7\r\n");
    assert_eq!(protocol::resp_null(), b"$-1\r\n");
    assert_eq!(protocol::resp_bulk(b"ab"), b"$2\r\nab\r\n");
    assert_eq!(
        protocol::resp_array(vec![protocol::resp_bulk(b"a"), protocol::resp_null()]),
        b"*2\r\n$1\r\na\r\n$-1\r\n"
    );
}

#[test]
fn encode_argv_round_trips_through_the_parser() {
    let argv = vec![b"SET".to_vec(), b"key".to_vec(), b"value".to_vec()];
    let wire = protocol::encode_argv(&argv);
    let (consumed, parsed) = protocol::parse_one(&wire).unwrap().unwrap();
    assert_eq!(consumed, wire.len());
    assert_eq!(parsed, argv);
}
