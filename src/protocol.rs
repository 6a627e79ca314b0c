/*!
 * Redis RESP Protocol Implementation
 *
 * This module implements the Redis Serialization Protocol (RESP) at the
 * byte boundary: splitting client input into complete argument vectors and
 * encoding replies. Command semantics live in the engine; this layer only
 * deals with framing.
 */

use anyhow::{bail, Result};
use bytes::Buf;

/// One parsed request frame: the argument vector of a single command.
///
/// `argv[0]` is the command name; all data is kept as byte vectors to
/// handle both text and binary payloads.
pub type Argv = Vec<Vec<u8>>;

/// Parse a single RESP request frame from byte data.
///
/// Expects the array-of-bulk-strings form every Redis client sends:
/// `*<count>\r\n$<len>\r\n<data>\r\n...`
///
/// # Returns
/// * `Ok(Some((consumed_bytes, argv)))` - a complete frame
/// * `Ok(None)` - incomplete data, need more bytes
/// * `Err(...)` - protocol error; the connection should be dropped
pub fn parse_one(data: &[u8]) -> Result<Option<(usize, Argv)>> {
    if data.is_empty() {
        return Ok(None);
    }

    // Request frames must be RESP arrays
    if data[0] != b'*' {
        bail!("expected array");
    }

    let (i, n) = match read_decimal_line(&data[1..])? {
        Some(x) => x,
        None => return Ok(None),
    };
    let mut cursor = 1 + i;

    if n <= 0 {
        bail!("empty array");
    }
    if n > 1024 * 1024 {
        bail!("array length too large");
    }

    let mut argv: Argv = Vec::with_capacity(n as usize);

    // Parse each array element (bulk strings)
    for _ in 0..n {
        if cursor >= data.len() {
            return Ok(None); // Need more data
        }

        if data[cursor] != b'$' {
            bail!("expected bulk string");
        }

        let (i2, len) = match read_decimal_line(&data[cursor + 1..])? {
            Some(x) => x,
            None => return Ok(None),
        };
        cursor += 1 + i2;

        if len < 0 {
            bail!("negative bulk length");
        }

        // Payload plus trailing \r\n
        let need = len as usize + 2;
        if cursor + need > data.len() {
            return Ok(None); // Need more data
        }
        if &data[cursor + len as usize..cursor + need] != b"\r\n" {
            bail!("bulk string missing CRLF");
        }

        argv.push(data[cursor..cursor + len as usize].to_vec());
        cursor += need;
    }

    Ok(Some((cursor, argv)))
}

/// Parse as many complete frames as the buffer holds.
///
/// Consumed bytes are removed from `buf`; a trailing partial frame is left
/// in place for the next read. This is what makes pipelining work.
pub fn parse_many(buf: &mut bytes::BytesMut, out: &mut Vec<Argv>) -> Result<()> {
    loop {
        let (consumed, argv) = match parse_one(&buf[..])? {
            Some(x) => x,
            None => break, // No complete frame available
        };
        buf.advance(consumed);
        out.push(argv);
    }
    Ok(())
}

/// Read a decimal number terminated by \r\n.
///
/// Returns `None` when the line is not complete yet.
fn read_decimal_line(s: &[u8]) -> Result<Option<(usize, i64)>> {
    let mut i = 0;
    let mut num: i64 = 0;
    let mut sign: i64 = 1;

    if i < s.len() && s[i] == b'-' {
        sign = -1;
        i += 1;
    }

    let start = i;
    while i < s.len() && s[i].is_ascii_digit() {
        num = num
            .checked_mul(10)
            .and_then(|n| n.checked_add((s[i] - b'0') as i64))
            .ok_or_else(|| anyhow::anyhow!("number too large"))?;
        i += 1;
    }

    if i + 1 >= s.len() {
        return Ok(None); // Incomplete line
    }
    if i == start {
        bail!("expected number");
    }
    if s[i] != b'\r' || s[i + 1] != b'\n' {
        bail!("expected CRLF");
    }
    Ok(Some((i + 2, num * sign)))
}

//
// RESP Response Encoders
//
// These functions encode replies for sending back to clients.
//

/// Encode a simple string reply (`+OK\r\n`)
pub fn resp_simple(s: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(s.len() + 3);
    v.push(b'+');
    v.extend_from_slice(s.as_bytes());
    v.extend_from_slice(b"\r\n");
    v
}

/// Encode an error reply (`-ERR <msg>\r\n`)
pub fn resp_error(msg: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(msg.len() + 8);
    v.extend_from_slice(b"-ERR ");
    v.extend_from_slice(msg.as_bytes());
    v.extend_from_slice(b"\r\n");
    v
}

/// Encode a bulk string reply (`$<len>\r\n<data>\r\n`)
pub fn resp_bulk(b: &[u8]) -> Vec<u8> {
    let len_str = b.len().to_string();
    let mut v = Vec::with_capacity(1 + len_str.len() + 2 + b.len() + 2);
    v.push(b'$');
    v.extend_from_slice(len_str.as_bytes());
    v.extend_from_slice(b"\r\n");
    v.extend_from_slice(b);
    v.extend_from_slice(b"\r\n");
    v
}

/// Encode a null reply (`$-1\r\n`)
pub fn resp_null() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

/// Encode an integer reply (`:<number>\r\n`)
pub fn resp_integer(i: i64) -> Vec<u8> {
    let i_str = i.to_string();
    let mut v = Vec::with_capacity(1 + i_str.len() + 2);
    v.push(b':');
    v.extend_from_slice(i_str.as_bytes());
    v.extend_from_slice(b"\r\n");
    v
}

/// Encode an array of pre-encoded items (`*<count>\r\n<item1><item2>...`)
pub fn resp_array(items: Vec<Vec<u8>>) -> Vec<u8> {
    let len_str = items.len().to_string();
    let mut out =
        Vec::with_capacity(1 + len_str.len() + 2 + items.iter().map(|i| i.len()).sum::<usize>());
    out.push(b'*');
    out.extend_from_slice(len_str.as_bytes());
    out.extend_from_slice(b"\r\n");
    for it in items {
        out.extend_from_slice(&it);
    }
    out
}

/// Encode an argument vector back into its request form.
///
/// Used to re-emit executed write commands, e.g. into the AOF.
pub fn encode_argv(argv: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + argv.iter().map(|a| a.len() + 16).sum::<usize>());
    out.push(b'*');
    out.extend_from_slice(argv.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    for a in argv {
        out.push(b'$');
        out.extend_from_slice(a.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(a);
        out.extend_from_slice(b"\r\n");
    }
    out
}
