// SPDX-License-Identifier: Apache-2.0

use super::*;
use tokio::io::BufReader;

#[tokio::test]
async fn write_then_read_line_roundtrips() {
    let mut buf: Vec<u8> = Vec::new();
    write_line(&mut buf, &serde_json::json!({"a": 1})).await.unwrap();
    assert_eq!(buf, b"{\"a\":1}\n".to_vec());

    let mut reader = BufReader::new(buf.as_slice());
    let line = read_line(&mut reader).await.unwrap().unwrap();
    assert_eq!(line, "{\"a\":1}");
}

#[tokio::test]
async fn read_line_returns_none_at_eof() {
    let mut reader = BufReader::new(&b""[..]);
    assert_eq!(read_line(&mut reader).await.unwrap(), None);
}

#[tokio::test]
async fn read_line_strips_trailing_newline_only() {
    let mut reader = BufReader::new(&b"hello\n"[..]);
    let line = read_line(&mut reader).await.unwrap().unwrap();
    assert_eq!(line, "hello");
}
