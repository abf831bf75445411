// SPDX-License-Identifier: Apache-2.0

//! Line framing for the control channel (spec.md §4.1: "each line is one
//! JSON object terminated by a newline"). Ported from the teacher's
//! length-prefixed `read_message`/`write_message` helpers
//! (`oj-wire::wire`), swapping the 4-byte length prefix for a newline
//! delimiter since that's what the control protocol actually uses.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
}

/// Read one newline-terminated line, returning `Ok(None)` at EOF.
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>, FramingError> {
    let mut buf = String::new();
    let n = reader.read_line(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    while buf.ends_with('\n') || buf.ends_with('\r') {
        buf.pop();
    }
    Ok(Some(buf))
}

/// Serialize `value` to JSON and write it followed by a newline.
pub async fn write_line<W: AsyncWrite + Unpin, T: serde::Serialize>(
    writer: &mut W,
    value: &T,
) -> Result<(), FramingError> {
    let mut line = serde_json::to_vec(value).map_err(|e| {
        FramingError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
#[path = "framing_tests.rs"]
mod tests;
